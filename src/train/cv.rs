use std::collections::BTreeMap;
use std::io::Write;

use anyhow::{ensure, Result};
use ndarray::{s, Array2, Axis};

use super::boost::{BoostConfig, BoostedTrees};
use super::dense::{DenseConfig, DenseNetwork};
use super::folds::{fold_ranges, permutation};
use super::{mean_and_std, Dataset, TARGET_COUNT};

/// Losses of one fold of the dense model.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FoldReport {
    pub fold: usize,
    pub size: usize,
    pub training_loss: f64,
    pub validation_loss: f64,
}

/// Absolute-error spread of one fold of the tree model.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TreeFoldReport {
    pub fold: usize,
    pub size: usize,
    /// Standard deviation of |prediction − actual| per target.
    pub error_std: [f64; TARGET_COUNT],
}

/// Out-of-fold predictions for every row of a permuted dataset.
#[derive(Debug, Clone)]
pub struct CrossValidation<A, R> {
    pub folds: Vec<R>,
    /// Dataset in the permuted order the folds were cut from.
    pub dataset: Dataset<A>,
    /// `(studies, 2)` predictions, each made by the model that did not
    /// see the study.
    pub predictions: Array2<A>,
}

impl CrossValidation<f32, FoldReport> {
    /// Mean and standard deviation of the validation loss across folds.
    pub fn validation_summary(&self) -> (f64, f64) {
        let losses: Vec<f64> = self.folds.iter().map(|f| f.validation_loss).collect();
        mean_and_std(&losses)
    }
}

impl CrossValidation<f64, TreeFoldReport> {
    /// `|prediction − actual|` over every out-of-fold prediction, per target.
    pub fn absolute_errors(&self) -> [Vec<f64>; TARGET_COUNT] {
        std::array::from_fn(|target| {
            self.predictions
                .column(target)
                .iter()
                .zip(self.dataset.targets.column(target))
                .map(|(p, a)| (a - p).abs())
                .collect()
        })
    }

    /// Standard deviation of the absolute error over all folds, per target.
    pub fn error_std(&self) -> [f64; TARGET_COUNT] {
        self.absolute_errors().map(|errors| mean_and_std(&errors).1)
    }
}

fn check_folds(fold_count: usize, n: usize) -> Result<()> {
    ensure!(fold_count >= 2, "need at least 2 folds, got {fold_count}");
    ensure!(
        n >= fold_count,
        "{n} labelled studies cannot be split into {fold_count} folds"
    );
    Ok(())
}

// ---------------------------------------------------------------------------
// Dense network
// ---------------------------------------------------------------------------

/// Train and evaluate one dense network per fold of the seeded
/// permutation of `dataset`.
pub fn cross_validate_dense(
    dataset: &Dataset<f32>,
    config: &DenseConfig,
    fold_count: usize,
    seed: u64,
) -> Result<CrossValidation<f32, FoldReport>> {
    config.validate()?;
    check_folds(fold_count, dataset.len())?;
    let dataset = dataset.permuted(&permutation(dataset.len(), seed));
    let mut predictions = Array2::zeros((dataset.len(), TARGET_COUNT));
    let mut folds = Vec::with_capacity(fold_count);

    for (fold, range) in fold_ranges(fold_count, dataset.len()).enumerate() {
        let (train, validation) = dataset.split(range.clone());
        let network = DenseNetwork::train(
            config,
            train.features.view(),
            train.targets.view(),
            Some((validation.features.view(), validation.targets.view())),
        );

        let report = FoldReport {
            fold,
            size: range.len(),
            training_loss: network.loss(train.features.view(), train.targets.view()),
            validation_loss: network.loss(validation.features.view(), validation.targets.view()),
        };
        log::info!(
            "fold {fold} (size={}): training loss {:8.2}, validation loss {:8.2}",
            report.size,
            report.training_loss,
            report.validation_loss
        );

        predictions
            .slice_mut(s![range, ..])
            .assign(&network.predict(validation.features.view()));
        folds.push(report);
    }

    Ok(CrossValidation {
        folds,
        dataset,
        predictions,
    })
}

// ---------------------------------------------------------------------------
// Boosted trees
// ---------------------------------------------------------------------------

/// One independent regressor per target.
fn fit_targets(config: &BoostConfig, dataset: &Dataset<f64>) -> [BoostedTrees; TARGET_COUNT] {
    std::array::from_fn(|target| {
        BoostedTrees::fit(
            config,
            dataset.features.view(),
            dataset.targets.column(target),
        )
    })
}

/// Train and evaluate a pair of boosted-tree regressors per fold.
pub fn cross_validate_trees(
    dataset: &Dataset<f64>,
    config: &BoostConfig,
    fold_count: usize,
    seed: u64,
) -> Result<CrossValidation<f64, TreeFoldReport>> {
    config.validate()?;
    check_folds(fold_count, dataset.len())?;
    let dataset = dataset.permuted(&permutation(dataset.len(), seed));
    let mut predictions = Array2::zeros((dataset.len(), TARGET_COUNT));
    let mut folds = Vec::with_capacity(fold_count);

    for (fold, range) in fold_ranges(fold_count, dataset.len()).enumerate() {
        let (train, validation) = dataset.split(range.clone());
        let models = fit_targets(config, &train);

        let mut fold_predictions = predictions.slice_mut(s![range.clone(), ..]);
        for (target, model) in models.iter().enumerate() {
            fold_predictions
                .column_mut(target)
                .assign(&model.predict(validation.features.view()));
        }

        let error_std: [f64; TARGET_COUNT] = std::array::from_fn(|target| {
            let errors: Vec<f64> = fold_predictions
                .column(target)
                .iter()
                .zip(validation.targets.column(target))
                .map(|(p, a)| (a - p).abs())
                .collect();
            mean_and_std(&errors).1
        });
        log::info!(
            "fold {fold} (size={}): absolute error std {:.3} {:.3}",
            range.len(),
            error_std[0],
            error_std[1]
        );
        folds.push(TreeFoldReport {
            fold,
            size: range.len(),
            error_std,
        });
    }

    Ok(CrossValidation {
        folds,
        dataset,
        predictions,
    })
}

/// Fit on every labelled study and predict the studies in `inputs` that
/// carry no label.
pub fn predict_unlabelled(
    dataset: &Dataset<f64>,
    inputs: &BTreeMap<u32, [f64; 2]>,
    config: &BoostConfig,
) -> Vec<(u32, [f64; TARGET_COUNT])> {
    let unlabelled: Vec<(u32, [f64; 2])> = inputs
        .iter()
        .filter(|(study, _)| !dataset.studies.contains(*study))
        .map(|(study, features)| (*study, *features))
        .collect();
    if unlabelled.is_empty() {
        return Vec::new();
    }

    let models = fit_targets(config, dataset);
    let features = Array2::from_shape_fn((unlabelled.len(), 2), |(i, j)| unlabelled[i].1[j]);
    let per_target = models.map(|m| m.predict(features.view()));

    unlabelled
        .iter()
        .enumerate()
        .map(|(i, (study, _))| (*study, [per_target[0][i], per_target[1][i]]))
        .collect()
}

// ---------------------------------------------------------------------------
// Output files
// ---------------------------------------------------------------------------

/// `prediction0 prediction1 actual0 actual1`, two decimals, one study per
/// line.
pub fn write_validation<A, W>(mut out: W, predictions: &Array2<A>, targets: &Array2<A>) -> Result<()>
where
    A: Copy + Into<f64>,
    W: Write,
{
    for (p, a) in predictions.axis_iter(Axis(0)).zip(targets.axis_iter(Axis(0))) {
        writeln!(
            out,
            "{:.2} {:.2} {:.2} {:.2}",
            p[0].into(),
            p[1].into(),
            a[0].into(),
            a[1].into()
        )?;
    }
    out.flush()?;
    Ok(())
}

/// `study<TAB>prediction0<TAB>prediction1`, one study per line.
pub fn write_predictions<W: Write>(mut out: W, predictions: &[(u32, [f64; TARGET_COUNT])]) -> Result<()> {
    for (study, [p0, p1]) in predictions {
        writeln!(out, "{study}\t{p0}\t{p1}")?;
    }
    out.flush()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::study::Volumes;
    use ndarray::array;

    fn tree_dataset(n: u32) -> (Dataset<f64>, BTreeMap<u32, [f64; 2]>) {
        let mut features = BTreeMap::new();
        let mut labels = BTreeMap::new();
        for study in 1..=n {
            let sex = f64::from(study % 2);
            let age = f64::from(study * 10);
            features.insert(study, [sex, age]);
            labels.insert(
                study,
                Volumes {
                    diastole: 100.0 + 50.0 * sex,
                    systole: 40.0 + 20.0 * sex,
                },
            );
        }
        // Two studies without labels.
        features.insert(1000, [1.0, 50.0]);
        features.insert(1001, [0.0, 60.0]);
        (Dataset::from_features(&features, &labels).unwrap(), features)
    }

    #[test]
    fn every_study_gets_an_out_of_fold_prediction() {
        let (dataset, _) = tree_dataset(40);
        let config = BoostConfig {
            learning_rate: 0.3,
            ..BoostConfig::default()
        };
        let cv = cross_validate_trees(&dataset, &config, 10, 1234).unwrap();

        assert_eq!(cv.folds.len(), 10);
        assert_eq!(cv.folds.iter().map(|f| f.size).sum::<usize>(), 40);
        let mut studies = cv.dataset.studies.clone();
        studies.sort_unstable();
        assert_eq!(studies, (1..=40).collect::<Vec<_>>());

        let [diastole, systole] = cv.absolute_errors();
        assert_eq!(diastole.len(), 40);
        assert!(diastole.iter().all(|&e| e < 5.0));
        assert!(systole.iter().all(|&e| e < 5.0));
    }

    #[test]
    fn unlabelled_studies_are_predicted() {
        let (dataset, features) = tree_dataset(20);
        let config = BoostConfig {
            learning_rate: 0.3,
            ..BoostConfig::default()
        };
        let predictions = predict_unlabelled(&dataset, &features, &config);
        assert_eq!(predictions.len(), 2);
        assert_eq!(predictions[0].0, 1000);
        assert!((predictions[0].1[0] - 150.0).abs() < 1.0);
        assert!((predictions[1].1[1] - 40.0).abs() < 1.0);
    }

    #[test]
    fn dense_folds_cover_the_dataset() {
        let stacks: BTreeMap<u32, ndarray::Array3<f32>> = (1..=20)
            .map(|s| (s, ndarray::Array3::from_elem((1, 2, 2), s as f32 / 20.0)))
            .collect();
        let labels: BTreeMap<u32, Volumes> = (1..=20)
            .map(|s| (s, Volumes { diastole: f64::from(s), systole: 1.0 }))
            .collect();
        let dataset = Dataset::from_stacks(&stacks, &labels).unwrap();
        let config = DenseConfig {
            iterations: 20,
            learning_rate: 0.01,
            ..DenseConfig::single_frame()
        };

        let cv = cross_validate_dense(&dataset, &config, 5, 1234).unwrap();
        assert_eq!(cv.folds.len(), 5);
        assert!(cv.folds.iter().all(|f| f.size == 4));
        assert_eq!(cv.predictions.dim(), (20, 2));
        let (mean, std) = cv.validation_summary();
        assert!(mean.is_finite() && std.is_finite());
    }

    #[test]
    fn too_few_studies_for_the_folds() {
        let (dataset, _) = tree_dataset(3);
        assert!(cross_validate_trees(&dataset, &BoostConfig::default(), 10, 1).is_err());
        assert!(cross_validate_trees(&dataset, &BoostConfig::default(), 1, 1).is_err());
    }

    #[test]
    fn validation_lines_have_two_decimals() {
        let mut out = Vec::new();
        write_validation(&mut out, &array![[1.0f32, 2.5]], &array![[3.333f32, 4.0]]).unwrap();
        assert_eq!(String::from_utf8(out).unwrap(), "1.00 2.50 3.33 4.00\n");
    }

    #[test]
    fn prediction_lines_are_tab_separated() {
        let mut out = Vec::new();
        write_predictions(&mut out, &[(7, [120.5, 60.0])]).unwrap();
        assert_eq!(String::from_utf8(out).unwrap(), "7\t120.5\t60\n");
    }
}
