//! Cross-validated models over per-study inputs.
//!
//! ```text
//!  study → input (pixels / demographics)      study → Volumes
//!                 │                                  │
//!                 └──────────────┬───────────────────┘
//!                                ▼
//!                     Dataset (labelled studies)
//!                                │  permutation(seed)
//!                                ▼
//!              fold k: validation = fold_range(k), train = rest
//!                                │
//!                 ┌──────────────┴──────────────┐
//!                 ▼                             ▼
//!           DenseNetwork                  BoostedTrees × 2
//! ```

pub mod boost;
pub mod cv;
pub mod dense;
pub mod folds;

pub use boost::{BoostConfig, BoostedTrees};
pub use cv::{
    cross_validate_dense, cross_validate_trees, predict_unlabelled, write_predictions, write_validation,
    CrossValidation, FoldReport, TreeFoldReport,
};
pub use dense::{DenseConfig, DenseNetwork, HiddenLayer};
pub use folds::{fold_range, permutation};

use std::collections::BTreeMap;
use std::ops::Range;

use anyhow::{bail, Result};
use ndarray::{Array2, Array3, Axis};

use crate::study::Volumes;

/// Number of regression targets: diastolic and systolic volume.
pub const TARGET_COUNT: usize = 2;

/// Labelled studies, one row per study.
#[derive(Debug, Clone, PartialEq)]
pub struct Dataset<A> {
    pub studies: Vec<u32>,
    /// `(studies, features)`
    pub features: Array2<A>,
    /// `(studies, 2)`: diastole, systole.
    pub targets: Array2<A>,
}

impl Dataset<f32> {
    /// Flatten each study's frame stack and join it with its label.
    /// Studies without a label, or labels without images, are left out.
    pub fn from_stacks(stacks: &BTreeMap<u32, Array3<f32>>, labels: &BTreeMap<u32, Volumes>) -> Result<Self> {
        let rows = labels.iter().filter_map(|(study, volumes)| {
            let stack = stacks.get(study)?;
            let targets = volumes.as_array().map(|v| v as f32);
            Some((*study, stack.iter().copied().collect::<Vec<_>>(), targets))
        });
        Self::from_rows(rows, labels.len())
    }
}

impl Dataset<f64> {
    pub fn from_features(features: &BTreeMap<u32, [f64; 2]>, labels: &BTreeMap<u32, Volumes>) -> Result<Self> {
        let rows = labels.iter().filter_map(|(study, volumes)| {
            let row = features.get(study)?;
            Some((*study, row.to_vec(), volumes.as_array()))
        });
        Self::from_rows(rows, labels.len())
    }
}

impl<A: Copy> Dataset<A> {
    fn from_rows(rows: impl Iterator<Item = (u32, Vec<A>, [A; TARGET_COUNT])>, label_count: usize) -> Result<Self> {
        let mut studies = Vec::new();
        let mut flat = Vec::new();
        let mut targets = Vec::new();
        let mut width = None;

        for (study, row, target) in rows {
            match width {
                None => width = Some(row.len()),
                Some(w) if w != row.len() => {
                    bail!("study {study} has {} inputs, expected {w}", row.len())
                }
                Some(_) => {}
            }
            studies.push(study);
            flat.extend(row);
            targets.extend(target);
        }

        let Some(width) = width else {
            bail!("no labelled study has input data");
        };
        if studies.len() < label_count {
            log::warn!(
                "{} of {label_count} labelled studies have no input data",
                label_count - studies.len()
            );
        }

        let n = studies.len();
        Ok(Self {
            studies,
            features: Array2::from_shape_vec((n, width), flat)?,
            targets: Array2::from_shape_vec((n, TARGET_COUNT), targets)?,
        })
    }

    pub fn len(&self) -> usize {
        self.studies.len()
    }

    pub fn is_empty(&self) -> bool {
        self.studies.is_empty()
    }

    /// Reorder rows: row `i` of the result is row `order[i]` of `self`.
    pub fn permuted(&self, order: &[usize]) -> Self {
        Self {
            studies: order.iter().map(|&i| self.studies[i]).collect(),
            features: self.features.select(Axis(0), order),
            targets: self.targets.select(Axis(0), order),
        }
    }

    /// Split into (training, validation), holding out `validation` rows.
    pub fn split(&self, validation: Range<usize>) -> (Self, Self) {
        let held_out: Vec<usize> = validation.clone().collect();
        let kept: Vec<usize> = (0..validation.start).chain(validation.end..self.len()).collect();
        (self.permuted(&kept), self.permuted(&held_out))
    }
}

/// Mean and population standard deviation.
pub fn mean_and_std(values: &[f64]) -> (f64, f64) {
    if values.is_empty() {
        return (f64::NAN, f64::NAN);
    }
    let n = values.len() as f64;
    let mean = values.iter().sum::<f64>() / n;
    let variance = values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / n;
    (mean, variance.sqrt())
}
