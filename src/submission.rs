//! Turning per-study point predictions into the cumulative-probability
//! submission table.
//!
//! Each prediction source contributes a Normal distribution per study and
//! target, centred on the predicted volume with a fixed per-target
//! standard deviation. The table holds its CDF sampled at every whole
//! millilitre from 0 to 599.

use std::collections::btree_map::Entry;
use std::collections::BTreeMap;
use std::fs::File;
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::str::FromStr;

use anyhow::{anyhow, bail, ensure, Context, Result};

/// Number of volume bins, `P0..P599`.
pub const VOLUME_BINS: usize = 600;

/// Normal CDF at volumes `0, 1, …, 599`.
pub fn cumulative_distribution(mean: f64, stddev: f64) -> [f64; VOLUME_BINS] {
    let scale = stddev * std::f64::consts::SQRT_2;
    std::array::from_fn(|volume| 0.5 * (1.0 + libm::erf((volume as f64 - mean) / scale)))
}

/// `0` below 0.001, `1` above 0.999, three decimals otherwise.
pub fn format_probability(p: f64) -> String {
    if p < 0.001 {
        "0".to_string()
    } else if p > 0.999 {
        "1".to_string()
    } else {
        format!("{p:.3}")
    }
}

// ---------------------------------------------------------------------------
// Prediction sources
// ---------------------------------------------------------------------------

/// A prediction file plus the standard deviation assumed for each target.
///
/// Written on the command line as `stddev0,stddev1,path`.
#[derive(Debug, Clone, PartialEq)]
pub struct PredictionSource {
    pub stddev: [f64; 2],
    pub path: PathBuf,
}

impl FromStr for PredictionSource {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        let mut parts = s.splitn(3, ',');
        let (Some(s0), Some(s1), Some(path)) = (parts.next(), parts.next(), parts.next()) else {
            bail!("expected 'stddev0,stddev1,path', got '{s}'");
        };

        let parse = |field: &str| -> Result<f64> {
            let value: f64 = field
                .trim()
                .parse()
                .with_context(|| format!("'{field}' is not a standard deviation"))?;
            ensure!(
                value.is_finite() && value > 0.0,
                "standard deviation must be positive, got {value}"
            );
            Ok(value)
        };

        Ok(Self {
            stddev: [parse(s0)?, parse(s1)?],
            path: PathBuf::from(path),
        })
    }
}

/// Read `study<TAB>prediction0<TAB>prediction1` lines. Blank lines are
/// skipped; extra columns are ignored.
pub fn read_predictions(path: &Path) -> Result<Vec<(u32, [f64; 2])>> {
    let file = File::open(path).with_context(|| format!("opening {}", path.display()))?;
    let mut predictions = Vec::new();

    for (line_no, line) in BufReader::new(file).lines().enumerate() {
        let line = line.with_context(|| format!("reading {}", path.display()))?;
        if line.trim().is_empty() {
            continue;
        }

        let fields: Vec<&str> = line.split('\t').map(str::trim).collect();
        if fields.len() < 3 {
            bail!(
                "{}:{}: expected 3 tab-separated fields, got {}",
                path.display(),
                line_no + 1,
                fields.len()
            );
        }
        let study: u32 = fields[0]
            .parse()
            .map_err(|_| anyhow!("{}:{}: bad study id '{}'", path.display(), line_no + 1, fields[0]))?;
        let mut values = [0.0f64; 2];
        for (value, field) in values.iter_mut().zip(&fields[1..3]) {
            *value = field
                .parse()
                .map_err(|_| anyhow!("{}:{}: bad prediction '{field}'", path.display(), line_no + 1))?;
            ensure!(
                value.is_finite(),
                "{}:{}: prediction '{field}' is not a finite volume",
                path.display(),
                line_no + 1
            );
        }
        predictions.push((study, values));
    }

    Ok(predictions)
}

// ---------------------------------------------------------------------------
// Submission
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
struct StudyCurves {
    diastole: [f64; VOLUME_BINS],
    systole: [f64; VOLUME_BINS],
}

/// Per-study CDF curves. The first source to predict a study wins; later
/// predictions for it are logged and dropped.
#[derive(Debug, Default)]
pub struct Submission {
    studies: BTreeMap<u32, StudyCurves>,
}

impl Submission {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add one prediction with the given per-target standard deviations.
    /// Returns `false` when the study already has curves.
    pub fn add(&mut self, study: u32, prediction: [f64; 2], stddev: [f64; 2]) -> bool {
        match self.studies.entry(study) {
            Entry::Occupied(_) => {
                log::warn!("study {study} is already predicted, ignoring {prediction:?}");
                false
            }
            Entry::Vacant(slot) => {
                slot.insert(StudyCurves {
                    diastole: cumulative_distribution(prediction[0], stddev[0]),
                    systole: cumulative_distribution(prediction[1], stddev[1]),
                });
                true
            }
        }
    }

    /// Read a source file and add all of its predictions.
    pub fn add_source(&mut self, source: &PredictionSource) -> Result<usize> {
        let predictions = read_predictions(&source.path)?;
        for (study, prediction) in &predictions {
            self.add(*study, *prediction, source.stddev);
        }
        log::info!(
            "{} predictions from {}",
            predictions.len(),
            source.path.display()
        );
        Ok(predictions.len())
    }

    pub fn len(&self) -> usize {
        self.studies.len()
    }

    pub fn is_empty(&self) -> bool {
        self.studies.is_empty()
    }

    /// Write the header and two rows per study, studies ascending.
    pub fn write<W: Write>(&self, out: W) -> Result<()> {
        let mut writer = csv::WriterBuilder::new().has_headers(false).from_writer(out);

        let mut header = Vec::with_capacity(VOLUME_BINS + 1);
        header.push("Id".to_string());
        header.extend((0..VOLUME_BINS).map(|i| format!("P{i}")));
        writer.write_record(&header)?;

        for (study, curves) in &self.studies {
            for (suffix, curve) in [("Diastole", &curves.diastole), ("Systole", &curves.systole)] {
                let mut record = Vec::with_capacity(VOLUME_BINS + 1);
                record.push(format!("{study}_{suffix}"));
                record.extend(curve.iter().map(|&p| format_probability(p)));
                writer.write_record(&record)?;
            }
        }

        writer.flush()?;
        Ok(())
    }
}
