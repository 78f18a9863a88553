use std::collections::BTreeMap;

use anyhow::Result;

use super::pattern::{FramePattern, FrameSelection, View};
use super::StudyError;
use crate::store::{Column, Query, SelectedRow, TagValue};

/// (0010,0040) Patient's Sex, CS: `M`, `F` or `O`.
pub const PATIENT_SEX: u32 = 0x0010_0040;
/// (0010,1010) Patient's Age, AS: `nnnD`, `nnnW`, `nnnM` or `nnnY`.
pub const PATIENT_AGE: u32 = 0x0010_1010;

const WEEKS_PER_YEAR: f64 = 52.0;

/// Convert a DICOM age string to weeks.
pub fn age_in_weeks(age: &str) -> Result<f64, StudyError> {
    let age = age.trim();
    let unit = age
        .chars()
        .last()
        .ok_or_else(|| StudyError::MalformedAge(age.to_string()))?;
    let digits = &age[..age.len() - unit.len_utf8()];
    if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return Err(StudyError::MalformedAge(age.to_string()));
    }
    let count: f64 = digits
        .parse::<u32>()
        .map_err(|_| StudyError::MalformedAge(age.to_string()))?
        .into();

    match unit {
        'Y' => Ok(count * WEEKS_PER_YEAR),
        'M' => Ok(count * WEEKS_PER_YEAR / 12.0),
        'W' => Ok(count),
        'D' => Ok(count / 7.0),
        other => Err(StudyError::UnsupportedAgeUnit(other)),
    }
}

/// `[sex, age in weeks]` with sex encoded as 1 for `M`, 0 otherwise.
pub fn demographic_features(row: &SelectedRow) -> Result<[f64; 2], StudyError> {
    let sex = match row.tag(PATIENT_SEX) {
        Some(TagValue::Text(s)) if s.trim() == "M" => 1.0,
        Some(_) => 0.0,
        None => return Err(StudyError::MissingTag("Patient's Sex")),
    };
    let age = match row.tag(PATIENT_AGE) {
        Some(TagValue::Text(s)) => age_in_weeks(s)?,
        Some(other) => return Err(StudyError::MalformedAge(other.to_string())),
        None => return Err(StudyError::MissingTag("Patient's Age")),
    };
    Ok([sex, age])
}

/// Collects one demographic feature vector per study.
#[derive(Debug)]
pub struct DemographicsAccumulator {
    pattern: FramePattern,
    studies: BTreeMap<u32, [f64; 2]>,
}

impl DemographicsAccumulator {
    pub fn new(view: View) -> Result<Self> {
        Ok(Self {
            pattern: FramePattern::new(view, FrameSelection::First)?,
            studies: BTreeMap::new(),
        })
    }

    pub fn query(&self) -> Query {
        Query::new([Column::Path, Column::Tag(PATIENT_SEX), Column::Tag(PATIENT_AGE)])
            .filter(Column::Path, self.pattern.predicate())
    }

    pub fn ingest(&mut self, row: &SelectedRow) -> Result<()> {
        let path = row.path()?;
        let key = self
            .pattern
            .locate(path)
            .ok_or_else(|| StudyError::UnrecognizedPath(path.to_string()))?;
        let features = demographic_features(row)?;
        self.studies.insert(key.study, features);
        Ok(())
    }

    pub fn finish(self) -> BTreeMap<u32, [f64; 2]> {
        self.studies
    }
}
