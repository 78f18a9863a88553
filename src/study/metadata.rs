//! Per-study metadata table: the tags of each study's first frame joined
//! with its label volumes, one CSV row per study.

use std::collections::{BTreeMap, BTreeSet};
use std::io::Write;

use anyhow::Result;

use super::demographics::{age_in_weeks, PATIENT_AGE};
use super::labels::Volumes;
use super::pattern::{FramePattern, FrameSelection, View};
use super::StudyError;
use crate::dicom::tag_keyword;
use crate::store::{Column, Query, SelectedRow, TagValue};

/// Collects the metadata of the first frame of one view per study.
#[derive(Debug)]
pub struct MetadataAccumulator {
    pattern: FramePattern,
    studies: BTreeMap<u32, BTreeMap<u32, TagValue>>,
}

impl MetadataAccumulator {
    pub fn new(view: View) -> Result<Self> {
        Ok(Self {
            pattern: FramePattern::new(view, FrameSelection::First)?,
            studies: BTreeMap::new(),
        })
    }

    pub fn query(&self) -> Query {
        Query::new([Column::Path, Column::Metadata]).filter(Column::Path, self.pattern.predicate())
    }

    /// Keep the first row seen for each study.
    pub fn ingest(&mut self, row: &SelectedRow) -> Result<()> {
        let path = row.path()?;
        let key = self
            .pattern
            .locate(path)
            .ok_or_else(|| StudyError::UnrecognizedPath(path.to_string()))?;
        if self.studies.contains_key(&key.study) {
            log::debug!("study {} already has metadata, ignoring {path}", key.study);
        } else {
            self.studies.insert(key.study, row.tags.clone());
        }
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.studies.len()
    }

    pub fn is_empty(&self) -> bool {
        self.studies.is_empty()
    }

    pub fn finish(self) -> MetadataTable {
        MetadataTable { studies: self.studies }
    }
}

/// Study metadata ready to be joined with labels.
#[derive(Debug, Default)]
pub struct MetadataTable {
    studies: BTreeMap<u32, BTreeMap<u32, TagValue>>,
}

impl MetadataTable {
    /// Write the outer join of metadata and labels as CSV, studies
    /// ascending. Returns the number of rows.
    ///
    /// Columns are `Id, Diastole, Systole, AgeWeeks` followed by every tag
    /// any study carries, named by dictionary keyword where one exists.
    /// Cells a study has no value for are left empty.
    pub fn write_joined<W: Write>(&self, labels: &BTreeMap<u32, Volumes>, out: W) -> Result<usize> {
        let tags: BTreeSet<u32> = self.studies.values().flat_map(|t| t.keys().copied()).collect();
        let mut writer = csv::Writer::from_writer(out);

        let mut header: Vec<String> = ["Id", "Diastole", "Systole", "AgeWeeks"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        header.extend(tags.iter().map(|&tag| match tag_keyword(tag) {
            Some(keyword) => keyword.to_string(),
            None => Column::Tag(tag).to_string(),
        }));
        writer.write_record(&header)?;

        let ids: BTreeSet<u32> = self.studies.keys().chain(labels.keys()).copied().collect();
        let empty = BTreeMap::new();
        for &id in &ids {
            let metadata = self.studies.get(&id).unwrap_or(&empty);
            let mut record = Vec::with_capacity(header.len());
            record.push(id.to_string());
            match labels.get(&id) {
                Some(volumes) => {
                    record.push(volumes.diastole.to_string());
                    record.push(volumes.systole.to_string());
                }
                None => record.extend([String::new(), String::new()]),
            }
            record.push(match metadata.get(&PATIENT_AGE) {
                Some(TagValue::Text(age)) => age_in_weeks(age)?.to_string(),
                Some(other) => return Err(StudyError::MalformedAge(other.to_string()).into()),
                None => String::new(),
            });
            record.extend(
                tags.iter()
                    .map(|tag| metadata.get(tag).map(TagValue::to_string).unwrap_or_default()),
            );
            writer.write_record(&record)?;
        }

        writer.flush()?;
        Ok(ids.len())
    }
}
