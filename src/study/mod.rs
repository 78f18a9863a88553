//! Everything between the store and the models: which rows belong to
//! which study, how their pixels are decoded and normalized, and the
//! label table they are joined against.

pub mod demographics;
pub mod labels;
pub mod metadata;
pub mod pattern;
pub mod pixels;

pub use demographics::{demographic_features, DemographicsAccumulator, PATIENT_AGE, PATIENT_SEX};
pub use labels::{read_labels, Volumes};
pub use metadata::{MetadataAccumulator, MetadataTable};
pub use pattern::{FrameKey, FramePattern, FrameSelection, View};
pub use pixels::FrameAccumulator;

use thiserror::Error;

/// Malformed study data. Any of these aborts the run.
#[derive(Error, Debug, PartialEq)]
pub enum StudyError {
    #[error("pixel dtype '{0}' is not supported, expected uint16")]
    UnsupportedDtype(String),
    #[error("pixel buffer holds {found} bytes, a {width}x{height} frame needs {expected}")]
    ShortPixelBuffer {
        width: u32,
        height: u32,
        expected: usize,
        found: usize,
    },
    #[error("frame has no pixels")]
    EmptyFrame,
    #[error("study {0} has constant pixel values and cannot be standardized")]
    ZeroVariance(u32),
    #[error("study {study} frame {frame} is beyond the {capacity}-frame stack")]
    FrameOutOfRange {
        study: u32,
        frame: usize,
        capacity: usize,
    },
    #[error("path '{0}' does not identify a study frame")]
    UnrecognizedPath(String),
    #[error("age '{0}' is malformed")]
    MalformedAge(String),
    #[error("age unit '{0}' is not supported")]
    UnsupportedAgeUnit(char),
    #[error("row is missing the {0} tag")]
    MissingTag(&'static str),
}
