//! Cardiac MRI volume estimation: a Parquet store of DICOM frames,
//! cross-validated regressors over pixels and demographics, and the
//! cumulative-probability submission format.

pub mod commands;
pub mod config;
pub mod dicom;
pub mod store;
pub mod study;
pub mod submission;
pub mod train;
