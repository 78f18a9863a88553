//! Store → study accumulation → cross-validation → submission, on a small
//! synthetic data set.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use approx::assert_abs_diff_eq;
use ndarray::Axis;
use tempfile::TempDir;

use systole::store::{self, ColumnFileWriter, FrameRecord, PixelType, TagValue};
use systole::study::{
    read_labels, DemographicsAccumulator, FrameAccumulator, FrameSelection, MetadataAccumulator, View,
    PATIENT_AGE, PATIENT_SEX,
};
use systole::submission::{PredictionSource, Submission, VOLUME_BINS};
use systole::train::{
    cross_validate_dense, cross_validate_trees, predict_unlabelled, write_predictions, BoostConfig, Dataset,
    DenseConfig,
};

const STUDIES: u32 = 20;
const LABELLED: u32 = 16;
const FRAMES: usize = 4;
const SIDE: u32 = 8;

fn is_male(study: u32) -> bool {
    study % 2 == 0
}

fn pixels(study: u32, frame: usize) -> Vec<u8> {
    (0..SIDE * SIDE)
        .map(|i| (1_000 + study * 100 + frame as u32 * 50 + (i * 37) % 200) as u16)
        .flat_map(u16::to_le_bytes)
        .collect()
}

fn record(study: u32, view: View, frame: usize) -> FrameRecord {
    let mut tags = BTreeMap::new();
    tags.insert(PATIENT_SEX, TagValue::Text(if is_male(study) { "M" } else { "F" }.into()));
    tags.insert(PATIENT_AGE, TagValue::Text(format!("{:03}Y", 30 + study)));
    FrameRecord {
        path: format!(
            "train/{study}/study/{}_7/IM-0007-{:04}.dcm",
            view.prefix(),
            frame + 1
        ),
        dtype: PixelType::U16,
        width: SIDE,
        height: SIDE,
        pixels: pixels(study, frame),
        tags,
    }
}

fn build_store(dir: &TempDir) -> PathBuf {
    let path = dir.path().join("frames.parquet");
    let mut writer = ColumnFileWriter::append(&path).unwrap();
    writer.set_flush_interval(25);
    for study in 1..=STUDIES {
        for view in [View::TwoChamber, View::FourChamber] {
            for frame in 0..FRAMES {
                writer.add_row(record(study, view, frame)).unwrap();
            }
        }
    }
    assert_eq!(writer.finish().unwrap(), (STUDIES as usize) * 2 * FRAMES);
    path
}

fn write_labels(dir: &TempDir) -> PathBuf {
    let path = dir.path().join("train.csv");
    let mut text = String::from("Id,Diastole,Systole\n");
    for study in 1..=LABELLED {
        let (d, s) = if is_male(study) { (180.0, 80.0) } else { (120.0, 50.0) };
        text.push_str(&format!("{study},{d},{s}\n"));
    }
    fs::write(&path, text).unwrap();
    path
}

fn frames(store: &Path, selection: FrameSelection) -> BTreeMap<u32, ndarray::Array3<f32>> {
    let mut accumulator = FrameAccumulator::new(View::FourChamber, selection, 4, FRAMES).unwrap();
    let query = accumulator.query();
    let matched = store::select(store, &query, |row| accumulator.ingest(&row)).unwrap();
    let expected = match selection {
        FrameSelection::First => STUDIES as usize,
        FrameSelection::Stack => STUDIES as usize * FRAMES,
    };
    assert_eq!(matched, expected);
    accumulator.finish().unwrap()
}

#[test]
fn first_frames_are_standardized_per_study() {
    let dir = TempDir::new().unwrap();
    let store = build_store(&dir);

    let stacks = frames(&store, FrameSelection::First);
    assert_eq!(stacks.len(), STUDIES as usize);
    for stack in stacks.values() {
        assert_eq!(stack.dim(), (1, 4, 4));
        let mean = stack.mean().unwrap();
        let var = stack.mapv(|v| (v - mean).powi(2)).mean().unwrap();
        assert_abs_diff_eq!(mean, 0.0, epsilon = 1e-4);
        assert_abs_diff_eq!(var, 1.0, epsilon = 1e-3);
    }
}

#[test]
fn stacks_hold_every_frame_in_time_order() {
    let dir = TempDir::new().unwrap();
    let store = build_store(&dir);

    let stacks = frames(&store, FrameSelection::Stack);
    let stack = &stacks[&3];
    assert_eq!(stack.dim(), (FRAMES, 4, 4));
    // Frames brighten over time; after removing the temporal mean the
    // first frame sits below it and the last above.
    let per_frame = stack.mean_axis(Axis(1)).unwrap().mean_axis(Axis(1)).unwrap();
    assert!(per_frame[0] < per_frame[FRAMES - 1]);
}

#[test]
fn dense_cross_validation_over_stacks() {
    let dir = TempDir::new().unwrap();
    let store = build_store(&dir);
    let labels = read_labels(&write_labels(&dir)).unwrap();

    let stacks = frames(&store, FrameSelection::Stack);
    let dataset = Dataset::from_stacks(&stacks, &labels).unwrap();
    assert_eq!(dataset.len(), LABELLED as usize);
    assert_eq!(dataset.features.ncols(), FRAMES * 16);

    let config = DenseConfig {
        iterations: 10,
        ..DenseConfig::frame_stack()
    };
    let cv = cross_validate_dense(&dataset, &config, 4, 1234).unwrap();
    assert_eq!(cv.folds.len(), 4);
    assert!(cv.folds.iter().all(|f| f.size == 4));
    let (mean, stddev) = cv.validation_summary();
    assert!(mean.is_finite() && stddev.is_finite());
}

#[test]
fn trees_predictions_feed_the_submission() {
    let dir = TempDir::new().unwrap();
    let store = build_store(&dir);
    let labels = read_labels(&write_labels(&dir)).unwrap();

    let mut accumulator = DemographicsAccumulator::new(View::TwoChamber).unwrap();
    let query = accumulator.query();
    store::select(&store, &query, |row| accumulator.ingest(&row)).unwrap();
    let features = accumulator.finish();
    assert_eq!(features.len(), STUDIES as usize);
    assert_eq!(features[&4], [1.0, 34.0 * 52.0]);

    let dataset = Dataset::from_features(&features, &labels).unwrap();
    let config = BoostConfig {
        learning_rate: 0.3,
        ..BoostConfig::default()
    };
    let cv = cross_validate_trees(&dataset, &config, 4, 1234).unwrap();
    let [diastole_std, systole_std] = cv.error_std();
    assert!(diastole_std < 1.0, "{diastole_std}");
    assert!(systole_std < 1.0, "{systole_std}");

    let predictions = predict_unlabelled(&dataset, &features, &config);
    let studies: Vec<u32> = predictions.iter().map(|(s, _)| *s).collect();
    assert_eq!(studies, (LABELLED + 1..=STUDIES).collect::<Vec<_>>());
    for (study, [diastole, _]) in &predictions {
        let expected = if is_male(*study) { 180.0 } else { 120.0 };
        assert_abs_diff_eq!(*diastole, expected, epsilon = 2.0);
    }

    let prediction_path = dir.path().join("predictions.tsv");
    write_predictions(fs::File::create(&prediction_path).unwrap(), &predictions).unwrap();

    let source: PredictionSource = format!("15,12,{}", prediction_path.display()).parse().unwrap();
    let mut submission = Submission::new();
    assert_eq!(submission.add_source(&source).unwrap(), 4);

    let mut out = Vec::new();
    submission.write(&mut out).unwrap();
    let text = String::from_utf8(out).unwrap();
    let lines: Vec<&str> = text.lines().collect();
    assert_eq!(lines.len(), 1 + 2 * 4);
    assert!(lines[1].starts_with("17_Diastole,"));
    assert!(lines[8].starts_with("20_Systole,"));
    assert!(lines.iter().all(|l| l.split(',').count() == VOLUME_BINS + 1));
}

#[test]
fn metadata_export_joins_labels() {
    let dir = TempDir::new().unwrap();
    let store = build_store(&dir);
    let labels = read_labels(&write_labels(&dir)).unwrap();

    let mut accumulator = MetadataAccumulator::new(View::FourChamber).unwrap();
    let query = accumulator.query();
    let matched = store::select(&store, &query, |row| accumulator.ingest(&row)).unwrap();
    assert_eq!(matched, STUDIES as usize);

    let mut out = Vec::new();
    let written = accumulator.finish().write_joined(&labels, &mut out).unwrap();
    assert_eq!(written, STUDIES as usize);

    let text = String::from_utf8(out).unwrap();
    let lines: Vec<&str> = text.lines().collect();
    assert_eq!(lines[0], "Id,Diastole,Systole,AgeWeeks,PatientSex,PatientAge");
    assert_eq!(lines[2], "2,180,80,1664,M,032Y");
    assert_eq!(lines[STUDIES as usize], format!("{STUDIES},,,2600,M,050Y"));
}
