//! Writes a synthetic frame store and label table for trying the pipeline
//! without the real DICOM data.
//!
//! Each study gets a 2ch and a 4ch series of 30 frames showing a bright
//! ellipse that contracts and relaxes over the cardiac cycle; its area
//! follows the study's diastolic and systolic volumes. Three quarters of
//! the studies are labelled.

use std::collections::BTreeMap;
use std::f64::consts::PI;
use std::path::Path;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rand_distr::{Distribution, Normal};

use systole::store::{ColumnFileWriter, FrameRecord, PixelType, TagValue};
use systole::study::{View, PATIENT_AGE, PATIENT_SEX};

const STUDIES: u32 = 40;
const FRAMES: usize = 30;
const SIDE: usize = 32;
const INSTANCE_NUMBER: u32 = 0x0020_0013;

struct Study {
    id: u32,
    diastole: f64,
    systole: f64,
    male: bool,
    age_years: u32,
}

fn frame_pixels(study: &Study, frame: usize, rng: &mut StdRng, noise: &Normal<f64>) -> Vec<u8> {
    // Squared radius tracks volume: full at diastole (frame 0), smallest mid-cycle.
    let phase = 0.5 + 0.5 * (2.0 * PI * frame as f64 / FRAMES as f64).cos();
    let volume = study.systole + (study.diastole - study.systole) * phase;
    let radius = (volume / 300.0).sqrt() * SIDE as f64 * 0.45;
    let centre = SIDE as f64 / 2.0;

    let mut bytes = Vec::with_capacity(SIDE * SIDE * 2);
    for r in 0..SIDE {
        for c in 0..SIDE {
            let dy = (r as f64 - centre) / radius;
            let dx = (c as f64 - centre) / (radius * 0.8);
            let base = if dx * dx + dy * dy <= 1.0 { 40_000.0 } else { 8_000.0 };
            let value = (base + noise.sample(rng)).clamp(0.0, 65_535.0) as u16;
            bytes.extend_from_slice(&value.to_le_bytes());
        }
    }
    bytes
}

fn main() {
    let output = Path::new("data/dicoms.parquet");
    let labels_path = Path::new("data/train.csv");
    std::fs::create_dir_all("data").expect("Failed to create data directory");
    if output.exists() {
        std::fs::remove_file(output).expect("Failed to remove previous store");
    }

    let mut rng = StdRng::seed_from_u64(42);
    let noise = Normal::new(0.0, 1_500.0).expect("valid noise distribution");

    let studies: Vec<Study> = (1..=STUDIES)
        .map(|id| {
            let diastole = rng.gen_range(90.0..240.0);
            Study {
                id,
                diastole,
                systole: diastole * rng.gen_range(0.3..0.55),
                male: rng.gen_bool(0.5),
                age_years: rng.gen_range(18..80),
            }
        })
        .collect();

    let mut writer = ColumnFileWriter::append(output).expect("Failed to open store");
    for study in &studies {
        for (series, view) in [(3u32, View::TwoChamber), (5, View::FourChamber)] {
            for frame in 0..FRAMES {
                let mut tags = BTreeMap::new();
                tags.insert(PATIENT_SEX, TagValue::Text(if study.male { "M" } else { "F" }.into()));
                tags.insert(PATIENT_AGE, TagValue::Text(format!("{:03}Y", study.age_years)));
                tags.insert(INSTANCE_NUMBER, TagValue::Integer(frame as i64 + 1));

                writer
                    .add_row(FrameRecord {
                        path: format!(
                            "train/{}/study/{}_{series}/IM-{series:04}-{:04}.dcm",
                            study.id,
                            view.prefix(),
                            frame + 1
                        ),
                        dtype: PixelType::U16,
                        width: SIDE as u32,
                        height: SIDE as u32,
                        pixels: frame_pixels(study, frame, &mut rng, &noise),
                        tags,
                    })
                    .expect("Failed to add row");
            }
        }
    }
    let rows = writer.finish().expect("Failed to finish store");

    let mut labels = csv::Writer::from_path(labels_path).expect("Failed to create label file");
    labels
        .write_record(["Id", "Diastole", "Systole"])
        .expect("Failed to write header");
    let labelled = STUDIES as usize * 3 / 4;
    for study in studies.iter().take(labelled) {
        labels
            .write_record([
                study.id.to_string(),
                format!("{:.1}", study.diastole),
                format!("{:.1}", study.systole),
            ])
            .expect("Failed to write label");
    }
    labels.flush().expect("Failed to flush label file");

    println!(
        "Wrote {rows} frames of {STUDIES} studies to {} and {labelled} labels to {}",
        output.display(),
        labels_path.display()
    );
}
