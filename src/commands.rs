//! Subcommand arguments and the runs behind them.

use std::fs::File;
use std::io::{self, BufWriter};
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use clap::Args;
use walkdir::WalkDir;

use crate::config::apply_overrides;
use crate::dicom::load_dicoms;
use crate::store::{self, preview, DEFAULT_FLUSH_INTERVAL};
use crate::study::{
    read_labels, DemographicsAccumulator, FrameAccumulator, FrameSelection, MetadataAccumulator, View,
};
use crate::submission::{PredictionSource, Submission};
use crate::train::{
    cross_validate_dense, cross_validate_trees, predict_unlabelled, write_predictions, write_validation,
    BoostConfig, Dataset, DenseConfig,
};

pub const DEFAULT_STORE: &str = "data/dicoms.parquet";
pub const DEFAULT_LABELS: &str = "data/train.csv";

// ---------------------------------------------------------------------------
// Arguments
// ---------------------------------------------------------------------------

#[derive(Args, Debug)]
pub struct LoadArgs {
    /// DICOM files, or directories searched recursively for `.dcm` files
    #[arg(required = true)]
    pub inputs: Vec<PathBuf>,

    /// Store to append the decoded frames to
    #[arg(long, default_value = DEFAULT_STORE)]
    pub output_path: PathBuf,

    /// Rows buffered before a row group is written
    #[arg(long, default_value_t = DEFAULT_FLUSH_INTERVAL)]
    pub flush_interval: usize,
}

#[derive(Args, Debug)]
pub struct InspectArgs {
    #[arg(default_value = DEFAULT_STORE)]
    pub store: PathBuf,

    /// Number of rows to show
    #[arg(long, default_value_t = 10)]
    pub limit: usize,
}

/// Inputs shared by both training commands.
#[derive(Args, Debug)]
pub struct TrainingArgs {
    #[arg(long, default_value = DEFAULT_STORE)]
    pub store: PathBuf,

    /// Label CSV: study id, diastole, systole
    #[arg(long, default_value = DEFAULT_LABELS)]
    pub labels: PathBuf,

    #[arg(long, value_enum, default_value_t = View::TwoChamber)]
    pub view: View,

    #[arg(long, default_value_t = 10)]
    pub folds: usize,

    /// Seed of the fold permutation
    #[arg(long, default_value_t = 1234)]
    pub seed: u64,

    /// JSON object overriding fields of the model configuration
    #[arg(long, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Write out-of-fold predictions next to the actual volumes
    #[arg(long, value_name = "PATH")]
    pub validation_output: Option<PathBuf>,
}

#[derive(Args, Debug)]
pub struct DenseArgs {
    #[command(flatten)]
    pub common: TrainingArgs,

    #[arg(long, value_enum, default_value_t = FrameSelection::First)]
    pub frames: FrameSelection,

    /// Side of the square each frame is resized to
    #[arg(long, default_value_t = 64)]
    pub image_size: usize,

    /// Frames per study when training on stacks
    #[arg(long, default_value_t = 30)]
    pub stack_depth: usize,
}

#[derive(Args, Debug)]
pub struct TreesArgs {
    #[command(flatten)]
    pub common: TrainingArgs,

    /// Retrain on all labelled studies and predict the unlabelled ones
    #[arg(long, value_name = "PATH")]
    pub prediction_output: Option<PathBuf>,
}

#[derive(Args, Debug)]
pub struct ExportArgs {
    #[arg(long, default_value = DEFAULT_STORE)]
    pub store: PathBuf,

    /// Label CSV joined onto the metadata
    #[arg(long, default_value = DEFAULT_LABELS)]
    pub labels: PathBuf,

    /// View whose first frame supplies each study's tags
    #[arg(long, value_enum, default_value_t = View::TwoChamber)]
    pub view: View,

    /// Metadata CSV; standard output when omitted
    #[arg(long, short)]
    pub output: Option<PathBuf>,
}

#[derive(Args, Debug)]
pub struct SubmitArgs {
    /// `stddev0,stddev1,path` per prediction file
    #[arg(required = true, value_name = "SOURCE")]
    pub sources: Vec<PredictionSource>,

    /// Submission CSV; standard output when omitted
    #[arg(long, short)]
    pub output: Option<PathBuf>,
}

// ---------------------------------------------------------------------------
// Runs
// ---------------------------------------------------------------------------

/// Expand directories into the `.dcm` files below them, sorted by path.
pub fn collect_inputs(inputs: &[PathBuf]) -> Result<Vec<PathBuf>> {
    let mut files = Vec::new();
    for input in inputs {
        if !input.is_dir() {
            files.push(input.clone());
            continue;
        }
        let mut found = Vec::new();
        for entry in WalkDir::new(input) {
            let entry = entry.with_context(|| format!("walking {}", input.display()))?;
            let path = entry.path();
            if entry.file_type().is_file() && path.extension().is_some_and(|ext| ext.eq_ignore_ascii_case("dcm")) {
                found.push(path.to_path_buf());
            }
        }
        found.sort();
        log::info!("{}: {} DICOM files", input.display(), found.len());
        files.extend(found);
    }
    Ok(files)
}

pub fn run_load(args: &LoadArgs) -> Result<()> {
    let inputs = collect_inputs(&args.inputs)?;
    if inputs.is_empty() {
        bail!("no input files");
    }
    if let Some(parent) = args.output_path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent).with_context(|| format!("creating {}", parent.display()))?;
    }

    let summary = load_dicoms(&inputs, &args.output_path, args.flush_interval)?;
    println!(
        "Stored {} frames ({} skipped); {} now holds {} rows",
        summary.stored,
        summary.skipped,
        args.output_path.display(),
        summary.total_rows
    );
    Ok(())
}

pub fn run_inspect(args: &InspectArgs) -> Result<()> {
    println!("{}", preview(&args.store, args.limit)?);
    Ok(())
}

fn create_output(path: &Path) -> Result<BufWriter<File>> {
    let file = File::create(path).with_context(|| format!("creating {}", path.display()))?;
    Ok(BufWriter::new(file))
}

pub fn run_train_dense(args: &DenseArgs) -> Result<()> {
    let common = &args.common;
    let preset = match args.frames {
        FrameSelection::First => DenseConfig::single_frame(),
        FrameSelection::Stack => DenseConfig::frame_stack(),
    };
    let config: DenseConfig = apply_overrides(preset, common.config.as_deref())?;
    config.validate()?;
    log::debug!("{config:?}");

    let mut accumulator = FrameAccumulator::new(common.view, args.frames, args.image_size, args.stack_depth)?;
    let query = accumulator.query();
    let frames = store::select(&common.store, &query, |row| accumulator.ingest(&row))?;
    log::info!(
        "{frames} {} frames from {} studies",
        common.view,
        accumulator.len()
    );
    let stacks = accumulator.finish()?;

    let labels = read_labels(&common.labels)?;
    let dataset = Dataset::from_stacks(&stacks, &labels)?;
    log::info!(
        "{} labelled studies with {} inputs each",
        dataset.len(),
        dataset.features.ncols()
    );

    let cv = cross_validate_dense(&dataset, &config, common.folds, common.seed)?;
    for fold in &cv.folds {
        println!(
            "Fold {} (size={}): training loss {:.2}, validation loss {:.2}",
            fold.fold, fold.size, fold.training_loss, fold.validation_loss
        );
    }
    let (mean, stddev) = cv.validation_summary();
    println!("Aggregate validation loss: mean={mean:.2} stddev={stddev:.2}");

    if let Some(path) = &common.validation_output {
        write_validation(create_output(path)?, &cv.predictions, &cv.dataset.targets)?;
        log::info!("validation predictions written to {}", path.display());
    }
    Ok(())
}

pub fn run_train_trees(args: &TreesArgs) -> Result<()> {
    let common = &args.common;
    let config = apply_overrides(BoostConfig::default(), common.config.as_deref())?;
    config.validate()?;
    log::debug!("{config:?}");

    let mut accumulator = DemographicsAccumulator::new(common.view)?;
    let query = accumulator.query();
    let rows = store::select(&common.store, &query, |row| accumulator.ingest(&row))?;
    let features = accumulator.finish();
    log::info!("{rows} {} rows from {} studies", common.view, features.len());

    let labels = read_labels(&common.labels)?;
    let dataset = Dataset::from_features(&features, &labels)?;

    let cv = cross_validate_trees(&dataset, &config, common.folds, common.seed)?;
    for fold in &cv.folds {
        println!(
            "Fold {} (size={}): absolute error stddev {:.3} {:.3}",
            fold.fold, fold.size, fold.error_std[0], fold.error_std[1]
        );
    }
    let [stddev0, stddev1] = cv.error_std();
    println!("Standard deviation: {stddev0:.3} {stddev1:.3}");

    if let Some(path) = &common.validation_output {
        write_validation(create_output(path)?, &cv.predictions, &cv.dataset.targets)?;
        log::info!("validation predictions written to {}", path.display());
    }

    if let Some(path) = &args.prediction_output {
        let predictions = predict_unlabelled(&dataset, &features, &config);
        write_predictions(create_output(path)?, &predictions)?;
        println!(
            "Predicted {} unlabelled studies into {}",
            predictions.len(),
            path.display()
        );
    }
    Ok(())
}

pub fn run_export_metadata(args: &ExportArgs) -> Result<()> {
    let mut accumulator = MetadataAccumulator::new(args.view)?;
    let query = accumulator.query();
    let rows = store::select(&args.store, &query, |row| accumulator.ingest(&row))?;
    log::info!("{rows} {} first frames from {} studies", args.view, accumulator.len());

    let labels = read_labels(&args.labels)?;
    let table = accumulator.finish();
    let written = match &args.output {
        Some(path) => table.write_joined(&labels, create_output(path)?)?,
        None => table.write_joined(&labels, io::stdout().lock())?,
    };
    log::info!("{written} studies exported");
    Ok(())
}

pub fn run_submit(args: &SubmitArgs) -> Result<()> {
    let mut submission = Submission::new();
    for source in &args.sources {
        submission.add_source(source)?;
    }
    if submission.is_empty() {
        bail!("prediction sources hold no studies");
    }

    match &args.output {
        Some(path) => {
            submission.write(create_output(path)?)?;
            log::info!("{} studies written to {}", submission.len(), path.display());
        }
        None => submission.write(io::stdout().lock())?,
    }
    Ok(())
}
