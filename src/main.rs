use clap::{Parser, Subcommand};
use env_logger::Env;

use systole::commands::{
    run_export_metadata, run_inspect, run_load, run_submit, run_train_dense, run_train_trees, DenseArgs,
    ExportArgs, InspectArgs, LoadArgs, SubmitArgs, TreesArgs,
};

#[derive(Parser)]
#[command(name = "systole", version, about = "Cardiac MRI volume estimation")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Append DICOM frames to the Parquet store
    LoadDicom(LoadArgs),
    /// Show the first rows of a store
    Inspect(InspectArgs),
    /// Cross-validate a dense network over frame pixels
    TrainDense(DenseArgs),
    /// Cross-validate boosted trees over patient sex and age
    TrainTrees(TreesArgs),
    /// Write per-study metadata joined with the labels as CSV
    ExportMetadata(ExportArgs),
    /// Turn prediction files into a submission CSV
    Submit(SubmitArgs),
}

fn main() -> anyhow::Result<()> {
    env_logger::Builder::from_env(Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();
    match &cli.command {
        Command::LoadDicom(args) => run_load(args),
        Command::Inspect(args) => run_inspect(args),
        Command::TrainDense(args) => run_train_dense(args),
        Command::TrainTrees(args) => run_train_trees(args),
        Command::ExportMetadata(args) => run_export_metadata(args),
        Command::Submit(args) => run_submit(args),
    }
}
