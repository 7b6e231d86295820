use crate::config::PipelineMode;
use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(
    name = "anomaly-sidecar",
    version,
    about = "RF/vacuum telemetry transition and fault detection"
)]
pub struct Cli {
    /// Run a single cycle and exit.
    #[arg(long, global = true, default_value_t = false)]
    pub once: bool,
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Poll RF channels and report power transitions.
    Transitions,
    /// Poll channel groups and report density-clustering outliers.
    Faults,
    /// Analyse exported recordings offline and print a JSON report per recording.
    Analyze(AnalyzeArgs),
}

#[derive(Args, Debug)]
pub struct AnalyzeArgs {
    /// Directory holding one sub-directory per recording.
    pub dir: PathBuf,
    /// Rows per sliding slope window.
    #[arg(long)]
    pub window_rows: Option<usize>,
}

impl Commands {
    pub fn mode(&self) -> PipelineMode {
        match self {
            Self::Transitions => PipelineMode::Transitions,
            Self::Faults => PipelineMode::Faults,
            Self::Analyze(_) => PipelineMode::Analyze,
        }
    }
}
