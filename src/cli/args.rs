use clap::{Args, Subcommand, ValueEnum};
use std::path::PathBuf;

#[derive(Args, Clone)]
pub struct RunArgs {
    /// Graph document (YAML) to execute
    #[arg(value_name = "FILE")]
    pub file: PathBuf,

    /// Set an initial variable; the value is parsed as JSON and falls back to a string
    #[arg(long = "var", value_name = "KEY=VALUE")]
    pub vars: Vec<String>,

    /// Execution id (default: a fresh UUID)
    #[arg(long, value_name = "ID")]
    pub execution_id: Option<String>,

    /// Stream execution events to stdout as JSON lines
    #[arg(long, help_heading = "Output Options")]
    pub events: bool,

    /// Report format printed when the run ends
    #[arg(long, value_enum, default_value = "text", help_heading = "Output Options")]
    pub format: ReportFormat,

    /// Store checkpoints under this directory (enables checkpoints)
    #[arg(long, value_name = "DIR", help_heading = "Checkpoints")]
    pub checkpoint_dir: Option<PathBuf>,

    /// Resume the execution given by --execution-id from its latest checkpoint
    #[arg(long, requires = "execution_id", help_heading = "Checkpoints")]
    pub resume: bool,

    /// Path to config file (default: ./graphflow.toml)
    #[arg(long, value_name = "FILE", help_heading = "Configuration")]
    pub config: Option<PathBuf>,
}

#[derive(Args, Clone)]
pub struct ValidateArgs {
    /// Graph document (YAML) to check
    #[arg(value_name = "FILE")]
    pub file: PathBuf,
}

#[derive(Args, Clone)]
pub struct RenderArgs {
    /// Graph document (YAML) to render
    #[arg(value_name = "FILE")]
    pub file: PathBuf,

    /// Output syntax
    #[arg(long, value_enum, default_value = "dot")]
    pub format: RenderFormat,

    /// Write to a file instead of stdout
    #[arg(long, short, value_name = "FILE")]
    pub output: Option<PathBuf>,
}

#[derive(Args, Clone)]
pub struct CheckpointsArgs {
    #[command(subcommand)]
    pub command: CheckpointsCommand,
}

#[derive(Subcommand, Clone)]
pub enum CheckpointsCommand {
    /// List stored checkpoints
    List(CheckpointListArgs),
    /// Delete checkpoints outside the retention policy
    Prune(CheckpointPruneArgs),
}

#[derive(Args, Clone)]
pub struct CheckpointListArgs {
    /// Checkpoint directory (default: checkpoint.directory from config)
    #[arg(long, value_name = "DIR")]
    pub dir: Option<PathBuf>,

    /// Only list checkpoints of this execution
    #[arg(long, value_name = "ID")]
    pub execution_id: Option<String>,

    /// Path to config file (default: ./graphflow.toml)
    #[arg(long, value_name = "FILE")]
    pub config: Option<PathBuf>,
}

#[derive(Args, Clone)]
pub struct CheckpointPruneArgs {
    /// Checkpoint directory (default: checkpoint.directory from config)
    #[arg(long, value_name = "DIR")]
    pub dir: Option<PathBuf>,

    /// Keep at most this many checkpoints per execution
    #[arg(long, value_name = "N")]
    pub max_count: Option<usize>,

    /// Drop checkpoints older than this, e.g. 7d
    #[arg(long, value_name = "DURATION")]
    pub max_age: Option<String>,

    /// Path to config file (default: ./graphflow.toml)
    #[arg(long, value_name = "FILE")]
    pub config: Option<PathBuf>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
pub enum ReportFormat {
    Text,
    Json,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
pub enum RenderFormat {
    Dot,
    Mermaid,
}
