pub mod args;
pub mod commands;

pub use args::{CheckpointsArgs, RenderArgs, RunArgs, ValidateArgs};
use clap::{Parser, Subcommand};

const HELP_TEMPLATE: &str = "\
{name} {version}\n\
{about-with-newline}\n\
USAGE:\n    {usage}\n\
\nOPTIONS:\n{options}\n\
GRAPH COMMANDS:\n{subcommands}\n";

#[derive(Parser)]
#[command(name = "graphflow")]
#[command(version = crate::VERSION)]
#[command(about = "Directed-graph workflow executor with checkpoints, debugging and replay")]
#[command(help_template = HELP_TEMPLATE)]
#[command(
    after_long_help = "Typical flow: validate a graph document, render it to check the shape, then run it."
)]
pub struct Args {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand)]
pub enum Command {
    #[command(
        about = "Execute a graph document",
        long_about = "Run loads a graph document, seeds its variables and executes it to completion, failure or cancellation (Ctrl-C).",
        after_help = "Example:\n    graphflow run review.yaml --var score=90 --events"
    )]
    Run(RunArgs),
    #[command(
        about = "Check a graph document without running it",
        long_about = "Validate parses the document, builds the graph and checks that every function node names a known callable.",
        after_help = "Example:\n    graphflow validate review.yaml"
    )]
    Validate(ValidateArgs),
    #[command(
        about = "Render a graph as DOT or Mermaid",
        long_about = "Render prints the graph structure, with edge kinds and conditions as labels.",
        after_help = "Example:\n    graphflow render review.yaml --format mermaid"
    )]
    Render(RenderArgs),
    #[command(
        about = "Inspect or prune stored checkpoints",
        long_about = "Checkpoints lists saved run snapshots in a checkpoint directory and applies retention limits.",
        after_help = "Examples:\n    graphflow checkpoints list --dir .graphflow/checkpoints\n    graphflow checkpoints prune --max-count 5"
    )]
    Checkpoints(CheckpointsArgs),
}

pub async fn run(args: Args) -> crate::Result<()> {
    match args.command {
        Command::Run(run_args) => commands::run(run_args).await,
        Command::Validate(validate_args) => commands::validate(validate_args).await,
        Command::Render(render_args) => commands::render(render_args).await,
        Command::Checkpoints(checkpoint_args) => commands::checkpoints(checkpoint_args).await,
    }
}
