use clap::Parser;
use graphflow::cli::{self, Args};
use graphflow::logging;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let _logging = logging::init(&args.command)?;
    cli::run(args).await
}
