pub mod config;
pub mod context;
pub mod layers;

pub use context::{detect_context, ExecutionContext};
pub use layers::console::ConsoleOutput;

use crate::cli::Command;
use crate::logging::config::LoggingConfig;
use crate::logging::layers::{console, file, BoxLayer};
use crate::Result;
use anyhow::{anyhow, Context};
use std::env;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use tracing_subscriber::filter::EnvFilter;
use tracing_subscriber::prelude::*;
use tracing_subscriber::registry::Registry;

static LOGGER_INITIALIZED: AtomicBool = AtomicBool::new(false);

/// Guards that keep logging sinks active for the duration of the command.
pub struct LoggingGuard {
    _file_guard: Option<tracing_appender::non_blocking::WorkerGuard>,
    console_output: ConsoleOutput,
    log_file_path: PathBuf,
}

impl LoggingGuard {
    /// Returns the console output configuration used during initialization.
    pub fn console_output(&self) -> ConsoleOutput {
        self.console_output
    }

    /// Returns the log file path backed by the file sink.
    pub fn log_file_path(&self) -> &Path {
        &self.log_file_path
    }
}

/// Initialize the logging framework for the provided CLI command.
///
/// Filters, file and console sinks follow the precedence defaults, the
/// `[logging]` table of graphflow.toml, then environment overrides. `RUST_LOG`
/// replaces the configured level when set. Errors when invoked more than once
/// per process unless tests explicitly reset the guard.
pub fn init(command: &Command) -> Result<LoggingGuard> {
    if LOGGER_INITIALIZED
        .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
        .is_err()
    {
        return Err(anyhow!("logging already initialized"));
    }

    let context = detect_context(command);
    let workspace_root = resolve_workspace_path(command);
    let config = LoggingConfig::load(workspace_root.as_deref())?;

    let env_filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.default_level))
        .context("failed to configure tracing level")?;
    let log_file_path = file::log_file_path(&config, workspace_root.as_deref())?;

    let (file_layer, file_guard) =
        file::file_layer::<Registry>(&log_file_path, config.enable_file, config.format)?;
    let console_output = console::select_console_output(context, config.console_output);
    let console_layer = console::console_layer::<Registry>(console_output, config.format);

    let sinks: Vec<BoxLayer<Registry>> = vec![file_layer, console_layer];
    tracing_subscriber::registry()
        .with(sinks)
        .with(env_filter)
        .try_init()
        .context("failed to install tracing subscriber")?;

    Ok(LoggingGuard {
        _file_guard: file_guard,
        console_output,
        log_file_path,
    })
}

/// Directory holding the graphflow.toml the command reads, if any.
fn resolve_workspace_path(command: &Command) -> Option<PathBuf> {
    let config = match command {
        Command::Run(args) => args.config.clone(),
        Command::Checkpoints(args) => match &args.command {
            crate::cli::args::CheckpointsCommand::List(list) => list.config.clone(),
            crate::cli::args::CheckpointsCommand::Prune(prune) => prune.config.clone(),
        },
        Command::Validate(_) | Command::Render(_) => None,
    };
    match config {
        Some(path) => path.parent().map(|parent| {
            if parent.as_os_str().is_empty() {
                PathBuf::from(".")
            } else {
                parent.to_path_buf()
            }
        }),
        None => env::current_dir().ok(),
    }
}

#[cfg(test)]
/// Reset the initialization guard so tests can reconfigure logging multiple times.
pub fn reset_for_tests() {
    LOGGER_INITIALIZED.store(false, Ordering::SeqCst);
}
