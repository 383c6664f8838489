use crate::{
    cli::args::{
        CheckpointListArgs, CheckpointPruneArgs, CheckpointsArgs, CheckpointsCommand,
        RenderArgs, RenderFormat, ReportFormat, RunArgs, ValidateArgs,
    },
    core::{
        config::{parse_duration, CONFIG_FILE_NAME},
        workflow_graph::{
            checkpoint::CheckpointStore,
            dot::{graph_to_dot, graph_to_mermaid, unreachable_nodes},
            engine::Engine,
            executor::{ExecutionOutcome, ExecutionReport, Services},
            node::NodeResult,
            schema::{load_graph, LoadedGraph},
            secrets::EnvSecrets,
            state::{redact_value, ExecutionState},
            storage::FileBackend,
            value::StateValue,
            CallableRegistry,
        },
        ConfigLoader, EngineConfig,
    },
    Result,
};
use anyhow::{anyhow, Context};
use std::fmt::Write as _;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

pub async fn run(args: RunArgs) -> Result<()> {
    let mut config = load_config(args.config.as_deref())?;
    if let Some(dir) = &args.checkpoint_dir {
        config.checkpoint.enabled = true;
        config.checkpoint.directory = Some(dir.clone());
    }

    let loaded = load_checked(&args.file)?;
    tracing::info!(graph = %loaded.graph.name(), file = %args.file.display(), "starting run");

    let services = Services::default().with_secrets(Arc::new(EnvSecrets::default()));
    let engine = Engine::from_config(&config, services)?;
    let scheduler = engine.scheduler(loaded.graph.clone());
    let options = loaded.run_options(scheduler.options().clone())?;
    let scheduler = scheduler.with_options(options);

    let execution_id = args
        .execution_id
        .clone()
        .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());

    let printer = args.events.then(|| {
        let mut subscription = engine.events().subscribe_execution(execution_id.clone());
        tokio::spawn(async move {
            while let Some(event) = subscription.recv().await {
                match serde_json::to_string(&event) {
                    Ok(line) => println!("{}", line),
                    Err(err) => tracing::warn!("failed to encode event: {}", err),
                }
                if event.kind.is_terminal() {
                    break;
                }
            }
        })
    });

    let cancel = CancellationToken::new();
    let ctrl_c = {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::warn!("interrupt received, cancelling run");
                cancel.cancel();
            }
        })
    };

    let report = if args.resume {
        let store = engine
            .services()
            .checkpoints
            .clone()
            .ok_or_else(|| anyhow!("--resume needs checkpoints; pass --checkpoint-dir"))?;
        let handle = store
            .latest(&execution_id)
            .await?
            .ok_or_else(|| anyhow!("no checkpoint stored for execution {}", execution_id))?;
        tracing::info!(checkpoint = %handle, "resuming from checkpoint");
        scheduler.resume(&handle, cancel).await?
    } else {
        let state = ExecutionState::with_variables(
            execution_id.clone(),
            seed_variables(&loaded, &args.vars)?,
        );
        scheduler.run(state, cancel).await
    };
    ctrl_c.abort();
    if let Some(printer) = printer {
        let _ = printer.await;
    }

    print_report(&report, args.format, &config.events.redact_keys)?;
    match &report.outcome {
        ExecutionOutcome::Completed { .. } => Ok(()),
        ExecutionOutcome::Failed { error, .. } => Err(anyhow!("run failed: {}", error)),
        ExecutionOutcome::Cancelled { .. } => Err(anyhow!("run cancelled")),
    }
}

pub async fn validate(args: ValidateArgs) -> Result<()> {
    let loaded = load_checked(&args.file)?;
    let graph = &loaded.graph;
    println!(
        "Graph '{}' is valid: {} nodes, {} edges, start '{}'",
        graph.name(),
        graph.node_count(),
        graph.edges().len(),
        graph.start()
    );
    let unreachable = unreachable_nodes(graph);
    if !unreachable.is_empty() {
        println!("Unreachable from start: {}", unreachable.join(", "));
    }
    Ok(())
}

pub async fn render(args: RenderArgs) -> Result<()> {
    let loaded = load_graph(&args.file)?;
    let text = match args.format {
        RenderFormat::Dot => graph_to_dot(&loaded.graph),
        RenderFormat::Mermaid => graph_to_mermaid(&loaded.graph),
    };
    match &args.output {
        Some(path) => {
            std::fs::write(path, text)
                .with_context(|| format!("failed to write {}", path.display()))?;
            tracing::info!(output = %path.display(), "graph rendered");
        }
        None => print!("{}", text),
    }
    Ok(())
}

pub async fn checkpoints(args: CheckpointsArgs) -> Result<()> {
    match args.command {
        CheckpointsCommand::List(list) => list_checkpoints(list).await,
        CheckpointsCommand::Prune(prune) => prune_checkpoints(prune).await,
    }
}

async fn list_checkpoints(args: CheckpointListArgs) -> Result<()> {
    let config = load_config(args.config.as_deref())?;
    let store = open_store(args.dir, &config)?;
    let executions = match args.execution_id {
        Some(id) => vec![id],
        None => store.executions().await?,
    };
    if executions.is_empty() {
        println!("No checkpoints stored");
        return Ok(());
    }
    for execution_id in executions {
        let entries = store.list(&execution_id).await?;
        println!("Execution {} ({} checkpoints)", execution_id, entries.len());
        for info in entries {
            println!(
                "  #{:<6} node={} size={}B created={}{}",
                info.handle.sequence,
                info.node_id,
                info.size_bytes,
                info.created_at.to_rfc3339(),
                if info.critical { " critical" } else { "" }
            );
        }
    }
    Ok(())
}

async fn prune_checkpoints(args: CheckpointPruneArgs) -> Result<()> {
    let config = load_config(args.config.as_deref())?;
    let mut policy = config.retention_policy()?;
    if let Some(max_count) = args.max_count {
        policy.max_count = Some(max_count);
    }
    if let Some(max_age) = &args.max_age {
        policy.max_age = Some(parse_duration("--max-age", max_age)?);
    }
    let store = open_store(args.dir, &config)?;
    let report = store.prune_all(&policy).await?;
    println!(
        "Removed {} checkpoints, kept {}",
        report.removed.len(),
        report.kept
    );
    Ok(())
}

fn load_config(path: Option<&Path>) -> Result<EngineConfig> {
    let config = match path {
        Some(path) => {
            if !path.exists() {
                return Err(anyhow!("config file {} not found", path.display()));
            }
            ConfigLoader::load(Some(path))?
        }
        None => ConfigLoader::load(Some(Path::new(CONFIG_FILE_NAME)))?,
    };
    Ok(config)
}

fn load_checked(file: &Path) -> Result<LoadedGraph> {
    let loaded = load_graph(file)?;
    loaded.check_callables(&CallableRegistry::with_builtins())?;
    Ok(loaded)
}

fn open_store(dir: Option<PathBuf>, config: &EngineConfig) -> Result<CheckpointStore> {
    let dir = dir
        .or_else(|| config.checkpoint.directory.clone())
        .ok_or_else(|| anyhow!("no checkpoint directory; pass --dir or set checkpoint.directory"))?;
    Ok(CheckpointStore::new(Arc::new(FileBackend::new(dir))))
}

/// Document variables first, then `--var` overrides in order.
fn seed_variables(loaded: &LoadedGraph, vars: &[String]) -> Result<Vec<(String, StateValue)>> {
    let mut variables = loaded.variables.clone();
    for raw in vars {
        let (name, value) = parse_var(raw)?;
        variables.retain(|(existing, _)| existing != &name);
        variables.push((name, value));
    }
    Ok(variables)
}

fn parse_var(raw: &str) -> Result<(String, StateValue)> {
    let (name, value) = raw
        .split_once('=')
        .ok_or_else(|| anyhow!("--var expects KEY=VALUE, got '{}'", raw))?;
    let name = name.trim();
    if name.is_empty() {
        return Err(anyhow!("--var '{}' has an empty key", raw));
    }
    let value = match serde_json::from_str::<serde_json::Value>(value) {
        Ok(json) => StateValue::from_json(&json),
        Err(_) => StateValue::String(value.to_string()),
    };
    Ok((name.to_string(), value))
}

fn print_report(report: &ExecutionReport, format: ReportFormat, redact_keys: &[String]) -> Result<()> {
    print!("{}", render_report(report, format, redact_keys)?);
    Ok(())
}

/// Copy of the report with sensitive variables masked in every state it carries.
fn redacted_report(report: &ExecutionReport, redact_keys: &[String]) -> ExecutionReport {
    let mut shown = report.clone();
    shown.final_state.variables = report.final_state.redacted(redact_keys);
    if let ExecutionOutcome::Completed { output, .. } = &mut shown.outcome {
        redact_value(output, redact_keys);
    }
    for step in &mut shown.history {
        step.pre.variables = step.pre.redacted(redact_keys);
        step.post.variables = step.post.redacted(redact_keys);
        if let Some(NodeResult::Output(output)) = &mut step.result {
            redact_value(output, redact_keys);
        }
    }
    shown
}

fn render_report(report: &ExecutionReport, format: ReportFormat, redact_keys: &[String]) -> Result<String> {
    let report = redacted_report(report, redact_keys);
    let mut out = String::new();
    match format {
        ReportFormat::Json => {
            writeln!(out, "{}", serde_json::to_string_pretty(&report)?)?;
        }
        ReportFormat::Text => {
            writeln!(out, "Execution {} ({})", report.execution_id, report.graph)?;
            match &report.outcome {
                ExecutionOutcome::Completed { node_id, output } => {
                    writeln!(out, "Status: completed at '{}'", node_id)?;
                    writeln!(out, "Output: {}", output.to_json())?;
                }
                ExecutionOutcome::Failed { error, .. } => {
                    writeln!(out, "Status: failed")?;
                    writeln!(out, "Error: {}", error)?;
                }
                ExecutionOutcome::Cancelled { node_id } => {
                    writeln!(
                        out,
                        "Status: cancelled{}",
                        node_id
                            .as_deref()
                            .map(|id| format!(" before '{}'", id))
                            .unwrap_or_default()
                    )?;
                }
            }
            writeln!(out, "Path: {}", report.path.join(" -> "))?;
            writeln!(out, "Steps: {}", report.total_steps)?;
            writeln!(out, "Duration: {}ms", report.duration_ms)?;
            if !report.checkpoints.is_empty() {
                writeln!(out, "Checkpoints: {}", report.checkpoints.len())?;
            }
            writeln!(out, "Variables:")?;
            for (name, value) in &report.final_state.variables {
                writeln!(out, "  {} = {}", name, value.to_json())?;
            }
        }
    }
    Ok(out)
}
