use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::Parser;
use serde_json::json;
use tracing::{info, warn};

use taskhub_core::config::load_dotenv;
use taskhub_core::Properties;
use taskhub_engine::LocalWorker;
use taskhub_scheduler::{Manifest, SchedulerConfig, TaskScheduler};

/// Run a task manifest on a pool of in-process engines.
///
/// Engine `i` carries the property `rank = i`. One JSON line is printed per
/// task, followed by the scheduler metrics.
#[derive(Parser, Debug)]
#[command(name = "taskhub-controller", about = "Run a TOML task manifest on local engines")]
struct Cli {
    /// Path to the task manifest
    #[arg(long, env = "TASKHUB_TASKS")]
    tasks: PathBuf,

    /// Number of engines to start
    #[arg(long, env = "TASKHUB_ENGINES", default_value_t = 2)]
    engines: usize,

    /// Scheduler config file (defaults plus TASKHUB_* overrides when absent)
    #[arg(long, env = "TASKHUB_CONFIG")]
    config: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    load_dotenv();
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    let cli = Cli::parse();
    if cli.engines == 0 {
        bail!("--engines must be at least 1");
    }

    let config = match &cli.config {
        Some(path) => SchedulerConfig::from_file(path)
            .with_context(|| format!("failed to load config {}", path.display()))?,
        None => SchedulerConfig::from_env().unwrap_or_else(|e| {
            warn!(error = %e, "invalid environment config, using defaults");
            SchedulerConfig::default()
        }),
    };

    let manifest = Manifest::from_file(&cli.tasks)
        .with_context(|| format!("failed to load manifest {}", cli.tasks.display()))?;
    let tasks = manifest.tasks().context("invalid task in manifest")?;

    let scheduler = TaskScheduler::new(config);
    for rank in 0..cli.engines {
        let properties: Properties = [("rank".to_string(), json!(rank))].into_iter().collect();
        scheduler.register(Arc::new(LocalWorker::new(format!("local-{rank}"))), properties);
    }
    info!(engines = cli.engines, tasks = tasks.len(), "running manifest");

    let mut submitted = Vec::with_capacity(tasks.len());
    for (name, task) in tasks {
        let handle = scheduler
            .run(task)
            .with_context(|| format!("failed to submit task {name}"))?;
        submitted.push((name, handle));
    }

    scheduler
        .barrier(submitted.iter().map(|(_, handle)| *handle))
        .await?;

    for (name, handle) in &submitted {
        let record = scheduler.task_status(handle.task);
        let outcome = match scheduler.get_task_result(*handle, false).await {
            Ok(reply) => json!({ "ok": reply }),
            Err(e) => json!({ "error": e.to_string(), "remote": e.remote_failure() }),
        };
        let line = json!({
            "task": name,
            "id": handle.task,
            "state": record.as_ref().map(|r| r.state),
            "attempts": record.as_ref().map(|r| r.attempts),
            "engines": record.as_ref().map(|r| r.engines.clone()),
            "outcome": outcome,
        });
        println!("{line}");
    }

    println!("{}", serde_json::to_string(&json!({ "metrics": scheduler.metrics() }))?);
    Ok(())
}
