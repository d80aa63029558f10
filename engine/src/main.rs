use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use futures::StreamExt;
use tracing::info;

use render_engine::{Config, Engine};
use render_observability::{init_process_logging, ProcessKind};
use render_steps::DryRunExecutor;
use render_store::{FileStore, Store};
use render_types::{PlanVersion, RunId, StepName};

#[derive(Parser, Debug)]
#[command(name = "render-engine")]
#[command(about = "Render pipeline engine process wrapper")]
struct Cli {
    #[arg(long, env = "RENDER_STATE_DIR", default_value = ".render-engine")]
    state_dir: PathBuf,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Boot the engine, restore state from a prior process, block until Ctrl-C.
    Serve,
    /// Submit a PlanVersion read from a JSON file and print the resulting Run.
    Enqueue { plan_file: PathBuf },
    /// Print the current persisted state of one run.
    Status { run_id: String },
    /// Re-queue a terminal run, optionally rewinding to a named step.
    Retry {
        run_id: String,
        #[arg(long)]
        from_step: Option<String>,
    },
    /// Cancel a queued or running run.
    Cancel { run_id: String },
    /// Stream progress events for one run to stdout, one JSON object per line.
    Watch { run_id: String },
}

fn parse_run_id(raw: &str) -> anyhow::Result<RunId> {
    RunId::from_str(raw).with_context(|| format!("invalid run id: {raw}"))
}

fn parse_step(raw: &str) -> anyhow::Result<StepName> {
    StepName::from_str(raw).map_err(|_| anyhow::anyhow!("unrecognized step name: {raw}"))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let state_dir = cli.state_dir;

    let logs_dir = state_dir.join("logs");
    let (_guard, _info) =
        init_process_logging(ProcessKind::Cli, &logs_dir).context("failed to initialize logging")?;

    let config = Config::from_env();
    let store: Arc<dyn Store> = Arc::new(FileStore::new(state_dir.join("store")).await?);
    let executor = Arc::new(DryRunExecutor::new(config.dry_run.clone()));
    let engine = Engine::new(store.clone(), executor, config);

    match cli.command {
        Command::Serve => {
            engine.restore_after_restart().await?;
            engine.start().await;
            info!("render-engine serving from {}", state_dir.display());
            tokio::signal::ctrl_c()
                .await
                .context("failed to listen for ctrl-c")?;
            info!("shutdown signal received, draining active runs");
            engine.shutdown().await?;
        }
        Command::Enqueue { plan_file } => {
            let raw = tokio::fs::read_to_string(&plan_file)
                .await
                .with_context(|| format!("reading {}", plan_file.display()))?;
            let plan: PlanVersion =
                serde_json::from_str(&raw).context("parsing plan version JSON")?;
            engine.restore_after_restart().await?;
            engine.start().await;
            let run = engine.enqueue(plan).await?;
            println!("{}", serde_json::to_string_pretty(&run)?);
        }
        Command::Status { run_id } => {
            let run_id = parse_run_id(&run_id)?;
            let run = store.get_run(run_id).await?.context("run not found")?;
            println!("{}", serde_json::to_string_pretty(&run)?);
        }
        Command::Retry { run_id, from_step } => {
            let run_id = parse_run_id(&run_id)?;
            let from_step = from_step.as_deref().map(parse_step).transpose()?;
            engine.restore_after_restart().await?;
            engine.start().await;
            let run = engine.retry(run_id, from_step).await?;
            println!("{}", serde_json::to_string_pretty(&run)?);
        }
        Command::Cancel { run_id } => {
            let run_id = parse_run_id(&run_id)?;
            engine.restore_after_restart().await?;
            engine.start().await;
            engine.cancel(run_id).await?;
            println!("canceled {run_id}");
        }
        Command::Watch { run_id } => {
            let run_id = parse_run_id(&run_id)?;
            let mut stream = Box::pin(engine.subscribe(run_id).await?);
            while let Some(event) = stream.next().await {
                println!("{}", serde_json::to_string(&event)?);
            }
        }
    }

    Ok(())
}
