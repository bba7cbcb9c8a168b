use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use veinflow_core::cache::{self, ResultCache};
use veinflow_core::dispatch::WorkOutcome;
use veinflow_core::registry::TaskRegistry;
use veinflow_core::storage::WorkflowRepository;
use veinflow_core::types::{RunId, RunReport, RunStatus, WorkflowId};
use veinflow_core::workflow::{WorkflowDefinition, WorkflowState};

mod config;

use config::{AppState, WorkerConfig};

#[derive(Parser, Debug)]
#[command(name = "veinflow")]
#[command(about = "Workflow execution engine for node graphs", long_about = None)]
struct Args {
    /// Path to configuration file
    #[arg(short, long, default_value = "veinflow.toml", env = "VEINFLOW_CONFIG")]
    config: PathBuf,

    /// Data directory for storage
    #[arg(short, long, default_value = "./data", env = "VEINFLOW_DATA_DIR")]
    data_dir: PathBuf,

    /// Override the number of queue workers
    #[arg(long)]
    concurrency: Option<usize>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Execute a workflow definition read from a JSON file
    Run {
        file: PathBuf,

        /// Run nodes through the worker queue instead of in-process
        #[arg(long)]
        queued: bool,
    },

    /// Store a workflow definition for later runs
    Store { file: PathBuf },

    /// Execute a previously stored workflow
    RunStored {
        workflow_id: String,

        #[arg(long)]
        queued: bool,
    },

    /// Print the report of a finished run
    Show { run_id: String },

    /// Print the published status code and finished nodes of a run
    Status { run_id: String },

    /// List recorded runs
    Runs,

    /// Run a background job with JSON arguments
    Job { task_type: String, args: String },

    /// Print a value from the result cache
    Cached { key: String },

    /// List registered task types
    Tasks,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "veinflow=info,veinflow_core=info".into()),
        )
        .with_writer(std::io::stderr)
        .with_target(false)
        .with_thread_ids(true)
        .with_file(true)
        .with_line_number(true)
        .init();

    let args = Args::parse();

    tracing::debug!("Data directory: {}", args.data_dir.display());

    let mut config = WorkerConfig::load(&args.config, args.data_dir)?;
    if let Some(concurrency) = args.concurrency {
        config.engine.worker.concurrency = concurrency;
    }

    let app = AppState::new(&config)?;
    TaskRegistry::install(app.registry.clone())?;

    match args.command {
        Command::Run { file, queued } => {
            let definition = read_definition(&file)?;
            let state = WorkflowState::from_definition(&definition, RunId::new())?;
            let report = execute(&app, state, queued).await?;
            print_json(&report)?;
        }
        Command::Store { file } => {
            let definition = read_definition(&file)?;
            app.store.store_definition(&definition)?;
            tracing::info!("Stored workflow {}", definition.id);
        }
        Command::RunStored { workflow_id, queued } => {
            let state = app
                .store
                .load_workflow(&WorkflowId::new(workflow_id), RunId::new())?;
            let report = execute(&app, state, queued).await?;
            print_json(&report)?;
        }
        Command::Show { run_id } => {
            let run_id: RunId = run_id.parse().context("Invalid run id")?;
            let report = app
                .store
                .get_run(&run_id)?
                .with_context(|| format!("Run not found: {}", run_id))?;
            print_json(&report)?;
        }
        Command::Status { run_id } => {
            let run_id: RunId = run_id.parse().context("Invalid run id")?;
            let status = cache::run_status(app.cache.as_ref(), &run_id)?;
            let finished = cache::finished_nodes(app.cache.as_ref(), &run_id)?;
            print_json(&serde_json::json!({
                "status": status,
                "finished_nodes": finished,
            }))?;
        }
        Command::Runs => {
            for report in app.store.list_runs()? {
                println!(
                    "{}\t{}\t{:?}\t{}",
                    report.run_id,
                    report.workflow_id,
                    report.status,
                    report.started_at.to_rfc3339()
                );
            }
        }
        Command::Job { task_type, args } => {
            let args: serde_json::Value =
                serde_json::from_str(&args).context("Job arguments must be JSON")?;
            let dispatcher = app.start_dispatcher();
            let outcome = dispatcher
                .submit_job(&task_type, args)
                .await?
                .wait()
                .await;
            dispatcher.shutdown().await;
            app.event_log.flush_all().await?;

            match outcome? {
                WorkOutcome::Job(Some(value)) => print_json(&value)?,
                WorkOutcome::Job(None) => tracing::warn!("Job {} gave up", task_type),
                other => anyhow::bail!("Unexpected outcome for job {}: {:?}", task_type, other),
            }
        }
        Command::Cached { key } => {
            let purged = app.cache.purge_expired()?;
            tracing::debug!("Purged {} expired cache entries", purged);
            match app.cache.get(&key)? {
                Some(value) => print_json(&value)?,
                None => anyhow::bail!("No cached value for {}", key),
            }
        }
        Command::Tasks => {
            let registry = TaskRegistry::global().context("Task registry not installed")?;
            for task_type in registry.task_types() {
                println!("{}", task_type);
            }
        }
    }

    Ok(())
}

async fn execute(app: &AppState, state: WorkflowState, queued: bool) -> Result<RunReport> {
    tracing::info!("Starting run {} of workflow {}", state.run_id, state.workflow_id);

    let result = if queued {
        let dispatcher = app.start_dispatcher();
        let result = app.queued_orchestrator(dispatcher.clone()).run(state).await;
        dispatcher.shutdown().await;
        result
    } else {
        app.local_orchestrator().run(state).await
    };

    app.event_log
        .flush_all()
        .await
        .context("Failed to flush event log")?;

    let report = result?;
    if report.status != RunStatus::Completed {
        tracing::warn!(
            "Run {} finished {:?}: {} failed, {} unreachable",
            report.run_id,
            report.status,
            report.failed_nodes().len(),
            report.unreachable_nodes().len()
        );
    }
    Ok(report)
}

fn read_definition(path: &PathBuf) -> Result<WorkflowDefinition> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read workflow file {}", path.display()))?;
    serde_json::from_str(&content).context("Failed to parse workflow definition")
}

fn print_json<T: serde::Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
