//! # MemoCue — reminder scheduler CLI
//!
//! Usage:
//!   memocue run                      # Acquire the lease and run the scheduler
//!   memocue status                   # Print job table as JSON
//!   memocue next <task-id>           # Show the next trigger of one task
//!   memocue trigger <task-id>        # Execute a task now
//!   memocue lease                    # Show the current lease holder
//!   memocue logs --task <id>         # Recent execution records

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use memocue_core::MemoCueConfig;
use memocue_scheduler::{
    EngineSettings, ExecutionLogBook, InstanceLease, JsonTaskStore, LogFilter, ProviderRegistry,
    SchedulerEngine, TaskExecutor,
};

#[derive(Parser)]
#[command(
    name = "memocue",
    version,
    about = "⏰ MemoCue — timezone-aware reminder scheduler"
)]
struct Cli {
    /// Config file (default: ~/.memocue/config.toml)
    #[arg(short, long, global = true)]
    config: Option<String>,

    /// Data directory, overrides the config file
    #[arg(long, global = true)]
    data_dir: Option<String>,

    /// Verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the scheduler until Ctrl-C
    Run,
    /// Print every enabled task with its next trigger (read-only)
    Status,
    /// Print the next trigger of a task
    Next { id: String },
    /// Execute a task immediately
    Trigger { id: String },
    /// Print the current lease record
    Lease,
    /// Print recent execution records
    Logs {
        /// Only records of this task
        #[arg(long)]
        task: Option<String>,
        /// Only failed deliveries
        #[arg(long)]
        failed: bool,
        #[arg(short, long, default_value = "20")]
        limit: usize,
    },
}

fn expand_path(p: &str) -> PathBuf {
    PathBuf::from(shellexpand::tilde(p).to_string())
}

/// Everything the engine needs, wired from one config.
struct Runtime {
    config: MemoCueConfig,
    store: Arc<JsonTaskStore>,
    logbook: Arc<ExecutionLogBook>,
    engine: Arc<SchedulerEngine>,
}

impl Runtime {
    fn build(config: MemoCueConfig, with_lease: bool) -> Result<Self> {
        let data_dir = config.data_path();
        let store = Arc::new(JsonTaskStore::new(&data_dir));
        let logbook = Arc::new(ExecutionLogBook::open(&data_dir, config.logs.max_records));
        let providers = Arc::new(ProviderRegistry::with_defaults(&config.push)?);

        let executor = TaskExecutor::new(store.clone(), providers, logbook.clone())
            .with_default_repeat_interval(config.scheduler.default_repeat_interval_minutes);
        let lease = (with_lease && config.lease.enabled).then(|| InstanceLease::from_config(&config));
        let engine = SchedulerEngine::new(
            EngineSettings::from_config(&config)?,
            store.clone(),
            Arc::new(executor),
            lease,
        );

        Ok(Self {
            config,
            store,
            logbook,
            engine,
        })
    }
}

fn load_config(cli: &Cli) -> Result<MemoCueConfig> {
    let mut config = match &cli.config {
        Some(path) => {
            let mut config = MemoCueConfig::load_from(&expand_path(path))?;
            config.apply_env_overrides();
            config
        }
        None => MemoCueConfig::load()?,
    };
    if let Some(dir) = &cli.data_dir {
        config.data_dir = dir.clone();
    }
    Ok(config)
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter = if cli.verbose {
        "memocue=debug,memocue_scheduler=debug,memocue_core=debug"
    } else {
        "memocue=info,memocue_scheduler=info,memocue_core=info"
    };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)))
        .with_target(false)
        .init();

    let config = load_config(&cli)?;

    match cli.command {
        Command::Run => run(config).await,
        Command::Status => {
            let rt = Runtime::build(config, false)?;
            let status = rt.engine.preview_status().await?;
            println!("{}", serde_json::to_string_pretty(&status)?);
            Ok(())
        }
        Command::Next { id } => {
            let rt = Runtime::build(config, false)?;
            let task = rt
                .store
                .find_task(&id)?
                .with_context(|| format!("task {id} not found"))?;
            let tz = rt.config.tz()?;
            match rt.engine.next_trigger_for(&task) {
                Some(next) => println!(
                    "{} ({}) → {}",
                    task.title,
                    task.schedule.kind(),
                    next.with_timezone(&tz).to_rfc3339()
                ),
                None => println!("{} ({}) → no upcoming trigger", task.title, task.schedule.kind()),
            }
            Ok(())
        }
        Command::Trigger { id } => {
            let rt = Runtime::build(config, false)?;
            let outcome = rt.engine.execute_now(&id).await?;
            match outcome.report() {
                Some(report) => println!("{}", serde_json::to_string_pretty(report)?),
                None => println!("⏳ Task {id} is already executing"),
            }
            Ok(())
        }
        Command::Lease => {
            match InstanceLease::from_config(&config).read_record() {
                Some(record) => println!("{}", serde_json::to_string_pretty(&record)?),
                None => println!("🔓 No lease holder ({})", config.lease_path().display()),
            }
            Ok(())
        }
        Command::Logs {
            task,
            failed,
            limit,
        } => {
            let logbook = ExecutionLogBook::open(&config.data_path(), config.logs.max_records);
            let records = logbook.filter(&LogFilter {
                task_id: task,
                status: failed.then_some(memocue_core::ExecutionStatus::Failed),
                limit: Some(limit),
                ..LogFilter::default()
            });
            println!("{}", serde_json::to_string_pretty(&records)?);
            Ok(())
        }
    }
}

async fn run(config: MemoCueConfig) -> Result<()> {
    let rt = Runtime::build(config, true)?;
    println!("⏰ MemoCue v{}", env!("CARGO_PKG_VERSION"));
    println!("   Data:     {}", rt.config.data_path().display());
    println!("   Timezone: {}", rt.config.timezone);

    if !rt.engine.start().await? {
        tracing::warn!("🔒 Another instance is running the scheduler, exiting");
        return Ok(());
    }

    let retention_days = rt.config.logs.retention_days;
    let mut cleanup = tokio::time::interval(Duration::from_secs(24 * 60 * 60));
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            _ = cleanup.tick() => {
                rt.logbook.clean_older_than(retention_days);
            }
        }
    }

    tracing::info!("👋 Shutting down");
    rt.engine.stop().await?;
    Ok(())
}
