//! Command-line interface.
//!
//! `run` drives a single instruction to completion and maps the terminal
//! state to an exit code; `serve` exposes the HTTP surface. Exit codes:
//! 0 success, 1 task failed, 2 misconfiguration, 130 cancelled by user.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::{Args, Parser, Subcommand};
use tracing::{error, info};

use crate::adapters::backend::{HttpSandboxProvider, UnconfiguredProvider};
use crate::adapters::store::{MemoryTaskStore, SqliteTaskStore};
use crate::adapters::tools::HttpToolInvoker;
use crate::domain::models::{RunConfig, RunRequest, Stage, TaskMode, TaskStatus};
use crate::domain::models::BackendKind;
use crate::domain::ports::{SandboxProvider, TaskStore, ToolInvoker};
use crate::services::config::{Config, StorageBackend};
use crate::services::metrics::Metrics;
use crate::services::task_manager::TaskManager;

pub const EXIT_OK: i32 = 0;
pub const EXIT_TASK_FAILED: i32 = 1;
pub const EXIT_MISCONFIGURED: i32 = 2;
pub const EXIT_CANCELLED: i32 = 130;

#[derive(Debug, Parser)]
#[command(name = "marionette", version, about = "GUI-agent task execution service")]
pub struct Cli {
    /// Path to a TOML configuration file
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Run one instruction to completion
    Run(RunArgs),
    /// Serve the HTTP surface
    Serve(ServeArgs),
}

#[derive(Debug, Args)]
pub struct RunArgs {
    /// The natural-language instruction to execute
    #[arg(long)]
    pub query: String,

    /// Device backend
    #[arg(long, default_value = "lybic")]
    pub backend: String,

    /// Step budget for the task
    #[arg(long)]
    pub max_steps: Option<u32>,

    /// Execution mode
    #[arg(long, default_value = "normal")]
    pub mode: String,

    /// Allow the action generator to hand control to a human
    #[arg(long)]
    pub enable_takeover: bool,

    /// Disable knowledge retrieval for planning
    #[arg(long)]
    pub disable_search: bool,
}

#[derive(Debug, Args)]
pub struct ServeArgs {
    /// Address to bind
    #[arg(long, default_value = "127.0.0.1:8700")]
    pub bind: SocketAddr,
}

/// Entry point called from `main`; returns the process exit code.
pub async fn run(cli: Cli, config: Config) -> i32 {
    match cli.command {
        Command::Run(args) => run_single(config, args).await,
        Command::Serve(args) => match serve(config, args).await {
            Ok(()) => EXIT_OK,
            Err(err) => {
                error!(error = %err, "server error");
                eprintln!("error: {err}");
                EXIT_MISCONFIGURED
            }
        },
    }
}

async fn build_manager(config: Config) -> anyhow::Result<TaskManager> {
    let store: Arc<dyn TaskStore> = match config.storage.backend {
        StorageBackend::Memory => Arc::new(MemoryTaskStore::new()),
        StorageBackend::Sql => {
            let url = config
                .storage
                .sql_connection_string
                .clone()
                .context("sql storage selected without a connection string")?;
            Arc::new(
                SqliteTaskStore::connect(&url)
                    .await
                    .context("failed to open task database")?,
            )
        }
    };

    let invoker: Arc<dyn ToolInvoker> = Arc::new(
        HttpToolInvoker::new(&config.tools).context("tool service is not configured")?,
    );
    let provider: Arc<dyn SandboxProvider> = if config.sandbox.api_url.is_some() {
        Arc::new(HttpSandboxProvider::new(&config.sandbox).map_err(|e| anyhow::anyhow!("{e}"))?)
    } else {
        Arc::new(UnconfiguredProvider)
    };
    let metrics = Arc::new(Metrics::new(
        config.metrics.enabled,
        config.service.max_concurrent_tasks,
    ));

    TaskManager::new(config, store, invoker, provider, metrics)
        .await
        .map_err(|e| anyhow::anyhow!("manager startup failed: {e}"))
}

async fn run_single(config: Config, args: RunArgs) -> i32 {
    let Some(backend) = BackendKind::from_str(&args.backend) else {
        eprintln!("unknown backend: {}", args.backend);
        return EXIT_MISCONFIGURED;
    };
    let Some(mode) = TaskMode::from_str(&args.mode) else {
        eprintln!("unknown mode: {}", args.mode);
        return EXIT_MISCONFIGURED;
    };

    let default_max_steps = config.service.default_max_steps;
    let manager = match build_manager(config).await {
        Ok(manager) => manager,
        Err(err) => {
            eprintln!("error: {err:#}");
            return EXIT_MISCONFIGURED;
        }
    };

    let request = RunRequest {
        instruction: args.query,
        config: Some(RunConfig {
            backend,
            mode,
            max_steps: args.max_steps.unwrap_or(default_max_steps),
            enable_search: !args.disable_search,
            enable_takeover: args.enable_takeover,
            ..Default::default()
        }),
        destroy_sandbox: true,
        ..Default::default()
    };

    let (task_id, mut events) = match manager.run_streaming(request).await {
        Ok(streaming) => streaming,
        Err(err) => {
            eprintln!("error: {err}");
            return EXIT_MISCONFIGURED;
        }
    };
    info!(%task_id, "task started");

    // Ctrl-C requests cooperative cancellation; the stream then ends with a
    // `cancelled` event.
    let ctrlc_manager = manager.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            let _ = ctrlc_manager.cancel(task_id).await;
        }
    });

    let mut terminal_stage = None;
    while let Some(event) = events.next().await {
        println!("[{}] {}", event.stage, event.message);
        if event.stage.is_terminal() {
            terminal_stage = Some(event.stage);
            break;
        }
    }

    match terminal_stage {
        Some(Stage::Finished) => EXIT_OK,
        Some(Stage::Cancelled) => EXIT_CANCELLED,
        Some(_) => EXIT_TASK_FAILED,
        None => {
            // Stream ended without a terminal event; consult the record.
            match manager.query(task_id).await {
                Ok(task) if task.status == TaskStatus::Completed => EXIT_OK,
                Ok(task) if task.status == TaskStatus::Cancelled => EXIT_CANCELLED,
                _ => EXIT_TASK_FAILED,
            }
        }
    }
}

async fn serve(config: Config, args: ServeArgs) -> anyhow::Result<()> {
    let manager = build_manager(config).await?;
    crate::adapters::http::serve(manager, args.bind)
        .await
        .context("http server failed")
}
