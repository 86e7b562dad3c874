//! Facegate Server Binary
//!
//! Starts the WebSocket server, the dispatch loop and the worker pool.
//!
//! ## Usage
//!
//! ```bash
//! # Start server with default settings (facegate.toml + FACEGATE_* env)
//! cargo run --bin facegate-server
//!
//! # Explicit config file and listen address
//! cargo run --bin facegate-server -- --config deploy/facegate.toml --host 0.0.0.0 --port 9000
//! ```
//!
//! ## Face engine
//!
//! `worker.command` names the engine program, e.g.
//! `FACEGATE_WORKER__COMMAND='["python3","engine.py"]'`. Without it every
//! job fails with "Internal server error".

use facegate::config::LoggingConfig;
use facegate::protocol::rest;
use facegate::{
    Config, Dispatcher, FaceEngine, Gateway, JobQueue, ProcessEngine, UnconfiguredEngine,
    WorkerPool,
};

use anyhow::Context;
use clap::Parser;
use std::env;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::OnceLock;

static TRACE_GUARD: OnceLock<tracing_appender::non_blocking::WorkerGuard> = OnceLock::new();

#[derive(Debug, Parser)]
#[command(name = "facegate-server", version, about = "Face identification job server")]
struct Args {
    /// Configuration file; defaults to facegate.toml and facegate.local.toml
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Override http.host
    #[arg(long)]
    host: Option<String>,

    /// Override http.port
    #[arg(long)]
    port: Option<u16>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let mut config = match &args.config {
        Some(path) => Config::from_file(&path.to_string_lossy())
            .with_context(|| format!("failed to load {}", path.display()))?,
        None => Config::load().context("failed to load configuration")?,
    };
    if let Some(host) = args.host {
        config.http.host = host;
    }
    if let Some(port) = args.port {
        config.http.port = port;
    }

    init_tracing(&config.logging);

    let engine: Arc<dyn FaceEngine> = if config.worker.command.is_empty() {
        tracing::warn!("no worker.command configured; all jobs will fail");
        Arc::new(UnconfiguredEngine)
    } else {
        tracing::info!(command = ?config.worker.command, "face_engine_configured");
        Arc::new(ProcessEngine::from_config(&config.worker))
    };

    let pool = Arc::new(
        WorkerPool::from_config(engine, &config.worker).context("failed to start worker pool")?,
    );
    let queue = Arc::new(JobQueue::new());
    let dispatcher = Dispatcher::start(Arc::clone(&queue), pool, &config.dispatch)
        .context("failed to spawn dispatch thread")?;

    let http_config = config.http.clone();
    let gateway = Arc::new(Gateway::new(config, queue).context("invalid throttle settings")?);

    let served = rest::start_http_server(gateway, &http_config).await;

    // Drain outside the runtime's worker threads: shutdown blocks.
    let drained = tokio::task::spawn_blocking(move || dispatcher.shutdown())
        .await
        .unwrap_or(false);
    if !drained {
        tracing::warn!("worker pool did not drain before the shutdown timeout");
    }

    served.map_err(|e| anyhow::anyhow!("http server failed: {e}"))
}

fn init_tracing(logging_config: &LoggingConfig) {
    // FACEGATE_LOG takes precedence over the configured level
    let level = env::var("FACEGATE_LOG")
        .ok()
        .unwrap_or_else(|| logging_config.level.clone());
    let json = logging_config.format == "json";

    let (non_blocking, guard) = match &logging_config.file {
        Some(path) => {
            match std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
            {
                Ok(file) => tracing_appender::non_blocking(file),
                Err(e) => {
                    eprintln!("ERROR: Unable to open log file '{}': {e}", path.display());
                    tracing_appender::non_blocking(std::io::stdout())
                }
            }
        }
        None => tracing_appender::non_blocking(std::io::stdout()),
    };
    let _ = TRACE_GUARD.set(guard);

    let filter = || {
        tracing_subscriber::EnvFilter::try_new(&level)
            .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"))
    };
    let ansi = logging_config.file.is_none();

    let base = || {
        tracing_subscriber::fmt()
            .with_env_filter(filter())
            .with_ansi(ansi)
            .with_thread_names(true)
            .with_writer(non_blocking.clone())
            .with_timer(tracing_subscriber::fmt::time::SystemTime)
    };

    let subscriber: Box<dyn tracing::Subscriber + Send + Sync> = if json {
        Box::new(base().json().finish())
    } else {
        Box::new(base().compact().finish())
    };

    let _ = tracing::subscriber::set_global_default(subscriber);
}
