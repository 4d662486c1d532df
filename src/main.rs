use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, ValueEnum};
use tokio::signal;
use tokio::sync::watch;
use tracing::info;
use tracing_subscriber::EnvFilter;

use sluice::config::SluiceConfig;
use sluice::http::{router, AppState, HttpServer};
use sluice::ratelimit::{run_idle_sweeper, AdmissionControl, LeakyBucketLimiter, QueuedLimiter};

/// Leaky-bucket rate limiting service.
#[derive(Debug, Parser)]
#[command(name = "sluice", version, about)]
struct Cli {
    /// Path to a YAML configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Override the HTTP listen address
    #[arg(short, long)]
    listen: Option<SocketAddr>,

    /// Log output format
    #[arg(long, value_enum, default_value_t = LogFormat::Text)]
    log_format: LogFormat,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Initialize tracing
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    match cli.log_format {
        LogFormat::Text => tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(false)
            .with_thread_ids(true)
            .init(),
        LogFormat::Json => tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .with_target(false)
            .init(),
    }

    info!("Starting Sluice Rate Limiting Service");
    info!("Version: {}", env!("CARGO_PKG_VERSION"));

    let mut config = SluiceConfig::load(cli.config.as_deref())?;
    if let Some(listen) = cli.listen {
        config.server.listen_addr = listen;
    }
    info!(
        listen_addr = %config.server.listen_addr,
        capacity = config.limiter.capacity,
        leak_rate = config.limiter.leak_rate,
        key_strategy = ?config.limiter.key_strategy,
        "Configuration loaded"
    );

    let limiter = Arc::new(LeakyBucketLimiter::new(config.limiter.policy()?));
    let (shutdown_tx, shutdown_rx) = watch::channel(());

    let backend: Arc<dyn AdmissionControl> = if config.limiter.max_queue_size > 0 {
        let queued = Arc::new(QueuedLimiter::new(
            Arc::clone(&limiter),
            config.limiter.max_queue_size,
            config.limiter.queue_timeout(),
        ));
        tokio::spawn(Arc::clone(&queued).run_drainer(stopped(shutdown_rx.clone())));
        info!(
            max_queue_size = config.limiter.max_queue_size,
            queue_timeout_ms = config.limiter.queue_timeout_ms,
            "Request queueing enabled"
        );
        queued
    } else {
        limiter.clone()
    };

    if let Some(max_idle) = config.limiter.idle_eviction() {
        tokio::spawn(run_idle_sweeper(
            Arc::clone(&limiter),
            max_idle,
            stopped(shutdown_rx.clone()),
        ));
    }

    let state = AppState::new(backend, limiter, config.limiter.key_strategy);
    let server = HttpServer::bind(config.server.listen_addr, router(state)).await?;

    // Run the server with graceful shutdown on Ctrl+C
    server.serve_with_shutdown(shutdown_signal()).await?;

    // Stop background tasks
    drop(shutdown_tx);

    info!("Sluice Rate Limiting Service stopped");
    Ok(())
}

/// Resolves once the shutdown sender is dropped.
async fn stopped(mut rx: watch::Receiver<()>) {
    while rx.changed().await.is_ok() {}
}

/// Wait for a shutdown signal (Ctrl+C or SIGTERM).
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, initiating graceful shutdown");
        }
        _ = terminate => {
            info!("Received SIGTERM, initiating graceful shutdown");
        }
    }
}
