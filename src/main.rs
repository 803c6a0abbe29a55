use anyhow::Result;
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use mendr::engine::{EngineHealth, EventListener, MonitorLoop, RestartExecutor, UptimePoller};
use mendr::events::{EventBus, LogSink, MetricsSink};
use mendr::store::Store;
use mendr::AppState;

#[derive(Parser, Debug)]
#[command(name = "mendr")]
#[command(author, version, about = "A lightweight container watchdog", long_about = None)]
struct Cli {
    /// Directory for persisted state
    #[arg(short, long, default_value = "./data", env = "MENDR_DATA_DIR")]
    data_dir: PathBuf,

    /// Management API port (overrides the persisted configuration)
    #[arg(short, long, env = "MENDR_PORT")]
    port: Option<u16>,

    /// Metrics port (overrides the persisted configuration)
    #[arg(long, env = "MENDR_METRICS_PORT")]
    metrics_port: Option<u16>,

    /// Override log level
    #[arg(short, long)]
    log_level: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // An unwritable data directory is fatal; everything else degrades.
    let store = Arc::new(Store::open(&cli.data_dir)?);
    let config = store.config();

    let log_level = cli
        .log_level
        .as_ref()
        .unwrap_or(&config.logging.level)
        .clone();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&log_level)),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("Starting mendr v{}", env!("CARGO_PKG_VERSION"));
    tracing::info!(data_dir = %store.data_dir().display(), "Durable store ready");

    let metrics_handle = mendr::api::metrics::init_metrics();

    // An unreachable daemon at startup is not fatal; the loop retries.
    let runtime = mendr::runtime::connect(&config.server.docker_socket).await?;

    let health = Arc::new(EngineHealth::new());
    let bus = Arc::new(
        EventBus::new(store.clone())
            .with_sink(Arc::new(LogSink))
            .with_sink(Arc::new(MetricsSink)),
    );
    let executor = Arc::new(RestartExecutor::new(
        runtime.clone(),
        store.clone(),
        bus.clone(),
    ));

    let shutdown = CancellationToken::new();

    let monitor_task = tokio::spawn(
        MonitorLoop::new(
            runtime.clone(),
            store.clone(),
            executor.clone(),
            bus.clone(),
            health.clone(),
            shutdown.clone(),
        )
        .run(),
    );
    let listener_task = tokio::spawn(
        EventListener::new(
            runtime.clone(),
            store.clone(),
            bus.clone(),
            shutdown.clone(),
        )
        .run(),
    );
    let poller_task = tokio::spawn(
        UptimePoller::new(
            runtime.clone(),
            store.clone(),
            executor.clone(),
            bus.clone(),
            shutdown.clone(),
        )
        .run(),
    );

    let state = Arc::new(
        AppState::new(store.clone(), runtime, executor, bus, health).with_metrics(metrics_handle),
    );

    let management_port = cli.port.unwrap_or(config.server.management_port);
    let metrics_port = cli.metrics_port.unwrap_or(config.server.metrics_port);

    let api_addr = format!("{}:{}", config.server.host, management_port);
    let metrics_addr = format!("{}:{}", config.server.host, metrics_port);

    let api_listener = tokio::net::TcpListener::bind(&api_addr).await?;
    let metrics_listener = tokio::net::TcpListener::bind(&metrics_addr).await?;

    tracing::info!("Management API listening on http://{}", api_addr);
    tracing::info!("Metrics listening on http://{}/metrics", metrics_addr);

    let metrics_app = mendr::api::metrics_router(state.clone());
    let metrics_shutdown = shutdown.clone();
    tokio::spawn(async move {
        let result = axum::serve(metrics_listener, metrics_app)
            .with_graceful_shutdown(async move { metrics_shutdown.cancelled().await })
            .await;
        if let Err(e) = result {
            tracing::error!(error = %e, "Metrics server error");
        }
    });

    let app = mendr::api::create_router(state);
    let serve_shutdown = shutdown.clone();
    axum::serve(api_listener, app)
        .with_graceful_shutdown(async move {
            shutdown_signal().await;
            serve_shutdown.cancel();
        })
        .await?;

    // Background tasks observe cancellation at tick boundaries; in-flight
    // restarts are bounded by the stop timeout.
    shutdown.cancel();
    let grace = Duration::from_secs(
        config.restart.stop_timeout_seconds + config.monitor.interval_seconds,
    );
    let drain = async {
        let _ = monitor_task.await;
        let _ = listener_task.await;
        let _ = poller_task.await;
    };
    if tokio::time::timeout(grace, drain).await.is_err() {
        tracing::warn!("Background tasks did not stop within the grace period");
    }

    tracing::info!("Shutdown complete");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("Failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    tracing::info!("Shutdown signal received");
}
