//! Realtime Relay Binary
//!
//! Starts the update relay.
//!
//! # Usage
//!
//! ```bash
//! cargo run --bin realtime-relay
//! ```
//!
//! # Environment Variables
//!
//! ## Optional
//! - `REDIS_URL`: Upstream cache and pub/sub backend (unset: cache-only)
//! - `RELAY_MODE`: server | remote (default: server)
//! - `RELAY_STREAM_URL`: Event stream to consume (required in remote mode)
//! - `RELAY_HTTP_PORT`: Event stream, health and metrics port (default: 8090)
//! - `RELAY_CACHE_CAPACITY`: Local cache entries (default: 1000)
//! - `RELAY_BREAKER_FAILURE_THRESHOLD`: Failures before opening (default: 5)
//! - `RELAY_TASK_CONCURRENCY`: Concurrent background tasks (default: 3)
//! - `OTEL_ENABLED`: Enable OpenTelemetry (default: false)
//! - `OTEL_EXPORTER_OTLP_ENDPOINT`: OTLP endpoint (default: <http://localhost:4317>)
//! - `OTEL_SERVICE_NAME`: Service name (default: realtime-relay)
//! - `RUST_LOG`: Log level (default: info)

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use realtime_relay::{
    BridgeState, HttpServer, RelayConfig, RelayContext, TaskQueue, init_metrics, init_telemetry,
};
use tokio::signal;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

/// Graceful shutdown timeout.
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(30);

/// Interval between stalled-task sweeps.
const RECOVERY_INTERVAL: Duration = Duration::from_secs(60);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    load_dotenv();

    // Initialize telemetry (OpenTelemetry + tracing)
    let _telemetry_guard = init_telemetry().context("failed to initialize telemetry")?;

    tracing::info!("Starting Realtime Relay");

    // Initialize Prometheus metrics
    if let Err(e) = init_metrics() {
        tracing::warn!(error = %e, "Metrics exporter unavailable");
    }

    let config = RelayConfig::from_env().context("invalid configuration")?;
    log_config(&config);

    let shutdown_token = CancellationToken::new();

    let context = RelayContext::build(&config).context("failed to build relay")?;

    // Start the event bridge
    let bridge = Arc::clone(context.bridge());
    bridge.initialize();

    let bridge_state = bridge.watch_state();
    tokio::spawn(async move {
        handle_bridge_state(bridge_state).await;
    });

    // Spawn HTTP server
    let http_server = HttpServer::new(
        config.server.http_port,
        context.http_state(env!("CARGO_PKG_VERSION"), shutdown_token.clone()),
    );
    let http_handle = tokio::spawn(async move {
        if let Err(e) = http_server.run().await {
            tracing::error!(error = %e, "HTTP server error");
        }
    });

    // Spawn task workers
    let tasks = Arc::clone(context.tasks());
    let task_shutdown = shutdown_token.clone();
    let task_handle = tokio::spawn(async move {
        tasks.run(task_shutdown).await;
    });

    let sweeper = Arc::clone(context.tasks());
    let sweep_shutdown = shutdown_token.clone();
    tokio::spawn(async move {
        sweep_stalled_tasks(sweeper, sweep_shutdown).await;
    });

    tracing::info!("Realtime relay ready");

    await_shutdown(shutdown_token).await;

    let drained = tokio::time::timeout(SHUTDOWN_TIMEOUT, async {
        let _ = http_handle.await;
        let _ = task_handle.await;
        context.shutdown().await;
    })
    .await;
    if drained.is_err() {
        tracing::warn!("Graceful shutdown timed out");
    }

    tracing::info!("Realtime relay stopped");
    Ok(())
}

/// Log bridge health transitions.
async fn handle_bridge_state(mut rx: watch::Receiver<BridgeState>) {
    let mut degraded = false;
    while rx.changed().await.is_ok() {
        let state = *rx.borrow_and_update();
        match state {
            BridgeState::Connected if degraded => {
                degraded = false;
                tracing::info!("Event bridge recovered");
            }
            BridgeState::Suspended => {
                degraded = true;
                tracing::error!("Event bridge suspended after repeated failures");
            }
            state if state.is_degraded() && !degraded => {
                degraded = true;
                tracing::warn!(state = state.as_str(), "Event bridge degraded");
            }
            _ => {}
        }
    }
}

/// Periodically requeue tasks whose worker died mid-run.
async fn sweep_stalled_tasks(tasks: Arc<TaskQueue>, shutdown_token: CancellationToken) {
    let mut interval = tokio::time::interval(RECOVERY_INTERVAL);
    loop {
        tokio::select! {
            () = shutdown_token.cancelled() => break,
            _ = interval.tick() => {
                match tasks.recover_stalled().await {
                    Ok(0) => {}
                    Ok(recovered) => tracing::info!(recovered, "Recovered stalled tasks"),
                    Err(e) => tracing::debug!(error = %e, "Stalled task sweep skipped"),
                }
            }
        }
    }
}

/// Load .env file from current or ancestor directories.
fn load_dotenv() {
    if dotenvy::dotenv().is_err() {
        load_dotenv_from_ancestors();
    }
}

/// Log the parsed configuration.
fn log_config(config: &RelayConfig) {
    tracing::info!(
        mode = config.mode.as_str(),
        http_port = config.server.http_port,
        upstream_configured = config.redis_url.is_some(),
        cache_capacity = config.cache.capacity,
        task_concurrency = config.tasks.concurrency,
        "Configuration loaded"
    );
    tracing::debug!(
        redis_url = ?config.redis_url,
        stream_url = ?config.stream_url,
        "Upstream endpoints"
    );
}

/// Load .env file from current directory or any ancestor directory.
fn load_dotenv_from_ancestors() {
    if dotenvy::dotenv().is_ok() {
        return;
    }

    if let Ok(cwd) = std::env::current_dir() {
        let mut dir = cwd.as_path();
        while let Some(parent) = dir.parent() {
            let env_path = parent.join(".env");
            if env_path.exists() {
                let _ = dotenvy::from_path(&env_path);
                return;
            }
            dir = parent;
        }
    }
}

/// Wait for shutdown signal (SIGTERM or SIGINT).
#[allow(clippy::expect_used)]
async fn await_shutdown(shutdown_token: CancellationToken) {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("signal handler installation is critical for graceful shutdown");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("SIGTERM handler installation is critical for graceful shutdown")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {
            tracing::info!("Received Ctrl+C, initiating shutdown");
        }
        () = terminate => {
            tracing::info!("Received SIGTERM, initiating shutdown");
        }
    }

    shutdown_token.cancel();

    tracing::info!(
        timeout_secs = SHUTDOWN_TIMEOUT.as_secs(),
        "Graceful shutdown started"
    );
}
