//! gantryd — the Gantry daemon.
//!
//! Single binary that assembles the delivery control plane:
//! - State store (redb): versions, routes, deployments, history
//! - Deployment controller with per-deployment driver tasks
//! - HTTP metric source for health evaluation
//! - REST API
//!
//! # Usage
//!
//! ```text
//! gantryd serve --port 8443 --data-dir /var/lib/gantry \
//!     --metric-endpoint 127.0.0.1:9090
//! ```

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use tokio::sync::watch;
use tracing::info;

use gantry_health::HttpMetricSource;
use gantry_rollout::{ControllerConfig, DeploymentController};

#[derive(Parser)]
#[command(name = "gantryd", about = "Gantry delivery control plane")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the control plane (API server + deployment controller).
    Serve {
        /// Port to listen on.
        #[arg(long, default_value = "8443")]
        port: u16,

        /// Data directory for persistent state.
        #[arg(long, default_value = "/var/lib/gantry")]
        data_dir: PathBuf,

        /// Metric backend address, `host:port`.
        #[arg(long, default_value = "127.0.0.1:9090")]
        metric_endpoint: String,

        /// Query path on the metric backend.
        #[arg(long, default_value = "/metrics/window")]
        metric_path: String,

        /// Per-query timeout against the metric backend, in milliseconds.
        #[arg(long, default_value = "5000")]
        metric_timeout_ms: u64,

        /// Health poll interval during a bake, in milliseconds.
        #[arg(long, default_value = "10000")]
        poll_interval_ms: u64,

        /// Consecutive failed metric queries tolerated before FAILED.
        #[arg(long, default_value = "3")]
        max_consecutive_errors: u32,

        /// Revert the route when a deployment is cancelled.
        #[arg(long, default_value = "false")]
        revert_on_cancel: bool,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing.
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,gantryd=debug,gantry=debug".parse().unwrap()),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Command::Serve {
            port,
            data_dir,
            metric_endpoint,
            metric_path,
            metric_timeout_ms,
            poll_interval_ms,
            max_consecutive_errors,
            revert_on_cancel,
        } => {
            serve(
                port,
                data_dir,
                metric_endpoint,
                metric_path,
                metric_timeout_ms,
                poll_interval_ms,
                max_consecutive_errors,
                revert_on_cancel,
            )
            .await
        }
    }
}

#[allow(clippy::too_many_arguments)]
async fn serve(
    port: u16,
    data_dir: PathBuf,
    metric_endpoint: String,
    metric_path: String,
    metric_timeout_ms: u64,
    poll_interval_ms: u64,
    max_consecutive_errors: u32,
    revert_on_cancel: bool,
) -> anyhow::Result<()> {
    info!("Gantry daemon starting");

    // Ensure data directory exists.
    std::fs::create_dir_all(&data_dir)?;
    let db_path = data_dir.join("gantry.redb");

    // State store.
    let state = gantry_state::StateStore::open(&db_path)?;
    info!(path = ?db_path, "state store opened");

    // Metric source.
    let source = Arc::new(HttpMetricSource::new(
        metric_endpoint.clone(),
        metric_path.clone(),
        Duration::from_millis(metric_timeout_ms),
    ));
    info!(endpoint = %metric_endpoint, path = %metric_path, "metric source configured");

    // Deployment controller.
    let config = ControllerConfig {
        poll_interval: Duration::from_millis(poll_interval_ms),
        max_consecutive_errors,
        revert_on_cancel,
        ..ControllerConfig::default()
    };
    let controller = Arc::new(DeploymentController::new(state.clone(), source, config));
    info!(
        poll_interval_ms,
        max_consecutive_errors, revert_on_cancel, "deployment controller initialized"
    );

    // ── Shutdown signal ────────────────────────────────────────

    let (shutdown_tx, mut shutdown_rx) = watch::channel(false);

    // ── Event forwarder ────────────────────────────────────────

    // Mirror every deployment transition into the daemon log.
    let mut events = controller.subscribe();
    let forwarder_handle = tokio::spawn(async move {
        loop {
            tokio::select! {
                event = events.recv() => match event {
                    Ok(event) => info!(
                        deployment = event.deployment_id,
                        route = %event.route,
                        from = ?event.from,
                        to = ?event.to,
                        stage = event.stage_index,
                        detail = %event.detail,
                        "transition"
                    ),
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                        tracing::warn!(dropped = n, "event forwarder lagged");
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                },
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        break;
                    }
                }
            }
        }
    });

    // ── API server ─────────────────────────────────────────────

    let router = gantry_api::build_router(state, controller.clone());
    let addr = SocketAddr::from(([0, 0, 0, 0], port));

    info!(%addr, "API server starting");

    let listener = tokio::net::TcpListener::bind(addr).await?;

    // Graceful shutdown on Ctrl-C.
    let server = axum::serve(listener, router).with_graceful_shutdown(async move {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install CTRL+C handler");
        info!("shutdown signal received");
        let _ = shutdown_tx.send(true);
    });

    server.await?;

    // Stop driver tasks; interrupted deployments stay on record for
    // operator follow-up.
    controller.stop_all().await;
    let _ = forwarder_handle.await;

    info!("Gantry daemon stopped");
    Ok(())
}
