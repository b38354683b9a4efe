//! The binary crate: axum WebSocket upgrade handler (transport hub I/O),
//! CLI, configuration loading, and the concrete `Transport` wiring
//! coordinator calls to live sockets.

mod admin_routes;
mod cli;
mod transport;
mod ws;

use crate::cli::{Cli, Command};
use crate::transport::AxumTransport;
use anyhow::{Context, Result};
use axum::Router;
use axum::routing::get;
use clap::Parser;
use coordinator::audit::{AuditRecord, FileAuditPersistence};
use coordinator::{Config, Coordinator};
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

pub struct AppState {
    pub coordinator: Arc<Coordinator>,
    pub transport: Arc<AxumTransport>,
}

fn init_tracing() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| format!("{}=info", env!("CARGO_CRATE_NAME")).into()),
        )
        .with(
            tracing_subscriber::fmt::layer()
                .with_file(true)
                .with_line_number(true)
                .with_target(true)
                .with_thread_ids(true)
                .with_thread_names(true),
        )
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();

    match cli.command {
        Command::Serve { port, config } => serve(port, config).await,
        Command::ReplayAudit { session_id, audit_dir, experiment_id } => {
            replay_audit(&session_id, &audit_dir, &experiment_id).await
        }
    }
}

async fn serve(port_override: Option<u16>, config_path: Option<String>) -> Result<()> {
    let mut config = Config::load(config_path.as_deref()).map_err(anyhow::Error::msg)?;
    if let Some(port) = port_override {
        config.port = port;
    }
    let experiment_dir = format!("{}/{}", config.audit_dir, config.experiment_id);
    let persistence = Arc::new(FileAuditPersistence::new(experiment_dir));

    let coordinator = Coordinator::new(config.clone(), persistence);
    let transport = AxumTransport::shared();
    let state = Arc::new(AppState { coordinator: coordinator.clone(), transport: transport.clone() });

    let sweep_state = state.clone();
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(10));
        loop {
            interval.tick().await;
            sweep_state.coordinator.retention_sweep(sweep_state.transport.as_ref()).await;
        }
    });

    let app = Router::new()
        .route("/ws", get(ws::websocket_handler))
        .route("/admin/state", get(admin_routes::snapshot_handler))
        .route("/admin/console/{subject_id}", get(admin_routes::console_log_handler))
        .with_state(state);

    let addr = format!("0.0.0.0:{}", config.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    tracing::info!(addr = %addr, "listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("server loop failed")?;
    Ok(())
}

async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
    tracing::info!("shutdown signal received");
}

async fn replay_audit(session_id: &str, audit_dir: &str, experiment_id: &str) -> Result<()> {
    let path = format!("{audit_dir}/{experiment_id}/audit/{session_id}.json");
    let raw = tokio::fs::read_to_string(&path)
        .await
        .with_context(|| format!("failed to read audit record {path}"))?;
    let record: AuditRecord = serde_json::from_str(&raw).context("failed to parse audit record")?;
    match record.parity {
        Some(parity) => println!("{}", serde_json::to_string_pretty(&parity)?),
        None => println!("session {session_id} has no recorded parity result"),
    }
    Ok(())
}
