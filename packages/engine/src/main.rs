// packages/engine/src/main.rs
//! Security agent orchestration engine
//!
//! Loads configuration, starts the engine and runs until Ctrl+C.

use anyhow::{Context, Result};
use smas_engine::observability::{init_metrics, init_tracing};
use smas_engine::{BuildInfo, Engine, EngineConfig};
use tracing::info;

#[tokio::main]
async fn main() -> Result<()> {
    // Load configuration
    let config = EngineConfig::load().context("Failed to load configuration")?;

    // Initialize observability (tracing, metrics)
    init_tracing(&config.logging)?;
    init_metrics(&config.metrics)?;

    let build = BuildInfo::current();
    info!(
        "Starting smas-engine v{} ({}, built {})",
        build.version, build.git_hash, build.build_timestamp
    );

    let engine = Engine::start(config).await.context("Failed to start engine")?;
    if let Some(addr) = engine.server_addr() {
        info!("Real-time clients: connect to {}", addr);
    }
    info!("{} agents registered", engine.agents_status().len());

    // Graceful shutdown handler
    tokio::signal::ctrl_c()
        .await
        .context("Failed to install CTRL+C signal handler")?;
    info!("Received shutdown signal, cleaning up...");

    engine.shutdown().await;
    Ok(())
}
