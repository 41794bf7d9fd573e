//! # sawbridge agent
//!
//! Connection-resilient telemetry bridge between an industrial sawmill
//! machine and an MQTT message bus.
//!
//! ## Architecture
//!
//! The bridge runs a handful of concurrent loops under one orchestrator:
//! 1. **Field session**: change subscription feeding the machine snapshot
//! 2. **Status/alarm loops**: periodic publishing of state and conditions
//! 3. **Telemetry feeds**: sliding-window metrics over tracked quantities
//! 4. **Command drain**: FIFO execution of validated control commands
//! 5. **Supervision**: retry/backoff and buffered replay on either link

use anyhow::{bail, Context, Result};
use sawbridge_fieldbus::{FieldClient, SimFieldClient};
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

mod config;
mod executor;
mod link;
mod runtime;
mod supervisor;

pub use config::BridgeConfig;
pub use runtime::BridgeOrchestrator;

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    tracing::info!(version = env!("CARGO_PKG_VERSION"), "Starting sawbridge");

    let config = BridgeConfig::from_env()?;
    tracing::info!(
        machine = %config.machine_id,
        endpoint = %config.fieldbus.endpoint,
        broker = %config.bus.broker,
        "Bridge configured"
    );

    let client = build_client(&config)?;
    let bridge = BridgeOrchestrator::new(config, client).context("Failed to build bridge")?;

    bridge.start().await.context("Failed to start bridge")?;

    tracing::info!("Bridge running, press Ctrl+C to stop");
    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for shutdown signal")?;
    tracing::info!("Shutdown signal received");

    bridge.stop().await;
    Ok(())
}

/// Select the protocol client for the configured endpoint.
///
/// `sim://` endpoints run against the in-memory simulator, seeded with a
/// resting machine for every configured tag. Real protocol drivers plug in
/// here behind the same trait.
fn build_client(config: &BridgeConfig) -> Result<Arc<dyn FieldClient>> {
    if config.fieldbus.endpoint.starts_with("sim://") {
        let values = config.tags.iter().map(|tag| {
            let value = match tag.data_type {
                sawbridge_core::TagDataType::Boolean => {
                    sawbridge_core::TagValue::Boolean(tag.name == "is_stopped")
                }
                sawbridge_core::TagDataType::Integer => sawbridge_core::TagValue::Integer(0),
                sawbridge_core::TagDataType::Float => sawbridge_core::TagValue::Float(0.0),
                sawbridge_core::TagDataType::Text => {
                    sawbridge_core::TagValue::Text(String::new())
                }
            };
            (tag.address.clone(), value)
        });
        return Ok(Arc::new(SimFieldClient::with_values(values)));
    }

    bail!(
        "no protocol driver for endpoint '{}' (use sim:// for the simulator)",
        config.fieldbus.endpoint
    )
}
