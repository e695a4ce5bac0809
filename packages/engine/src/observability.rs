// packages/engine/src/observability.rs
//! Logging and metrics initialisation
//!
//! `RUST_LOG` takes precedence over the configured level. Metrics are exported
//! in Prometheus text format from a dedicated HTTP listener when enabled.

use crate::utils::config::{LoggingConfig, MetricsConfig};
use crate::utils::errors::{EngineError, Result};
use metrics_exporter_prometheus::PrometheusBuilder;
use std::net::SocketAddr;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Install the global tracing subscriber
pub fn init_tracing(config: &LoggingConfig) -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.level))
        .map_err(|e| EngineError::Config(format!("invalid log level {:?}: {}", config.level, e)))?;

    let registry = tracing_subscriber::registry().with(filter);
    let installed = if config.json {
        registry
            .with(
                tracing_subscriber::fmt::layer()
                    .json()
                    .with_target(true)
                    .with_current_span(true),
            )
            .try_init()
    } else {
        registry
            .with(
                tracing_subscriber::fmt::layer()
                    .with_target(true)
                    .with_thread_ids(true),
            )
            .try_init()
    };
    installed.map_err(|e| EngineError::Config(format!("tracing already initialised: {}", e)))?;

    info!("Logging initialized at level: {}", config.level);
    Ok(())
}

/// Install the Prometheus exporter if enabled
pub fn init_metrics(config: &MetricsConfig) -> Result<()> {
    if !config.enabled {
        return Ok(());
    }

    let addr: SocketAddr = config
        .listen_addr
        .parse()
        .map_err(|e| EngineError::Config(format!("invalid metrics address {}: {}", config.listen_addr, e)))?;

    PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()
        .map_err(|e| EngineError::Config(format!("failed to install metrics exporter: {}", e)))?;

    info!("Prometheus metrics exported on http://{}/metrics", addr);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_disabled_is_noop() {
        let config = MetricsConfig {
            enabled: false,
            listen_addr: "not an address".to_string(),
        };
        assert!(init_metrics(&config).is_ok());
    }

    #[test]
    fn test_invalid_metrics_address_rejected() {
        let config = MetricsConfig {
            enabled: true,
            listen_addr: "not an address".to_string(),
        };
        assert!(matches!(init_metrics(&config), Err(EngineError::Config(_))));
    }
}
