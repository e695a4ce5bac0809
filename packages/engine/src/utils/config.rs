// packages/engine/src/utils/config.rs
//! Layered engine configuration
//!
//! Sources, lowest priority first:
//!
//! 1. Built-in defaults (every section is `#[serde(default)]`)
//! 2. Optional file `config/engine.{toml,yaml,json}` or the path in `SMAS_CONFIG`
//! 3. Environment variables, e.g. `SMAS__ANALYSIS__BATCH_SIZE=100`

use crate::model::AgentKind;
use crate::utils::errors::{EngineError, Result};
use config::{Config, Environment, File};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Environment variable naming an explicit config file
pub const CONFIG_PATH_ENV: &str = "SMAS_CONFIG";

const DEFAULT_CONFIG_FILE: &str = "config/engine";

/// Slowest accepted token refill (one token every ~17 minutes)
pub const MIN_REFILL_PER_SEC: f64 = 0.001;

/// Top-level engine configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub server: ServerConfig,
    pub logging: LoggingConfig,
    pub metrics: MetricsConfig,
    pub runtime: RuntimeConfig,
    pub manager: ManagerConfig,
    pub analysis: AnalysisConfig,
    pub provider: ProviderConfig,
    pub broadcast: BroadcastConfig,
    pub recording: RecordingConfig,
    pub simulation: SimulationConfig,

    /// Agents registered at startup
    pub agents: Vec<AgentSpec>,
}

/// Real-time client server
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub enabled: bool,
    pub host: String,
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            host: "127.0.0.1".to_string(),
            port: 8765,
        }
    }
}

impl ServerConfig {
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Default filter directive; `RUST_LOG` takes precedence
    pub level: String,

    /// Emit JSON lines instead of human-readable output
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MetricsConfig {
    pub enabled: bool,

    /// Prometheus scrape endpoint
    pub listen_addr: String,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            listen_addr: "127.0.0.1:9464".to_string(),
        }
    }
}

/// Per-agent runtime defaults
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    /// Bounded output queue size per agent
    pub queue_capacity: usize,

    pub heartbeat_interval_ms: u64,

    /// How long `stop()` waits for the coordinator to drain the queue
    pub drain_timeout_ms: u64,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            queue_capacity: 1000,
            heartbeat_interval_ms: 1000,
            drain_timeout_ms: 2000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ManagerConfig {
    /// Consecutive missed heartbeats before an agent is marked `Error`
    pub missed_heartbeats: u32,

    pub watchdog_interval_ms: u64,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            missed_heartbeats: 3,
            watchdog_interval_ms: 1000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AnalysisConfig {
    pub batch_size: usize,
    pub batch_max_wait_ms: u64,

    /// Batches waiting for dispatch before the oldest is dropped
    pub max_pending_batches: usize,

    pub request_timeout_ms: u64,

    /// Consecutive failed batches before switching to degraded mode
    pub degraded_threshold: u32,

    /// Minimum spacing between provider probes while degraded
    pub recovery_probe_interval_ms: u64,

    /// Time allowed for in-flight requests on shutdown
    pub shutdown_grace_ms: u64,

    pub retry: RetryConfig,
    pub rate_limit: RateLimitConfig,
}

impl Default for AnalysisConfig {
    fn default() -> Self {
        Self {
            batch_size: 50,
            batch_max_wait_ms: 2000,
            max_pending_batches: 16,
            request_timeout_ms: 10_000,
            degraded_threshold: 3,
            recovery_probe_interval_ms: 5000,
            shutdown_grace_ms: 5000,
            retry: RetryConfig::default(),
            rate_limit: RateLimitConfig::default(),
        }
    }
}

impl AnalysisConfig {
    pub fn batch_max_wait(&self) -> Duration {
        Duration::from_millis(self.batch_max_wait_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn recovery_probe_interval(&self) -> Duration {
        Duration::from_millis(self.recovery_probe_interval_ms)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_millis(self.shutdown_grace_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Total attempts per batch, including the first
    pub max_attempts: u32,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
    pub multiplier: f64,

    /// Fraction of the delay randomized in either direction (0.0 - 1.0)
    pub jitter: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 4,
            initial_backoff_ms: 200,
            max_backoff_ms: 5000,
            multiplier: 2.0,
            jitter: 0.1,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitConfig {
    /// Burst size
    pub capacity: u32,

    /// Tokens added per second
    pub refill_per_sec: f64,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            capacity: 10,
            refill_per_sec: 5.0,
        }
    }
}

/// External analysis capability
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ProviderConfig {
    /// `http://host:port/path` accepting POSTed batches; absent means heuristic only
    pub endpoint: Option<String>,

    /// Optional bearer token sent with each request
    pub api_key: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BroadcastConfig {
    /// Messages buffered per subscription before it is closed with `Overflow`
    pub outbox_capacity: usize,

    /// Longest accepted client line, in bytes
    pub max_line_length: usize,
}

impl Default for BroadcastConfig {
    fn default() -> Self {
        Self {
            outbox_capacity: 256,
            max_line_length: 64 * 1024,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RecordingConfig {
    pub enabled: bool,
    pub database_path: String,
    pub batch_size: usize,
    pub flush_interval_ms: u64,
    pub channel_capacity: usize,
}

impl Default for RecordingConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            database_path: "data/smas.db".to_string(),
            batch_size: 100,
            flush_interval_ms: 500,
            channel_capacity: 4096,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SimulationConfig {
    pub enabled: bool,

    /// Upper bound for DDoS simulation duration
    pub max_duration_secs: u64,
}

impl Default for SimulationConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_duration_secs: 300,
        }
    }
}

/// Network monitor detection settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkMonitorConfig {
    /// Capture interface; `open()` fails when unset
    pub interface: Option<String>,

    /// Distinct destination ports from one source before a port scan is reported
    pub port_scan_threshold: usize,

    /// ICMP packets from one source before a flood is reported
    pub icmp_flood_threshold: u64,

    /// Source IPs kept in detector memory; the least recently seen half is
    /// forgotten when the limit is reached
    pub max_tracked_sources: usize,
}

impl Default for NetworkMonitorConfig {
    fn default() -> Self {
        Self {
            interface: Some("eth0".to_string()),
            port_scan_threshold: 10,
            icmp_flood_threshold: 100,
            max_tracked_sources: 4096,
        }
    }
}

/// One agent registration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentSpec {
    pub name: String,
    pub kind: AgentKind,

    #[serde(default)]
    pub autostart: bool,

    /// Overrides `runtime.queue_capacity` for this agent
    #[serde(default)]
    pub queue_capacity: Option<usize>,

    /// Capacity of the feed that pushes raw input into the source
    #[serde(default = "default_feed_capacity")]
    pub feed_capacity: usize,

    #[serde(default)]
    pub network: NetworkMonitorConfig,
}

fn default_feed_capacity() -> usize {
    1024
}

impl AgentSpec {
    pub fn new(name: impl Into<String>, kind: AgentKind) -> Self {
        Self {
            name: name.into(),
            kind,
            autostart: false,
            queue_capacity: None,
            feed_capacity: default_feed_capacity(),
            network: NetworkMonitorConfig::default(),
        }
    }
}

impl EngineConfig {
    /// Load configuration from file and environment
    pub fn load() -> Result<Self> {
        let path =
            std::env::var(CONFIG_PATH_ENV).unwrap_or_else(|_| DEFAULT_CONFIG_FILE.to_string());

        let config: EngineConfig = Config::builder()
            .add_source(File::with_name(&path).required(false))
            .add_source(
                Environment::with_prefix("SMAS")
                    .prefix_separator("__")
                    .separator("__"),
            )
            .build()?
            .try_deserialize()?;

        config.validate()?;
        Ok(config)
    }

    /// Reject values the pipeline cannot run with
    pub fn validate(&self) -> Result<()> {
        let checks: [(bool, &str); 9] = [
            (self.runtime.queue_capacity == 0, "runtime.queue_capacity must be > 0"),
            (self.runtime.heartbeat_interval_ms == 0, "runtime.heartbeat_interval_ms must be > 0"),
            (self.manager.missed_heartbeats == 0, "manager.missed_heartbeats must be > 0"),
            (self.analysis.batch_size == 0, "analysis.batch_size must be > 0"),
            (self.analysis.max_pending_batches == 0, "analysis.max_pending_batches must be > 0"),
            (self.analysis.retry.max_attempts == 0, "analysis.retry.max_attempts must be > 0"),
            (self.analysis.rate_limit.capacity == 0, "analysis.rate_limit.capacity must be > 0"),
            (
                self.analysis.rate_limit.refill_per_sec.is_nan()
                    || self.analysis.rate_limit.refill_per_sec < MIN_REFILL_PER_SEC,
                "analysis.rate_limit.refill_per_sec must be >= 0.001",
            ),
            (self.broadcast.outbox_capacity == 0, "broadcast.outbox_capacity must be > 0"),
        ];

        if let Some((_, message)) = checks.iter().find(|(failed, _)| *failed) {
            return Err(EngineError::Config(message.to_string()));
        }

        if !(0.0..=1.0).contains(&self.analysis.retry.jitter) {
            return Err(EngineError::Config(
                "analysis.retry.jitter must be within 0.0..=1.0".to_string(),
            ));
        }

        let mut names = std::collections::HashSet::new();
        for agent in &self.agents {
            if agent.name.trim().is_empty() {
                return Err(EngineError::Config("agent name must not be blank".to_string()));
            }
            if agent.queue_capacity == Some(0) || agent.feed_capacity == 0 {
                return Err(EngineError::Config(format!(
                    "agent {} has a zero capacity",
                    agent.name
                )));
            }
            if !names.insert(agent.name.trim()) {
                return Err(EngineError::Config(format!(
                    "agent {} is declared twice",
                    agent.name
                )));
            }
        }

        Ok(())
    }
}
