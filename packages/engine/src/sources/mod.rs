// packages/engine/src/sources/mod.rs
//! Event sources
//!
//! Every agent kind is a variant behind one capability:
//!
//! ```text
//!   open() ──► next() ──► next() ──► ... ──► close()
//!                │
//!                └── Ok(None) = end of stream
//! ```
//!
//! Raw input reaches a source through its [`SourceFeed`], which is attached on
//! `open()` and detached on `close()`. Reopening a source attaches a fresh feed,
//! so the observation sequence restarts cleanly.

pub mod feed;
pub mod incident;
pub mod network_monitor;
pub mod simulator;

pub use feed::SourceFeed;
pub use incident::IncidentSource;
pub use network_monitor::{NetworkMonitorSource, PacketSummary, Protocol, TrafficStats};
pub use simulator::{AttackSimulatorSource, SimulationJob};

use crate::model::AgentKind;
use crate::utils::config::AgentSpec;
use crate::utils::errors::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// One raw observation yielded by a source, before the runtime stamps it
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Observation {
    pub kind: String,
    pub payload: serde_json::Value,
    pub timestamp: DateTime<Utc>,
}

impl Observation {
    pub fn new(kind: impl Into<String>, payload: serde_json::Value) -> Self {
        Self {
            kind: kind.into(),
            payload,
            timestamp: Utc::now(),
        }
    }
}

/// Monitoring feed capability
///
/// `next()` must be cancel-safe: the runtime drops a pending `next()` when the
/// agent is stopped or a heartbeat is due.
#[async_trait]
pub trait EventSource: Send {
    /// Prepare the source; fails with `SourceUnavailable`
    async fn open(&mut self) -> Result<()>;

    /// Next observation, or `None` once the source reached end of stream
    async fn next(&mut self) -> Result<Option<Observation>>;

    /// Release the source. Safe to call more than once.
    async fn close(&mut self);
}

/// Input side of an agent's source, kept by the manager
#[derive(Clone)]
pub enum SourceHandle {
    Network {
        feed: SourceFeed<PacketSummary>,
        stats: Arc<Mutex<TrafficStats>>,
    },
    Simulator(SourceFeed<SimulationJob>),
    Incidents(SourceFeed<Observation>),
}

impl SourceHandle {
    /// Source-specific statistics for status views
    pub fn stats(&self) -> serde_json::Value {
        match self {
            SourceHandle::Network { stats, .. } => {
                serde_json::to_value(&*stats.lock()).unwrap_or_default()
            }
            SourceHandle::Simulator(_) | SourceHandle::Incidents(_) => serde_json::Value::Null,
        }
    }
}

/// Build the source for one agent registration
pub fn build_source(spec: &AgentSpec) -> (Box<dyn EventSource>, SourceHandle) {
    match spec.kind {
        AgentKind::NetworkMonitor => {
            let feed = SourceFeed::new(spec.feed_capacity);
            let source = NetworkMonitorSource::new(spec.network.clone(), feed.clone());
            let stats = source.stats_handle();
            (Box::new(source), SourceHandle::Network { feed, stats })
        }
        AgentKind::AttackSimulator => {
            let feed = SourceFeed::new(spec.feed_capacity);
            let source = AttackSimulatorSource::new(feed.clone());
            (Box::new(source), SourceHandle::Simulator(feed))
        }
        AgentKind::AiCoordinator => {
            let feed = SourceFeed::new(spec.feed_capacity);
            let source = IncidentSource::new(feed.clone());
            (Box::new(source), SourceHandle::Incidents(feed))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_build_source_matches_kind() {
        let spec = AgentSpec::new("sim-1", AgentKind::AttackSimulator);
        let (mut source, handle) = build_source(&spec);
        assert!(matches!(handle, SourceHandle::Simulator(_)));

        source.open().await.unwrap();
        match &handle {
            SourceHandle::Simulator(feed) => {
                feed.try_push(SimulationJob::PingSweep {
                    network: "10.0.0.0/24".to_string(),
                })
                .unwrap();
            }
            _ => unreachable!(),
        }
        let obs = source.next().await.unwrap().unwrap();
        assert_eq!(obs.kind, "simulation.ping_sweep");
        source.close().await;
    }

    #[test]
    fn test_network_handle_exposes_stats() {
        let spec = AgentSpec::new("net-1", AgentKind::NetworkMonitor);
        let (_source, handle) = build_source(&spec);
        let stats = handle.stats();
        assert_eq!(stats["total_packets"], 0);
    }
}
