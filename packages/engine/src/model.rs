// packages/engine/src/model.rs
//! Core data model shared by agents, the analysis coordinator and the hub
//!
//! Ownership rules:
//!
//! - [`Agent`] snapshots are produced by the runtime that owns the agent and
//!   are read-only everywhere else
//! - [`Event`] values move from an agent queue to the coordinator exactly once
//! - [`Alert`] values are immutable once created and shared by the hub and sinks

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Agent identifier (the registered agent name, e.g. `net-1`)
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AgentId(String);

impl AgentId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for AgentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for AgentId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

/// Closed set of agent kinds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum AgentKind {
    /// Passive network traffic monitor
    NetworkMonitor,

    /// Controlled attack simulation driver
    AttackSimulator,

    /// Incident intake for AI analysis
    AiCoordinator,
}

impl AgentKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            AgentKind::NetworkMonitor => "network-monitor",
            AgentKind::AttackSimulator => "attack-simulator",
            AgentKind::AiCoordinator => "ai-coordinator",
        }
    }
}

impl fmt::Display for AgentKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Agent lifecycle state
///
/// ```text
/// Stopped → Starting → Running → Stopping → Stopped
///              │          │          ▲
///              └────► Error ─────────┘
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentState {
    Stopped,
    Starting,
    Running,
    Stopping,
    Error,
}

impl AgentState {
    pub fn as_str(&self) -> &'static str {
        match self {
            AgentState::Stopped => "stopped",
            AgentState::Starting => "starting",
            AgentState::Running => "running",
            AgentState::Stopping => "stopping",
            AgentState::Error => "error",
        }
    }

    /// Whether `start()` is accepted from this state
    pub fn can_start(&self) -> bool {
        matches!(self, AgentState::Stopped)
    }

    /// Whether `stop()` is accepted from this state
    pub fn can_stop(&self) -> bool {
        matches!(
            self,
            AgentState::Starting | AgentState::Running | AgentState::Error
        )
    }

    /// Whether the coordinator should still consume this agent's queue
    pub fn is_draining(&self) -> bool {
        matches!(self, AgentState::Running | AgentState::Stopping)
    }
}

impl fmt::Display for AgentState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Point-in-time view of one agent
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Agent {
    pub id: AgentId,
    pub kind: AgentKind,
    pub state: AgentState,

    /// Last heartbeat observed while running
    pub last_heartbeat: Option<DateTime<Utc>>,

    /// Failure description while in (or after) `Error`
    pub error: Option<String>,

    /// Events stamped by the runtime since registration
    pub events_produced: u64,

    /// Events evicted by the drop-oldest backpressure policy
    pub events_dropped: u64,

    /// Events discarded on stop after the drain timeout
    pub events_discarded: u64,

    /// Current queue depth
    pub queue_depth: usize,
}

/// Unique reference to one event: agent id + per-agent sequence number
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EventId {
    pub agent_id: AgentId,
    pub sequence: u64,
}

impl fmt::Display for EventId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.agent_id, self.sequence)
    }
}

/// One observation stamped by an agent runtime
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub source: AgentId,
    pub timestamp: DateTime<Utc>,

    /// Observation kind (e.g. `port_scan`, `simulation.ddos`)
    pub kind: String,

    /// Opaque structured payload
    pub payload: serde_json::Value,

    /// Monotonic per agent, starting at 1
    pub sequence: u64,
}

impl Event {
    pub fn id(&self) -> EventId {
        EventId {
            agent_id: self.source.clone(),
            sequence: self.sequence,
        }
    }

    /// Severity hint attached by the source, if any
    pub fn suggested_severity(&self) -> Option<Severity> {
        self.payload
            .get("severity")
            .and_then(|s| s.as_str())
            .and_then(Severity::parse)
    }
}

/// Alert severity
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

impl Severity {
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "low" => Some(Severity::Low),
            "medium" => Some(Severity::Medium),
            "high" => Some(Severity::High),
            "critical" => Some(Severity::Critical),
            _ => None,
        }
    }

    /// Map a 0.0-1.0 risk score onto a severity band
    pub fn from_risk_score(score: f64) -> Self {
        match score {
            s if s >= 0.85 => Severity::Critical,
            s if s >= 0.6 => Severity::High,
            s if s >= 0.3 => Severity::Medium,
            _ => Severity::Low,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Low => "low",
            Severity::Medium => "medium",
            Severity::High => "high",
            Severity::Critical => "critical",
        }
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Finalized analysis outcome. Never mutated after creation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Alert {
    pub id: String,

    /// Batch the alert was derived from (dedup key)
    pub batch_id: String,

    pub severity: Severity,
    pub summary: String,
    pub classification: String,
    pub recommendation: String,
    pub risk_score: f64,

    /// Originating events, in per-agent order
    pub event_ids: Vec<EventId>,

    pub created_at: DateTime<Utc>,

    /// Produced by the local heuristic instead of the external capability
    pub degraded: bool,
}

/// Lifecycle transition record emitted by a runtime
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentStatusChange {
    pub agent_id: AgentId,
    pub kind: AgentKind,
    pub previous: AgentState,
    pub state: AgentState,
    pub error: Option<String>,
    pub timestamp: DateTime<Utc>,
}
