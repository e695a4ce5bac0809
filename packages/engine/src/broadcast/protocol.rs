// packages/engine/src/broadcast/protocol.rs
//! Real-time client protocol
//!
//! Newline-delimited JSON records, tagged by `type`:
//!
//! ```text
//! server → client   {"type":"agent-status","agent_id":"net-1","state":"running",...}
//!                   {"type":"alert","id":"01H...","severity":"high","summary":"...",...}
//!                   {"type":"coordinator-status","degraded":false,"overloaded":false,...}
//!                   {"type":"disconnect","reason":"overflow"}
//! client → server   {"type":"filter","kinds":["alert"],"min_severity":"medium"}
//! ```

use crate::analysis::CoordinatorStatus;
use crate::model::{Agent, AgentId, AgentKind, AgentState, AgentStatusChange, Alert, EventId, Severity};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Filterable message kinds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum MessageKind {
    AgentStatus,
    Alert,
    CoordinatorStatus,
}

/// Why the hub closed a subscription
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DisconnectReason {
    /// Outbox full: the client is too slow
    Overflow,

    /// Client went away or a write failed
    ClientClosed,

    /// Removed by the server
    Unsubscribed,

    /// Hub shutting down
    Shutdown,
}

impl fmt::Display for DisconnectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let reason = match self {
            DisconnectReason::Overflow => "overflow",
            DisconnectReason::ClientClosed => "client_closed",
            DisconnectReason::Unsubscribed => "unsubscribed",
            DisconnectReason::Shutdown => "shutdown",
        };
        f.write_str(reason)
    }
}

/// Messages pushed to clients
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ServerMessage {
    AgentStatus {
        agent_id: AgentId,
        kind: AgentKind,
        state: AgentState,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
        timestamp: DateTime<Utc>,
    },
    Alert {
        id: String,
        severity: Severity,
        summary: String,
        classification: String,
        risk_score: f64,
        degraded: bool,
        event_ids: Vec<EventId>,
        timestamp: DateTime<Utc>,
    },
    CoordinatorStatus {
        degraded: bool,
        overloaded: bool,
        timestamp: DateTime<Utc>,
    },
    Disconnect {
        reason: DisconnectReason,
    },
}

impl ServerMessage {
    /// Kind used for filtering; `None` for control frames
    pub fn kind(&self) -> Option<MessageKind> {
        match self {
            ServerMessage::AgentStatus { .. } => Some(MessageKind::AgentStatus),
            ServerMessage::Alert { .. } => Some(MessageKind::Alert),
            ServerMessage::CoordinatorStatus { .. } => Some(MessageKind::CoordinatorStatus),
            ServerMessage::Disconnect { .. } => None,
        }
    }

    pub fn severity(&self) -> Option<Severity> {
        match self {
            ServerMessage::Alert { severity, .. } => Some(*severity),
            _ => None,
        }
    }

    /// Current state of an agent, sent to new subscribers
    pub fn agent_snapshot(agent: &Agent) -> Self {
        ServerMessage::AgentStatus {
            agent_id: agent.id.clone(),
            kind: agent.kind,
            state: agent.state,
            error: agent.error.clone(),
            timestamp: agent.last_heartbeat.unwrap_or_else(Utc::now),
        }
    }

    pub fn coordinator(status: &CoordinatorStatus) -> Self {
        ServerMessage::CoordinatorStatus {
            degraded: status.degraded,
            overloaded: status.overloaded,
            timestamp: Utc::now(),
        }
    }
}

impl From<&AgentStatusChange> for ServerMessage {
    fn from(change: &AgentStatusChange) -> Self {
        ServerMessage::AgentStatus {
            agent_id: change.agent_id.clone(),
            kind: change.kind,
            state: change.state,
            error: change.error.clone(),
            timestamp: change.timestamp,
        }
    }
}

impl From<&Alert> for ServerMessage {
    fn from(alert: &Alert) -> Self {
        ServerMessage::Alert {
            id: alert.id.clone(),
            severity: alert.severity,
            summary: alert.summary.clone(),
            classification: alert.classification.clone(),
            risk_score: alert.risk_score,
            degraded: alert.degraded,
            event_ids: alert.event_ids.clone(),
            timestamp: alert.created_at,
        }
    }
}

/// Subscription filter; empty matches everything
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubscriptionFilter {
    /// Kinds to receive; `None` means all
    #[serde(default)]
    pub kinds: Option<Vec<MessageKind>>,

    /// Minimum alert severity; other kinds are unaffected
    #[serde(default)]
    pub min_severity: Option<Severity>,
}

impl SubscriptionFilter {
    pub fn matches(&self, message: &ServerMessage) -> bool {
        let Some(kind) = message.kind() else {
            return true;
        };
        if let Some(kinds) = &self.kinds {
            if !kinds.contains(&kind) {
                return false;
            }
        }
        match (self.min_severity, message.severity()) {
            (Some(min), Some(severity)) => severity >= min,
            _ => true,
        }
    }
}

/// Messages accepted from clients
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ClientMessage {
    Filter(SubscriptionFilter),
}

#[cfg(test)]
mod tests {
    use super::*;

    fn alert(severity: Severity) -> ServerMessage {
        ServerMessage::Alert {
            id: "a-1".to_string(),
            severity,
            summary: "port scan".to_string(),
            classification: "port_scan".to_string(),
            risk_score: 0.7,
            degraded: false,
            event_ids: vec![],
            timestamp: Utc::now(),
        }
    }

    #[test]
    fn test_wire_tags() {
        let json = serde_json::to_value(alert(Severity::High)).unwrap();
        assert_eq!(json["type"], "alert");
        assert_eq!(json["severity"], "high");

        let json = serde_json::to_value(ServerMessage::Disconnect {
            reason: DisconnectReason::Overflow,
        })
        .unwrap();
        assert_eq!(json["type"], "disconnect");
        assert_eq!(json["reason"], "overflow");
    }

    #[test]
    fn test_parse_filter_message() {
        let msg: ClientMessage =
            serde_json::from_str(r#"{"type":"filter","kinds":["alert"],"min_severity":"medium"}"#)
                .unwrap();
        let ClientMessage::Filter(filter) = msg;
        assert_eq!(filter.kinds, Some(vec![MessageKind::Alert]));
        assert_eq!(filter.min_severity, Some(Severity::Medium));

        let msg: ClientMessage = serde_json::from_str(r#"{"type":"filter"}"#).unwrap();
        assert_eq!(msg, ClientMessage::Filter(SubscriptionFilter::default()));
    }

    #[test]
    fn test_filter_matching() {
        let filter = SubscriptionFilter {
            kinds: Some(vec![MessageKind::Alert]),
            min_severity: Some(Severity::High),
        };
        assert!(filter.matches(&alert(Severity::Critical)));
        assert!(!filter.matches(&alert(Severity::Low)));
        assert!(!filter.matches(&ServerMessage::CoordinatorStatus {
            degraded: true,
            overloaded: false,
            timestamp: Utc::now(),
        }));
        // Control frames always pass
        assert!(filter.matches(&ServerMessage::Disconnect {
            reason: DisconnectReason::Shutdown,
        }));
        assert!(SubscriptionFilter::default().matches(&alert(Severity::Low)));
    }
}
