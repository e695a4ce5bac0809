// packages/engine/src/analysis/fallback.rs
//! Local heuristic classification used in degraded mode
//!
//! Severity is the maximum of each event's suggested severity and a
//! threshold-style mapping of its kind.

use super::provider::AnalysisResult;
use crate::model::{Event, Severity};

/// Recommended actions when no external analysis is available
pub const FALLBACK_ACTIONS: [&str; 2] = ["Monitor the situation", "Log the incident"];

fn severity_for_kind(kind: &str) -> Severity {
    if kind.contains("port_scan") {
        Severity::High
    } else if kind.contains("icmp_flood") || kind.contains("ddos") {
        Severity::Medium
    } else {
        Severity::Low
    }
}

fn risk_for(severity: Severity) -> f64 {
    match severity {
        Severity::Low => 0.2,
        Severity::Medium => 0.5,
        Severity::High => 0.75,
        Severity::Critical => 0.95,
    }
}

fn event_severity(event: &Event) -> Severity {
    let by_kind = severity_for_kind(&event.kind);
    event
        .suggested_severity()
        .map_or(by_kind, |suggested| suggested.max(by_kind))
}

/// Classify a batch without external help
pub fn classify(events: &[Event]) -> AnalysisResult {
    let worst = events.iter().max_by_key(|event| event_severity(event));
    let severity = worst.map_or(Severity::Low, event_severity);
    let classification = worst.map_or_else(|| "unknown".to_string(), |event| event.kind.clone());

    AnalysisResult {
        risk_score: risk_for(severity),
        classification: classification.clone(),
        recommendation: FALLBACK_ACTIONS.join("; "),
        severity: Some(severity),
        summary: Some(format!(
            "{} event(s), most severe: {} (heuristic)",
            events.len(),
            classification
        )),
        correlated_event_ids: events.iter().map(Event::id).collect(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::AgentId;
    use chrono::Utc;
    use serde_json::json;

    fn event(kind: &str, payload: serde_json::Value, sequence: u64) -> Event {
        Event {
            source: AgentId::new("net-1"),
            timestamp: Utc::now(),
            kind: kind.to_string(),
            payload,
            sequence,
        }
    }

    #[test]
    fn test_kind_thresholds() {
        let result = classify(&[
            event("icmp_flood", json!({}), 1),
            event("port_scan", json!({}), 2),
        ]);
        assert_eq!(result.severity, Some(Severity::High));
        assert_eq!(result.classification, "port_scan");
        assert_eq!(result.correlated_event_ids.len(), 2);
        assert!(result.recommendation.contains("Monitor the situation"));
    }

    #[test]
    fn test_suggested_severity_wins_when_higher() {
        let result = classify(&[event("malware", json!({ "severity": "critical" }), 1)]);
        assert_eq!(result.severity, Some(Severity::Critical));
        assert!(result.risk_score > 0.9);
    }

    #[test]
    fn test_unknown_kind_is_low() {
        let result = classify(&[event("login", json!({}), 1)]);
        assert_eq!(result.severity, Some(Severity::Low));
        let empty = classify(&[]);
        assert_eq!(empty.classification, "unknown");
    }
}
