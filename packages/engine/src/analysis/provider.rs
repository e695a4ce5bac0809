// packages/engine/src/analysis/provider.rs
//! External analysis capability contract
//!
//! Isolates the coordinator from vendor APIs: anything that can score a batch
//! of events implements [`AnalysisProvider`]. The coordinator owns retries,
//! rate limiting and deduplication, so implementations make exactly one
//! attempt per call.

use crate::model::{Event, EventId, Severity};
use crate::utils::errors::EngineError;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// Batch of events submitted for analysis
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnalysisRequest {
    /// Stable across retries of the same batch
    pub batch_id: String,

    /// Events in per-agent order
    pub events: Vec<Event>,
}

impl AnalysisRequest {
    pub fn event_ids(&self) -> Vec<EventId> {
        self.events.iter().map(Event::id).collect()
    }
}

/// Provider verdict for one batch
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnalysisResult {
    /// 0.0 (benign) to 1.0 (certain threat)
    pub risk_score: f64,

    pub classification: String,
    pub recommendation: String,

    /// Explicit severity; derived from `risk_score` when absent
    #[serde(default)]
    pub severity: Option<Severity>,

    #[serde(default)]
    pub summary: Option<String>,

    /// Events the provider considers related; all events when empty
    #[serde(default)]
    pub correlated_event_ids: Vec<EventId>,
}

/// Errors returned by an analysis provider
#[derive(Debug, Clone, thiserror::Error)]
pub enum AnalysisError {
    #[error("Analysis request timed out")]
    Timeout,

    #[error("Rate limit exceeded")]
    RateLimited,

    #[error("Provider error: {message}")]
    Provider { message: String, transient: bool },
}

impl AnalysisError {
    pub fn transient(message: impl Into<String>) -> Self {
        AnalysisError::Provider {
            message: message.into(),
            transient: true,
        }
    }

    pub fn permanent(message: impl Into<String>) -> Self {
        AnalysisError::Provider {
            message: message.into(),
            transient: false,
        }
    }

    /// Whether retrying the same batch may succeed
    pub fn is_transient(&self) -> bool {
        match self {
            AnalysisError::Timeout | AnalysisError::RateLimited => true,
            AnalysisError::Provider { transient, .. } => *transient,
        }
    }
}

impl From<AnalysisError> for EngineError {
    fn from(err: AnalysisError) -> Self {
        match err {
            AnalysisError::Timeout => EngineError::Timeout,
            AnalysisError::RateLimited => EngineError::RateLimited,
            AnalysisError::Provider { message, .. } => EngineError::ProviderError(message),
        }
    }
}

/// Analysis capability interface
#[async_trait]
pub trait AnalysisProvider: Send + Sync {
    /// Provider name for logs
    fn name(&self) -> &str;

    /// Score one batch (single attempt)
    async fn analyze(&self, request: &AnalysisRequest) -> Result<AnalysisResult, AnalysisError>;

    /// Check whether the provider is reachable
    async fn health_check(&self) -> Result<(), AnalysisError>;
}
