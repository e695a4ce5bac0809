// packages/engine/src/utils/errors.rs
//! Engine error taxonomy
//!
//! Every fallible engine operation returns [`Result`]. The variants mirror how
//! failures propagate through the pipeline:
//!
//! - caller misuse (`UnknownAgent`, `DuplicateAgent`, `InvalidTransition`) is
//!   returned synchronously and has no side effect
//! - `SourceUnavailable` stays local to one agent and surfaces as its `Error` state
//! - `ProviderError`, `Timeout` and `RateLimited` come from the external analysis
//!   capability and are retried before the coordinator degrades
//! - `Overloaded` and `Overflow` are backpressure outcomes and never fatal

use crate::model::AgentState;
use thiserror::Error;

/// Convenience result alias used across the engine
pub type Result<T> = std::result::Result<T, EngineError>;

/// Errors produced by the engine
#[derive(Debug, Error)]
pub enum EngineError {
    /// Event source could not be opened
    #[error("Event source unavailable: {0}")]
    SourceUnavailable(String),

    #[error("Unknown agent: {0}")]
    UnknownAgent(String),

    #[error("Agent already registered: {0}")]
    DuplicateAgent(String),

    /// Requested lifecycle action is not valid from the current state
    #[error("Invalid transition for agent {agent}: cannot {action} from {from}")]
    InvalidTransition {
        agent: String,
        from: AgentState,
        action: &'static str,
    },

    /// Coordinator backpressure; waiting batches were dropped
    #[error("Analysis coordinator overloaded: {0}")]
    Overloaded(String),

    #[error("Analysis provider error: {0}")]
    ProviderError(String),

    #[error("Analysis request timed out")]
    Timeout,

    #[error("Analysis provider rate limited the request")]
    RateLimited,

    /// Subscription outbox exceeded its capacity
    #[error("Subscription {0} overflowed its outbox")]
    Overflow(u64),

    #[error("Source feed is closed")]
    FeedClosed,

    #[error("Source feed is full")]
    FeedFull,

    #[error("Simulation rejected: {0}")]
    SimulationRejected(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Storage failed: {0}")]
    StorageFailed(String),

    #[error("Shutdown error: {0}")]
    Shutdown(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl From<config::ConfigError> for EngineError {
    fn from(err: config::ConfigError) -> Self {
        EngineError::Config(err.to_string())
    }
}

impl From<rusqlite::Error> for EngineError {
    fn from(err: rusqlite::Error) -> Self {
        EngineError::StorageFailed(err.to_string())
    }
}
