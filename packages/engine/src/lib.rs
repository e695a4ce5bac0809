// packages/engine/src/lib.rs
//! Security agent orchestration engine
//!
//! Runs long-lived security agents, funnels their events through batched
//! analysis and pushes agent status and alerts to real-time clients.
//!
//! # Architecture
//!
//! - **model**: agents, events, alerts and status records
//! - **queue**: bounded drop-oldest queue
//! - **sources**: event source capability and the built-in agent kinds
//! - **runtime**: agent lifecycle, supervision and heartbeats
//! - **analysis**: batching, rate-limited dispatch, retry and degraded mode
//! - **broadcast**: per-client bounded fan-out and the TCP protocol
//! - **recording**: append-only sinks for alerts and status changes
//! - **control**: engine assembly and control surface
//! - **observability**: logging and metrics
//! - **utils**: configuration and errors

pub mod analysis;
pub mod broadcast;
pub mod control;
pub mod model;
pub mod observability;
pub mod queue;
pub mod recording;
pub mod runtime;
pub mod sources;
pub mod utils;

pub use control::{Engine, Overview};
pub use model::{Agent, AgentId, AgentKind, AgentState, Alert, Event, Severity};
pub use runtime::{AgentManager, AgentRuntime};
pub use utils::config::EngineConfig;
pub use utils::errors::{EngineError, Result};

// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
pub const GIT_HASH: &str = env!("GIT_HASH");

/// Engine build information
#[derive(Debug, Clone, serde::Serialize)]
pub struct BuildInfo {
    pub version: &'static str,
    pub git_hash: &'static str,
    pub build_timestamp: &'static str,
    pub rustc_version: &'static str,
}

impl BuildInfo {
    pub fn current() -> Self {
        Self {
            version: VERSION,
            git_hash: GIT_HASH,
            build_timestamp: env!("BUILD_TIMESTAMP"),
            rustc_version: env!("RUSTC_VERSION"),
        }
    }
}
