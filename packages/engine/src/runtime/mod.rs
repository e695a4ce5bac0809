// packages/engine/src/runtime/mod.rs
//! Agent execution runtime
//!
//! - **Agent Runtime**: lifecycle state machine, pull loop and heartbeat for one agent
//! - **Agent Manager**: registry, control delegation and heartbeat watchdog
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────┐
//! │                      AgentManager                        │
//! │   DashMap<AgentId, AgentRuntime>      watchdog (N beats) │
//! │  ┌─────────────┐  ┌─────────────┐  ┌─────────────┐       │
//! │  │ net-1       │  │ sim-1       │  │ ai-1        │  ...  │
//! │  │ pull task   │  │ pull task   │  │ pull task   │       │
//! │  │ queue(1000) │  │ queue(1000) │  │ queue(1000) │       │
//! │  └──────┬──────┘  └──────┬──────┘  └──────┬──────┘       │
//! └─────────┼────────────────┼────────────────┼──────────────┘
//!           └────────────────┴────────────────┘
//!                            │ ready (Notify)
//!                    AnalysisCoordinator
//! ```
//!
//! A fault in one agent (source error, end of stream, panic) moves only that
//! agent to `Error`.

pub mod agent_manager;
pub mod agent_runtime;

pub use agent_manager::AgentManager;
pub use agent_runtime::{AgentRuntime, AgentRuntimeConfig};
