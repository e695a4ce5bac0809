// packages/engine/src/utils/mod.rs
//! Common utilities shared by every engine module
//!
//! - **config**: layered engine configuration (file + environment)
//! - **errors**: engine error taxonomy and `Result` alias

pub mod config;
pub mod errors;

pub use config::EngineConfig;
pub use errors::{EngineError, Result};
