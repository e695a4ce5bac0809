// packages/engine/src/analysis/mod.rs
//! Event analysis
//!
//! - **Coordinator**: fair collection, batching, dispatch and alert emission
//! - **Provider**: external analysis contract and its HTTP adapter
//! - **Rate limiter / Retry**: outbound pacing and backoff
//! - **Fallback**: local heuristic used while degraded

pub mod coordinator;
pub mod fallback;
pub mod http_provider;
pub mod provider;
pub mod rate_limiter;
pub mod retry;

pub use coordinator::{AnalysisCoordinator, Batch, CoordinatorConfig, CoordinatorEvent, CoordinatorStatus};
pub use http_provider::HttpJsonProvider;
pub use provider::{AnalysisError, AnalysisProvider, AnalysisRequest, AnalysisResult};
pub use rate_limiter::TokenBucket;
pub use retry::RetryPolicy;
