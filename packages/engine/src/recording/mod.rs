// packages/engine/src/recording/mod.rs
//! Recording of finalized alerts and agent status changes
//!
//! - **Sink**: append-only [`RecordSink`] interface and an in-memory sink
//! - **Storage**: SQLite sink
//! - **Recorder**: bounded channel + background batching writer
//!
//! # Architecture
//!
//! ```text
//! status pump ──┐
//!               ├─► record() ─► channel ─► writer task ─► batch ─► sink.append()
//! alert pump ───┘                                (size | interval)
//! ```

pub mod recorder;
pub mod sink;
pub mod storage;

pub use recorder::{Recorder, RecorderConfig, RecorderStats};
pub use sink::{MemorySink, Record, RecordSink};
pub use storage::{SqliteSink, StatusRow, StorageStats};
