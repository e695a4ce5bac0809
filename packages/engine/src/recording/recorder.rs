// packages/engine/src/recording/recorder.rs
//! Background record writer
//!
//! Producers hand records to a bounded channel; one writer task batches them
//! and appends to the sink, so sink latency never reaches the pipeline. Order
//! is preserved from `record()` to `append()`.

use super::sink::{Record, RecordSink};
use crate::utils::config::RecordingConfig;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Recorder configuration
#[derive(Debug, Clone)]
pub struct RecorderConfig {
    /// Records per append
    pub batch_size: usize,

    /// Maximum time a record waits before being appended
    pub flush_interval: Duration,

    /// Records buffered between producers and the writer
    pub channel_capacity: usize,
}

impl Default for RecorderConfig {
    fn default() -> Self {
        Self::from(&RecordingConfig::default())
    }
}

impl From<&RecordingConfig> for RecorderConfig {
    fn from(config: &RecordingConfig) -> Self {
        Self {
            batch_size: config.batch_size.max(1),
            flush_interval: Duration::from_millis(config.flush_interval_ms.max(1)),
            channel_capacity: config.channel_capacity.max(1),
        }
    }
}

/// Recorder statistics
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecorderStats {
    pub records_received: u64,
    pub records_written: u64,
    pub records_failed: u64,
    pub batches_written: u64,
}

#[derive(Debug, Default)]
struct Counters {
    received: AtomicU64,
    written: AtomicU64,
    failed: AtomicU64,
    batches: AtomicU64,
}

enum Command {
    Record(Record),
    Flush(oneshot::Sender<()>),
}

/// Batching front end of a [`RecordSink`]
pub struct Recorder {
    tx: mpsc::Sender<Command>,
    writer: Mutex<Option<JoinHandle<()>>>,
    counters: Arc<Counters>,
}

impl Recorder {
    /// Spawn the writer task for `sink`
    pub fn start(config: RecorderConfig, sink: Arc<dyn RecordSink>) -> Self {
        info!("Starting record writer ({} sink)", sink.name());

        let (tx, rx) = mpsc::channel(config.channel_capacity);
        let counters = Arc::new(Counters::default());
        let writer = tokio::spawn(write_loop(config, sink, rx, Arc::clone(&counters)));

        Self {
            tx,
            writer: Mutex::new(Some(writer)),
            counters,
        }
    }

    /// Queue a record; waits while the channel is full
    pub async fn record(&self, record: Record) {
        self.counters.received.fetch_add(1, Ordering::Relaxed);
        if self.tx.send(Command::Record(record)).await.is_err() {
            self.counters.failed.fetch_add(1, Ordering::Relaxed);
            warn!("Record writer stopped, record dropped");
        }
    }

    /// Append everything queued so far
    pub async fn flush(&self) {
        let (ack_tx, ack_rx) = oneshot::channel();
        if self.tx.send(Command::Flush(ack_tx)).await.is_ok() {
            let _ = ack_rx.await;
        }
    }

    pub fn stats(&self) -> RecorderStats {
        RecorderStats {
            records_received: self.counters.received.load(Ordering::Relaxed),
            records_written: self.counters.written.load(Ordering::Relaxed),
            records_failed: self.counters.failed.load(Ordering::Relaxed),
            batches_written: self.counters.batches.load(Ordering::Relaxed),
        }
    }

    /// Flush and stop the writer
    pub async fn shutdown(&self) {
        self.flush().await;
        if let Some(handle) = self.writer.lock().await.take() {
            handle.abort();
            let _ = handle.await;
        }
        let stats = self.stats();
        info!(
            "Record writer stopped: {} written, {} failed",
            stats.records_written, stats.records_failed
        );
    }
}

async fn write_loop(
    config: RecorderConfig,
    sink: Arc<dyn RecordSink>,
    mut rx: mpsc::Receiver<Command>,
    counters: Arc<Counters>,
) {
    let mut interval = tokio::time::interval_at(
        tokio::time::Instant::now() + config.flush_interval,
        config.flush_interval,
    );
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    let mut batch: Vec<Record> = Vec::with_capacity(config.batch_size);

    loop {
        tokio::select! {
            _ = interval.tick() => {
                flush_batch(&mut batch, sink.as_ref(), &counters).await;
            }
            command = rx.recv() => match command {
                Some(Command::Record(record)) => {
                    batch.push(record);
                    if batch.len() >= config.batch_size {
                        flush_batch(&mut batch, sink.as_ref(), &counters).await;
                    }
                }
                Some(Command::Flush(ack)) => {
                    flush_batch(&mut batch, sink.as_ref(), &counters).await;
                    let _ = ack.send(());
                }
                None => {
                    flush_batch(&mut batch, sink.as_ref(), &counters).await;
                    break;
                }
            },
        }
    }
}

async fn flush_batch(batch: &mut Vec<Record>, sink: &dyn RecordSink, counters: &Counters) {
    if batch.is_empty() {
        return;
    }

    let count = batch.len() as u64;
    match sink.append(batch).await {
        Ok(()) => {
            counters.written.fetch_add(count, Ordering::Relaxed);
            counters.batches.fetch_add(1, Ordering::Relaxed);
            debug!("Flushed {} records to {}", count, sink.name());
        }
        Err(e) => {
            counters.failed.fetch_add(count, Ordering::Relaxed);
            error!("Failed to append {} records to {}: {}", count, sink.name(), e);
        }
    }
    batch.clear();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{AgentId, AgentKind, AgentState, AgentStatusChange};
    use crate::recording::sink::MemorySink;
    use crate::utils::errors::{EngineError, Result};
    use async_trait::async_trait;
    use chrono::Utc;

    fn status(n: u64) -> Record {
        Record::AgentStatus(AgentStatusChange {
            agent_id: AgentId::new(format!("agent-{}", n)),
            kind: AgentKind::NetworkMonitor,
            previous: AgentState::Stopped,
            state: AgentState::Starting,
            error: None,
            timestamp: Utc::now(),
        })
    }

    fn config(batch_size: usize) -> RecorderConfig {
        RecorderConfig {
            batch_size,
            flush_interval: Duration::from_millis(500),
            channel_capacity: 64,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_preserves_order_across_batches() {
        let sink = Arc::new(MemorySink::new());
        let recorder = Recorder::start(config(3), sink.clone());

        for n in 0..10 {
            recorder.record(status(n)).await;
        }
        recorder.flush().await;

        let ids: Vec<String> = sink
            .records()
            .iter()
            .map(|record| match record {
                Record::AgentStatus(change) => change.agent_id.to_string(),
                Record::Alert(_) => unreachable!(),
            })
            .collect();
        let expected: Vec<String> = (0..10).map(|n| format!("agent-{}", n)).collect();
        assert_eq!(ids, expected);
        assert_eq!(recorder.stats().records_written, 10);
    }

    #[tokio::test(start_paused = true)]
    async fn test_interval_flush() {
        let sink = Arc::new(MemorySink::new());
        let recorder = Recorder::start(config(100), sink.clone());

        recorder.record(status(1)).await;
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(sink.is_empty());

        tokio::time::sleep(Duration::from_millis(600)).await;
        assert_eq!(sink.len(), 1);
        recorder.shutdown().await;
    }

    struct FailingSink;

    #[async_trait]
    impl RecordSink for FailingSink {
        fn name(&self) -> &str {
            "failing"
        }

        async fn append(&self, _records: &[Record]) -> Result<()> {
            Err(EngineError::StorageFailed("disk full".to_string()))
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_sink_failure_counted_not_fatal() {
        let recorder = Recorder::start(config(2), Arc::new(FailingSink));
        for n in 0..4 {
            recorder.record(status(n)).await;
        }
        recorder.flush().await;

        let stats = recorder.stats();
        assert_eq!(stats.records_failed, 4);
        assert_eq!(stats.records_written, 0);

        // Writer still alive
        recorder.record(status(5)).await;
        recorder.flush().await;
        assert_eq!(recorder.stats().records_failed, 5);
    }
}
