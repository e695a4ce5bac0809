// packages/engine/src/recording/sink.rs
//! Append-only record sinks

use crate::model::{AgentStatusChange, Alert};
use crate::utils::errors::Result;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::Arc;

/// Finalized record handed to persistence/notification sinks
#[derive(Debug, Clone)]
pub enum Record {
    Alert(Arc<Alert>),
    AgentStatus(AgentStatusChange),
}

impl Record {
    pub fn kind(&self) -> &'static str {
        match self {
            Record::Alert(_) => "alert",
            Record::AgentStatus(_) => "agent_status",
        }
    }
}

/// Destination for finalized records. Called with records in emission order.
#[async_trait]
pub trait RecordSink: Send + Sync {
    fn name(&self) -> &str;

    async fn append(&self, records: &[Record]) -> Result<()>;
}

/// In-memory sink
#[derive(Debug, Default)]
pub struct MemorySink {
    records: Mutex<Vec<Record>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn records(&self) -> Vec<Record> {
        self.records.lock().clone()
    }

    pub fn alerts(&self) -> Vec<Arc<Alert>> {
        self.records
            .lock()
            .iter()
            .filter_map(|record| match record {
                Record::Alert(alert) => Some(Arc::clone(alert)),
                Record::AgentStatus(_) => None,
            })
            .collect()
    }

    pub fn len(&self) -> usize {
        self.records.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.lock().is_empty()
    }
}

#[async_trait]
impl RecordSink for MemorySink {
    fn name(&self) -> &str {
        "memory"
    }

    async fn append(&self, records: &[Record]) -> Result<()> {
        self.records.lock().extend_from_slice(records);
        Ok(())
    }
}
