// packages/engine/src/sources/incident.rs
//! Incident intake source for the ai-coordinator agent kind
//!
//! Externally reported incidents are pushed as ready-made observations and
//! flow through the same analysis pipeline as detected traffic.

use super::{EventSource, Observation, SourceFeed};
use crate::utils::errors::Result;
use async_trait::async_trait;
use tokio::sync::mpsc;
use tracing::debug;

pub struct IncidentSource {
    feed: SourceFeed<Observation>,
    rx: Option<mpsc::Receiver<Observation>>,
}

impl IncidentSource {
    pub fn new(feed: SourceFeed<Observation>) -> Self {
        Self { feed, rx: None }
    }
}

#[async_trait]
impl EventSource for IncidentSource {
    async fn open(&mut self) -> Result<()> {
        self.rx = Some(self.feed.attach());
        Ok(())
    }

    async fn next(&mut self) -> Result<Option<Observation>> {
        let Some(rx) = self.rx.as_mut() else {
            return Ok(None);
        };
        let incident = rx.recv().await;
        if let Some(incident) = &incident {
            debug!("Incident received: {}", incident.kind);
        }
        Ok(incident)
    }

    async fn close(&mut self) {
        self.feed.detach();
        self.rx = None;
    }
}
