// packages/engine/src/sources/feed.rs
//! Input feed attached to a source while it is open

use crate::utils::errors::{EngineError, Result};
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::sync::mpsc;

/// Shared push side of a source
///
/// Cloned freely; all clones see the channel attached by the most recent
/// `open()`. Pushing into a closed source fails with `FeedClosed`.
pub struct SourceFeed<T> {
    slot: Arc<Mutex<Option<mpsc::Sender<T>>>>,
    capacity: usize,
}

impl<T> Clone for SourceFeed<T> {
    fn clone(&self) -> Self {
        Self {
            slot: Arc::clone(&self.slot),
            capacity: self.capacity,
        }
    }
}

impl<T: Send> SourceFeed<T> {
    pub fn new(capacity: usize) -> Self {
        Self {
            slot: Arc::new(Mutex::new(None)),
            capacity: capacity.max(1),
        }
    }

    /// Attach a fresh channel and return its receiving end
    pub(crate) fn attach(&self) -> mpsc::Receiver<T> {
        let (tx, rx) = mpsc::channel(self.capacity);
        *self.slot.lock() = Some(tx);
        rx
    }

    /// Detach the current channel; the receiver sees end of stream once drained
    pub(crate) fn detach(&self) {
        self.slot.lock().take();
    }

    pub fn is_open(&self) -> bool {
        self.slot.lock().as_ref().map_or(false, |tx| !tx.is_closed())
    }

    /// Push, waiting for room
    pub async fn push(&self, item: T) -> Result<()> {
        let tx = self.slot.lock().clone().ok_or(EngineError::FeedClosed)?;
        tx.send(item).await.map_err(|_| EngineError::FeedClosed)
    }

    /// Push without waiting
    pub fn try_push(&self, item: T) -> Result<()> {
        let guard = self.slot.lock();
        let tx = guard.as_ref().ok_or(EngineError::FeedClosed)?;
        tx.try_send(item).map_err(|err| match err {
            mpsc::error::TrySendError::Full(_) => EngineError::FeedFull,
            mpsc::error::TrySendError::Closed(_) => EngineError::FeedClosed,
        })
    }
}
