// packages/engine/src/broadcast/hub.rs
//! Broadcast hub
//!
//! Fans messages out to subscribers. Each subscription owns a bounded outbox
//! and a delivery task:
//!
//! ```text
//!                    ┌─► outbox(N) ─► delivery task ─► Connection
//! publish(msg) ──────┼─► outbox(N) ─► delivery task ─► Connection
//!  (try_send only)   └─► outbox(N) ─► delivery task ─► Connection
//! ```
//!
//! `publish` never waits. A full outbox closes that subscription with
//! [`DisconnectReason::Overflow`]; the others are unaffected.

use super::protocol::{DisconnectReason, ServerMessage, SubscriptionFilter};
use crate::utils::errors::{EngineError, Result};
use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Subscription identifier
pub type SubscriptionId = u64;

/// Client side of a subscription
#[async_trait]
pub trait Connection: Send + 'static {
    /// Write one message; an error ends the subscription
    async fn deliver(&mut self, message: &ServerMessage) -> Result<()>;

    /// Called once when the subscription ends
    async fn close(&mut self, reason: DisconnectReason);
}

struct Subscription {
    outbox: mpsc::Sender<Arc<ServerMessage>>,
    filter: SubscriptionFilter,
    reason: Arc<Mutex<Option<DisconnectReason>>>,
    cancel: CancellationToken,
}

impl Subscription {
    fn close(&self, reason: DisconnectReason) {
        self.reason.lock().get_or_insert(reason);
        self.cancel.cancel();
    }
}

struct HubInner {
    subscriptions: RwLock<BTreeMap<SubscriptionId, Subscription>>,
    next_id: AtomicU64,
    outbox_capacity: usize,
}

impl HubInner {
    fn remove(&self, id: SubscriptionId, reason: DisconnectReason) -> bool {
        match self.subscriptions.write().remove(&id) {
            Some(subscription) => {
                subscription.close(reason);
                true
            }
            None => false,
        }
    }
}

/// Real-time fan-out hub
#[derive(Clone)]
pub struct BroadcastHub {
    inner: Arc<HubInner>,
}

impl BroadcastHub {
    pub fn new(outbox_capacity: usize) -> Self {
        Self {
            inner: Arc::new(HubInner {
                subscriptions: RwLock::new(BTreeMap::new()),
                next_id: AtomicU64::new(1),
                outbox_capacity: outbox_capacity.max(1),
            }),
        }
    }

    /// Register a connection and spawn its delivery task
    pub fn subscribe(&self, connection: Box<dyn Connection>) -> SubscriptionId {
        self.subscribe_with(connection, Vec::new)
    }

    /// Like [`subscribe`](Self::subscribe), queueing `snapshot()` first.
    ///
    /// The snapshot is taken under the subscription lock, so no message
    /// published concurrently can fall between the snapshot and the feed.
    pub fn subscribe_with<F>(&self, connection: Box<dyn Connection>, snapshot: F) -> SubscriptionId
    where
        F: FnOnce() -> Vec<ServerMessage>,
    {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::channel(self.inner.outbox_capacity);
        let cancel = CancellationToken::new();
        let reason = Arc::new(Mutex::new(None));

        {
            let mut subscriptions = self.inner.subscriptions.write();
            for message in snapshot() {
                if tx.try_send(Arc::new(message)).is_err() {
                    warn!(subscription = id, "Snapshot larger than outbox, truncated");
                    break;
                }
            }
            subscriptions.insert(
                id,
                Subscription {
                    outbox: tx,
                    filter: SubscriptionFilter::default(),
                    reason: Arc::clone(&reason),
                    cancel: cancel.clone(),
                },
            );
        }

        let hub = Arc::downgrade(&self.inner);
        tokio::spawn(deliver_loop(id, connection, rx, cancel, reason, hub));

        debug!(subscription = id, "Client subscribed");
        id
    }

    /// Close a subscription; returns `false` if it was already gone
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.close(id, DisconnectReason::Unsubscribed)
    }

    /// Close a subscription with an explicit reason
    pub fn close(&self, id: SubscriptionId, reason: DisconnectReason) -> bool {
        self.inner.remove(id, reason)
    }

    /// Replace the filter of a subscription
    pub fn set_filter(&self, id: SubscriptionId, filter: SubscriptionFilter) -> bool {
        match self.inner.subscriptions.write().get_mut(&id) {
            Some(subscription) => {
                debug!(subscription = id, "Filter updated: {:?}", filter);
                subscription.filter = filter;
                true
            }
            None => false,
        }
    }

    /// Fan `message` out to every matching subscription without waiting
    pub fn publish(&self, message: ServerMessage) {
        let message = Arc::new(message);
        let mut overflowed = Vec::new();

        {
            let subscriptions = self.inner.subscriptions.read();
            for (id, subscription) in subscriptions.iter() {
                if !subscription.filter.matches(&message) {
                    continue;
                }
                match subscription.outbox.try_send(Arc::clone(&message)) {
                    Ok(()) => {}
                    Err(mpsc::error::TrySendError::Full(_)) => overflowed.push(*id),
                    // Delivery task already ended; it removes itself
                    Err(mpsc::error::TrySendError::Closed(_)) => {}
                }
            }
        }

        for id in overflowed {
            if self.inner.remove(id, DisconnectReason::Overflow) {
                metrics::counter!("smas_subscriptions_overflowed_total").increment(1);
                warn!(subscription = id, "{}; disconnecting", EngineError::Overflow(id));
            }
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.inner.subscriptions.read().len()
    }

    /// Close every subscription
    pub fn shutdown(&self) {
        let subscriptions = std::mem::take(&mut *self.inner.subscriptions.write());
        if !subscriptions.is_empty() {
            info!("Closing {} subscriptions", subscriptions.len());
        }
        for subscription in subscriptions.values() {
            subscription.close(DisconnectReason::Shutdown);
        }
    }
}

async fn deliver_loop(
    id: SubscriptionId,
    mut connection: Box<dyn Connection>,
    mut outbox: mpsc::Receiver<Arc<ServerMessage>>,
    cancel: CancellationToken,
    reason: Arc<Mutex<Option<DisconnectReason>>>,
    hub: Weak<HubInner>,
) {
    loop {
        let message = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            message = outbox.recv() => match message {
                Some(message) => message,
                None => break,
            },
        };

        let delivered = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            result = connection.deliver(&message) => result,
        };

        if let Err(e) = delivered {
            debug!(subscription = id, "Delivery failed: {}", e);
            reason.lock().get_or_insert(DisconnectReason::ClientClosed);
            break;
        }
    }

    let reason = (*reason.lock()).unwrap_or(DisconnectReason::ClientClosed);
    if let Some(hub) = hub.upgrade() {
        hub.subscriptions.write().remove(&id);
    }
    connection.close(reason).await;
    debug!(subscription = id, "Subscription closed: {}", reason);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Severity;
    use crate::utils::errors::EngineError;
    use chrono::Utc;
    use std::time::Duration;
    use tokio::sync::watch;

    /// Connection that forwards into a channel; delivery blocks while the gate is closed
    struct ChannelConnection {
        delivered: mpsc::UnboundedSender<ServerMessage>,
        gate: watch::Receiver<bool>,
        closed: Arc<Mutex<Option<DisconnectReason>>>,
    }

    struct Probe {
        delivered: mpsc::UnboundedReceiver<ServerMessage>,
        gate: watch::Sender<bool>,
        closed: Arc<Mutex<Option<DisconnectReason>>>,
    }

    fn connection() -> (Box<dyn Connection>, Probe) {
        let (tx, rx) = mpsc::unbounded_channel();
        let (gate_tx, gate_rx) = watch::channel(true);
        let closed = Arc::new(Mutex::new(None));
        let conn = ChannelConnection {
            delivered: tx,
            gate: gate_rx,
            closed: Arc::clone(&closed),
        };
        (
            Box::new(conn),
            Probe {
                delivered: rx,
                gate: gate_tx,
                closed,
            },
        )
    }

    #[async_trait]
    impl Connection for ChannelConnection {
        async fn deliver(&mut self, message: &ServerMessage) -> Result<()> {
            while !*self.gate.borrow() {
                if self.gate.changed().await.is_err() {
                    return Err(EngineError::Shutdown("gate dropped".to_string()));
                }
            }
            self.delivered
                .send(message.clone())
                .map_err(|_| EngineError::Shutdown("probe dropped".to_string()))
        }

        async fn close(&mut self, reason: DisconnectReason) {
            *self.closed.lock() = Some(reason);
        }
    }

    fn alert(n: usize, severity: Severity) -> ServerMessage {
        ServerMessage::Alert {
            id: format!("alert-{}", n),
            severity,
            summary: "test".to_string(),
            classification: "port_scan".to_string(),
            risk_score: 0.5,
            degraded: false,
            event_ids: vec![],
            timestamp: Utc::now(),
        }
    }

    fn alert_id(message: &ServerMessage) -> String {
        match message {
            ServerMessage::Alert { id, .. } => id.clone(),
            other => panic!("expected alert, got {:?}", other),
        }
    }

    async fn wait_closed(closed: &Mutex<Option<DisconnectReason>>) -> DisconnectReason {
        for _ in 0..100 {
            if let Some(reason) = *closed.lock() {
                return reason;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("subscription was not closed");
    }

    #[tokio::test]
    async fn test_delivers_in_publish_order() {
        let hub = BroadcastHub::new(16);
        let (conn, mut probe) = connection();
        hub.subscribe(conn);

        for n in 0..10 {
            hub.publish(alert(n, Severity::Low));
        }
        for n in 0..10 {
            let message = probe.delivered.recv().await.unwrap();
            assert_eq!(alert_id(&message), format!("alert-{}", n));
        }
    }

    #[tokio::test]
    async fn test_slow_subscriber_overflows_without_affecting_others() {
        let hub = BroadcastHub::new(4);
        let (slow, slow_probe) = connection();
        let (fast, mut fast_probe) = connection();
        slow_probe.gate.send(false).unwrap();
        hub.subscribe(slow);
        hub.subscribe(fast);

        for n in 0..20 {
            hub.publish(alert(n, Severity::High));
            // Let the fast subscriber keep up
            tokio::task::yield_now().await;
            let message = fast_probe.delivered.recv().await.unwrap();
            assert_eq!(alert_id(&message), format!("alert-{}", n));
        }

        assert_eq!(wait_closed(&slow_probe.closed).await, DisconnectReason::Overflow);
        assert_eq!(hub.subscriber_count(), 1);
        assert!(fast_probe.closed.lock().is_none());
    }

    #[tokio::test]
    async fn test_filter_applies_per_subscription() {
        let hub = BroadcastHub::new(16);
        let (conn, mut probe) = connection();
        let id = hub.subscribe(conn);
        assert!(hub.set_filter(
            id,
            SubscriptionFilter {
                kinds: None,
                min_severity: Some(Severity::High),
            }
        ));

        hub.publish(alert(1, Severity::Low));
        hub.publish(alert(2, Severity::Critical));

        let message = probe.delivered.recv().await.unwrap();
        assert_eq!(alert_id(&message), "alert-2");
    }

    #[tokio::test]
    async fn test_unsubscribe_closes_connection() {
        let hub = BroadcastHub::new(16);
        let (conn, probe) = connection();
        let id = hub.subscribe(conn);

        assert!(hub.unsubscribe(id));
        assert!(!hub.unsubscribe(id));
        assert_eq!(wait_closed(&probe.closed).await, DisconnectReason::Unsubscribed);
        assert_eq!(hub.subscriber_count(), 0);
    }

    #[tokio::test]
    async fn test_snapshot_precedes_published_messages() {
        let hub = BroadcastHub::new(16);
        let (conn, mut probe) = connection();
        hub.subscribe_with(conn, || vec![alert(0, Severity::Low)]);
        hub.publish(alert(1, Severity::Low));

        assert_eq!(alert_id(&probe.delivered.recv().await.unwrap()), "alert-0");
        assert_eq!(alert_id(&probe.delivered.recv().await.unwrap()), "alert-1");
    }

    #[tokio::test]
    async fn test_failed_delivery_removes_subscription() {
        let hub = BroadcastHub::new(16);
        let (conn, probe) = connection();
        hub.subscribe(conn);
        let Probe {
            delivered,
            closed,
            gate: _gate,
        } = probe;
        drop(delivered);

        hub.publish(alert(1, Severity::Low));
        assert_eq!(wait_closed(&closed).await, DisconnectReason::ClientClosed);
        assert_eq!(hub.subscriber_count(), 0);
    }

    #[tokio::test]
    async fn test_shutdown_closes_all() {
        let hub = BroadcastHub::new(16);
        let (a, probe_a) = connection();
        let (b, probe_b) = connection();
        hub.subscribe(a);
        hub.subscribe(b);

        hub.shutdown();
        assert_eq!(wait_closed(&probe_a.closed).await, DisconnectReason::Shutdown);
        assert_eq!(wait_closed(&probe_b.closed).await, DisconnectReason::Shutdown);
    }
}
