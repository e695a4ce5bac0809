// packages/engine/src/runtime/agent_runtime.rs
//! Agent runtime for lifecycle management
//!
//! Wraps one [`EventSource`] with the agent state machine:
//!
//! ```text
//! Stopped ──start──► Starting ──open ok──► Running ──stop──► Stopping ──► Stopped
//!                       │                     │                 ▲
//!                       └──open failed──► Error ◄── EOF / error / panic / missed heartbeats
//!                                             └──stop───────────┘
//! ```
//!
//! While running, a pull task reads observations, stamps them with the agent
//! id and a per-agent sequence number, and pushes them into a bounded
//! drop-oldest queue consumed by the analysis coordinator.
//!
//! Transitions are serialized by the lifecycle lock; status reads never wait on
//! it. Every transition is published on the status channel in the order it
//! happened.

use crate::model::{Agent, AgentId, AgentKind, AgentState, AgentStatusChange, Event};
use crate::queue::DropOldestQueue;
use crate::sources::EventSource;
use crate::utils::config::RuntimeConfig;
use crate::utils::errors::{EngineError, Result};
use chrono::{DateTime, Utc};
use futures::FutureExt;
use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex, Notify, OwnedMutexGuard};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Configuration for one agent runtime
#[derive(Debug, Clone)]
pub struct AgentRuntimeConfig {
    /// Output queue capacity
    pub queue_capacity: usize,

    /// Heartbeat period while running
    pub heartbeat_interval: Duration,

    /// How long `stop()` waits for queued events to be consumed
    pub drain_timeout: Duration,
}

impl Default for AgentRuntimeConfig {
    fn default() -> Self {
        Self::from(&RuntimeConfig::default())
    }
}

impl From<&RuntimeConfig> for AgentRuntimeConfig {
    fn from(settings: &RuntimeConfig) -> Self {
        Self {
            queue_capacity: settings.queue_capacity,
            heartbeat_interval: Duration::from_millis(settings.heartbeat_interval_ms),
            drain_timeout: Duration::from_millis(settings.drain_timeout_ms),
        }
    }
}

type SharedSource = Arc<Mutex<Box<dyn EventSource>>>;

#[derive(Debug)]
struct StateInner {
    state: AgentState,
    error: Option<String>,
    last_heartbeat: Option<DateTime<Utc>>,
    last_beat: Option<Instant>,

    /// Cancels the current run; shared with the pull task
    cancel: Option<CancellationToken>,
}

/// State shared between the runtime, its pull task and the watchdog
struct StateCell {
    id: AgentId,
    kind: AgentKind,
    inner: parking_lot::Mutex<StateInner>,
    status_tx: mpsc::UnboundedSender<AgentStatusChange>,
}

impl StateCell {
    fn state(&self) -> AgentState {
        self.inner.lock().state
    }

    /// Move to `to` and publish the change while holding the state lock, so
    /// notifications are emitted in transition order
    fn transition(&self, to: AgentState, error: Option<String>) {
        let mut inner = self.inner.lock();
        self.apply(&mut inner, to, error);
    }

    /// Transition only if the current state is one of `from`
    fn transition_from(&self, from: &[AgentState], to: AgentState, error: Option<String>) -> bool {
        let mut inner = self.inner.lock();
        if !from.contains(&inner.state) {
            return false;
        }
        self.apply(&mut inner, to, error);
        true
    }

    fn apply(&self, inner: &mut StateInner, to: AgentState, error: Option<String>) {
        let previous = inner.state;
        if previous == to {
            return;
        }

        inner.state = to;
        match to {
            AgentState::Starting => inner.error = None,
            AgentState::Error => inner.error = error.clone(),
            _ => {}
        }
        if to == AgentState::Running {
            inner.last_beat = Some(Instant::now());
            inner.last_heartbeat = Some(Utc::now());
        }

        debug!(agent = %self.id, "{} -> {}", previous, to);
        metrics::counter!(
            "smas_agent_state_transitions_total",
            "agent" => self.id.to_string(),
            "state" => to.as_str()
        )
        .increment(1);

        // Receiver gone means the engine is shutting down
        let _ = self.status_tx.send(AgentStatusChange {
            agent_id: self.id.clone(),
            kind: self.kind,
            previous,
            state: to,
            error,
            timestamp: Utc::now(),
        });
    }

    /// Running → Error, also cancelling the pull task
    fn fail(&self, reason: String) -> bool {
        let failed = self.transition_from(&[AgentState::Running], AgentState::Error, Some(reason.clone()));
        if failed {
            error!(agent = %self.id, "Agent failed: {}", reason);
            if let Some(cancel) = self.inner.lock().cancel.as_ref() {
                cancel.cancel();
            }
        }
        failed
    }

    fn heartbeat(&self) {
        let mut inner = self.inner.lock();
        inner.last_beat = Some(Instant::now());
        inner.last_heartbeat = Some(Utc::now());
    }
}

/// Lifecycle bookkeeping guarded by the transition lock
#[derive(Default)]
struct Lifecycle {
    task: Option<JoinHandle<()>>,
}

/// Agent runtime managing one event source
pub struct AgentRuntime {
    config: AgentRuntimeConfig,
    cell: Arc<StateCell>,
    source: SharedSource,
    queue: Arc<DropOldestQueue<Event>>,

    /// Last stamped sequence number; never reset
    sequence: Arc<AtomicU64>,

    lifecycle: Mutex<Lifecycle>,
}

impl AgentRuntime {
    /// Create a stopped runtime
    ///
    /// `ready` is signalled on every queued event so one consumer can wait on
    /// several agents at once.
    pub fn new(
        id: AgentId,
        kind: AgentKind,
        source: Box<dyn EventSource>,
        config: AgentRuntimeConfig,
        ready: Arc<Notify>,
        status_tx: mpsc::UnboundedSender<AgentStatusChange>,
    ) -> Self {
        let queue = Arc::new(DropOldestQueue::with_notify(config.queue_capacity, ready));
        Self {
            config,
            cell: Arc::new(StateCell {
                id,
                kind,
                inner: parking_lot::Mutex::new(StateInner {
                    state: AgentState::Stopped,
                    error: None,
                    last_heartbeat: None,
                    last_beat: None,
                    cancel: None,
                }),
                status_tx,
            }),
            source: Arc::new(Mutex::new(source)),
            queue,
            sequence: Arc::new(AtomicU64::new(0)),
            lifecycle: Mutex::new(Lifecycle::default()),
        }
    }

    pub fn id(&self) -> &AgentId {
        &self.cell.id
    }

    pub fn kind(&self) -> AgentKind {
        self.cell.kind
    }

    pub fn state(&self) -> AgentState {
        self.cell.state()
    }

    /// Output queue consumed by the coordinator
    pub fn queue(&self) -> &Arc<DropOldestQueue<Event>> {
        &self.queue
    }

    /// Time since the last heartbeat, if running
    pub fn heartbeat_age(&self) -> Option<Duration> {
        let inner = self.cell.inner.lock();
        match (inner.state, inner.last_beat) {
            (AgentState::Running, Some(beat)) => Some(beat.elapsed()),
            _ => None,
        }
    }

    pub fn heartbeat_interval(&self) -> Duration {
        self.config.heartbeat_interval
    }

    pub fn snapshot(&self) -> Agent {
        let (state, error, last_heartbeat) = {
            let inner = self.cell.inner.lock();
            (inner.state, inner.error.clone(), inner.last_heartbeat)
        };
        let stats = self.queue.stats();

        Agent {
            id: self.cell.id.clone(),
            kind: self.cell.kind,
            state,
            last_heartbeat,
            error,
            events_produced: self.sequence.load(Ordering::Relaxed),
            events_dropped: stats.drop_count,
            events_discarded: stats.discard_count,
            queue_depth: stats.current_size,
        }
    }

    /// Start the agent: `Stopped → Starting → Running`
    pub async fn start(&self) -> Result<()> {
        let cancel = {
            let _lifecycle = self.lifecycle.lock().await;
            let current = self.cell.state();
            if !current.can_start() {
                return Err(self.invalid(current, "start"));
            }
            let cancel = CancellationToken::new();
            self.cell.inner.lock().cancel = Some(cancel.clone());
            self.cell.transition(AgentState::Starting, None);
            cancel
        };

        info!(agent = %self.cell.id, "Starting {} agent", self.cell.kind);

        // Lifecycle lock is released so stop() can interrupt a slow open
        let mut source = Arc::clone(&self.source).lock_owned().await;
        let opened = tokio::select! {
            result = source.open() => Some(result),
            _ = cancel.cancelled() => None,
        };

        let mut lifecycle = match opened {
            None => {
                source.close().await;
                return Err(EngineError::Shutdown(format!(
                    "agent {} stopped while starting",
                    self.cell.id
                )));
            }
            Some(Err(err)) => {
                drop(source);
                let reason = err.to_string();
                let _lifecycle = self.lifecycle.lock().await;
                if self.cell.transition_from(
                    &[AgentState::Starting],
                    AgentState::Error,
                    Some(reason.clone()),
                ) {
                    error!(agent = %self.cell.id, "Failed to open source: {}", reason);
                }
                return Err(match err {
                    EngineError::SourceUnavailable(_) => err,
                    other => EngineError::SourceUnavailable(other.to_string()),
                });
            }
            Some(Ok(())) => self.lifecycle.lock().await,
        };

        if cancel.is_cancelled() || self.cell.state() != AgentState::Starting {
            source.close().await;
            return Err(EngineError::Shutdown(format!(
                "agent {} stopped while starting",
                self.cell.id
            )));
        }

        let task = tokio::spawn(run_pull_task(
            Arc::clone(&self.cell),
            source,
            Arc::clone(&self.queue),
            Arc::clone(&self.sequence),
            cancel,
            self.config.heartbeat_interval,
        ));
        lifecycle.task = Some(task);
        self.cell.transition(AgentState::Running, None);

        info!(agent = %self.cell.id, "Agent running");
        Ok(())
    }

    /// Stop the agent: `Starting | Running | Error → Stopping → Stopped`
    ///
    /// Queued events get `drain_timeout` to be consumed; the rest are discarded.
    pub async fn stop(&self) -> Result<()> {
        let (cancel, task) = {
            let mut lifecycle = self.lifecycle.lock().await;
            let current = self.cell.state();
            if !current.can_stop() {
                return Err(self.invalid(current, "stop"));
            }
            self.cell.transition(AgentState::Stopping, None);
            let cancel = self.cell.inner.lock().cancel.take();
            (cancel, lifecycle.task.take())
        };

        info!(agent = %self.cell.id, "Stopping agent");

        if let Some(cancel) = cancel {
            cancel.cancel();
        }

        if let Some(mut task) = task {
            match tokio::time::timeout(self.config.drain_timeout, &mut task).await {
                Ok(Ok(())) => debug!(agent = %self.cell.id, "Pull task finished"),
                Ok(Err(e)) => warn!(agent = %self.cell.id, "Pull task ended abnormally: {}", e),
                Err(_) => {
                    warn!(agent = %self.cell.id, "Pull task did not exit in time, aborting");
                    task.abort();
                    // Aborting releases the source lock
                    let _ = task.await;
                }
            }
        }

        if !self.queue.wait_drained(self.config.drain_timeout).await {
            let discarded = self.queue.discard_all();
            if discarded > 0 {
                warn!(
                    agent = %self.cell.id,
                    "Drain timeout elapsed, discarded {} queued events", discarded
                );
                metrics::counter!(
                    "smas_events_discarded_total",
                    "agent" => self.cell.id.to_string()
                )
                .increment(discarded);
            }
        }

        self.source.lock().await.close().await;
        self.cell.transition(AgentState::Stopped, None);

        info!(agent = %self.cell.id, "Agent stopped");
        Ok(())
    }

    /// Mark a running agent as failed because it stopped reporting heartbeats
    pub fn mark_unresponsive(&self, reason: String) -> bool {
        self.cell.fail(reason)
    }

    fn invalid(&self, from: AgentState, action: &'static str) -> EngineError {
        EngineError::InvalidTransition {
            agent: self.cell.id.to_string(),
            from,
            action,
        }
    }
}

impl Drop for AgentRuntime {
    fn drop(&mut self) {
        if let Some(cancel) = self.cell.inner.lock().cancel.take() {
            cancel.cancel();
        }
    }
}

/// Pull loop wrapper: a panic inside the source becomes an `Error` transition
async fn run_pull_task(
    cell: Arc<StateCell>,
    source: OwnedMutexGuard<Box<dyn EventSource>>,
    queue: Arc<DropOldestQueue<Event>>,
    sequence: Arc<AtomicU64>,
    cancel: CancellationToken,
    heartbeat_interval: Duration,
) {
    let outcome = AssertUnwindSafe(pull_events(
        Arc::clone(&cell),
        source,
        queue,
        sequence,
        cancel,
        heartbeat_interval,
    ))
    .catch_unwind()
    .await;

    if let Err(panic) = outcome {
        cell.fail(format!("agent task panicked: {}", panic_message(&*panic)));
    }
}

async fn pull_events(
    cell: Arc<StateCell>,
    mut source: OwnedMutexGuard<Box<dyn EventSource>>,
    queue: Arc<DropOldestQueue<Event>>,
    sequence: Arc<AtomicU64>,
    cancel: CancellationToken,
    heartbeat_interval: Duration,
) {
    let mut heartbeat = tokio::time::interval(heartbeat_interval);
    heartbeat.set_missed_tick_behavior(MissedTickBehavior::Skip);
    let agent = cell.id.to_string();

    loop {
        tokio::select! {
            biased;

            _ = cancel.cancelled() => break,

            _ = heartbeat.tick() => cell.heartbeat(),

            next = source.next() => match next {
                Ok(Some(observation)) => {
                    let event = Event {
                        source: cell.id.clone(),
                        timestamp: observation.timestamp,
                        kind: observation.kind,
                        payload: observation.payload,
                        sequence: sequence.fetch_add(1, Ordering::Relaxed) + 1,
                    };
                    metrics::counter!("smas_events_ingested_total", "agent" => agent.clone())
                        .increment(1);

                    if let Some(evicted) = queue.push(event) {
                        debug!(agent = %cell.id, "Queue full, dropped event #{}", evicted.sequence);
                        metrics::counter!("smas_events_dropped_total", "agent" => agent.clone())
                            .increment(1);
                    }
                }
                Ok(None) => {
                    cell.fail("event source reached end of stream".to_string());
                    break;
                }
                Err(e) => {
                    cell.fail(format!("event source failed: {}", e));
                    break;
                }
            },
        }
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}
