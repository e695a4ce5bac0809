// packages/engine/src/analysis/coordinator.rs
//! Analysis coordinator
//!
//! Turns the multi-agent event stream into alerts.
//!
//! # Architecture
//!
//! ```text
//!  agent queues ──round robin──► Collector ──batch──► pending (drop-oldest)
//!  (Running/Stopping)             size | max wait         │
//!                                                         ▼
//!                           Dispatcher ◄── token bucket ──┘
//!                               │
//!               ┌───────────────┼────────────────────┐
//!           provider ok     retries exhausted     degraded
//!               │               │                    │
//!          Alert(degraded=false) Failed, discarded  heuristic Alert(degraded=true)
//! ```
//!
//! Batches are dispatched one at a time in creation order, so per-agent event
//! order is preserved from queue to alert. Every mode change is published as a
//! [`CoordinatorEvent::Status`].

use super::fallback;
use super::provider::{AnalysisError, AnalysisProvider, AnalysisRequest, AnalysisResult};
use super::rate_limiter::TokenBucket;
use super::retry::RetryPolicy;
use crate::model::{Alert, Event, Severity};
use crate::queue::DropOldestQueue;
use crate::runtime::AgentManager;
use crate::utils::config::{AnalysisConfig, RateLimitConfig};
use crate::utils::errors::EngineError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Batch ids remembered for deduplication
const DEDUP_WINDOW: usize = 4096;

/// Coordinator configuration
#[derive(Debug, Clone)]
pub struct CoordinatorConfig {
    pub batch_size: usize,
    pub batch_max_wait: Duration,
    pub max_pending_batches: usize,
    pub request_timeout: Duration,
    pub degraded_threshold: u32,
    pub recovery_probe_interval: Duration,
    pub shutdown_grace: Duration,
    pub retry: RetryPolicy,
    pub rate_limit: RateLimitConfig,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self::from(&AnalysisConfig::default())
    }
}

impl From<&AnalysisConfig> for CoordinatorConfig {
    fn from(config: &AnalysisConfig) -> Self {
        Self {
            batch_size: config.batch_size.max(1),
            batch_max_wait: config.batch_max_wait(),
            max_pending_batches: config.max_pending_batches.max(1),
            request_timeout: config.request_timeout(),
            degraded_threshold: config.degraded_threshold.max(1),
            recovery_probe_interval: config.recovery_probe_interval(),
            shutdown_grace: config.shutdown_grace(),
            retry: RetryPolicy::from(&config.retry),
            rate_limit: config.rate_limit.clone(),
        }
    }
}

/// Group of events analyzed together
#[derive(Debug, Clone)]
pub struct Batch {
    /// Stable id, reused by every retry
    pub id: String,
    pub events: Vec<Event>,
    pub created_at: DateTime<Utc>,
}

impl Batch {
    fn new(events: Vec<Event>) -> Self {
        Self {
            id: ulid::Ulid::new().to_string(),
            events,
            created_at: Utc::now(),
        }
    }
}

/// Coordinator status snapshot
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CoordinatorStatus {
    /// Alerts come from the local heuristic
    pub degraded: bool,

    /// Pending batches were dropped since the queue last emptied
    pub overloaded: bool,

    pub events_consumed: u64,
    pub batches_dispatched: u64,
    pub batches_failed: u64,
    pub batches_dropped: u64,
    pub alerts_emitted: u64,
    pub alerts_degraded: u64,
    pub pending_batches: usize,
}

/// Output of the coordinator, in emission order
#[derive(Debug, Clone)]
pub enum CoordinatorEvent {
    Alert(Arc<Alert>),
    Status(CoordinatorStatus),
}

#[derive(Debug, Default)]
struct Counters {
    degraded: AtomicBool,
    overloaded: AtomicBool,
    events_consumed: AtomicU64,
    batches_dispatched: AtomicU64,
    batches_failed: AtomicU64,
    batches_dropped: AtomicU64,
    alerts_emitted: AtomicU64,
    alerts_degraded: AtomicU64,
}

/// Bounded memory of batch ids that already produced an alert
#[derive(Debug)]
pub(crate) struct DedupWindow {
    order: VecDeque<String>,
    seen: HashSet<String>,
    capacity: usize,
}

impl DedupWindow {
    pub(crate) fn new(capacity: usize) -> Self {
        Self {
            order: VecDeque::with_capacity(capacity),
            seen: HashSet::with_capacity(capacity),
            capacity: capacity.max(1),
        }
    }

    /// Record `id`; returns `false` if it was already recorded
    pub(crate) fn insert(&mut self, id: &str) -> bool {
        if self.seen.contains(id) {
            return false;
        }
        if self.order.len() == self.capacity {
            if let Some(oldest) = self.order.pop_front() {
                self.seen.remove(&oldest);
            }
        }
        self.order.push_back(id.to_string());
        self.seen.insert(id.to_string());
        true
    }
}

/// Dispatcher-local failure tracking
struct DispatchState {
    consecutive_failures: u32,
    last_probe: Option<Instant>,
    dedup: DedupWindow,
}

enum Outcome {
    Analyzed(AnalysisResult),
    Failed(AnalysisError),
    Heuristic,
    Abandoned,
}

/// Analysis coordinator
pub struct AnalysisCoordinator {
    config: CoordinatorConfig,
    manager: Arc<AgentManager>,

    /// `None` runs the heuristic only
    provider: Option<Arc<dyn AnalysisProvider>>,

    bucket: TokenBucket,
    pending: DropOldestQueue<Batch>,
    counters: Counters,
    output: mpsc::Sender<CoordinatorEvent>,
    cancel: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl AnalysisCoordinator {
    pub fn new(
        config: CoordinatorConfig,
        manager: Arc<AgentManager>,
        provider: Option<Arc<dyn AnalysisProvider>>,
        output: mpsc::Sender<CoordinatorEvent>,
    ) -> Self {
        let counters = Counters::default();
        if provider.is_none() {
            counters.degraded.store(true, Ordering::Relaxed);
        }

        Self {
            bucket: TokenBucket::new(&config.rate_limit),
            pending: DropOldestQueue::new(config.max_pending_batches),
            config,
            manager,
            provider,
            counters,
            output,
            cancel: CancellationToken::new(),
            tasks: Mutex::new(Vec::new()),
        }
    }

    /// Spawn the collector and dispatcher tasks
    pub async fn start(self: &Arc<Self>) {
        let mut tasks = self.tasks.lock().await;
        if !tasks.is_empty() {
            return;
        }

        match &self.provider {
            Some(provider) => info!("Analysis coordinator started with provider {}", provider.name()),
            None => warn!("No analysis provider configured, alerts use the local heuristic"),
        }
        metrics::gauge!("smas_coordinator_degraded").set(if self.is_degraded() { 1.0 } else { 0.0 });

        let collector = Arc::clone(self);
        tasks.push(tokio::spawn(async move { collector.collect().await }));
        let dispatcher = Arc::clone(self);
        tasks.push(tokio::spawn(async move { dispatcher.dispatch().await }));
    }

    /// Stop consuming, give the in-flight request `shutdown_grace`, then abandon it
    pub async fn shutdown(&self) {
        self.cancel.cancel();
        let tasks: Vec<_> = self.tasks.lock().await.drain(..).collect();
        let deadline = Instant::now() + self.config.shutdown_grace;

        for mut task in tasks {
            match tokio::time::timeout_at(deadline, &mut task).await {
                Ok(_) => {}
                Err(_) => {
                    warn!("Coordinator task exceeded shutdown grace, abandoning in-flight work");
                    task.abort();
                }
            }
        }

        let abandoned = self.pending.discard_all();
        if abandoned > 0 {
            info!("Discarded {} pending batches on shutdown", abandoned);
        }
    }

    pub fn is_degraded(&self) -> bool {
        self.counters.degraded.load(Ordering::Relaxed)
    }

    pub fn status(&self) -> CoordinatorStatus {
        let c = &self.counters;
        CoordinatorStatus {
            degraded: c.degraded.load(Ordering::Relaxed),
            overloaded: c.overloaded.load(Ordering::Relaxed),
            events_consumed: c.events_consumed.load(Ordering::Relaxed),
            batches_dispatched: c.batches_dispatched.load(Ordering::Relaxed),
            batches_failed: c.batches_failed.load(Ordering::Relaxed),
            batches_dropped: c.batches_dropped.load(Ordering::Relaxed),
            alerts_emitted: c.alerts_emitted.load(Ordering::Relaxed),
            alerts_degraded: c.alerts_degraded.load(Ordering::Relaxed),
            pending_batches: self.pending.len(),
        }
    }

    async fn emit(&self, event: CoordinatorEvent) {
        // Closed output means the engine is shutting down
        let _ = self.output.send(event).await;
    }

    async fn emit_status(&self) {
        self.emit(CoordinatorEvent::Status(self.status())).await;
    }

    // ----- collector -------------------------------------------------------

    /// Round-robin over draining agents, one event per agent per round
    async fn collect(&self) {
        let ready = Arc::clone(self.manager.ready());
        let mut batch: Vec<Event> = Vec::with_capacity(self.config.batch_size);
        let mut deadline: Option<Instant> = None;
        let mut cursor = 0usize;

        loop {
            // Register interest before scanning so a push between scan and wait is not lost
            let notified = ready.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let runtimes = self.manager.runtimes();
            let mut took_any = false;

            if !runtimes.is_empty() {
                let n = runtimes.len();
                for offset in 0..n {
                    let runtime = &runtimes[(cursor + offset) % n];
                    if !runtime.state().is_draining() {
                        continue;
                    }
                    let Some(event) = runtime.queue().try_pop() else {
                        continue;
                    };

                    took_any = true;
                    self.counters.events_consumed.fetch_add(1, Ordering::Relaxed);
                    if batch.is_empty() {
                        deadline = Some(Instant::now() + self.config.batch_max_wait);
                    }
                    batch.push(event);

                    if batch.len() >= self.config.batch_size {
                        self.flush(&mut batch).await;
                        deadline = None;
                    }
                }
                cursor = cursor.wrapping_add(1);
            }

            if deadline.map_or(false, |d| Instant::now() >= d) {
                self.flush(&mut batch).await;
                deadline = None;
            }

            if took_any {
                tokio::task::yield_now().await;
                continue;
            }

            tokio::select! {
                _ = self.cancel.cancelled() => break,
                _ = &mut notified => {}
                _ = sleep_until_opt(deadline) => {
                    self.flush(&mut batch).await;
                    deadline = None;
                }
            }
        }

        if !batch.is_empty() {
            debug!("Collector stopped with {} unbatched events", batch.len());
        }
    }

    async fn flush(&self, batch: &mut Vec<Event>) {
        if batch.is_empty() {
            return;
        }

        let batch = Batch::new(std::mem::replace(batch, Vec::with_capacity(self.config.batch_size)));
        debug!(batch = %batch.id, "Batched {} events", batch.events.len());

        if let Some(dropped) = self.pending.push(batch) {
            let total = self.counters.batches_dropped.fetch_add(1, Ordering::Relaxed) + 1;
            metrics::counter!("smas_batches_dropped_total").increment(1);
            let err = EngineError::Overloaded(format!(
                "dropped oldest pending batch ({} events, {} batches dropped so far)",
                dropped.events.len(),
                total
            ));
            warn!(batch = %dropped.id, "{}", err);
            if !self.counters.overloaded.swap(true, Ordering::Relaxed) {
                self.emit_status().await;
            }
        }
    }

    // ----- dispatcher ------------------------------------------------------

    async fn dispatch(&self) {
        let mut state = DispatchState {
            consecutive_failures: 0,
            last_probe: None,
            dedup: DedupWindow::new(DEDUP_WINDOW),
        };

        loop {
            let batch = loop {
                let notified = self.pending.ready().notified();
                tokio::pin!(notified);
                notified.as_mut().enable();

                if let Some(batch) = self.pending.try_pop() {
                    break Some(batch);
                }
                if self.counters.overloaded.swap(false, Ordering::Relaxed) {
                    info!("Pending batch queue drained, coordinator no longer overloaded");
                    self.emit_status().await;
                }

                tokio::select! {
                    _ = self.cancel.cancelled() => break None,
                    _ = &mut notified => {}
                }
            };

            let Some(batch) = batch else {
                break;
            };
            if self.cancel.is_cancelled() {
                break;
            }
            self.process(batch, &mut state).await;
        }

        debug!("Dispatcher stopped");
    }

    async fn process(&self, batch: Batch, state: &mut DispatchState) {
        let request = AnalysisRequest {
            batch_id: batch.id.clone(),
            events: batch.events,
        };

        let outcome = match &self.provider {
            None => Outcome::Heuristic,
            Some(provider) if self.is_degraded() => {
                let probe_due = state
                    .last_probe
                    .map_or(true, |at| at.elapsed() >= self.config.recovery_probe_interval);
                if probe_due {
                    state.last_probe = Some(Instant::now());
                    debug!(batch = %request.batch_id, "Probing analysis provider");
                    if !self.health_check(provider.as_ref()).await {
                        Outcome::Heuristic
                    } else {
                        let single = RetryPolicy {
                            max_attempts: 1,
                            ..self.config.retry.clone()
                        };
                        match self.analyze_with_retry(provider.as_ref(), &request, &single).await {
                            Ok(result) => Outcome::Analyzed(result),
                            Err(_) if self.cancel.is_cancelled() => Outcome::Abandoned,
                            Err(e) => {
                                debug!("Probe failed: {}", e);
                                Outcome::Heuristic
                            }
                        }
                    }
                } else {
                    Outcome::Heuristic
                }
            }
            Some(provider) => {
                match self.analyze_with_retry(provider.as_ref(), &request, &self.config.retry).await {
                    Ok(result) => Outcome::Analyzed(result),
                    Err(_) if self.cancel.is_cancelled() => Outcome::Abandoned,
                    Err(e) => Outcome::Failed(e),
                }
            }
        };

        match outcome {
            Outcome::Analyzed(result) => {
                self.counters.batches_dispatched.fetch_add(1, Ordering::Relaxed);
                metrics::counter!("smas_batches_dispatched_total").increment(1);
                state.consecutive_failures = 0;
                if self.counters.degraded.swap(false, Ordering::Relaxed) {
                    info!("Analysis provider recovered, leaving degraded mode");
                    metrics::gauge!("smas_coordinator_degraded").set(0.0);
                    self.emit_status().await;
                }
                self.emit_alert(&request, result, false, &mut state.dedup).await;
            }
            Outcome::Failed(err) => {
                self.counters.batches_failed.fetch_add(1, Ordering::Relaxed);
                metrics::counter!("smas_batches_failed_total").increment(1);
                state.consecutive_failures += 1;
                error!(
                    batch = %request.batch_id,
                    "Batch failed after retries, discarding {} events: {}",
                    request.events.len(),
                    err
                );

                if state.consecutive_failures >= self.config.degraded_threshold
                    && !self.counters.degraded.swap(true, Ordering::Relaxed)
                {
                    warn!(
                        "{} consecutive batches failed, switching to degraded mode",
                        state.consecutive_failures
                    );
                    state.last_probe = Some(Instant::now());
                    metrics::gauge!("smas_coordinator_degraded").set(1.0);
                    self.emit_status().await;
                }
            }
            Outcome::Heuristic => {
                let result = fallback::classify(&request.events);
                self.emit_alert(&request, result, true, &mut state.dedup).await;
            }
            Outcome::Abandoned => {
                info!(batch = %request.batch_id, "Abandoned batch on shutdown");
            }
        }
    }

    /// Provider liveness within the request timeout
    async fn health_check(&self, provider: &dyn AnalysisProvider) -> bool {
        let check = tokio::time::timeout(self.config.request_timeout, provider.health_check());
        tokio::select! {
            _ = self.cancel.cancelled() => false,
            outcome = check => match outcome {
                Ok(Ok(())) => true,
                Ok(Err(e)) => {
                    debug!("Provider health check failed: {}", e);
                    false
                }
                Err(_) => {
                    debug!("Provider health check timed out");
                    false
                }
            },
        }
    }

    /// One logical dispatch: rate-limited attempts with backoff between them
    async fn analyze_with_retry(
        &self,
        provider: &dyn AnalysisProvider,
        request: &AnalysisRequest,
        policy: &RetryPolicy,
    ) -> Result<AnalysisResult, AnalysisError> {
        let mut attempt = 0;
        loop {
            attempt += 1;

            tokio::select! {
                _ = self.cancel.cancelled() => {
                    return Err(AnalysisError::permanent("coordinator shutting down"));
                }
                _ = self.bucket.acquire() => {}
            }

            let result = match tokio::time::timeout(self.config.request_timeout, provider.analyze(request)).await {
                Ok(result) => result,
                Err(_) => Err(AnalysisError::Timeout),
            };

            match result {
                Ok(result) => return Ok(result),
                Err(err) if err.is_transient() && policy.should_retry(attempt) => {
                    let delay = policy.delay(attempt);
                    warn!(
                        batch = %request.batch_id,
                        "Attempt {}/{} failed: {}; retrying in {:?}",
                        attempt, policy.max_attempts, err, delay
                    );
                    tokio::select! {
                        _ = self.cancel.cancelled() => return Err(err),
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
                Err(err) => return Err(err),
            }
        }
    }

    async fn emit_alert(
        &self,
        request: &AnalysisRequest,
        result: AnalysisResult,
        degraded: bool,
        dedup: &mut DedupWindow,
    ) {
        if !dedup.insert(&request.batch_id) {
            debug!(batch = %request.batch_id, "Duplicate analysis result ignored");
            return;
        }

        let alert = Arc::new(build_alert(request, result, degraded));
        self.counters.alerts_emitted.fetch_add(1, Ordering::Relaxed);
        metrics::counter!("smas_alerts_emitted_total").increment(1);
        if degraded {
            self.counters.alerts_degraded.fetch_add(1, Ordering::Relaxed);
            metrics::counter!("smas_alerts_degraded_total").increment(1);
        }

        info!(
            batch = %alert.batch_id,
            "Alert {} [{}] {}{}",
            alert.id,
            alert.severity,
            alert.summary,
            if degraded { " (degraded)" } else { "" }
        );
        self.emit(CoordinatorEvent::Alert(alert)).await;
    }
}

impl Drop for AnalysisCoordinator {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

async fn sleep_until_opt(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

fn build_alert(request: &AnalysisRequest, result: AnalysisResult, degraded: bool) -> Alert {
    let severity = result
        .severity
        .unwrap_or_else(|| Severity::from_risk_score(result.risk_score));

    // Keep batch order; narrow to the correlated subset when the provider names one
    let all_ids = request.event_ids();
    let event_ids = if result.correlated_event_ids.is_empty() {
        all_ids
    } else {
        let correlated: Vec<_> = all_ids
            .iter()
            .filter(|id| result.correlated_event_ids.contains(id))
            .cloned()
            .collect();
        if correlated.is_empty() {
            all_ids
        } else {
            correlated
        }
    };

    let summary = result
        .summary
        .unwrap_or_else(|| format!("{}: {}", result.classification, result.recommendation));

    Alert {
        id: ulid::Ulid::new().to_string(),
        batch_id: request.batch_id.clone(),
        severity,
        summary,
        classification: result.classification,
        recommendation: result.recommendation,
        risk_score: result.risk_score.clamp(0.0, 1.0),
        event_ids,
        created_at: Utc::now(),
        degraded,
    }
}
