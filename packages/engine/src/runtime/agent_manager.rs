// packages/engine/src/runtime/agent_manager.rs
//! Agent registry and supervision
//!
//! Owns every [`AgentRuntime`], keyed by agent id. Lifecycle calls on one agent
//! never contend with another agent's lock: the table is a sharded map and the
//! runtime handle is cloned out before any await.
//!
//! # Architecture
//!
//! ```text
//! AgentManager
//! ├─ agents: { net-1 → Runtime, sim-1 → Runtime, ... }   (sharded map)
//! ├─ order:  [net-1, sim-1, ...]                         (registration order)
//! ├─ ready:  Notify shared by every output queue
//! └─ watchdog: Running agents silent for N heartbeats → Error
//! ```

use crate::model::{Agent, AgentId, AgentState, AgentStatusChange};
use crate::runtime::agent_runtime::{AgentRuntime, AgentRuntimeConfig};
use crate::sources::{build_source, EventSource, SourceHandle};
use crate::utils::config::{AgentSpec, ManagerConfig, RuntimeConfig};
use crate::utils::errors::{EngineError, Result};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::RwLock;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Notify};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// One registered agent
#[derive(Clone)]
struct ManagedAgent {
    runtime: Arc<AgentRuntime>,
    handle: Option<SourceHandle>,
}

/// Agent registry and supervisor
pub struct AgentManager {
    runtime_defaults: RuntimeConfig,
    config: ManagerConfig,
    agents: DashMap<AgentId, ManagedAgent>,
    order: RwLock<Vec<AgentId>>,
    ready: Arc<Notify>,
    status_tx: mpsc::UnboundedSender<AgentStatusChange>,
}

impl AgentManager {
    pub fn new(
        runtime_defaults: RuntimeConfig,
        config: ManagerConfig,
        status_tx: mpsc::UnboundedSender<AgentStatusChange>,
    ) -> Self {
        Self {
            runtime_defaults,
            config,
            agents: DashMap::new(),
            order: RwLock::new(Vec::new()),
            ready: Arc::new(Notify::new()),
            status_tx,
        }
    }

    /// Register an agent of a built-in kind
    pub fn register(&self, spec: &AgentSpec) -> Result<AgentId> {
        let (source, handle) = build_source(spec);
        self.insert(spec, source, Some(handle))
    }

    /// Register an agent backed by a caller-provided source
    pub fn register_with_source(
        &self,
        spec: &AgentSpec,
        source: Box<dyn EventSource>,
    ) -> Result<AgentId> {
        self.insert(spec, source, None)
    }

    fn insert(
        &self,
        spec: &AgentSpec,
        source: Box<dyn EventSource>,
        handle: Option<SourceHandle>,
    ) -> Result<AgentId> {
        let id = AgentId::new(spec.name.trim());
        if id.as_str().is_empty() {
            return Err(EngineError::Config("agent name must not be empty".to_string()));
        }

        let mut config = AgentRuntimeConfig::from(&self.runtime_defaults);
        if let Some(capacity) = spec.queue_capacity {
            config.queue_capacity = capacity;
        }
        if config.queue_capacity == 0 {
            return Err(EngineError::Config(format!("agent {} has a zero queue capacity", id)));
        }

        // `order` is held across the map update so both always agree
        let mut order = self.order.write();
        match self.agents.entry(id.clone()) {
            Entry::Occupied(_) => return Err(EngineError::DuplicateAgent(id.to_string())),
            Entry::Vacant(slot) => {
                let runtime = AgentRuntime::new(
                    id.clone(),
                    spec.kind,
                    source,
                    config,
                    Arc::clone(&self.ready),
                    self.status_tx.clone(),
                );
                slot.insert(ManagedAgent {
                    runtime: Arc::new(runtime),
                    handle,
                });
            }
        }
        order.push(id.clone());
        drop(order);

        info!(agent = %id, "Registered {} agent", spec.kind);
        Ok(id)
    }

    /// Stop (if needed) and delete an agent
    pub async fn remove(&self, id: &AgentId) -> Result<()> {
        let runtime = self.runtime(id)?;
        if runtime.state().can_stop() {
            runtime.stop().await?;
        }
        if runtime.state() != AgentState::Stopped {
            return Err(EngineError::InvalidTransition {
                agent: id.to_string(),
                from: runtime.state(),
                action: "remove",
            });
        }

        {
            let mut order = self.order.write();
            // A concurrent remove may already have let a new agent take this id
            let removed = self
                .agents
                .remove_if(id, |_, agent| Arc::ptr_eq(&agent.runtime, &runtime));
            if removed.is_none() {
                return Err(EngineError::UnknownAgent(id.to_string()));
            }
            order.retain(|existing| existing != id);
        }
        info!(agent = %id, "Removed agent");
        Ok(())
    }

    pub async fn start(&self, id: &AgentId) -> Result<()> {
        self.runtime(id)?.start().await
    }

    pub async fn stop(&self, id: &AgentId) -> Result<()> {
        self.runtime(id)?.stop().await
    }

    pub fn status(&self, id: &AgentId) -> Result<Agent> {
        Ok(self.runtime(id)?.snapshot())
    }

    /// Snapshots of every agent, in registration order
    pub fn status_all(&self) -> Vec<Agent> {
        self.runtimes().iter().map(|rt| rt.snapshot()).collect()
    }

    /// Input feed of a built-in agent
    pub fn source_handle(&self, id: &AgentId) -> Result<SourceHandle> {
        let agent = self
            .agents
            .get(id)
            .ok_or_else(|| EngineError::UnknownAgent(id.to_string()))?;
        agent.handle.clone().ok_or_else(|| {
            EngineError::SourceUnavailable(format!("agent {} has no input feed", id))
        })
    }

    /// Runtimes in registration order
    pub fn runtimes(&self) -> Vec<Arc<AgentRuntime>> {
        let order = self.order.read();
        order
            .iter()
            .filter_map(|id| self.agents.get(id).map(|agent| Arc::clone(&agent.runtime)))
            .collect()
    }

    /// Signalled whenever any agent queues an event
    pub fn ready(&self) -> &Arc<Notify> {
        &self.ready
    }

    pub fn len(&self) -> usize {
        self.agents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.agents.is_empty()
    }

    /// Stop every active agent concurrently
    pub async fn stop_all(&self) {
        let active: Vec<_> = self
            .runtimes()
            .into_iter()
            .filter(|rt| rt.state().can_stop())
            .collect();

        let results = futures::future::join_all(active.iter().map(|rt| rt.stop())).await;
        for (runtime, result) in active.iter().zip(results) {
            if let Err(e) = result {
                warn!(agent = %runtime.id(), "Failed to stop agent: {}", e);
            }
        }
    }

    /// Mark running agents that missed too many heartbeats as failed
    pub fn check_heartbeats(&self) -> usize {
        let missed = self.config.missed_heartbeats.max(1);
        let mut failed = 0;

        for runtime in self.runtimes() {
            let Some(age) = runtime.heartbeat_age() else {
                continue;
            };
            if age > runtime.heartbeat_interval() * missed
                && runtime.mark_unresponsive(format!("missed {} consecutive heartbeats", missed))
            {
                failed += 1;
            }
        }
        failed
    }

    /// Run the heartbeat watchdog until `cancel` fires
    pub fn spawn_watchdog(self: &Arc<Self>, cancel: CancellationToken) -> JoinHandle<()> {
        let manager = Arc::clone(self);
        let period = Duration::from_millis(self.config.watchdog_interval_ms.max(1));

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        let failed = manager.check_heartbeats();
                        if failed > 0 {
                            warn!("Watchdog marked {} agents as failed", failed);
                        }
                    }
                }
            }
            debug!("Watchdog stopped");
        })
    }

    fn runtime(&self, id: &AgentId) -> Result<Arc<AgentRuntime>> {
        self.agents
            .get(id)
            .map(|agent| Arc::clone(&agent.runtime))
            .ok_or_else(|| EngineError::UnknownAgent(id.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::AgentKind;
    use crate::runtime::agent_runtime::tests::scripted;
    use crate::sources::{Observation, PacketSummary};
    use async_trait::async_trait;
    use std::net::{IpAddr, Ipv4Addr};

    fn manager() -> (AgentManager, mpsc::UnboundedReceiver<AgentStatusChange>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let runtime = RuntimeConfig {
            queue_capacity: 64,
            heartbeat_interval_ms: 20,
            drain_timeout_ms: 50,
        };
        let config = ManagerConfig {
            missed_heartbeats: 3,
            watchdog_interval_ms: 10,
        };
        (AgentManager::new(runtime, config, tx), rx)
    }

    #[tokio::test]
    async fn test_duplicate_registration() {
        let (manager, _rx) = manager();
        manager
            .register(&AgentSpec::new("net-1", AgentKind::NetworkMonitor))
            .unwrap();
        let err = manager
            .register(&AgentSpec::new("net-1", AgentKind::AttackSimulator))
            .unwrap_err();
        assert!(matches!(err, EngineError::DuplicateAgent(_)));
        assert_eq!(manager.len(), 1);
    }

    #[tokio::test]
    async fn test_unknown_agent() {
        let (manager, _rx) = manager();
        let id = AgentId::new("ghost");
        assert!(matches!(
            manager.start(&id).await,
            Err(EngineError::UnknownAgent(_))
        ));
        assert!(matches!(manager.status(&id), Err(EngineError::UnknownAgent(_))));
    }

    #[tokio::test]
    async fn test_status_all_in_registration_order() {
        let (manager, _rx) = manager();
        for (name, kind) in [
            ("sim-1", AgentKind::AttackSimulator),
            ("net-1", AgentKind::NetworkMonitor),
            ("ai-1", AgentKind::AiCoordinator),
        ] {
            manager.register(&AgentSpec::new(name, kind)).unwrap();
        }

        let ids: Vec<String> = manager
            .status_all()
            .into_iter()
            .map(|a| a.id.to_string())
            .collect();
        assert_eq!(ids, vec!["sim-1", "net-1", "ai-1"]);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_remove_and_register_keep_order_consistent() {
        let (manager, _rx) = manager();
        let manager = Arc::new(manager);
        let spec = AgentSpec::new("net-1", AgentKind::NetworkMonitor);
        let id = AgentId::new("net-1");

        for _ in 0..200 {
            manager.register(&spec).unwrap();
            let removers: Vec<_> = (0..2)
                .map(|_| {
                    let manager = Arc::clone(&manager);
                    let id = id.clone();
                    tokio::spawn(async move { manager.remove(&id).await })
                })
                .collect();
            let registrar = {
                let manager = Arc::clone(&manager);
                let spec = spec.clone();
                tokio::spawn(async move { manager.register(&spec) })
            };
            for remover in removers {
                let _ = remover.await.unwrap();
            }
            let _ = registrar.await.unwrap();

            assert_eq!(manager.status_all().len(), manager.len());
            assert_eq!(manager.order.read().len(), manager.len());
            let _ = manager.remove(&id).await;
            assert!(manager.is_empty());
        }
    }

    #[tokio::test]
    async fn test_failure_isolated_between_agents() {
        let (manager, _rx) = manager();
        let mut broken = AgentSpec::new("net-broken", AgentKind::NetworkMonitor);
        broken.network.interface = None;
        let broken = manager.register(&broken).unwrap();
        let healthy = manager
            .register(&AgentSpec::new("net-1", AgentKind::NetworkMonitor))
            .unwrap();

        assert!(matches!(
            manager.start(&broken).await,
            Err(EngineError::SourceUnavailable(_))
        ));
        manager.start(&healthy).await.unwrap();

        assert_eq!(manager.status(&broken).unwrap().state, AgentState::Error);
        assert_eq!(manager.status(&healthy).unwrap().state, AgentState::Running);

        let SourceHandle::Network { feed, .. } = manager.source_handle(&healthy).unwrap() else {
            panic!("expected a network feed");
        };
        let src = IpAddr::V4(Ipv4Addr::new(10, 0, 0, 9));
        let dst = IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1));
        for port in 1..=11 {
            feed.push(PacketSummary::tcp(src, dst, 40000, port)).await.unwrap();
        }
        for _ in 0..100 {
            if manager.status(&healthy).unwrap().queue_depth == 1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(manager.status(&healthy).unwrap().queue_depth, 1);

        manager.stop_all().await;
        assert_eq!(manager.status(&broken).unwrap().state, AgentState::Stopped);
        assert_eq!(manager.status(&healthy).unwrap().state, AgentState::Stopped);
    }

    #[tokio::test]
    async fn test_remove_stops_and_deletes() {
        let (manager, _rx) = manager();
        let (source, _tx) = scripted();
        let id = manager
            .register_with_source(&AgentSpec::new("ai-1", AgentKind::AiCoordinator), source)
            .unwrap();
        manager.start(&id).await.unwrap();

        manager.remove(&id).await.unwrap();
        assert!(manager.is_empty());
        assert!(manager.status_all().is_empty());
        assert!(matches!(
            manager.stop(&id).await,
            Err(EngineError::UnknownAgent(_))
        ));
    }

    #[tokio::test]
    async fn test_status_changes_published() {
        let (manager, mut rx) = manager();
        let (source, _tx) = scripted();
        let id = manager
            .register_with_source(&AgentSpec::new("net-1", AgentKind::NetworkMonitor), source)
            .unwrap();
        manager.start(&id).await.unwrap();

        let first = rx.recv().await.unwrap();
        assert_eq!(first.state, AgentState::Starting);
        let second = rx.recv().await.unwrap();
        assert_eq!(second.state, AgentState::Running);
        manager.stop(&id).await.unwrap();
    }

    /// Source whose capture call blocks its worker thread once
    struct HangingSource {
        hung: bool,
    }

    #[async_trait]
    impl EventSource for HangingSource {
        async fn open(&mut self) -> Result<()> {
            Ok(())
        }

        async fn next(&mut self) -> Result<Option<Observation>> {
            if !self.hung {
                self.hung = true;
                std::thread::sleep(Duration::from_millis(400));
            }
            futures::future::pending().await
        }

        async fn close(&mut self) {}
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_watchdog_marks_silent_agent_failed() {
        let (manager, _rx) = manager();
        let manager = Arc::new(manager);
        let id = manager
            .register_with_source(
                &AgentSpec::new("net-1", AgentKind::NetworkMonitor),
                Box::new(HangingSource { hung: false }),
            )
            .unwrap();

        let cancel = CancellationToken::new();
        let watchdog = manager.spawn_watchdog(cancel.clone());
        manager.start(&id).await.unwrap();

        let mut state = AgentState::Running;
        for _ in 0..100 {
            state = manager.status(&id).unwrap().state;
            if state == AgentState::Error {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(state, AgentState::Error);
        assert!(manager
            .status(&id)
            .unwrap()
            .error
            .unwrap()
            .contains("heartbeats"));

        cancel.cancel();
        watchdog.await.unwrap();
        manager.stop(&id).await.unwrap();
    }
}
