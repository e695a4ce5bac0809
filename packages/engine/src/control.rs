// packages/engine/src/control.rs
//! Engine assembly and control surface
//!
//! ```text
//!                 ┌──────────────┐ status changes ┌──────────────┐
//!  control ops ──►│ AgentManager │───────────────►│ status pump  │──┐
//!                 └──────┬───────┘                └──────────────┘  │
//!                        │ agent queues                             ├─► BroadcastHub ─► clients
//!                 ┌──────▼──────────────┐ alerts  ┌──────────────┐  │
//!                 │ AnalysisCoordinator │────────►│ alert pump   │──┤
//!                 └─────────────────────┘         └──────────────┘  └─► Recorder ─► sink
//! ```
//!
//! The pumps are the only path from the pipeline to the hub and the
//! recorder, so both see records once and in emission order.

use crate::analysis::{
    AnalysisCoordinator, AnalysisProvider, CoordinatorConfig, CoordinatorEvent, CoordinatorStatus,
    HttpJsonProvider,
};
use crate::broadcast::{BroadcastHub, RealtimeServer, ServerMessage, SnapshotFn};
use crate::model::{Agent, AgentId, AgentKind, AgentState, AgentStatusChange};
use crate::recording::{Record, RecordSink, Recorder, RecorderConfig, RecorderStats, SqliteSink};
use crate::runtime::AgentManager;
use crate::sources::{Observation, PacketSummary, SimulationJob, SourceHandle};
use crate::utils::config::{AgentSpec, EngineConfig};
use crate::utils::errors::{EngineError, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// Coordinator output buffered ahead of the alert pump
const COORDINATOR_OUTPUT_CAPACITY: usize = 1024;

/// Per-agent entry of the overview
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentOverview {
    #[serde(flatten)]
    pub agent: Agent,

    /// Source-specific counters (e.g. traffic statistics)
    pub source: serde_json::Value,
}

/// Dashboard overview
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Overview {
    pub version: String,
    pub started_at: DateTime<Utc>,
    pub uptime_secs: u64,
    pub agents_total: usize,
    pub agents_running: usize,
    pub agents: Vec<AgentOverview>,
    pub coordinator: CoordinatorStatus,
    pub subscribers: usize,
    pub recorder: Option<RecorderStats>,
}

/// The running system
pub struct Engine {
    config: EngineConfig,
    manager: Arc<AgentManager>,
    coordinator: Arc<AnalysisCoordinator>,
    hub: BroadcastHub,
    recorder: Option<Arc<Recorder>>,
    server_addr: Option<SocketAddr>,

    /// Server and watchdog
    cancel: CancellationToken,

    /// Pumps; cancelled last so final transitions are still delivered
    pump_cancel: CancellationToken,

    tasks: Mutex<Vec<JoinHandle<()>>>,
    started: Instant,
    started_at: DateTime<Utc>,
}

impl Engine {
    /// Build the engine from configuration: HTTP provider and SQLite sink as configured
    pub async fn start(config: EngineConfig) -> Result<Self> {
        let provider: Option<Arc<dyn AnalysisProvider>> = match &config.provider.endpoint {
            Some(endpoint) => Some(Arc::new(HttpJsonProvider::new(
                endpoint,
                config.provider.api_key.clone(),
            )?)),
            None => None,
        };

        let sink: Option<Arc<dyn RecordSink>> = if config.recording.enabled {
            Some(Arc::new(SqliteSink::open(&config.recording.database_path).await?))
        } else {
            None
        };

        Self::with_parts(config, provider, sink).await
    }

    /// Build the engine around an explicit provider and sink
    pub async fn with_parts(
        config: EngineConfig,
        provider: Option<Arc<dyn AnalysisProvider>>,
        sink: Option<Arc<dyn RecordSink>>,
    ) -> Result<Self> {
        config.validate()?;
        info!("Starting engine v{}", crate::VERSION);

        let (status_tx, status_rx) = mpsc::unbounded_channel();
        let manager = Arc::new(AgentManager::new(
            config.runtime.clone(),
            config.manager.clone(),
            status_tx,
        ));

        let hub = BroadcastHub::new(config.broadcast.outbox_capacity);
        let (output_tx, output_rx) = mpsc::channel(COORDINATOR_OUTPUT_CAPACITY);
        let coordinator = Arc::new(AnalysisCoordinator::new(
            CoordinatorConfig::from(&config.analysis),
            Arc::clone(&manager),
            provider,
            output_tx,
        ));

        // Nothing is spawned until the server is bound
        let server = if config.server.enabled {
            let snapshot: SnapshotFn = {
                let manager = Arc::clone(&manager);
                let coordinator = Arc::clone(&coordinator);
                Arc::new(move || {
                    let mut messages: Vec<ServerMessage> = manager
                        .status_all()
                        .iter()
                        .map(ServerMessage::agent_snapshot)
                        .collect();
                    messages.push(ServerMessage::coordinator(&coordinator.status()));
                    messages
                })
            };
            Some(
                RealtimeServer::bind(
                    &config.server.address(),
                    hub.clone(),
                    snapshot,
                    config.broadcast.max_line_length,
                )
                .await?,
            )
        } else {
            None
        };
        let server_addr = server.as_ref().map(|server| server.local_addr()).transpose()?;

        let recorder = sink.map(|sink| {
            Arc::new(Recorder::start(RecorderConfig::from(&config.recording), sink))
        });

        let cancel = CancellationToken::new();
        let pump_cancel = CancellationToken::new();
        let mut tasks = vec![
            tokio::spawn(status_pump(
                status_rx,
                hub.clone(),
                recorder.clone(),
                pump_cancel.clone(),
            )),
            tokio::spawn(alert_pump(
                output_rx,
                hub.clone(),
                recorder.clone(),
                pump_cancel.clone(),
            )),
            manager.spawn_watchdog(cancel.child_token()),
        ];

        coordinator.start().await;

        if let Some(server) = server {
            tasks.push(tokio::spawn(server.run(cancel.child_token())));
        }

        let engine = Self {
            config,
            manager,
            coordinator,
            hub,
            recorder,
            server_addr,
            cancel,
            pump_cancel,
            tasks: Mutex::new(tasks),
            started: Instant::now(),
            started_at: Utc::now(),
        };

        if let Err(e) = engine.register_configured_agents().await {
            error!("Failed to register configured agents: {}", e);
            engine.shutdown().await;
            return Err(e);
        }
        Ok(engine)
    }

    async fn register_configured_agents(&self) -> Result<()> {
        for spec in &self.config.agents {
            let id = self.manager.register(spec)?;
            if spec.autostart {
                // A source that cannot open leaves the agent in Error; the engine keeps running
                if let Err(e) = self.manager.start(&id).await {
                    error!(agent = %id, "Autostart failed: {}", e);
                }
            }
        }
        Ok(())
    }

    // ----- control surface --------------------------------------------------

    pub fn register_agent(&self, spec: &AgentSpec) -> Result<AgentId> {
        self.manager.register(spec)
    }

    pub async fn remove_agent(&self, id: &AgentId) -> Result<()> {
        self.manager.remove(id).await
    }

    /// Start an agent and return its resulting status
    pub async fn start_agent(&self, id: &AgentId) -> Result<Agent> {
        self.manager.start(id).await?;
        self.manager.status(id)
    }

    /// Stop an agent and return its resulting status
    pub async fn stop_agent(&self, id: &AgentId) -> Result<Agent> {
        self.manager.stop(id).await?;
        self.manager.status(id)
    }

    pub fn agent_status(&self, id: &AgentId) -> Result<Agent> {
        self.manager.status(id)
    }

    /// All agents in registration order
    pub fn agents_status(&self) -> Vec<Agent> {
        self.manager.status_all()
    }

    /// Validate a simulation job and hand it to a running attack simulator
    pub fn submit_simulation(&self, job: SimulationJob) -> Result<AgentId> {
        job.validate(&self.config.simulation)?;

        let (id, handle) = self.running_source(AgentKind::AttackSimulator)?;
        let SourceHandle::Simulator(feed) = handle else {
            return Err(EngineError::SourceUnavailable(format!("agent {} accepts no jobs", id)));
        };

        info!(agent = %id, "Submitting {} simulation", job.name());
        feed.try_push(job)?;
        Ok(id)
    }

    /// Push an externally reported incident into a running ai-coordinator agent
    pub fn submit_incident(
        &self,
        kind: impl Into<String>,
        payload: serde_json::Value,
    ) -> Result<AgentId> {
        let (id, handle) = self.running_source(AgentKind::AiCoordinator)?;
        let SourceHandle::Incidents(feed) = handle else {
            return Err(EngineError::SourceUnavailable(format!("agent {} accepts no incidents", id)));
        };

        feed.try_push(Observation::new(kind, payload))?;
        Ok(id)
    }

    /// Feed one captured packet summary to a network monitor agent
    pub fn ingest_packet(&self, id: &AgentId, packet: PacketSummary) -> Result<()> {
        match self.manager.source_handle(id)? {
            SourceHandle::Network { feed, .. } => feed.try_push(packet),
            _ => Err(EngineError::SourceUnavailable(format!(
                "agent {} is not a network monitor",
                id
            ))),
        }
    }

    /// First running agent of `kind` that has an input feed
    fn running_source(&self, kind: AgentKind) -> Result<(AgentId, SourceHandle)> {
        self.manager
            .status_all()
            .into_iter()
            .filter(|agent| agent.kind == kind && agent.state == AgentState::Running)
            .find_map(|agent| {
                self.manager
                    .source_handle(&agent.id)
                    .ok()
                    .map(|handle| (agent.id, handle))
            })
            .ok_or_else(|| EngineError::SourceUnavailable(format!("no running {} agent", kind)))
    }

    pub fn overview(&self) -> Overview {
        let agents: Vec<AgentOverview> = self
            .manager
            .status_all()
            .into_iter()
            .map(|agent| {
                let source = self
                    .manager
                    .source_handle(&agent.id)
                    .map(|handle| handle.stats())
                    .unwrap_or(serde_json::Value::Null);
                AgentOverview { agent, source }
            })
            .collect();

        Overview {
            version: crate::VERSION.to_string(),
            started_at: self.started_at,
            uptime_secs: self.started.elapsed().as_secs(),
            agents_total: agents.len(),
            agents_running: agents
                .iter()
                .filter(|entry| entry.agent.state == AgentState::Running)
                .count(),
            agents,
            coordinator: self.coordinator.status(),
            subscribers: self.hub.subscriber_count(),
            recorder: self.recorder.as_ref().map(|recorder| recorder.stats()),
        }
    }

    pub fn hub(&self) -> &BroadcastHub {
        &self.hub
    }

    pub fn manager(&self) -> &Arc<AgentManager> {
        &self.manager
    }

    /// Bound address of the real-time server, if enabled
    pub fn server_addr(&self) -> Option<SocketAddr> {
        self.server_addr
    }

    /// Stop agents, drain the coordinator, then close clients and the recorder
    pub async fn shutdown(&self) {
        info!("Shutting down engine");
        self.cancel.cancel();

        self.manager.stop_all().await;
        self.coordinator.shutdown().await;

        self.pump_cancel.cancel();
        let tasks: Vec<_> = self.tasks.lock().await.drain(..).collect();
        for task in tasks {
            if let Err(e) = task.await {
                if !e.is_cancelled() {
                    warn!("Engine task ended abnormally: {}", e);
                }
            }
        }

        self.hub.shutdown();
        if let Some(recorder) = &self.recorder {
            recorder.shutdown().await;
        }
        info!("Engine stopped");
    }
}

/// Forward agent status changes to the hub and the recorder
async fn status_pump(
    mut rx: mpsc::UnboundedReceiver<AgentStatusChange>,
    hub: BroadcastHub,
    recorder: Option<Arc<Recorder>>,
    cancel: CancellationToken,
) {
    loop {
        // Pending changes win over cancellation so the final transitions are delivered
        let change = tokio::select! {
            biased;
            change = rx.recv() => match change {
                Some(change) => change,
                None => break,
            },
            _ = cancel.cancelled() => break,
        };

        hub.publish(ServerMessage::from(&change));
        if let Some(recorder) = &recorder {
            recorder.record(Record::AgentStatus(change)).await;
        }
    }
}

/// Forward coordinator alerts and mode changes to the hub and the recorder
async fn alert_pump(
    mut rx: mpsc::Receiver<CoordinatorEvent>,
    hub: BroadcastHub,
    recorder: Option<Arc<Recorder>>,
    cancel: CancellationToken,
) {
    loop {
        let event = tokio::select! {
            biased;
            event = rx.recv() => match event {
                Some(event) => event,
                None => break,
            },
            _ = cancel.cancelled() => break,
        };

        match event {
            CoordinatorEvent::Alert(alert) => {
                hub.publish(ServerMessage::from(alert.as_ref()));
                if let Some(recorder) = &recorder {
                    recorder.record(Record::Alert(alert)).await;
                }
            }
            CoordinatorEvent::Status(status) => {
                hub.publish(ServerMessage::coordinator(&status));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::recording::MemorySink;
    use serde_json::json;
    use std::net::{IpAddr, Ipv4Addr};
    use std::time::Duration;

    fn base_config() -> EngineConfig {
        let mut config = EngineConfig::default();
        config.server.enabled = false;
        config.recording.enabled = false;
        config.analysis.batch_max_wait_ms = 200;
        config
    }

    async fn engine_with(config: EngineConfig) -> (Engine, Arc<MemorySink>) {
        let sink = Arc::new(MemorySink::new());
        let engine = Engine::with_parts(config, None, Some(sink.clone()))
            .await
            .unwrap();
        (engine, sink)
    }

    async fn wait_for_alerts(engine: &Engine, sink: &MemorySink, n: usize) {
        for _ in 0..100 {
            if let Some(recorder) = &engine.recorder {
                recorder.flush().await;
            }
            if sink.alerts().len() >= n {
                return;
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
        panic!("expected {} alerts, got {}", n, sink.alerts().len());
    }

    #[tokio::test(start_paused = true)]
    async fn test_port_scan_flows_to_alert_and_records() {
        let mut config = base_config();
        config.agents = vec![AgentSpec::new("net-1", AgentKind::NetworkMonitor)];
        let (engine, sink) = engine_with(config).await;

        let net1 = AgentId::new("net-1");
        assert_eq!(engine.agent_status(&net1).unwrap().state, AgentState::Stopped);
        let agent = engine.start_agent(&net1).await.unwrap();
        assert_eq!(agent.state, AgentState::Running);

        let attacker = IpAddr::V4(Ipv4Addr::new(10, 0, 0, 66));
        let target = IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1));
        for port in 1..=11 {
            engine
                .ingest_packet(&net1, PacketSummary::tcp(attacker, target, 40000, port))
                .unwrap();
        }

        wait_for_alerts(&engine, &sink, 1).await;
        let alerts = sink.alerts();
        assert!(alerts[0].degraded);
        assert_eq!(alerts[0].classification, "port_scan");
        assert_eq!(alerts[0].event_ids[0].agent_id, net1);

        engine.shutdown().await;

        let states: Vec<AgentState> = sink
            .records()
            .iter()
            .filter_map(|record| match record {
                Record::AgentStatus(change) => Some(change.state),
                Record::Alert(_) => None,
            })
            .collect();
        assert_eq!(
            states,
            vec![
                AgentState::Starting,
                AgentState::Running,
                AgentState::Stopping,
                AgentState::Stopped
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_submit_simulation() {
        let mut config = base_config();
        config.agents = vec![AgentSpec {
            autostart: true,
            ..AgentSpec::new("sim-1", AgentKind::AttackSimulator)
        }];
        let (engine, sink) = engine_with(config).await;

        let rejected = engine.submit_simulation(SimulationJob::PortScan {
            target: "8.8.8.8".to_string(),
            ports: vec![],
        });
        assert!(matches!(rejected, Err(EngineError::SimulationRejected(_))));

        let too_long = engine.submit_simulation(SimulationJob::Ddos {
            target: "10.0.0.5".to_string(),
            duration_secs: 3600,
            packet_rate: 100,
        });
        assert!(matches!(too_long, Err(EngineError::SimulationRejected(_))));

        let agent = engine
            .submit_simulation(SimulationJob::PortScan {
                target: "10.0.0.5".to_string(),
                ports: vec![],
            })
            .unwrap();
        assert_eq!(agent.as_str(), "sim-1");

        wait_for_alerts(&engine, &sink, 1).await;
        assert_eq!(sink.alerts()[0].classification, "simulation.port_scan");
        engine.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_incident_requires_running_coordinator_agent() {
        let mut config = base_config();
        config.agents = vec![AgentSpec::new("ai-1", AgentKind::AiCoordinator)];
        let (engine, sink) = engine_with(config).await;

        let err = engine
            .submit_incident("brute_force", json!({ "attempts": 40 }))
            .unwrap_err();
        assert!(matches!(err, EngineError::SourceUnavailable(_)));

        engine.start_agent(&AgentId::new("ai-1")).await.unwrap();
        engine
            .submit_incident("brute_force", json!({ "attempts": 40, "severity": "critical" }))
            .unwrap();

        wait_for_alerts(&engine, &sink, 1).await;
        assert_eq!(sink.alerts()[0].severity, crate::model::Severity::Critical);
        engine.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_control_errors() {
        let mut config = base_config();
        config.agents = vec![AgentSpec::new("net-1", AgentKind::NetworkMonitor)];
        let (engine, _sink) = engine_with(config).await;

        let unknown = AgentId::new("nope");
        assert!(matches!(
            engine.start_agent(&unknown).await,
            Err(EngineError::UnknownAgent(_))
        ));
        assert!(matches!(
            engine.stop_agent(&AgentId::new("net-1")).await,
            Err(EngineError::InvalidTransition { .. })
        ));
        assert!(matches!(
            engine.register_agent(&AgentSpec::new("net-1", AgentKind::NetworkMonitor)),
            Err(EngineError::DuplicateAgent(_))
        ));

        engine.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_autostart_failure_leaves_agent_in_error() {
        let mut spec = AgentSpec::new("net-1", AgentKind::NetworkMonitor);
        spec.autostart = true;
        spec.network.interface = None;
        let mut config = base_config();
        config.agents = vec![spec];
        let (engine, _sink) = engine_with(config).await;

        let agent = engine.agent_status(&AgentId::new("net-1")).unwrap();
        assert_eq!(agent.state, AgentState::Error);
        assert!(agent.error.is_some());
        assert!(engine.coordinator.is_degraded());

        engine.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_overview() {
        let mut config = base_config();
        config.agents = vec![
            AgentSpec {
                autostart: true,
                ..AgentSpec::new("net-1", AgentKind::NetworkMonitor)
            },
            AgentSpec::new("sim-1", AgentKind::AttackSimulator),
        ];
        let (engine, _sink) = engine_with(config).await;

        let overview = engine.overview();
        assert_eq!(overview.agents_total, 2);
        assert_eq!(overview.agents_running, 1);
        assert_eq!(overview.agents[0].agent.id.as_str(), "net-1");
        assert_eq!(overview.agents[0].source["total_packets"], 0);
        assert!(overview.coordinator.degraded);
        assert!(overview.recorder.is_some());

        let json = serde_json::to_value(&overview).unwrap();
        assert_eq!(json["agents"][0]["id"], "net-1");

        engine.shutdown().await;
    }

    #[tokio::test]
    async fn test_failed_start_releases_sink() {
        let busy = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let mut config = base_config();
        config.server.enabled = true;
        config.server.port = busy.local_addr().unwrap().port();

        let sink = Arc::new(MemorySink::new());
        let sink_dyn: Arc<dyn RecordSink> = sink.clone();
        assert!(Engine::with_parts(config, None, Some(sink_dyn)).await.is_err());

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(Arc::strong_count(&sink), 1);
    }

    #[tokio::test]
    async fn test_blank_agent_name_rejected_before_start() {
        let mut config = base_config();
        config.agents = vec![AgentSpec::new("   ", AgentKind::NetworkMonitor)];

        let sink = Arc::new(MemorySink::new());
        let sink_dyn: Arc<dyn RecordSink> = sink.clone();
        let err = Engine::with_parts(config, None, Some(sink_dyn)).await.err();
        assert!(matches!(err, Some(EngineError::Config(_))));

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(Arc::strong_count(&sink), 1);
    }

    #[tokio::test]
    async fn test_realtime_server_bound_when_enabled() {
        let mut config = base_config();
        config.server.enabled = true;
        config.server.port = 0;
        let (engine, _sink) = engine_with(config).await;

        assert!(engine.server_addr().is_some());
        engine.shutdown().await;
    }
}
