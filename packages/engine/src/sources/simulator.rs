// packages/engine/src/sources/simulator.rs
//! Attack simulator source
//!
//! Accepts controlled simulation jobs and reports each one as an observation.
//! Targets are restricted to private and loopback ranges.

use super::{EventSource, Observation, SourceFeed};
use crate::utils::config::SimulationConfig;
use crate::utils::errors::{EngineError, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::net::IpAddr;
use tokio::sync::mpsc;
use tracing::info;

/// Ports probed when a port scan job names none
pub const DEFAULT_SCAN_PORTS: [u16; 8] = [21, 22, 23, 25, 80, 443, 3389, 8080];

/// Simulation job accepted by the control surface
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SimulationJob {
    PortScan {
        target: String,
        #[serde(default)]
        ports: Vec<u16>,
    },
    Ddos {
        target: String,
        #[serde(default = "default_ddos_duration")]
        duration_secs: u64,
        #[serde(default = "default_packet_rate")]
        packet_rate: u32,
    },
    PingSweep {
        /// CIDR, e.g. `192.168.1.0/24`
        network: String,
    },
}

fn default_ddos_duration() -> u64 {
    10
}

fn default_packet_rate() -> u32 {
    100
}

impl SimulationJob {
    pub fn name(&self) -> &'static str {
        match self {
            SimulationJob::PortScan { .. } => "port_scan",
            SimulationJob::Ddos { .. } => "ddos",
            SimulationJob::PingSweep { .. } => "ping_sweep",
        }
    }

    /// Check the job against the simulation policy
    pub fn validate(&self, config: &SimulationConfig) -> Result<()> {
        if !config.enabled {
            return Err(EngineError::SimulationRejected(
                "attack simulation is disabled".to_string(),
            ));
        }

        match self {
            SimulationJob::PortScan { target, .. } => check_target(target),
            SimulationJob::Ddos {
                target,
                duration_secs,
                ..
            } => {
                check_target(target)?;
                if *duration_secs > config.max_duration_secs {
                    return Err(EngineError::SimulationRejected(format!(
                        "duration {}s exceeds limit of {}s",
                        duration_secs, config.max_duration_secs
                    )));
                }
                Ok(())
            }
            SimulationJob::PingSweep { network } => {
                let (addr, prefix) = network.split_once('/').ok_or_else(|| {
                    EngineError::SimulationRejected(format!("invalid network {}", network))
                })?;
                let max_prefix = if addr.contains(':') { 128 } else { 32 };
                match prefix.parse::<u8>() {
                    Ok(p) if p <= max_prefix => check_target(addr),
                    _ => Err(EngineError::SimulationRejected(format!(
                        "invalid prefix length in {}",
                        network
                    ))),
                }
            }
        }
    }

    fn into_observation(self) -> Observation {
        let kind = format!("simulation.{}", self.name());
        let simulation_id = ulid::Ulid::new().to_string();
        let payload = match &self {
            SimulationJob::PortScan { target, ports } => {
                let ports = if ports.is_empty() {
                    DEFAULT_SCAN_PORTS.to_vec()
                } else {
                    ports.clone()
                };
                json!({
                    "simulation_id": simulation_id,
                    "target": target,
                    "ports": ports,
                    "total_ports": ports.len(),
                    "severity": "high",
                })
            }
            SimulationJob::Ddos {
                target,
                duration_secs,
                packet_rate,
            } => json!({
                "simulation_id": simulation_id,
                "target": target,
                "duration_seconds": duration_secs,
                "packet_rate": packet_rate,
                "severity": "medium",
            }),
            SimulationJob::PingSweep { network } => json!({
                "simulation_id": simulation_id,
                "network": network,
                "severity": "low",
            }),
        };
        Observation::new(kind, payload)
    }
}

fn check_target(target: &str) -> Result<()> {
    let ip: IpAddr = target
        .trim()
        .parse()
        .map_err(|_| EngineError::SimulationRejected(format!("invalid target {}", target)))?;

    if is_private_or_loopback(&ip) {
        Ok(())
    } else {
        Err(EngineError::SimulationRejected(format!(
            "target {} is not a private or loopback address",
            target
        )))
    }
}

fn is_private_or_loopback(ip: &IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => v4.is_private() || v4.is_loopback(),
        // fc00::/7 unique local
        IpAddr::V6(v6) => v6.is_loopback() || (v6.segments()[0] & 0xfe00) == 0xfc00,
    }
}

/// Attack simulator event source
pub struct AttackSimulatorSource {
    feed: SourceFeed<SimulationJob>,
    rx: Option<mpsc::Receiver<SimulationJob>>,
}

impl AttackSimulatorSource {
    pub fn new(feed: SourceFeed<SimulationJob>) -> Self {
        Self { feed, rx: None }
    }
}

#[async_trait]
impl EventSource for AttackSimulatorSource {
    async fn open(&mut self) -> Result<()> {
        self.rx = Some(self.feed.attach());
        info!("Attack simulator ready for jobs");
        Ok(())
    }

    async fn next(&mut self) -> Result<Option<Observation>> {
        let Some(rx) = self.rx.as_mut() else {
            return Ok(None);
        };
        Ok(rx.recv().await.map(|job| {
            info!("Running {} simulation", job.name());
            job.into_observation()
        }))
    }

    async fn close(&mut self) {
        self.feed.detach();
        self.rx = None;
    }
}
