// packages/engine/src/sources/network_monitor.rs
//! Network monitor source
//!
//! Consumes packet summaries from a capture feed and reports suspicious
//! traffic:
//!
//! - **port_scan**: one source IP touched more than `port_scan_threshold`
//!   distinct TCP destination ports
//! - **icmp_flood**: one source IP sent more than `icmp_flood_threshold` ICMP
//!   packets (reported once per threshold-sized burst)
//!
//! Detector memory is bounded by `max_tracked_sources`; when it fills up the
//! least recently seen half of the sources is forgotten.

use super::{EventSource, Observation, SourceFeed};
use crate::utils::config::NetworkMonitorConfig;
use crate::utils::errors::{EngineError, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::net::IpAddr;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Protocol {
    Tcp,
    Udp,
    Icmp,
    Arp,
    Other,
}

/// Opaque packet summary produced by a capture driver
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PacketSummary {
    pub source_ip: Option<IpAddr>,
    pub dest_ip: Option<IpAddr>,
    pub protocol: Protocol,
    pub src_port: Option<u16>,
    pub dst_port: Option<u16>,
}

impl PacketSummary {
    pub fn tcp(source: IpAddr, dest: IpAddr, src_port: u16, dst_port: u16) -> Self {
        Self {
            source_ip: Some(source),
            dest_ip: Some(dest),
            protocol: Protocol::Tcp,
            src_port: Some(src_port),
            dst_port: Some(dst_port),
        }
    }

    pub fn icmp(source: IpAddr, dest: IpAddr) -> Self {
        Self {
            source_ip: Some(source),
            dest_ip: Some(dest),
            protocol: Protocol::Icmp,
            src_port: None,
            dst_port: None,
        }
    }
}

/// Traffic counters kept across restarts
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TrafficStats {
    pub total_packets: u64,
    pub protocol_distribution: BTreeMap<Protocol, u64>,

    /// Source IPs currently tracked by the detector
    pub active_ips: usize,

    pub detections: u64,
}

#[derive(Debug, Default)]
struct SourceState {
    ports: BTreeSet<u16>,
    icmp_packets: u64,
    last_seen: u64,
}

/// Per-source detection state
#[derive(Debug, Default)]
struct Detector {
    sources: HashMap<IpAddr, SourceState>,
    clock: u64,
}

impl Detector {
    fn tracked(&self) -> usize {
        self.sources.len()
    }

    fn track(&mut self, source: IpAddr, limit: usize) -> &mut SourceState {
        let limit = limit.max(1);
        if self.sources.len() >= limit && !self.sources.contains_key(&source) {
            self.evict(limit / 2);
        }
        self.clock += 1;
        let state = self.sources.entry(source).or_default();
        state.last_seen = self.clock;
        state
    }

    /// Keep only the `keep` most recently seen sources
    fn evict(&mut self, keep: usize) {
        let mut seen: Vec<u64> = self.sources.values().map(|s| s.last_seen).collect();
        seen.sort_unstable_by(|a, b| b.cmp(a));
        let cutoff = match keep {
            0 => u64::MAX,
            n => seen.get(n - 1).copied().unwrap_or(0),
        };
        let before = self.sources.len();
        self.sources.retain(|_, state| state.last_seen >= cutoff);
        debug!("Detector forgot {} idle sources", before - self.sources.len());
    }

    fn inspect(&mut self, packet: &PacketSummary, config: &NetworkMonitorConfig) -> Option<Observation> {
        let source = packet.source_ip?;
        if !matches!(packet.protocol, Protocol::Tcp | Protocol::Icmp) {
            return None;
        }
        if packet.protocol == Protocol::Tcp && packet.dst_port.is_none() {
            return None;
        }
        let state = self.track(source, config.max_tracked_sources);

        match packet.protocol {
            Protocol::Tcp => {
                let port = packet.dst_port?;
                let ports = &mut state.ports;
                // Only a newly seen port past the threshold is a new finding
                if !ports.insert(port) || ports.len() <= config.port_scan_threshold {
                    return None;
                }
                Some(Observation::new(
                    "port_scan",
                    json!({
                        "source_ip": source,
                        "dest_ip": packet.dest_ip,
                        "protocol": packet.protocol,
                        "src_port": packet.src_port,
                        "dst_port": port,
                        "ports_scanned": ports.iter().collect::<Vec<_>>(),
                        "severity": "high",
                    }),
                ))
            }
            Protocol::Icmp => {
                let count = &mut state.icmp_packets;
                *count += 1;
                let threshold = config.icmp_flood_threshold.max(1);
                if *count <= threshold || (*count - threshold - 1) % threshold != 0 {
                    return None;
                }
                Some(Observation::new(
                    "icmp_flood",
                    json!({
                        "source_ip": source,
                        "dest_ip": packet.dest_ip,
                        "protocol": packet.protocol,
                        "packet_count": *count,
                        "severity": "medium",
                    }),
                ))
            }
            Protocol::Udp | Protocol::Arp | Protocol::Other => None,
        }
    }
}

/// Network monitor event source
pub struct NetworkMonitorSource {
    config: NetworkMonitorConfig,
    feed: SourceFeed<PacketSummary>,
    rx: Option<mpsc::Receiver<PacketSummary>>,
    detector: Detector,
    stats: Arc<Mutex<TrafficStats>>,
}

impl NetworkMonitorSource {
    pub fn new(config: NetworkMonitorConfig, feed: SourceFeed<PacketSummary>) -> Self {
        Self {
            config,
            feed,
            rx: None,
            detector: Detector::default(),
            stats: Arc::new(Mutex::new(TrafficStats::default())),
        }
    }

    pub fn stats_handle(&self) -> Arc<Mutex<TrafficStats>> {
        Arc::clone(&self.stats)
    }

    fn record(&self, packet: &PacketSummary, detected: bool) {
        let mut stats = self.stats.lock();
        stats.total_packets += 1;
        *stats.protocol_distribution.entry(packet.protocol).or_insert(0) += 1;
        stats.active_ips = self.detector.tracked();
        if detected {
            stats.detections += 1;
        }
    }
}

#[async_trait]
impl EventSource for NetworkMonitorSource {
    async fn open(&mut self) -> Result<()> {
        let interface = match self.config.interface.as_deref() {
            Some(name) if !name.trim().is_empty() => name.to_string(),
            _ => {
                return Err(EngineError::SourceUnavailable(
                    "no capture interface configured".to_string(),
                ))
            }
        };

        self.detector = Detector::default();
        self.rx = Some(self.feed.attach());
        info!("Network monitor capturing on interface {}", interface);
        Ok(())
    }

    async fn next(&mut self) -> Result<Option<Observation>> {
        loop {
            let received = match self.rx.as_mut() {
                Some(rx) => rx.recv().await,
                None => return Ok(None),
            };
            let Some(packet) = received else {
                debug!("Capture feed ended");
                return Ok(None);
            };

            let observation = self.detector.inspect(&packet, &self.config);
            self.record(&packet, observation.is_some());

            if let Some(observation) = observation {
                warn!(
                    "Detected {} from {}",
                    observation.kind,
                    packet.source_ip.map(|ip| ip.to_string()).unwrap_or_default()
                );
                return Ok(Some(observation));
            }
        }
    }

    async fn close(&mut self) {
        self.feed.detach();
        self.rx = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    fn ip(last: u8) -> IpAddr {
        IpAddr::V4(Ipv4Addr::new(192, 168, 1, last))
    }

    #[test]
    fn test_port_scan_detected_past_threshold() {
        let config = NetworkMonitorConfig::default();
        let mut detector = Detector::default();

        for port in 1..=10 {
            assert!(detector
                .inspect(&PacketSummary::tcp(ip(5), ip(1), 40000, port), &config)
                .is_none());
        }
        // Repeating a known port is not a new finding
        assert!(detector
            .inspect(&PacketSummary::tcp(ip(5), ip(1), 40000, 3), &config)
            .is_none());

        let obs = detector
            .inspect(&PacketSummary::tcp(ip(5), ip(1), 40000, 11), &config)
            .unwrap();
        assert_eq!(obs.kind, "port_scan");
        assert_eq!(obs.payload["severity"], "high");
        assert_eq!(obs.payload["ports_scanned"].as_array().unwrap().len(), 11);
    }

    #[test]
    fn test_icmp_flood_reported_once_per_burst() {
        let config = NetworkMonitorConfig {
            icmp_flood_threshold: 5,
            ..Default::default()
        };
        let mut detector = Detector::default();

        let hits: Vec<usize> = (1..=16)
            .filter(|_| {
                detector
                    .inspect(&PacketSummary::icmp(ip(9), ip(1)), &config)
                    .is_some()
            })
            .enumerate()
            .map(|(i, _)| i)
            .collect();
        // Packets 6, 11 and 16 cross a burst boundary
        assert_eq!(hits.len(), 3);
    }

    #[test]
    fn test_detector_memory_bounded() {
        let config = NetworkMonitorConfig {
            max_tracked_sources: 8,
            ..Default::default()
        };
        let mut detector = Detector::default();

        // Source 1 stays active while 100 others come and go
        for n in 2..=101u8 {
            detector.inspect(&PacketSummary::tcp(ip(1), ip(200), 4000, u16::from(n)), &config);
            detector.inspect(&PacketSummary::tcp(ip(n), ip(200), 4000, 80), &config);
            assert!(detector.tracked() <= 8);
        }
        assert!(detector.sources.contains_key(&ip(1)));
        assert!(!detector.sources.contains_key(&ip(2)));
        assert_eq!(detector.sources[&ip(1)].ports.len(), 100);
    }

    #[tokio::test]
    async fn test_open_without_interface_fails() {
        let config = NetworkMonitorConfig {
            interface: None,
            ..Default::default()
        };
        let mut source = NetworkMonitorSource::new(config, SourceFeed::new(8));
        assert!(matches!(
            source.open().await,
            Err(EngineError::SourceUnavailable(_))
        ));
    }

    #[tokio::test]
    async fn test_next_skips_benign_packets() {
        let feed = SourceFeed::new(64);
        let config = NetworkMonitorConfig {
            port_scan_threshold: 2,
            ..Default::default()
        };
        let mut source = NetworkMonitorSource::new(config, feed.clone());
        source.open().await.unwrap();

        for port in [22, 80, 443] {
            feed.push(PacketSummary::tcp(ip(7), ip(1), 5555, port))
                .await
                .unwrap();
        }

        let obs = source.next().await.unwrap().unwrap();
        assert_eq!(obs.kind, "port_scan");

        let stats = source.stats_handle().lock().clone();
        assert_eq!(stats.total_packets, 3);
        assert_eq!(stats.detections, 1);
        assert_eq!(stats.protocol_distribution.get(&Protocol::Tcp), Some(&3));

        source.close().await;
        assert!(source.next().await.unwrap().is_none());
    }
}
