//! Gateway Detector — identifies the LAN's router(s) so the Topology
//! Graph can classify connections relative to them.
//!
//! Strategy order mirrors `netdev`'s own fallback chain where it exists
//! (its Linux backend already reads `/proc/net/route`, so the platform
//! routing-table query subsumes the spec's separate "parse
//! `/proc/net/route`" step) and falls through to ARP-destination-diversity,
//! then packet-count, when the platform query comes up empty — e.g. in a
//! container with no default route configured.

use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio::sync::mpsc;

use crate::events::RuntimeEvent;
use crate::graph::TopologyGraph;
use crate::model::GatewayRole;

/// How long a detected gateway is trusted before the next scheduled
/// refresh re-derives it from scratch.
pub const REFRESH_INTERVAL_SECS: u64 = 60;

#[derive(Debug, Clone)]
struct CachedGateway {
    key: String,
    role: GatewayRole,
    detected_at: Instant,
}

/// Tracks, per observed ARP sender MAC, the set of distinct target IPs
/// it has resolved — the fallback signal for strategy 3.
#[derive(Debug, Default)]
struct ArpDiversityTable {
    targets_by_mac: HashMap<String, std::collections::HashSet<Ipv4Addr>>,
}

impl ArpDiversityTable {
    fn record(&mut self, mac: &str, target: Ipv4Addr) {
        self.targets_by_mac.entry(mac.to_string()).or_default().insert(target);
    }

    fn most_diverse(&self) -> Option<&str> {
        self.targets_by_mac
            .iter()
            .max_by_key(|(_, targets)| targets.len())
            .filter(|(_, targets)| targets.len() > 1)
            .map(|(mac, _)| mac.as_str())
    }
}

/// Holds the cached gateway and the ARP-diversity table that backs the
/// inference fallback. One instance per capture session, shared behind
/// an `Arc<Mutex<_>>` with the ingest loop.
#[derive(Debug, Default)]
pub struct GatewayDetector {
    cached: Option<CachedGateway>,
    arp_table: ArpDiversityTable,
}

impl GatewayDetector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record an ARP observation for strategy 3. Called from the Packet
    /// Ingest loop on every ARP frame.
    pub fn record_arp_observation(&mut self, sender_mac: &str, target_ip: Ipv4Addr) {
        self.arp_table.record(sender_mac, target_ip);
    }

    /// Invalidate the cached gateway so the next refresh re-derives it —
    /// call this when the OS reports a network-address change.
    pub fn invalidate(&mut self) {
        self.cached = None;
    }

    fn needs_refresh(&self) -> bool {
        match &self.cached {
            None => true,
            Some(cached) => cached.detected_at.elapsed() >= Duration::from_secs(REFRESH_INTERVAL_SECS),
        }
    }

    /// Re-derive the gateway if the cache is stale or was invalidated,
    /// then apply the result to the graph and trigger reclassification.
    /// Cheap no-op when the cache is still fresh.
    pub async fn maybe_refresh(&mut self, graph: &Arc<Mutex<TopologyGraph>>, events: &mpsc::Sender<RuntimeEvent>) {
        if !self.needs_refresh() {
            return;
        }

        let mut g = graph.lock();
        g.clear_gateway_flags();

        // Strategy 1: platform routing table, resolved to a device by the
        // gateway's IP. Strategy 3: ARP-diversity, already keyed by MAC.
        let resolved = detect_platform_gateway()
            .and_then(|ip| ip.parse::<Ipv4Addr>().ok())
            .and_then(|ip| g.device_by_ip(ip))
            .map(|d| (d.key.clone(), GatewayRole::Default))
            .or_else(|| self.arp_table.most_diverse().map(|mac| (mac.to_string(), GatewayRole::DefaultInferred)))
            .or_else(|| highest_packet_count_device(&g).map(|key| (key, GatewayRole::Secondary)));

        if let Some((key, role)) = resolved.clone() {
            g.set_gateway_role(&key, role);
        }
        let changed = g.update_connection_types();
        drop(g);

        if let Some((key, role)) = resolved {
            self.cached = Some(CachedGateway { key: key.clone(), role, detected_at: Instant::now() });
            let _ = events.send(RuntimeEvent::GatewayChanged { key, role: role.label().to_string() }).await;
        }
        if changed > 0 {
            let _ = events
                .send(RuntimeEvent::log(log::Level::Debug, format!("reclassified {changed} connections after gateway refresh")))
                .await;
        }
    }
}

/// Strategy 1: ask `netdev` for the default gateway of the
/// highest-speed operational non-loopback interface. `netdev`'s Linux
/// backend already parses `/proc/net/route` internally, so there is no
/// separate strategy-2 fallback here — a `netdev` miss falls straight
/// through to ARP-diversity inference.
fn detect_platform_gateway() -> Option<String> {
    let interfaces = netdev::get_interfaces();
    let best = interfaces
        .into_iter()
        .filter(|i| !i.is_loopback() && i.is_up())
        .max_by_key(|i| i.transmit_speed.unwrap_or(0))?;

    let gateway = best.gateway?;
    gateway.ipv4.first().map(|ip| ip.to_string())
}

fn highest_packet_count_device(graph: &TopologyGraph) -> Option<String> {
    graph
        .tiers()
        .local
        .into_iter()
        .max_by_key(|d| d.packet_count)
        .map(|d| d.key.clone())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn arp_diversity_picks_highest_fanout_mac() {
        let mut table = ArpDiversityTable::default();
        table.record("aa:bb:cc:dd:ee:01", "192.168.1.10".parse().unwrap());
        table.record("aa:bb:cc:dd:ee:01", "192.168.1.11".parse().unwrap());
        table.record("aa:bb:cc:dd:ee:02", "192.168.1.12".parse().unwrap());
        assert_eq!(table.most_diverse(), Some("aa:bb:cc:dd:ee:01"));
    }

    #[test]
    fn single_target_mac_is_not_considered_a_gateway() {
        let mut table = ArpDiversityTable::default();
        table.record("aa:bb:cc:dd:ee:01", "192.168.1.10".parse().unwrap());
        assert_eq!(table.most_diverse(), None);
    }

    #[test]
    fn invalidate_forces_next_refresh() {
        let mut detector = GatewayDetector::new();
        detector.cached = Some(CachedGateway {
            key: "aa:bb:cc:dd:ee:01".to_string(),
            role: GatewayRole::Default,
            detected_at: Instant::now(),
        });
        assert!(!detector.needs_refresh());
        detector.invalidate();
        assert!(detector.needs_refresh());
    }
}
