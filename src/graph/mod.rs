//! Topology Graph — the single owner of devices and connections.
//!
//! Backed by `petgraph::stable_graph::StableDiGraph` so eviction doesn't
//! invalidate indices held by in-flight operations, with two secondary
//! `HashMap` indices (`mac_lc -> NodeIndex`, `ip -> mac_lc`) mirroring the
//! teacher's `DiscoveredPeers` map style (`Arc<RwLock<HashMap<...>>>`).

use std::collections::HashMap;
use std::net::Ipv4Addr;

use petgraph::dot::{Config as DotConfig, Dot};
use petgraph::stable_graph::{EdgeIndex, NodeIndex, StableDiGraph};
use petgraph::visit::EdgeRef;
use petgraph::Direction;

use crate::model::{now_unix_secs, Connection, ConnectionType, Device, GatewayRole};

pub const EVICTION_IDLE_SECS: u64 = 120;
pub const RATE_WINDOW_SECS: u64 = 30;

#[derive(Debug, Default)]
pub struct TopologyGraph {
    graph: StableDiGraph<Device, Connection>,
    mac_index: HashMap<String, NodeIndex>,
    ip_index: HashMap<Ipv4Addr, String>,
}

/// A partition of devices into the three visualization tiers.
pub struct TopologyTiers<'a> {
    pub remote_virtual: Vec<&'a Device>,
    pub gateways: Vec<&'a Device>,
    pub local: Vec<&'a Device>,
}

impl TopologyGraph {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn node_count(&self) -> usize {
        self.graph.node_count()
    }

    pub fn edge_count(&self) -> usize {
        self.graph.edge_count()
    }

    pub fn device_by_key(&self, key: &str) -> Option<&Device> {
        self.mac_index
            .get(key)
            .and_then(|idx| self.graph.node_weight(*idx))
            .or_else(|| self.node_index_for_virtual_key(key).and_then(|idx| self.graph.node_weight(idx)))
    }

    fn node_index_for_virtual_key(&self, key: &str) -> Option<NodeIndex> {
        self.mac_index.get(key).copied()
    }

    pub fn device_by_ip(&self, ip: Ipv4Addr) -> Option<&Device> {
        self.ip_index.get(&ip).and_then(|mac| self.device_by_key(mac))
    }

    /// Look up the single edge keyed by `(src, dst, protocol)`, e.g. for a
    /// persistence sink writing through a just-emitted `ConnectionDetected`.
    pub fn connection_between(&self, src_key: &str, dst_key: &str, protocol: &str) -> Option<&Connection> {
        let src_idx = *self.mac_index.get(src_key)?;
        let dst_idx = *self.mac_index.get(dst_key)?;
        let edge_idx = self.find_edge(src_idx, dst_idx, protocol)?;
        self.graph.edge_weight(edge_idx)
    }

    /// Insert a brand-new device or delegate to [`Self::update_device`] if
    /// its key is already present.
    pub fn add_device(&mut self, device: Device) -> NodeIndex {
        if let Some(&idx) = self.mac_index.get(&device.key) {
            self.apply_update(idx, device);
            return idx;
        }
        if let Some(ip) = device.ip {
            self.ip_index.insert(ip, device.key.clone());
        }
        let key = device.key.clone();
        let idx = self.graph.add_node(device);
        self.mac_index.insert(key, idx);
        idx
    }

    /// Copy mutable fields from `incoming` onto the existing device at
    /// `key`, rewriting the IP index if the address changed. No-op if the
    /// key isn't present.
    pub fn update_device(&mut self, key: &str, incoming: &Device) {
        if let Some(&idx) = self.mac_index.get(key) {
            self.apply_update(idx, incoming.clone());
        }
    }

    fn apply_update(&mut self, idx: NodeIndex, incoming: Device) {
        let old_ip = self.graph.node_weight(idx).and_then(|d| d.ip);
        if let Some(existing) = self.graph.node_weight_mut(idx) {
            if let Some(ip) = incoming.ip {
                existing.ip = Some(ip);
            }
            if incoming.hostname.is_some() {
                existing.hostname = incoming.hostname;
            }
            if incoming.vendor.is_some() {
                existing.vendor = incoming.vendor;
            }
            if incoming.friendly_name.is_some() {
                existing.friendly_name = incoming.friendly_name;
            }
            existing.last_seen = existing.last_seen.max(incoming.last_seen);
            existing.packet_count += incoming.packet_count;
            existing.byte_count += incoming.byte_count;
            existing.open_ports.extend(incoming.open_ports);
        }
        if let Some(new_ip) = self.graph.node_weight(idx).and_then(|d| d.ip) {
            if old_ip != Some(new_ip) {
                if let Some(old) = old_ip {
                    self.ip_index.remove(&old);
                }
                if let Some(key) = self.graph.node_weight(idx).map(|d| d.key.clone()) {
                    self.ip_index.insert(new_ip, key);
                }
            }
        }
    }

    /// Rewrite a device's key (and MAC identity) in place, keeping its
    /// `NodeIndex` (and thus any edges already attached to it) intact.
    /// Used to upgrade a scan-pending placeholder to its real MAC once
    /// packet ingest observes it, so the vertex created by the ping
    /// sweeper survives rather than a second node being added for the
    /// same IP.
    pub fn rekey_device(&mut self, old_key: &str, new_mac: crate::model::MacAddr) -> bool {
        let Some(idx) = self.mac_index.remove(old_key) else { return false };
        let new_key = new_mac.as_str().to_string();
        if let Some(device) = self.graph.node_weight_mut(idx) {
            device.key = new_key.clone();
            device.mac = Some(new_mac);
            device.is_virtual = false;
            if let Some(ip) = device.ip {
                self.ip_index.insert(ip, new_key.clone());
            }
        }
        self.mac_index.insert(new_key, idx);
        true
    }

    fn find_edge(&self, src: NodeIndex, dst: NodeIndex, protocol: &str) -> Option<EdgeIndex> {
        self.graph
            .edges_connecting(src, dst)
            .find(|e| e.weight().protocol == protocol)
            .map(|e| e.id())
    }

    /// Ensure both endpoints exist, then merge into the `(src, dst, proto)`
    /// edge: bump counters, leave `first_seen` and TLSPeer stickiness alone.
    pub fn add_connection(
        &mut self,
        src_device: Device,
        dst_device: Device,
        protocol: &str,
        source_port: Option<u16>,
        destination_port: Option<u16>,
        bytes: u64,
        ttl: Option<u8>,
    ) -> bool {
        let src_idx = self.add_device(src_device.clone());
        let dst_idx = self.add_device(dst_device.clone());
        let now = now_unix_secs();

        if let Some(edge_idx) = self.find_edge(src_idx, dst_idx, protocol) {
            if let Some(conn) = self.graph.edge_weight_mut(edge_idx) {
                conn.observe(bytes, ttl, now);
            }
            false
        } else {
            let mut conn = Connection::new(
                src_device.key.clone(),
                dst_device.key.clone(),
                protocol.to_string(),
                source_port,
                destination_port,
                now,
            );
            conn.observe(bytes, ttl, now);
            self.graph.add_edge(src_idx, dst_idx, conn);
            true
        }
    }

    /// Apply a freshly computed classification to a specific edge,
    /// respecting TLSPeer stickiness (handled inside `Connection::set_connection_type`).
    pub fn set_edge_type_if_unset(&mut self, src_key: &str, dst_key: &str, protocol: &str, kind: ConnectionType) {
        if let (Some(&src_idx), Some(&dst_idx)) =
            (self.mac_index.get(src_key), self.mac_index.get(dst_key))
        {
            if let Some(edge_idx) = self.find_edge(src_idx, dst_idx, protocol) {
                if let Some(conn) = self.graph.edge_weight_mut(edge_idx) {
                    conn.set_connection_type(kind);
                }
            }
        }
    }

    /// Mark the `(src, dst)` edge(s) for `protocol` as carrying the TLS
    /// overlay. Sticky — never reverted by `classify_connection`.
    pub fn mark_tls_peer_connection(&mut self, src_key: &str, dst_key: &str, protocol: &str) {
        if let (Some(&src_idx), Some(&dst_idx)) =
            (self.mac_index.get(src_key), self.mac_index.get(dst_key))
        {
            if let Some(edge_idx) = self.find_edge(src_idx, dst_idx, protocol) {
                if let Some(conn) = self.graph.edge_weight_mut(edge_idx) {
                    conn.mark_tls_peer();
                }
            }
        }
    }

    /// Remove vertices idle past [`EVICTION_IDLE_SECS`], together with
    /// incident edges and index entries. Returns the keys of every evicted
    /// device, so a caller can write the deletions through to persistence.
    pub fn cleanup_inactive_devices(&mut self) -> Vec<String> {
        let now = now_unix_secs();
        let stale: Vec<NodeIndex> = self
            .graph
            .node_indices()
            .filter(|&idx| {
                self.graph
                    .node_weight(idx)
                    .map(|d| now.saturating_sub(d.last_seen) > EVICTION_IDLE_SECS)
                    .unwrap_or(false)
            })
            .collect();

        let mut evicted_keys = Vec::with_capacity(stale.len());
        for idx in &stale {
            if let Some(device) = self.graph.node_weight(*idx) {
                self.mac_index.remove(&device.key);
                if let Some(ip) = device.ip {
                    self.ip_index.remove(&ip);
                }
                evicted_keys.push(device.key.clone());
            }
        }
        for idx in &stale {
            self.graph.remove_node(*idx);
        }
        evicted_keys
    }

    /// For every edge whose rate window has expired, reset
    /// `recent_packet_count` to zero.
    pub fn reset_connection_rates(&mut self) {
        let now = now_unix_secs();
        for edge in self.graph.edge_weights_mut() {
            if now.saturating_sub(edge.last_rate_update) >= RATE_WINDOW_SECS {
                edge.reset_rate_window(now);
            }
        }
    }

    /// Classify a connection per the gateway-relative TTL heuristic. The
    /// TLSPeer case is handled by the caller (ingest already knows the port).
    pub fn classify_connection(
        destination_is_virtual: bool,
        destination_is_local: bool,
        ttl: Option<u8>,
    ) -> ConnectionType {
        if destination_is_virtual {
            return ConnectionType::Internet;
        }
        if destination_is_local {
            return match ttl {
                Some(ttl) if ttl >= 62 => ConnectionType::DirectL2,
                Some(ttl) if ttl >= 50 => ConnectionType::RoutedL3,
                _ => ConnectionType::Internet,
            };
        }
        ConnectionType::Internet
    }

    /// Reclassify every edge using the current device flags. Returns the
    /// number of edges whose type changed.
    pub fn update_connection_types(&mut self) -> usize {
        let snapshot: Vec<(EdgeIndex, NodeIndex, NodeIndex)> = self
            .graph
            .edge_indices()
            .filter_map(|e| self.graph.edge_endpoints(e).map(|(s, d)| (e, s, d)))
            .collect();

        let mut changed = 0;
        for (edge_idx, src_idx, dst_idx) in snapshot {
            let dst_is_virtual = self.graph.node_weight(dst_idx).map(|d| d.is_virtual).unwrap_or(false);
            let dst_is_local = self
                .graph
                .node_weight(dst_idx)
                .and_then(|d| d.ip)
                .map(crate::address::is_local)
                .unwrap_or(false);
            let _ = src_idx;

            let ttl = self.graph.edge_weight(edge_idx).map(|c| {
                if c.ttl.count == 0 {
                    None
                } else {
                    Some(c.ttl.avg_ttl().round() as u8)
                }
            }).flatten();

            let new_type = Self::classify_connection(dst_is_virtual, dst_is_local, ttl);
            if let Some(conn) = self.graph.edge_weight_mut(edge_idx) {
                let before = conn.connection_type;
                conn.set_connection_type(new_type);
                if conn.connection_type != before {
                    changed += 1;
                }
            }
        }
        changed
    }

    /// Bulk import from a peer overlay session: add-or-update devices then
    /// connections. New data never overwrites a fresher `last_seen`.
    pub fn merge_graph(&mut self, devices: Vec<Device>, connections: Vec<Connection>) {
        for device in devices {
            if let Some(existing) = self.device_by_key(&device.key) {
                if existing.last_seen >= device.last_seen {
                    continue;
                }
            }
            self.add_device(device);
        }
        for conn in connections {
            let (Some(src), Some(dst)) = (
                self.mac_index.get(&conn.source_key).copied(),
                self.mac_index.get(&conn.destination_key).copied(),
            ) else {
                continue;
            };
            if let Some(edge_idx) = self.find_edge(src, dst, &conn.protocol) {
                if let Some(existing) = self.graph.edge_weight_mut(edge_idx) {
                    if conn.last_seen > existing.last_seen {
                        existing.last_seen = conn.last_seen;
                        existing.packet_count += conn.packet_count;
                        existing.byte_count += conn.byte_count;
                    }
                }
            } else {
                self.graph.add_edge(src, dst, conn);
            }
        }
    }

    pub fn gateways(&self) -> Vec<&Device> {
        self.graph.node_weights().filter(|d| d.is_gateway).collect()
    }

    /// Full device/connection snapshot, the same shape [`Self::merge_graph`]
    /// consumes, for a peer's outbound `GRAPH_SYNC`.
    pub fn snapshot(&self) -> (Vec<Device>, Vec<Connection>) {
        let devices = self.graph.node_weights().cloned().collect();
        let connections = self.graph.edge_weights().cloned().collect();
        (devices, connections)
    }

    pub fn default_gateway(&self) -> Option<&Device> {
        self.graph.node_weights().find(|d| d.is_default_gateway)
    }

    pub fn clear_gateway_flags(&mut self) {
        for device in self.graph.node_weights_mut() {
            device.clear_gateway_flags();
        }
    }

    pub fn set_gateway_role(&mut self, key: &str, role: GatewayRole) {
        if let Some(&idx) = self.mac_index.get(key) {
            if let Some(device) = self.graph.node_weight_mut(idx) {
                device.is_gateway = true;
                device.is_default_gateway = matches!(role, GatewayRole::Default | GatewayRole::DefaultInferred);
                device.gateway_role = Some(role);
            }
        }
    }

    /// Partition devices into remote/virtual, gateway, and local tiers for
    /// visualization.
    pub fn tiers(&self) -> TopologyTiers<'_> {
        let mut tiers = TopologyTiers {
            remote_virtual: Vec::new(),
            gateways: Vec::new(),
            local: Vec::new(),
        };
        for device in self.graph.node_weights() {
            if device.is_virtual {
                tiers.remote_virtual.push(device);
            } else if device.is_gateway {
                tiers.gateways.push(device);
            } else {
                tiers.local.push(device);
            }
        }
        tiers
    }

    pub fn connections_of_type(&self, kind: ConnectionType) -> Vec<&Connection> {
        self.graph.edge_weights().filter(|c| c.connection_type == kind).collect()
    }

    pub fn protocol_histogram(&self) -> HashMap<String, u64> {
        let mut hist = HashMap::new();
        for conn in self.graph.edge_weights() {
            *hist.entry(conn.protocol.clone()).or_insert(0) += conn.packet_count;
        }
        hist
    }

    pub fn destination_port_histogram(&self) -> HashMap<u16, u64> {
        let mut hist = HashMap::new();
        for conn in self.graph.edge_weights() {
            if let Some(port) = conn.destination_port {
                *hist.entry(port).or_insert(0) += conn.packet_count;
            }
        }
        hist
    }

    /// Shortest path between two device keys by hop count (unit edge
    /// weight), for visualization layout only.
    pub fn shortest_path(&self, from_key: &str, to_key: &str) -> Option<Vec<String>> {
        let from_idx = *self.mac_index.get(from_key)?;
        let to_idx = *self.mac_index.get(to_key)?;
        let costs = petgraph::algo::dijkstra(&self.graph, from_idx, Some(to_idx), |_| 1u32);
        costs.get(&to_idx)?;

        // Reconstruct by re-running dijkstra from `from_idx` and walking
        // predecessors is more code than this graph size warrants; instead
        // do a plain BFS parent trace, which is equivalent for unit weights.
        let mut parents: HashMap<NodeIndex, NodeIndex> = HashMap::new();
        let mut visited = std::collections::HashSet::new();
        let mut queue = std::collections::VecDeque::new();
        queue.push_back(from_idx);
        visited.insert(from_idx);
        while let Some(node) = queue.pop_front() {
            if node == to_idx {
                break;
            }
            for neighbor in self.graph.neighbors_directed(node, Direction::Outgoing) {
                if visited.insert(neighbor) {
                    parents.insert(neighbor, node);
                    queue.push_back(neighbor);
                }
            }
        }
        if !visited.contains(&to_idx) {
            return None;
        }
        let mut path = vec![to_idx];
        let mut cur = to_idx;
        while let Some(&p) = parents.get(&cur) {
            path.push(p);
            cur = p;
        }
        path.reverse();
        Some(
            path.into_iter()
                .filter_map(|idx| self.graph.node_weight(idx).map(|d| d.key.clone()))
                .collect(),
        )
    }

    pub fn export_dot(&self) -> String {
        format!(
            "{:?}",
            Dot::with_config(&self.graph, &[DotConfig::EdgeNoLabel])
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::MacAddr;

    fn device(mac: &str, ip: &str) -> Device {
        Device::new_physical(
            MacAddr::parse(mac).unwrap(),
            Some(ip.parse().unwrap()),
            1000,
        )
    }

    #[test]
    fn add_device_then_same_mac_updates_in_place() {
        let mut g = TopologyGraph::new();
        g.add_device(device("aa:bb:cc:dd:ee:01", "192.168.1.2"));
        assert_eq!(g.node_count(), 1);
        let mut updated = device("aa:bb:cc:dd:ee:01", "192.168.1.3");
        updated.last_seen = 2000;
        g.add_device(updated);
        assert_eq!(g.node_count(), 1);
        let d = g.device_by_key("aa:bb:cc:dd:ee:01").unwrap();
        assert_eq!(d.ip, Some("192.168.1.3".parse().unwrap()));
        assert_eq!(d.last_seen, 2000);
    }

    #[test]
    fn ip_index_follows_address_change() {
        let mut g = TopologyGraph::new();
        g.add_device(device("aa:bb:cc:dd:ee:01", "192.168.1.2"));
        assert!(g.device_by_ip("192.168.1.2".parse().unwrap()).is_some());
        let mut moved = device("aa:bb:cc:dd:ee:01", "192.168.1.99");
        moved.last_seen = 2000;
        g.add_device(moved);
        assert!(g.device_by_ip("192.168.1.2".parse().unwrap()).is_none());
        assert!(g.device_by_ip("192.168.1.99".parse().unwrap()).is_some());
    }

    #[test]
    fn add_connection_merges_on_matching_triple() {
        let mut g = TopologyGraph::new();
        let a = device("aa:bb:cc:dd:ee:01", "192.168.1.2");
        let b = device("aa:bb:cc:dd:ee:02", "192.168.1.3");
        let inserted = g.add_connection(a.clone(), b.clone(), "tcp", Some(1000), Some(443), 100, Some(64));
        assert!(inserted);
        let inserted_again = g.add_connection(a, b, "tcp", Some(1000), Some(443), 50, Some(64));
        assert!(!inserted_again);
        assert_eq!(g.edge_count(), 1);
    }

    #[test]
    fn cleanup_evicts_only_stale_devices() {
        let mut g = TopologyGraph::new();
        let mut fresh = device("aa:bb:cc:dd:ee:01", "192.168.1.2");
        fresh.last_seen = now_unix_secs();
        let mut stale = device("aa:bb:cc:dd:ee:02", "192.168.1.3");
        stale.last_seen = 1;
        g.add_device(fresh);
        g.add_device(stale);
        let evicted = g.cleanup_inactive_devices();
        assert_eq!(evicted, vec!["aa:bb:cc:dd:ee:02".to_string()]);
        assert_eq!(g.node_count(), 1);
        assert!(g.device_by_key("aa:bb:cc:dd:ee:01").is_some());
    }

    #[test]
    fn classify_connection_matches_ttl_bands() {
        assert_eq!(
            TopologyGraph::classify_connection(false, true, Some(64)),
            ConnectionType::DirectL2
        );
        assert_eq!(
            TopologyGraph::classify_connection(false, true, Some(55)),
            ConnectionType::RoutedL3
        );
        assert_eq!(
            TopologyGraph::classify_connection(false, true, Some(40)),
            ConnectionType::Internet
        );
        assert_eq!(
            TopologyGraph::classify_connection(true, false, Some(64)),
            ConnectionType::Internet
        );
    }

    #[test]
    fn rekey_device_upgrades_scan_pending_without_duplicate_vertex() {
        let mut g = TopologyGraph::new();
        let ip: Ipv4Addr = "192.168.1.50".parse().unwrap();
        let mut placeholder = Device::new_virtual(ip, 1000);
        placeholder.key = format!("scan-pending-{ip}");
        placeholder.vendor = Some("Scan Discovered (MAC pending)".to_string());
        g.add_device(placeholder);
        assert_eq!(g.node_count(), 1);

        let real_mac = MacAddr::parse("0a:0b:0c:0d:0e:0f").unwrap();
        let old_key = format!("scan-pending-{ip}");
        assert!(g.rekey_device(&old_key, real_mac.clone()));

        assert_eq!(g.node_count(), 1);
        assert!(g.device_by_key(&old_key).is_none());
        let upgraded = g.device_by_key(real_mac.as_str()).unwrap();
        assert_eq!(upgraded.mac, Some(real_mac));
        assert!(!upgraded.is_virtual);
        assert_eq!(g.device_by_ip(ip).unwrap().key, "0a:0b:0c:0d:0e:0f");
    }

    #[test]
    fn shortest_path_finds_direct_hop() {
        let mut g = TopologyGraph::new();
        let a = device("aa:bb:cc:dd:ee:01", "192.168.1.2");
        let b = device("aa:bb:cc:dd:ee:02", "192.168.1.3");
        g.add_connection(a, b, "tcp", None, None, 10, None);
        let path = g.shortest_path("aa:bb:cc:dd:ee:01", "aa:bb:cc:dd:ee:02").unwrap();
        assert_eq!(path, vec!["aa:bb:cc:dd:ee:01", "aa:bb:cc:dd:ee:02"]);
    }
}
