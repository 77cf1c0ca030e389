//! Connection — an observed edge between two devices in the topology graph.

use serde::{Deserialize, Serialize};

/// Classification of an edge, assigned by the gateway detector and never
/// downgraded once `TLSPeer` is set — a TLS overlay link stays a TLS overlay
/// link even if the gateway detector later reclassifies the underlying
/// physical path.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConnectionType {
    DirectL2,
    RoutedL3,
    Internet,
    TLSPeer,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TtlStats {
    pub min_ttl: u8,
    pub max_ttl: u8,
    pub sum_ttl: u64,
    pub count: u64,
}

impl TtlStats {
    pub fn observe(&mut self, ttl: u8) {
        if self.count == 0 {
            self.min_ttl = ttl;
            self.max_ttl = ttl;
        } else {
            self.min_ttl = self.min_ttl.min(ttl);
            self.max_ttl = self.max_ttl.max(ttl);
        }
        self.sum_ttl += ttl as u64;
        self.count += 1;
    }

    pub fn avg_ttl(&self) -> f64 {
        if self.count == 0 {
            0.0
        } else {
            self.sum_ttl as f64 / self.count as f64
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Connection {
    pub source_key: String,
    pub destination_key: String,
    pub protocol: String,
    pub source_port: Option<u16>,
    pub destination_port: Option<u16>,
    pub first_seen: u64,
    pub last_seen: u64,
    pub packet_count: u64,
    pub recent_packet_count: u64,
    pub byte_count: u64,
    pub tcp_state: Option<String>,
    pub is_tls_peer_connection: bool,
    pub ttl: TtlStats,
    pub connection_type: ConnectionType,
    pub last_rate_update: u64,
}

impl Connection {
    pub fn new(
        source_key: String,
        destination_key: String,
        protocol: String,
        source_port: Option<u16>,
        destination_port: Option<u16>,
        now: u64,
    ) -> Self {
        Self {
            source_key,
            destination_key,
            protocol,
            source_port,
            destination_port,
            first_seen: now,
            last_seen: now,
            packet_count: 0,
            recent_packet_count: 0,
            byte_count: 0,
            tcp_state: None,
            is_tls_peer_connection: false,
            ttl: TtlStats::default(),
            connection_type: ConnectionType::RoutedL3,
            last_rate_update: now,
        }
    }

    pub fn observe(&mut self, bytes: u64, ttl: Option<u8>, now: u64) {
        self.last_seen = now;
        self.packet_count += 1;
        self.recent_packet_count += 1;
        self.byte_count += bytes;
        if let Some(ttl) = ttl {
            self.ttl.observe(ttl);
        }
    }

    /// Reset the per-interval rate counter. `recent_packet_count` never
    /// exceeds `packet_count` by construction since it only accumulates
    /// between resets.
    pub fn reset_rate_window(&mut self, now: u64) {
        self.recent_packet_count = 0;
        self.last_rate_update = now;
    }

    /// Mark this edge as carrying the TLS overlay. Sticky: once set, a
    /// later call with `false` is a no-op.
    pub fn mark_tls_peer(&mut self) {
        self.is_tls_peer_connection = true;
        self.connection_type = ConnectionType::TLSPeer;
    }

    pub fn set_connection_type(&mut self, kind: ConnectionType) {
        if self.is_tls_peer_connection {
            return;
        }
        self.connection_type = kind;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ttl_stats_track_min_max_avg() {
        let mut stats = TtlStats::default();
        stats.observe(64);
        stats.observe(60);
        stats.observe(70);
        assert_eq!(stats.min_ttl, 60);
        assert_eq!(stats.max_ttl, 70);
        assert!((stats.avg_ttl() - 64.666).abs() < 0.01);
    }

    #[test]
    fn recent_never_exceeds_total() {
        let mut c = Connection::new("a".into(), "b".into(), "tcp".into(), None, None, 0);
        c.observe(100, Some(64), 1);
        c.observe(100, Some(64), 2);
        assert!(c.recent_packet_count <= c.packet_count);
        c.reset_rate_window(3);
        c.observe(50, Some(64), 4);
        assert!(c.recent_packet_count <= c.packet_count);
        assert_eq!(c.recent_packet_count, 1);
        assert_eq!(c.packet_count, 3);
    }

    #[test]
    fn tls_peer_classification_is_sticky() {
        let mut c = Connection::new("a".into(), "b".into(), "tcp".into(), None, None, 0);
        c.mark_tls_peer();
        c.set_connection_type(ConnectionType::Internet);
        assert_eq!(c.connection_type, ConnectionType::TLSPeer);
        assert!(c.is_tls_peer_connection);
    }
}
