//! Device — a network entity observed on-wire.

use std::collections::HashSet;
use std::net::Ipv4Addr;

use serde::{Deserialize, Serialize};

/// A canonical, lowercase, colon-separated MAC address. Constructed only
/// through [`MacAddr::parse`] so the "unique, case-insensitive" invariant
/// holds structurally rather than by caller discipline.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MacAddr(String);

impl MacAddr {
    pub fn parse(raw: &str) -> Option<Self> {
        let lower = raw.to_ascii_lowercase();
        let parts: Vec<&str> = lower.split(':').collect();
        if parts.len() != 6 || !parts.iter().all(|p| p.len() == 2 && u8::from_str_radix(p, 16).is_ok()) {
            return None;
        }
        Some(Self(lower))
    }

    /// Build a MAC from raw bytes, as produced by packet parsing.
    pub fn from_bytes(bytes: [u8; 6]) -> Self {
        Self(
            bytes
                .iter()
                .map(|b| format!("{:02x}", b))
                .collect::<Vec<_>>()
                .join(":"),
        )
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The synthetic key used for a virtual device: `"virtual-" + ip`.
    pub fn virtual_key(ip: Ipv4Addr) -> String {
        format!("virtual-{}", ip)
    }
}

impl std::fmt::Display for MacAddr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum GatewayRole {
    Default,
    Secondary,
    DefaultInferred,
}

impl GatewayRole {
    pub fn label(&self) -> &'static str {
        match self {
            GatewayRole::Default => "Default",
            GatewayRole::Secondary => "Secondary",
            GatewayRole::DefaultInferred => "Default (Inferred)",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Device {
    /// Canonical key: the MAC for a real device, or `"virtual-<ip>"` for a
    /// device only ever seen across a gateway.
    pub key: String,
    pub mac: Option<MacAddr>,
    pub ip: Option<Ipv4Addr>,
    pub hostname: Option<String>,
    pub vendor: Option<String>,
    pub friendly_name: Option<String>,
    pub first_seen: u64,
    pub last_seen: u64,
    pub packet_count: u64,
    pub byte_count: u64,
    pub open_ports: HashSet<u16>,
    pub is_gateway: bool,
    pub is_default_gateway: bool,
    pub gateway_role: Option<GatewayRole>,
    pub is_tlscope_peer: bool,
    pub peer_identity_key: Option<String>,
    pub is_virtual: bool,
}

impl Device {
    pub fn new_physical(mac: MacAddr, ip: Option<Ipv4Addr>, now: u64) -> Self {
        Self {
            key: mac.as_str().to_string(),
            mac: Some(mac),
            ip,
            hostname: None,
            vendor: None,
            friendly_name: None,
            first_seen: now,
            last_seen: now,
            packet_count: 0,
            byte_count: 0,
            open_ports: HashSet::new(),
            is_gateway: false,
            is_default_gateway: false,
            gateway_role: None,
            is_tlscope_peer: false,
            peer_identity_key: None,
            is_virtual: false,
        }
    }

    pub fn new_virtual(ip: Ipv4Addr, now: u64) -> Self {
        Self {
            key: MacAddr::virtual_key(ip),
            mac: None,
            ip: Some(ip),
            hostname: None,
            vendor: None,
            friendly_name: None,
            first_seen: now,
            last_seen: now,
            packet_count: 0,
            byte_count: 0,
            open_ports: HashSet::new(),
            is_gateway: false,
            is_default_gateway: false,
            gateway_role: None,
            is_tlscope_peer: false,
            peer_identity_key: None,
            is_virtual: true,
        }
    }

    pub fn observe(&mut self, ip: Option<Ipv4Addr>, bytes: u64, now: u64) {
        if let Some(ip) = ip {
            self.ip = Some(ip);
        }
        self.last_seen = now;
        self.packet_count += 1;
        self.byte_count += bytes;
    }

    pub fn clear_gateway_flags(&mut self) {
        self.is_gateway = false;
        self.is_default_gateway = false;
        self.gateway_role = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mac_parse_lowercases() {
        let mac = MacAddr::parse("AA:BB:CC:DD:EE:FF").unwrap();
        assert_eq!(mac.as_str(), "aa:bb:cc:dd:ee:ff");
    }

    #[test]
    fn mac_parse_rejects_garbage() {
        assert!(MacAddr::parse("not-a-mac").is_none());
        assert!(MacAddr::parse("aa:bb:cc:dd:ee").is_none());
    }

    #[test]
    fn virtual_key_format() {
        let ip: Ipv4Addr = "8.8.8.8".parse().unwrap();
        assert_eq!(MacAddr::virtual_key(ip), "virtual-8.8.8.8");
    }

    #[test]
    fn new_device_has_equal_first_and_last_seen() {
        let mac = MacAddr::parse("aa:bb:cc:dd:ee:01").unwrap();
        let d = Device::new_physical(mac, None, 100);
        assert_eq!(d.first_seen, d.last_seen);
    }

    #[test]
    fn observe_bumps_counters_without_moving_first_seen() {
        let mac = MacAddr::parse("aa:bb:cc:dd:ee:01").unwrap();
        let mut d = Device::new_physical(mac, None, 100);
        d.observe(None, 64, 150);
        assert_eq!(d.first_seen, 100);
        assert_eq!(d.last_seen, 150);
        assert_eq!(d.packet_count, 1);
        assert_eq!(d.byte_count, 64);
    }
}
