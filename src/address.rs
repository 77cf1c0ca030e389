//! Address Classifier — pure functions over IPv4 addresses and 48-bit MACs.
//!
//! No state, no I/O; every function here is a candidate for the hot path
//! so it's written to avoid allocation where possible.

use std::net::Ipv4Addr;

use crate::config::FilterConfig;

/// Returns true if `ip` falls in a "utility" range the given policy flags on:
/// loopback, broadcast, multicast, link-local, or reserved. Some ranges are
/// always filtered regardless of policy (broadcast, loopback, multicast,
/// link-local, reserved) per the spec — the policy flags gate whether the
/// *category counter* fires and whether ingest drops the packet, not whether
/// the address is intrinsically "utility".
pub fn is_utility(ip: Ipv4Addr, cfg: &FilterConfig) -> bool {
    filter_reason(ip, cfg).is_some()
}

/// Returns a human-readable tag for why `ip` would be filtered, or `None`
/// if it isn't utility under the given policy. Used only by logs.
pub fn filter_reason(ip: Ipv4Addr, cfg: &FilterConfig) -> Option<&'static str> {
    let octets = ip.octets();

    if cfg.filter_loopback && octets[0] == 127 {
        return Some("loopback");
    }
    if ip == Ipv4Addr::new(0, 0, 0, 0) {
        return Some("unspecified");
    }
    if cfg.filter_broadcast && ip == Ipv4Addr::new(255, 255, 255, 255) {
        return Some("broadcast");
    }
    if cfg.filter_multicast && (224..=239).contains(&octets[0]) {
        return Some("multicast");
    }
    if cfg.filter_link_local && octets[0] == 169 && octets[1] == 254 {
        return Some("link-local");
    }
    if cfg.filter_reserved && octets[0] >= 240 {
        return Some("reserved");
    }
    None
}

/// True for RFC1918 private ranges plus the CGNAT range (100.64/10).
pub fn is_local(ip: Ipv4Addr) -> bool {
    let o = ip.octets();
    match o[0] {
        10 => true,
        172 => (16..=31).contains(&o[1]),
        192 => o[1] == 168,
        100 => (64..=127).contains(&o[1]),
        _ => false,
    }
}

/// OUI prefixes (first three octets) handed out to virtual NICs by common
/// hypervisors/container runtimes, rather than burned into physical silicon.
/// A captured frame carrying one of these never corresponds to a real LAN
/// neighbor, so it's routed to the virtual-device path instead.
const VIRTUALIZATION_OUI_PREFIXES: &[[&str; 3]] = &[
    ["52", "54", "00"], // QEMU/KVM
    ["00", "05", "69"], // VMware (legacy)
    ["00", "0c", "29"], // VMware
    ["00", "50", "56"], // VMware
    ["02", "42", "ac"], // Docker bridge (docker0-assigned)
];

/// True for all-zero, all-ones (broadcast), IPv4-multicast (`01:00:5e:*`),
/// IPv6-multicast-over-ethernet (`33:33:*`), and the handful of OUI
/// prefixes virtualization stacks assign to their virtual NICs.
pub fn is_utility_mac(mac: &str) -> bool {
    let lower = mac.to_ascii_lowercase();
    let bytes: Vec<&str> = lower.split(':').collect();
    if bytes.len() != 6 {
        return false;
    }

    if lower == "00:00:00:00:00:00" || lower == "ff:ff:ff:ff:ff:ff" {
        return true;
    }
    if bytes[0] == "01" && bytes[1] == "00" && bytes[2] == "5e" {
        return true;
    }
    if bytes[0] == "33" && bytes[1] == "33" {
        return true;
    }
    if bytes[0] == "02" && bytes[1] == "42" {
        // Docker assigns 02:42:ac:11:xx:xx to container interfaces, but also
        // hands out other 02:42:xx:xx:xx:xx addresses for user-defined
        // bridges — the vendor byte pair alone is diagnostic enough.
        return true;
    }
    if VIRTUALIZATION_OUI_PREFIXES
        .iter()
        .any(|prefix| bytes[0] == prefix[0] && bytes[1] == prefix[1] && bytes[2] == prefix[2])
    {
        return true;
    }

    false
}

#[cfg(test)]
mod tests {
    use super::*;

    fn all_on() -> FilterConfig {
        FilterConfig {
            filter_loopback: true,
            filter_broadcast: true,
            filter_multicast: true,
            filter_link_local: true,
            filter_reserved: true,
            filter_http: false,
            filter_non_local: false,
            block_duplicate_ip: true,
        }
    }

    #[test]
    fn loopback_is_utility() {
        assert!(is_utility(Ipv4Addr::new(127, 0, 0, 1), &all_on()));
    }

    #[test]
    fn broadcast_is_utility() {
        assert!(is_utility(Ipv4Addr::new(255, 255, 255, 255), &all_on()));
    }

    #[test]
    fn private_ranges_are_local() {
        assert!(is_local(Ipv4Addr::new(192, 168, 5, 1)));
        assert!(is_local(Ipv4Addr::new(10, 0, 0, 1)));
        assert!(is_local(Ipv4Addr::new(172, 20, 3, 4)));
        assert!(is_local(Ipv4Addr::new(100, 64, 0, 1)));
    }

    #[test]
    fn public_ip_is_not_local() {
        assert!(!is_local(Ipv4Addr::new(8, 8, 8, 8)));
    }

    #[test]
    fn broadcast_mac_is_utility() {
        assert!(is_utility_mac("ff:ff:ff:ff:ff:ff"));
    }

    #[test]
    fn ipv4_multicast_mac_is_utility() {
        assert!(is_utility_mac("01:00:5e:7f:00:01"));
    }

    #[test]
    fn physical_mac_is_not_utility() {
        assert!(!is_utility_mac("aa:bb:cc:dd:ee:01"));
        assert!(!is_utility_mac("0a:0b:0c:0d:0e:0f"));
    }

    #[test]
    fn virtualization_ouis_are_utility() {
        assert!(is_utility_mac("52:54:00:12:34:56"));
        assert!(is_utility_mac("00:0c:29:ab:cd:ef"));
        assert!(is_utility_mac("00:50:56:aa:bb:cc"));
        assert!(is_utility_mac("02:42:ac:11:00:02"));
    }

    #[test]
    fn mac_case_insensitive() {
        assert!(is_utility_mac("FF:FF:FF:FF:FF:FF"));
    }

    #[test]
    fn disabled_filters_do_not_flag() {
        let mut cfg = all_on();
        cfg.filter_loopback = false;
        assert!(!is_utility(Ipv4Addr::new(127, 0, 0, 1), &cfg));
    }
}
