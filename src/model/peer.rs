//! PeerIdentity — a TLScope overlay node, keyed by its SSH public key.

use std::net::Ipv4Addr;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PeerIdentity {
    pub username: String,
    pub ip: Ipv4Addr,
    pub tls_port: u16,
    /// OpenSSH-format public key line (`ssh-ed25519 AAAA... user@host`).
    pub ssh_public_key: String,
    /// SHA-256 key fingerprint, `SHA256:...`, the identity's stable key.
    pub fingerprint: String,
    pub avatar_seed: Option<String>,
    pub randomart: Option<String>,
    pub version: Option<String>,
    pub is_connected: bool,
    pub is_verified: bool,
    pub first_seen: u64,
    pub last_connected: Option<u64>,
    pub last_verified: Option<u64>,
}

impl PeerIdentity {
    pub fn new(
        username: String,
        ip: Ipv4Addr,
        tls_port: u16,
        ssh_public_key: String,
        fingerprint: String,
        now: u64,
    ) -> Self {
        Self {
            username,
            ip,
            tls_port,
            ssh_public_key,
            fingerprint,
            avatar_seed: None,
            randomart: None,
            version: None,
            is_connected: false,
            is_verified: false,
            first_seen: now,
            last_connected: None,
            last_verified: None,
        }
    }

    pub fn mark_connected(&mut self, now: u64) {
        self.is_connected = true;
        self.last_connected = Some(now);
    }

    pub fn mark_disconnected(&mut self) {
        self.is_connected = false;
    }

    pub fn mark_verified(&mut self, now: u64) {
        self.is_verified = true;
        self.last_verified = Some(now);
    }

    /// The key under which this identity is indexed everywhere: the
    /// fingerprint, not the (mutable) username or IP.
    pub fn key(&self) -> &str {
        &self.fingerprint
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> PeerIdentity {
        PeerIdentity::new(
            "alice".into(),
            "192.168.1.20".parse().unwrap(),
            8443,
            "ssh-ed25519 AAAAC3NzaC1lZDI1NTE5AAAA alice@host".into(),
            "SHA256:abc123".into(),
            1000,
        )
    }

    #[test]
    fn new_identity_is_unconnected_and_unverified() {
        let peer = sample();
        assert!(!peer.is_connected);
        assert!(!peer.is_verified);
        assert_eq!(peer.key(), "SHA256:abc123");
    }

    #[test]
    fn mark_connected_then_disconnected() {
        let mut peer = sample();
        peer.mark_connected(2000);
        assert!(peer.is_connected);
        assert_eq!(peer.last_connected, Some(2000));
        peer.mark_disconnected();
        assert!(!peer.is_connected);
        // last_connected is history, not cleared on disconnect.
        assert_eq!(peer.last_connected, Some(2000));
    }

    #[test]
    fn mark_verified_sets_timestamp() {
        let mut peer = sample();
        peer.mark_verified(3000);
        assert!(peer.is_verified);
        assert_eq!(peer.last_verified, Some(3000));
    }
}
