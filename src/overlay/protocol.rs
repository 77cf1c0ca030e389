//! Overlay wire protocol — UDP discovery datagrams and the TCP/TLS peer
//! message vocabulary. Generalizes the teacher's `runtime::lan::protocol`
//! (magic-prefixed beacon, length-prefixed JSON frame) from a clipboard
//! `Hello`/`Welcome` exchange to TLScope's challenge-response handshake.

use serde::{Deserialize, Serialize};

pub const DISCOVERY_MAGIC: &[u8; 8] = b"TLSCOPE1";
pub const DEFAULT_DISCOVERY_PORT: u16 = 8442;
pub const DEFAULT_TLS_PORT: u16 = 8443;
pub const DISCOVERY_INTERVAL_SECS: u64 = 30;
pub const HEARTBEAT_INTERVAL_SECS: u64 = 10;
pub const HEARTBEAT_TIMEOUT_SECS: u64 = 30;
pub const GRAPH_SYNC_INTERVAL_SECS: u64 = 60;
pub const INITIAL_RECONNECT_DELAY_SECS: u64 = 1;
pub const MAX_RECONNECT_DELAY_SECS: u64 = 30;

/// Maximum allowed frame size. Overlay messages are small JSON objects;
/// this only guards against a misbehaving or malicious peer inflating
/// the length prefix.
pub const MAX_FRAME_SIZE: u32 = 1_000_000;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiscoveryBeacon {
    #[serde(rename = "type")]
    pub kind: DiscoveryKind,
    pub username: String,
    pub ssh_public_key: String,
    pub avatar_type: String,
    pub avatar_color: String,
    pub combined_randomart_avatar: String,
    pub port: u16,
    pub version: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DiscoveryKind {
    #[serde(rename = "DISCOVERY")]
    Discovery,
}

pub fn encode_beacon(beacon: &DiscoveryBeacon) -> Vec<u8> {
    let json = serde_json::to_vec(beacon).expect("beacon serialization is infallible");
    let mut buf = Vec::with_capacity(DISCOVERY_MAGIC.len() + json.len());
    buf.extend_from_slice(DISCOVERY_MAGIC);
    buf.extend_from_slice(&json);
    buf
}

pub fn decode_beacon(data: &[u8]) -> Option<DiscoveryBeacon> {
    if data.len() <= DISCOVERY_MAGIC.len() || &data[..DISCOVERY_MAGIC.len()] != DISCOVERY_MAGIC {
        return None;
    }
    serde_json::from_slice(&data[DISCOVERY_MAGIC.len()..]).ok()
}

/// A peer record as tracked purely from discovery beacons, before any
/// TLS session has been attempted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiscoveredPeer {
    pub username: String,
    pub ssh_public_key: String,
    pub addr: String,
    pub tls_port: u16,
    pub version: String,
    pub last_seen: u64,
}

/// Messages exchanged on an established TLS session, framed with a
/// 4-byte little-endian length prefix (unlike the teacher's big-endian
/// framing — chosen to match TLScope's on-wire byte order elsewhere).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum OverlayMessage {
    /// Sent by the connecting side immediately after the TLS handshake
    /// completes, asserting identity and issuing a random challenge for
    /// the remote to sign.
    Hello { username: String, challenge: String },
    /// Reply proving possession of the SSH private key: signs the peer's
    /// challenge and issues one of our own.
    Challenge { username: String, signature: String, challenge: String },
    /// Final step: sign the remote's challenge. Receipt of a valid
    /// `Verify` completes mutual authentication.
    Verify { signature: String },
    Ping { ts: u64 },
    Pong { ts: u64 },
    /// Bulk topology exchange — `merge_graph` on the receiving end.
    GraphSync { devices_json: String, connections_json: String },
    /// Incremental single-device update, handled as a one-device
    /// `merge_graph` call on the receiving end.
    DeviceUpdate { device_json: String },
}

pub fn encode_message(msg: &OverlayMessage) -> Vec<u8> {
    let json = serde_json::to_vec(msg).expect("overlay message serialization is infallible");
    let len = json.len() as u32;
    let mut buf = Vec::with_capacity(4 + json.len());
    buf.extend_from_slice(&len.to_le_bytes());
    buf.extend_from_slice(&json);
    buf
}

pub fn decode_message_len(len_bytes: [u8; 4]) -> u32 {
    u32::from_le_bytes(len_bytes)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_beacon() -> DiscoveryBeacon {
        DiscoveryBeacon {
            kind: DiscoveryKind::Discovery,
            username: "alice".into(),
            ssh_public_key: "ssh-ed25519 AAAA alice@host".into(),
            avatar_type: "identicon".into(),
            avatar_color: "#336699".into(),
            combined_randomart_avatar: "+--[ED25519 256]--+".into(),
            port: 8443,
            version: "0.1.0".into(),
        }
    }

    #[test]
    fn beacon_roundtrips_through_encode_decode() {
        let beacon = sample_beacon();
        let encoded = encode_beacon(&beacon);
        let decoded = decode_beacon(&encoded).unwrap();
        assert_eq!(decoded.username, beacon.username);
        assert_eq!(decoded.port, beacon.port);
    }

    #[test]
    fn decode_rejects_wrong_magic() {
        let mut encoded = encode_beacon(&sample_beacon());
        encoded[0] = b'X';
        assert!(decode_beacon(&encoded).is_none());
    }

    #[test]
    fn decode_rejects_short_buffer() {
        assert!(decode_beacon(b"short").is_none());
    }

    #[test]
    fn message_length_prefix_is_little_endian() {
        let msg = OverlayMessage::Ping { ts: 42 };
        let frame = encode_message(&msg);
        let len = decode_message_len([frame[0], frame[1], frame[2], frame[3]]);
        assert_eq!(len as usize, frame.len() - 4);
    }
}
