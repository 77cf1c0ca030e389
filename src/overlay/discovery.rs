//! Overlay Discovery — UDP broadcast beacon sender/listener.
//!
//! Direct generalization of the teacher's `runtime::lan::discovery`:
//! same `socket2`-based reusable bind, same staleness-pruning shared map,
//! carrying the TLScope `DISCOVERY` payload instead of a bare device
//! beacon.

use std::collections::HashMap;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::sync::Arc;

use log::Level;
use parking_lot::RwLock;
use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio::time::{interval, Duration};
use tokio_util::sync::CancellationToken;

use super::protocol::{
    decode_beacon, encode_beacon, DiscoveredPeer, DiscoveryBeacon, DiscoveryKind,
    DISCOVERY_INTERVAL_SECS,
};
use crate::events::RuntimeEvent;
use crate::model::now_unix_secs;

pub type DiscoveredPeers = Arc<RwLock<HashMap<String, DiscoveredPeer>>>;

pub fn new_peer_map() -> DiscoveredPeers {
    Arc::new(RwLock::new(HashMap::new()))
}

/// Peers that haven't re-announced within this many seconds are pruned.
const PEER_EXPIRY_SECS: u64 = 90;

/// Bind a UDP socket with `SO_REUSEADDR`/`SO_REUSEPORT`, mirroring the
/// teacher's `bind_reusable_udp` so multiple local processes (or quick
/// restarts) don't collide on the discovery port.
pub async fn bind_reusable_udp(port: u16, events: &mpsc::Sender<RuntimeEvent>) -> Option<UdpSocket> {
    let addr = SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, port);

    let socket = match Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP)) {
        Ok(s) => s,
        Err(e) => {
            let _ = events
                .send(RuntimeEvent::log(Level::Error, format!("discovery socket create failed: {e}")))
                .await;
            return None;
        }
    };

    if let Err(e) = socket.set_reuse_address(true) {
        let _ = events
            .send(RuntimeEvent::log(Level::Warn, format!("SO_REUSEADDR failed (non-fatal): {e}")))
            .await;
    }
    #[cfg(not(target_os = "windows"))]
    if let Err(e) = socket.set_reuse_port(true) {
        let _ = events
            .send(RuntimeEvent::log(Level::Warn, format!("SO_REUSEPORT failed (non-fatal): {e}")))
            .await;
    }
    socket.set_broadcast(true).ok();
    socket.set_nonblocking(true).ok();

    if let Err(e) = socket.bind(&socket2::SockAddr::from(addr)) {
        let _ = events
            .send(RuntimeEvent::log(Level::Error, format!("discovery bind failed on port {port}: {e}")))
            .await;
        return None;
    }

    let std_socket: std::net::UdpSocket = socket.into();
    UdpSocket::from_std(std_socket).ok()
}

#[allow(clippy::too_many_arguments)]
pub async fn run_beacon_broadcaster(
    username: String,
    ssh_public_key: String,
    avatar_type: String,
    avatar_color: String,
    randomart: String,
    tls_port: u16,
    version: String,
    socket: Arc<UdpSocket>,
    discovery_port: u16,
    events: mpsc::Sender<RuntimeEvent>,
    cancel: CancellationToken,
) {
    let broadcast_addr = SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::BROADCAST, discovery_port));
    let mut tick = interval(Duration::from_secs(DISCOVERY_INTERVAL_SECS));

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = tick.tick() => {
                let beacon = DiscoveryBeacon {
                    kind: DiscoveryKind::Discovery,
                    username: username.clone(),
                    ssh_public_key: ssh_public_key.clone(),
                    avatar_type: avatar_type.clone(),
                    avatar_color: avatar_color.clone(),
                    combined_randomart_avatar: randomart.clone(),
                    port: tls_port,
                    version: version.clone(),
                };
                let packet = encode_beacon(&beacon);
                if let Err(e) = socket.send_to(&packet, broadcast_addr).await {
                    let _ = events
                        .send(RuntimeEvent::log(Level::Warn, format!("beacon send failed: {e}")))
                        .await;
                }
            }
        }
    }
}

/// Send a single unicast beacon to `target` for directed re-discovery.
pub async fn send_directed_beacon(
    socket: &UdpSocket,
    target: SocketAddr,
    beacon: &DiscoveryBeacon,
) -> std::io::Result<usize> {
    socket.send_to(&encode_beacon(beacon), target).await
}

pub async fn run_beacon_listener(
    own_username: String,
    peers: DiscoveredPeers,
    socket: Arc<UdpSocket>,
    events: mpsc::Sender<RuntimeEvent>,
    cancel: CancellationToken,
) {
    let mut buf = [0u8; 4096];

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            result = socket.recv_from(&mut buf) => {
                match result {
                    Ok((len, src_addr)) => {
                        if let Some(beacon) = decode_beacon(&buf[..len]) {
                            if beacon.username == own_username {
                                continue;
                            }
                            let now = now_unix_secs();
                            let ip = src_addr.ip().to_string();
                            let is_new = upsert_peer(&peers, &beacon, &ip, now);
                            if is_new {
                                let _ = events
                                    .send(RuntimeEvent::PeerDiscovered {
                                        username: beacon.username.clone(),
                                        ip: ip.clone(),
                                    })
                                    .await;
                            }
                            prune_stale_peers(&peers, now);
                        }
                    }
                    Err(e) => {
                        let _ = events
                            .send(RuntimeEvent::log(Level::Warn, format!("discovery recv error: {e}")))
                            .await;
                    }
                }
            }
        }
    }
}

/// Insert or refresh a peer entry. Returns `true` for a brand-new peer.
fn upsert_peer(peers: &DiscoveredPeers, beacon: &DiscoveryBeacon, ip: &str, now: u64) -> bool {
    let mut writer = peers.write();
    let entry = DiscoveredPeer {
        username: beacon.username.clone(),
        ssh_public_key: beacon.ssh_public_key.clone(),
        addr: ip.to_string(),
        tls_port: beacon.port,
        version: beacon.version.clone(),
        last_seen: now,
    };
    writer.insert(beacon.username.clone(), entry).is_none()
}

fn prune_stale_peers(peers: &DiscoveredPeers, now: u64) -> usize {
    let mut writer = peers.write();
    let before = writer.len();
    writer.retain(|_, peer| now.saturating_sub(peer.last_seen) < PEER_EXPIRY_SECS);
    before - writer.len()
}

pub fn get_discovered_peers(peers: &DiscoveredPeers) -> Vec<DiscoveredPeer> {
    peers.read().values().cloned().collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn beacon(username: &str) -> DiscoveryBeacon {
        DiscoveryBeacon {
            kind: DiscoveryKind::Discovery,
            username: username.into(),
            ssh_public_key: "ssh-ed25519 AAAA".into(),
            avatar_type: "identicon".into(),
            avatar_color: "#000".into(),
            combined_randomart_avatar: String::new(),
            port: 8443,
            version: "0.1.0".into(),
        }
    }

    #[test]
    fn upsert_reports_new_then_existing() {
        let peers = new_peer_map();
        assert!(upsert_peer(&peers, &beacon("alice"), "10.0.0.5", 100));
        assert!(!upsert_peer(&peers, &beacon("alice"), "10.0.0.5", 105));
    }

    #[test]
    fn prune_removes_only_stale_entries() {
        let peers = new_peer_map();
        upsert_peer(&peers, &beacon("alice"), "10.0.0.5", 0);
        upsert_peer(&peers, &beacon("bob"), "10.0.0.6", 1000);
        let removed = prune_stale_peers(&peers, 1000);
        assert_eq!(removed, 1);
        assert!(get_discovered_peers(&peers).iter().any(|p| p.username == "bob"));
    }
}
