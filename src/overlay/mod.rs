//! Overlay orchestration — ties discovery and transport together,
//! generalizing the teacher's `runtime::lan::mod` (`LanTasks`,
//! `start_lan_mode`, `run_peer_connector`) from clipboard relay to
//! TLScope's peer-to-peer TLS overlay.

pub mod discovery;
pub mod identity;
pub mod protocol;
pub mod transport;

use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::Arc;

use log::Level;
use parking_lot::{Mutex, RwLock};
use ssh_key::PublicKey;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{sleep, Duration};
use tokio_util::sync::CancellationToken;

use crate::config::OverlayConfig;
use crate::error::Result;
use crate::events::RuntimeEvent;
use crate::graph::TopologyGraph;
use crate::model::{now_unix_secs, Connection, Device, PeerIdentity};
use discovery::{get_discovered_peers, new_peer_map, run_beacon_broadcaster, run_beacon_listener, DiscoveredPeers};
use identity::LocalIdentity;
use protocol::{DEFAULT_DISCOVERY_PORT, DEFAULT_TLS_PORT};
use transport::{run_tls_client, run_tls_host};

const CONNECTOR_SCAN_INTERVAL_SECS: u64 = 5;

/// Known peer identities, keyed by username, shared between discovery,
/// the connector, and every active session. Parking-lot `RwLock` matches
/// the teacher's synchronization style throughout `runtime::lan`.
#[derive(Clone, Default)]
pub struct PeerRegistry {
    inner: Arc<RwLock<HashMap<String, PeerIdentity>>>,
    graph_sync_sink: Arc<RwLock<Option<Arc<Mutex<TopologyGraph>>>>>,
}

impl PeerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_from_beacon(&self, username: &str, ssh_public_key: &str, ip: std::net::Ipv4Addr, tls_port: u16) {
        let mut writer = self.inner.write();
        writer
            .entry(username.to_string())
            .and_modify(|p| {
                p.ip = ip;
                p.tls_port = tls_port;
            })
            .or_insert_with(|| {
                PeerIdentity::new(username.to_string(), ip, tls_port, ssh_public_key.to_string(), String::new(), now_unix_secs())
            });
    }

    pub fn public_key_for(&self, username: &str) -> Option<PublicKey> {
        let reader = self.inner.read();
        let record = reader.get(username)?;
        record.ssh_public_key.parse::<PublicKey>().ok()
    }

    pub fn mark_verified(&self, username: &str) {
        let mut writer = self.inner.write();
        if let Some(peer) = writer.get_mut(username) {
            peer.mark_verified(now_unix_secs());
            peer.mark_connected(now_unix_secs());
        }
    }

    pub fn mark_disconnected(&self, username: &str) {
        let mut writer = self.inner.write();
        if let Some(peer) = writer.get_mut(username) {
            peer.mark_disconnected();
        }
    }

    pub fn snapshot(&self) -> Vec<PeerIdentity> {
        self.inner.read().values().cloned().collect()
    }

    /// Wire up the local topology graph as the target of incoming
    /// `GraphSync` payloads. Called once from `runtime.rs` after the
    /// overlay starts.
    pub fn set_graph_sync_sink(&self, graph: Arc<Mutex<TopologyGraph>>) {
        *self.graph_sync_sink.write() = Some(graph);
    }

    /// Deserialize a peer's `GraphSync` payload and merge it into the
    /// local topology graph, if one has been wired up. Malformed JSON
    /// from a peer is dropped rather than treated as a protocol error.
    pub fn deliver_graph_sync(&self, username: &str, devices_json: String, connections_json: String) {
        let Some(graph) = self.graph_sync_sink.read().clone() else { return };
        let devices: Vec<Device> = match serde_json::from_str(&devices_json) {
            Ok(d) => d,
            Err(e) => {
                log::warn!("discarding malformed GraphSync devices payload from {username}: {e}");
                return;
            }
        };
        let connections: Vec<Connection> = match serde_json::from_str(&connections_json) {
            Ok(c) => c,
            Err(e) => {
                log::warn!("discarding malformed GraphSync connections payload from {username}: {e}");
                return;
            }
        };
        graph.lock().merge_graph(devices, connections);
    }

    /// Deserialize a single-device `DEVICE_UPDATE` payload and merge it in,
    /// the incremental counterpart to [`Self::deliver_graph_sync`].
    pub fn deliver_device_update(&self, username: &str, device_json: String) {
        let Some(graph) = self.graph_sync_sink.read().clone() else { return };
        let device: Device = match serde_json::from_str(&device_json) {
            Ok(d) => d,
            Err(e) => {
                log::warn!("discarding malformed DeviceUpdate payload from {username}: {e}");
                return;
            }
        };
        graph.lock().merge_graph(vec![device], Vec::new());
    }

    /// Snapshot the local topology graph for an outbound `GraphSync`, if
    /// one has been wired up via [`Self::set_graph_sync_sink`].
    pub fn graph_snapshot(&self) -> Option<(Vec<Device>, Vec<Connection>)> {
        let graph = self.graph_sync_sink.read().clone()?;
        Some(graph.lock().snapshot())
    }
}

pub struct OverlayTasks {
    pub cancel: CancellationToken,
    pub handles: Vec<JoinHandle<()>>,
    pub peers: PeerRegistry,
}

impl OverlayTasks {
    pub async fn shutdown(self) {
        self.cancel.cancel();
        for h in self.handles {
            let _ = h.await;
        }
    }

    pub fn abort(self) {
        self.cancel.cancel();
        for h in self.handles {
            h.abort();
        }
    }
}

/// Start discovery broadcaster/listener, the TLS host listener, and the
/// peer connector. All tasks share `cancel`; cancelling it stops
/// everything.
pub async fn start_overlay(
    cfg: &OverlayConfig,
    identity: Arc<LocalIdentity>,
    events: mpsc::Sender<RuntimeEvent>,
    cancel: CancellationToken,
) -> Result<OverlayTasks> {
    let discovery_port = if cfg.discovery_port == 0 { DEFAULT_DISCOVERY_PORT } else { cfg.discovery_port };
    let tls_port = if cfg.tls_port == 0 { DEFAULT_TLS_PORT } else { cfg.tls_port };

    let discovered: DiscoveredPeers = new_peer_map();
    let known_peers = PeerRegistry::new();

    let mut handles: Vec<JoinHandle<()>> = Vec::new();

    let socket = discovery::bind_reusable_udp(discovery_port, &events)
        .await
        .ok_or_else(|| crate::error::TlscopeError::DiscoveryBind {
            port: discovery_port,
            source: std::io::Error::new(std::io::ErrorKind::AddrInUse, "discovery bind failed"),
        })?;
    let socket = Arc::new(socket);

    {
        let username = cfg.username.clone();
        let ssh_public_key = identity.public_key.to_openssh().unwrap_or_default();
        let socket = socket.clone();
        let ev = events.clone();
        let ct = cancel.clone();
        handles.push(tokio::spawn(async move {
            run_beacon_broadcaster(
                username,
                ssh_public_key,
                "identicon".to_string(),
                "#336699".to_string(),
                String::new(),
                tls_port,
                env!("CARGO_PKG_VERSION").to_string(),
                socket,
                discovery_port,
                ev,
                ct,
            )
            .await;
        }));
    }

    {
        let username = cfg.username.clone();
        let discovered = discovered.clone();
        let socket = socket.clone();
        let ev = events.clone();
        let ct = cancel.clone();
        handles.push(tokio::spawn(async move {
            run_beacon_listener(username, discovered, socket, ev, ct).await;
        }));
    }

    {
        let identity = identity.clone();
        let username = cfg.username.clone();
        let known_peers = known_peers.clone();
        let ev = events.clone();
        let ct = cancel.clone();
        handles.push(tokio::spawn(async move {
            run_tls_host(identity, username, tls_port, known_peers, ev, ct).await;
        }));
    }

    {
        let own_username = cfg.username.clone();
        let identity = identity.clone();
        let known_peers = known_peers.clone();
        let discovered = discovered.clone();
        let ev = events.clone();
        let ct = cancel.clone();
        handles.push(tokio::spawn(async move {
            run_peer_connector(own_username, identity, known_peers, discovered, ev, ct).await;
        }));
    }

    let _ = events.send(RuntimeEvent::log(Level::Info, format!("overlay started: discovery_port={discovery_port}, tls_port={tls_port}"))).await;

    Ok(OverlayTasks { cancel, handles, peers: known_peers })
}

/// Periodically scan discovered peers and dial any we haven't connected
/// to yet. Connection initiation follows the teacher's server-decided
/// rule (the lexicographically greater identity dials), here applied to
/// usernames instead of session-scoped device ids.
async fn run_peer_connector(
    own_username: String,
    identity: Arc<LocalIdentity>,
    known_peers: PeerRegistry,
    discovered: DiscoveredPeers,
    events: mpsc::Sender<RuntimeEvent>,
    cancel: CancellationToken,
) {
    let mut dialed: HashSet<String> = HashSet::new();

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = sleep(Duration::from_secs(CONNECTOR_SCAN_INTERVAL_SECS)) => {}
        }
        if cancel.is_cancelled() {
            break;
        }

        for peer in get_discovered_peers(&discovered) {
            if own_username <= peer.username || dialed.contains(&peer.username) {
                continue;
            }
            let Ok(ip) = peer.addr.parse::<std::net::Ipv4Addr>() else { continue };
            known_peers.register_from_beacon(&peer.username, &peer.ssh_public_key, ip, peer.tls_port);

            dialed.insert(peer.username.clone());
            let addr = SocketAddr::new(ip.into(), peer.tls_port);
            let expected_fingerprint = match peer.ssh_public_key.parse::<PublicKey>() {
                Ok(key) => identity::fingerprint(&key),
                Err(_) => continue,
            };

            let identity = identity.clone();
            let own_username = own_username.clone();
            let known_peers = known_peers.clone();
            let ev = events.clone();
            let ct = cancel.child_token();
            tokio::spawn(async move {
                run_tls_client(addr, identity, own_username, expected_fingerprint, known_peers, ev, ct).await;
            });
        }
    }
}
