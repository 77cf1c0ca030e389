//! Packet Ingest — live capture, classification, and folding into the
//! topology graph.
//!
//! Capture itself runs on a dedicated `std::thread` (pnet's datalink
//! channel is a blocking callback-style API with no async adapter) and
//! forwards raw frames to the async world over a bounded channel, the
//! same "blocking producer, async consumer" split the teacher uses for
//! its native clipboard-watcher thread.

pub mod parse;

use std::net::Ipv4Addr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use hickory_resolver::config::{ResolverConfig, ResolverOpts};
use hickory_resolver::TokioAsyncResolver;
use log::Level;
use parking_lot::Mutex;
use pnet::datalink::{self, Channel, NetworkInterface};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::address;
use crate::config::CaptureConfig;
use crate::events::RuntimeEvent;
use crate::filter::FilterPolicy;
use crate::gateway::GatewayDetector;
use crate::graph::TopologyGraph;
use crate::model::{now_unix_secs, Device, MacAddr};
use crate::overlay::PeerRegistry;
use crate::persistence::{AsyncPersistenceWriter, PersistenceOp};
use parse::{ParsedFrame, TransportProto, DISCOVERY_PORT, TLS_PEER_PORT};

pub const CLEANUP_INTERVAL_SECS: u64 = 45;
pub const PTR_LOOKUP_TIMEOUT_SECS: u64 = 2;

/// Set once `start_capture` has finished wiring up the channel and
/// spawning its workers. Observations folded into the graph before the
/// latch flips still mutate state but never emit public events — this
/// keeps library-initialization noise (e.g. an initial ARP cache replay)
/// from looking like fresh discoveries.
#[derive(Clone, Default)]
pub struct CaptureReadyLatch(Arc<AtomicBool>);

impl CaptureReadyLatch {
    fn set(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    fn is_ready(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// A raw captured frame handed from the capture thread to the async
/// ingest task.
pub struct CapturedFrame {
    pub bytes: Vec<u8>,
    pub timestamp: u64,
}

pub struct CaptureTasks {
    pub cancel: CancellationToken,
    pub handles: Vec<JoinHandle<()>>,
}

impl CaptureTasks {
    pub fn abort(self) {
        self.cancel.cancel();
        for h in self.handles {
            h.abort();
        }
    }
}

fn pick_interface(cfg: &CaptureConfig) -> Option<NetworkInterface> {
    let interfaces = datalink::interfaces();
    if let Some(name) = &cfg.interface {
        return interfaces.into_iter().find(|i| &i.name == name);
    }
    interfaces
        .into_iter()
        .find(|i| !i.is_loopback() && i.is_up() && !i.ips.is_empty())
}

/// Spawn the capture thread and the async ingest loop that consumes it.
pub fn start_capture(
    cfg: CaptureConfig,
    filter_policy: Arc<FilterPolicy>,
    graph: Arc<Mutex<TopologyGraph>>,
    gateway: Arc<Mutex<GatewayDetector>>,
    peer_registry: PeerRegistry,
    events: mpsc::Sender<RuntimeEvent>,
    cancel: CancellationToken,
    writer: Option<Arc<AsyncPersistenceWriter>>,
) -> crate::error::Result<CaptureTasks> {
    let interface = pick_interface(&cfg).ok_or(crate::error::TlscopeError::NoCaptureInterface)?;
    let iface_name = interface.name.clone();

    let channel_config = datalink::Config {
        promiscuous: cfg.promiscuous,
        read_timeout: Some(Duration::from_millis(cfg.read_timeout_ms)),
        ..Default::default()
    };

    let channel = datalink::channel(&interface, channel_config).map_err(|source| {
        crate::error::TlscopeError::CaptureOpen { iface: iface_name.clone(), source }
    })?;
    let (_, mut rx) = match channel {
        Channel::Ethernet(tx, rx) => (tx, rx),
        _ => {
            return Err(crate::error::TlscopeError::CaptureOpen {
                iface: iface_name,
                source: std::io::Error::new(std::io::ErrorKind::Unsupported, "unsupported channel type"),
            })
        }
    };

    let (frame_tx, frame_rx) = mpsc::channel::<CapturedFrame>(1024);
    let thread_cancel = cancel.clone();

    let capture_thread = std::thread::Builder::new()
        .name("tlscope-capture".into())
        .spawn(move || {
            while !thread_cancel.is_cancelled() {
                match rx.next() {
                    Ok(bytes) => {
                        let frame = CapturedFrame { bytes: bytes.to_vec(), timestamp: now_unix_secs() };
                        if frame_tx.blocking_send(frame).is_err() {
                            break;
                        }
                    }
                    Err(ref e) if e.kind() == std::io::ErrorKind::TimedOut => continue,
                    Err(_) => continue,
                }
            }
        })
        .expect("failed to spawn capture thread");

    // The std::thread::JoinHandle isn't awaitable from async code; park it
    // behind a tokio task that blocks on join so `CaptureTasks` has a
    // uniform `JoinHandle<()>` surface like every other subsystem.
    let join_bridge = tokio::task::spawn_blocking(move || {
        let _ = capture_thread.join();
    });
    let bridge_handle = tokio::spawn(async move {
        let _ = join_bridge.await;
    });

    let ready = CaptureReadyLatch::default();

    let ingest_handle = tokio::spawn(run_ingest_loop(
        frame_rx,
        filter_policy,
        graph.clone(),
        gateway.clone(),
        peer_registry,
        events.clone(),
        cancel.clone(),
        ready.clone(),
        writer.clone(),
    ));

    let cleanup_handle = tokio::spawn(run_cleanup_sidecar(graph, gateway, events, cancel.clone(), writer));

    // Per the spec's ordering guarantee: the latch flips only once every
    // worker this call spawned is live, so nothing racing ahead of it can
    // have already emitted a public event.
    ready.set();

    Ok(CaptureTasks {
        cancel,
        handles: vec![bridge_handle, ingest_handle, cleanup_handle],
    })
}

async fn run_ingest_loop(
    mut frame_rx: mpsc::Receiver<CapturedFrame>,
    filter_policy: Arc<FilterPolicy>,
    graph: Arc<Mutex<TopologyGraph>>,
    gateway: Arc<Mutex<GatewayDetector>>,
    peer_registry: PeerRegistry,
    events: mpsc::Sender<RuntimeEvent>,
    cancel: CancellationToken,
    ready: CaptureReadyLatch,
    writer: Option<Arc<AsyncPersistenceWriter>>,
) {
    let resolver = build_resolver();
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            frame = frame_rx.recv() => {
                match frame {
                    Some(frame) => process_frame(&frame, &filter_policy, &graph, &gateway, &peer_registry, &events, &ready, resolver.as_ref(), writer.as_ref()).await,
                    None => break,
                }
            }
        }
    }
}

/// Build the async PTR resolver once per capture session. A failure to
/// read system DNS configuration (e.g. in a minimal container) just
/// disables hostname resolution — it is never fatal to capture.
fn build_resolver() -> Option<TokioAsyncResolver> {
    Some(TokioAsyncResolver::tokio(ResolverConfig::default(), ResolverOpts::default()))
}

/// Spawn a non-blocking PTR lookup for a newly observed physical device.
/// Bounded by [`PTR_LOOKUP_TIMEOUT_SECS`] and never awaited by the ingest
/// loop itself — a slow or absent resolver must never stall capture.
fn spawn_ptr_lookup(
    resolver: Option<&TokioAsyncResolver>,
    graph: Arc<Mutex<TopologyGraph>>,
    events: mpsc::Sender<RuntimeEvent>,
    key: String,
    ip: Ipv4Addr,
    ready: CaptureReadyLatch,
    writer: Option<Arc<AsyncPersistenceWriter>>,
) {
    let Some(resolver) = resolver.cloned() else { return };
    tokio::spawn(async move {
        let lookup = tokio::time::timeout(Duration::from_secs(PTR_LOOKUP_TIMEOUT_SECS), resolver.reverse_lookup(ip.into()));
        let Ok(Ok(response)) = lookup.await else { return };
        let Some(name) = response.iter().next() else { return };
        let hostname = name.to_string().trim_end_matches('.').to_string();

        let mut g = graph.lock();
        let Some(mut updated) = g.device_by_key(&key).cloned() else { return };
        updated.hostname = Some(hostname);
        g.update_device(&key, &updated);
        drop(g);

        if let Some(writer) = &writer {
            writer.enqueue(PersistenceOp::SaveDevice(updated));
        }
        if ready.is_ready() {
            let _ = events.send(RuntimeEvent::DeviceUpdated { key }).await;
        }
    });
}

#[allow(clippy::too_many_arguments)]
async fn process_frame(
    frame: &CapturedFrame,
    filter_policy: &FilterPolicy,
    graph: &Arc<Mutex<TopologyGraph>>,
    gateway: &Arc<Mutex<GatewayDetector>>,
    peer_registry: &PeerRegistry,
    events: &mpsc::Sender<RuntimeEvent>,
    ready: &CaptureReadyLatch,
    resolver: Option<&TokioAsyncResolver>,
    writer: Option<&Arc<AsyncPersistenceWriter>>,
) {
    match parse::parse_ethernet_frame(&frame.bytes) {
        ParsedFrame::Arp(obs) => {
            if address::is_utility_mac(obs.sender_mac.as_str()) || address::is_utility(obs.sender_ip, &filter_policy.config) {
                filter_policy.record_utility_filtered();
                return;
            }
            let mut g = graph.lock();
            let is_new = g.device_by_key(obs.sender_mac.as_str()).is_none();
            let mut device = Device::new_physical(obs.sender_mac.clone(), Some(obs.sender_ip), frame.timestamp);
            if is_new {
                device.vendor = crate::oui::lookup(obs.sender_mac.as_str()).map(str::to_string);
            }
            g.add_device(device);
            let saved = g.device_by_key(obs.sender_mac.as_str()).cloned();
            drop(g);
            if let (Some(writer), Some(saved)) = (writer, saved) {
                writer.enqueue(PersistenceOp::SaveDevice(saved));
            }
            gateway.lock().record_arp_observation(obs.sender_mac.as_str(), obs.target_ip);
            if is_new {
                if ready.is_ready() {
                    let _ = events.send(RuntimeEvent::DeviceDiscovered { key: obs.sender_mac.as_str().to_string() }).await;
                }
                spawn_ptr_lookup(resolver, graph.clone(), events.clone(), obs.sender_mac.as_str().to_string(), obs.sender_ip, ready.clone(), writer.cloned());
            }
        }
        ParsedFrame::Ipv4(mut obs) => {
            if let Some(dst_mac) = parse::destination_mac(&frame.bytes) {
                obs.dst_mac = dst_mac;
            }

            if filter_policy.config.filter_non_local
                && !(address::is_local(obs.src_ip) && address::is_local(obs.dst_ip))
            {
                filter_policy.record_non_local_filtered();
                return;
            }
            if filter_policy.config.filter_http
                && (obs.src_port.map(FilterPolicy::is_http_port).unwrap_or(false)
                    || obs.dst_port.map(FilterPolicy::is_http_port).unwrap_or(false))
            {
                filter_policy.record_http_filtered();
                return;
            }

            let bytes = obs.payload_len as u64;
            let src_key = observe_device(graph, filter_policy, obs.src_mac.clone(), obs.src_ip, bytes, frame.timestamp, events, ready, resolver, writer).await;
            let dst_key = observe_device(graph, filter_policy, obs.dst_mac.clone(), obs.dst_ip, bytes, frame.timestamp, events, ready, resolver, writer).await;

            if let (Some(src_key), Some(dst_key)) = (src_key, dst_key) {
                let protocol = obs.protocol;
                let dst_is_virtual = dst_key.starts_with("virtual-");
                let dst_is_local = address::is_local(obs.dst_ip);
                let conn_type = TopologyGraph::classify_connection(dst_is_virtual, dst_is_local, Some(obs.ttl));

                let mut g = graph.lock();
                let src_device = g.device_by_key(&src_key).cloned();
                let dst_device = g.device_by_key(&dst_key).cloned();
                if let (Some(src_device), Some(dst_device)) = (src_device, dst_device) {
                    let is_new = g.add_connection(
                        src_device,
                        dst_device,
                        protocol.label(),
                        obs.src_port,
                        obs.dst_port,
                        bytes,
                        Some(obs.ttl),
                    );
                    let is_tls_peer_port = obs.src_port == Some(TLS_PEER_PORT) || obs.dst_port == Some(TLS_PEER_PORT);
                    if is_tls_peer_port {
                        g.mark_tls_peer_connection(&src_key, &dst_key, protocol.label());
                    } else {
                        g.set_edge_type_if_unset(&src_key, &dst_key, protocol.label(), conn_type);
                    }
                    let saved_connection = g.connection_between(&src_key, &dst_key, protocol.label()).cloned();
                    drop(g);
                    if let (Some(writer), Some(connection)) = (writer, saved_connection) {
                        writer.enqueue(PersistenceOp::SaveConnection(connection));
                    }
                    if is_new && ready.is_ready() {
                        let _ = events
                            .send(RuntimeEvent::ConnectionDetected { source: src_key, destination: dst_key, protocol: protocol.label().to_string() })
                            .await;
                    }
                }
            }

            if matches!(obs.protocol, TransportProto::Udp) {
                if let Some(dhcp) = obs.dhcp {
                    observe_device(graph, filter_policy, dhcp.client_mac, dhcp.offered_ip, 0, frame.timestamp, events, ready, resolver, writer).await;
                }
                if obs.dst_port == Some(DISCOVERY_PORT) {
                    let _ = peer_registry; // discovery module owns this traffic; ingest just avoids double-counting.
                }
            }
        }
        ParsedFrame::Unsupported => {}
    }
}

/// Observe a device by MAC/IP. Rejects utility addresses and
/// duplicate-IP claims per policy; creates, updates, or (when MAC
/// resolution failed but the IP is legal) synthesizes a virtual device.
/// Returns the resolved device's graph key, if any.
#[allow(clippy::too_many_arguments)]
async fn observe_device(
    graph: &Arc<Mutex<TopologyGraph>>,
    filter_policy: &FilterPolicy,
    mac: MacAddr,
    ip: Ipv4Addr,
    bytes: u64,
    now: u64,
    events: &mpsc::Sender<RuntimeEvent>,
    ready: &CaptureReadyLatch,
    resolver: Option<&TokioAsyncResolver>,
    writer: Option<&Arc<AsyncPersistenceWriter>>,
) -> Option<String> {
    if address::is_utility_mac(mac.as_str()) || address::is_utility(ip, &filter_policy.config) {
        filter_policy.record_utility_filtered();
        return observe_virtual_device(graph, filter_policy, ip, bytes, now);
    }

    let mut g = graph.lock();
    let mut upgraded_from_scan_pending = false;
    if filter_policy.config.block_duplicate_ip {
        if let Some(holder) = g.device_by_ip(ip) {
            let holder_is_scan_placeholder = holder.vendor.as_deref() == Some(crate::scanner::SCAN_PENDING_VENDOR);
            if holder.key != mac.as_str() {
                if holder_is_scan_placeholder {
                    let old_key = holder.key.clone();
                    g.rekey_device(&old_key, mac.clone());
                    upgraded_from_scan_pending = true;
                } else {
                    filter_policy.record_duplicate_blocked();
                    return None;
                }
            }
        }
    }

    let is_new = g.device_by_key(mac.as_str()).is_none();
    let mut device = Device::new_physical(mac.clone(), Some(ip), now);
    if is_new || upgraded_from_scan_pending {
        device.vendor = crate::oui::lookup(mac.as_str()).map(str::to_string);
    }
    device.observe(Some(ip), bytes, now);
    let key = device.key.clone();
    g.add_device(device);
    let saved = g.device_by_key(&key).cloned();
    drop(g);

    if let (Some(writer), Some(saved)) = (writer, saved) {
        writer.enqueue(PersistenceOp::SaveDevice(saved));
    }
    if is_new {
        if ready.is_ready() {
            let _ = events.send(RuntimeEvent::DeviceDiscovered { key: key.clone() }).await;
        }
        spawn_ptr_lookup(resolver, graph.clone(), events.clone(), key.clone(), ip, ready.clone(), writer.cloned());
    } else if upgraded_from_scan_pending {
        if ready.is_ready() {
            let _ = events.send(RuntimeEvent::DeviceUpdated { key: key.clone() }).await;
        }
        spawn_ptr_lookup(resolver, graph.clone(), events.clone(), key.clone(), ip, ready.clone(), writer.cloned());
    }
    Some(key)
}

fn observe_virtual_device(
    graph: &Arc<Mutex<TopologyGraph>>,
    filter_policy: &FilterPolicy,
    ip: Ipv4Addr,
    bytes: u64,
    now: u64,
) -> Option<String> {
    if address::is_utility(ip, &filter_policy.config) {
        return None;
    }
    let mut g = graph.lock();
    let mut device = Device::new_virtual(ip, now);
    device.observe(Some(ip), bytes, now);
    let key = device.key.clone();
    g.add_device(device);
    Some(key)
}

/// Scheduled every [`CLEANUP_INTERVAL_SECS`]: evict idle devices and
/// reset per-connection rate windows.
async fn run_cleanup_sidecar(
    graph: Arc<Mutex<TopologyGraph>>,
    gateway: Arc<Mutex<GatewayDetector>>,
    events: mpsc::Sender<RuntimeEvent>,
    cancel: CancellationToken,
    writer: Option<Arc<AsyncPersistenceWriter>>,
) {
    let mut tick = tokio::time::interval(Duration::from_secs(CLEANUP_INTERVAL_SECS));
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = tick.tick() => {
                let evicted = {
                    let mut g = graph.lock();
                    g.reset_connection_rates();
                    g.cleanup_inactive_devices()
                };
                if !evicted.is_empty() {
                    let _ = events.send(RuntimeEvent::log(Level::Debug, format!("evicted {} inactive devices", evicted.len()))).await;
                    if let Some(writer) = &writer {
                        for key in evicted {
                            writer.enqueue(PersistenceOp::DeleteDevice(key));
                        }
                    }
                }
                gateway.lock().maybe_refresh(&graph, &events).await;
            }
        }
    }
}
