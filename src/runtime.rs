//! Top-level orchestrator — wires every component into one
//! `RuntimeHandle`/`RuntimeWorker` pair, generalizing the teacher's
//! `GUI/src/runtime::spawn_runtime` (command channel in, event channel
//! out, a `RuntimeWorker` owning the active task set) from a clipboard
//! relay to TLScope's capture + overlay engine.

use std::net::Ipv4Addr;
use std::sync::Arc;

use anyhow::{Context, Result};
use log::Level;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::capture::{self, CaptureTasks};
use crate::config::Config;
use crate::error::TlscopeError;
use crate::events::RuntimeEvent;
use crate::filter::FilterPolicy;
use crate::gateway::GatewayDetector;
use crate::graph::TopologyGraph;
use crate::overlay::identity::LocalIdentity;
use crate::overlay::{self, OverlayTasks};
use crate::persistence::{AsyncPersistenceWriter, NoopSink, PersistenceSink};
use crate::scanner::{self, scan_pending_device};

/// Options accepted by [`RuntimeHandle::start`]. `no_capture` mirrors the
/// CLI's `start --no-capture` flag (overlay-only operation, useful for a
/// peer that only wants to advertise itself).
#[derive(Debug, Clone)]
pub struct StartOptions {
    pub config: Config,
    pub no_capture: bool,
}

enum RuntimeCommand {
    Start(StartOptions),
    Stop,
    Shutdown,
}

#[derive(Clone)]
pub struct RuntimeHandle {
    command_tx: mpsc::Sender<RuntimeCommand>,
}

impl RuntimeHandle {
    pub async fn start(&self, options: StartOptions) -> Result<()> {
        self.command_tx.send(RuntimeCommand::Start(options)).await.context("sending start command")
    }

    pub async fn stop(&self) -> Result<()> {
        self.command_tx.send(RuntimeCommand::Stop).await.context("sending stop command")
    }

    pub async fn shutdown(&self) -> Result<()> {
        self.command_tx.send(RuntimeCommand::Shutdown).await.context("sending shutdown command")
    }
}

/// Spawn the runtime worker onto `handle` and return a
/// ([`RuntimeHandle`], event receiver) pair, the same shape the teacher's
/// `spawn_runtime` hands back to its caller.
pub fn spawn_runtime(handle: &tokio::runtime::Handle, sink: Box<dyn PersistenceSink>) -> (RuntimeHandle, mpsc::Receiver<RuntimeEvent>) {
    let (command_tx, command_rx) = mpsc::channel(32);
    let (event_tx, event_rx) = mpsc::channel(1024);

    let mut worker = RuntimeWorker::new(event_tx, sink);
    handle.spawn(async move {
        worker.run(command_rx).await;
    });

    (RuntimeHandle { command_tx }, event_rx)
}

struct ActiveTasks {
    cancel: CancellationToken,
    graph: Arc<Mutex<TopologyGraph>>,
    capture: Option<CaptureTasks>,
    overlay: Option<OverlayTasks>,
    persistence_handle: JoinHandle<()>,
}

struct RuntimeWorker {
    events: mpsc::Sender<RuntimeEvent>,
    active: Option<ActiveTasks>,
    sink: Option<Box<dyn PersistenceSink>>,
}

impl RuntimeWorker {
    fn new(events: mpsc::Sender<RuntimeEvent>, sink: Box<dyn PersistenceSink>) -> Self {
        Self { events, active: None, sink: Some(sink) }
    }

    async fn run(&mut self, mut commands: mpsc::Receiver<RuntimeCommand>) {
        while let Some(cmd) = commands.recv().await {
            match cmd {
                RuntimeCommand::Start(options) => {
                    if let Err(e) = self.start_tasks(options).await {
                        let _ = self.events.send(RuntimeEvent::Error(e.to_string())).await;
                    }
                }
                RuntimeCommand::Stop => self.stop_tasks(false).await,
                RuntimeCommand::Shutdown => {
                    self.stop_tasks(true).await;
                    break;
                }
            }
        }
    }

    async fn start_tasks(&mut self, options: StartOptions) -> Result<()> {
        if self.active.is_some() {
            let _ = self.events.send(RuntimeEvent::log(Level::Info, "runtime already started")).await;
            return Ok(());
        }

        let cfg = options.config;
        let cancel = CancellationToken::new();
        let graph = Arc::new(Mutex::new(TopologyGraph::new()));
        let filter_policy = Arc::new(FilterPolicy::new(cfg.filters.clone()));
        let gateway = Arc::new(Mutex::new(GatewayDetector::new()));
        let peer_registry = overlay::PeerRegistry::new();

        let sink = self.sink.take().unwrap_or_else(|| Box::new(NoopSink));
        let loaded = sink.load_devices().await;
        let (writer, persistence_handle) = AsyncPersistenceWriter::spawn(sink, cancel.clone());
        let writer = Arc::new(writer);
        {
            let mut g = graph.lock();
            let loaded_count = loaded.len();
            for device in loaded {
                g.add_device(device);
            }
            drop(g);
            if loaded_count > 0 {
                let _ = self
                    .events
                    .send(RuntimeEvent::log(Level::Info, format!("loaded {loaded_count} devices from persistence")))
                    .await;
            }
        }

        let capture = if options.no_capture {
            None
        } else {
            match capture::start_capture(
                cfg.capture.clone(),
                filter_policy.clone(),
                graph.clone(),
                gateway.clone(),
                peer_registry.clone(),
                self.events.clone(),
                cancel.child_token(),
                Some(writer.clone()),
            ) {
                Ok(tasks) => Some(tasks),
                Err(TlscopeError::NoCaptureInterface) => {
                    let _ = self
                        .events
                        .send(RuntimeEvent::log(Level::Warn, "no usable capture interface; running without packet ingest"))
                        .await;
                    None
                }
                Err(e) => return Err(e.into()),
            }
        };

        let overlay_tasks = if cfg.overlay.enabled {
            let identity = load_overlay_identity(&cfg)?;
            let tasks = overlay::start_overlay(&cfg.overlay, identity, self.events.clone(), cancel.child_token()).await?;
            tasks.peers.set_graph_sync_sink(graph.clone());
            Some(tasks)
        } else {
            None
        };

        let _ = self.events.send(RuntimeEvent::Status("running".to_string())).await;
        self.active = Some(ActiveTasks { cancel, graph, capture, overlay: overlay_tasks, persistence_handle });
        Ok(())
    }

    async fn stop_tasks(&mut self, hard: bool) {
        if let Some(active) = self.active.take() {
            active.cancel.cancel();
            if let Some(capture) = active.capture {
                // CaptureTasks has no graceful join surface distinct from
                // abort: the capture thread is blocked in a read with a
                // bounded timeout, so aborting its bridge task is the only
                // way to reclaim it promptly either way.
                capture.abort();
            }
            if let Some(overlay_tasks) = active.overlay {
                if hard {
                    overlay_tasks.abort();
                } else {
                    overlay_tasks.shutdown().await;
                }
            }
            active.persistence_handle.abort();
        }
        let _ = self.events.send(RuntimeEvent::Status("stopped".to_string())).await;
    }
}

fn load_overlay_identity(cfg: &Config) -> Result<Arc<LocalIdentity>> {
    if !cfg.overlay.ssh_private_key_path.exists() {
        return Err(TlscopeError::MissingSshKey.into());
    }
    let identity = crate::overlay::identity::load_identity(&cfg.overlay.ssh_private_key_path, &cfg.overlay.username)?;
    Ok(Arc::new(identity))
}

/// Run a one-shot ping sweep and fold every responder into `graph` as a
/// scan-pending device, matching the `scan` CLI subcommand's contract.
pub async fn run_scan(
    cfg: &Config,
    graph: Arc<Mutex<TopologyGraph>>,
    events: mpsc::Sender<RuntimeEvent>,
) -> scanner::ScanSummary {
    let subnet_base = cfg
        .scan
        .subnet
        .as_ref()
        .and_then(|s| s.parse::<Ipv4Addr>().ok())
        .or_else(detect_active_subnet)
        .unwrap_or(Ipv4Addr::new(192, 168, 1, 0));

    let graph_for_hosts = graph.clone();
    scanner::run_sweep(subnet_base, &cfg.scan, &cfg.filters, events, move |result| {
        let mut g = graph_for_hosts.lock();
        g.add_device(scan_pending_device(result.ip));
    })
    .await
}

/// First three octets of the active interface's IPv4 address, the
/// subnet auto-detection the spec calls for when no `--subnet` is given.
fn detect_active_subnet() -> Option<Ipv4Addr> {
    let interfaces = netdev::get_interfaces();
    let active = interfaces.into_iter().find(|i| !i.is_loopback() && i.is_up() && !i.ipv4.is_empty())?;
    let ip: Ipv4Addr = active.ipv4.first()?.to_string().parse().ok()?;
    let o = ip.octets();
    Some(Ipv4Addr::new(o[0], o[1], o[2], 0))
}
