//! Ping Sweeper — bounded-concurrency ICMP echo scan of a subnet.
//!
//! One shared raw ICMP socket per sweep: a dedicated `std::thread` reads
//! replies and demultiplexes them by sequence number to whichever probe
//! is waiting, via a registry of oneshot channels. Probes themselves run
//! under a `Semaphore` of `max_concurrency`, the same bounded-fan-out
//! shape the capture thread uses for packet ingest.

use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use pnet::packet::icmp::echo_reply::EchoReplyPacket;
use pnet::packet::icmp::echo_request::MutableEchoRequestPacket;
use pnet::packet::icmp::{checksum, IcmpPacket, IcmpTypes};
use pnet::packet::Packet;
use pnet::transport::{self, icmp_packet_iter, TransportChannelType, TransportProtocol};
use tokio::sync::{mpsc, oneshot, Semaphore};
use tokio::time::timeout;

use crate::address::is_utility;
use crate::config::{FilterConfig, ScanConfig};
use crate::events::RuntimeEvent;
use crate::model::{now_unix_secs, Device};

pub struct ScanResult {
    pub ip: Ipv4Addr,
    pub rtt_ms: u64,
}

pub struct ScanSummary {
    pub responsive_hosts: usize,
    pub total_scanned: usize,
    pub duration_ms: u64,
    pub subnet: String,
}

static ICMP_SEQ: AtomicU16 = AtomicU16::new(1);
const ICMP_IDENTIFIER_BASE: u16 = 0xa5a5;

type PendingReplies = Arc<Mutex<HashMap<(Ipv4Addr, u16), oneshot::Sender<Instant>>>>;

/// A raw ICMP socket shared by every probe in one sweep, plus the
/// background thread that demultiplexes replies.
struct IcmpProbe {
    pending: PendingReplies,
}

impl IcmpProbe {
    fn spawn() -> Option<(Self, std::thread::JoinHandle<()>, Arc<Mutex<Option<transport::TransportSender>>>)> {
        let protocol = TransportChannelType::Layer4(TransportProtocol::Ipv4(pnet::packet::ip::IpNextHeaderProtocols::Icmp));
        let (tx, mut rx) = transport::transport_channel(4096, protocol).ok()?;
        let pending: PendingReplies = Arc::new(Mutex::new(HashMap::new()));
        let pending_for_thread = pending.clone();

        let handle = std::thread::Builder::new()
            .name("tlscope-icmp-listener".into())
            .spawn(move || {
                let mut iter = icmp_packet_iter(&mut rx);
                loop {
                    match iter.next() {
                        Ok((packet, addr)) => {
                            if packet.get_icmp_type() != IcmpTypes::EchoReply {
                                continue;
                            }
                            let Some(reply) = EchoReplyPacket::new(packet.packet()) else { continue };
                            let std::net::IpAddr::V4(ipv4) = addr else { continue };
                            let key = (ipv4, reply.get_sequence_number());
                            if let Some(sender) = pending_for_thread.lock().remove(&key) {
                                let _ = sender.send(Instant::now());
                            }
                        }
                        Err(_) => break,
                    }
                }
            })
            .ok()?;

        Some((IcmpProbe { pending }, handle, Arc::new(Mutex::new(Some(tx)))))
    }
}

/// Run a ping sweep over `subnet.{start..=end}`, calling `on_host` for
/// every response as it arrives and returning the overall summary.
pub async fn run_sweep(
    subnet_base: Ipv4Addr,
    cfg: &ScanConfig,
    filter_cfg: &FilterConfig,
    events: mpsc::Sender<RuntimeEvent>,
    mut on_host: impl FnMut(ScanResult),
) -> ScanSummary {
    let octets = subnet_base.octets();
    let candidates: Vec<Ipv4Addr> = (cfg.host_range_start..=cfg.host_range_end)
        .map(|h| Ipv4Addr::new(octets[0], octets[1], octets[2], h))
        .filter(|ip| !is_utility(*ip, filter_cfg))
        .collect();

    let subnet_label = format!("{}.{}.{}.0/24", octets[0], octets[1], octets[2]);
    let total = candidates.len();
    let _ = events.send(RuntimeEvent::ScanStarted { subnet: subnet_label.clone(), total_hosts: total }).await;
    let started = Instant::now();

    let Some((probe, _listener, sender)) = IcmpProbe::spawn() else {
        let _ = events.send(RuntimeEvent::log(log::Level::Error, "failed to open raw ICMP socket for sweep")).await;
        return ScanSummary { responsive_hosts: 0, total_scanned: total, duration_ms: 0, subnet: subnet_label };
    };

    let semaphore = Arc::new(Semaphore::new(cfg.concurrency.max(1)));
    let (result_tx, mut result_rx) = mpsc::channel::<ScanResult>(total.max(1));
    let timeout_ms = cfg.timeout_ms;

    let mut join_set = tokio::task::JoinSet::new();
    for ip in candidates {
        let permit_src = semaphore.clone();
        let result_tx = result_tx.clone();
        let pending = probe.pending.clone();
        let sender = sender.clone();
        join_set.spawn(async move {
            let _permit = permit_src.acquire_owned().await.ok();
            if let Some(rtt) = probe_host(ip, timeout_ms, pending, sender).await {
                let _ = result_tx.send(ScanResult { ip, rtt_ms: rtt }).await;
            }
        });
    }
    drop(result_tx);

    let mut responsive = 0usize;
    while let Some(result) = result_rx.recv().await {
        responsive += 1;
        let _ = events.send(RuntimeEvent::ScanHostResponded { ip: result.ip.to_string(), rtt_ms: result.rtt_ms }).await;
        on_host(result);
    }
    while join_set.join_next().await.is_some() {}

    let duration_ms = started.elapsed().as_millis() as u64;
    let _ = events
        .send(RuntimeEvent::ScanCompleted { responsive_hosts: responsive, total_scanned: total, duration_ms })
        .await;

    ScanSummary { responsive_hosts: responsive, total_scanned: total, duration_ms, subnet: subnet_label }
}

async fn probe_host(
    target: Ipv4Addr,
    timeout_ms: u64,
    pending: PendingReplies,
    sender: Arc<Mutex<Option<transport::TransportSender>>>,
) -> Option<u64> {
    let seq = ICMP_SEQ.fetch_add(1, Ordering::Relaxed);
    let (reply_tx, reply_rx) = oneshot::channel();
    pending.lock().insert((target, seq), reply_tx);

    let started = Instant::now();
    let sent = tokio::task::spawn_blocking(move || send_echo_request(&sender, target, seq))
        .await
        .ok()?;
    if !sent {
        pending.lock().remove(&(target, seq));
        return None;
    }

    match timeout(Duration::from_millis(timeout_ms), reply_rx).await {
        Ok(Ok(_replied_at)) => Some(started.elapsed().as_millis() as u64),
        _ => {
            pending.lock().remove(&(target, seq));
            None
        }
    }
}

fn send_echo_request(sender: &Arc<Mutex<Option<transport::TransportSender>>>, target: Ipv4Addr, seq: u16) -> bool {
    let mut guard = sender.lock();
    let Some(tx) = guard.as_mut() else { return false };

    let mut buf = [0u8; 16];
    let sent = (|| -> Option<()> {
        let mut packet = MutableEchoRequestPacket::new(&mut buf)?;
        packet.set_icmp_type(IcmpTypes::EchoRequest);
        packet.set_identifier(ICMP_IDENTIFIER_BASE);
        packet.set_sequence_number(seq);
        let csum = checksum(&IcmpPacket::new(packet.packet())?);
        packet.set_checksum(csum);
        Some(())
    })();
    if sent.is_none() {
        return false;
    }
    let Some(packet) = IcmpPacket::new(&buf) else { return false };
    tx.send_to(packet, target.into()).is_ok()
}

/// Vendor label assigned to devices synthesized purely from a scan
/// response, before any packet carrying their real MAC has been seen.
pub const SCAN_PENDING_VENDOR: &str = "Scan Discovered (MAC pending)";

/// Build the placeholder device a scan consumer registers for each
/// responding host: synthetic MAC `"scan-pending-" + ip`, marked so the
/// duplicate-IP rule is suspended until packet ingest upgrades it.
pub fn scan_pending_device(ip: Ipv4Addr) -> Device {
    let now = now_unix_secs();
    let mut device = Device::new_virtual(ip, now);
    device.key = format!("scan-pending-{ip}");
    device.vendor = Some(SCAN_PENDING_VENDOR.to_string());
    device
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scan_pending_device_has_expected_key_and_vendor() {
        let d = scan_pending_device(Ipv4Addr::new(192, 168, 1, 40));
        assert_eq!(d.key, "scan-pending-192.168.1.40");
        assert_eq!(d.vendor.as_deref(), Some(SCAN_PENDING_VENDOR));
    }
}
