//! Runtime events — the single channel through which every background
//! task reports state changes to whatever external surface (CLI, log
//! tail, future UI) is watching. Generalizes the teacher's
//! `RuntimeEvent`/`RuntimeLogEvent` pair from a clipboard-sync app to a
//! passive network observer.

use log::Level;
use serde::Serialize;

use crate::model::now_unix_secs;

#[derive(Debug, Clone, Serialize)]
pub struct RuntimeLogEvent {
    #[serde(with = "level_serde")]
    pub level: Level,
    pub message: String,
    pub ts: u64,
}

impl RuntimeLogEvent {
    pub fn new(level: Level, message: impl Into<String>) -> Self {
        Self {
            level,
            message: message.into(),
            ts: now_unix_secs(),
        }
    }
}

mod level_serde {
    use log::Level;
    use serde::Serializer;

    pub fn serialize<S: Serializer>(level: &Level, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(level.as_str())
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type")]
pub enum RuntimeEvent {
    Status(String),
    Log(RuntimeLogEvent),
    DeviceDiscovered { key: String },
    DeviceUpdated { key: String },
    ConnectionDetected { source: String, destination: String, protocol: String },
    GatewayChanged { key: String, role: String },
    ScanStarted { subnet: String, total_hosts: usize },
    ScanHostResponded { ip: String, rtt_ms: u64 },
    ScanCompleted { responsive_hosts: usize, total_scanned: usize, duration_ms: u64 },
    PeerDiscovered { username: String, ip: String },
    PeerConnected { username: String },
    PeerDisconnected { username: String },
    PeerVerified { username: String },
    PeerRejected { username: String, reason: String },
    Error(String),
}

impl RuntimeEvent {
    pub fn log(level: Level, message: impl Into<String>) -> Self {
        RuntimeEvent::Log(RuntimeLogEvent::new(level, message))
    }
}
