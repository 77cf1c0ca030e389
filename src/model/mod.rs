pub mod connection;
pub mod device;
pub mod peer;

pub use connection::{Connection, ConnectionType};
pub use device::{Device, GatewayRole, MacAddr};
pub use peer::PeerIdentity;

use std::time::{SystemTime, UNIX_EPOCH};

/// Current UNIX timestamp in seconds — the one clock TLScope uses
/// everywhere (device/connection timestamps, peer bookkeeping, eviction).
pub fn now_unix_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}
