//! Fatal, start-up-time errors.
//!
//! Everything on the observation path (malformed packets, policy
//! rejections, transient I/O, auth failures) is recovered locally and
//! never turns into one of these — see the component modules for that.
//! `TlscopeError` is reserved for the handful of conditions that should
//! abort the process with a non-zero exit code.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum TlscopeError {
    #[error("no usable capture interface found")]
    NoCaptureInterface,

    #[error("failed to open capture on interface {iface}: {source}")]
    CaptureOpen {
        iface: String,
        #[source]
        source: std::io::Error,
    },

    #[error("overlay is enabled but no SSH private key is configured")]
    MissingSshKey,

    #[error("failed to load SSH key at {path}: {source}")]
    SshKeyLoad {
        path: String,
        #[source]
        source: ssh_key::Error,
    },

    #[error("failed to bind discovery socket on port {port}: {source}")]
    DiscoveryBind {
        port: u16,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to bind TLS listener on port {port}: {source}")]
    TransportBind {
        port: u16,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

pub type Result<T> = std::result::Result<T, TlscopeError>;
