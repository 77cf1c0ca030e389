//! TLScope — a passive LAN observer with an authenticated
//! peer-to-peer TLS overlay.
//!
//! The binary at `src/main.rs` is a thin CLI shell around this library;
//! everything that matters lives here so it can be exercised by tests
//! and, eventually, by whatever external surface (TUI, GUI, another
//! CLI) wants to embed it.

pub mod address;
pub mod capture;
pub mod config;
pub mod error;
pub mod events;
pub mod filter;
pub mod gateway;
pub mod graph;
pub mod log;
pub mod model;
pub mod oui;
pub mod overlay;
pub mod persistence;
pub mod runtime;
pub mod scanner;

pub use config::Config;
pub use error::{Result as TlscopeResult, TlscopeError};
pub use events::RuntimeEvent;
pub use runtime::{spawn_runtime, RuntimeHandle, StartOptions};
