//! Layered TOML configuration.
//!
//! Resolution order mirrors the teacher's `runtime::config::Config` plus
//! the env-var override pattern used for TLS fallback credentials in the
//! original implementation: `TLSCOPE_CONFIG` env var path, then
//! `./tlscope.toml` in the working directory, then compiled-in defaults.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

fn default_username() -> String {
    "tlscope-node".to_string()
}

fn default_ssh_key_path() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".ssh/id_ed25519")
}

fn default_discovery_port() -> u16 {
    8442
}

fn default_tls_port() -> u16 {
    8443
}

fn default_ping_timeout_ms() -> u64 {
    500
}

fn default_ping_concurrency() -> usize {
    50
}

fn default_host_range_start() -> u8 {
    1
}

fn default_host_range_end() -> u8 {
    254
}

fn default_log_level() -> String {
    "info".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FilterConfig {
    pub filter_loopback: bool,
    pub filter_broadcast: bool,
    pub filter_multicast: bool,
    pub filter_link_local: bool,
    pub filter_reserved: bool,
    pub filter_http: bool,
    pub filter_non_local: bool,
    pub block_duplicate_ip: bool,
}

impl Default for FilterConfig {
    fn default() -> Self {
        Self {
            filter_loopback: true,
            filter_broadcast: true,
            filter_multicast: true,
            filter_link_local: true,
            filter_reserved: true,
            filter_http: false,
            filter_non_local: false,
            block_duplicate_ip: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CaptureConfig {
    /// `None` selects the first non-loopback interface.
    pub interface: Option<String>,
    pub promiscuous: bool,
    pub read_timeout_ms: u64,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            interface: None,
            promiscuous: true,
            read_timeout_ms: 1000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ScanConfig {
    pub subnet: Option<String>,
    pub host_range_start: u8,
    pub host_range_end: u8,
    pub timeout_ms: u64,
    pub concurrency: usize,
}

impl Default for ScanConfig {
    fn default() -> Self {
        Self {
            subnet: None,
            host_range_start: default_host_range_start(),
            host_range_end: default_host_range_end(),
            timeout_ms: default_ping_timeout_ms(),
            concurrency: default_ping_concurrency(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OverlayConfig {
    #[serde(default = "default_username")]
    pub username: String,
    #[serde(default = "default_ssh_key_path")]
    pub ssh_private_key_path: PathBuf,
    #[serde(default = "default_discovery_port")]
    pub discovery_port: u16,
    #[serde(default = "default_tls_port")]
    pub tls_port: u16,
    pub enabled: bool,
}

impl Default for OverlayConfig {
    fn default() -> Self {
        Self {
            username: default_username(),
            ssh_private_key_path: default_ssh_key_path(),
            discovery_port: default_discovery_port(),
            tls_port: default_tls_port(),
            enabled: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
    pub file: Option<PathBuf>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            file: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    pub filters: FilterConfig,
    pub capture: CaptureConfig,
    pub scan: ScanConfig,
    pub overlay: OverlayConfig,
    pub logging: LoggingConfig,
}

impl Config {
    /// Load configuration from a TOML file at `path`.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file: {}", path.display()))?;
        let config: Self = toml::from_str(&content)
            .with_context(|| format!("failed to parse config file: {}", path.display()))?;
        log::info!("loaded configuration from {}", path.display());
        Ok(config)
    }

    /// Resolve configuration the way the teacher resolves `Config`:
    /// environment variable override, then a well-known path, then
    /// compiled-in defaults.
    pub fn load_or_default() -> Self {
        if let Ok(env_path) = std::env::var("TLSCOPE_CONFIG") {
            let path = PathBuf::from(&env_path);
            match Self::load(&path) {
                Ok(cfg) => return cfg,
                Err(e) => {
                    log::warn!(
                        "TLSCOPE_CONFIG={} could not be loaded ({}), trying fallback",
                        path.display(),
                        e
                    );
                }
            }
        }

        let cwd_path = PathBuf::from("tlscope.toml");
        if cwd_path.exists() {
            match Self::load(&cwd_path) {
                Ok(cfg) => return cfg,
                Err(e) => {
                    log::warn!(
                        "{} exists but could not be loaded ({}), using defaults",
                        cwd_path.display(),
                        e
                    );
                }
            }
        }

        log::debug!("no config file found, using compiled-in defaults");
        Self::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let cfg = Config::default();
        assert!(cfg.filters.filter_loopback);
        assert!(cfg.filters.block_duplicate_ip);
        assert_eq!(cfg.overlay.discovery_port, 8442);
        assert_eq!(cfg.overlay.tls_port, 8443);
        assert_eq!(cfg.scan.host_range_start, 1);
        assert_eq!(cfg.scan.host_range_end, 254);
        assert_eq!(cfg.scan.concurrency, 50);
        assert_eq!(cfg.scan.timeout_ms, 500);
    }

    #[test]
    fn partial_toml_uses_defaults() {
        let toml_str = r#"
[capture]
interface = "eth0"
"#;
        let cfg: Config = toml::from_str(toml_str).unwrap();
        assert_eq!(cfg.capture.interface.as_deref(), Some("eth0"));
        assert!(cfg.capture.promiscuous);
        assert_eq!(cfg.overlay.discovery_port, 8442);
    }

    #[test]
    fn load_missing_file_errors() {
        let result = Config::load(Path::new("/nonexistent/tlscope.toml"));
        assert!(result.is_err());
    }

    #[test]
    fn load_from_file_round_trips() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("tlscope.toml");
        std::fs::write(
            &path,
            r#"
[overlay]
username = "alice"
tls_port = 9443
"#,
        )
        .unwrap();

        let cfg = Config::load(&path).unwrap();
        assert_eq!(cfg.overlay.username, "alice");
        assert_eq!(cfg.overlay.tls_port, 9443);
        assert_eq!(cfg.overlay.discovery_port, 8442);
    }
}
