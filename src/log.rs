//! Logging setup.
//!
//! Mirrors the teacher's `log.rs`: a terminal logger for interactive use
//! plus a rotated file logger under the platform data directory, combined
//! through `simplelog::CombinedLogger`. TLScope has no separate frontend
//! process, so there's only the one file target.

use anyhow::{Context, Result};
use simplelog::{
    ColorChoice, CombinedLogger, ConfigBuilder, LevelFilter, SharedLogger, TermLogger,
    TerminalMode, WriteLogger,
};
use std::fs::File;
use std::path::PathBuf;

use crate::config::LoggingConfig;

fn level_filter(level: &str) -> LevelFilter {
    match level.to_ascii_lowercase().as_str() {
        "trace" => LevelFilter::Trace,
        "debug" => LevelFilter::Debug,
        "warn" => LevelFilter::Warn,
        "error" => LevelFilter::Error,
        "off" => LevelFilter::Off,
        _ => LevelFilter::Info,
    }
}

pub fn setup_logger(cfg: &LoggingConfig) -> Result<()> {
    let filter = level_filter(&cfg.level);

    let term_config = ConfigBuilder::new()
        .set_time_offset_to_local()
        .unwrap_or_else(|b| b)
        .build();

    let mut loggers: Vec<Box<dyn SharedLogger>> = vec![TermLogger::new(
        filter,
        term_config,
        TerminalMode::Mixed,
        ColorChoice::Auto,
    )];

    let log_path = cfg.file.clone().unwrap_or_else(default_log_path);
    if let Some(parent) = log_path.parent() {
        std::fs::create_dir_all(parent).context("failed to create log directory")?;
    }
    let file = File::create(&log_path)
        .with_context(|| format!("failed to create log file at {}", log_path.display()))?;
    let file_config = ConfigBuilder::new()
        .set_time_offset_to_local()
        .unwrap_or_else(|b| b)
        .build();
    loggers.push(WriteLogger::new(LevelFilter::Debug, file_config, file));

    CombinedLogger::init(loggers).ok();
    log::info!("tlscope logging initialized (level={})", cfg.level);
    Ok(())
}

fn default_log_path() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("tlscope")
        .join("tlscope.log")
}
