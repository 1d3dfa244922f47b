//! Tracing setup for plugin processes.
//!
//! Stdout belongs to the handshake, so logs go to stderr or, when a log
//! directory is configured, to a daily rolling file.

use std::path::PathBuf;
use std::sync::OnceLock;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use strum_macros::{Display, EnumString};
use tracing::level_filters::LevelFilter;
use tracing_appender::rolling::daily;
use tracing_subscriber::prelude::*;
use tracing_subscriber::{EnvFilter, fmt};

/// What log levels are supported?
/// Higher‐value variants are more severe.
#[derive(Debug, Copy, Clone, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash, Default, EnumString, Display)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase", ascii_case_insensitive)]
pub enum LogLevel {
    Trace = 0,
    Debug = 1,
    #[default]
    Info = 2,
    Warn = 3,
    Error = 4,
    Critical = 5,
}

impl From<LogLevel> for LevelFilter {
    fn from(level: LogLevel) -> Self {
        match level {
            LogLevel::Trace => LevelFilter::TRACE,
            LogLevel::Debug => LevelFilter::DEBUG,
            LogLevel::Info => LevelFilter::INFO,
            LogLevel::Warn => LevelFilter::WARN,
            LogLevel::Error | LogLevel::Critical => LevelFilter::ERROR,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash, Default)]
#[serde(default)]
pub struct LogConfig {
    pub log_level: LogLevel,
    pub log_dir: Option<PathBuf>,
}

impl LogConfig {
    pub fn new(log_level: LogLevel, log_dir: Option<PathBuf>) -> Self {
        Self { log_level, log_dir }
    }

    /// `RUST_LOG` wins when set; otherwise the configured level applies to everything.
    fn filter(&self) -> EnvFilter {
        EnvFilter::builder()
            .with_default_directive(LevelFilter::from(self.log_level).into())
            .from_env_lossy()
    }
}

static LOG_INIT: OnceLock<()> = OnceLock::new();

/// Installs the global tracing subscriber. Later calls are no-ops.
pub fn init_logging(config: &LogConfig) -> Result<()> {
    if LOG_INIT.get().is_some() {
        return Ok(());
    }

    let result = match &config.log_dir {
        Some(dir) => {
            std::fs::create_dir_all(dir)
                .with_context(|| format!("creating log directory {}", dir.display()))?;
            let file_app = daily(dir, "plugin.log");
            tracing_subscriber::registry()
                .with(
                    fmt::layer()
                        .with_ansi(false)
                        .with_target(false)
                        .with_writer(file_app)
                        .with_filter(config.filter()),
                )
                .try_init()
        }
        None => tracing_subscriber::registry()
            .with(
                fmt::layer()
                    .with_writer(std::io::stderr)
                    .with_target(false)
                    .with_filter(config.filter()),
            )
            .try_init(),
    };
    result.context("failed to install tracing subscriber")?;

    let _ = LOG_INIT.set(());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn levels_parse_case_insensitively() {
        assert_eq!("WARN".parse::<LogLevel>().unwrap(), LogLevel::Warn);
        assert_eq!("critical".parse::<LogLevel>().unwrap(), LogLevel::Critical);
        assert!("verbose".parse::<LogLevel>().is_err());
    }

    #[test]
    fn critical_maps_to_error_filter() {
        assert_eq!(LevelFilter::from(LogLevel::Critical), LevelFilter::ERROR);
        assert!(LogLevel::Critical > LogLevel::Error);
    }
}
