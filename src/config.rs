use std::{env, path::PathBuf, str::FromStr, time::Duration};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::logging::{LogConfig, LogLevel};

pub const ENV_ADDR: &str = "PIPELINE_PLUGIN_ADDR";
pub const ENV_HANDSHAKE_FILE: &str = "PIPELINE_HANDSHAKE_FILE";
pub const ENV_DEFAULT_WINDOW: &str = "PIPELINE_DEFAULT_WINDOW";
pub const ENV_TEARDOWN_TIMEOUT_MS: &str = "PIPELINE_TEARDOWN_TIMEOUT_MS";
pub const ENV_CLOSED_SESSION_TTL_SECS: &str = "PIPELINE_CLOSED_SESSION_TTL_SECS";
pub const ENV_IDLE_BACKOFF_MS: &str = "PIPELINE_IDLE_BACKOFF_MS";
pub const ENV_WRITE_QUEUE_DEPTH: &str = "PIPELINE_WRITE_QUEUE_DEPTH";
pub const ENV_MAX_CONCURRENT_STREAMS: &str = "PIPELINE_MAX_CONCURRENT_STREAMS";
pub const ENV_LOG_LEVEL: &str = "PIPELINE_LOG_LEVEL";
pub const ENV_LOG_DIR: &str = "PIPELINE_LOG_DIR";

/// Process-wide settings for a plugin runtime.
///
/// Per-session configuration is not here: that arrives as an opaque blob with
/// every `createSession` call and is handed to the plugin's `init` hook.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct RuntimeConfig {
    /// Address to listen on. Port 0 picks a free port; the handshake reports it.
    pub listen_addr: String,
    /// Optional file that receives a copy of the handshake line.
    pub handshake_file: Option<PathBuf>,
    /// Credit granted when a source stream is opened without an explicit window.
    pub default_window: u64,
    /// How long a close waits for the plugin's teardown hook.
    pub teardown_timeout_ms: u64,
    /// How long closed session ids are remembered, so repeated closes stay no-ops.
    pub closed_session_ttl_secs: u64,
    /// Pause before re-reading after a source reported nothing ready or failed.
    pub idle_backoff_ms: u64,
    /// Unacknowledged batches a host may have outstanding on one sink write
    /// stream. Going past it fails the stream.
    pub write_queue_depth: usize,
    /// Open `openStream` / `openWrite` streams allowed per connection.
    pub max_concurrent_streams: usize,
    pub log: LogConfig,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            listen_addr: "127.0.0.1:0".to_string(),
            handshake_file: None,
            default_window: 20,
            teardown_timeout_ms: 5_000,
            closed_session_ttl_secs: 600,
            idle_backoff_ms: 10,
            write_queue_depth: 64,
            max_concurrent_streams: 100,
            log: LogConfig::default(),
        }
    }
}

impl RuntimeConfig {
    /// Loads `.env` (when present) and then reads `PIPELINE_*` variables.
    pub fn from_env() -> Result<Self> {
        match dotenvy::dotenv() {
            Ok(path) => info!("Loaded .env from {}", path.display()),
            Err(err) => debug!("no .env loaded: {err}"),
        }
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Builds a config from any key lookup, starting from the defaults.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(addr) = lookup(ENV_ADDR) {
            config.listen_addr = addr;
        }
        if let Some(path) = lookup(ENV_HANDSHAKE_FILE) {
            config.handshake_file = Some(PathBuf::from(path));
        }
        if let Some(v) = parse(&lookup, ENV_DEFAULT_WINDOW)? {
            config.default_window = v;
        }
        if let Some(v) = parse(&lookup, ENV_TEARDOWN_TIMEOUT_MS)? {
            config.teardown_timeout_ms = v;
        }
        if let Some(v) = parse(&lookup, ENV_CLOSED_SESSION_TTL_SECS)? {
            config.closed_session_ttl_secs = v;
        }
        if let Some(v) = parse(&lookup, ENV_IDLE_BACKOFF_MS)? {
            config.idle_backoff_ms = v;
        }
        if let Some(v) = parse::<usize, _>(&lookup, ENV_WRITE_QUEUE_DEPTH)? {
            anyhow::ensure!(v > 0, "{ENV_WRITE_QUEUE_DEPTH} must be at least 1");
            config.write_queue_depth = v;
        }
        if let Some(v) = parse::<usize, _>(&lookup, ENV_MAX_CONCURRENT_STREAMS)? {
            anyhow::ensure!(v > 0, "{ENV_MAX_CONCURRENT_STREAMS} must be at least 1");
            config.max_concurrent_streams = v;
        }
        if let Some(level) = parse::<LogLevel, _>(&lookup, ENV_LOG_LEVEL)? {
            config.log.log_level = level;
        }
        if let Some(dir) = lookup(ENV_LOG_DIR) {
            config.log.log_dir = Some(PathBuf::from(dir));
        }

        Ok(config)
    }

    pub fn teardown_timeout(&self) -> Duration {
        Duration::from_millis(self.teardown_timeout_ms)
    }

    pub fn closed_session_ttl(&self) -> Duration {
        Duration::from_secs(self.closed_session_ttl_secs)
    }

    pub fn idle_backoff(&self) -> Duration {
        Duration::from_millis(self.idle_backoff_ms)
    }
}

fn parse<T, F>(lookup: &F, key: &str) -> Result<Option<T>>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
    F: Fn(&str) -> Option<String>,
{
    lookup(key)
        .map(|raw| raw.trim().parse::<T>().with_context(|| format!("invalid value for {key}: {raw:?}")))
        .transpose()
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> =
            pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn defaults_without_variables() {
        let config = RuntimeConfig::from_lookup(lookup(&[])).unwrap();
        assert_eq!(config, RuntimeConfig::default());
        assert_eq!(config.default_window, 20);
        assert_eq!(config.listen_addr, "127.0.0.1:0");
    }

    #[test]
    fn reads_overrides() {
        let config = RuntimeConfig::from_lookup(lookup(&[
            (ENV_ADDR, "0.0.0.0:50051"),
            (ENV_DEFAULT_WINDOW, " 64 "),
            (ENV_TEARDOWN_TIMEOUT_MS, "250"),
            (ENV_MAX_CONCURRENT_STREAMS, "8"),
            (ENV_LOG_LEVEL, "debug"),
            (ENV_LOG_DIR, "/tmp/plugin-logs"),
        ]))
        .unwrap();

        assert_eq!(config.listen_addr, "0.0.0.0:50051");
        assert_eq!(config.default_window, 64);
        assert_eq!(config.teardown_timeout(), Duration::from_millis(250));
        assert_eq!(config.max_concurrent_streams, 8);
        assert_eq!(config.log.log_level, LogLevel::Debug);
        assert_eq!(config.log.log_dir, Some(PathBuf::from("/tmp/plugin-logs")));
    }

    #[test]
    fn rejects_garbage_numbers() {
        let err = RuntimeConfig::from_lookup(lookup(&[(ENV_DEFAULT_WINDOW, "lots")])).unwrap_err();
        assert!(err.to_string().contains(ENV_DEFAULT_WINDOW));
    }

    #[test]
    fn rejects_zero_queue_depth() {
        assert!(RuntimeConfig::from_lookup(lookup(&[(ENV_WRITE_QUEUE_DEPTH, "0")])).is_err());
        assert!(RuntimeConfig::from_lookup(lookup(&[(ENV_MAX_CONCURRENT_STREAMS, "0")])).is_err());
    }
}
