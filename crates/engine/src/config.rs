use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use pool::PoolConfig;
use thiserror::Error;

/// File looked up in the working directory when no explicit path is given.
pub const CONFIG_FILE: &str = "appd.json";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse {}: {source}", .path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("invalid cron pattern '{pattern}': {reason}")]
    Cron { pattern: String, reason: String },
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub workers: usize,
    pub bind: String,
    pub request_timeout_ms: u64,
    pub reclaim_grace_ms: u64,
    pub pin_workers: bool,
    /// Request header whose first comma-separated element identifies the client.
    pub identity_header: String,
    pub block_status: u16,
    pub timeout_status: u16,
    /// How many blocked requests may be held at once before the rest are rejected outright.
    pub block_hold_slots: usize,
    pub block_sweep_interval_secs: u64,
    pub cache_enabled: bool,
    pub cache_limit_bytes: usize,
    pub cache_entry_limit_bytes: usize,
    pub cache_refresh_ahead_secs: u64,
    /// Deadline for a retried park. Defaults to twice the request timeout.
    pub retry_timeout_ms: Option<u64>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            workers: num_workers(),
            bind: "0.0.0.0:8000".to_string(),
            request_timeout_ms: 60_000,
            reclaim_grace_ms: 1_000,
            pin_workers: false,
            identity_header: "x-forwarded-for".to_string(),
            block_status: 429,
            timeout_status: 502,
            block_hold_slots: 100,
            block_sweep_interval_secs: 60,
            cache_enabled: true,
            cache_limit_bytes: 64 * 1024 * 1024,
            cache_entry_limit_bytes: 1_000_000,
            cache_refresh_ahead_secs: 0,
            retry_timeout_ms: None,
        }
    }
}

fn num_workers() -> usize {
    PoolConfig::default().num_workers
}

impl ServerConfig {
    /// Load from `explicit`, or from `appd.json` in the working directory,
    /// falling back to defaults when the file is missing or unreadable.
    pub fn load(explicit: Option<&Path>) -> Self {
        let path = match explicit {
            Some(path) => path.to_path_buf(),
            None => PathBuf::from(CONFIG_FILE),
        };
        if explicit.is_none() && !path.exists() {
            return Self::default();
        }

        match Self::load_file(&path) {
            Ok(config) => config,
            Err(err) => {
                tracing::warn!("{}; using defaults", err);
                Self::default()
            }
        }
    }

    pub fn load_file(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_json(&contents).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// A top-level `"server"` object wins; otherwise top-level keys are read directly.
    pub fn from_json(contents: &str) -> Result<Self, serde_json::Error> {
        let root: serde_json::Value = serde_json::from_str(contents)?;
        match root.get("server") {
            Some(server) => serde_json::from_value(server.clone()),
            None => serde_json::from_value(root),
        }
    }

    /// Override fields from `APPD_*` environment variables.
    pub fn apply_env(&mut self) {
        self.apply_overrides(|name| std::env::var(name).ok());
    }

    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        override_with(&lookup, "APPD_WORKERS", &mut self.workers);
        override_with(&lookup, "APPD_BIND", &mut self.bind);
        override_with(&lookup, "APPD_REQUEST_TIMEOUT_MS", &mut self.request_timeout_ms);
        override_with(&lookup, "APPD_RECLAIM_GRACE_MS", &mut self.reclaim_grace_ms);
        override_with(&lookup, "APPD_PIN_WORKERS", &mut self.pin_workers);
        override_with(&lookup, "APPD_IDENTITY_HEADER", &mut self.identity_header);
        override_with(&lookup, "APPD_BLOCK_STATUS", &mut self.block_status);
        override_with(&lookup, "APPD_TIMEOUT_STATUS", &mut self.timeout_status);
        override_with(&lookup, "APPD_BLOCK_HOLD_SLOTS", &mut self.block_hold_slots);
        override_with(
            &lookup,
            "APPD_BLOCK_SWEEP_INTERVAL_SECS",
            &mut self.block_sweep_interval_secs,
        );
        override_with(&lookup, "APPD_CACHE_ENABLED", &mut self.cache_enabled);
        override_with(&lookup, "APPD_CACHE_LIMIT_BYTES", &mut self.cache_limit_bytes);
        override_with(
            &lookup,
            "APPD_CACHE_ENTRY_LIMIT_BYTES",
            &mut self.cache_entry_limit_bytes,
        );
        override_with(&lookup, "APPD_CACHE_REFRESH_AHEAD_SECS", &mut self.cache_refresh_ahead_secs);

        let mut retry = self.retry_timeout_ms.unwrap_or_default();
        if override_with(&lookup, "APPD_RETRY_TIMEOUT_MS", &mut retry) {
            self.retry_timeout_ms = Some(retry);
        }
    }

    pub fn pool_config(&self) -> PoolConfig {
        PoolConfig {
            num_workers: self.workers.max(1),
            request_timeout_ms: self.request_timeout_ms,
            reclaim_grace_ms: self.reclaim_grace_ms,
            pin_workers: self.pin_workers,
        }
    }

    pub fn request_timeout(&self) -> Option<Duration> {
        millis(self.request_timeout_ms)
    }

    pub fn retry_timeout(&self) -> Option<Duration> {
        millis(
            self.retry_timeout_ms
                .unwrap_or(self.request_timeout_ms.saturating_mul(2)),
        )
    }

    pub fn refresh_ahead(&self) -> Option<Duration> {
        (self.cache_refresh_ahead_secs > 0)
            .then(|| Duration::from_secs(self.cache_refresh_ahead_secs))
    }

    pub fn block_sweep_interval(&self) -> Duration {
        Duration::from_secs(self.block_sweep_interval_secs.max(1))
    }
}

fn millis(ms: u64) -> Option<Duration> {
    (ms > 0).then(|| Duration::from_millis(ms))
}

fn override_with<T: FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    name: &str,
    slot: &mut T,
) -> bool {
    let Some(raw) = lookup(name) else {
        return false;
    };
    match raw.trim().parse() {
        Ok(value) => {
            *slot = value;
            true
        }
        Err(_) => {
            tracing::warn!("Ignoring {}={:?}: not a valid value", name, raw);
            false
        }
    }
}
