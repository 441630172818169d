//! Daemon configuration -- TOML file with full defaults.

use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;

use crate::model::TestType;

/// Top-level daemon configuration (`sitemedic.toml`).
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    pub daemon: DaemonConfig,
    pub engine: EngineConfig,
    pub transport: TransportConfig,
    pub retry: RetryPolicy,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DaemonConfig {
    /// API bind address.
    pub bind: String,
    /// SQLite database path (scheduler task store).
    pub db_path: String,
    /// Base URL of the runner backend.
    pub runner_url: String,
    /// Scheduler tick interval in seconds.
    pub scheduler_tick_secs: u64,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            bind: "0.0.0.0:8080".to_string(),
            db_path: "data/sitemedic.db".to_string(),
            runner_url: "http://127.0.0.1:9090".to_string(),
            scheduler_tick_secs: 10,
        }
    }
}

/// Concurrency limits and submit timeouts for the orchestration engine.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Global cap on concurrently running executions. `None` = unlimited.
    pub max_concurrent: Option<usize>,
    /// Per-test-type caps, e.g. `stress = 2`.
    pub max_concurrent_per_type: HashMap<TestType, usize>,
    /// Maximum wait for the running transition before the execution is
    /// marked failed with a timeout error.
    pub start_timeout_secs: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_concurrent: None,
            max_concurrent_per_type: HashMap::new(),
            start_timeout_secs: 30,
        }
    }
}

impl EngineConfig {
    pub fn start_timeout(&self) -> Duration {
        Duration::from_secs(self.start_timeout_secs)
    }
}

/// Transport tuning: poll fallback interval and reconnect backoff.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct TransportConfig {
    /// Poll interval while the push channel is down, in milliseconds.
    pub poll_interval_ms: u64,
    /// Initial reconnect backoff in milliseconds.
    pub backoff_base_ms: u64,
    /// Backoff ceiling in milliseconds.
    pub backoff_cap_ms: u64,
    /// Consecutive transport failures tolerated per execution before the
    /// error escalates onto the execution itself.
    pub max_attempts: u32,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: 1_000,
            backoff_base_ms: 500,
            backoff_cap_ms: 30_000,
            max_attempts: 8,
        }
    }
}

impl TransportConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

/// Automatic retry of failed executions. Off unless configured.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    pub auto: bool,
    pub max_retries: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            auto: false,
            max_retries: 2,
        }
    }
}

impl Config {
    /// Load from a TOML file, or fall back to defaults when the file does
    /// not exist.
    pub fn load(path: &str) -> Result<Self> {
        if !Path::new(path).exists() {
            tracing::debug!(%path, "no config file, using defaults");
            return Ok(Self::default());
        }
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file {}", path))?;
        let config: Config =
            toml::from_str(&raw).with_context(|| format!("failed to parse config file {}", path))?;
        Ok(config)
    }
}
