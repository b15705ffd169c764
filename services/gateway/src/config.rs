//! Configuration types and loading
//!
//! Config precedence: CLI args > env vars > config file > defaults.
//! Account tokens are never stored in the TOML directly; each account
//! may name an env var holding its token.

use serde::Deserialize;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Root configuration
#[derive(Debug, Deserialize)]
pub struct Config {
    pub server: ServerConfig,
    pub pool: PoolConfig,
    #[serde(default)]
    pub timeouts: TimeoutConfig,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub delivery: DeliveryConfig,
}

/// HTTP listener settings
#[derive(Debug, Deserialize)]
pub struct ServerConfig {
    pub listen_addr: SocketAddr,
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
}

/// Account pool and rotation thresholds
#[derive(Debug, Deserialize)]
pub struct PoolConfig {
    pub accounts: Vec<AccountConfig>,
    /// Generative requests per account before a deferred rotation is
    /// scheduled. 0 disables usage-driven rotation.
    #[serde(default)]
    pub usage_threshold: u32,
    /// Counted failures before a failure-driven rotation fires.
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,
    /// Backend statuses that rotate the account on the first occurrence.
    #[serde(default = "default_immediate_statuses")]
    pub immediate_switch_statuses: Vec<u16>,
}

/// One pooled account
#[derive(Debug, Clone, Deserialize)]
pub struct AccountConfig {
    /// Channel index the account's session connects on.
    pub index: usize,
    pub id: String,
    /// Env var holding the account's token, if the automation peer
    /// needs one handed back.
    #[serde(default)]
    pub token_env: Option<String>,
}

/// Request and recovery timeouts, all in seconds
#[derive(Debug, Deserialize)]
pub struct TimeoutConfig {
    #[serde(default = "default_first_response")]
    pub first_response_secs: u64,
    #[serde(default = "default_stream_chunk")]
    pub stream_chunk_secs: u64,
    #[serde(default = "default_grace_period")]
    pub grace_period_secs: u64,
    #[serde(default = "default_reconnect_wait")]
    pub reconnect_wait_secs: u64,
    #[serde(default = "default_busy_wait")]
    pub busy_wait_secs: u64,
    #[serde(default = "default_activation_wait")]
    pub activation_wait_secs: u64,
}

/// Dispatch retry policy
#[derive(Debug, Deserialize)]
pub struct RetryConfig {
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_retry_delay")]
    pub delay_ms: u64,
}

/// Streaming delivery behaviour for the native dialect
#[derive(Debug, Deserialize, Default)]
pub struct DeliveryConfig {
    #[serde(default)]
    pub mode: DeliveryMode,
}

/// How upstream output reaches streaming clients.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryMode {
    /// Relay chunks as they arrive.
    #[default]
    Verbatim,
    /// Collect the full response, then emit it as a short synthetic
    /// stream with keepalive pings while collecting.
    Buffered,
}

fn default_max_connections() -> usize {
    1000
}

fn default_failure_threshold() -> u32 {
    3
}

fn default_immediate_statuses() -> Vec<u16> {
    vec![401, 403, 429]
}

fn default_first_response() -> u64 {
    300
}

fn default_stream_chunk() -> u64 {
    30
}

fn default_grace_period() -> u64 {
    15
}

fn default_reconnect_wait() -> u64 {
    60
}

fn default_busy_wait() -> u64 {
    120
}

fn default_activation_wait() -> u64 {
    10
}

fn default_max_retries() -> u32 {
    3
}

fn default_retry_delay() -> u64 {
    100
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            first_response_secs: default_first_response(),
            stream_chunk_secs: default_stream_chunk(),
            grace_period_secs: default_grace_period(),
            reconnect_wait_secs: default_reconnect_wait(),
            busy_wait_secs: default_busy_wait(),
            activation_wait_secs: default_activation_wait(),
        }
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            delay_ms: default_retry_delay(),
        }
    }
}

impl TimeoutConfig {
    pub fn first_response(&self) -> Duration {
        Duration::from_secs(self.first_response_secs)
    }

    pub fn stream_chunk(&self) -> Duration {
        Duration::from_secs(self.stream_chunk_secs)
    }

    pub fn grace_period(&self) -> Duration {
        Duration::from_secs(self.grace_period_secs)
    }

    pub fn reconnect_wait(&self) -> Duration {
        Duration::from_secs(self.reconnect_wait_secs)
    }

    pub fn busy_wait(&self) -> Duration {
        Duration::from_secs(self.busy_wait_secs)
    }

    pub fn activation_wait(&self) -> Duration {
        Duration::from_secs(self.activation_wait_secs)
    }
}

impl RetryConfig {
    pub fn delay(&self) -> Duration {
        Duration::from_millis(self.delay_ms)
    }
}

impl Config {
    /// Load configuration from a TOML file and validate it.
    pub fn load(path: &Path) -> common::Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&contents)?;

        if config.pool.accounts.is_empty() {
            return Err(common::Error::config(
                "pool.accounts must list at least one account",
            ));
        }

        // Channel indices must be unique: the registry keys connections
        // by index.
        let mut indices: Vec<usize> = config.pool.accounts.iter().map(|a| a.index).collect();
        indices.sort_unstable();
        indices.dedup();
        if indices.len() != config.pool.accounts.len() {
            return Err(common::Error::config(
                "pool.accounts contains duplicate channel indices",
            ));
        }

        if config.server.max_connections == 0 {
            return Err(common::Error::config(
                "max_connections must be greater than 0",
            ));
        }

        if config.timeouts.first_response_secs == 0 || config.timeouts.stream_chunk_secs == 0 {
            return Err(common::Error::config(
                "first_response_secs and stream_chunk_secs must be greater than 0",
            ));
        }

        if config.retry.max_retries == 0 {
            return Err(common::Error::config(
                "max_retries must be greater than 0",
            ));
        }

        Ok(config)
    }

    /// Resolve config file path from CLI arg or CONFIG_PATH env var.
    pub fn resolve_path(cli_path: Option<&str>) -> PathBuf {
        if let Some(p) = cli_path {
            return PathBuf::from(p);
        }
        if let Ok(p) = std::env::var("CONFIG_PATH") {
            return PathBuf::from(p);
        }
        PathBuf::from("switchboard.toml")
    }
}
