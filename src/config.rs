//! Runtime configuration for the user RPC server.
//!
//! Loaded from a TOML file. Every field has a default, so an empty file is a
//! valid configuration.

use anyhow::{Context, bail};
use serde::Deserialize;
use std::collections::HashMap;
use std::fs;
use std::path::Path;
use std::time::Duration;

/// Path used when no `-f` flag is given.
pub const DEFAULT_CONFIG_PATH: &str = "etc/user-rpc.toml";

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Service name, used in logs and exported spans.
    #[serde(default = "default_name")]
    pub name: String,

    /// Address the RPC listener binds to.
    #[serde(default = "default_listen_on")]
    pub listen_on: String,

    /// Deadline applied to calls that arrive without one. Zero disables it.
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,

    /// How long shutdown waits for in-flight calls.
    #[serde(default = "default_drain_timeout_ms")]
    pub drain_timeout_ms: u64,

    /// Calls slower than this are logged at warn level.
    #[serde(default = "default_slow_call_ms")]
    pub slow_call_ms: u64,

    #[serde(default)]
    pub log: LogConfig,

    #[serde(default)]
    pub telemetry: TelemetryConfig,

    #[serde(default)]
    pub mysql: MysqlConfig,

    #[serde(default)]
    pub redis: RedisConfig,

    #[serde(default)]
    pub auth: AuthConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LogConfig {
    /// Filter directive, e.g. "info" or "user_rpc=debug,rpc_lite=info".
    /// `RUST_LOG` takes precedence when set.
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Directory for the log file. Console output when unset.
    #[serde(default)]
    pub path: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TelemetryConfig {
    /// Service name attached to exported spans.
    #[serde(default)]
    pub name: String,

    /// OTLP/gRPC collector URL such as "http://127.0.0.1:4317", or "stdout"
    /// to print spans. Export is disabled when unset.
    #[serde(default)]
    pub endpoint: Option<String>,

    /// Maximum spans per export batch.
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MysqlConfig {
    #[serde(default = "default_data_source")]
    pub data_source: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RedisConfig {
    #[serde(default = "default_redis_host")]
    pub host: String,

    /// Only "node" is supported.
    #[serde(default = "default_redis_kind", rename = "type")]
    pub kind: String,

    /// The in-process cache has no authentication, so a password is
    /// rejected rather than silently ignored.
    #[serde(default)]
    pub pass: Option<String>,

    /// Entry lifetime in seconds.
    #[serde(default = "default_cache_ttl_secs")]
    pub ttl_secs: u64,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct AuthConfig {
    #[serde(default)]
    pub enabled: bool,

    /// Token → caller identity.
    #[serde(default)]
    pub tokens: HashMap<String, String>,
}

fn default_name() -> String {
    "user.rpc".to_string()
}

fn default_listen_on() -> String {
    "127.0.0.1:8080".to_string()
}

fn default_timeout_ms() -> u64 {
    2000
}

fn default_drain_timeout_ms() -> u64 {
    5000
}

fn default_slow_call_ms() -> u64 {
    500
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_batch_size() -> usize {
    100
}

fn default_data_source() -> String {
    "memory://users".to_string()
}

fn default_redis_host() -> String {
    "127.0.0.1:6379".to_string()
}

fn default_redis_kind() -> String {
    "node".to_string()
}

fn default_cache_ttl_secs() -> u64 {
    60
}

impl Default for Config {
    fn default() -> Self {
        Self {
            name: default_name(),
            listen_on: default_listen_on(),
            timeout_ms: default_timeout_ms(),
            drain_timeout_ms: default_drain_timeout_ms(),
            slow_call_ms: default_slow_call_ms(),
            log: LogConfig::default(),
            telemetry: TelemetryConfig::default(),
            mysql: MysqlConfig::default(),
            redis: RedisConfig::default(),
            auth: AuthConfig::default(),
        }
    }
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            path: None,
        }
    }
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            name: String::new(),
            endpoint: None,
            batch_size: default_batch_size(),
        }
    }
}

impl Default for MysqlConfig {
    fn default() -> Self {
        Self {
            data_source: default_data_source(),
        }
    }
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            host: default_redis_host(),
            kind: default_redis_kind(),
            pass: None,
            ttl_secs: default_cache_ttl_secs(),
        }
    }
}

impl Config {
    /// Load configuration from a TOML file at the given path.
    pub fn load(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let contents = fs::read_to_string(path)
            .with_context(|| format!("failed to read config file {}", path.display()))?;
        Self::from_toml(&contents)
            .with_context(|| format!("failed to parse config file {}", path.display()))
    }

    pub fn from_toml(contents: &str) -> anyhow::Result<Self> {
        Ok(toml::from_str(contents)?)
    }

    /// Reject configurations the server cannot start with.
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.listen_on.trim().is_empty() {
            bail!("listen_on must not be empty");
        }
        if self.mysql.data_source.trim().is_empty() {
            bail!("mysql.data_source must not be empty");
        }
        if self.redis.host.trim().is_empty() {
            bail!("redis.host must not be empty");
        }
        if self.redis.kind != "node" {
            bail!("unsupported redis type '{}', expected 'node'", self.redis.kind);
        }
        if self.redis.pass.as_deref().is_some_and(|pass| !pass.is_empty()) {
            bail!("redis.pass is not supported by the in-process cache");
        }
        if let Some(endpoint) = self.telemetry.endpoint.as_deref()
            && endpoint != "stdout"
            && !endpoint.starts_with("http://")
            && !endpoint.starts_with("https://")
        {
            bail!("telemetry.endpoint must be \"stdout\" or an http(s) URL, got '{endpoint}'");
        }
        if self.telemetry.batch_size == 0 {
            bail!("telemetry.batch_size must be at least 1");
        }
        if self.auth.enabled && self.auth.tokens.is_empty() {
            bail!("auth is enabled but no tokens are configured");
        }
        Ok(())
    }

    /// Default call deadline, `None` when disabled.
    pub fn call_timeout(&self) -> Option<Duration> {
        (self.timeout_ms > 0).then(|| Duration::from_millis(self.timeout_ms))
    }

    pub fn drain_timeout(&self) -> Duration {
        Duration::from_millis(self.drain_timeout_ms)
    }

    pub fn slow_call_threshold(&self) -> Duration {
        Duration::from_millis(self.slow_call_ms)
    }

    /// Service name for exported spans, falling back to `name`.
    pub fn telemetry_name(&self) -> &str {
        if self.telemetry.name.is_empty() {
            &self.name
        } else {
            &self.telemetry.name
        }
    }
}
