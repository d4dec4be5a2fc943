//! Configuration loading and defaults.
//!
//! Configuration is resolved in order of precedence (highest wins):
//!
//! 1. **Environment variables**: `TUNLINK_URL`, `TUNLINK_TOKEN`,
//!    `TUNLINK_USER_ID`, `TUNLINK_LISTEN`, `TUNLINK_API_KEY`
//! 2. **Config file**: path via `--config <path>`, or `tunlink.toml` in CWD
//! 3. **Compiled defaults**: see each field's default value below
//!
//! ```toml
//! [tunnel]
//! url = "wss://bridge.example.com/tunnel"
//! token = "..."
//! user_id = "agent-01"
//!
//! [reconnect]
//! base_delay_ms = 2000
//! max_delay_ms = 60000
//! jitter = 0.3
//! max_attempts = 10
//!
//! [heartbeat]
//! interval_secs = 30
//! timeout_secs = 45
//!
//! [metrics]
//! max_history = 10000
//! max_event_history = 100
//! slow_request_ms = 1000
//! quality_window = 20
//! quality_interval_secs = 5
//!
//! [recovery]
//! rate_limit_cooldown_secs = 60
//! queue_full_wait_secs = 5
//! server_unavailable_retries = 5
//! probe_timeout_secs = 10
//!
//! [diagnostics]
//! test_timeout_secs = 10
//!
//! [server]
//! listen = "127.0.0.1:7171"
//! api_key = "status-api-secret"   # omit to leave the status API open
//!
//! [logging]
//! level = "info"
//! ```

use std::path::Path;
use std::time::Duration;

use serde::Deserialize;
use tokio_tungstenite::tungstenite::http::Uri;

use crate::heartbeat::HeartbeatConfig;
use crate::reconnect::BackoffPolicy;
use crate::recovery::{OrchestratorConfig, RecoveryConfig};

const DEFAULT_CONFIG_FILE: &str = "tunlink.toml";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: String,
        source: std::io::Error,
    },
    #[error("failed to parse config file {path}: {source}")]
    Parse {
        path: String,
        source: toml::de::Error,
    },
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Top-level configuration, deserialized from TOML.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub tunnel: TunnelConfig,
    #[serde(default)]
    pub reconnect: ReconnectConfig,
    #[serde(default)]
    pub heartbeat: HeartbeatSection,
    #[serde(default)]
    pub metrics: MetricsConfig,
    #[serde(default)]
    pub recovery: RecoverySection,
    #[serde(default)]
    pub diagnostics: DiagnosticsConfig,
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Bridge endpoint and identity.
#[derive(Debug, Clone, Deserialize)]
pub struct TunnelConfig {
    /// WebSocket URL of the bridge (`ws://` or `wss://`). Override with `TUNLINK_URL`.
    #[serde(default)]
    pub url: String,
    /// Bearer token sent on connect. Override with `TUNLINK_TOKEN`.
    #[serde(default)]
    pub token: String,
    /// Identity recorded on the connection record. Override with `TUNLINK_USER_ID`.
    #[serde(default = "default_user_id")]
    pub user_id: String,
    /// Reconnect automatically after disconnects (default true).
    #[serde(default = "default_true")]
    pub auto_reconnect: bool,
    /// Frames buffered while disconnected (default 256).
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ReconnectConfig {
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
    /// Jitter fraction in `[0, 1)`.
    #[serde(default = "default_jitter")]
    pub jitter: f64,
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
}

#[derive(Debug, Clone, Deserialize)]
pub struct HeartbeatSection {
    #[serde(default = "default_heartbeat_interval")]
    pub interval_secs: u64,
    /// Silence after which the connection is declared lost.
    #[serde(default = "default_heartbeat_timeout")]
    pub timeout_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MetricsConfig {
    #[serde(default = "default_max_history")]
    pub max_history: usize,
    #[serde(default = "default_max_event_history")]
    pub max_event_history: usize,
    #[serde(default = "default_slow_request_ms")]
    pub slow_request_ms: u64,
    /// Heartbeat samples kept by the quality estimator.
    #[serde(default = "default_quality_window")]
    pub quality_window: usize,
    #[serde(default = "default_quality_interval")]
    pub quality_interval_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RecoverySection {
    #[serde(default = "default_rate_limit_cooldown")]
    pub rate_limit_cooldown_secs: u64,
    #[serde(default = "default_queue_full_wait")]
    pub queue_full_wait_secs: u64,
    #[serde(default = "default_server_unavailable_retries")]
    pub server_unavailable_retries: u32,
    #[serde(default = "default_probe_timeout")]
    pub probe_timeout_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DiagnosticsConfig {
    /// Per-test timeout.
    #[serde(default = "default_test_timeout")]
    pub test_timeout_secs: u64,
}

/// Status API settings.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// Socket address to bind (default `127.0.0.1:7171`). Override with `TUNLINK_LISTEN`.
    #[serde(default = "default_listen")]
    pub listen: String,
    /// Bearer key for every route except `/api/health`. Override with
    /// `TUNLINK_API_KEY`. Unset leaves the API open.
    #[serde(default)]
    pub api_key: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// tracing filter level (default `info`). Overridden by `RUST_LOG` env var.
    #[serde(default = "default_log_level")]
    pub level: String,
}

fn default_true() -> bool {
    true
}
fn default_user_id() -> String {
    "tunlink".to_string()
}
fn default_queue_capacity() -> usize {
    256
}
fn default_base_delay_ms() -> u64 {
    2000
}
fn default_max_delay_ms() -> u64 {
    60_000
}
fn default_jitter() -> f64 {
    BackoffPolicy::DEFAULT_JITTER
}
fn default_max_attempts() -> u32 {
    10
}
fn default_heartbeat_interval() -> u64 {
    30
}
fn default_heartbeat_timeout() -> u64 {
    45
}
fn default_max_history() -> usize {
    10_000
}
fn default_max_event_history() -> usize {
    100
}
fn default_slow_request_ms() -> u64 {
    1000
}
fn default_quality_window() -> usize {
    20
}
fn default_quality_interval() -> u64 {
    5
}
fn default_rate_limit_cooldown() -> u64 {
    60
}
fn default_queue_full_wait() -> u64 {
    5
}
fn default_server_unavailable_retries() -> u32 {
    5
}
fn default_probe_timeout() -> u64 {
    10
}
fn default_test_timeout() -> u64 {
    10
}
fn default_listen() -> String {
    "127.0.0.1:7171".to_string()
}
fn default_log_level() -> String {
    "info".to_string()
}

impl Default for TunnelConfig {
    fn default() -> Self {
        Self {
            url: String::new(),
            token: String::new(),
            user_id: default_user_id(),
            auto_reconnect: true,
            queue_capacity: default_queue_capacity(),
        }
    }
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            base_delay_ms: default_base_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            jitter: default_jitter(),
            max_attempts: default_max_attempts(),
        }
    }
}

impl Default for HeartbeatSection {
    fn default() -> Self {
        Self {
            interval_secs: default_heartbeat_interval(),
            timeout_secs: default_heartbeat_timeout(),
        }
    }
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            max_history: default_max_history(),
            max_event_history: default_max_event_history(),
            slow_request_ms: default_slow_request_ms(),
            quality_window: default_quality_window(),
            quality_interval_secs: default_quality_interval(),
        }
    }
}

impl Default for RecoverySection {
    fn default() -> Self {
        Self {
            rate_limit_cooldown_secs: default_rate_limit_cooldown(),
            queue_full_wait_secs: default_queue_full_wait(),
            server_unavailable_retries: default_server_unavailable_retries(),
            probe_timeout_secs: default_probe_timeout(),
        }
    }
}

impl Default for DiagnosticsConfig {
    fn default() -> Self {
        Self {
            test_timeout_secs: default_test_timeout(),
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            api_key: None,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

/// Host, port and TLS flag parsed out of the tunnel URL.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    pub host: String,
    pub port: u16,
    pub tls: bool,
    pub path: String,
}

impl Config {
    /// Load configuration with the precedence chain: env vars > file > defaults,
    /// then validate it.
    ///
    /// If `path` is `Some`, that file must exist. Otherwise `tunlink.toml` in
    /// the current directory is used when present.
    pub fn load(path: Option<&str>) -> Result<Self, ConfigError> {
        let mut config = match path {
            Some(p) => Self::from_file(p)?,
            None if Path::new(DEFAULT_CONFIG_FILE).exists() => Self::from_file(DEFAULT_CONFIG_FILE)?,
            None => Self::default(),
        };
        config.apply_env(|key| std::env::var(key).ok());
        config.validate()?;
        Ok(config)
    }

    fn from_file(path: &str) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_string(),
            source,
        })?;
        Self::from_toml(&content).map_err(|source| ConfigError::Parse {
            path: path.to_string(),
            source,
        })
    }

    pub fn from_toml(content: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(content)
    }

    /// Apply `TUNLINK_*` overrides read through `lookup`.
    pub fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(url) = lookup("TUNLINK_URL") {
            self.tunnel.url = url;
        }
        if let Some(token) = lookup("TUNLINK_TOKEN") {
            self.tunnel.token = token;
        }
        if let Some(user_id) = lookup("TUNLINK_USER_ID") {
            self.tunnel.user_id = user_id;
        }
        if let Some(listen) = lookup("TUNLINK_LISTEN") {
            self.server.listen = listen;
        }
        if let Some(key) = lookup("TUNLINK_API_KEY") {
            self.server.api_key = Some(key).filter(|k| !k.is_empty());
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |msg: &str| Err(ConfigError::Invalid(msg.to_string()));
        let r = &self.reconnect;
        if r.base_delay_ms == 0 {
            return invalid("reconnect.base_delay_ms must be greater than 0");
        }
        if r.base_delay_ms > r.max_delay_ms {
            return invalid("reconnect.base_delay_ms must not exceed reconnect.max_delay_ms");
        }
        if !(0.0..1.0).contains(&r.jitter) {
            return invalid("reconnect.jitter must be in [0, 1)");
        }
        if r.max_attempts == 0 {
            return invalid("reconnect.max_attempts must be greater than 0");
        }
        let h = &self.heartbeat;
        if h.interval_secs == 0 {
            return invalid("heartbeat.interval_secs must be greater than 0");
        }
        if h.timeout_secs < h.interval_secs {
            return invalid("heartbeat.timeout_secs must be at least heartbeat.interval_secs");
        }
        let m = &self.metrics;
        if m.max_history == 0 || m.max_event_history == 0 || m.quality_window == 0 {
            return invalid("metrics history and window sizes must be greater than 0");
        }
        if m.quality_interval_secs == 0 {
            return invalid("metrics.quality_interval_secs must be greater than 0");
        }
        if self.recovery.server_unavailable_retries == 0 {
            return invalid("recovery.server_unavailable_retries must be greater than 0");
        }
        if self.diagnostics.test_timeout_secs == 0 {
            return invalid("diagnostics.test_timeout_secs must be greater than 0");
        }
        if self.tunnel.queue_capacity == 0 {
            return invalid("tunnel.queue_capacity must be greater than 0");
        }
        if !self.tunnel.url.is_empty() {
            self.endpoint()?;
        }
        Ok(())
    }

    /// Parse the tunnel URL into its connection parts.
    pub fn endpoint(&self) -> Result<Endpoint, ConfigError> {
        let uri: Uri = self
            .tunnel
            .url
            .parse()
            .map_err(|e| ConfigError::Invalid(format!("tunnel.url: {e}")))?;
        let tls = match uri.scheme_str() {
            Some("wss") => true,
            Some("ws") => false,
            _ => {
                return Err(ConfigError::Invalid(
                    "tunnel.url must start with ws:// or wss://".to_string(),
                ))
            }
        };
        let host = uri
            .host()
            .filter(|h| !h.is_empty())
            .ok_or_else(|| ConfigError::Invalid("tunnel.url has no host".to_string()))?
            .to_string();
        let port = uri.port_u16().unwrap_or(if tls { 443 } else { 80 });
        Ok(Endpoint {
            host,
            port,
            tls,
            path: uri.path().to_string(),
        })
    }

    pub fn backoff(&self) -> BackoffPolicy {
        BackoffPolicy {
            base_delay: Duration::from_millis(self.reconnect.base_delay_ms),
            max_delay: Duration::from_millis(self.reconnect.max_delay_ms),
            jitter: self.reconnect.jitter,
        }
    }

    pub fn heartbeat(&self) -> HeartbeatConfig {
        HeartbeatConfig {
            interval: Duration::from_secs(self.heartbeat.interval_secs),
            timeout: Duration::from_secs(self.heartbeat.timeout_secs),
        }
    }

    pub fn recovery(&self) -> RecoveryConfig {
        let r = &self.recovery;
        RecoveryConfig {
            rate_limit_cooldown: Duration::from_secs(r.rate_limit_cooldown_secs),
            queue_full_wait: Duration::from_secs(r.queue_full_wait_secs),
            server_unavailable_retries: r.server_unavailable_retries,
            probe_timeout: Duration::from_secs(r.probe_timeout_secs),
        }
    }

    pub fn orchestrator(&self) -> OrchestratorConfig {
        OrchestratorConfig {
            backoff: self.backoff(),
            max_reconnect_attempts: self.reconnect.max_attempts,
            recovery: self.recovery(),
        }
    }

    pub fn test_timeout(&self) -> Duration {
        Duration::from_secs(self.diagnostics.test_timeout_secs)
    }
}
