//! Configuration loading for the chat client.
//!
//! Configuration is loaded from a TOML file. Every section and field is
//! optional; missing values fall back to the defaults below. Durations are
//! given in milliseconds.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use chat_core::{BackoffPolicy, ReconcilePolicy};

/// Root configuration for the chat client.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ClientConfig {
    /// Connection and heartbeat settings.
    #[serde(default)]
    pub connection: ConnectionConfig,
    /// Reconnection backoff settings.
    #[serde(default)]
    pub reconnect: ReconnectConfig,
    /// Request/response settings.
    #[serde(default)]
    pub requests: RequestConfig,
    /// Duplicate suppression settings.
    #[serde(default)]
    pub dedup: DedupConfig,
    /// Optimistic message settings.
    #[serde(default)]
    pub reconcile: ReconcileConfig,
    /// Polling fallback settings.
    #[serde(default)]
    pub fallback: FallbackConfig,
}

/// Connection configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConnectionConfig {
    /// Server endpoint (default: ws://localhost:8080/ws).
    #[serde(default = "default_endpoint")]
    pub endpoint: String,
    /// Heartbeat interval in ms (default: 10000).
    #[serde(default = "default_heartbeat_interval_ms")]
    pub heartbeat_interval_ms: u64,
    /// Silence after which the connection is declared lost, in ms (default: 30000).
    #[serde(default = "default_heartbeat_timeout_ms")]
    pub heartbeat_timeout_ms: u64,
    /// Additional channels that carry the same messages as the primary queue.
    #[serde(default)]
    pub extra_message_channels: Vec<String>,
}

/// Reconnection configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReconnectConfig {
    /// Delay before the first retry in ms (default: 1000).
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
    /// Delay multiplier per attempt (default: 1.5).
    #[serde(default = "default_growth_factor")]
    pub growth_factor: f64,
    /// Upper bound on a single delay in ms (default: 30000).
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
    /// Automatic attempts before giving up (default: 10).
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    /// Lower jitter factor (default: 0.9).
    #[serde(default = "default_jitter_min")]
    pub jitter_min: f64,
    /// Upper jitter factor (default: 1.1).
    #[serde(default = "default_jitter_max")]
    pub jitter_max: f64,
}

/// Request configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequestConfig {
    /// Default response timeout in ms (default: 20000).
    #[serde(default = "default_request_timeout_ms")]
    pub timeout_ms: u64,
    /// Tag requests with a `correlationId` (default: false).
    ///
    /// When off, a newer request of the same type displaces the older one.
    #[serde(default)]
    pub correlation_ids: bool,
}

/// Duplicate suppression configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DedupConfig {
    /// Window in which an identical send is suppressed, in ms (default: 3000).
    #[serde(default = "default_outbound_window_ms")]
    pub outbound_window_ms: u64,
    /// Processed message ids remembered (default: 200).
    #[serde(default = "default_processed_capacity")]
    pub processed_capacity: usize,
}

/// Optimistic message configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReconcileConfig {
    /// Maximum age of a pending message that may still be confirmed, in ms (default: 10000).
    #[serde(default = "default_match_tolerance_ms")]
    pub match_tolerance_ms: u64,
    /// Retention of settled entries in ms (default: 60000).
    #[serde(default = "default_grace_period_ms")]
    pub grace_period_ms: u64,
    /// Maintenance sweep interval in ms (default: 1000).
    #[serde(default = "default_sweep_interval_ms")]
    pub sweep_interval_ms: u64,
}

/// Polling fallback configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FallbackConfig {
    /// Enable polling while disconnected (default: true).
    #[serde(default = "default_fallback_enabled")]
    pub enabled: bool,
    /// Poll interval in ms (default: 15000).
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    /// Maximum polling time per outage in ms (default: 300000).
    #[serde(default = "default_max_duration_ms")]
    pub max_duration_ms: u64,
}

// Default value functions
fn default_endpoint() -> String {
    "ws://localhost:8080/ws".to_string()
}

fn default_heartbeat_interval_ms() -> u64 {
    10_000
}

fn default_heartbeat_timeout_ms() -> u64 {
    30_000
}

fn default_base_delay_ms() -> u64 {
    1_000
}

fn default_growth_factor() -> f64 {
    1.5
}

fn default_max_delay_ms() -> u64 {
    30_000
}

fn default_max_attempts() -> u32 {
    10
}

fn default_jitter_min() -> f64 {
    0.9
}

fn default_jitter_max() -> f64 {
    1.1
}

fn default_request_timeout_ms() -> u64 {
    20_000
}

fn default_outbound_window_ms() -> u64 {
    3_000
}

fn default_processed_capacity() -> usize {
    200
}

fn default_match_tolerance_ms() -> u64 {
    10_000
}

fn default_grace_period_ms() -> u64 {
    60_000
}

fn default_sweep_interval_ms() -> u64 {
    1_000
}

fn default_fallback_enabled() -> bool {
    true
}

fn default_poll_interval_ms() -> u64 {
    15_000
}

fn default_max_duration_ms() -> u64 {
    5 * 60 * 1_000 // 5 minutes
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            endpoint: default_endpoint(),
            heartbeat_interval_ms: default_heartbeat_interval_ms(),
            heartbeat_timeout_ms: default_heartbeat_timeout_ms(),
            extra_message_channels: Vec::new(),
        }
    }
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            base_delay_ms: default_base_delay_ms(),
            growth_factor: default_growth_factor(),
            max_delay_ms: default_max_delay_ms(),
            max_attempts: default_max_attempts(),
            jitter_min: default_jitter_min(),
            jitter_max: default_jitter_max(),
        }
    }
}

impl Default for RequestConfig {
    fn default() -> Self {
        Self {
            timeout_ms: default_request_timeout_ms(),
            correlation_ids: false,
        }
    }
}

impl Default for DedupConfig {
    fn default() -> Self {
        Self {
            outbound_window_ms: default_outbound_window_ms(),
            processed_capacity: default_processed_capacity(),
        }
    }
}

impl Default for ReconcileConfig {
    fn default() -> Self {
        Self {
            match_tolerance_ms: default_match_tolerance_ms(),
            grace_period_ms: default_grace_period_ms(),
            sweep_interval_ms: default_sweep_interval_ms(),
        }
    }
}

impl Default for FallbackConfig {
    fn default() -> Self {
        Self {
            enabled: default_fallback_enabled(),
            poll_interval_ms: default_poll_interval_ms(),
            max_duration_ms: default_max_duration_ms(),
        }
    }
}

impl FallbackConfig {
    /// Poll interval.
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    /// Maximum polling time per outage.
    pub fn max_duration(&self) -> Duration {
        Duration::from_millis(self.max_duration_ms)
    }
}

impl ClientConfig {
    /// Load configuration from a TOML file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::ReadError {
            path: path.to_path_buf(),
            source: e,
        })?;

        toml::from_str(&content).map_err(|e| ConfigError::ParseError {
            path: path.to_path_buf(),
            source: e,
        })
    }

    /// Check value ranges the engine relies on.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let c = &self.connection;
        let r = &self.reconnect;

        if c.endpoint.trim().is_empty() {
            return Err(invalid("connection.endpoint", "must not be empty"));
        }
        if c.heartbeat_interval_ms == 0 {
            return Err(invalid("connection.heartbeat_interval_ms", "must be positive"));
        }
        if c.heartbeat_timeout_ms <= c.heartbeat_interval_ms {
            return Err(invalid(
                "connection.heartbeat_timeout_ms",
                "must exceed heartbeat_interval_ms",
            ));
        }
        if r.base_delay_ms == 0 {
            return Err(invalid("reconnect.base_delay_ms", "must be positive"));
        }
        if r.growth_factor.is_nan() || r.growth_factor < 1.0 {
            return Err(invalid("reconnect.growth_factor", "must be at least 1.0"));
        }
        if r.max_delay_ms < r.base_delay_ms {
            return Err(invalid("reconnect.max_delay_ms", "must be at least base_delay_ms"));
        }
        if !(r.jitter_min > 0.0 && r.jitter_min <= r.jitter_max) {
            return Err(invalid(
                "reconnect.jitter_min",
                "must be positive and not above jitter_max",
            ));
        }
        if self.requests.timeout_ms == 0 {
            return Err(invalid("requests.timeout_ms", "must be positive"));
        }
        if self.dedup.processed_capacity == 0 {
            return Err(invalid("dedup.processed_capacity", "must be positive"));
        }
        if self.reconcile.sweep_interval_ms == 0 {
            return Err(invalid("reconcile.sweep_interval_ms", "must be positive"));
        }
        if self.fallback.poll_interval_ms == 0 {
            return Err(invalid("fallback.poll_interval_ms", "must be positive"));
        }
        Ok(())
    }

    /// Backoff policy for the reconnection scheduler.
    pub fn backoff_policy(&self) -> BackoffPolicy {
        let r = &self.reconnect;
        BackoffPolicy {
            base: Duration::from_millis(r.base_delay_ms),
            growth_factor: r.growth_factor,
            max_delay: Duration::from_millis(r.max_delay_ms),
            max_attempts: r.max_attempts,
            jitter_min: r.jitter_min,
            jitter_max: r.jitter_max,
        }
    }

    /// Matching windows for the reconciler.
    pub fn reconcile_policy(&self) -> ReconcilePolicy {
        ReconcilePolicy {
            match_tolerance: Duration::from_millis(self.reconcile.match_tolerance_ms),
            grace_period: Duration::from_millis(self.reconcile.grace_period_ms),
        }
    }

    /// Heartbeat interval.
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.connection.heartbeat_interval_ms)
    }

    /// Heartbeat silence timeout.
    pub fn heartbeat_timeout(&self) -> Duration {
        Duration::from_millis(self.connection.heartbeat_timeout_ms)
    }

    /// Default request timeout.
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.requests.timeout_ms)
    }

    /// Outbound duplicate window.
    pub fn outbound_window(&self) -> Duration {
        Duration::from_millis(self.dedup.outbound_window_ms)
    }

    /// Maintenance sweep interval.
    pub fn sweep_interval(&self) -> Duration {
        Duration::from_millis(self.reconcile.sweep_interval_ms)
    }

    /// Set the endpoint.
    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.connection.endpoint = endpoint.into();
        self
    }

    /// Set the automatic reconnection cap.
    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.reconnect.max_attempts = max_attempts;
        self
    }

    /// Set backoff base, growth and cap. Jitter is disabled.
    pub fn with_backoff(mut self, base: Duration, growth_factor: f64, max_delay: Duration) -> Self {
        self.reconnect.base_delay_ms = millis(base);
        self.reconnect.growth_factor = growth_factor;
        self.reconnect.max_delay_ms = millis(max_delay);
        self.reconnect.jitter_min = 1.0;
        self.reconnect.jitter_max = 1.0;
        self
    }

    /// Set heartbeat interval and silence timeout.
    pub fn with_heartbeat(mut self, interval: Duration, timeout: Duration) -> Self {
        self.connection.heartbeat_interval_ms = millis(interval);
        self.connection.heartbeat_timeout_ms = millis(timeout);
        self
    }

    /// Set the default request timeout.
    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.requests.timeout_ms = millis(timeout);
        self
    }

    /// Enable or disable correlation ids on requests.
    pub fn with_correlation_ids(mut self, enabled: bool) -> Self {
        self.requests.correlation_ids = enabled;
        self
    }

    /// Add a channel carrying the same messages as the primary queue.
    pub fn with_extra_message_channel(mut self, channel: impl Into<String>) -> Self {
        self.connection.extra_message_channels.push(channel.into());
        self
    }

    /// Replace the fallback settings.
    pub fn with_fallback(mut self, fallback: FallbackConfig) -> Self {
        self.fallback = fallback;
        self
    }
}

fn millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

fn invalid(field: &'static str, reason: &'static str) -> ConfigError {
    ConfigError::Invalid { field, reason }
}

/// Configuration error types.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// Failed to read configuration file.
    #[error("failed to read config file {path}: {source}")]
    ReadError {
        /// Path to the configuration file.
        path: PathBuf,
        /// Underlying I/O error.
        source: std::io::Error,
    },
    /// Failed to parse configuration file.
    #[error("failed to parse config file {path}: {source}")]
    ParseError {
        /// Path to the configuration file.
        path: PathBuf,
        /// Underlying TOML parse error.
        source: toml::de::Error,
    },
    /// A value is out of range.
    #[error("invalid {field}: {reason}")]
    Invalid {
        /// Offending field.
        field: &'static str,
        /// What is wrong with it.
        reason: &'static str,
    },
}
