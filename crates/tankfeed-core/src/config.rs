//! Configuration structures for tankfeed.
//!
//! Configuration is loaded from TOML files and can be overridden via CLI flags.

use crate::source::SourceDescriptor;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::time::Duration;

/// Main configuration structure.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct Config {
    /// Source registry and scheduler configuration
    #[serde(default)]
    pub registry: RegistryConfig,

    /// Broadcast hub configuration
    #[serde(default)]
    pub broadcast: BroadcastConfig,

    /// Live channel server configuration
    #[serde(default)]
    pub server: ServerConfig,

    /// Monitoring configuration
    #[serde(default)]
    pub monitoring: MonitoringConfig,

    /// Sources registered at startup
    #[serde(default)]
    pub sources: Vec<SourceDescriptor>,
}

/// Source registry configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RegistryConfig {
    /// How long a changed file must stay unchanged before it is read
    #[serde(default = "default_stability_threshold_ms")]
    pub stability_threshold_ms: u64,

    /// How often size and mtime are sampled while waiting for stability
    #[serde(default = "default_stability_poll_ms")]
    pub stability_poll_ms: u64,

    /// Poll interval for sources that do not set their own
    #[serde(default = "default_poll_interval_ms")]
    pub default_poll_interval_ms: u64,

    /// Per-request timeout for remote fetches
    #[serde(default = "default_fetch_timeout_ms")]
    pub fetch_timeout_ms: u64,

    /// Errors retained per source
    #[serde(default = "default_error_log_capacity")]
    pub error_log_capacity: usize,

    /// Consecutive transient failures before they are reported
    #[serde(default = "default_error_report_threshold")]
    pub error_report_threshold: u32,

    /// Capacity of the registry event channel
    #[serde(default = "default_event_channel_capacity")]
    pub event_channel_capacity: usize,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            stability_threshold_ms: default_stability_threshold_ms(),
            stability_poll_ms: default_stability_poll_ms(),
            default_poll_interval_ms: default_poll_interval_ms(),
            fetch_timeout_ms: default_fetch_timeout_ms(),
            error_log_capacity: default_error_log_capacity(),
            error_report_threshold: default_error_report_threshold(),
            event_channel_capacity: default_event_channel_capacity(),
        }
    }
}

impl RegistryConfig {
    pub fn stability_threshold(&self) -> Duration {
        Duration::from_millis(self.stability_threshold_ms)
    }

    pub fn stability_poll(&self) -> Duration {
        Duration::from_millis(self.stability_poll_ms)
    }

    pub fn fetch_timeout(&self) -> Duration {
        Duration::from_millis(self.fetch_timeout_ms)
    }
}

/// Broadcast hub configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct BroadcastConfig {
    /// Interval between liveness probes
    #[serde(default = "default_ping_interval_seconds")]
    pub ping_interval_seconds: u64,

    /// Idle time after which a subscriber is dropped (must exceed the probe interval)
    #[serde(default = "default_inactivity_timeout_seconds")]
    pub inactivity_timeout_seconds: u64,

    /// Maximum records in one outbound message
    #[serde(default = "default_max_records_per_message")]
    pub max_records_per_message: usize,

    /// Outbound frames buffered per subscriber before it counts as failed
    #[serde(default = "default_subscriber_buffer")]
    pub subscriber_buffer: usize,
}

impl Default for BroadcastConfig {
    fn default() -> Self {
        Self {
            ping_interval_seconds: default_ping_interval_seconds(),
            inactivity_timeout_seconds: default_inactivity_timeout_seconds(),
            max_records_per_message: default_max_records_per_message(),
            subscriber_buffer: default_subscriber_buffer(),
        }
    }
}

impl BroadcastConfig {
    pub fn ping_interval(&self) -> Duration {
        Duration::from_secs(self.ping_interval_seconds)
    }

    pub fn inactivity_timeout(&self) -> Duration {
        Duration::from_secs(self.inactivity_timeout_seconds)
    }
}

/// Live channel server configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ServerConfig {
    /// Bind address
    #[serde(default = "default_bind_address")]
    pub bind_address: String,

    /// Port of the WebSocket endpoint
    #[serde(default = "default_server_port")]
    pub port: u16,

    /// Path of the WebSocket endpoint
    #[serde(default = "default_ws_path")]
    pub path: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_address: default_bind_address(),
            port: default_server_port(),
            path: default_ws_path(),
        }
    }
}

/// Monitoring configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct MonitoringConfig {
    /// Metrics HTTP port
    #[serde(default = "default_metrics_port")]
    pub metrics_port: u16,

    /// Health check HTTP port
    #[serde(default = "default_health_port")]
    pub health_port: u16,

    /// Log level
    #[serde(default)]
    pub log_level: LogLevel,

    /// Log format
    #[serde(default)]
    pub log_format: LogFormat,
}

impl Default for MonitoringConfig {
    fn default() -> Self {
        Self {
            metrics_port: default_metrics_port(),
            health_port: default_health_port(),
            log_level: LogLevel::default(),
            log_format: LogFormat::default(),
        }
    }
}

/// Log level.
#[derive(Debug, Clone, Default, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    /// Trace level
    Trace,
    /// Debug level
    Debug,
    /// Info level (default)
    #[default]
    Info,
    /// Warn level
    Warn,
    /// Error level
    Error,
}

impl LogLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            LogLevel::Trace => "trace",
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warn => "warn",
            LogLevel::Error => "error",
        }
    }
}

/// Log format.
#[derive(Debug, Clone, Default, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// JSON format (default)
    #[default]
    Json,
    /// Plain text format
    Text,
}

// Default value functions
fn default_stability_threshold_ms() -> u64 {
    500
}
fn default_stability_poll_ms() -> u64 {
    100
}
fn default_poll_interval_ms() -> u64 {
    5000
}
fn default_fetch_timeout_ms() -> u64 {
    10000
}
fn default_error_log_capacity() -> usize {
    crate::source::error_log::DEFAULT_CAPACITY
}
fn default_error_report_threshold() -> u32 {
    3
}
fn default_event_channel_capacity() -> usize {
    256
}
fn default_ping_interval_seconds() -> u64 {
    30
}
fn default_inactivity_timeout_seconds() -> u64 {
    60 // must exceed the ping interval
}
fn default_max_records_per_message() -> usize {
    1000
}
fn default_subscriber_buffer() -> usize {
    64
}
fn default_bind_address() -> String {
    "0.0.0.0".to_string()
}
fn default_server_port() -> u16 {
    3001
}
fn default_ws_path() -> String {
    "/ws".to_string()
}
fn default_metrics_port() -> u16 {
    9090
}
fn default_health_port() -> u16 {
    8080
}

impl Config {
    /// Load configuration from a TOML file.
    pub fn from_file(path: &std::path::Path) -> crate::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration.
    pub fn validate(&self) -> crate::Result<()> {
        if self.broadcast.ping_interval_seconds == 0 {
            return Err(crate::Error::Config(
                "broadcast.ping_interval_seconds must be positive".into(),
            ));
        }

        if self.broadcast.inactivity_timeout_seconds <= self.broadcast.ping_interval_seconds {
            return Err(crate::Error::Config(format!(
                "broadcast.inactivity_timeout_seconds ({}) must be greater than ping_interval_seconds ({})",
                self.broadcast.inactivity_timeout_seconds, self.broadcast.ping_interval_seconds
            )));
        }

        if self.broadcast.max_records_per_message == 0 {
            return Err(crate::Error::Config(
                "broadcast.max_records_per_message must be positive".into(),
            ));
        }

        if self.registry.event_channel_capacity == 0 {
            return Err(crate::Error::Config(
                "registry.event_channel_capacity must be positive".into(),
            ));
        }

        if self.registry.stability_poll_ms == 0 {
            return Err(crate::Error::Config(
                "registry.stability_poll_ms must be positive".into(),
            ));
        }

        if self.registry.fetch_timeout_ms == 0 {
            return Err(crate::Error::Config(
                "registry.fetch_timeout_ms must be positive".into(),
            ));
        }

        if self.registry.default_poll_interval_ms < crate::source::MIN_POLL_INTERVAL_MS {
            return Err(crate::Error::Config(format!(
                "registry.default_poll_interval_ms must be at least {}",
                crate::source::MIN_POLL_INTERVAL_MS
            )));
        }

        if !self.server.path.starts_with('/') {
            return Err(crate::Error::Config("server.path must start with '/'".into()));
        }

        let mut ids = HashSet::new();
        for source in &self.sources {
            source.validate()?;
            if !ids.insert(source.id.as_str()) {
                return Err(crate::Error::Config(format!(
                    "duplicate source id '{}'",
                    source.id
                )));
            }
        }

        if self.registry.stability_threshold_ms < self.registry.stability_poll_ms {
            tracing::warn!(
                threshold_ms = self.registry.stability_threshold_ms,
                poll_ms = self.registry.stability_poll_ms,
                "Stability threshold shorter than its poll interval; every change is read after one sample"
            );
        }

        Ok(())
    }
}
