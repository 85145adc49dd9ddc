use crate::resilience::backoff::BackoffConfig;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Connectivity service configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ConnectivityConfig {
    #[serde(default)]
    pub client: ClientConfig,

    #[serde(default)]
    pub acknowledgement: AcknowledgementConfig,

    #[serde(default)]
    pub intake: IntakeConfig,

    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Connection lifecycle timings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClientConfig {
    /// First connect deadline of a backoff episode
    #[serde(default = "default_connecting_min_timeout_ms")]
    pub connecting_min_timeout_ms: u64,

    #[serde(default = "default_connecting_max_timeout_ms")]
    pub connecting_max_timeout_ms: u64,

    #[serde(default = "default_min_backoff_ms")]
    pub min_backoff_ms: u64,

    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,

    /// Connect attempts per backoff episode
    #[serde(default = "default_max_tries")]
    pub max_tries: u32,

    #[serde(default = "default_disconnect_timeout_ms")]
    pub disconnect_timeout_ms: u64,

    /// Disconnect deadline when a close announcement is published first
    #[serde(default = "default_disconnect_announce_timeout_ms")]
    pub disconnect_announce_timeout_ms: u64,

    #[serde(default = "default_testing_timeout_ms")]
    pub testing_timeout_ms: u64,

    /// Deadline for polling children during status retrieval
    #[serde(default = "default_status_poll_timeout_ms")]
    pub status_poll_timeout_ms: u64,

    /// Ask timeout of `ConnectionHandle` helpers
    #[serde(default = "default_command_timeout_ms")]
    pub command_timeout_ms: u64,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            connecting_min_timeout_ms: default_connecting_min_timeout_ms(),
            connecting_max_timeout_ms: default_connecting_max_timeout_ms(),
            min_backoff_ms: default_min_backoff_ms(),
            max_backoff_ms: default_max_backoff_ms(),
            max_tries: default_max_tries(),
            disconnect_timeout_ms: default_disconnect_timeout_ms(),
            disconnect_announce_timeout_ms: default_disconnect_announce_timeout_ms(),
            testing_timeout_ms: default_testing_timeout_ms(),
            status_poll_timeout_ms: default_status_poll_timeout_ms(),
            command_timeout_ms: default_command_timeout_ms(),
        }
    }
}

impl ClientConfig {
    pub fn backoff_config(&self) -> BackoffConfig {
        BackoffConfig {
            min_timeout: Duration::from_millis(self.connecting_min_timeout_ms),
            max_timeout: Duration::from_millis(self.connecting_max_timeout_ms),
            min_backoff: Duration::from_millis(self.min_backoff_ms),
            max_backoff: Duration::from_millis(self.max_backoff_ms),
            max_tries: self.max_tries,
        }
    }

    pub fn disconnect_timeout(&self, announce: bool) -> Duration {
        if announce {
            Duration::from_millis(self.disconnect_announce_timeout_ms)
        } else {
            Duration::from_millis(self.disconnect_timeout_ms)
        }
    }

    pub fn testing_timeout(&self) -> Duration {
        Duration::from_millis(self.testing_timeout_ms)
    }

    pub fn status_poll_timeout(&self) -> Duration {
        Duration::from_millis(self.status_poll_timeout_ms)
    }

    pub fn command_timeout(&self) -> Duration {
        Duration::from_millis(self.command_timeout_ms)
    }
}

/// Acknowledgement correlation settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AcknowledgementConfig {
    /// Fallback lifetime of a collector that never completes
    #[serde(default = "default_collector_lifetime_ms")]
    pub collector_lifetime_ms: u64,

    /// Acknowledgement payload budget per outbound signal, split across targets
    #[serde(default = "default_total_ack_payload_quota_bytes")]
    pub total_ack_payload_quota_bytes: usize,

    /// Deadline of one outbound publish; a publish still pending is answered with a 408
    #[serde(default = "default_publish_timeout_ms")]
    pub publish_timeout_ms: u64,
}

impl Default for AcknowledgementConfig {
    fn default() -> Self {
        Self {
            collector_lifetime_ms: default_collector_lifetime_ms(),
            total_ack_payload_quota_bytes: default_total_ack_payload_quota_bytes(),
            publish_timeout_ms: default_publish_timeout_ms(),
        }
    }
}

impl AcknowledgementConfig {
    pub fn collector_lifetime(&self) -> Duration {
        Duration::from_millis(self.collector_lifetime_ms)
    }

    pub fn publish_timeout(&self) -> Duration {
        Duration::from_millis(self.publish_timeout_ms)
    }
}

/// Inbound intake limits
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IntakeConfig {
    /// Messages buffered before new ones are rejected for redelivery
    #[serde(default = "default_buffer_capacity")]
    pub buffer_capacity: usize,

    /// Throttle applied when a connection sets no rate limit of its own
    #[serde(default)]
    pub max_messages_per_second: Option<u64>,
}

impl Default for IntakeConfig {
    fn default() -> Self {
        Self {
            buffer_capacity: default_buffer_capacity(),
            max_messages_per_second: None,
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level: "trace", "debug", "info", "warn", "error"
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Enable JSON logging
    #[serde(default)]
    pub json_logs: bool,

    /// Entries kept per connection log
    #[serde(default = "default_connection_log_capacity")]
    pub connection_log_capacity: usize,

    /// How long `EnableConnectionLogs` keeps full logging on
    #[serde(default = "default_connection_log_enable_duration_ms")]
    pub connection_log_enable_duration_ms: u64,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            json_logs: false,
            connection_log_capacity: default_connection_log_capacity(),
            connection_log_enable_duration_ms: default_connection_log_enable_duration_ms(),
        }
    }
}

impl LoggingConfig {
    pub fn connection_log_enable_duration(&self) -> Duration {
        Duration::from_millis(self.connection_log_enable_duration_ms)
    }
}

// Default value functions
fn default_connecting_min_timeout_ms() -> u64 {
    10_000
}

fn default_connecting_max_timeout_ms() -> u64 {
    60_000
}

fn default_min_backoff_ms() -> u64 {
    1_000
}

fn default_max_backoff_ms() -> u64 {
    60_000
}

fn default_max_tries() -> u32 {
    50
}

fn default_disconnect_timeout_ms() -> u64 {
    10_000
}

fn default_disconnect_announce_timeout_ms() -> u64 {
    20_000
}

fn default_testing_timeout_ms() -> u64 {
    10_000
}

fn default_status_poll_timeout_ms() -> u64 {
    2_000
}

fn default_command_timeout_ms() -> u64 {
    30_000
}

fn default_collector_lifetime_ms() -> u64 {
    30_000
}

fn default_total_ack_payload_quota_bytes() -> usize {
    64 * 1024
}

fn default_publish_timeout_ms() -> u64 {
    10_000
}

fn default_buffer_capacity() -> usize {
    1_000
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_connection_log_capacity() -> usize {
    100
}

fn default_connection_log_enable_duration_ms() -> u64 {
    24 * 60 * 60 * 1000
}
