//! Identifiers, status enums and the declarative connection spec
//!
//! Everything here is plain data: cheap to clone, serde-friendly, and free of
//! any runtime handles so it can be snapshotted into status reports.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use uuid::Uuid;

/// Stable identifier of a managed connection
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConnectionId(String);

impl ConnectionId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ConnectionId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Correlates a request (or an inbound signal) with its responses
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CorrelationId(String);

impl CorrelationId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Fresh random correlation id
    pub fn random() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CorrelationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Label of an acknowledgement a target issues (or a signal requests)
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AckLabel(String);

impl AckLabel {
    pub fn new(label: impl Into<String>) -> Self {
        Self(label.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for AckLabel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Live status of a connection or one of its resources
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectivityStatus {
    Open,
    Closed,
    Failed,
    Misconfigured,
    #[default]
    Unknown,
}

impl fmt::Display for ConnectivityStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Open => "open",
            Self::Closed => "closed",
            Self::Failed => "failed",
            Self::Misconfigured => "misconfigured",
            Self::Unknown => "unknown",
        };
        f.write_str(s)
    }
}

/// Operator intent, independent of the live status
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DesiredStatus {
    Open,
    #[default]
    Closed,
}

/// Progress of automatic recovery after failures
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecoveryStatus {
    #[default]
    Unknown,
    Ongoing,
    Succeeded,
    BackoffLimitReached,
}

/// Inbound side of a connection: addresses consumed from
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceSpec {
    pub addresses: Vec<String>,

    /// Consumers started per address
    #[serde(default = "default_consumer_count")]
    pub consumer_count: usize,
}

/// Outbound side of a connection: one address published to
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TargetSpec {
    pub address: String,

    #[serde(default)]
    pub topics: Vec<String>,

    /// When set, the publish outcome is turned into an acknowledgement with this label
    #[serde(default)]
    pub issued_ack_label: Option<AckLabel>,
}

/// Secure tunnel that must be established before the socket-level connect
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TunnelSpec {
    #[serde(default = "default_true")]
    pub enabled: bool,
    pub host: String,
    pub port: u16,
    pub user: String,
}

/// Declarative configuration of one connection
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionSpec {
    pub id: ConnectionId,

    /// Protocol family, e.g. "amqp-091" or "mqtt"; only drivers interpret it
    pub connection_type: String,

    pub uri: String,

    #[serde(default)]
    pub desired_status: DesiredStatus,

    #[serde(default)]
    pub sources: Vec<SourceSpec>,

    #[serde(default)]
    pub targets: Vec<TargetSpec>,

    #[serde(default)]
    pub tunnel: Option<TunnelSpec>,

    /// Publish a close announcement before disconnecting
    #[serde(default)]
    pub announce_close: bool,

    /// Inbound rate limit of the external endpoint (messages per second)
    #[serde(default)]
    pub max_inbound_per_second: Option<u64>,

    /// Driver-specific settings
    #[serde(default)]
    pub specific_config: BTreeMap<String, String>,
}

impl ConnectionSpec {
    pub fn new(id: impl Into<String>, connection_type: impl Into<String>, uri: impl Into<String>) -> Self {
        Self {
            id: ConnectionId::new(id),
            connection_type: connection_type.into(),
            uri: uri.into(),
            ..Default::default()
        }
    }

    /// True if a tunnel must be established before connecting
    pub fn requires_tunnel(&self) -> bool {
        self.tunnel.as_ref().is_some_and(|t| t.enabled)
    }

    /// Addresses of every consumer the connection is expected to run
    pub fn consumer_addresses(&self) -> impl Iterator<Item = &str> {
        self.sources.iter().flat_map(|source| {
            source
                .addresses
                .iter()
                .flat_map(move |address| std::iter::repeat(address.as_str()).take(source.consumer_count))
        })
    }
}

fn default_consumer_count() -> usize {
    1
}

fn default_true() -> bool {
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_consumer_addresses_respect_consumer_count() {
        let mut spec = ConnectionSpec::new("c1", "amqp-091", "amqp://localhost");
        spec.sources.push(SourceSpec {
            addresses: vec!["queue-a".into(), "queue-b".into()],
            consumer_count: 2,
        });

        let addresses: Vec<_> = spec.consumer_addresses().collect();
        assert_eq!(addresses, vec!["queue-a", "queue-a", "queue-b", "queue-b"]);
    }

    #[test]
    fn test_requires_tunnel_only_when_enabled() {
        let mut spec = ConnectionSpec::new("c1", "mqtt", "tcp://broker:1883");
        assert!(!spec.requires_tunnel());

        spec.tunnel = Some(TunnelSpec {
            enabled: false,
            host: "bastion".into(),
            port: 22,
            user: "ops".into(),
        });
        assert!(!spec.requires_tunnel());

        if let Some(tunnel) = spec.tunnel.as_mut() {
            tunnel.enabled = true;
        }
        assert!(spec.requires_tunnel());
    }

    #[test]
    fn test_spec_deserializes_with_defaults() {
        let json = r#"{
            "id": "orders",
            "connection_type": "amqp-091",
            "uri": "amqp://broker:5672",
            "sources": [{ "addresses": ["orders.in"] }],
            "targets": [{ "address": "orders.out", "issued_ack_label": "orders-published" }]
        }"#;

        let spec: ConnectionSpec = serde_json::from_str(json).unwrap();
        assert_eq!(spec.desired_status, DesiredStatus::Closed);
        assert_eq!(spec.sources[0].consumer_count, 1);
        assert_eq!(
            spec.targets[0].issued_ack_label,
            Some(AckLabel::new("orders-published"))
        );
        assert!(!spec.announce_close);
    }
}
