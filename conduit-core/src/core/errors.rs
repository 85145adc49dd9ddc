//! Error taxonomy for connection management and delivery
//!
//! `ConnectionError` classifies lifecycle failures (it decides how the state
//! machine reacts), `CommandFailure` is what crosses the public command
//! boundary, and `ProcessingError` / `PublishError` describe per-message
//! failures that feed the delivery decision.

use super::types::{ConnectionId, TargetSpec};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

/// Generic description used when a failure carries no structured detail
pub const UNKNOWN_FAILURE_DESCRIPTION: &str =
    "An unknown failure occurred while handling the connection";

/// Coarse class of a connection failure
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    Configuration,
    Transient,
    InternalBug,
    FatalInfrastructure,
    Timeout,
    Unknown,
}

/// Failure observed while managing a connection
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConnectionError {
    /// Host unreachable, malformed spec; fixable without restarting
    #[error("configuration error: {0}")]
    Configuration(String),

    /// Dropped socket, broker hiccup
    #[error("transient failure: {0}")]
    Transient(String),

    /// Invariant violated inside this process
    #[error("internal error: {0}")]
    InternalBug(String),

    /// The messaging infrastructure itself is unavailable
    #[error("messaging infrastructure unavailable: {0}")]
    FatalInfrastructure(String),

    #[error("{operation} timed out after {after:?}")]
    Timeout { operation: String, after: Duration },

    #[error("{0}")]
    Unknown(String),
}

impl ConnectionError {
    pub fn kind(&self) -> FailureKind {
        match self {
            Self::Configuration(_) => FailureKind::Configuration,
            Self::Transient(_) => FailureKind::Transient,
            Self::InternalBug(_) => FailureKind::InternalBug,
            Self::FatalInfrastructure(_) => FailureKind::FatalInfrastructure,
            Self::Timeout { .. } => FailureKind::Timeout,
            Self::Unknown(_) => FailureKind::Unknown,
        }
    }

    pub fn is_configuration(&self) -> bool {
        matches!(self, Self::Configuration(_))
    }

    pub fn timeout(operation: impl Into<String>, after: Duration) -> Self {
        Self::Timeout {
            operation: operation.into(),
            after,
        }
    }

    /// Wrap an error without domain structure.
    ///
    /// The raw error is logged here and replaced by a generic description.
    pub fn from_unstructured(err: &anyhow::Error) -> Self {
        tracing::debug!(error = %err, "Wrapping unstructured failure");
        Self::Unknown(UNKNOWN_FAILURE_DESCRIPTION.to_string())
    }
}

/// Failure reply to a lifecycle command
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[error("connection '{connection_id}' failed: {description}")]
pub struct CommandFailure {
    pub connection_id: ConnectionId,
    pub kind: FailureKind,
    pub description: String,
}

impl CommandFailure {
    pub fn new(connection_id: &ConnectionId, error: &ConnectionError) -> Self {
        Self {
            connection_id: connection_id.clone(),
            kind: error.kind(),
            description: error.to_string(),
        }
    }
}

/// Error raised while processing an inbound signal
///
/// `status` is an HTTP-like code when the error is a structured domain
/// error; `None` means an unclassified exception.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[error("{description}")]
pub struct ProcessingError {
    pub status: Option<u16>,
    pub description: String,
}

impl ProcessingError {
    pub fn with_status(status: u16, description: impl Into<String>) -> Self {
        Self {
            status: Some(status),
            description: description.into(),
        }
    }

    pub fn unstructured(description: impl Into<String>) -> Self {
        Self {
            status: None,
            description: description.into(),
        }
    }
}

/// Outbound publish failure
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("publish to '{address}' failed: {description}")]
pub struct PublishError {
    pub address: String,
    pub status: Option<u16>,
    pub description: String,
}

impl PublishError {
    pub fn new(target: &TargetSpec, status: Option<u16>, description: impl Into<String>) -> Self {
        Self {
            address: target.address.clone(),
            status,
            description: description.into(),
        }
    }

    /// The publish completed but produced no acknowledgement although one was expected
    pub fn missing_acknowledgement(address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            status: None,
            description: "terminated without the expected acknowledgement".to_string(),
        }
    }
}
