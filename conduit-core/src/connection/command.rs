//! Administrative command surface of a connection
//!
//! Every command travels in a [`CommandEnvelope`] carrying its correlation id
//! and a [`Requester`]. Lifecycle commands get a `Success`/`Failure` reply;
//! retrieval commands get a structured object and never fail.

use super::status::ConnectionStatusReport;
use crate::core::errors::CommandFailure;
use crate::core::types::{ConnectionId, ConnectionSpec, CorrelationId};
use crate::monitoring::connection_logs::ConnectionLogs;
use crate::monitoring::metrics::MetricsSnapshot;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fmt;
use tokio::sync::oneshot;
use tracing::debug;

#[derive(Debug, Clone)]
pub enum ConnectionCommand {
    Open,
    Close {
        /// Terminate the state machine once disconnected
        shutdown: bool,
    },
    /// Try the given spec on a throwaway instance
    Test(ConnectionSpec),
    RetrieveStatus,
    RetrieveMetrics,
    ResetMetrics,
    EnableLogs,
    RetrieveLogs,
    ResetLogs,
}

impl ConnectionCommand {
    pub fn kind(&self) -> CommandKind {
        match self {
            Self::Open => CommandKind::Open,
            Self::Close { .. } => CommandKind::Close,
            Self::Test(_) => CommandKind::Test,
            Self::RetrieveStatus => CommandKind::RetrieveStatus,
            Self::RetrieveMetrics => CommandKind::RetrieveMetrics,
            Self::ResetMetrics => CommandKind::ResetMetrics,
            Self::EnableLogs => CommandKind::EnableLogs,
            Self::RetrieveLogs => CommandKind::RetrieveLogs,
            Self::ResetLogs => CommandKind::ResetLogs,
        }
    }

    /// Answered without a state change
    pub fn is_query(&self) -> bool {
        !matches!(self, Self::Open | Self::Close { .. } | Self::Test(_))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CommandKind {
    Open,
    Close,
    Test,
    RetrieveStatus,
    RetrieveMetrics,
    ResetMetrics,
    EnableLogs,
    RetrieveLogs,
    ResetLogs,
}

impl fmt::Display for CommandKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Open => "open",
            Self::Close => "close",
            Self::Test => "test",
            Self::RetrieveStatus => "retrieve-status",
            Self::RetrieveMetrics => "retrieve-metrics",
            Self::ResetMetrics => "reset-metrics",
            Self::EnableLogs => "enable-logs",
            Self::RetrieveLogs => "retrieve-logs",
            Self::ResetLogs => "reset-logs",
        };
        f.write_str(s)
    }
}

/// Metadata kept alongside a pending requester
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RequestMeta {
    pub kind: CommandKind,
    pub correlation_id: CorrelationId,
    pub received_at: DateTime<Utc>,
}

impl RequestMeta {
    pub fn new(kind: CommandKind, correlation_id: CorrelationId) -> Self {
        Self {
            kind,
            correlation_id,
            received_at: Utc::now(),
        }
    }
}

/// Reply to a command
#[derive(Debug, Clone)]
pub enum CommandReply {
    Success {
        connection_id: ConnectionId,
        detail: String,
    },
    Failure(CommandFailure),
    Status(ConnectionStatusReport),
    Metrics(MetricsSnapshot),
    Logs(ConnectionLogs),
}

impl CommandReply {
    pub fn success(connection_id: &ConnectionId, detail: impl Into<String>) -> Self {
        Self::Success {
            connection_id: connection_id.clone(),
            detail: detail.into(),
        }
    }

    pub fn is_success(&self) -> bool {
        !matches!(self, Self::Failure(_))
    }

    /// `Err` for `Failure`, `Ok` for everything else
    pub fn into_result(self) -> Result<Self, CommandFailure> {
        match self {
            Self::Failure(failure) => Err(failure),
            other => Ok(other),
        }
    }
}

/// Where a command's reply goes.
///
/// A detached requester (self-posted commands) swallows replies.
#[derive(Debug)]
pub struct Requester {
    tx: Option<oneshot::Sender<CommandReply>>,
}

impl Requester {
    pub fn new(tx: oneshot::Sender<CommandReply>) -> Self {
        Self { tx: Some(tx) }
    }

    pub fn detached() -> Self {
        Self { tx: None }
    }

    pub fn is_detached(&self) -> bool {
        self.tx.is_none()
    }

    pub fn reply(self, reply: CommandReply) {
        if let Some(tx) = self.tx {
            if tx.send(reply).is_err() {
                debug!("Requester went away before the reply arrived");
            }
        }
    }
}

/// A command with its correlation id and requester
#[derive(Debug)]
pub struct CommandEnvelope {
    pub command: ConnectionCommand,
    pub correlation_id: CorrelationId,
    pub requester: Requester,
}

impl CommandEnvelope {
    /// Envelope plus the receiver its reply will arrive on
    pub fn new(command: ConnectionCommand) -> (Self, oneshot::Receiver<CommandReply>) {
        let (tx, rx) = oneshot::channel();
        let envelope = Self {
            command,
            correlation_id: CorrelationId::random(),
            requester: Requester::new(tx),
        };
        (envelope, rx)
    }

    /// Envelope whose reply is discarded
    pub fn detached(command: ConnectionCommand) -> Self {
        Self {
            command,
            correlation_id: CorrelationId::random(),
            requester: Requester::detached(),
        }
    }

    pub fn kind(&self) -> CommandKind {
        self.command.kind()
    }
}
