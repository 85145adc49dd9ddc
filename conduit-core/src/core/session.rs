//! Connection session owned by the state machine
//!
//! A session is replaced, not mutated: every `with_*` method consumes the
//! old value and returns the next one, so a transition either produces a
//! complete new session or nothing at all.

use super::types::{
    ConnectionId, ConnectionSpec, ConnectivityStatus, DesiredStatus, RecoveryStatus,
};
use crate::connection::command::{CommandEnvelope, RequestMeta, Requester};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Secure-tunnel precondition for drivers that need one
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum TunnelState {
    #[default]
    Disabled,
    Pending,
    Established { local_port: u16 },
    Failed { cause: String },
}

impl TunnelState {
    pub fn is_established(&self) -> bool {
        matches!(self, Self::Established { .. })
    }
}

/// A requester waiting for a terminal reply
#[derive(Debug)]
pub struct PendingRequest {
    pub meta: RequestMeta,
    pub requester: Requester,
}

/// Mutable-by-replacement state of one connection
#[derive(Debug, Default)]
pub struct ConnectionSession {
    connection_id: ConnectionId,
    spec: ConnectionSpec,
    current_status: ConnectivityStatus,
    desired_status: DesiredStatus,
    recovery_status: RecoveryStatus,
    status_detail: String,
    status_since: DateTime<Utc>,
    failure_count: u32,
    pending: Vec<PendingRequest>,
    tunnel_state: TunnelState,
}

impl ConnectionSession {
    pub fn new(spec: ConnectionSpec) -> Self {
        let tunnel_state = if spec.requires_tunnel() {
            TunnelState::Pending
        } else {
            TunnelState::Disabled
        };

        Self {
            connection_id: spec.id.clone(),
            desired_status: spec.desired_status,
            current_status: ConnectivityStatus::Unknown,
            recovery_status: RecoveryStatus::Unknown,
            status_detail: "initializing".to_string(),
            status_since: Utc::now(),
            failure_count: 0,
            pending: Vec::new(),
            tunnel_state,
            spec,
        }
    }

    pub fn connection_id(&self) -> &ConnectionId {
        &self.connection_id
    }

    pub fn spec(&self) -> &ConnectionSpec {
        &self.spec
    }

    pub fn current_status(&self) -> ConnectivityStatus {
        self.current_status
    }

    pub fn desired_status(&self) -> DesiredStatus {
        self.desired_status
    }

    pub fn recovery_status(&self) -> RecoveryStatus {
        self.recovery_status
    }

    pub fn status_detail(&self) -> &str {
        &self.status_detail
    }

    pub fn status_since(&self) -> DateTime<Utc> {
        self.status_since
    }

    pub fn failure_count(&self) -> u32 {
        self.failure_count
    }

    pub fn tunnel_state(&self) -> &TunnelState {
        &self.tunnel_state
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    /// True while the tunnel gate blocks the driver connect hook
    pub fn tunnel_blocks_connect(&self) -> bool {
        self.spec.requires_tunnel() && !self.tunnel_state.is_established()
    }

    /// Overwrite live status; `status_since` moves with it
    pub fn with_status(self, status: ConnectivityStatus, detail: impl Into<String>) -> Self {
        Self {
            current_status: status,
            status_detail: detail.into(),
            status_since: Utc::now(),
            ..self
        }
    }

    pub fn with_desired_status(self, desired_status: DesiredStatus) -> Self {
        Self {
            desired_status,
            ..self
        }
    }

    pub fn with_recovery_status(self, recovery_status: RecoveryStatus) -> Self {
        Self {
            recovery_status,
            ..self
        }
    }

    pub fn with_spec(self, spec: ConnectionSpec) -> Self {
        Self { spec, ..self }
    }

    pub fn with_tunnel_state(self, tunnel_state: TunnelState) -> Self {
        Self {
            tunnel_state,
            ..self
        }
    }

    pub fn with_incremented_failure_count(self) -> Self {
        Self {
            failure_count: self.failure_count.saturating_add(1),
            ..self
        }
    }

    pub fn with_reset_failure_count(self) -> Self {
        Self {
            failure_count: 0,
            ..self
        }
    }

    /// Queue a requester for the next terminal reply
    pub fn with_requester(mut self, envelope: CommandEnvelope) -> Self {
        let CommandEnvelope {
            command,
            correlation_id,
            requester,
        } = envelope;

        if !requester.is_detached() {
            self.pending.push(PendingRequest {
                meta: RequestMeta::new(command.kind(), correlation_id),
                requester,
            });
        }
        self
    }

    /// Split off every pending requester
    pub fn take_requesters(mut self) -> (Self, Vec<PendingRequest>) {
        let pending = std::mem::take(&mut self.pending);
        (self, pending)
    }

    /// Read-only copy for status reporting
    pub fn snapshot(&self) -> SessionSnapshot {
        SessionSnapshot {
            connection_id: self.connection_id.clone(),
            spec: self.spec.clone(),
            current_status: self.current_status,
            desired_status: self.desired_status,
            recovery_status: self.recovery_status,
            status_detail: self.status_detail.clone(),
            status_since: self.status_since,
            failure_count: self.failure_count,
            tunnel_state: self.tunnel_state.clone(),
        }
    }
}

/// Point-in-time copy of a session without its requesters
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SessionSnapshot {
    pub connection_id: ConnectionId,
    #[serde(skip)]
    pub spec: ConnectionSpec,
    pub current_status: ConnectivityStatus,
    pub desired_status: DesiredStatus,
    pub recovery_status: RecoveryStatus,
    pub status_detail: String,
    pub status_since: DateTime<Utc>,
    pub failure_count: u32,
    pub tunnel_state: TunnelState,
}
