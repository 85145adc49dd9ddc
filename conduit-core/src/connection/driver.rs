//! Protocol driver hooks
//!
//! A driver implements the wire protocol of one connection type. The state
//! machine never blocks on it: `connect`/`disconnect`/`start_tunnel` only
//! start work and report completion later through [`DriverEvents`]; the
//! async hooks run on tasks owned by the connection actor.

use super::actor::ActorMessage;
use super::fsm::{ClientInput, ConnectOrigin, TunnelEvent};
use super::status::ResourceStatus;
use crate::ack::Acknowledgement;
use crate::core::errors::{ConnectionError, PublishError};
use crate::core::message::OutboundMessage;
use crate::core::types::{ConnectionId, ConnectionSpec};
use crate::dispatch::InboundIntake;
use crate::resilience::supervision::ChildKind;
use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::debug;

/// Publishing capability started by the driver once connected
#[async_trait]
pub trait Publisher: Send + Sync {
    /// Publish one message.
    ///
    /// `Ok(None)` means the protocol produced no acknowledgement.
    async fn publish(&self, message: OutboundMessage) -> Result<Option<Acknowledgement>, PublishError>;
}

#[async_trait]
pub trait ProtocolDriver: Send + Sync + 'static {
    /// Start connecting. A synchronous `Err` is a rejected attempt;
    /// everything else is reported through `events`.
    fn connect(
        &self,
        spec: &ConnectionSpec,
        origin: ConnectOrigin,
        events: DriverEvents,
    ) -> Result<(), ConnectionError>;

    /// Start disconnecting; completion goes through `events.disconnected()`
    fn disconnect(
        &self,
        spec: &ConnectionSpec,
        shutdown: bool,
        events: DriverEvents,
    ) -> Result<(), ConnectionError>;

    /// Try `spec` without keeping a connection; `Ok` carries a description
    async fn test(&self, spec: &ConnectionSpec) -> Result<String, ConnectionError>;

    async fn start_publisher(&self, spec: &ConnectionSpec) -> Result<Arc<dyn Publisher>, ConnectionError>;

    /// Start the consumers; they feed consumed messages into `intake`
    async fn start_consumers(
        &self,
        spec: &ConnectionSpec,
        intake: InboundIntake,
    ) -> Result<(), ConnectionError>;

    /// Release everything started since the last connect
    fn cleanup_resources(&self, spec: &ConnectionSpec);

    /// Establish the secure tunnel the connect hook depends on
    fn start_tunnel(&self, spec: &ConnectionSpec, events: DriverEvents) {
        debug!(connection_id = %spec.id, "Driver has no tunnel support");
        events.tunnel_failed(format!(
            "connection type '{}' does not support tunnels",
            spec.connection_type
        ));
    }

    /// Publish the close announcement before disconnecting
    async fn announce_close(
        &self,
        _spec: &ConnectionSpec,
        _publisher: Option<Arc<dyn Publisher>>,
    ) -> Result<(), ConnectionError> {
        Ok(())
    }

    /// Live status of the driver's children
    async fn resource_status(&self, _spec: &ConnectionSpec) -> Vec<ResourceStatus> {
        Vec::new()
    }
}

/// Reports driver progress back into the owning connection's mailbox
#[derive(Clone)]
pub struct DriverEvents {
    connection_id: ConnectionId,
    tx: mpsc::UnboundedSender<ActorMessage>,
}

impl DriverEvents {
    pub(crate) fn new(connection_id: ConnectionId, tx: mpsc::UnboundedSender<ActorMessage>) -> Self {
        Self { connection_id, tx }
    }

    pub fn connection_id(&self) -> &ConnectionId {
        &self.connection_id
    }

    pub fn connected(&self) {
        self.post(ClientInput::ClientConnected);
    }

    pub fn disconnected(&self) {
        self.post(ClientInput::ClientDisconnected);
    }

    pub fn failure(&self, error: ConnectionError) {
        self.post(ClientInput::ConnectionFailure(error));
    }

    pub fn tunnel_established(&self, local_port: u16) {
        self.post(ClientInput::Tunnel(TunnelEvent::Established { local_port }));
    }

    pub fn tunnel_failed(&self, cause: impl Into<String>) {
        self.post(ClientInput::Tunnel(TunnelEvent::Failed(cause.into())));
    }

    pub fn child_failed(&self, child: ChildKind, error: ConnectionError) {
        self.post(ClientInput::ChildFailed { child, error });
    }

    fn post(&self, input: ClientInput) {
        if self.tx.send(ActorMessage::Input(input)).is_err() {
            debug!(connection_id = %self.connection_id, "Driver event after connection terminated");
        }
    }
}

impl std::fmt::Debug for DriverEvents {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DriverEvents")
            .field("connection_id", &self.connection_id)
            .finish_non_exhaustive()
    }
}
