//! Scripted protocol driver for testing
//!
//! Connect attempts consume a queue of [`ConnectBehavior`]s (falling back to
//! a default), every hook call is recorded, and the intake handed to the
//! consumers is kept so tests can feed inbound messages.

use super::helpers::RecordingPublisher;
use crate::connection::driver::{DriverEvents, ProtocolDriver, Publisher};
use crate::connection::fsm::ConnectOrigin;
use crate::connection::status::ResourceStatus;
use crate::core::errors::ConnectionError;
use crate::core::types::ConnectionSpec;
use crate::dispatch::InboundIntake;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;

/// Outcome of one connect attempt
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectBehavior {
    /// Report `connected` right away
    Succeed,
    /// Report a connection failure
    Fail(ConnectionError),
    /// Refuse synchronously
    Reject(ConnectionError),
    /// Never answer
    Hang,
}

/// A recorded hook invocation
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DriverCall {
    Connect(ConnectOrigin),
    Disconnect { shutdown: bool },
    Test,
    StartTunnel,
    StartPublisher,
    StartConsumers,
    Cleanup,
    AnnounceClose,
}

pub struct ScriptedDriver {
    script: Mutex<VecDeque<ConnectBehavior>>,
    default_behavior: Mutex<ConnectBehavior>,
    disconnect_hangs: Mutex<bool>,
    test_result: Mutex<Result<String, ConnectionError>>,
    resources: Mutex<Vec<ResourceStatus>>,
    calls: Mutex<Vec<DriverCall>>,
    events: Mutex<Option<DriverEvents>>,
    intake: Mutex<Option<InboundIntake>>,
    publisher: Arc<RecordingPublisher>,
}

impl Default for ScriptedDriver {
    fn default() -> Self {
        Self::new()
    }
}

impl ScriptedDriver {
    /// Driver whose connects always succeed
    pub fn new() -> Self {
        Self::with_publisher(RecordingPublisher::default())
    }

    pub fn with_publisher(publisher: RecordingPublisher) -> Self {
        Self {
            script: Mutex::new(VecDeque::new()),
            default_behavior: Mutex::new(ConnectBehavior::Succeed),
            disconnect_hangs: Mutex::new(false),
            test_result: Mutex::new(Ok("endpoint reachable".to_string())),
            resources: Mutex::new(Vec::new()),
            calls: Mutex::new(Vec::new()),
            events: Mutex::new(None),
            intake: Mutex::new(None),
            publisher: Arc::new(publisher),
        }
    }

    /// Queue behaviors for the next connect attempts
    pub fn push_script(&self, behaviors: impl IntoIterator<Item = ConnectBehavior>) {
        self.script.lock().extend(behaviors);
    }

    /// Behavior once the script is exhausted
    pub fn set_default_behavior(&self, behavior: ConnectBehavior) {
        *self.default_behavior.lock() = behavior;
    }

    pub fn set_disconnect_hangs(&self, hangs: bool) {
        *self.disconnect_hangs.lock() = hangs;
    }

    pub fn set_test_result(&self, result: Result<String, ConnectionError>) {
        *self.test_result.lock() = result;
    }

    pub fn set_resources(&self, resources: Vec<ResourceStatus>) {
        *self.resources.lock() = resources;
    }

    pub fn calls(&self) -> Vec<DriverCall> {
        self.calls.lock().clone()
    }

    pub fn connect_count(&self) -> usize {
        self.calls
            .lock()
            .iter()
            .filter(|call| matches!(call, DriverCall::Connect(_)))
            .count()
    }

    /// Intake of the currently running consumers
    pub fn intake(&self) -> Option<InboundIntake> {
        self.intake.lock().clone()
    }

    pub fn publisher(&self) -> Arc<RecordingPublisher> {
        self.publisher.clone()
    }

    /// Simulate the established connection dropping
    pub fn drop_connection(&self, error: ConnectionError) -> bool {
        match self.events.lock().as_ref() {
            Some(events) => {
                events.failure(error);
                true
            }
            None => false,
        }
    }

    fn record(&self, call: DriverCall) {
        self.calls.lock().push(call);
    }
}

#[async_trait]
impl ProtocolDriver for ScriptedDriver {
    fn connect(
        &self,
        _spec: &ConnectionSpec,
        origin: ConnectOrigin,
        events: DriverEvents,
    ) -> Result<(), ConnectionError> {
        self.record(DriverCall::Connect(origin));

        let behavior = self
            .script
            .lock()
            .pop_front()
            .unwrap_or_else(|| self.default_behavior.lock().clone());
        *self.events.lock() = Some(events.clone());

        match behavior {
            ConnectBehavior::Succeed => events.connected(),
            ConnectBehavior::Fail(err) => events.failure(err),
            ConnectBehavior::Reject(err) => return Err(err),
            ConnectBehavior::Hang => {}
        }
        Ok(())
    }

    fn disconnect(
        &self,
        _spec: &ConnectionSpec,
        shutdown: bool,
        events: DriverEvents,
    ) -> Result<(), ConnectionError> {
        self.record(DriverCall::Disconnect { shutdown });
        if !*self.disconnect_hangs.lock() {
            events.disconnected();
        }
        Ok(())
    }

    async fn test(&self, _spec: &ConnectionSpec) -> Result<String, ConnectionError> {
        self.record(DriverCall::Test);
        self.test_result.lock().clone()
    }

    async fn start_publisher(&self, _spec: &ConnectionSpec) -> Result<Arc<dyn Publisher>, ConnectionError> {
        self.record(DriverCall::StartPublisher);
        Ok(self.publisher.clone())
    }

    async fn start_consumers(&self, _spec: &ConnectionSpec, intake: InboundIntake) -> Result<(), ConnectionError> {
        self.record(DriverCall::StartConsumers);
        *self.intake.lock() = Some(intake);
        Ok(())
    }

    fn cleanup_resources(&self, _spec: &ConnectionSpec) {
        self.record(DriverCall::Cleanup);
        self.intake.lock().take();
    }

    fn start_tunnel(&self, _spec: &ConnectionSpec, events: DriverEvents) {
        self.record(DriverCall::StartTunnel);
        events.tunnel_established(40022);
    }

    async fn announce_close(
        &self,
        _spec: &ConnectionSpec,
        _publisher: Option<Arc<dyn Publisher>>,
    ) -> Result<(), ConnectionError> {
        self.record(DriverCall::AnnounceClose);
        Ok(())
    }

    async fn resource_status(&self, _spec: &ConnectionSpec) -> Vec<ResourceStatus> {
        self.resources.lock().clone()
    }
}
