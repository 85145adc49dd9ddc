//! Connection actor
//!
//! Owns one [`ClientFsm`] and executes its effects: driver hooks run on
//! spawned tasks, timers are sleeping tasks that post `StateTimeout` back
//! into the mailbox, and every driver callback re-enters through the same
//! unbounded mailbox. The FSM is therefore only ever touched by this task.
//!
//! Children (publisher, consumers, intake worker) are tagged with an epoch.
//! Releasing resources bumps the epoch, so a start that completes after a
//! release is discarded instead of attaching a stale publisher. The intake
//! worker is stopped rather than aborted so buffered messages are rejected
//! for redelivery.

use super::command::{CommandEnvelope, CommandReply, ConnectionCommand, Requester};
use super::driver::{DriverEvents, ProtocolDriver, Publisher};
use super::fsm::{ClientEffect, ClientFsm, ClientInput, ClientState, ConnectOrigin, FsmSettings};
use super::status::{build_report, ConnectionStatusReport};
use crate::ack::Acknowledgement;
use crate::config::ConnectivityConfig;
use crate::core::errors::{CommandFailure, ConnectionError};
use crate::core::message::OutboundSignal;
use crate::core::session::SessionSnapshot;
use crate::core::types::{ConnectionId, ConnectionSpec, ConnectivityStatus};
use crate::dispatch::{DispatchPipeline, ForwardedSignal, IntakeWorker, MessageMapper, PipelineSettings};
use crate::monitoring::connection_logs::{ConnectionLogger, ConnectionLogs, LogCategory};
use crate::monitoring::metrics::{ConnectionMetrics, MetricsSnapshot};
use anyhow::{bail, Context, Result};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Everything that reaches the actor's mailbox
pub(crate) enum ActorMessage {
    Input(ClientInput),
    ChildrenStarted {
        epoch: u64,
        result: Result<Arc<dyn Publisher>, ConnectionError>,
    },
    Outbound(OutboundSignal),
    Acknowledge(Acknowledgement),
}

/// Collaborators shared by a connection and the test instances it spawns
#[derive(Clone)]
struct Collaborators {
    driver: Arc<dyn ProtocolDriver>,
    mapper: Arc<dyn MessageMapper>,
    forwarder: mpsc::UnboundedSender<ForwardedSignal>,
    config: Arc<ConnectivityConfig>,
}

/// Per-connection monitoring and dispatch state, built before the FSM takes
/// over the spec
struct Wiring {
    metrics: Arc<ConnectionMetrics>,
    logger: Arc<ConnectionLogger>,
    pipeline: DispatchPipeline,
}

impl Wiring {
    fn new(spec: &ConnectionSpec, collaborators: &Collaborators) -> Result<Self> {
        if spec.id.as_str().is_empty() {
            bail!("connection id must not be empty");
        }
        let config = &collaborators.config;

        let metrics = Arc::new(
            ConnectionMetrics::new(&spec.id)
                .with_context(|| format!("Failed to register metrics for connection '{}'", spec.id))?,
        );
        let logger = Arc::new(ConnectionLogger::new(
            spec.id.clone(),
            config.logging.connection_log_capacity,
            config.logging.connection_log_enable_duration(),
        ));
        let pipeline = DispatchPipeline::new(
            spec.id.clone(),
            PipelineSettings::from_config(config, spec),
            collaborators.mapper.clone(),
            collaborators.forwarder.clone(),
            metrics.clone(),
            logger.clone(),
        );

        Ok(Self {
            metrics,
            logger,
            pipeline,
        })
    }
}

pub struct ConnectionActor {
    fsm: ClientFsm,
    collaborators: Collaborators,
    pipeline: DispatchPipeline,
    metrics: Arc<ConnectionMetrics>,
    logger: Arc<ConnectionLogger>,
    self_tx: mpsc::UnboundedSender<ActorMessage>,
    rx: mpsc::UnboundedReceiver<ActorMessage>,
    timers: HashMap<u64, JoinHandle<()>>,
    children_epoch: u64,
    intake_worker: Option<IntakeWorker>,
}

impl ConnectionActor {
    /// Start a connection on the current tokio runtime.
    ///
    /// Mapped inbound signals are sent to `forwarder`. The connection opens
    /// on its own when `spec.desired_status` is `Open`.
    pub fn spawn(
        spec: ConnectionSpec,
        driver: Arc<dyn ProtocolDriver>,
        mapper: Arc<dyn MessageMapper>,
        forwarder: mpsc::UnboundedSender<ForwardedSignal>,
        config: Arc<ConnectivityConfig>,
    ) -> Result<ConnectionHandle> {
        let collaborators = Collaborators {
            driver,
            mapper,
            forwarder,
            config,
        };
        let settings = FsmSettings::from(&collaborators.config.client);
        let fsm = ClientFsm::new(spec, settings);

        let actor = Self::build(fsm, collaborators)?;
        let handle = actor.handle();
        info!(connection_id = %handle.connection_id, "Connection actor started");

        tokio::spawn(actor.run(Vec::new(), true));
        Ok(handle)
    }

    fn build(fsm: ClientFsm, collaborators: Collaborators) -> Result<Self> {
        let wiring = Wiring::new(fsm.session().spec(), &collaborators)?;
        Ok(Self::assemble(fsm, collaborators, wiring))
    }

    fn assemble(fsm: ClientFsm, collaborators: Collaborators, wiring: Wiring) -> Self {
        let Wiring {
            metrics,
            logger,
            pipeline,
        } = wiring;
        let (self_tx, rx) = mpsc::unbounded_channel();

        Self {
            fsm,
            collaborators,
            pipeline,
            metrics,
            logger,
            self_tx,
            rx,
            timers: HashMap::new(),
            children_epoch: 0,
            intake_worker: None,
        }
    }

    fn handle(&self) -> ConnectionHandle {
        ConnectionHandle {
            connection_id: self.fsm.session().connection_id().clone(),
            tx: self.self_tx.clone(),
            command_timeout: self.collaborators.config.client.command_timeout(),
        }
    }

    fn events(&self) -> DriverEvents {
        DriverEvents::new(self.fsm.session().connection_id().clone(), self.self_tx.clone())
    }

    async fn run(mut self, initial: Vec<ClientEffect>, initialize: bool) {
        self.execute(initial);
        if initialize {
            self.apply(ClientInput::InitComplete);
        }

        while !self.fsm.is_terminated() {
            let Some(message) = self.rx.recv().await else {
                break;
            };
            self.on_message(message);
        }

        self.stop();
    }

    fn on_message(&mut self, message: ActorMessage) {
        match message {
            ActorMessage::Input(input) => self.apply(input),
            ActorMessage::ChildrenStarted { epoch, result } => self.on_children_started(epoch, result),
            ActorMessage::Outbound(signal) => {
                let published = self.pipeline.dispatch_outbound(signal);
                debug!(connection_id = %self.pipeline.connection_id(), published, "Outbound signal dispatched");
            }
            ActorMessage::Acknowledge(ack) => {
                self.pipeline.route_acknowledgement(ack);
            }
        }
    }

    fn apply(&mut self, input: ClientInput) {
        let state_before = self.fsm.state();
        let status_before = self.fsm.session().current_status();

        let effects = self.fsm.handle(input);
        self.execute(effects);

        let state = self.fsm.state();
        if state != state_before {
            self.metrics.connected.set(i64::from(state == ClientState::Connected));
        }

        let status = self.fsm.session().current_status();
        if status != status_before {
            let detail = self.fsm.session().status_detail();
            match status {
                ConnectivityStatus::Open => self.logger.success(LogCategory::Connection, None, detail),
                ConnectivityStatus::Failed | ConnectivityStatus::Misconfigured => {
                    self.logger.failure(LogCategory::Connection, None, detail)
                }
                _ => self.logger.info(LogCategory::Connection, None, detail),
            }
        }
    }

    fn on_children_started(&mut self, epoch: u64, result: Result<Arc<dyn Publisher>, ConnectionError>) {
        if epoch != self.children_epoch {
            debug!(
                connection_id = %self.pipeline.connection_id(),
                epoch,
                current = self.children_epoch,
                "Discarding children started for a released epoch"
            );
            return;
        }

        match result {
            Ok(publisher) => {
                let targets = self.fsm.session().spec().targets.clone();
                self.pipeline.attach_publisher(publisher, targets);
                self.apply(ClientInput::InitializationResult(Ok(())));
            }
            Err(err) => {
                self.logger.failure(LogCategory::Connection, None, format!("children failed to start: {err}"));
                self.apply(ClientInput::InitializationResult(Err(err)));
            }
        }
    }

    // ========================================================================
    // Effects
    // ========================================================================

    fn execute(&mut self, effects: Vec<ClientEffect>) {
        for effect in effects {
            self.execute_one(effect);
        }
    }

    fn execute_one(&mut self, effect: ClientEffect) {
        match effect {
            ClientEffect::ArmTimer { generation, after } => self.arm_timer(generation, after),
            ClientEffect::CancelTimer { generation } => {
                if let Some(timer) = self.timers.remove(&generation) {
                    timer.abort();
                }
            }
            ClientEffect::Connect { spec, origin } => self.connect(spec, origin),
            ClientEffect::Disconnect {
                spec,
                shutdown,
                announce,
            } => self.disconnect(spec, shutdown, announce),
            ClientEffect::StartTunnel { spec } => {
                self.logger.info(LogCategory::Connection, None, "starting tunnel");
                self.collaborators.driver.start_tunnel(&spec, self.events());
            }
            ClientEffect::StartChildren { spec } => self.start_children(spec),
            ClientEffect::ReleaseResources { spec } => self.release_resources(&spec),
            ClientEffect::RunTest { spec } => {
                let driver = self.collaborators.driver.clone();
                let tx = self.self_tx.clone();
                tokio::spawn(async move {
                    let result = driver.test(&spec).await;
                    let _ = tx.send(ActorMessage::Input(ClientInput::TestResult(result)));
                });
            }
            ClientEffect::Reply { requester, reply } => requester.reply(reply),
            ClientEffect::Answer {
                command,
                requester,
                snapshot,
            } => self.answer(command, requester, snapshot),
            ClientEffect::SpawnTest { envelope } => self.spawn_test(envelope),
            ClientEffect::Terminate => {
                debug!(connection_id = %self.pipeline.connection_id(), "Terminate requested");
            }
        }
    }

    fn arm_timer(&mut self, generation: u64, after: Duration) {
        self.timers.retain(|_, timer| !timer.is_finished());

        let tx = self.self_tx.clone();
        let timer = tokio::spawn(async move {
            tokio::time::sleep(after).await;
            let _ = tx.send(ActorMessage::Input(ClientInput::StateTimeout { generation }));
        });
        self.timers.insert(generation, timer);
    }

    fn connect(&mut self, spec: ConnectionSpec, origin: ConnectOrigin) {
        if origin == ConnectOrigin::Reconnect {
            self.metrics.reconnect_attempts.inc();
        }
        self.logger.info(LogCategory::Connection, None, format!("connecting to {}", spec.uri));

        if let Err(err) = self.collaborators.driver.connect(&spec, origin, self.events()) {
            // goes through the mailbox so the transition runs after this effect batch
            let _ = self.self_tx.send(ActorMessage::Input(ClientInput::ConnectRejected(err)));
        }
    }

    fn disconnect(&mut self, spec: ConnectionSpec, shutdown: bool, announce: bool) {
        self.logger.info(LogCategory::Connection, None, "disconnecting");

        let driver = self.collaborators.driver.clone();
        let publisher = if announce { self.pipeline.publisher() } else { None };
        let events = self.events();

        tokio::spawn(async move {
            if announce {
                if let Err(err) = driver.announce_close(&spec, publisher).await {
                    warn!(connection_id = %spec.id, error = %err, "Close announcement failed");
                }
            }
            if let Err(err) = driver.disconnect(&spec, shutdown, events.clone()) {
                events.failure(err);
            }
        });
    }

    fn start_children(&mut self, spec: ConnectionSpec) {
        self.children_epoch += 1;
        let epoch = self.children_epoch;

        if let Some(worker) = self.intake_worker.take() {
            worker.stop();
        }
        let (intake, worker) = self.pipeline.start_intake();
        self.intake_worker = Some(worker);

        let driver = self.collaborators.driver.clone();
        let tx = self.self_tx.clone();
        tokio::spawn(async move {
            let result: Result<Arc<dyn Publisher>, ConnectionError> = async {
                let publisher = driver.start_publisher(&spec).await?;
                driver.start_consumers(&spec, intake).await?;
                Ok(publisher)
            }
            .await;
            let _ = tx.send(ActorMessage::ChildrenStarted { epoch, result });
        });
    }

    fn release_resources(&mut self, spec: &ConnectionSpec) {
        self.children_epoch += 1;
        self.pipeline.detach_publisher();
        if let Some(worker) = self.intake_worker.take() {
            worker.stop();
        }
        self.collaborators.driver.cleanup_resources(spec);
        debug!(connection_id = %spec.id, epoch = self.children_epoch, "Resources released");
    }

    fn answer(&mut self, command: ConnectionCommand, requester: Requester, snapshot: SessionSnapshot) {
        let id = snapshot.connection_id.clone();

        match command {
            ConnectionCommand::RetrieveStatus => {
                let driver = self.collaborators.driver.clone();
                let poll_timeout = self.collaborators.config.client.status_poll_timeout();
                tokio::spawn(async move {
                    let resources = match tokio::time::timeout(poll_timeout, driver.resource_status(&snapshot.spec)).await {
                        Ok(resources) => resources,
                        Err(_) => {
                            warn!(connection_id = %snapshot.connection_id, "Children did not report status in time");
                            Vec::new()
                        }
                    };
                    requester.reply(CommandReply::Status(build_report(&snapshot, resources)));
                });
            }
            ConnectionCommand::RetrieveMetrics => {
                let mut metrics = self.metrics.snapshot();
                metrics.in_flight_collectors = self.pipeline.in_flight() as i64;
                requester.reply(CommandReply::Metrics(metrics));
            }
            ConnectionCommand::ResetMetrics => {
                self.metrics.reset();
                requester.reply(CommandReply::success(&id, "metrics reset"));
            }
            ConnectionCommand::EnableLogs => {
                self.logger.enable();
                requester.reply(CommandReply::success(&id, "logging enabled"));
            }
            ConnectionCommand::RetrieveLogs => requester.reply(CommandReply::Logs(self.logger.retrieve())),
            ConnectionCommand::ResetLogs => {
                self.logger.reset();
                requester.reply(CommandReply::success(&id, "logs reset"));
            }
            other => {
                error!(connection_id = %id, command = %other.kind(), "Lifecycle command routed as a query");
                let err = ConnectionError::InternalBug(format!("'{}' is not a query", other.kind()));
                requester.reply(CommandReply::Failure(CommandFailure::new(&id, &err)));
            }
        }
    }

    fn spawn_test(&mut self, envelope: CommandEnvelope) {
        let spec = match &envelope.command {
            ConnectionCommand::Test(spec) => spec.clone(),
            _ => {
                let err = ConnectionError::InternalBug("test requested without a spec".into());
                let failure = CommandFailure::new(self.pipeline.connection_id(), &err);
                envelope.requester.reply(CommandReply::Failure(failure));
                return;
            }
        };

        let wiring = match Wiring::new(&spec, &self.collaborators) {
            Ok(wiring) => wiring,
            Err(err) => {
                error!(connection_id = %spec.id, error = %err, "Could not start connection test");
                let err = ConnectionError::from_unstructured(&err);
                envelope
                    .requester
                    .reply(CommandReply::Failure(CommandFailure::new(&spec.id, &err)));
                return;
            }
        };

        let settings = FsmSettings::from(&self.collaborators.config.client);
        let (fsm, initial) = ClientFsm::for_test(spec.clone(), settings, envelope);
        let actor = Self::assemble(fsm, self.collaborators.clone(), wiring);

        info!(connection_id = %spec.id, "Spawning connection test");
        tokio::spawn(actor.run(initial, false));
    }

    fn stop(&mut self) {
        let id = self.pipeline.connection_id().clone();

        for (_, timer) in self.timers.drain() {
            timer.abort();
        }
        if let Some(worker) = self.intake_worker.take() {
            worker.stop();
        }
        self.pipeline.detach_publisher();
        self.metrics.connected.set(0);

        // refuse whatever is still queued
        self.rx.close();
        while let Ok(message) = self.rx.try_recv() {
            if let ActorMessage::Input(input @ ClientInput::Command(_)) = message {
                let effects = self.fsm.handle(input);
                for effect in effects {
                    if let ClientEffect::Reply { requester, reply } = effect {
                        requester.reply(reply);
                    }
                }
            }
        }

        info!(connection_id = %id, state = %self.fsm.state(), "Connection actor stopped");
    }
}

/// Cloneable address of a running connection
#[derive(Clone)]
pub struct ConnectionHandle {
    connection_id: ConnectionId,
    tx: mpsc::UnboundedSender<ActorMessage>,
    command_timeout: Duration,
}

impl ConnectionHandle {
    pub fn connection_id(&self) -> &ConnectionId {
        &self.connection_id
    }

    pub fn with_command_timeout(mut self, timeout: Duration) -> Self {
        self.command_timeout = timeout;
        self
    }

    /// True until the connection terminates
    pub fn is_alive(&self) -> bool {
        !self.tx.is_closed()
    }

    /// Resolves once the connection has terminated
    pub async fn terminated(&self) {
        self.tx.closed().await;
    }

    /// Send a command and wait for its reply.
    ///
    /// `Failure` replies, a terminated connection and an expired command
    /// timeout all come back as `Err`.
    pub async fn send_command(&self, command: ConnectionCommand) -> Result<CommandReply, CommandFailure> {
        let kind = command.kind();
        let (envelope, rx) = CommandEnvelope::new(command);

        if self.tx.send(ActorMessage::Input(ClientInput::Command(envelope))).is_err() {
            return Err(self.terminated_failure());
        }

        match tokio::time::timeout(self.command_timeout, rx).await {
            Ok(Ok(reply)) => reply.into_result(),
            Ok(Err(_)) => Err(self.terminated_failure()),
            Err(_) => {
                let err = ConnectionError::timeout(format!("{kind} command"), self.command_timeout);
                Err(CommandFailure::new(&self.connection_id, &err))
            }
        }
    }

    /// Enqueue a command without waiting for its reply
    pub fn submit(&self, command: ConnectionCommand) -> bool {
        let envelope = CommandEnvelope::detached(command);
        self.tx.send(ActorMessage::Input(ClientInput::Command(envelope))).is_ok()
    }

    pub async fn open(&self) -> Result<CommandReply, CommandFailure> {
        self.send_command(ConnectionCommand::Open).await
    }

    pub async fn close(&self) -> Result<CommandReply, CommandFailure> {
        self.send_command(ConnectionCommand::Close { shutdown: false }).await
    }

    /// Close and terminate the connection
    pub async fn shutdown(&self) -> Result<CommandReply, CommandFailure> {
        self.send_command(ConnectionCommand::Close { shutdown: true }).await
    }

    /// Try `spec` on a throwaway instance
    pub async fn test(&self, spec: ConnectionSpec) -> Result<CommandReply, CommandFailure> {
        self.send_command(ConnectionCommand::Test(spec)).await
    }

    pub async fn retrieve_status(&self) -> Result<ConnectionStatusReport, CommandFailure> {
        match self.send_command(ConnectionCommand::RetrieveStatus).await? {
            CommandReply::Status(report) => Ok(report),
            other => Err(self.unexpected_reply(other)),
        }
    }

    pub async fn retrieve_metrics(&self) -> Result<MetricsSnapshot, CommandFailure> {
        match self.send_command(ConnectionCommand::RetrieveMetrics).await? {
            CommandReply::Metrics(metrics) => Ok(metrics),
            other => Err(self.unexpected_reply(other)),
        }
    }

    pub async fn reset_metrics(&self) -> Result<(), CommandFailure> {
        self.send_command(ConnectionCommand::ResetMetrics).await.map(|_| ())
    }

    pub async fn enable_logs(&self) -> Result<(), CommandFailure> {
        self.send_command(ConnectionCommand::EnableLogs).await.map(|_| ())
    }

    pub async fn retrieve_logs(&self) -> Result<ConnectionLogs, CommandFailure> {
        match self.send_command(ConnectionCommand::RetrieveLogs).await? {
            CommandReply::Logs(logs) => Ok(logs),
            other => Err(self.unexpected_reply(other)),
        }
    }

    pub async fn reset_logs(&self) -> Result<(), CommandFailure> {
        self.send_command(ConnectionCommand::ResetLogs).await.map(|_| ())
    }

    /// Publish a platform signal through the connection's targets
    pub fn publish(&self, signal: OutboundSignal) -> bool {
        self.tx.send(ActorMessage::Outbound(signal)).is_ok()
    }

    /// Route an acknowledgement to the collector awaiting it
    pub fn acknowledge(&self, ack: Acknowledgement) -> bool {
        self.tx.send(ActorMessage::Acknowledge(ack)).is_ok()
    }

    fn terminated_failure(&self) -> CommandFailure {
        let err = ConnectionError::Transient("connection terminated".into());
        CommandFailure::new(&self.connection_id, &err)
    }

    fn unexpected_reply(&self, reply: CommandReply) -> CommandFailure {
        let err = ConnectionError::InternalBug(format!("unexpected reply: {reply:?}"));
        CommandFailure::new(&self.connection_id, &err)
    }
}

impl std::fmt::Debug for ConnectionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionHandle")
            .field("connection_id", &self.connection_id)
            .field("alive", &self.is_alive())
            .finish()
    }
}
