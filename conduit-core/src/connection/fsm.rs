//! Connection lifecycle state machine
//!
//! A synchronous transition function: [`ClientFsm::handle`] takes one input
//! and returns the effects the owning actor must carry out (driver hooks,
//! timers, replies). It never performs I/O itself.
//!
//! # State Diagram
//!
//! ```text
//!  UNKNOWN ──init──► INITIALIZED ──open──► CONNECTING ──connected+init ok──► CONNECTED
//!  (stashes input)        ▲                  │  ▲   ▲                           │
//!                         │                  │  │   └──────── failure ──────────┘
//!                  backoff exhausted ◄───────┘  │  (backoff wait, then reconnect)
//!                                               │
//!  DISCONNECTED ◄──disconnected── DISCONNECTING ◄──close── CONNECTED / INITIALIZED
//!        └──────────── open ───────────────────────────────► CONNECTING
//!
//!  TESTING ──result or deadline──► terminated (transient instance only)
//! ```
//!
//! Volatile states (`Connecting`, `Disconnecting`, `Testing`) always carry
//! exactly one deadline timer; stable states carry none. Every timer has a
//! generation number, and a timeout whose generation is not the active one
//! is ignored.

use super::command::{CommandEnvelope, CommandReply, ConnectionCommand, Requester};
use crate::config::ClientConfig;
use crate::core::errors::{CommandFailure, ConnectionError};
use crate::core::session::{ConnectionSession, SessionSnapshot, TunnelState};
use crate::core::types::{ConnectionSpec, ConnectivityStatus, DesiredStatus, RecoveryStatus};
use crate::resilience::backoff::{BackoffConfig, ReconnectBackoffStrategy};
use crate::resilience::supervision::{self, ChildKind, SupervisorDirective};
use std::collections::VecDeque;
use std::fmt;
use std::time::Duration;
use tracing::{debug, error, info, warn};

// ============================================================================
// States, inputs, effects
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ClientState {
    Unknown,
    Initialized,
    Connecting,
    Connected,
    Disconnecting,
    Disconnected,
    Testing,
}

impl ClientState {
    /// Governed by a deadline timer
    pub fn is_volatile(&self) -> bool {
        matches!(self, Self::Connecting | Self::Disconnecting | Self::Testing)
    }
}

impl fmt::Display for ClientState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Unknown => "unknown",
            Self::Initialized => "initialized",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Disconnecting => "disconnecting",
            Self::Disconnected => "disconnected",
            Self::Testing => "testing",
        };
        f.write_str(s)
    }
}

/// Why the driver connect hook is invoked
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectOrigin {
    Command,
    Reconnect,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TunnelEvent {
    Established { local_port: u16 },
    Failed(String),
}

#[derive(Debug)]
pub enum ClientInput {
    InitComplete,
    Command(CommandEnvelope),
    ClientConnected,
    ClientDisconnected,
    /// The connect hook refused the attempt synchronously
    ConnectRejected(ConnectionError),
    ConnectionFailure(ConnectionError),
    /// Publisher and consumers started (or failed to)
    InitializationResult(Result<(), ConnectionError>),
    TestResult(Result<String, ConnectionError>),
    Tunnel(TunnelEvent),
    ChildFailed {
        child: ChildKind,
        error: ConnectionError,
    },
    StateTimeout {
        generation: u64,
    },
}

#[derive(Debug)]
pub enum ClientEffect {
    ArmTimer {
        generation: u64,
        after: Duration,
    },
    CancelTimer {
        generation: u64,
    },
    Connect {
        spec: ConnectionSpec,
        origin: ConnectOrigin,
    },
    Disconnect {
        spec: ConnectionSpec,
        shutdown: bool,
        /// Publish the close announcement first
        announce: bool,
    },
    StartTunnel {
        spec: ConnectionSpec,
    },
    /// Start publisher and consumers; answer with `InitializationResult`
    StartChildren {
        spec: ConnectionSpec,
    },
    ReleaseResources {
        spec: ConnectionSpec,
    },
    RunTest {
        spec: ConnectionSpec,
    },
    Reply {
        requester: Requester,
        reply: CommandReply,
    },
    /// Answer a retrieval or logging command from the snapshot
    Answer {
        command: ConnectionCommand,
        requester: Requester,
        snapshot: SessionSnapshot,
    },
    /// Run a test on a separate transient instance
    SpawnTest {
        envelope: CommandEnvelope,
    },
    Terminate,
}

// ============================================================================
// Settings
// ============================================================================

#[derive(Debug, Clone, PartialEq)]
pub struct FsmSettings {
    pub backoff: BackoffConfig,
    pub disconnect_timeout: Duration,
    pub disconnect_announce_timeout: Duration,
    pub testing_timeout: Duration,
}

impl From<&ClientConfig> for FsmSettings {
    fn from(config: &ClientConfig) -> Self {
        Self {
            backoff: config.backoff_config(),
            disconnect_timeout: config.disconnect_timeout(false),
            disconnect_announce_timeout: config.disconnect_timeout(true),
            testing_timeout: config.testing_timeout(),
        }
    }
}

impl Default for FsmSettings {
    fn default() -> Self {
        Self::from(&ClientConfig::default())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TimerPurpose {
    /// Deadline of a connect attempt
    ConnectDeadline,
    /// Wait before the next connect attempt
    Backoff,
    DisconnectDeadline,
    TestDeadline,
}

#[derive(Debug, Clone, Copy)]
struct ActiveTimer {
    generation: u64,
    purpose: TimerPurpose,
}

// ============================================================================
// State machine
// ============================================================================

pub struct ClientFsm {
    state: ClientState,
    session: ConnectionSession,
    backoff: ReconnectBackoffStrategy,
    settings: FsmSettings,
    timer: Option<ActiveTimer>,
    next_generation: u64,
    /// Input deferred until a stable state is reached
    stash: VecDeque<ClientInput>,
    /// Input to process before returning from `handle`
    queue: VecDeque<ClientInput>,
    resources_allocated: bool,
    /// Connect deferred until the tunnel is up
    awaiting_tunnel: Option<ConnectOrigin>,
    shutdown_requested: bool,
    terminated: bool,
}

impl ClientFsm {
    /// Machine in `Unknown`, waiting for `InitComplete`
    pub fn new(spec: ConnectionSpec, settings: FsmSettings) -> Self {
        Self {
            state: ClientState::Unknown,
            session: ConnectionSession::new(spec),
            backoff: ReconnectBackoffStrategy::new(settings.backoff),
            settings,
            timer: None,
            next_generation: 1,
            stash: VecDeque::new(),
            queue: VecDeque::new(),
            resources_allocated: false,
            awaiting_tunnel: None,
            shutdown_requested: false,
            terminated: false,
        }
    }

    /// Transient machine that tests `spec` once and terminates
    pub fn for_test(
        spec: ConnectionSpec,
        settings: FsmSettings,
        envelope: CommandEnvelope,
    ) -> (Self, Vec<ClientEffect>) {
        let mut fsm = Self::new(spec.clone(), settings);
        let mut effects = Vec::new();

        fsm.update(|s| s.with_spec(spec.clone()).with_requester(envelope));
        fsm.transition(ClientState::Testing);
        let deadline = fsm.settings.testing_timeout;
        fsm.arm_timer(deadline, TimerPurpose::TestDeadline, &mut effects);
        effects.push(ClientEffect::RunTest { spec });
        (fsm, effects)
    }

    pub fn state(&self) -> ClientState {
        self.state
    }

    pub fn session(&self) -> &ConnectionSession {
        &self.session
    }

    pub fn backoff(&self) -> &ReconnectBackoffStrategy {
        &self.backoff
    }

    /// Generation of the armed timer
    pub fn active_timer(&self) -> Option<u64> {
        self.timer.map(|t| t.generation)
    }

    pub fn stash_len(&self) -> usize {
        self.stash.len()
    }

    pub fn resources_allocated(&self) -> bool {
        self.resources_allocated
    }

    pub fn is_terminated(&self) -> bool {
        self.terminated
    }

    /// Process one input plus everything it self-posts or unstashes
    pub fn handle(&mut self, input: ClientInput) -> Vec<ClientEffect> {
        let mut effects = Vec::new();
        self.queue.push_back(input);

        while let Some(next) = self.queue.pop_front() {
            if self.terminated {
                self.refuse_after_termination(next, &mut effects);
            } else {
                self.step(next, &mut effects);
            }
        }
        effects
    }

    fn step(&mut self, input: ClientInput, effects: &mut Vec<ClientEffect>) {
        use ClientInput as In;
        use ClientState as S;

        match (self.state, input) {
            (_, In::StateTimeout { generation }) => self.on_timer_fired(generation, effects),

            (_, In::Command(envelope)) if envelope.command.is_query() => {
                self.answer(envelope, effects)
            }

            (S::Unknown, In::InitComplete) => self.on_init_complete(effects),
            (S::Unknown, other) => {
                debug!(connection_id = %self.session.connection_id(), input = ?other, "Stashing input until initialized");
                self.stash.push_back(other);
            }
            (_, In::InitComplete) => {
                warn!(connection_id = %self.session.connection_id(), "Duplicate initialization ignored");
            }

            (_, In::Command(envelope)) => self.on_command(envelope, effects),

            (S::Connecting, In::ClientConnected) => self.on_client_connected(effects),
            (S::Connecting, In::InitializationResult(result)) => {
                self.on_initialization_result(result, effects)
            }
            (S::Connecting, In::ConnectRejected(err)) => self.on_connect_rejected(err, effects),
            (S::Connecting | S::Connected, In::ConnectionFailure(err)) => {
                self.on_failure(err, effects)
            }

            (S::Disconnecting, In::ClientDisconnected) => self.on_disconnected(effects),
            (S::Disconnecting, In::ConnectionFailure(err)) => {
                warn!(
                    connection_id = %self.session.connection_id(),
                    error = %err,
                    "Failure while disconnecting, treating as disconnected"
                );
                self.on_disconnected(effects)
            }

            (S::Testing, In::TestResult(result)) => self.on_test_result(result, effects),

            (_, In::Tunnel(event)) => self.on_tunnel_event(event, effects),
            (_, In::ChildFailed { child, error }) => self.on_child_failed(child, error, effects),

            (state, other) => {
                debug!(
                    connection_id = %self.session.connection_id(),
                    state = %state,
                    input = ?other,
                    "Input not handled in current state"
                );
            }
        }
    }

    // ------------------------------------------------------------------------
    // Initialization and commands
    // ------------------------------------------------------------------------

    fn on_init_complete(&mut self, effects: &mut Vec<ClientEffect>) {
        info!(
            connection_id = %self.session.connection_id(),
            desired = ?self.session.desired_status(),
            "Connection initialized"
        );
        self.goto_stable(ClientState::Initialized, effects);

        if self.session.desired_status() == DesiredStatus::Open {
            self.queue
                .push_back(ClientInput::Command(CommandEnvelope::detached(ConnectionCommand::Open)));
        }
    }

    fn on_command(&mut self, envelope: CommandEnvelope, effects: &mut Vec<ClientEffect>) {
        if self.state == ClientState::Testing {
            let err = ConnectionError::Configuration("connection is being tested".to_string());
            self.reply_failure(envelope.requester, &err, effects);
            return;
        }

        match envelope.command {
            ConnectionCommand::Open => self.on_open(envelope, effects),
            ConnectionCommand::Close { shutdown } => self.on_close(envelope, shutdown, effects),
            ConnectionCommand::Test(_) => effects.push(ClientEffect::SpawnTest { envelope }),
            _ => self.answer(envelope, effects),
        }
    }

    fn on_open(&mut self, envelope: CommandEnvelope, effects: &mut Vec<ClientEffect>) {
        match self.state {
            ClientState::Initialized | ClientState::Disconnected => {
                info!(connection_id = %self.session.connection_id(), "Opening connection");
                self.backoff.reset();
                self.update(|s| {
                    s.with_desired_status(DesiredStatus::Open)
                        .with_reset_failure_count()
                        .with_requester(envelope)
                });
                self.transition(ClientState::Connecting);
                let timeout = self.backoff.config().min_timeout;
                self.arm_timer(timeout, TimerPurpose::ConnectDeadline, effects);
                self.connect_or_tunnel(ConnectOrigin::Command, effects);
            }
            ClientState::Connecting => {
                self.update(|s| s.with_desired_status(DesiredStatus::Open).with_requester(envelope));
            }
            ClientState::Connected => {
                let reply = CommandReply::success(self.session.connection_id(), "already connected");
                effects.push(ClientEffect::Reply {
                    requester: envelope.requester,
                    reply,
                });
            }
            ClientState::Disconnecting => {
                debug!(connection_id = %self.session.connection_id(), "Open while disconnecting, stashing");
                self.stash.push_back(ClientInput::Command(envelope));
            }
            ClientState::Unknown | ClientState::Testing => {}
        }
    }

    fn on_close(&mut self, envelope: CommandEnvelope, shutdown: bool, effects: &mut Vec<ClientEffect>) {
        if self.state == ClientState::Disconnected {
            effects.push(ClientEffect::Reply {
                requester: envelope.requester,
                reply: CommandReply::success(self.session.connection_id(), "already disconnected"),
            });
            if shutdown {
                self.shutdown_requested = true;
                self.terminate(effects);
            }
            return;
        }

        self.shutdown_requested |= shutdown;

        if self.state == ClientState::Disconnecting {
            self.update(|s| s.with_requester(envelope));
            return;
        }

        if self.state == ClientState::Connecting {
            // pending opens will never see a connection
            let err = ConnectionError::Transient("closed before the connection was established".into());
            self.reply_all_failure(&err, effects);
        }

        let announce = self.session.spec().announce_close && self.state == ClientState::Connected;
        let timeout = if announce {
            self.settings.disconnect_announce_timeout
        } else {
            self.settings.disconnect_timeout
        };

        info!(
            connection_id = %self.session.connection_id(),
            shutdown,
            announce,
            "Closing connection"
        );
        self.awaiting_tunnel = None;
        self.update(|s| s.with_desired_status(DesiredStatus::Closed).with_requester(envelope));
        self.transition(ClientState::Disconnecting);
        self.arm_timer(timeout, TimerPurpose::DisconnectDeadline, effects);
        effects.push(ClientEffect::Disconnect {
            spec: self.session.spec().clone(),
            shutdown: self.shutdown_requested,
            announce,
        });
    }

    fn answer(&mut self, envelope: CommandEnvelope, effects: &mut Vec<ClientEffect>) {
        effects.push(ClientEffect::Answer {
            command: envelope.command,
            requester: envelope.requester,
            snapshot: self.session.snapshot(),
        });
    }

    // ------------------------------------------------------------------------
    // Connecting
    // ------------------------------------------------------------------------

    fn connect_or_tunnel(&mut self, origin: ConnectOrigin, effects: &mut Vec<ClientEffect>) {
        let spec = self.session.spec().clone();
        if self.session.tunnel_blocks_connect() {
            debug!(connection_id = %spec.id, "Tunnel required before connecting");
            self.awaiting_tunnel = Some(origin);
            effects.push(ClientEffect::StartTunnel { spec });
        } else {
            self.awaiting_tunnel = None;
            effects.push(ClientEffect::Connect { spec, origin });
        }
    }

    fn on_client_connected(&mut self, effects: &mut Vec<ClientEffect>) {
        info!(connection_id = %self.session.connection_id(), "Client connected, starting children");
        self.update(|s| s.with_reset_failure_count());

        if matches!(self.timer, Some(ActiveTimer { purpose: TimerPurpose::Backoff, .. })) {
            let timeout = self.backoff.current_timeout();
            self.arm_timer(timeout, TimerPurpose::ConnectDeadline, effects);
        }

        if self.resources_allocated {
            effects.push(ClientEffect::ReleaseResources {
                spec: self.session.spec().clone(),
            });
        }
        self.resources_allocated = true;
        effects.push(ClientEffect::StartChildren {
            spec: self.session.spec().clone(),
        });
    }

    fn on_initialization_result(
        &mut self,
        result: Result<(), ConnectionError>,
        effects: &mut Vec<ClientEffect>,
    ) {
        match result {
            Ok(()) if self.session.failure_count() == 0 => self.on_connected(effects),
            Ok(()) => {
                debug!(
                    connection_id = %self.session.connection_id(),
                    failures = self.session.failure_count(),
                    "Children started after a concurrent failure, staying in connecting"
                );
            }
            Err(err) => self.on_failure(err, effects),
        }
    }

    fn on_connected(&mut self, effects: &mut Vec<ClientEffect>) {
        info!(connection_id = %self.session.connection_id(), "Connection established");

        self.backoff.reset();
        let recovered = self.session.recovery_status() == RecoveryStatus::Ongoing;
        self.update(|s| {
            let s = s
                .with_status(ConnectivityStatus::Open, "connected")
                .with_reset_failure_count();
            if recovered {
                s.with_recovery_status(RecoveryStatus::Succeeded)
            } else {
                s
            }
        });

        let reply = CommandReply::success(self.session.connection_id(), "connected");
        self.reply_all(reply, effects);
        self.goto_stable(ClientState::Connected, effects);
    }

    fn on_connect_rejected(&mut self, err: ConnectionError, effects: &mut Vec<ClientEffect>) {
        if err.is_configuration() {
            warn!(
                connection_id = %self.session.connection_id(),
                error = %err,
                "Connect rejected as misconfigured, retrying on deadline"
            );
            self.update(|s| s.with_status(ConnectivityStatus::Misconfigured, err.to_string()));
            return;
        }
        self.on_failure(err, effects);
    }

    fn on_failure(&mut self, err: ConnectionError, effects: &mut Vec<ClientEffect>) {
        warn!(
            connection_id = %self.session.connection_id(),
            state = %self.state,
            error = %err,
            "Connection failure"
        );

        self.release_resources(effects);
        let status = if err.is_configuration() {
            ConnectivityStatus::Misconfigured
        } else {
            ConnectivityStatus::Failed
        };
        self.update(|s| s.with_incremented_failure_count().with_status(status, err.to_string()));
        self.route_through_backoff(err, effects);
    }

    fn route_through_backoff(&mut self, cause: ConnectionError, effects: &mut Vec<ClientEffect>) {
        if self.session.desired_status() != DesiredStatus::Open {
            self.reply_all_failure(&cause, effects);
            self.goto_stable(ClientState::Initialized, effects);
            return;
        }

        if !self.backoff.can_reconnect() {
            self.backoff_limit_reached(cause, effects);
            return;
        }

        let wait = self.backoff.next_backoff();
        debug!(
            connection_id = %self.session.connection_id(),
            wait_ms = wait.as_millis() as u64,
            tries = self.backoff.tries_used(),
            "Backing off before reconnecting"
        );
        self.update(|s| s.with_recovery_status(RecoveryStatus::Ongoing));
        self.transition(ClientState::Connecting);
        self.arm_timer(wait, TimerPurpose::Backoff, effects);
    }

    fn backoff_limit_reached(&mut self, cause: ConnectionError, effects: &mut Vec<ClientEffect>) {
        error!(
            connection_id = %self.session.connection_id(),
            tries = self.backoff.tries_used(),
            error = %cause,
            "Reconnect backoff limit reached"
        );
        self.release_resources(effects);
        self.update(|s| s.with_recovery_status(RecoveryStatus::BackoffLimitReached));
        self.reply_all_failure(&cause, effects);
        self.goto_stable(ClientState::Initialized, effects);
    }

    // ------------------------------------------------------------------------
    // Disconnecting and testing
    // ------------------------------------------------------------------------

    fn on_disconnected(&mut self, effects: &mut Vec<ClientEffect>) {
        info!(connection_id = %self.session.connection_id(), "Connection closed");

        self.release_resources(effects);
        self.update(|s| s.with_status(ConnectivityStatus::Closed, "disconnected"));
        let reply = CommandReply::success(self.session.connection_id(), "disconnected");
        self.reply_all(reply, effects);

        if self.shutdown_requested {
            self.cancel_timer(effects);
            self.transition(ClientState::Disconnected);
            self.terminate(effects);
        } else {
            self.goto_stable(ClientState::Disconnected, effects);
        }
    }

    fn on_test_result(&mut self, result: Result<String, ConnectionError>, effects: &mut Vec<ClientEffect>) {
        match result {
            Ok(detail) => {
                info!(connection_id = %self.session.connection_id(), detail = %detail, "Connection test succeeded");
                let reply = CommandReply::success(self.session.connection_id(), detail);
                self.reply_all(reply, effects);
            }
            Err(err) => {
                warn!(connection_id = %self.session.connection_id(), error = %err, "Connection test failed");
                self.reply_all_failure(&err, effects);
            }
        }
        self.cancel_timer(effects);
        self.terminate(effects);
    }

    // ------------------------------------------------------------------------
    // Deadlines
    // ------------------------------------------------------------------------

    fn on_timer_fired(&mut self, generation: u64, effects: &mut Vec<ClientEffect>) {
        let Some(timer) = self.timer.filter(|t| t.generation == generation) else {
            debug!(
                connection_id = %self.session.connection_id(),
                generation,
                "Ignoring stale state timeout"
            );
            return;
        };
        self.timer = None;

        match (self.state, timer.purpose) {
            (ClientState::Testing, _) => {
                let err = ConnectionError::timeout("connection test", self.settings.testing_timeout);
                self.on_test_result(Err(err), effects);
            }
            (ClientState::Disconnecting, _) => {
                let err = ConnectionError::timeout("disconnect", self.settings.disconnect_timeout);
                self.on_volatile_timeout(err, effects);
            }
            (ClientState::Connecting, TimerPurpose::Backoff) => {
                self.on_volatile_timeout(ConnectionError::Transient("backoff elapsed".into()), effects);
            }
            (ClientState::Connecting, _) => {
                let err = ConnectionError::timeout("connect", self.backoff.current_timeout());
                warn!(connection_id = %self.session.connection_id(), error = %err, "Connect attempt timed out");
                self.release_resources(effects);
                self.update(|s| s.with_status(ConnectivityStatus::Failed, err.to_string()));
                self.on_volatile_timeout(err, effects);
            }
            (state, purpose) => {
                error!(
                    connection_id = %self.session.connection_id(),
                    state = %state,
                    purpose = ?purpose,
                    "Timer fired in a stable state"
                );
            }
        }
    }

    fn on_volatile_timeout(&mut self, cause: ConnectionError, effects: &mut Vec<ClientEffect>) {
        if self.session.desired_status() == DesiredStatus::Open {
            if self.backoff.can_reconnect() {
                let timeout = self.backoff.next_timeout();
                info!(
                    connection_id = %self.session.connection_id(),
                    timeout_ms = timeout.as_millis() as u64,
                    tries = self.backoff.tries_used(),
                    "Reconnecting"
                );
                self.release_resources(effects);
                self.transition(ClientState::Connecting);
                self.arm_timer(timeout, TimerPurpose::ConnectDeadline, effects);
                self.connect_or_tunnel(ConnectOrigin::Reconnect, effects);
            } else {
                self.backoff_limit_reached(cause, effects);
            }
            return;
        }

        warn!(
            connection_id = %self.session.connection_id(),
            state = %self.state,
            error = %cause,
            "Deadline expired while closed was desired"
        );
        self.release_resources(effects);
        self.update(|s| s.with_status(ConnectivityStatus::Failed, cause.to_string()));
        self.reply_all_failure(&cause, effects);

        if self.shutdown_requested {
            self.transition(ClientState::Initialized);
            self.terminate(effects);
        } else {
            self.goto_stable(ClientState::Initialized, effects);
        }
    }

    // ------------------------------------------------------------------------
    // Children
    // ------------------------------------------------------------------------

    fn on_tunnel_event(&mut self, event: TunnelEvent, effects: &mut Vec<ClientEffect>) {
        match event {
            TunnelEvent::Established { local_port } => {
                info!(connection_id = %self.session.connection_id(), local_port, "Tunnel established");
                self.update(|s| s.with_tunnel_state(TunnelState::Established { local_port }));
                if self.state == ClientState::Connecting {
                    if let Some(origin) = self.awaiting_tunnel.take() {
                        effects.push(ClientEffect::Connect {
                            spec: self.session.spec().clone(),
                            origin,
                        });
                    }
                }
            }
            TunnelEvent::Failed(cause) => {
                self.update(|s| s.with_tunnel_state(TunnelState::Failed { cause: cause.clone() }));
                let err = ConnectionError::Transient(format!("tunnel failed: {cause}"));
                self.on_child_failed(ChildKind::Tunnel, err, effects);
            }
        }
    }

    fn on_child_failed(&mut self, child: ChildKind, err: ConnectionError, effects: &mut Vec<ClientEffect>) {
        match supervision::decide(child, &err) {
            SupervisorDirective::Resume => {}
            SupervisorDirective::Restart => {
                if matches!(self.state, ClientState::Connecting | ClientState::Connected) {
                    effects.push(ClientEffect::StartTunnel {
                        spec: self.session.spec().clone(),
                    });
                }
            }
            SupervisorDirective::Escalate => {
                if matches!(self.state, ClientState::Connecting | ClientState::Connected) {
                    self.on_failure(err, effects);
                }
            }
        }
    }

    // ------------------------------------------------------------------------
    // Helpers
    // ------------------------------------------------------------------------

    fn update(&mut self, f: impl FnOnce(ConnectionSession) -> ConnectionSession) {
        let session = std::mem::take(&mut self.session);
        self.session = f(session);
    }

    fn transition(&mut self, next: ClientState) {
        if self.state != next {
            info!(
                connection_id = %self.session.connection_id(),
                from = %self.state,
                to = %next,
                "State transition"
            );
        }
        self.state = next;
    }

    /// Enter a stable state: no timer, no failures, no pending requesters
    fn goto_stable(&mut self, next: ClientState, effects: &mut Vec<ClientEffect>) {
        self.cancel_timer(effects);
        self.awaiting_tunnel = None;
        self.update(|s| s.with_reset_failure_count());

        let err = ConnectionError::Transient(format!("superseded by transition to {next}"));
        self.reply_all_failure(&err, effects);
        self.transition(next);

        // replayed ahead of anything queued later
        while let Some(input) = self.stash.pop_back() {
            self.queue.push_front(input);
        }
    }

    fn arm_timer(&mut self, after: Duration, purpose: TimerPurpose, effects: &mut Vec<ClientEffect>) {
        self.cancel_timer(effects);
        let generation = self.next_generation;
        self.next_generation += 1;
        self.timer = Some(ActiveTimer { generation, purpose });

        debug!(
            connection_id = %self.session.connection_id(),
            generation,
            after_ms = after.as_millis() as u64,
            purpose = ?purpose,
            "Arming state timer"
        );
        effects.push(ClientEffect::ArmTimer { generation, after });
    }

    fn cancel_timer(&mut self, effects: &mut Vec<ClientEffect>) {
        if let Some(timer) = self.timer.take() {
            debug!(connection_id = %self.session.connection_id(), generation = timer.generation, "Cancelling state timer");
            effects.push(ClientEffect::CancelTimer {
                generation: timer.generation,
            });
        }
    }

    fn release_resources(&mut self, effects: &mut Vec<ClientEffect>) {
        if self.resources_allocated {
            self.resources_allocated = false;
            effects.push(ClientEffect::ReleaseResources {
                spec: self.session.spec().clone(),
            });
        }
    }

    fn reply_all(&mut self, reply: CommandReply, effects: &mut Vec<ClientEffect>) {
        let (session, pending) = std::mem::take(&mut self.session).take_requesters();
        self.session = session;
        for request in pending {
            effects.push(ClientEffect::Reply {
                requester: request.requester,
                reply: reply.clone(),
            });
        }
    }

    fn reply_all_failure(&mut self, err: &ConnectionError, effects: &mut Vec<ClientEffect>) {
        let failure = CommandFailure::new(self.session.connection_id(), err);
        self.reply_all(CommandReply::Failure(failure), effects);
    }

    fn reply_failure(&self, requester: Requester, err: &ConnectionError, effects: &mut Vec<ClientEffect>) {
        let failure = CommandFailure::new(self.session.connection_id(), err);
        effects.push(ClientEffect::Reply {
            requester,
            reply: CommandReply::Failure(failure),
        });
    }

    fn terminate(&mut self, effects: &mut Vec<ClientEffect>) {
        info!(connection_id = %self.session.connection_id(), state = %self.state, "Terminating connection");
        self.cancel_timer(effects);
        self.terminated = true;

        let err = ConnectionError::Transient("connection terminated".into());
        self.reply_all_failure(&err, effects);
        while let Some(input) = self.stash.pop_front() {
            self.refuse_after_termination(input, effects);
        }
        effects.push(ClientEffect::Terminate);
    }

    fn refuse_after_termination(&mut self, input: ClientInput, effects: &mut Vec<ClientEffect>) {
        match input {
            ClientInput::Command(envelope) => {
                let err = ConnectionError::Transient("connection terminated".into());
                self.reply_failure(envelope.requester, &err, effects);
            }
            other => debug!(connection_id = %self.session.connection_id(), input = ?other, "Input after termination dropped"),
        }
    }
}

impl fmt::Debug for ClientFsm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientFsm")
            .field("state", &self.state)
            .field("connection_id", self.session.connection_id())
            .field("timer", &self.timer)
            .field("stash", &self.stash.len())
            .field("terminated", &self.terminated)
            .finish()
    }
}
