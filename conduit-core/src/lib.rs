//! Conduit Core - Managed Connectivity for Messaging Endpoints
//!
//! Conduit keeps long-lived connections to external message brokers and
//! bridges their traffic into a platform of domain signals. Every connection
//! is one supervised actor running a lifecycle state machine; inbound
//! messages are settled at their source only once the platform has
//! acknowledged them.
//!
//! ## Architecture
//! - **Sans-IO state machine**: transitions return effects, never perform I/O
//! - **One actor per connection**: a single tokio task owns the state machine
//! - **Acknowledgement collectors**: one short-lived task per signal awaiting acks
//! - **Protocol drivers** behind a trait; transports are pluggable
//!
//! ## Core Modules
//! - `core`: Identifiers, specs, session, error taxonomy
//! - `connection`: Lifecycle FSM, connection actor, command surface, driver hooks
//! - `ack`: Acknowledgement collection, delivery decision, publish correlation
//! - `dispatch`: Inbound intake, throttling and the dispatch pipeline
//! - `resilience`: Reconnect backoff and child supervision
//! - `monitoring`: Per-connection metrics and connection logs
//! - `config`: File and environment configuration

// Core data model
pub mod core;

pub mod ack;
pub mod config;
pub mod connection;
pub mod dispatch;
pub mod monitoring;
pub mod resilience;
pub mod utils;

// Mocks and builders for tests
pub mod testing;

// Re-export core types
pub use crate::core::{
    AckLabel, CommandFailure, ConnectionError, ConnectionId, ConnectionSpec, ConnectivityStatus,
    CorrelationId, DesiredStatus, RecoveryStatus,
};

// Re-export lifecycle types
pub use connection::{
    ClientFsm, ClientState, CommandReply, ConnectionActor, ConnectionCommand, ConnectionHandle,
    ProtocolDriver, Publisher,
};

// Re-export delivery types
pub use ack::{Acknowledgement, AcknowledgementCollector, CollectedOutcome, DeliveryOutcome};
pub use dispatch::{DispatchPipeline, MessageMapper, Settlement};

pub use config::ConnectivityConfig;
pub use resilience::{BackoffConfig, ReconnectBackoffStrategy};

// Re-export error types
pub use anyhow::{Error, Result};

/// Prelude for convenient imports
pub mod prelude {
    // Core types
    pub use crate::core::{
        ConnectionError, ConnectionId, ConnectionSpec, ConnectivityStatus, CorrelationId, ExternalMessage,
        OutboundMessage, OutboundSignal, SourceSpec, TargetSpec,
    };

    // Connections
    pub use crate::connection::{
        CommandReply, ConnectionActor, ConnectionCommand, ConnectionHandle, DriverEvents, ProtocolDriver,
        Publisher,
    };

    // Delivery
    pub use crate::ack::{Acknowledgement, CollectedOutcome, DeliveryOutcome};
    pub use crate::dispatch::{ForwardedSignal, InboundIntake, MessageMapper, Settlement};

    // Configuration
    pub use crate::config::ConnectivityConfig;

    // Error types
    pub use crate::{Error, Result};
}
