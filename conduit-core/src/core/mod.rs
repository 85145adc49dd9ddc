//! Core data model for managed connections
//!
//! - `types`: identifiers, status enums, declarative connection spec
//! - `errors`: failure taxonomy and the public failure reply
//! - `message`: shapes exchanged with drivers and the mapping pipeline
//! - `session`: replace-not-mutate session owned by the state machine

pub mod errors;
pub mod message;
pub mod session;
pub mod types;

// Re-export commonly used types
pub use errors::{
    CommandFailure, ConnectionError, FailureKind, ProcessingError, PublishError,
};
pub use message::{
    CorrelationMeta, ExternalMessage, MappedSignal, OutboundMessage, OutboundSignal,
    CORRELATION_ID_HEADER,
};
pub use session::{ConnectionSession, PendingRequest, SessionSnapshot, TunnelState};
pub use types::{
    AckLabel, ConnectionId, ConnectionSpec, ConnectivityStatus, CorrelationId, DesiredStatus,
    RecoveryStatus, SourceSpec, TargetSpec, TunnelSpec,
};
