//! Resilience patterns for managed connections
//!
//! - Reconnect timeout/backoff strategy with recovery after quiet periods
//! - Explicit supervision table for connection children

pub mod backoff;
pub mod supervision;

pub use backoff::{BackoffConfig, ReconnectBackoffStrategy};
pub use supervision::{decide as supervise, ChildKind, SupervisorDirective};
