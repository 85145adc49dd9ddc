//! Per-connection observability
//!
//! Prometheus counters answering `RetrieveConnectionMetrics`, and the
//! operator-facing connection log buffer behind the logging commands.

pub mod connection_logs;
pub mod metrics;

pub use connection_logs::{ConnectionLogger, ConnectionLogs, LogCategory, LogEntry, LogLevel};
pub use metrics::{ConnectionMetrics, MetricsSnapshot};
