//! Operator-facing connection logs
//!
//! A bounded ring buffer per connection, separate from `tracing` output.
//! Logging is switched on for a limited duration by `EnableConnectionLogs`;
//! while it is off only failures are recorded.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::VecDeque;
use std::time::Duration;

use crate::core::types::ConnectionId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Success,
    Info,
    Failure,
}

/// Part of the connection an entry is about
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LogCategory {
    Connection,
    Source,
    Target,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LogEntry {
    pub timestamp: DateTime<Utc>,
    pub level: LogLevel,
    pub category: LogCategory,
    pub address: Option<String>,
    pub message: String,
}

/// Answer to `RetrieveConnectionLogs`
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ConnectionLogs {
    pub connection_id: ConnectionId,
    pub enabled_since: Option<DateTime<Utc>>,
    pub enabled_until: Option<DateTime<Utc>>,
    pub entries: Vec<LogEntry>,
}

struct LogBuffer {
    entries: VecDeque<LogEntry>,
    enabled_since: Option<DateTime<Utc>>,
    enabled_until: Option<DateTime<Utc>>,
}

pub struct ConnectionLogger {
    connection_id: ConnectionId,
    capacity: usize,
    enable_duration: Duration,
    inner: Mutex<LogBuffer>,
}

impl ConnectionLogger {
    pub fn new(connection_id: ConnectionId, capacity: usize, enable_duration: Duration) -> Self {
        Self {
            connection_id,
            capacity: capacity.max(1),
            enable_duration,
            inner: Mutex::new(LogBuffer {
                entries: VecDeque::with_capacity(capacity.max(1)),
                enabled_since: None,
                enabled_until: None,
            }),
        }
    }

    /// Enable full logging for the configured duration
    pub fn enable(&self) {
        let now = Utc::now();
        let until = ChronoDuration::from_std(self.enable_duration)
            .ok()
            .and_then(|d| now.checked_add_signed(d));

        let mut inner = self.inner.lock();
        inner.enabled_since = Some(now);
        inner.enabled_until = until;
    }

    pub fn is_enabled(&self) -> bool {
        let inner = self.inner.lock();
        Self::enabled_at(&inner, Utc::now())
    }

    fn enabled_at(inner: &LogBuffer, now: DateTime<Utc>) -> bool {
        match (inner.enabled_since, inner.enabled_until) {
            (Some(_), Some(until)) => now < until,
            (Some(_), None) => true,
            _ => false,
        }
    }

    pub fn success(&self, category: LogCategory, address: Option<&str>, message: impl Into<String>) {
        self.record(LogLevel::Success, category, address, message.into());
    }

    pub fn info(&self, category: LogCategory, address: Option<&str>, message: impl Into<String>) {
        self.record(LogLevel::Info, category, address, message.into());
    }

    /// Recorded even while logging is disabled
    pub fn failure(&self, category: LogCategory, address: Option<&str>, message: impl Into<String>) {
        self.record(LogLevel::Failure, category, address, message.into());
    }

    fn record(&self, level: LogLevel, category: LogCategory, address: Option<&str>, message: String) {
        let now = Utc::now();
        let mut inner = self.inner.lock();
        if level != LogLevel::Failure && !Self::enabled_at(&inner, now) {
            return;
        }

        if inner.entries.len() == self.capacity {
            inner.entries.pop_front();
        }
        inner.entries.push_back(LogEntry {
            timestamp: now,
            level,
            category,
            address: address.map(str::to_string),
            message,
        });
    }

    pub fn retrieve(&self) -> ConnectionLogs {
        let inner = self.inner.lock();
        ConnectionLogs {
            connection_id: self.connection_id.clone(),
            enabled_since: inner.enabled_since,
            enabled_until: inner.enabled_until,
            entries: inner.entries.iter().cloned().collect(),
        }
    }

    /// Drop every entry; the enabled window is kept
    pub fn reset(&self) {
        self.inner.lock().entries.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn logger(capacity: usize) -> ConnectionLogger {
        ConnectionLogger::new(ConnectionId::new("orders"), capacity, Duration::from_secs(60))
    }

    #[test]
    fn test_disabled_logger_keeps_failures_only() {
        let logger = logger(10);
        logger.info(LogCategory::Connection, None, "connecting");
        logger.failure(LogCategory::Source, Some("orders.in"), "consumer crashed");

        let logs = logger.retrieve();
        assert_eq!(logs.entries.len(), 1);
        assert_eq!(logs.entries[0].level, LogLevel::Failure);
        assert_eq!(logs.entries[0].address.as_deref(), Some("orders.in"));
        assert!(logs.enabled_since.is_none());
    }

    #[test]
    fn test_enabled_logger_records_everything() {
        let logger = logger(10);
        logger.enable();
        assert!(logger.is_enabled());

        logger.info(LogCategory::Connection, None, "connecting");
        logger.success(LogCategory::Target, Some("events.out"), "published");

        let logs = logger.retrieve();
        assert_eq!(logs.entries.len(), 2);
        assert!(logs.enabled_until > logs.enabled_since);
    }

    #[test]
    fn test_capacity_is_bounded() {
        let logger = logger(3);
        for i in 0..5 {
            logger.failure(LogCategory::Connection, None, format!("failure {i}"));
        }

        let messages: Vec<_> = logger.retrieve().entries.into_iter().map(|e| e.message).collect();
        assert_eq!(messages, vec!["failure 2", "failure 3", "failure 4"]);
    }

    #[test]
    fn test_reset_clears_entries() {
        let logger = logger(3);
        logger.failure(LogCategory::Connection, None, "boom");
        logger.reset();
        assert!(logger.retrieve().entries.is_empty());
    }
}
