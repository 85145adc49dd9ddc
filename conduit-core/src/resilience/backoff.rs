//! Reconnect timeout/backoff strategy
//!
//! Each failure episode alternates between a *backoff* (how long to wait
//! before the next connect attempt) and a *timeout* (how long that attempt
//! may take). Both double per step up to their maxima.
//!
//! ```text
//! failure ──► next_backoff()  ──► wait ──► next_timeout() ──► connect
//!    ▲                                                          │
//!    └──────────────────────────── failure ◄────────────────────┘
//! ```
//!
//! A quiet period longer than `2 * (max_timeout + max_backoff)` since the
//! last timeout increase means the previous outage healed; the next
//! `next_timeout()` starts over from the minima instead of punishing the
//! connection for an old failure.

use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};

/// Bounds for the reconnect strategy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackoffConfig {
    pub min_timeout: Duration,
    pub max_timeout: Duration,
    pub min_backoff: Duration,
    pub max_backoff: Duration,
    /// Connect attempts allowed per episode
    pub max_tries: u32,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            min_timeout: Duration::from_secs(10),
            max_timeout: Duration::from_secs(60),
            min_backoff: Duration::from_secs(1),
            max_backoff: Duration::from_secs(60),
            max_tries: 50,
        }
    }
}

impl BackoffConfig {
    /// Short bounds for tests and local experiments
    pub fn aggressive() -> Self {
        Self {
            min_timeout: Duration::from_millis(100),
            max_timeout: Duration::from_secs(1),
            min_backoff: Duration::from_millis(10),
            max_backoff: Duration::from_millis(500),
            max_tries: 5,
        }
    }

    /// Window of silence after which the episode counts as healed
    pub fn recovery_window(&self) -> Duration {
        (self.max_timeout + self.max_backoff) * 2
    }
}

/// Reconnect timeout and backoff state machine
#[derive(Debug, Clone)]
pub struct ReconnectBackoffStrategy {
    config: BackoffConfig,
    current_timeout: Duration,
    current_backoff: Duration,
    tries_used: u32,
    last_increase_at: Option<Instant>,
}

impl ReconnectBackoffStrategy {
    pub fn new(config: BackoffConfig) -> Self {
        Self {
            current_timeout: config.min_timeout,
            current_backoff: config.min_backoff,
            tries_used: 0,
            last_increase_at: None,
            config,
        }
    }

    /// Timeout for the next connect attempt; consumes one try
    pub fn next_timeout(&mut self) -> Duration {
        self.next_timeout_at(Instant::now())
    }

    /// Same as [`next_timeout`](Self::next_timeout) with an explicit clock
    pub fn next_timeout_at(&mut self, now: Instant) -> Duration {
        if let Some(last) = self.last_increase_at {
            if now.saturating_duration_since(last) > self.config.recovery_window() {
                self.reset();
            }
        }

        let timeout = self.current_timeout;
        self.current_timeout = std::cmp::min(self.config.max_timeout, self.current_timeout * 2);
        self.tries_used = self.tries_used.saturating_add(1);
        self.last_increase_at = Some(now);
        timeout
    }

    /// Wait before the next connect attempt.
    ///
    /// Always follows a timeout in the same episode, so no recovery check.
    pub fn next_backoff(&mut self) -> Duration {
        let backoff = self.current_backoff;
        self.current_backoff = std::cmp::min(self.config.max_backoff, self.current_backoff * 2);
        backoff
    }

    pub fn can_reconnect(&self) -> bool {
        self.tries_used < self.config.max_tries
    }

    /// Back to the minima with no tries used
    pub fn reset(&mut self) {
        self.current_timeout = self.config.min_timeout;
        self.current_backoff = self.config.min_backoff;
        self.tries_used = 0;
        self.last_increase_at = None;
    }

    pub fn tries_used(&self) -> u32 {
        self.tries_used
    }

    pub fn current_timeout(&self) -> Duration {
        self.current_timeout
    }

    pub fn current_backoff(&self) -> Duration {
        self.current_backoff
    }

    pub fn config(&self) -> &BackoffConfig {
        &self.config
    }
}

impl Default for ReconnectBackoffStrategy {
    fn default() -> Self {
        Self::new(BackoffConfig::default())
    }
}
