//! Inbound intake throttle - token bucket
//!
//! Bounds intake throughput to the external endpoint's configured rate,
//! independent of how full the intake buffer is. Every message costs one
//! token.
//!
//! ```text
//! Rate: 50 msg/s → bucket of 50 tokens, 5 tokens back every 100ms
//!
//! t=0ms    [██████████] 50 → burst of 50 dispatched
//! t=100ms  [█░░░░░░░░░]  5 → next 5 dispatched, the rest wait
//! ```

use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::debug;

/// Fixed-point scale of the token counter
const SCALE: u64 = 1000;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ThrottleConfig {
    /// Tokens in a full bucket
    pub burst_capacity: u64,
    /// Tokens added per refill interval (fractional)
    pub refill_rate: f64,
    pub refill_interval: Duration,
}

impl ThrottleConfig {
    /// Sustained `rate` messages per second with a one-second burst
    pub fn per_second(rate: u64) -> Self {
        let rate = rate.max(1);
        Self {
            burst_capacity: rate,
            refill_rate: rate as f64 / 10.0,
            refill_interval: Duration::from_millis(100),
        }
    }
}

/// Token bucket shared by the intake worker
#[derive(Clone)]
pub struct IntakeThrottle {
    config: ThrottleConfig,
    /// Current tokens available (fixed-point: tokens * 1000)
    tokens: Arc<AtomicU64>,
    last_refill: Arc<Mutex<Instant>>,
    total_allowed: Arc<AtomicU64>,
    total_delayed: Arc<AtomicU64>,
}

impl IntakeThrottle {
    pub fn new(config: ThrottleConfig) -> Self {
        Self {
            config,
            tokens: Arc::new(AtomicU64::new(config.burst_capacity * SCALE)),
            last_refill: Arc::new(Mutex::new(Instant::now())),
            total_allowed: Arc::new(AtomicU64::new(0)),
            total_delayed: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn per_second(rate: u64) -> Self {
        Self::new(ThrottleConfig::per_second(rate))
    }

    /// Take one token if available
    pub fn try_acquire(&self) -> bool {
        self.refill();

        let mut current = self.tokens.load(Ordering::Acquire);
        loop {
            if current < SCALE {
                return false;
            }
            match self.tokens.compare_exchange_weak(
                current,
                current - SCALE,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => {
                    self.total_allowed.fetch_add(1, Ordering::Relaxed);
                    return true;
                }
                Err(actual) => current = actual,
            }
        }
    }

    /// Wait for a token; returns true if the caller had to wait
    pub async fn acquire(&self) -> bool {
        if self.try_acquire() {
            return false;
        }

        self.total_delayed.fetch_add(1, Ordering::Relaxed);
        loop {
            tokio::time::sleep(self.config.refill_interval).await;
            if self.try_acquire() {
                return true;
            }
        }
    }

    pub fn total_allowed(&self) -> u64 {
        self.total_allowed.load(Ordering::Relaxed)
    }

    pub fn total_delayed(&self) -> u64 {
        self.total_delayed.load(Ordering::Relaxed)
    }

    fn refill(&self) {
        let mut last_refill = self.last_refill.lock();
        let now = Instant::now();
        let elapsed = now.duration_since(*last_refill);

        if elapsed < self.config.refill_interval {
            return;
        }

        let intervals = elapsed.as_secs_f64() / self.config.refill_interval.as_secs_f64();
        let to_add = (self.config.refill_rate * intervals * SCALE as f64) as u64;

        if to_add > 0 {
            let max_tokens = self.config.burst_capacity * SCALE;
            let current = self.tokens.load(Ordering::Acquire);
            let refilled = (current + to_add).min(max_tokens);

            self.tokens.store(refilled, Ordering::Release);
            *last_refill = now;

            debug!(
                "Intake throttle refilled: +{} tokens (now: {}/{})",
                to_add / SCALE,
                refilled / SCALE,
                max_tokens / SCALE
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_per_second_config() {
        let config = ThrottleConfig::per_second(50);
        assert_eq!(config.burst_capacity, 50);
        assert!((config.refill_rate - 5.0).abs() < f64::EPSILON);

        let config = ThrottleConfig::per_second(0);
        assert_eq!(config.burst_capacity, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_burst_then_exhausted() {
        let throttle = IntakeThrottle::per_second(3);
        assert!(throttle.try_acquire());
        assert!(throttle.try_acquire());
        assert!(throttle.try_acquire());
        assert!(!throttle.try_acquire());
        assert_eq!(throttle.total_allowed(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_acquire_waits_for_refill() {
        let throttle = IntakeThrottle::per_second(10);
        for _ in 0..10 {
            assert!(!throttle.acquire().await);
        }

        let started = Instant::now();
        assert!(throttle.acquire().await);
        assert!(started.elapsed() >= Duration::from_millis(100));
        assert_eq!(throttle.total_delayed(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_refill_capped_at_burst() {
        let throttle = IntakeThrottle::per_second(2);
        tokio::time::advance(Duration::from_secs(10)).await;

        assert!(throttle.try_acquire());
        assert!(throttle.try_acquire());
        assert!(!throttle.try_acquire());
    }
}
