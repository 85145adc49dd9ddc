//! Prometheus metrics for one managed connection
//!
//! Each connection owns its own registry so `ResetConnectionMetrics` can
//! zero it without touching any other connection. The connection id is
//! attached to every series as a constant label.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use prometheus::{Encoder, IntCounter, IntGauge, Opts, Registry, TextEncoder};
use serde::Serialize;
use tracing::info;

use crate::core::types::ConnectionId;

/// Point-in-time view answering `RetrieveConnectionMetrics`
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct MetricsSnapshot {
    pub connection_id: ConnectionId,
    pub inbound_consumed: u64,
    pub inbound_settled: u64,
    pub inbound_rejected_redeliver: u64,
    pub inbound_rejected_drop: u64,
    pub inbound_dropped_backpressure: u64,
    pub inbound_throttled: u64,
    pub outbound_published: u64,
    pub outbound_failed: u64,
    pub acknowledgements_issued: u64,
    pub reconnect_attempts: u64,
    pub in_flight_collectors: i64,
    pub connected: bool,
    /// Last `ResetConnectionMetrics`, or creation time
    pub since: DateTime<Utc>,
}

/// Counters and gauges of one connection
pub struct ConnectionMetrics {
    connection_id: ConnectionId,
    registry: Registry,
    since: Mutex<DateTime<Utc>>,

    /// Inbound messages handed to the pipeline
    pub inbound_consumed: IntCounter,
    /// Inbound messages settled at the source
    pub inbound_settled: IntCounter,
    /// Inbound messages rejected for redelivery
    pub inbound_rejected_redeliver: IntCounter,
    /// Inbound messages rejected without redelivery
    pub inbound_rejected_drop: IntCounter,
    /// Inbound messages refused because the intake buffer was full
    pub inbound_dropped_backpressure: IntCounter,
    /// Inbound messages that had to wait for the throttle
    pub inbound_throttled: IntCounter,
    pub outbound_published: IntCounter,
    pub outbound_failed: IntCounter,
    /// Acknowledgements produced by publish correlation
    pub acknowledgements_issued: IntCounter,
    pub reconnect_attempts: IntCounter,
    /// Collectors waiting for acknowledgements
    pub in_flight_collectors: IntGauge,
    /// 1 while connected, 0 otherwise
    pub connected: IntGauge,
}

impl ConnectionMetrics {
    pub fn new(connection_id: &ConnectionId) -> Result<Self, prometheus::Error> {
        let registry = Registry::new();
        let opts = |name: &str, help: &str| {
            Opts::new(name, help)
                .namespace("conduit")
                .const_label("connection_id", connection_id.as_str())
        };

        let counter = |name: &str, help: &str| -> Result<IntCounter, prometheus::Error> {
            let counter = IntCounter::with_opts(opts(name, help))?;
            registry.register(Box::new(counter.clone()))?;
            Ok(counter)
        };

        let inbound_consumed = counter("inbound_consumed_total", "Inbound messages consumed")?;
        let inbound_settled = counter("inbound_settled_total", "Inbound messages settled")?;
        let inbound_rejected_redeliver = counter(
            "inbound_rejected_redeliver_total",
            "Inbound messages rejected for redelivery",
        )?;
        let inbound_rejected_drop = counter(
            "inbound_rejected_drop_total",
            "Inbound messages rejected without redelivery",
        )?;
        let inbound_dropped_backpressure = counter(
            "inbound_dropped_backpressure_total",
            "Inbound messages refused by a full intake buffer",
        )?;
        let inbound_throttled = counter(
            "inbound_throttled_total",
            "Inbound messages delayed by the intake throttle",
        )?;
        let outbound_published = counter("outbound_published_total", "Outbound messages published")?;
        let outbound_failed = counter("outbound_failed_total", "Outbound publish failures")?;
        let acknowledgements_issued = counter(
            "acknowledgements_issued_total",
            "Acknowledgements issued from publish outcomes",
        )?;
        let reconnect_attempts = counter("reconnect_attempts_total", "Reconnect attempts")?;

        let in_flight_collectors = IntGauge::with_opts(opts(
            "in_flight_collectors",
            "Acknowledgement collectors awaiting a report",
        ))?;
        registry.register(Box::new(in_flight_collectors.clone()))?;

        let connected = IntGauge::with_opts(opts(
            "connected",
            "Connection status (1 = connected, 0 = not connected)",
        ))?;
        registry.register(Box::new(connected.clone()))?;

        info!(connection_id = %connection_id, "Connection metrics initialized");

        Ok(Self {
            connection_id: connection_id.clone(),
            registry,
            since: Mutex::new(Utc::now()),
            inbound_consumed,
            inbound_settled,
            inbound_rejected_redeliver,
            inbound_rejected_drop,
            inbound_dropped_backpressure,
            inbound_throttled,
            outbound_published,
            outbound_failed,
            acknowledgements_issued,
            reconnect_attempts,
            in_flight_collectors,
            connected,
        })
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            connection_id: self.connection_id.clone(),
            inbound_consumed: self.inbound_consumed.get(),
            inbound_settled: self.inbound_settled.get(),
            inbound_rejected_redeliver: self.inbound_rejected_redeliver.get(),
            inbound_rejected_drop: self.inbound_rejected_drop.get(),
            inbound_dropped_backpressure: self.inbound_dropped_backpressure.get(),
            inbound_throttled: self.inbound_throttled.get(),
            outbound_published: self.outbound_published.get(),
            outbound_failed: self.outbound_failed.get(),
            acknowledgements_issued: self.acknowledgements_issued.get(),
            reconnect_attempts: self.reconnect_attempts.get(),
            in_flight_collectors: self.in_flight_collectors.get(),
            connected: self.connected.get() == 1,
            since: *self.since.lock(),
        }
    }

    /// Zero every counter; live gauges keep their value
    pub fn reset(&self) {
        for counter in [
            &self.inbound_consumed,
            &self.inbound_settled,
            &self.inbound_rejected_redeliver,
            &self.inbound_rejected_drop,
            &self.inbound_dropped_backpressure,
            &self.inbound_throttled,
            &self.outbound_published,
            &self.outbound_failed,
            &self.acknowledgements_issued,
            &self.reconnect_attempts,
        ] {
            counter.reset();
        }
        *self.since.lock() = Utc::now();
        info!(connection_id = %self.connection_id, "Connection metrics reset");
    }

    /// Prometheus text exposition of this connection's registry
    pub fn gather_text(&self) -> Result<String> {
        let encoder = TextEncoder::new();
        let metric_families = self.registry.gather();

        let mut buffer = Vec::new();
        encoder
            .encode(&metric_families, &mut buffer)
            .context("Failed to encode metrics")?;

        String::from_utf8(buffer).context("Invalid UTF-8 in metrics")
    }
}
