//! Test helper utilities for creating test data
//!
//! Provides convenient builders and fakes for:
//! - Connection specs and configs with millisecond timings
//! - Message mapping driven by headers
//! - Recording settlements and publishers

use crate::ack::{Acknowledgement, DeliveryOutcome};
use crate::config::ConnectivityConfig;
use crate::connection::driver::Publisher;
use crate::core::errors::{ProcessingError, PublishError};
use crate::core::message::{
    CorrelationMeta, ExternalMessage, MappedSignal, OutboundMessage, OutboundSignal, CORRELATION_ID_HEADER,
};
use crate::core::types::{AckLabel, ConnectionSpec, SourceSpec, TargetSpec};
use crate::dispatch::{MessageMapper, Settlement};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::BTreeMap;
use tokio::sync::oneshot;

/// Comma-separated acknowledgement labels the mapped signal requests
pub const REQUESTED_ACKS_HEADER: &str = "requested-acks";

/// Status code of a mapping failure; a non-numeric value maps to an unstructured error
pub const MAPPING_ERROR_HEADER: &str = "mapping-error";

/// Number of signals one inbound message maps to (default 1)
pub const FAN_OUT_HEADER: &str = "fan-out";

/// Spec with one source address and one target
pub fn create_test_spec(id: &str) -> ConnectionSpec {
    let mut spec = ConnectionSpec::new(id, "scripted", format!("scripted://{id}"));
    spec.sources.push(SourceSpec {
        addresses: vec![format!("{id}.in")],
        consumer_count: 1,
    });
    spec.targets.push(TargetSpec {
        address: format!("{id}.out"),
        topics: vec!["things.modified".to_string()],
        issued_ack_label: Some(AckLabel::new(format!("{id}-published"))),
    });
    spec
}

/// Config with short lifecycle timings for async tests
pub fn create_fast_config(max_tries: u32) -> ConnectivityConfig {
    let mut config = ConnectivityConfig::default();
    config.client.connecting_min_timeout_ms = 200;
    config.client.connecting_max_timeout_ms = 800;
    config.client.min_backoff_ms = 20;
    config.client.max_backoff_ms = 80;
    config.client.max_tries = max_tries;
    config.client.disconnect_timeout_ms = 200;
    config.client.disconnect_announce_timeout_ms = 400;
    config.client.testing_timeout_ms = 200;
    config.client.status_poll_timeout_ms = 100;
    config.client.command_timeout_ms = 5_000;
    config.acknowledgement.collector_lifetime_ms = 1_000;
    config.acknowledgement.publish_timeout_ms = 500;
    config
}

/// Mapper steered by message headers
///
/// The payload is parsed as JSON (falling back to a string) and echoed as a
/// single `echo` signal, unless the headers ask for a mapping error or a
/// fan-out.
#[derive(Debug, Clone, Copy, Default)]
pub struct EchoMapper;

impl MessageMapper for EchoMapper {
    fn map_inbound(
        &self,
        message: &ExternalMessage,
        meta: &CorrelationMeta,
    ) -> Vec<Result<MappedSignal, ProcessingError>> {
        if let Some(status) = message.header(MAPPING_ERROR_HEADER) {
            let err = match status.parse::<u16>() {
                Ok(status) => ProcessingError::with_status(status, "mapping failed"),
                Err(_) => ProcessingError::unstructured(format!("mapping failed: {status}")),
            };
            return vec![Err(err)];
        }

        let payload = serde_json::from_slice(&message.payload)
            .unwrap_or_else(|_| serde_json::Value::String(String::from_utf8_lossy(&message.payload).into_owned()));
        let requested_acks: Vec<AckLabel> = message
            .header(REQUESTED_ACKS_HEADER)
            .map(|labels| {
                labels
                    .split(',')
                    .map(str::trim)
                    .filter(|label| !label.is_empty())
                    .map(AckLabel::new)
                    .collect()
            })
            .unwrap_or_default();
        let fan_out = message
            .header(FAN_OUT_HEADER)
            .and_then(|n| n.parse::<usize>().ok())
            .unwrap_or(1);

        (0..fan_out)
            .map(|_| {
                Ok(MappedSignal {
                    correlation_id: meta.correlation_id.clone(),
                    name: "echo".to_string(),
                    payload: payload.clone(),
                    requested_acks: requested_acks.clone(),
                })
            })
            .collect()
    }

    fn map_outbound(&self, signal: &OutboundSignal, targets: &[TargetSpec]) -> Vec<OutboundMessage> {
        let payload = serde_json::to_vec(&signal.payload).unwrap_or_default();

        targets
            .iter()
            .map(|target| {
                let mut headers = BTreeMap::new();
                headers.insert(CORRELATION_ID_HEADER.to_string(), signal.correlation_id.to_string());
                headers.insert("signal".to_string(), signal.name.clone());
                OutboundMessage {
                    correlation_id: signal.correlation_id.clone(),
                    target: target.clone(),
                    headers,
                    payload: payload.clone(),
                }
            })
            .collect()
    }
}

/// Settlement that reports the outcome it received
pub struct RecordingSettlement {
    tx: oneshot::Sender<DeliveryOutcome>,
}

impl RecordingSettlement {
    #[allow(clippy::new_ret_no_self)]
    pub fn new() -> (Box<dyn Settlement>, oneshot::Receiver<DeliveryOutcome>) {
        let (tx, rx) = oneshot::channel();
        (Box::new(Self { tx }), rx)
    }
}

impl Settlement for RecordingSettlement {
    fn settle(self: Box<Self>) {
        let _ = self.tx.send(DeliveryOutcome::Settle);
    }

    fn reject(self: Box<Self>, redeliver: bool) {
        let _ = self.tx.send(DeliveryOutcome::Reject { redeliver });
    }
}

#[derive(Debug, Clone)]
enum PublishBehavior {
    Acknowledge(u16),
    Silent,
    Fail { status: Option<u16> },
    Hang,
}

/// Publisher that records every message
#[derive(Debug)]
pub struct RecordingPublisher {
    behavior: PublishBehavior,
    published: Mutex<Vec<OutboundMessage>>,
}

impl Default for RecordingPublisher {
    fn default() -> Self {
        Self::acknowledging(200)
    }
}

impl RecordingPublisher {
    /// Every publish produces an acknowledgement with `status`
    pub fn acknowledging(status: u16) -> Self {
        Self {
            behavior: PublishBehavior::Acknowledge(status),
            published: Mutex::new(Vec::new()),
        }
    }

    /// Publishes succeed without an acknowledgement
    pub fn silent() -> Self {
        Self {
            behavior: PublishBehavior::Silent,
            published: Mutex::new(Vec::new()),
        }
    }

    pub fn failing(status: Option<u16>) -> Self {
        Self {
            behavior: PublishBehavior::Fail { status },
            published: Mutex::new(Vec::new()),
        }
    }

    /// Publishes never complete
    pub fn hanging() -> Self {
        Self {
            behavior: PublishBehavior::Hang,
            published: Mutex::new(Vec::new()),
        }
    }

    pub fn published(&self) -> Vec<OutboundMessage> {
        self.published.lock().clone()
    }
}

#[async_trait]
impl Publisher for RecordingPublisher {
    async fn publish(&self, message: OutboundMessage) -> Result<Option<Acknowledgement>, PublishError> {
        self.published.lock().push(message.clone());

        match self.behavior {
            PublishBehavior::Acknowledge(status) => {
                Ok(Some(Acknowledgement::new(None, message.correlation_id, status)))
            }
            PublishBehavior::Silent => Ok(None),
            PublishBehavior::Fail { status } => Err(PublishError::new(&message.target, status, "broker refused")),
            PublishBehavior::Hang => std::future::pending().await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::CorrelationId;

    fn meta() -> CorrelationMeta {
        CorrelationMeta {
            correlation_id: CorrelationId::new("c-1"),
            source_address: "orders.in".into(),
        }
    }

    #[test]
    fn test_echo_mapper_reads_requested_acks() {
        let message = ExternalMessage::new("orders.in", br#"{"n":1}"#.to_vec())
            .with_header(REQUESTED_ACKS_HEADER, "stored, indexed");
        let mapped = EchoMapper.map_inbound(&message, &meta());

        assert_eq!(mapped.len(), 1);
        let signal = mapped[0].as_ref().unwrap();
        assert_eq!(signal.requested_acks, vec![AckLabel::new("stored"), AckLabel::new("indexed")]);
        assert_eq!(signal.payload, serde_json::json!({ "n": 1 }));
    }

    #[test]
    fn test_echo_mapper_errors_and_fan_out() {
        let failing = ExternalMessage::new("orders.in", b"x".to_vec()).with_header(MAPPING_ERROR_HEADER, "400");
        let mapped = EchoMapper.map_inbound(&failing, &meta());
        assert_eq!(mapped[0].as_ref().unwrap_err().status, Some(400));

        let fanned = ExternalMessage::new("orders.in", b"x".to_vec()).with_header(FAN_OUT_HEADER, "3");
        assert_eq!(EchoMapper.map_inbound(&fanned, &meta()).len(), 3);
    }

    #[tokio::test]
    async fn test_recording_settlement_reports_outcome() {
        let (settlement, outcome) = RecordingSettlement::new();
        settlement.reject(false);
        assert_eq!(outcome.await.unwrap(), DeliveryOutcome::Reject { redeliver: false });
    }
}
