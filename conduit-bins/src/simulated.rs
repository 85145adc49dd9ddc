//! Randomized in-process broker for local runs
//!
//! `SimulatedDriver` fakes one endpoint per connection: connects take a
//! configurable latency and fail at random, established connections drop
//! at random, and every consumer produces JSON telemetry at a fixed rate.
//! `JsonMapper` turns those payloads into signals and back.

use async_trait::async_trait;
use conduit_core::ack::Acknowledgement;
use conduit_core::connection::{ConnectOrigin, DriverEvents, ProtocolDriver, Publisher, ResourceKind, ResourceStatus};
use conduit_core::core::errors::{ProcessingError, PublishError};
use conduit_core::core::message::{CorrelationMeta, MappedSignal, CORRELATION_ID_HEADER};
use conduit_core::core::{AckLabel, ConnectionError, ConnectionSpec, ConnectivityStatus, ExternalMessage};
use conduit_core::core::{OutboundMessage, OutboundSignal, TargetSpec};
use conduit_core::dispatch::{InboundIntake, MessageMapper, Settlement};
use parking_lot::Mutex;
use rand::Rng;
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// True with the given probability
pub fn roll(probability: f64) -> bool {
    rand::thread_rng().gen_bool(probability.clamp(0.0, 1.0))
}

#[derive(Debug, Clone)]
pub struct SimulationConfig {
    pub connect_failure_rate: f64,
    /// Chance per second that an established connection drops
    pub drop_probability: f64,
    pub publish_failure_rate: f64,
    /// Messages produced per consumer and second; 0 disables consumers
    pub messages_per_second: u64,
    pub latency: Duration,
    /// Acknowledgement labels every produced message requests
    pub requested_acks: Vec<String>,
}

impl Default for SimulationConfig {
    fn default() -> Self {
        Self {
            connect_failure_rate: 0.2,
            drop_probability: 0.02,
            publish_failure_rate: 0.05,
            messages_per_second: 5,
            latency: Duration::from_millis(25),
            requested_acks: vec!["stored".to_string()],
        }
    }
}

/// Settlement decisions observed across all simulated sources
#[derive(Debug, Default)]
pub struct SettlementCounters {
    settled: AtomicU64,
    redelivered: AtomicU64,
    dropped: AtomicU64,
}

impl SettlementCounters {
    /// (settled, redelivered, dropped)
    pub fn snapshot(&self) -> (u64, u64, u64) {
        (
            self.settled.load(Ordering::Relaxed),
            self.redelivered.load(Ordering::Relaxed),
            self.dropped.load(Ordering::Relaxed),
        )
    }
}

struct SimulatedSettlement {
    counters: Arc<SettlementCounters>,
}

impl Settlement for SimulatedSettlement {
    fn settle(self: Box<Self>) {
        self.counters.settled.fetch_add(1, Ordering::Relaxed);
    }

    fn reject(self: Box<Self>, redeliver: bool) {
        if redeliver {
            self.counters.redelivered.fetch_add(1, Ordering::Relaxed);
        } else {
            self.counters.dropped.fetch_add(1, Ordering::Relaxed);
        }
    }
}

#[derive(Default)]
struct Running {
    link: Option<JoinHandle<()>>,
    consumers: Vec<(String, JoinHandle<()>)>,
}

/// Driver for one simulated connection
pub struct SimulatedDriver {
    config: SimulationConfig,
    counters: Arc<SettlementCounters>,
    running: Mutex<Running>,
}

impl SimulatedDriver {
    pub fn new(config: SimulationConfig, counters: Arc<SettlementCounters>) -> Self {
        Self {
            config,
            counters,
            running: Mutex::new(Running::default()),
        }
    }

    fn produce(&self, address: String, intake: InboundIntake) -> JoinHandle<()> {
        let period = Duration::from_millis(1000 / self.config.messages_per_second.max(1));
        let acks = self.config.requested_acks.clone();
        let counters = self.counters.clone();

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            let mut sequence: u64 = 0;
            loop {
                ticker.tick().await;
                sequence += 1;

                let reading: f64 = rand::thread_rng().gen_range(-20.0..40.0);
                let payload = json!({
                    "signal": "telemetry.reading",
                    "acks": acks,
                    "value": { "address": address, "sequence": sequence, "celsius": reading },
                });
                let message = ExternalMessage::new(address.clone(), payload.to_string().into_bytes());
                let settlement = Box::new(SimulatedSettlement {
                    counters: counters.clone(),
                });

                if !intake.offer(message, settlement) && intake.is_closed() {
                    debug!(address = %address, "Intake closed, consumer stopping");
                    return;
                }
            }
        })
    }
}

#[async_trait]
impl ProtocolDriver for SimulatedDriver {
    fn connect(
        &self,
        spec: &ConnectionSpec,
        origin: ConnectOrigin,
        events: DriverEvents,
    ) -> Result<(), ConnectionError> {
        if spec.uri.is_empty() {
            return Err(ConnectionError::Configuration("uri must not be empty".to_string()));
        }
        debug!(connection_id = %spec.id, ?origin, "Simulated connect");

        let config = self.config.clone();
        let link = tokio::spawn(async move {
            tokio::time::sleep(config.latency).await;
            if roll(config.connect_failure_rate) {
                events.failure(ConnectionError::Transient("simulated connection refused".to_string()));
                return;
            }
            events.connected();

            let mut ticker = tokio::time::interval(Duration::from_secs(1));
            ticker.tick().await;
            loop {
                ticker.tick().await;
                if roll(config.drop_probability) {
                    warn!(connection_id = %events.connection_id(), "Simulated connection drop");
                    events.failure(ConnectionError::Transient("simulated connection drop".to_string()));
                    return;
                }
            }
        });

        if let Some(previous) = self.running.lock().link.replace(link) {
            previous.abort();
        }
        Ok(())
    }

    fn disconnect(
        &self,
        spec: &ConnectionSpec,
        shutdown: bool,
        events: DriverEvents,
    ) -> Result<(), ConnectionError> {
        debug!(connection_id = %spec.id, shutdown, "Simulated disconnect");
        if let Some(link) = self.running.lock().link.take() {
            link.abort();
        }

        let latency = self.config.latency;
        tokio::spawn(async move {
            tokio::time::sleep(latency).await;
            events.disconnected();
        });
        Ok(())
    }

    async fn test(&self, spec: &ConnectionSpec) -> Result<String, ConnectionError> {
        tokio::time::sleep(self.config.latency).await;
        if spec.uri.is_empty() {
            return Err(ConnectionError::Configuration("uri must not be empty".to_string()));
        }
        if roll(self.config.connect_failure_rate) {
            return Err(ConnectionError::Transient("simulated endpoint unreachable".to_string()));
        }
        Ok(format!("simulated endpoint {} reachable", spec.uri))
    }

    async fn start_publisher(&self, _spec: &ConnectionSpec) -> Result<Arc<dyn Publisher>, ConnectionError> {
        Ok(Arc::new(SimulatedPublisher {
            failure_rate: self.config.publish_failure_rate,
            latency: self.config.latency,
        }))
    }

    async fn start_consumers(&self, spec: &ConnectionSpec, intake: InboundIntake) -> Result<(), ConnectionError> {
        if self.config.messages_per_second == 0 {
            return Ok(());
        }

        let consumers: Vec<_> = spec
            .consumer_addresses()
            .map(|address| (address.to_string(), self.produce(address.to_string(), intake.clone())))
            .collect();
        info!(connection_id = %spec.id, consumers = consumers.len(), "Simulated consumers started");

        let mut running = self.running.lock();
        for (_, previous) in running.consumers.drain(..) {
            previous.abort();
        }
        running.consumers = consumers;
        Ok(())
    }

    fn cleanup_resources(&self, spec: &ConnectionSpec) {
        let mut running = self.running.lock();
        for (_, consumer) in running.consumers.drain(..) {
            consumer.abort();
        }
        debug!(connection_id = %spec.id, "Simulated resources released");
    }

    async fn announce_close(
        &self,
        spec: &ConnectionSpec,
        publisher: Option<Arc<dyn Publisher>>,
    ) -> Result<(), ConnectionError> {
        info!(connection_id = %spec.id, has_publisher = publisher.is_some(), "Announcing close");
        Ok(())
    }

    async fn resource_status(&self, _spec: &ConnectionSpec) -> Vec<ResourceStatus> {
        let running = self.running.lock();
        let mut resources = Vec::with_capacity(running.consumers.len() + 1);

        let link_open = running.link.as_ref().is_some_and(|link| !link.is_finished());
        resources.push(ResourceStatus::new(
            ResourceKind::Client,
            None,
            if link_open { ConnectivityStatus::Open } else { ConnectivityStatus::Closed },
            if link_open { "link up" } else { "link down" },
        ));

        for (address, consumer) in &running.consumers {
            let (status, detail) = if consumer.is_finished() {
                (ConnectivityStatus::Failed, "consumer stopped")
            } else {
                (ConnectivityStatus::Open, "consuming")
            };
            resources.push(ResourceStatus::new(ResourceKind::Source, Some(address.clone()), status, detail));
        }
        resources
    }
}

/// Publisher that acknowledges after a short latency or fails at random
struct SimulatedPublisher {
    failure_rate: f64,
    latency: Duration,
}

#[async_trait]
impl Publisher for SimulatedPublisher {
    async fn publish(&self, message: OutboundMessage) -> Result<Option<Acknowledgement>, PublishError> {
        tokio::time::sleep(self.latency).await;
        if roll(self.failure_rate) {
            return Err(PublishError::new(&message.target, Some(503), "simulated broker unavailable"));
        }
        Ok(Some(Acknowledgement::new(None, message.correlation_id, 200)))
    }
}

/// Maps `{"signal": .., "acks": [..], "value": ..}` payloads
#[derive(Debug, Default, Clone, Copy)]
pub struct JsonMapper;

impl MessageMapper for JsonMapper {
    fn map_inbound(
        &self,
        message: &ExternalMessage,
        meta: &CorrelationMeta,
    ) -> Vec<Result<MappedSignal, ProcessingError>> {
        let document: Value = match serde_json::from_slice(&message.payload) {
            Ok(document) => document,
            Err(e) => return vec![Err(ProcessingError::with_status(400, format!("payload is not JSON: {e}")))],
        };

        let Some(name) = document.get("signal").and_then(Value::as_str) else {
            return vec![Err(ProcessingError::with_status(400, "payload has no signal name"))];
        };

        let requested_acks = document
            .get("acks")
            .and_then(Value::as_array)
            .map(|labels| labels.iter().filter_map(Value::as_str).map(AckLabel::new).collect())
            .unwrap_or_default();

        vec![Ok(MappedSignal {
            correlation_id: meta.correlation_id.clone(),
            name: name.to_string(),
            payload: document.get("value").cloned().unwrap_or(Value::Null),
            requested_acks,
        })]
    }

    fn map_outbound(&self, signal: &OutboundSignal, targets: &[TargetSpec]) -> Vec<OutboundMessage> {
        let payload = json!({ "signal": signal.name, "value": signal.payload }).to_string().into_bytes();

        targets
            .iter()
            .filter(|target| target.topics.is_empty() || target.topics.iter().any(|topic| *topic == signal.name))
            .map(|target| {
                let mut headers = BTreeMap::new();
                headers.insert(CORRELATION_ID_HEADER.to_string(), signal.correlation_id.to_string());
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

#[cfg(test)]
mod tests {
    use super::*;
    use conduit_core::core::CorrelationId;

    fn meta() -> CorrelationMeta {
        CorrelationMeta {
            correlation_id: CorrelationId::new("sim-1"),
            source_address: "telemetry".to_string(),
        }
    }

    #[test]
    fn test_maps_signal_with_acks() {
        let payload = json!({ "signal": "telemetry.reading", "acks": ["stored", "indexed"], "value": 21.5 });
        let message = ExternalMessage::new("telemetry", payload.to_string().into_bytes());

        let mapped = JsonMapper.map_inbound(&message, &meta());
        let signal = mapped[0].as_ref().unwrap();
        assert_eq!(signal.name, "telemetry.reading");
        assert_eq!(signal.requested_acks, vec![AckLabel::new("stored"), AckLabel::new("indexed")]);
        assert_eq!(signal.payload, json!(21.5));
        assert_eq!(signal.correlation_id, CorrelationId::new("sim-1"));
    }

    #[test]
    fn test_invalid_payload_is_client_error() {
        let message = ExternalMessage::new("telemetry", b"not json".to_vec());
        let mapped = JsonMapper.map_inbound(&message, &meta());
        assert_eq!(mapped[0].as_ref().unwrap_err().status, Some(400));

        let unnamed = ExternalMessage::new("telemetry", b"{}".to_vec());
        assert_eq!(JsonMapper.map_inbound(&unnamed, &meta())[0].as_ref().unwrap_err().status, Some(400));
    }

    #[test]
    fn test_outbound_respects_topics() {
        let targets = vec![
            TargetSpec {
                address: "all".to_string(),
                topics: vec![],
                issued_ack_label: None,
            },
            TargetSpec {
                address: "alarms".to_string(),
                topics: vec!["alarm.raised".to_string()],
                issued_ack_label: None,
            },
        ];
        let signal = OutboundSignal::new("telemetry.summary", json!({ "count": 3 }));

        let messages = JsonMapper.map_outbound(&signal, &targets);
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].target.address, "all");
        assert_eq!(
            messages[0].headers.get(CORRELATION_ID_HEADER).map(String::as_str),
            Some(signal.correlation_id.as_str())
        );
    }

    #[test]
    fn test_settlement_counters() {
        let counters = Arc::new(SettlementCounters::default());
        let settle: Box<dyn Settlement> = Box::new(SimulatedSettlement {
            counters: counters.clone(),
        });
        let redeliver: Box<dyn Settlement> = Box::new(SimulatedSettlement {
            counters: counters.clone(),
        });
        let drop: Box<dyn Settlement> = Box::new(SimulatedSettlement {
            counters: counters.clone(),
        });

        settle.settle();
        redeliver.reject(true);
        drop.reject(false);
        assert_eq!(counters.snapshot(), (1, 1, 1));
    }

    #[test]
    fn test_roll_extremes() {
        assert!(!roll(0.0));
        assert!(roll(1.0));
    }
}
