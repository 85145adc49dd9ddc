//! Dispatch pipeline of one connection
//!
//! Inbound: every consumed message is mapped; each resulting signal that
//! requests acknowledgements gets its own collector, and the message is
//! settled or rejected once every collector has reported. Collectors are
//! keyed by correlation id; a duplicate id still in flight is made unique
//! before the signal is forwarded.
//!
//! Outbound: every signal is mapped to one message per target; each publish
//! is wrapped in a [`PublishCorrelator`] and its acknowledgement goes back
//! to the signal's response channel. A publish that outlives the publish
//! timeout is answered with a 408.

use super::intake::{self, InboundIntake, IntakeWorker};
use super::throttle::IntakeThrottle;
use super::{apply_outcome, ForwardedSignal, InboundMessage, MessageMapper};
use crate::ack::{
    decide, decide_on_error, quota_per_target, Acknowledgement, AcknowledgementCollector,
    CollectedOutcome, CollectorHandle, DeliveryOutcome, PublishCorrelator,
};
use crate::config::ConnectivityConfig;
use crate::connection::driver::Publisher;
use crate::core::errors::{ProcessingError, PublishError};
use crate::core::message::{CorrelationMeta, OutboundSignal};
use crate::core::types::{ConnectionId, ConnectionSpec, CorrelationId, TargetSpec};
use crate::monitoring::connection_logs::{ConnectionLogger, LogCategory};
use crate::monitoring::metrics::ConnectionMetrics;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::RwLock;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info, warn};

/// Status reported when the platform side is gone
const PLATFORM_UNAVAILABLE: u16 = 503;

/// Status of a publish that did not finish in time
const PUBLISH_TIMED_OUT: u16 = 408;

#[derive(Debug, Clone, PartialEq)]
pub struct PipelineSettings {
    pub collector_lifetime: Duration,
    pub total_ack_payload_quota: usize,
    pub publish_timeout: Duration,
    pub intake_capacity: usize,
    /// `None` disables the intake throttle
    pub max_inbound_per_second: Option<u64>,
}

impl PipelineSettings {
    /// Connection rate limit wins over the service-wide default
    pub fn from_config(config: &ConnectivityConfig, spec: &ConnectionSpec) -> Self {
        Self {
            collector_lifetime: config.acknowledgement.collector_lifetime(),
            total_ack_payload_quota: config.acknowledgement.total_ack_payload_quota_bytes,
            publish_timeout: config.acknowledgement.publish_timeout(),
            intake_capacity: config.intake.buffer_capacity,
            max_inbound_per_second: spec
                .max_inbound_per_second
                .or(config.intake.max_messages_per_second),
        }
    }
}

struct Shared {
    connection_id: ConnectionId,
    settings: PipelineSettings,
    mapper: Arc<dyn MessageMapper>,
    forwarder: mpsc::UnboundedSender<ForwardedSignal>,
    collectors: DashMap<CorrelationId, CollectorHandle>,
    publisher: RwLock<Option<Arc<dyn Publisher>>>,
    targets: RwLock<Vec<TargetSpec>>,
    metrics: Arc<ConnectionMetrics>,
    logger: Arc<ConnectionLogger>,
}

/// Cheaply cloneable handle to a connection's dispatch state
#[derive(Clone)]
pub struct DispatchPipeline {
    shared: Arc<Shared>,
}

impl DispatchPipeline {
    pub fn new(
        connection_id: ConnectionId,
        settings: PipelineSettings,
        mapper: Arc<dyn MessageMapper>,
        forwarder: mpsc::UnboundedSender<ForwardedSignal>,
        metrics: Arc<ConnectionMetrics>,
        logger: Arc<ConnectionLogger>,
    ) -> Self {
        Self {
            shared: Arc::new(Shared {
                connection_id,
                settings,
                mapper,
                forwarder,
                collectors: DashMap::new(),
                publisher: RwLock::new(None),
                targets: RwLock::new(Vec::new()),
                metrics,
                logger,
            }),
        }
    }

    pub fn connection_id(&self) -> &ConnectionId {
        &self.shared.connection_id
    }

    /// Open a fresh intake and start the worker draining it
    pub fn start_intake(&self) -> (InboundIntake, IntakeWorker) {
        let settings = &self.shared.settings;
        let (intake, rx) = InboundIntake::channel(
            self.shared.connection_id.clone(),
            settings.intake_capacity,
            self.shared.metrics.clone(),
        );
        let throttle = settings.max_inbound_per_second.map(IntakeThrottle::per_second);
        let (stop_tx, stop_rx) = oneshot::channel();

        let task = tokio::spawn(self.clone().run_intake(rx, throttle, stop_rx));
        (intake, IntakeWorker::new(stop_tx, task))
    }

    async fn run_intake(
        self,
        mut rx: mpsc::Receiver<InboundMessage>,
        throttle: Option<IntakeThrottle>,
        mut stop: oneshot::Receiver<()>,
    ) {
        let shared = &self.shared;
        debug!(connection_id = %shared.connection_id, "Intake worker started");

        loop {
            let inbound = tokio::select! {
                biased;
                _ = &mut stop => break,
                inbound = rx.recv() => match inbound {
                    Some(inbound) => inbound,
                    None => break,
                },
            };

            if let Some(throttle) = &throttle {
                let delayed = tokio::select! {
                    biased;
                    _ = &mut stop => {
                        intake::refuse(inbound, &shared.metrics);
                        break;
                    }
                    delayed = throttle.acquire() => delayed,
                };
                if delayed {
                    shared.metrics.inbound_throttled.inc();
                }
            }

            let pipeline = self.clone();
            tokio::spawn(async move {
                pipeline.handle_inbound(inbound).await;
            });
        }

        intake::drain(&shared.connection_id, &mut rx, &shared.metrics);
        debug!(connection_id = %shared.connection_id, "Intake worker stopped");
    }

    /// Map, collect acknowledgements, decide and settle one message
    pub async fn handle_inbound(&self, inbound: InboundMessage) -> DeliveryOutcome {
        let InboundMessage {
            message,
            settlement,
        } = inbound;
        let shared = &self.shared;

        let meta = CorrelationMeta::for_message(&message);
        let results = shared.mapper.map_inbound(&message, &meta);
        let fan_out = results.len();

        let mut outcome = DeliveryOutcome::Settle;
        let mut pending: Vec<(CorrelationId, oneshot::Receiver<_>)> = Vec::new();

        for (index, result) in results.into_iter().enumerate() {
            let mut signal = match result {
                Ok(signal) => signal,
                Err(err) => {
                    debug!(
                        connection_id = %shared.connection_id,
                        correlation_id = %meta.correlation_id,
                        error = %err,
                        "Mapping failed"
                    );
                    shared.logger.failure(
                        LogCategory::Source,
                        Some(&message.source_address),
                        format!("mapping failed: {err}"),
                    );
                    outcome = outcome.combine(decide_on_error(&err));
                    continue;
                }
            };

            if fan_out > 1 && index > 0 {
                signal.correlation_id =
                    CorrelationId::new(format!("{}:{index}", signal.correlation_id));
            }

            if signal.requested_acks.is_empty() {
                if !self.forward(ForwardedSignal {
                    signal,
                    acknowledgements: None,
                }) {
                    outcome = outcome.combine(DeliveryOutcome::Reject { redeliver: true });
                }
                continue;
            }

            let expected = signal.requested_acks.len();
            let collector = self.register_collector(&signal.correlation_id);
            let correlation_id = collector.correlation_id().clone();
            signal.correlation_id = correlation_id.clone();

            let report = collector.query();
            collector.set_expected_count(expected);

            if !self.forward(ForwardedSignal {
                signal,
                acknowledgements: Some(collector.clone()),
            }) {
                collector.add_response(CollectedOutcome::Error(ProcessingError::with_status(
                    PLATFORM_UNAVAILABLE,
                    "platform unavailable",
                )));
            }
            pending.push((correlation_id, report));
        }

        for (correlation_id, report) in pending {
            let decision = match report.await {
                Ok(output) => decide(&output),
                Err(_) => {
                    warn!(
                        connection_id = %shared.connection_id,
                        correlation_id = %correlation_id,
                        "Collector finished without reporting"
                    );
                    DeliveryOutcome::Reject { redeliver: true }
                }
            };
            if shared.collectors.remove(&correlation_id).is_some() {
                shared.metrics.in_flight_collectors.dec();
            }
            outcome = outcome.combine(decision);
        }

        match outcome {
            DeliveryOutcome::Settle => shared.metrics.inbound_settled.inc(),
            DeliveryOutcome::Reject { redeliver: true } => {
                shared.metrics.inbound_rejected_redeliver.inc()
            }
            DeliveryOutcome::Reject { redeliver: false } => shared.metrics.inbound_rejected_drop.inc(),
        }
        if !outcome.is_settle() {
            shared.logger.failure(
                LogCategory::Source,
                Some(&message.source_address),
                format!("message rejected ({outcome:?})"),
            );
        }

        apply_outcome(settlement, outcome);
        outcome
    }

    /// Start a collector under a key no live collector holds
    fn register_collector(&self, requested: &CorrelationId) -> CollectorHandle {
        let shared = &self.shared;
        let mut key = requested.clone();
        loop {
            match shared.collectors.entry(key) {
                Entry::Vacant(slot) => {
                    let collector = AcknowledgementCollector::spawn(
                        slot.key().clone(),
                        shared.settings.collector_lifetime,
                    );
                    slot.insert(collector.clone());
                    shared.metrics.in_flight_collectors.inc();
                    return collector;
                }
                Entry::Occupied(_) => {
                    debug!(
                        connection_id = %shared.connection_id,
                        correlation_id = %requested,
                        "Correlation id already in flight"
                    );
                    key = CorrelationId::new(format!("{requested}#{}", CorrelationId::random()));
                }
            }
        }
    }

    fn forward(&self, forwarded: ForwardedSignal) -> bool {
        if self.shared.forwarder.send(forwarded).is_err() {
            warn!(connection_id = %self.shared.connection_id, "Platform forwarder closed");
            return false;
        }
        true
    }

    /// Deliver an acknowledgement to the collector waiting for it
    pub fn route_acknowledgement(&self, ack: Acknowledgement) -> bool {
        match self.shared.collectors.get(&ack.correlation_id) {
            Some(collector) => {
                collector.add_response(CollectedOutcome::Acknowledgement(ack));
                true
            }
            None => {
                error!(
                    connection_id = %self.shared.connection_id,
                    correlation_id = %ack.correlation_id,
                    "No acknowledgement collector for correlation id"
                );
                false
            }
        }
    }

    /// Number of collectors still waiting
    pub fn in_flight(&self) -> usize {
        self.shared.collectors.len()
    }

    pub fn attach_publisher(&self, publisher: Arc<dyn Publisher>, targets: Vec<TargetSpec>) {
        info!(
            connection_id = %self.shared.connection_id,
            targets = targets.len(),
            "Publisher attached"
        );
        *self.shared.targets.write() = targets;
        *self.shared.publisher.write() = Some(publisher);
    }

    pub fn detach_publisher(&self) {
        if self.shared.publisher.write().take().is_some() {
            info!(connection_id = %self.shared.connection_id, "Publisher detached");
        }
    }

    pub fn publisher(&self) -> Option<Arc<dyn Publisher>> {
        self.shared.publisher.read().clone()
    }

    /// Map and publish one signal; returns the number of publish attempts started
    pub fn dispatch_outbound(&self, signal: OutboundSignal) -> usize {
        let shared = &self.shared;
        let publisher = self.publisher();
        let targets = shared.targets.read().clone();

        let messages = shared.mapper.map_outbound(&signal, &targets);
        let quota = quota_per_target(shared.settings.total_ack_payload_quota, messages.len());
        let publish_timeout = shared.settings.publish_timeout;
        let attempts = messages.len();

        for message in messages {
            let correlator =
                PublishCorrelator::new(message.correlation_id.clone(), &message.target, quota);
            let publisher = publisher.clone();
            let responses = signal.responses.clone();
            let metrics = shared.metrics.clone();
            let logger = shared.logger.clone();
            let connection_id = shared.connection_id.clone();

            tokio::spawn(async move {
                let address = message.target.address.clone();
                let publish = async {
                    let result = match publisher {
                        Some(publisher) => {
                            let target = message.target.clone();
                            match tokio::time::timeout(publish_timeout, publisher.publish(message)).await {
                                Ok(result) => result,
                                Err(_) => Err(PublishError::new(
                                    &target,
                                    Some(PUBLISH_TIMED_OUT),
                                    format!("publish timed out after {publish_timeout:?}"),
                                )),
                            }
                        }
                        None => Err(PublishError::new(
                            &message.target,
                            Some(PLATFORM_UNAVAILABLE),
                            "no publisher running",
                        )),
                    };
                    match &result {
                        Ok(_) => {
                            metrics.outbound_published.inc();
                            logger.success(LogCategory::Target, Some(&address), "published");
                        }
                        Err(err) => {
                            metrics.outbound_failed.inc();
                            logger.failure(LogCategory::Target, Some(&address), err.to_string());
                        }
                    }
                    result
                };

                let Some(outcome) = correlator.correlate(publish).await else {
                    return;
                };
                if matches!(outcome, CollectedOutcome::Acknowledgement(_)) {
                    metrics.acknowledgements_issued.inc();
                }
                match responses {
                    Some(responses) => {
                        if responses.send(outcome).is_err() {
                            debug!(connection_id = %connection_id, "Publish response receiver dropped");
                        }
                    }
                    None => debug!(connection_id = %connection_id, "Publish outcome discarded"),
                }
            });
        }

        attempts
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::message::{ExternalMessage, CORRELATION_ID_HEADER};
    use crate::core::types::AckLabel;
    use crate::testing::{EchoMapper, RecordingPublisher, RecordingSettlement, REQUESTED_ACKS_HEADER};

    fn settings() -> PipelineSettings {
        PipelineSettings {
            collector_lifetime: Duration::from_secs(5),
            total_ack_payload_quota: 1024,
            publish_timeout: Duration::from_secs(2),
            intake_capacity: 4,
            max_inbound_per_second: None,
        }
    }

    fn pipeline() -> (DispatchPipeline, mpsc::UnboundedReceiver<ForwardedSignal>, Arc<ConnectionMetrics>) {
        pipeline_with(settings())
    }

    fn pipeline_with(
        settings: PipelineSettings,
    ) -> (DispatchPipeline, mpsc::UnboundedReceiver<ForwardedSignal>, Arc<ConnectionMetrics>) {
        let id = ConnectionId::new("orders");
        let metrics = Arc::new(ConnectionMetrics::new(&id).unwrap());
        let logger = Arc::new(ConnectionLogger::new(id.clone(), 16, Duration::from_secs(60)));
        let (tx, rx) = mpsc::unbounded_channel();
        let pipeline = DispatchPipeline::new(id, settings, Arc::new(EchoMapper), tx, metrics.clone(), logger);
        (pipeline, rx, metrics)
    }

    #[tokio::test]
    async fn test_signal_without_acks_settles() {
        let (pipeline, mut forwarded, metrics) = pipeline();
        let (settlement, outcome) = RecordingSettlement::new();

        let result = pipeline
            .handle_inbound(InboundMessage {
                message: ExternalMessage::new("orders.in", br#"{"n":1}"#.to_vec()),
                settlement,
            })
            .await;

        assert_eq!(result, DeliveryOutcome::Settle);
        assert_eq!(outcome.await.unwrap(), DeliveryOutcome::Settle);
        assert!(forwarded.recv().await.unwrap().acknowledgements.is_none());
        assert_eq!(metrics.snapshot().inbound_settled, 1);
    }

    #[tokio::test]
    async fn test_acknowledgements_are_routed_to_collector() {
        let (pipeline, mut forwarded, _metrics) = pipeline();
        let (settlement, outcome) = RecordingSettlement::new();
        let message = ExternalMessage::new("orders.in", b"{}".to_vec())
            .with_header(REQUESTED_ACKS_HEADER, "stored");

        let worker = {
            let pipeline = pipeline.clone();
            tokio::spawn(async move {
                pipeline
                    .handle_inbound(InboundMessage { message, settlement })
                    .await
            })
        };

        let signal = forwarded.recv().await.unwrap().signal;
        assert_eq!(pipeline.in_flight(), 1);
        assert!(pipeline.route_acknowledgement(Acknowledgement::new(
            Some(AckLabel::new("stored")),
            signal.correlation_id.clone(),
            201,
        )));

        assert_eq!(worker.await.unwrap(), DeliveryOutcome::Settle);
        assert_eq!(outcome.await.unwrap(), DeliveryOutcome::Settle);
        assert_eq!(pipeline.in_flight(), 0);
    }

    #[tokio::test]
    async fn test_duplicate_correlation_ids_get_separate_collectors() {
        let (pipeline, mut forwarded, metrics) = pipeline();
        let mut workers = Vec::new();
        let mut outcomes = Vec::new();
        for _ in 0..2 {
            let (settlement, outcome) = RecordingSettlement::new();
            let message = ExternalMessage::new("orders.in", b"{}".to_vec())
                .with_header(CORRELATION_ID_HEADER, "dup")
                .with_header(REQUESTED_ACKS_HEADER, "stored");
            let pipeline = pipeline.clone();
            workers.push(tokio::spawn(async move {
                pipeline
                    .handle_inbound(InboundMessage { message, settlement })
                    .await
            }));
            outcomes.push(outcome);
        }

        let first = forwarded.recv().await.unwrap().signal.correlation_id;
        let second = forwarded.recv().await.unwrap().signal.correlation_id;
        assert_ne!(first, second);
        assert!(first.as_str().starts_with("dup"));
        assert!(second.as_str().starts_with("dup"));
        assert_eq!(pipeline.in_flight(), 2);

        for correlation_id in [first, second] {
            assert!(pipeline.route_acknowledgement(Acknowledgement::new(
                Some(AckLabel::new("stored")),
                correlation_id,
                200,
            )));
        }

        for worker in workers {
            assert_eq!(worker.await.unwrap(), DeliveryOutcome::Settle);
        }
        for outcome in outcomes {
            assert_eq!(outcome.await.unwrap(), DeliveryOutcome::Settle);
        }
        assert_eq!(pipeline.in_flight(), 0);
        assert_eq!(metrics.snapshot().inbound_settled, 2);
    }

    #[tokio::test]
    async fn test_stopped_intake_rejects_buffered_messages() {
        let (pipeline, _forwarded, metrics) = pipeline_with(PipelineSettings {
            max_inbound_per_second: Some(1),
            ..settings()
        });
        let (intake, worker) = pipeline.start_intake();

        let mut outcomes = Vec::new();
        for n in 0..3 {
            let (settlement, outcome) = RecordingSettlement::new();
            assert!(intake.offer(ExternalMessage::new("orders.in", vec![b'0' + n]), settlement));
            outcomes.push(outcome);
        }
        let mut outcomes = outcomes.into_iter();

        // the first message spends the only token, the second waits on the throttle
        let first = outcomes.next().unwrap();
        assert_eq!(first.await.unwrap(), DeliveryOutcome::Settle);

        worker.stop().await.unwrap();
        for outcome in outcomes {
            assert_eq!(outcome.await.unwrap(), DeliveryOutcome::Reject { redeliver: true });
        }
        assert_eq!(metrics.snapshot().inbound_rejected_redeliver, 2);

        let (settlement, outcome) = RecordingSettlement::new();
        assert!(!intake.offer(ExternalMessage::new("orders.in", Vec::new()), settlement));
        assert_eq!(outcome.await.unwrap(), DeliveryOutcome::Reject { redeliver: true });
    }

    #[tokio::test]
    async fn test_unknown_correlation_is_reported() {
        let (pipeline, _forwarded, _metrics) = pipeline();
        let ack = Acknowledgement::new(None, CorrelationId::new("nobody"), 200);
        assert!(!pipeline.route_acknowledgement(ack));
    }

    #[tokio::test]
    async fn test_outbound_without_publisher_nacks() {
        let (pipeline, _forwarded, metrics) = pipeline();
        let target = TargetSpec {
            address: "events.out".into(),
            topics: vec![],
            issued_ack_label: Some(AckLabel::new("published")),
        };
        pipeline.attach_publisher(Arc::new(RecordingPublisher::default()), vec![target]);
        pipeline.detach_publisher();

        let (tx, mut rx) = mpsc::unbounded_channel();
        let signal = OutboundSignal::new("things.modified", serde_json::json!({})).with_responses(tx);
        assert_eq!(pipeline.dispatch_outbound(signal), 1);

        match rx.recv().await.unwrap() {
            CollectedOutcome::Acknowledgement(ack) => assert_eq!(ack.status, 503),
            other => panic!("unexpected outcome: {other:?}"),
        }
        assert_eq!(metrics.snapshot().outbound_failed, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_hung_publish_times_out_as_nack() {
        let (pipeline, _forwarded, metrics) = pipeline();
        let target = TargetSpec {
            address: "events.out".into(),
            topics: vec![],
            issued_ack_label: Some(AckLabel::new("published")),
        };
        pipeline.attach_publisher(Arc::new(RecordingPublisher::hanging()), vec![target]);

        let (tx, mut rx) = mpsc::unbounded_channel();
        let signal = OutboundSignal::new("things.modified", serde_json::json!({})).with_responses(tx);
        assert_eq!(pipeline.dispatch_outbound(signal), 1);

        match rx.recv().await.unwrap() {
            CollectedOutcome::Acknowledgement(ack) => {
                assert_eq!(ack.status, 408);
                assert_eq!(ack.label, Some(AckLabel::new("published")));
            }
            other => panic!("unexpected outcome: {other:?}"),
        }
        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.outbound_failed, 1);
        assert_eq!(snapshot.outbound_published, 0);
    }

    #[tokio::test]
    async fn test_outbound_publishes_to_every_target() {
        let (pipeline, _forwarded, metrics) = pipeline();
        let publisher = Arc::new(RecordingPublisher::default());
        let targets = vec![
            TargetSpec {
                address: "a".into(),
                topics: vec![],
                issued_ack_label: Some(AckLabel::new("a-published")),
            },
            TargetSpec {
                address: "b".into(),
                topics: vec![],
                issued_ack_label: Some(AckLabel::new("b-published")),
            },
        ];
        pipeline.attach_publisher(publisher.clone(), targets);

        let (tx, mut rx) = mpsc::unbounded_channel();
        let signal = OutboundSignal::new("things.modified", serde_json::json!({ "id": 1 })).with_responses(tx);
        assert_eq!(pipeline.dispatch_outbound(signal), 2);

        let mut labels = Vec::new();
        for _ in 0..2 {
            match rx.recv().await.unwrap() {
                CollectedOutcome::Acknowledgement(ack) => {
                    assert!(ack.is_success());
                    labels.push(ack.label.unwrap().as_str().to_string());
                }
                other => panic!("unexpected outcome: {other:?}"),
            }
        }
        labels.sort();
        assert_eq!(labels, vec!["a-published", "b-published"]);
        assert_eq!(publisher.published().len(), 2);
        assert_eq!(metrics.snapshot().acknowledgements_issued, 2);
    }
}
