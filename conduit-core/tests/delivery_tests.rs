//! End-to-end delivery tests
//!
//! Inbound messages enter through the intake handed to the driver's
//! consumers; the platform side is played by the test, which receives the
//! forwarded signals and answers with acknowledgements.
//!
//! These tests verify:
//! 1. A message is settled only when every requested acknowledgement succeeded
//! 2. Failed acknowledgements reject, with redelivery chosen by status
//! 3. Missing acknowledgements time out into a redelivering reject
//! 4. Outbound signals produce labelled publish acknowledgements

use conduit_core::ack::{Acknowledgement, CollectedOutcome, DeliveryOutcome};
use conduit_core::connection::{ConnectionActor, ConnectionHandle};
use conduit_core::core::{AckLabel, ExternalMessage, OutboundSignal};
use conduit_core::dispatch::{ForwardedSignal, InboundIntake};
use conduit_core::testing::{
    create_fast_config, create_test_spec, EchoMapper, RecordingPublisher, RecordingSettlement, ScriptedDriver,
    FAN_OUT_HEADER, MAPPING_ERROR_HEADER, REQUESTED_ACKS_HEADER,
};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};

struct Harness {
    handle: ConnectionHandle,
    driver: Arc<ScriptedDriver>,
    intake: InboundIntake,
    forwarded: mpsc::UnboundedReceiver<ForwardedSignal>,
}

async fn connected(publisher: RecordingPublisher) -> Harness {
    let driver = Arc::new(ScriptedDriver::with_publisher(publisher));
    let (tx, forwarded) = mpsc::unbounded_channel();
    let handle = ConnectionActor::spawn(
        create_test_spec("orders"),
        driver.clone(),
        Arc::new(EchoMapper),
        tx,
        Arc::new(create_fast_config(3)),
    )
    .unwrap();

    handle.open().await.unwrap();
    let intake = driver.intake().expect("consumers started");
    Harness {
        handle,
        driver,
        intake,
        forwarded,
    }
}

fn offer(harness: &Harness, message: ExternalMessage) -> oneshot::Receiver<DeliveryOutcome> {
    let (settlement, outcome) = RecordingSettlement::new();
    assert!(harness.intake.offer(message, settlement));
    outcome
}

fn requesting(labels: &str) -> ExternalMessage {
    ExternalMessage::new("orders.in", br#"{"thing":"sensor-1"}"#.to_vec()).with_header(REQUESTED_ACKS_HEADER, labels)
}

fn ack(signal: &ForwardedSignal, label: &str, status: u16) -> Acknowledgement {
    Acknowledgement::new(Some(AckLabel::new(label)), signal.signal.correlation_id.clone(), status)
}

#[cfg(test)]
mod inbound {
    use super::*;

    /// Test: Two successful acknowledgements settle the message
    #[tokio::test]
    async fn test_all_acknowledged_settles() {
        let mut harness = connected(RecordingPublisher::default()).await;
        let outcome = offer(&harness, requesting("stored,indexed"));

        let signal = harness.forwarded.recv().await.unwrap();
        assert!(signal.acknowledgements.is_some());
        assert!(harness.handle.acknowledge(ack(&signal, "stored", 200)));
        assert!(harness.handle.acknowledge(ack(&signal, "indexed", 204)));

        assert_eq!(outcome.await.unwrap(), DeliveryOutcome::Settle);
        let metrics = harness.handle.retrieve_metrics().await.unwrap();
        assert_eq!(metrics.inbound_consumed, 1);
        assert_eq!(metrics.inbound_settled, 1);
    }

    /// Test: One success and one 503 reject with redelivery
    #[tokio::test]
    async fn test_server_error_redelivers() {
        let mut harness = connected(RecordingPublisher::default()).await;
        let outcome = offer(&harness, requesting("stored,indexed"));

        let signal = harness.forwarded.recv().await.unwrap();
        harness.handle.acknowledge(ack(&signal, "stored", 200));
        harness.handle.acknowledge(ack(&signal, "indexed", 503));

        assert_eq!(outcome.await.unwrap(), DeliveryOutcome::Reject { redeliver: true });
    }

    /// Test: A client error rejects without redelivery
    #[tokio::test]
    async fn test_client_error_drops() {
        let mut harness = connected(RecordingPublisher::default()).await;
        let outcome = offer(&harness, requesting("stored"));

        let signal = harness.forwarded.recv().await.unwrap();
        harness.handle.acknowledge(ack(&signal, "stored", 400));

        assert_eq!(outcome.await.unwrap(), DeliveryOutcome::Reject { redeliver: false });
        assert_eq!(harness.handle.retrieve_metrics().await.unwrap().inbound_rejected_drop, 1);
    }

    /// Test: A superseded message (412) is settled
    #[tokio::test]
    async fn test_precondition_failed_settles() {
        let mut harness = connected(RecordingPublisher::default()).await;
        let outcome = offer(&harness, requesting("stored"));

        let signal = harness.forwarded.recv().await.unwrap();
        harness.handle.acknowledge(ack(&signal, "stored", 412));

        assert_eq!(outcome.await.unwrap(), DeliveryOutcome::Settle);
    }

    /// Test: Acknowledgements that never arrive reject with redelivery
    #[tokio::test(start_paused = true)]
    async fn test_missing_acknowledgement_times_out() {
        let mut harness = connected(RecordingPublisher::default()).await;
        let outcome = offer(&harness, requesting("stored,indexed"));

        let signal = harness.forwarded.recv().await.unwrap();
        harness.handle.acknowledge(ack(&signal, "stored", 200));

        assert_eq!(outcome.await.unwrap(), DeliveryOutcome::Reject { redeliver: true });
    }

    /// Test: Mapping errors are decided by their status
    #[tokio::test]
    async fn test_mapping_errors() {
        let harness = connected(RecordingPublisher::default()).await;

        let bad_request = ExternalMessage::new("orders.in", b"{}".to_vec()).with_header(MAPPING_ERROR_HEADER, "400");
        let unclassified = ExternalMessage::new("orders.in", b"{}".to_vec()).with_header(MAPPING_ERROR_HEADER, "panic");
        let superseded = ExternalMessage::new("orders.in", b"{}".to_vec()).with_header(MAPPING_ERROR_HEADER, "412");

        assert_eq!(
            offer(&harness, bad_request).await.unwrap(),
            DeliveryOutcome::Reject { redeliver: false }
        );
        assert_eq!(
            offer(&harness, unclassified).await.unwrap(),
            DeliveryOutcome::Reject { redeliver: true }
        );
        assert_eq!(offer(&harness, superseded).await.unwrap(), DeliveryOutcome::Settle);
    }

    /// Test: A message split into several signals needs every part acknowledged
    #[tokio::test]
    async fn test_fan_out_combines_outcomes() {
        let mut harness = connected(RecordingPublisher::default()).await;
        let outcome = offer(&harness, requesting("stored").with_header(FAN_OUT_HEADER, "2"));

        let first = harness.forwarded.recv().await.unwrap();
        let second = harness.forwarded.recv().await.unwrap();
        assert_ne!(first.signal.correlation_id, second.signal.correlation_id);

        harness.handle.acknowledge(ack(&first, "stored", 200));
        harness.handle.acknowledge(ack(&second, "stored", 500));

        assert_eq!(outcome.await.unwrap(), DeliveryOutcome::Reject { redeliver: true });
    }

    /// Test: Signals without requested acknowledgements settle once forwarded
    #[tokio::test]
    async fn test_fire_and_forget_settles() {
        let mut harness = connected(RecordingPublisher::default()).await;
        let outcome = offer(&harness, ExternalMessage::new("orders.in", b"42".to_vec()));

        let signal = harness.forwarded.recv().await.unwrap();
        assert!(signal.acknowledgements.is_none());
        assert_eq!(signal.signal.payload, serde_json::json!(42));
        assert_eq!(outcome.await.unwrap(), DeliveryOutcome::Settle);
    }
}

#[cfg(test)]
mod outbound {
    use super::*;

    /// Test: A publish acknowledgement carries the target's label
    #[tokio::test]
    async fn test_publish_issues_labelled_acknowledgement() {
        let harness = connected(RecordingPublisher::default()).await;
        let (tx, mut responses) = mpsc::unbounded_channel();
        let signal = OutboundSignal::new("things.modified", serde_json::json!({ "id": 7 })).with_responses(tx);
        let correlation_id = signal.correlation_id.clone();

        assert!(harness.handle.publish(signal));

        match responses.recv().await.unwrap() {
            CollectedOutcome::Acknowledgement(ack) => {
                assert_eq!(ack.label, Some(AckLabel::new("orders-published")));
                assert_eq!(ack.correlation_id, correlation_id);
                assert!(ack.is_success());
            }
            other => panic!("unexpected outcome: {other:?}"),
        }
        assert_eq!(harness.driver.publisher().published().len(), 1);
    }

    /// Test: A failed publish becomes a negative acknowledgement
    #[tokio::test]
    async fn test_failed_publish_nacks() {
        let harness = connected(RecordingPublisher::failing(Some(503))).await;
        let (tx, mut responses) = mpsc::unbounded_channel();
        let signal = OutboundSignal::new("things.modified", serde_json::json!({})).with_responses(tx);

        harness.handle.publish(signal);

        match responses.recv().await.unwrap() {
            CollectedOutcome::Acknowledgement(ack) => {
                assert_eq!(ack.status, 503);
                assert_eq!(ack.label, Some(AckLabel::new("orders-published")));
            }
            other => panic!("unexpected outcome: {other:?}"),
        }
        assert_eq!(harness.handle.retrieve_metrics().await.unwrap().outbound_failed, 1);
    }

    /// Test: A publish without an acknowledgement is reported as a 500
    #[tokio::test]
    async fn test_silent_publish_reports_missing_acknowledgement() {
        let harness = connected(RecordingPublisher::silent()).await;
        let (tx, mut responses) = mpsc::unbounded_channel();
        harness
            .handle
            .publish(OutboundSignal::new("things.modified", serde_json::json!({})).with_responses(tx));

        match responses.recv().await.unwrap() {
            CollectedOutcome::Acknowledgement(ack) => assert_eq!(ack.status, 500),
            other => panic!("unexpected outcome: {other:?}"),
        }
    }
}
