//! Bounded inbound intake
//!
//! The driver's receive loop must never block on us: when the buffer is
//! full the message is rejected for redelivery on the spot. Stopping the
//! worker rejects whatever is still buffered the same way.

use super::{InboundMessage, Settlement};
use crate::core::message::ExternalMessage;
use crate::core::types::ConnectionId;
use crate::monitoring::metrics::ConnectionMetrics;
use std::sync::Arc;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Driver-facing side of the intake buffer
#[derive(Clone)]
pub struct InboundIntake {
    connection_id: ConnectionId,
    tx: mpsc::Sender<InboundMessage>,
    metrics: Arc<ConnectionMetrics>,
}

impl InboundIntake {
    pub fn channel(
        connection_id: ConnectionId,
        capacity: usize,
        metrics: Arc<ConnectionMetrics>,
    ) -> (Self, mpsc::Receiver<InboundMessage>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (
            Self {
                connection_id,
                tx,
                metrics,
            },
            rx,
        )
    }

    /// Queue a consumed message; false if it was rejected instead
    pub fn offer(&self, message: ExternalMessage, settlement: Box<dyn Settlement>) -> bool {
        self.metrics.inbound_consumed.inc();

        let refused = match self.tx.try_send(InboundMessage {
            message,
            settlement,
        }) {
            Ok(()) => return true,
            Err(TrySendError::Full(refused)) => {
                warn!(
                    connection_id = %self.connection_id,
                    source = %refused.message.source_address,
                    "Intake buffer full, rejecting message for redelivery"
                );
                refused
            }
            Err(TrySendError::Closed(refused)) => {
                warn!(
                    connection_id = %self.connection_id,
                    source = %refused.message.source_address,
                    "Intake closed, rejecting message for redelivery"
                );
                refused
            }
        };

        self.metrics.inbound_dropped_backpressure.inc();
        self.metrics.inbound_rejected_redeliver.inc();
        refused.settlement.reject(true);
        false
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// Running intake worker
///
/// Dropping it stops the worker just like [`IntakeWorker::stop`].
pub struct IntakeWorker {
    stop: Option<oneshot::Sender<()>>,
    task: JoinHandle<()>,
}

impl IntakeWorker {
    pub(crate) fn new(stop: oneshot::Sender<()>, task: JoinHandle<()>) -> Self {
        Self {
            stop: Some(stop),
            task,
        }
    }

    /// Stop taking messages. The worker rejects everything still buffered
    /// for redelivery before the returned task finishes.
    pub fn stop(mut self) -> JoinHandle<()> {
        if let Some(stop) = self.stop.take() {
            let _ = stop.send(());
        }
        self.task
    }
}

/// Close `rx` and reject everything left in it for redelivery
pub(crate) fn drain(
    connection_id: &ConnectionId,
    rx: &mut mpsc::Receiver<InboundMessage>,
    metrics: &ConnectionMetrics,
) -> usize {
    rx.close();
    let mut rejected = 0;
    while let Ok(inbound) = rx.try_recv() {
        refuse(inbound, metrics);
        rejected += 1;
    }
    if rejected > 0 {
        debug!(connection_id = %connection_id, rejected, "Buffered messages rejected for redelivery");
    }
    rejected
}

/// Reject one message that was accepted but will never be dispatched
pub(crate) fn refuse(inbound: InboundMessage, metrics: &ConnectionMetrics) {
    metrics.inbound_rejected_redeliver.inc();
    inbound.settlement.reject(true);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ack::DeliveryOutcome;
    use crate::testing::RecordingSettlement;

    fn intake(capacity: usize) -> (InboundIntake, mpsc::Receiver<InboundMessage>, Arc<ConnectionMetrics>) {
        let id = ConnectionId::new("orders");
        let metrics = Arc::new(ConnectionMetrics::new(&id).unwrap());
        let (intake, rx) = InboundIntake::channel(id, capacity, metrics.clone());
        (intake, rx, metrics)
    }

    #[tokio::test]
    async fn test_full_buffer_rejects_for_redelivery() {
        let (intake, _rx, metrics) = intake(1);

        let (first, _first_outcome) = RecordingSettlement::new();
        assert!(intake.offer(ExternalMessage::new("orders.in", b"1".to_vec()), first));

        let (second, second_outcome) = RecordingSettlement::new();
        assert!(!intake.offer(ExternalMessage::new("orders.in", b"2".to_vec()), second));

        assert_eq!(
            second_outcome.await.unwrap(),
            DeliveryOutcome::Reject { redeliver: true }
        );
        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.inbound_consumed, 2);
        assert_eq!(snapshot.inbound_dropped_backpressure, 1);
    }

    #[tokio::test]
    async fn test_closed_intake_rejects() {
        let (intake, rx, _metrics) = intake(4);
        drop(rx);
        assert!(intake.is_closed());

        let (settlement, outcome) = RecordingSettlement::new();
        assert!(!intake.offer(ExternalMessage::new("orders.in", Vec::new()), settlement));
        assert_eq!(outcome.await.unwrap(), DeliveryOutcome::Reject { redeliver: true });
    }

    #[tokio::test]
    async fn test_drain_rejects_buffered_messages() {
        let (intake, mut rx, metrics) = intake(4);
        let mut outcomes = Vec::new();
        for n in 0..3 {
            let (settlement, outcome) = RecordingSettlement::new();
            assert!(intake.offer(ExternalMessage::new("orders.in", vec![n]), settlement));
            outcomes.push(outcome);
        }

        assert_eq!(drain(&ConnectionId::new("orders"), &mut rx, &metrics), 3);
        for outcome in outcomes {
            assert_eq!(outcome.await.unwrap(), DeliveryOutcome::Reject { redeliver: true });
        }
        assert_eq!(metrics.snapshot().inbound_rejected_redeliver, 3);

        // later offers are refused on the spot
        let (settlement, outcome) = RecordingSettlement::new();
        assert!(!intake.offer(ExternalMessage::new("orders.in", Vec::new()), settlement));
        assert_eq!(outcome.await.unwrap(), DeliveryOutcome::Reject { redeliver: true });
    }
}
