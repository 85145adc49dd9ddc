//! Per-signal acknowledgement collector
//!
//! Three inputs arrive in any order: the expected count (once), responses
//! (zero or more) and the query (once). The requester gets exactly one
//! report, as soon as the count is known and either enough responses or a
//! terminal error arrived. If that never happens, the collector force-reports
//! whatever it has once its lifetime elapses, then stops.
//!
//! [`CollectorState`] is the pure bookkeeping; [`AcknowledgementCollector`]
//! runs it as a tokio task fed by a [`CollectorHandle`].

use super::CollectedOutcome;
use crate::core::types::CorrelationId;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};

/// What the requester receives
#[derive(Debug, Clone, PartialEq)]
pub struct CollectorOutput {
    pub correlation_id: CorrelationId,
    /// `None` if the count never arrived
    pub expected_count: Option<usize>,
    pub collected: Vec<CollectedOutcome>,
    pub all_expected_arrived: bool,
}

/// Collector bookkeeping, generic over the requester handle
#[derive(Debug)]
pub struct CollectorState<R> {
    correlation_id: CorrelationId,
    expected: Option<usize>,
    collected: Vec<CollectedOutcome>,
    requester: Option<R>,
    reported: bool,
}

impl<R> CollectorState<R> {
    pub fn new(correlation_id: CorrelationId) -> Self {
        Self {
            correlation_id,
            expected: None,
            collected: Vec::new(),
            requester: None,
            reported: false,
        }
    }

    /// Returns false (and keeps the first value) on a repeated call
    pub fn set_expected_count(&mut self, count: usize) -> bool {
        if let Some(existing) = self.expected {
            warn!(
                correlation_id = %self.correlation_id,
                existing,
                ignored = count,
                "Expected acknowledgement count set twice"
            );
            return false;
        }
        self.expected = Some(count);
        true
    }

    pub fn add_response(&mut self, outcome: CollectedOutcome) {
        if self.reported {
            debug!(correlation_id = %self.correlation_id, "Response after report dropped");
            return;
        }
        self.collected.push(outcome);
    }

    /// Register the requester; hands it back if one is already registered
    pub fn register_query(&mut self, requester: R) -> Result<(), R> {
        if self.requester.is_some() || self.reported {
            return Err(requester);
        }
        self.requester = Some(requester);
        Ok(())
    }

    /// Count known and (enough responses or a terminal error)
    pub fn is_complete(&self) -> bool {
        match self.expected {
            Some(expected) => {
                self.collected.len() >= expected
                    || self.collected.iter().any(CollectedOutcome::is_terminal_error)
            }
            None => false,
        }
    }

    pub fn is_reported(&self) -> bool {
        self.reported
    }

    /// Report if complete and queried
    pub fn try_report(&mut self) -> Option<(R, CollectorOutput)> {
        if self.reported || !self.is_complete() {
            return None;
        }
        self.report()
    }

    /// Report unconditionally if queried
    pub fn force_report(&mut self) -> Option<(R, CollectorOutput)> {
        if self.reported {
            return None;
        }
        self.report()
    }

    fn report(&mut self) -> Option<(R, CollectorOutput)> {
        let requester = self.requester.take()?;
        self.reported = true;

        let all_expected_arrived = self
            .expected
            .is_some_and(|expected| self.collected.len() >= expected);
        let output = CollectorOutput {
            correlation_id: self.correlation_id.clone(),
            expected_count: self.expected,
            collected: std::mem::take(&mut self.collected),
            all_expected_arrived,
        };
        Some((requester, output))
    }
}

#[derive(Debug)]
enum CollectorInput {
    ExpectedCount(usize),
    Response(CollectedOutcome),
    Query(oneshot::Sender<CollectorOutput>),
}

/// Cloneable handle to a running collector
#[derive(Debug, Clone)]
pub struct CollectorHandle {
    correlation_id: CorrelationId,
    tx: mpsc::UnboundedSender<CollectorInput>,
}

impl CollectorHandle {
    pub fn correlation_id(&self) -> &CorrelationId {
        &self.correlation_id
    }

    pub fn set_expected_count(&self, count: usize) {
        self.send(CollectorInput::ExpectedCount(count));
    }

    pub fn add_response(&self, outcome: CollectedOutcome) {
        self.send(CollectorInput::Response(outcome));
    }

    /// Receiver resolves with the single report; it errors if the collector
    /// was already queried or expired unqueried
    pub fn query(&self) -> oneshot::Receiver<CollectorOutput> {
        let (tx, rx) = oneshot::channel();
        self.send(CollectorInput::Query(tx));
        rx
    }

    /// False once the collector has reported or expired
    pub fn is_alive(&self) -> bool {
        !self.tx.is_closed()
    }

    fn send(&self, input: CollectorInput) {
        if self.tx.send(input).is_err() {
            debug!(correlation_id = %self.correlation_id, "Collector already finished");
        }
    }
}

/// Spawns collector tasks
pub struct AcknowledgementCollector;

impl AcknowledgementCollector {
    /// Start a collector that lives at most `lifetime`
    pub fn spawn(correlation_id: CorrelationId, lifetime: Duration) -> CollectorHandle {
        let (tx, rx) = mpsc::unbounded_channel();
        let handle = CollectorHandle {
            correlation_id: correlation_id.clone(),
            tx,
        };
        tokio::spawn(run(CollectorState::new(correlation_id), rx, lifetime));
        handle
    }
}

async fn run(
    mut state: CollectorState<oneshot::Sender<CollectorOutput>>,
    mut rx: mpsc::UnboundedReceiver<CollectorInput>,
    lifetime: Duration,
) {
    let deadline = tokio::time::sleep(lifetime);
    tokio::pin!(deadline);

    loop {
        tokio::select! {
            input = rx.recv() => {
                let Some(input) = input else {
                    // every handle dropped
                    deliver(state.force_report());
                    return;
                };
                match input {
                    CollectorInput::ExpectedCount(count) => {
                        state.set_expected_count(count);
                    }
                    CollectorInput::Response(outcome) => state.add_response(outcome),
                    CollectorInput::Query(requester) => {
                        if state.register_query(requester).is_err() {
                            warn!(correlation_id = %state.correlation_id, "Collector queried twice");
                        }
                    }
                }
                if deliver(state.try_report()) {
                    return;
                }
            }
            _ = &mut deadline => {
                warn!(
                    correlation_id = %state.correlation_id,
                    lifetime_ms = lifetime.as_millis() as u64,
                    "Acknowledgement collector expired"
                );
                deliver(state.force_report());
                return;
            }
        }
    }
}

fn deliver(report: Option<(oneshot::Sender<CollectorOutput>, CollectorOutput)>) -> bool {
    match report {
        Some((requester, output)) => {
            if requester.send(output).is_err() {
                debug!("Collector requester went away before the report");
            }
            true
        }
        None => false,
    }
}
