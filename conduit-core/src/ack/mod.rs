//! Delivery acknowledgement correlation
//!
//! - `collector`: per-signal gathering of expected acknowledgements
//! - `decision`: settle/reject rule applied to a collector's output
//! - `publish`: turns one outbound publish result into an acknowledgement

pub mod collector;
pub mod decision;
pub mod publish;

use crate::core::errors::ProcessingError;
use crate::core::types::{AckLabel, CorrelationId};
use serde::{Deserialize, Serialize};
use serde_json::Value;

pub use collector::{AcknowledgementCollector, CollectorHandle, CollectorOutput, CollectorState};
pub use decision::{decide, decide_on_error, requires_redelivery};
pub use publish::{quota_per_target, PublishCorrelator};

/// HTTP-like status of a precondition failure; the message was superseded
pub const PRECONDITION_FAILED: u16 = 412;

/// Response to an acknowledgement request
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Acknowledgement {
    pub label: Option<AckLabel>,
    pub correlation_id: CorrelationId,
    pub status: u16,
    #[serde(default)]
    pub payload: Option<Value>,
}

impl Acknowledgement {
    pub fn new(label: Option<AckLabel>, correlation_id: CorrelationId, status: u16) -> Self {
        Self {
            label,
            correlation_id,
            status,
            payload: None,
        }
    }

    pub fn with_payload(mut self, payload: Value) -> Self {
        self.payload = Some(payload);
        self
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

/// One entry recorded by a collector
#[derive(Debug, Clone, PartialEq)]
pub enum CollectedOutcome {
    Acknowledgement(Acknowledgement),
    Error(ProcessingError),
}

impl CollectedOutcome {
    pub fn status(&self) -> Option<u16> {
        match self {
            Self::Acknowledgement(ack) => Some(ack.status),
            Self::Error(err) => err.status,
        }
    }

    pub fn correlation_id(&self) -> Option<&CorrelationId> {
        match self {
            Self::Acknowledgement(ack) => Some(&ack.correlation_id),
            Self::Error(_) => None,
        }
    }

    /// Negative outcome that counts against delivery.
    ///
    /// A precondition failure is not one: the message was already superseded.
    pub fn is_failure(&self) -> bool {
        match self {
            Self::Acknowledgement(ack) => !ack.is_success() && ack.status != PRECONDITION_FAILED,
            Self::Error(err) => err.status != Some(PRECONDITION_FAILED),
        }
    }

    /// Processing errors end collection early
    pub fn is_terminal_error(&self) -> bool {
        matches!(self, Self::Error(_)) && self.is_failure()
    }
}

/// Verdict handed to the protocol driver's settle/reject capability
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum DeliveryOutcome {
    Settle,
    Reject { redeliver: bool },
}

impl DeliveryOutcome {
    /// Outcome for a message split into several signals: any reject wins,
    /// and redelivery is requested if any part asks for it
    pub fn combine(self, other: Self) -> Self {
        match (self, other) {
            (Self::Settle, Self::Settle) => Self::Settle,
            (Self::Reject { redeliver }, Self::Settle) | (Self::Settle, Self::Reject { redeliver }) => {
                Self::Reject { redeliver }
            }
            (Self::Reject { redeliver: a }, Self::Reject { redeliver: b }) => {
                Self::Reject { redeliver: a || b }
            }
        }
    }

    pub fn is_settle(&self) -> bool {
        matches!(self, Self::Settle)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ack(status: u16) -> CollectedOutcome {
        CollectedOutcome::Acknowledgement(Acknowledgement::new(
            Some(AckLabel::new("live-response")),
            CorrelationId::new("c"),
            status,
        ))
    }

    #[test]
    fn test_failure_classification() {
        assert!(!ack(200).is_failure());
        assert!(!ack(204).is_failure());
        assert!(!ack(412).is_failure());
        assert!(ack(400).is_failure());
        assert!(ack(503).is_failure());

        let unclassified = CollectedOutcome::Error(ProcessingError::unstructured("boom"));
        assert!(unclassified.is_failure());
        assert!(unclassified.is_terminal_error());

        let superseded = CollectedOutcome::Error(ProcessingError::with_status(412, "stale"));
        assert!(!superseded.is_failure());
        assert!(!superseded.is_terminal_error());
    }

    #[test]
    fn test_combine() {
        use DeliveryOutcome::*;
        assert_eq!(Settle.combine(Settle), Settle);
        assert_eq!(Settle.combine(Reject { redeliver: false }), Reject { redeliver: false });
        assert_eq!(
            Reject { redeliver: false }.combine(Reject { redeliver: true }),
            Reject { redeliver: true }
        );
    }
}
