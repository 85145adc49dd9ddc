//! Inbound settle/reject rule
//!
//! ```text
//! count matched, no failures  → Settle
//! failures present            → Reject(redeliver = any failure needs redelivery)
//! no failures, count mismatch → Reject(redeliver = true)
//! ```

use super::collector::CollectorOutput;
use super::{CollectedOutcome, DeliveryOutcome, PRECONDITION_FAILED};
use crate::core::errors::ProcessingError;
use tracing::{debug, warn};

/// True for request timeout (408), failed dependency (424) and any 5xx
pub fn requires_redelivery(status: u16) -> bool {
    matches!(status, 408 | 424 | 500..=599)
}

fn outcome_requires_redelivery(outcome: &CollectedOutcome) -> bool {
    // unclassified errors carry no status and are always retried
    outcome.status().map_or(true, requires_redelivery)
}

/// Decide the fate of an inbound message from its collected acknowledgements
pub fn decide(output: &CollectorOutput) -> DeliveryOutcome {
    let failures: Vec<&CollectedOutcome> =
        output.collected.iter().filter(|o| o.is_failure()).collect();
    let count_matched = output.expected_count == Some(output.collected.len());

    if count_matched && failures.is_empty() {
        return DeliveryOutcome::Settle;
    }

    if !failures.is_empty() {
        let redeliver = failures.iter().any(|f| outcome_requires_redelivery(f));
        debug!(
            correlation_id = %output.correlation_id,
            failures = failures.len(),
            redeliver,
            "Rejecting message with failed acknowledgements"
        );
        return DeliveryOutcome::Reject { redeliver };
    }

    warn!(
        correlation_id = %output.correlation_id,
        expected = ?output.expected_count,
        collected = output.collected.len(),
        "Acknowledgement count mismatch without failures, requesting redelivery"
    );
    DeliveryOutcome::Reject { redeliver: true }
}

/// Decide the fate of a message whose processing raised an error
pub fn decide_on_error(err: &ProcessingError) -> DeliveryOutcome {
    match err.status {
        Some(PRECONDITION_FAILED) => DeliveryOutcome::Settle,
        Some(status) => DeliveryOutcome::Reject {
            redeliver: requires_redelivery(status),
        },
        None => DeliveryOutcome::Reject { redeliver: true },
    }
}
