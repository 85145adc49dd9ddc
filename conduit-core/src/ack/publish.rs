//! Outbound publish correlation
//!
//! Wraps one publish attempt. A failed publish, or one that finished without
//! the acknowledgement its target is configured to issue, becomes a negative
//! acknowledgement; a successful one is forwarded as-is. Acknowledgement
//! payloads are held to a per-target byte quota.

use super::{Acknowledgement, CollectedOutcome};
use crate::core::errors::{ProcessingError, PublishError};
use crate::core::types::{AckLabel, CorrelationId, TargetSpec};
use serde_json::{json, Value};
use std::future::Future;
use tracing::{debug, warn};

/// Status used when a failure carries none
const DEFAULT_FAILURE_STATUS: u16 = 500;

/// Even share of the acknowledgement payload budget per fan-out target
pub fn quota_per_target(total_quota: usize, fan_out: usize) -> usize {
    total_quota / fan_out.max(1)
}

/// Correlates one publish result with the originating signal
#[derive(Debug, Clone)]
pub struct PublishCorrelator {
    correlation_id: CorrelationId,
    target_address: String,
    auto_ack_label: Option<AckLabel>,
    payload_quota: usize,
}

impl PublishCorrelator {
    pub fn new(correlation_id: CorrelationId, target: &TargetSpec, payload_quota: usize) -> Self {
        Self {
            correlation_id,
            target_address: target.address.clone(),
            auto_ack_label: target.issued_ack_label.clone(),
            payload_quota,
        }
    }

    pub fn auto_ack_label(&self) -> Option<&AckLabel> {
        self.auto_ack_label.as_ref()
    }

    /// Await the publish and translate its result.
    ///
    /// `None` means nothing was expected and nothing arrived.
    pub async fn correlate<F>(self, publish: F) -> Option<CollectedOutcome>
    where
        F: Future<Output = Result<Option<Acknowledgement>, PublishError>>,
    {
        let result = publish.await;
        self.translate(result)
    }

    /// Translate an already completed publish result
    pub fn translate(
        self,
        result: Result<Option<Acknowledgement>, PublishError>,
    ) -> Option<CollectedOutcome> {
        match result {
            Ok(Some(ack)) => Some(CollectedOutcome::Acknowledgement(self.accept(ack))),
            Ok(None) => {
                if self.auto_ack_label.is_none() {
                    return None;
                }
                let err = PublishError::missing_acknowledgement(self.target_address.clone());
                warn!(
                    correlation_id = %self.correlation_id,
                    address = %self.target_address,
                    "Publish finished without the expected acknowledgement"
                );
                Some(CollectedOutcome::Acknowledgement(self.negative(&err)))
            }
            Err(err) => {
                warn!(
                    correlation_id = %self.correlation_id,
                    address = %err.address,
                    error = %err,
                    "Publish failed"
                );
                if self.auto_ack_label.is_some() {
                    Some(CollectedOutcome::Acknowledgement(self.negative(&err)))
                } else {
                    Some(CollectedOutcome::Error(ProcessingError {
                        status: err.status,
                        description: err.to_string(),
                    }))
                }
            }
        }
    }

    fn accept(&self, mut ack: Acknowledgement) -> Acknowledgement {
        if ack.label.is_none() {
            ack.label = self.auto_ack_label.clone();
        }
        if let Some(payload) = ack.payload.take() {
            ack.payload = Some(self.fit_to_quota(payload));
        }
        ack
    }

    fn negative(&self, err: &PublishError) -> Acknowledgement {
        let payload = json!({
            "error": "publish.failed",
            "address": err.address,
            "description": err.description,
        });
        Acknowledgement::new(
            self.auto_ack_label.clone(),
            self.correlation_id.clone(),
            err.status.unwrap_or(DEFAULT_FAILURE_STATUS),
        )
        .with_payload(self.fit_to_quota(payload))
    }

    fn fit_to_quota(&self, payload: Value) -> Value {
        let size = serde_json::to_vec(&payload).map(|bytes| bytes.len()).unwrap_or(0);
        if size <= self.payload_quota {
            return payload;
        }
        debug!(
            correlation_id = %self.correlation_id,
            size,
            quota = self.payload_quota,
            "Acknowledgement payload over quota, replacing"
        );
        Value::String(format!(
            "acknowledgement payload of {size} bytes exceeded the quota of {} bytes",
            self.payload_quota
        ))
    }
}
