//! Inbound and outbound message dispatch
//!
//! ```text
//! driver ─► InboundIntake ─► throttle ─► mapper ─► platform
//!                                           │
//!                          AcknowledgementCollector ─► decision ─► settle/reject
//!
//! platform ─► mapper ─► PublishCorrelator ─► Publisher ─► acknowledgement
//! ```

pub mod intake;
pub mod pipeline;
pub mod throttle;

use crate::ack::{CollectorHandle, DeliveryOutcome};
use crate::core::errors::ProcessingError;
use crate::core::message::{
    CorrelationMeta, ExternalMessage, MappedSignal, OutboundMessage, OutboundSignal,
};
use crate::core::types::TargetSpec;

pub use intake::{InboundIntake, IntakeWorker};
pub use pipeline::{DispatchPipeline, PipelineSettings};
pub use throttle::{IntakeThrottle, ThrottleConfig};

/// Payload mapping collaborator
pub trait MessageMapper: Send + Sync {
    /// Map one external message to zero or more signals or mapping errors
    fn map_inbound(
        &self,
        message: &ExternalMessage,
        meta: &CorrelationMeta,
    ) -> Vec<Result<MappedSignal, ProcessingError>>;

    /// Map one signal to the messages published through `targets`
    fn map_outbound(&self, signal: &OutboundSignal, targets: &[TargetSpec]) -> Vec<OutboundMessage>;
}

/// Settle/reject capability of one consumed message
pub trait Settlement: Send {
    fn settle(self: Box<Self>);
    fn reject(self: Box<Self>, redeliver: bool);
}

/// Hand a delivery outcome to the source
pub fn apply_outcome(settlement: Box<dyn Settlement>, outcome: DeliveryOutcome) {
    match outcome {
        DeliveryOutcome::Settle => settlement.settle(),
        DeliveryOutcome::Reject { redeliver } => settlement.reject(redeliver),
    }
}

/// A consumed message awaiting dispatch
pub struct InboundMessage {
    pub message: ExternalMessage,
    pub settlement: Box<dyn Settlement>,
}

impl std::fmt::Debug for InboundMessage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InboundMessage")
            .field("message", &self.message)
            .finish_non_exhaustive()
    }
}

/// A mapped signal handed to the platform.
///
/// When the signal requested acknowledgements, `acknowledgements` is the
/// collector its responses must reach (directly, or through
/// [`DispatchPipeline::route_acknowledgement`]).
#[derive(Debug)]
pub struct ForwardedSignal {
    pub signal: MappedSignal,
    pub acknowledgements: Option<CollectorHandle>,
}
