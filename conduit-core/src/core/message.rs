//! Message shapes exchanged with drivers and the mapping pipeline

use super::types::{AckLabel, CorrelationId, TargetSpec};
use crate::ack::CollectedOutcome;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use tokio::sync::mpsc;

/// Header carrying the correlation id of an inbound message
pub const CORRELATION_ID_HEADER: &str = "correlation-id";

/// A message as received from (or sent to) the external endpoint
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExternalMessage {
    /// Address the message was consumed from
    pub source_address: String,
    pub headers: BTreeMap<String, String>,
    pub payload: Vec<u8>,
}

impl ExternalMessage {
    pub fn new(source_address: impl Into<String>, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            source_address: source_address.into(),
            headers: BTreeMap::new(),
            payload: payload.into(),
        }
    }

    pub fn with_header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(key.into(), value.into());
        self
    }

    pub fn header(&self, key: &str) -> Option<&str> {
        self.headers.get(key).map(String::as_str)
    }
}

/// Correlation data handed to the mapper alongside an inbound message
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CorrelationMeta {
    pub correlation_id: CorrelationId,
    pub source_address: String,
}

impl CorrelationMeta {
    /// Reuse the message's correlation header or mint a fresh id
    pub fn for_message(message: &ExternalMessage) -> Self {
        let correlation_id = message
            .header(CORRELATION_ID_HEADER)
            .map(CorrelationId::new)
            .unwrap_or_else(CorrelationId::random);

        Self {
            correlation_id,
            source_address: message.source_address.clone(),
        }
    }
}

/// Domain signal produced by mapping an inbound message
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MappedSignal {
    pub correlation_id: CorrelationId,
    /// Signal type understood by the platform, e.g. "things.modify"
    pub name: String,
    pub payload: Value,
    /// Acknowledgements the platform must deliver before the message may be settled
    #[serde(default)]
    pub requested_acks: Vec<AckLabel>,
}

/// Domain signal to be published through a connection's targets
#[derive(Debug, Clone)]
pub struct OutboundSignal {
    pub correlation_id: CorrelationId,
    pub name: String,
    pub payload: Value,
    /// Where publish acknowledgements go; `None` discards them
    pub responses: Option<mpsc::UnboundedSender<CollectedOutcome>>,
}

impl OutboundSignal {
    pub fn new(name: impl Into<String>, payload: Value) -> Self {
        Self {
            correlation_id: CorrelationId::random(),
            name: name.into(),
            payload,
            responses: None,
        }
    }

    pub fn with_responses(mut self, responses: mpsc::UnboundedSender<CollectedOutcome>) -> Self {
        self.responses = Some(responses);
        self
    }
}

/// Mapped outbound message ready for the publish step
#[derive(Debug, Clone, PartialEq)]
pub struct OutboundMessage {
    pub correlation_id: CorrelationId,
    pub target: TargetSpec,
    pub headers: BTreeMap<String, String>,
    pub payload: Vec<u8>,
}
