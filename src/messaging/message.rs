//! Result messages and acknowledgement plumbing

use serde::{Deserialize, Serialize};
use std::fmt;
use tokio::sync::oneshot;

use crate::error::{CoordinationError, CoordinationResult};

/// One batch of query results
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResultMessage {
    pub id: String,
    pub payload: Option<serde_json::Value>,
}

impl ResultMessage {
    pub fn new(id: impl Into<String>, payload: serde_json::Value) -> Self {
        Self {
            id: id.into(),
            payload: Some(payload),
        }
    }

    /// A result without payload
    pub fn empty(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            payload: None,
        }
    }
}

/// Consumer verdict on a delivered result
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Acknowledgement {
    /// Consumed; the transport may advance past it
    Ack,
    /// Not consumed; redeliver
    Nack,
    /// Not consumable; do not redeliver
    Reject,
}

impl fmt::Display for Acknowledgement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Ack => write!(f, "ack"),
            Self::Nack => write!(f, "nack"),
            Self::Reject => write!(f, "reject"),
        }
    }
}

/// Single-use acknowledgement callback. Dropping it unanswered counts as a
/// NACK, so an abandoned result is always redelivered.
#[derive(Debug)]
pub struct AckHandle {
    sender: Option<oneshot::Sender<Acknowledgement>>,
}

impl AckHandle {
    pub(crate) fn new() -> (Self, oneshot::Receiver<Acknowledgement>) {
        let (tx, rx) = oneshot::channel();
        (Self { sender: Some(tx) }, rx)
    }

    pub fn acknowledge(mut self, ack: Acknowledgement) {
        if let Some(sender) = self.sender.take() {
            let _ = sender.send(ack);
        }
    }
}

impl Drop for AckHandle {
    fn drop(&mut self) {
        if let Some(sender) = self.sender.take() {
            let _ = sender.send(Acknowledgement::Nack);
        }
    }
}

/// A result handed to a consumer together with its acknowledgement callback
#[derive(Debug)]
pub struct ReceivedResult {
    message: ResultMessage,
    handle: AckHandle,
}

impl ReceivedResult {
    pub(crate) fn new(message: ResultMessage, handle: AckHandle) -> Self {
        Self { message, handle }
    }

    pub fn id(&self) -> &str {
        &self.message.id
    }

    pub fn message(&self) -> &ResultMessage {
        &self.message
    }

    pub fn payload(&self) -> Option<&serde_json::Value> {
        self.message.payload.as_ref()
    }

    pub fn acknowledge(self, ack: Acknowledgement) -> ResultMessage {
        self.handle.acknowledge(ack);
        self.message
    }

    /// Commit consumption and take the message
    pub fn ack(self) -> ResultMessage {
        self.acknowledge(Acknowledgement::Ack)
    }

    /// Return the message for redelivery
    pub fn nack(self) {
        self.acknowledge(Acknowledgement::Nack);
    }

    /// Refuse the message without redelivery
    pub fn reject(self) {
        self.acknowledge(Acknowledgement::Reject);
    }
}

/// Wire form of a result. A claim-checked result travels without payload;
/// the payload is fetched from the claim check on receipt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub(crate) struct ResultEnvelope {
    pub id: String,
    pub payload: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub claim_check: bool,
}

impl ResultEnvelope {
    pub fn pointer(id: &str) -> Self {
        Self {
            id: id.to_string(),
            payload: None,
            claim_check: true,
        }
    }
}

pub(crate) fn encode_result(result: &ResultMessage) -> CoordinationResult<Vec<u8>> {
    serde_json::to_vec(result).map_err(|e| CoordinationError::serialization("result", e.to_string()))
}

pub(crate) fn encode_envelope(envelope: &ResultEnvelope) -> CoordinationResult<Vec<u8>> {
    serde_json::to_vec(envelope)
        .map_err(|e| CoordinationError::serialization("result envelope", e.to_string()))
}

pub(crate) fn decode_envelope(bytes: &[u8]) -> CoordinationResult<ResultEnvelope> {
    serde_json::from_slice(bytes)
        .map_err(|e| CoordinationError::serialization("result envelope", e.to_string()))
}

pub(crate) fn decode_result(bytes: &[u8]) -> CoordinationResult<ResultMessage> {
    serde_json::from_slice(bytes).map_err(|e| CoordinationError::serialization("result", e.to_string()))
}
