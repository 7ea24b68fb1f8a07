//! Connection-setup messages and the relay-side validation contract.
//!
//! A signaling message is relayed exactly once and never persisted. The relay
//! is otherwise a blind forwarder, so every published message goes through
//! [`validate`] before it is routed anywhere.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::types::PeerId;

/// Event name under which signaling messages travel on a relay channel.
pub const SIGNAL_EVENT: &str = "signal";

/// The three kinds of connection-setup message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SignalKind {
    #[serde(rename = "offer")]
    Offer,
    #[serde(rename = "answer")]
    Answer,
    #[serde(rename = "ice-candidate", alias = "candidate")]
    Candidate,
}

impl SignalKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            SignalKind::Offer => "offer",
            SignalKind::Answer => "answer",
            SignalKind::Candidate => "ice-candidate",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "offer" => Some(SignalKind::Offer),
            "answer" => Some(SignalKind::Answer),
            "ice-candidate" | "candidate" => Some(SignalKind::Candidate),
            _ => None,
        }
    }
}

/// A validated signaling envelope.
///
/// JSON form: `{"type": "offer"|"answer"|"ice-candidate", "from", "to", "payload"}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignalingMessage {
    #[serde(rename = "type")]
    pub kind: SignalKind,
    pub from: PeerId,
    pub to: PeerId,
    /// Opaque transport payload (SDP or candidate), passed through untouched.
    pub payload: String,
}

/// A signaling envelope exactly as a client submitted it, before validation.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawSignal {
    #[serde(rename = "type", default)]
    pub kind: Option<String>,
    #[serde(default)]
    pub from: Option<String>,
    #[serde(default)]
    pub to: Option<String>,
    #[serde(default)]
    pub payload: Option<String>,
}

impl From<&SignalingMessage> for RawSignal {
    fn from(msg: &SignalingMessage) -> Self {
        Self {
            kind: Some(msg.kind.as_str().to_string()),
            from: Some(msg.from.as_str().to_string()),
            to: Some(msg.to.as_str().to_string()),
            payload: Some(msg.payload.clone()),
        }
    }
}

/// Reasons the relay refuses to forward a signaling message.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
pub enum SignalingValidationError {
    #[error("invalid signaling message format: {0}")]
    InvalidFormat(String),

    #[error("sender does not match the authenticated caller")]
    SenderMismatch,

    #[error("unknown signaling message type: {0}")]
    InvalidType(String),

    #[error("recipient {0} is not online")]
    RecipientNotFound(String),

    #[error("publishing too fast, slow down")]
    RateLimited,
}

/// Read-only presence lookup consulted by [`validate`].
pub trait PresenceLookup {
    /// Whether `peer` is a known directory entry that is currently online.
    fn is_online(&self, peer: &PeerId) -> bool;
}

fn required<'a>(
    value: &'a Option<String>,
    field: &str,
) -> Result<&'a str, SignalingValidationError> {
    match value.as_deref() {
        Some(v) if !v.is_empty() => Ok(v),
        _ => Err(SignalingValidationError::InvalidFormat(format!(
            "missing field `{field}`"
        ))),
    }
}

/// Validate a submitted signaling message on behalf of `caller`.
///
/// Checks run in a fixed order: required fields, sender identity, message
/// type, recipient presence. The first failing check decides the error.
pub fn validate<P>(
    raw: &RawSignal,
    caller: &PeerId,
    presence: &P,
) -> Result<SignalingMessage, SignalingValidationError>
where
    P: PresenceLookup + ?Sized,
{
    let kind = required(&raw.kind, "type")?;
    let from = required(&raw.from, "from")?;
    let to = required(&raw.to, "to")?;
    let payload = required(&raw.payload, "payload")?;

    if from != caller.as_str() {
        return Err(SignalingValidationError::SenderMismatch);
    }

    let kind = SignalKind::parse(kind)
        .ok_or_else(|| SignalingValidationError::InvalidType(kind.to_string()))?;

    let to = PeerId::from(to);
    if !presence.is_online(&to) {
        return Err(SignalingValidationError::RecipientNotFound(to.to_string()));
    }

    Ok(SignalingMessage {
        kind,
        from: caller.clone(),
        to,
        payload: payload.to_string(),
    })
}
