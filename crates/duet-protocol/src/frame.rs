//! Wire format for encrypted chat frames on the direct transport.
//!
//! A frame is JSON `{"ciphertext": b64, "iv": b64, "sequence": n, "timestamp": ms}`,
//! carried as a string inside the envelope `{"id": uuid, "text": "...", "timestamp": ms}`.
//! One envelope is one transport message.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::ProtocolError;

/// AES-GCM nonce length.
pub const IV_LEN: usize = 12;

/// One encrypted, sequenced chat message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// AEAD ciphertext with the 16-byte authentication tag appended.
    pub ciphertext: Vec<u8>,
    pub iv: [u8; IV_LEN],
    pub sequence: u64,
    /// Sender clock, milliseconds since the Unix epoch.
    pub timestamp: u64,
}

#[derive(Serialize, Deserialize)]
struct WireFrame {
    ciphertext: String,
    iv: String,
    sequence: u64,
    timestamp: u64,
}

/// Outer envelope sent over the transport.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatEnvelope {
    pub id: Uuid,
    /// The frame, JSON-encoded.
    pub text: String,
    pub timestamp: u64,
}

impl Frame {
    pub fn to_json(&self) -> Result<String, ProtocolError> {
        let wire = WireFrame {
            ciphertext: BASE64.encode(&self.ciphertext),
            iv: BASE64.encode(self.iv),
            sequence: self.sequence,
            timestamp: self.timestamp,
        };
        Ok(serde_json::to_string(&wire)?)
    }

    pub fn from_json(s: &str) -> Result<Self, ProtocolError> {
        let wire: WireFrame = serde_json::from_str(s)?;
        let ciphertext = BASE64
            .decode(&wire.ciphertext)
            .map_err(|source| ProtocolError::Base64 {
                field: "ciphertext",
                source,
            })?;
        let iv_bytes = BASE64
            .decode(&wire.iv)
            .map_err(|source| ProtocolError::Base64 { field: "iv", source })?;
        let iv: [u8; IV_LEN] =
            iv_bytes
                .as_slice()
                .try_into()
                .map_err(|_| ProtocolError::FieldLength {
                    field: "iv",
                    expected: IV_LEN,
                    got: iv_bytes.len(),
                })?;
        Ok(Self {
            ciphertext,
            iv,
            sequence: wire.sequence,
            timestamp: wire.timestamp,
        })
    }
}

/// Wrap a frame in a fresh envelope and serialize it for the transport.
pub fn encode_chat_message(frame: &Frame) -> Result<Vec<u8>, ProtocolError> {
    let envelope = ChatEnvelope {
        id: Uuid::new_v4(),
        text: frame.to_json()?,
        timestamp: frame.timestamp,
    };
    Ok(serde_json::to_vec(&envelope)?)
}

/// Parse transport bytes into the envelope and the frame it carries.
pub fn decode_chat_message(data: &[u8]) -> Result<(ChatEnvelope, Frame), ProtocolError> {
    let envelope: ChatEnvelope = serde_json::from_slice(data)?;
    let frame = Frame::from_json(&envelope.text)?;
    Ok((envelope, frame))
}
