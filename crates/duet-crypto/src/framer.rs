//! AES-256-GCM framing of chat messages with strict in-order replay protection.
//!
//! The authenticated plaintext is the JSON payload
//! `{"text", "sequenceNumber", "timestamp"}`; sequence and timestamp are
//! bound inside the ciphertext rather than passed as associated data, and
//! the outer frame only mirrors them for routing. A frame is accepted only if
//! its inner sequence equals both the outer one and the receiver's expected
//! counter, and it is no older than [`FRESHNESS_WINDOW_MS`].

use std::time::{SystemTime, UNIX_EPOCH};

use duet_protocol::frame::{Frame, IV_LEN};
use ring::aead::{Aad, LessSafeKey, Nonce, UnboundKey, AES_256_GCM};
use ring::rand::{SecureRandom, SystemRandom};
use serde::{Deserialize, Serialize};

use crate::derivation::SharedSecret;
use crate::error::CryptoError;

/// AES-256-GCM authentication tag size.
pub const GCM_TAG_SIZE: usize = 16;

/// Maximum accepted age of a frame.
pub const FRESHNESS_WINDOW_MS: u64 = 300_000;

/// The authenticated content of one frame.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlaintextPayload {
    pub text: String,
    #[serde(rename = "sequenceNumber")]
    pub sequence_number: u64,
    pub timestamp: u64,
}

/// Wall clock in milliseconds since the Unix epoch.
pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

fn aead_key(secret: &SharedSecret) -> Result<LessSafeKey, CryptoError> {
    let unbound = UnboundKey::new(&AES_256_GCM, secret.as_bytes())
        .map_err(|_| CryptoError::InvalidKey("not an AES-256 key".into()))?;
    Ok(LessSafeKey::new(unbound))
}

/// Encrypt `text` as the frame with `sequence`, stamped with the current time.
pub fn encrypt(text: &str, secret: &SharedSecret, sequence: u64) -> Result<Frame, CryptoError> {
    encrypt_at(text, secret, sequence, now_ms())
}

/// [`encrypt`] with an explicit timestamp.
pub fn encrypt_at(
    text: &str,
    secret: &SharedSecret,
    sequence: u64,
    timestamp: u64,
) -> Result<Frame, CryptoError> {
    let payload = PlaintextPayload {
        text: text.to_string(),
        sequence_number: sequence,
        timestamp,
    };
    let mut in_out = serde_json::to_vec(&payload)
        .map_err(|e| CryptoError::MalformedFrame(format!("payload encoding failed: {e}")))?;

    // A fresh random IV per frame; never derived from the sequence.
    let mut iv = [0u8; IV_LEN];
    SystemRandom::new()
        .fill(&mut iv)
        .map_err(|_| CryptoError::Rng)?;

    aead_key(secret)?
        .seal_in_place_append_tag(Nonce::assume_unique_for_key(iv), Aad::empty(), &mut in_out)
        .map_err(|_| CryptoError::EncryptionFailed)?;

    Ok(Frame {
        ciphertext: in_out,
        iv,
        sequence,
        timestamp,
    })
}

/// Decrypt and verify a frame against the receiver's expected sequence.
///
/// On success the caller advances its expected counter by exactly one. On
/// any error the frame must be dropped and the counter left untouched.
pub fn decrypt(
    frame: &Frame,
    secret: &SharedSecret,
    expected_sequence: u64,
) -> Result<PlaintextPayload, CryptoError> {
    decrypt_at(frame, secret, expected_sequence, now_ms())
}

/// [`decrypt`] against an explicit clock.
pub fn decrypt_at(
    frame: &Frame,
    secret: &SharedSecret,
    expected_sequence: u64,
    now: u64,
) -> Result<PlaintextPayload, CryptoError> {
    if frame.ciphertext.len() < GCM_TAG_SIZE {
        return Err(CryptoError::AuthenticationFailed);
    }

    let mut in_out = frame.ciphertext.clone();
    let plaintext = aead_key(secret)?
        .open_in_place(Nonce::assume_unique_for_key(frame.iv), Aad::empty(), &mut in_out)
        .map_err(|_| CryptoError::AuthenticationFailed)?;

    let payload: PlaintextPayload = serde_json::from_slice(plaintext)
        .map_err(|e| CryptoError::MalformedFrame(format!("payload decoding failed: {e}")))?;

    if payload.sequence_number != frame.sequence {
        return Err(CryptoError::ReplayOrReorderDetected {
            expected: frame.sequence,
            got: payload.sequence_number,
        });
    }
    if payload.sequence_number != expected_sequence {
        return Err(CryptoError::ReplayOrReorderDetected {
            expected: expected_sequence,
            got: payload.sequence_number,
        });
    }

    let age_ms = now.saturating_sub(payload.timestamp);
    if age_ms > FRESHNESS_WINDOW_MS {
        return Err(CryptoError::StaleMessage { age_ms });
    }

    Ok(payload)
}
