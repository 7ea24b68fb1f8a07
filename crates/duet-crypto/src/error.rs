use thiserror::Error;

/// Failures of key handling and message framing.
///
/// `KeyStorage` and `InvalidKey` are structural: a session cannot start
/// without a usable key. The frame-level variants only ever cost the frame
/// they were raised for.
#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("key storage error: {0}")]
    KeyStorage(String),

    #[error("invalid key: {0}")]
    InvalidKey(String),

    #[error("authentication failed: frame was tampered with or keyed differently")]
    AuthenticationFailed,

    #[error("sequence mismatch: expected {expected}, got {got}")]
    ReplayOrReorderDetected { expected: u64, got: u64 },

    #[error("stale message: {age_ms} ms old")]
    StaleMessage { age_ms: u64 },

    #[error("malformed frame: {0}")]
    MalformedFrame(String),

    #[error("encryption failed")]
    EncryptionFailed,

    #[error("system RNG failed")]
    Rng,
}

impl CryptoError {
    /// Whether this error only invalidates a single frame, leaving the
    /// session usable.
    pub fn is_frame_local(&self) -> bool {
        matches!(
            self,
            CryptoError::AuthenticationFailed
                | CryptoError::ReplayOrReorderDetected { .. }
                | CryptoError::StaleMessage { .. }
                | CryptoError::MalformedFrame(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn replay_display_names_both_counters() {
        let msg = CryptoError::ReplayOrReorderDetected { expected: 4, got: 2 }.to_string();
        assert!(msg.contains('4'));
        assert!(msg.contains('2'));
    }

    #[test]
    fn frame_local_classification() {
        assert!(CryptoError::AuthenticationFailed.is_frame_local());
        assert!(CryptoError::StaleMessage { age_ms: 1 }.is_frame_local());
        assert!(!CryptoError::InvalidKey("x".into()).is_frame_local());
        assert!(!CryptoError::KeyStorage("x".into()).is_frame_local());
    }
}
