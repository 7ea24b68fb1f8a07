//! Device keypair generation and its storage form.
//!
//! Each device has one long-term X25519 keypair, generated on first launch
//! and kept in local storage. Only the public half ever leaves the device.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};
use x25519_dalek::{PublicKey, StaticSecret};
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::error::CryptoError;

/// X25519 key length, public and private.
pub const KEY_LEN: usize = 32;

/// A device's X25519 keypair.
#[derive(Clone)]
pub struct KeyPair {
    secret: StaticSecret,
    public: PublicKey,
}

impl std::fmt::Debug for KeyPair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyPair")
            .field("public", &self.public_key_base64())
            .field("secret", &"[REDACTED]")
            .finish()
    }
}

impl KeyPair {
    /// Generate a fresh keypair from the OS CSPRNG.
    pub fn generate() -> Self {
        let secret = StaticSecret::random_from_rng(OsRng);
        let public = PublicKey::from(&secret);
        Self { secret, public }
    }

    /// Rebuild a keypair from its private half.
    pub fn from_private_bytes(bytes: [u8; KEY_LEN]) -> Self {
        let secret = StaticSecret::from(bytes);
        let public = PublicKey::from(&secret);
        Self { secret, public }
    }

    pub fn public_key_bytes(&self) -> [u8; KEY_LEN] {
        *self.public.as_bytes()
    }

    /// The public key in the form published to the directory.
    pub fn public_key_base64(&self) -> String {
        BASE64.encode(self.public.as_bytes())
    }

    pub(crate) fn secret(&self) -> &StaticSecret {
        &self.secret
    }

    pub fn to_stored(&self) -> StoredKeyPair {
        StoredKeyPair {
            public_key: self.public.as_bytes().to_vec(),
            private_key: self.secret.to_bytes().to_vec(),
        }
    }

    /// Restore from storage, checking lengths and that both halves belong together.
    pub fn from_stored(stored: &StoredKeyPair) -> Result<Self, CryptoError> {
        let mut private: [u8; KEY_LEN] =
            stored.private_key.as_slice().try_into().map_err(|_| {
                CryptoError::KeyStorage(format!(
                    "stored private key has {} bytes, expected {KEY_LEN}",
                    stored.private_key.len()
                ))
            })?;
        let pair = Self::from_private_bytes(private);
        private.zeroize();

        if stored.public_key.as_slice() != pair.public.as_bytes() {
            return Err(CryptoError::KeyStorage(
                "stored public key does not match private key".into(),
            ));
        }
        Ok(pair)
    }
}

/// The persisted form of a [`KeyPair`]: both halves as arrays of integers.
#[derive(Clone, Serialize, Deserialize, Zeroize, ZeroizeOnDrop)]
#[serde(rename_all = "camelCase")]
pub struct StoredKeyPair {
    pub public_key: Vec<u8>,
    pub private_key: Vec<u8>,
}

/// Decode a directory-published public key.
pub fn public_key_from_base64(encoded: &str) -> Result<[u8; KEY_LEN], CryptoError> {
    let bytes = BASE64
        .decode(encoded.trim())
        .map_err(|e| CryptoError::InvalidKey(format!("public key is not valid base64: {e}")))?;
    bytes.as_slice().try_into().map_err(|_| {
        CryptoError::InvalidKey(format!(
            "public key has {} bytes, expected {KEY_LEN}",
            bytes.len()
        ))
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generate_and_restore() {
        let pair = KeyPair::generate();
        let restored = KeyPair::from_stored(&pair.to_stored()).unwrap();
        assert_eq!(pair.public_key_bytes(), restored.public_key_bytes());
    }

    #[test]
    fn fresh_pairs_differ() {
        assert_ne!(
            KeyPair::generate().public_key_bytes(),
            KeyPair::generate().public_key_bytes()
        );
    }

    #[test]
    fn stored_form_is_integer_arrays() {
        let pair = KeyPair::generate();
        let json: serde_json::Value = serde_json::to_value(pair.to_stored()).unwrap();
        let public = json["publicKey"].as_array().unwrap();
        let private = json["privateKey"].as_array().unwrap();
        assert_eq!(public.len(), KEY_LEN);
        assert_eq!(private.len(), KEY_LEN);
        assert!(public.iter().all(|v| v.as_u64().is_some_and(|b| b <= 255)));
    }

    #[test]
    fn mismatched_halves_rejected() {
        let mut stored = KeyPair::generate().to_stored();
        stored.public_key = KeyPair::generate().public_key_bytes().to_vec();
        assert!(matches!(
            KeyPair::from_stored(&stored),
            Err(CryptoError::KeyStorage(_))
        ));
    }

    #[test]
    fn truncated_private_key_rejected() {
        let mut stored = KeyPair::generate().to_stored();
        stored.private_key.truncate(16);
        assert!(matches!(
            KeyPair::from_stored(&stored),
            Err(CryptoError::KeyStorage(_))
        ));
    }

    #[test]
    fn public_key_base64_roundtrip() {
        let pair = KeyPair::generate();
        let decoded = public_key_from_base64(&pair.public_key_base64()).unwrap();
        assert_eq!(decoded, pair.public_key_bytes());
    }

    #[test]
    fn debug_redacts_secret() {
        let pair = KeyPair::generate();
        let dbg = format!("{pair:?}");
        assert!(dbg.contains("REDACTED"));
        assert!(dbg.contains(&pair.public_key_base64()));
    }

    #[test]
    fn bad_public_key_encodings() {
        assert!(matches!(
            public_key_from_base64("not base64!"),
            Err(CryptoError::InvalidKey(_))
        ));
        assert!(matches!(
            public_key_from_base64(&BASE64.encode([1u8; 31])),
            Err(CryptoError::InvalidKey(_))
        ));
    }
}
