//! Pairwise session key derivation: X25519 followed by HKDF-SHA256.

use hkdf::Hkdf;
use sha2::Sha256;
use subtle::ConstantTimeEq;
use x25519_dalek::PublicKey;
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::error::CryptoError;
use crate::identity::{public_key_from_base64, KeyPair, KEY_LEN};

/// Domain-separation label for the message key.
const HKDF_INFO: &[u8] = b"duet/e2e/v1 aes-256-gcm message key";

/// Fixed all-zero salt.
const HKDF_SALT: [u8; 32] = [0u8; 32];

/// A 32-byte AES-256 key shared by exactly two peers.
///
/// Derived at session start and dropped with the session; never stored.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct SharedSecret([u8; 32]);

impl SharedSecret {
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl PartialEq for SharedSecret {
    fn eq(&self, other: &Self) -> bool {
        self.0[..].ct_eq(&other.0[..]).into()
    }
}

impl Eq for SharedSecret {}

impl std::fmt::Debug for SharedSecret {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("SharedSecret([REDACTED])")
    }
}

/// Derive the session key between our keypair and a peer's public key.
///
/// Both sides obtain the same key. Fails with `InvalidKey` for keys of the
/// wrong length and for low-order points that would force a predictable
/// shared value.
pub fn derive(local: &KeyPair, peer_public: &[u8]) -> Result<SharedSecret, CryptoError> {
    let peer: [u8; KEY_LEN] = peer_public.try_into().map_err(|_| {
        CryptoError::InvalidKey(format!(
            "peer public key has {} bytes, expected {KEY_LEN}",
            peer_public.len()
        ))
    })?;

    let shared = local.secret().diffie_hellman(&PublicKey::from(peer));
    if !shared.was_contributory() {
        return Err(CryptoError::InvalidKey(
            "peer public key is a low-order point".into(),
        ));
    }

    let hk = Hkdf::<Sha256>::new(Some(&HKDF_SALT), shared.as_bytes());
    let mut key = [0u8; 32];
    hk.expand(HKDF_INFO, &mut key)
        .expect("32 bytes is a valid HKDF-SHA256 output length");
    let secret = SharedSecret(key);
    key.zeroize();
    Ok(secret)
}

/// [`derive`] from the base64 form published in the directory.
pub fn derive_from_base64(
    local: &KeyPair,
    peer_public_b64: &str,
) -> Result<SharedSecret, CryptoError> {
    let peer = public_key_from_base64(peer_public_b64)?;
    derive(local, &peer)
}
