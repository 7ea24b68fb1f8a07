//! Duet cryptographic layer.
//!
//! This crate provides:
//! - The device X25519 keypair and its local storage
//! - Pairwise session key derivation (X25519 + HKDF-SHA256)
//! - AES-256-GCM message framing with strict sequence checks and a freshness window

pub mod derivation;
pub mod error;
pub mod framer;
pub mod identity;
pub mod persistence;

pub use derivation::{derive, derive_from_base64, SharedSecret};
pub use error::CryptoError;
pub use framer::{decrypt, encrypt, PlaintextPayload, FRESHNESS_WINDOW_MS};
pub use identity::{KeyPair, StoredKeyPair};
pub use persistence::{load_or_generate, FileKeyStore, KeyStore, MemoryKeyStore};
