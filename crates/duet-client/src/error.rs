use duet_crypto::CryptoError;
use duet_protocol::{PeerId, ProtocolError, SignalingValidationError};
use thiserror::Error;

/// Failures talking to the signaling relay.
#[derive(Debug, Error)]
pub enum SignalingError {
    /// The relay refused to forward the message.
    #[error("relay rejected signaling message: {0}")]
    Rejected(#[from] SignalingValidationError),

    #[error("relay connection closed")]
    Disconnected,

    #[error("relay authentication failed: {0}")]
    AuthFailed(String),

    #[error("relay protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("relay I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("TLS configuration error: {0}")]
    Tls(String),

    #[error("invalid relay address: {0}")]
    InvalidAddress(String),
}

/// Failures reported by or about the direct transport.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    #[error("transport failed: {0}")]
    Failed(String),

    #[error("transport is closed")]
    Closed,
}

/// Structural failures that end a [`ConnectionSession`](crate::session::ConnectionSession).
#[derive(Debug, Error)]
pub enum SessionError {
    #[error(transparent)]
    Crypto(#[from] CryptoError),

    #[error(transparent)]
    Signaling(#[from] SignalingError),

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error("wire encoding failed: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("cannot open a conversation with yourself ({0})")]
    SelfConversation(PeerId),

    #[error("peer {0} has not published a public key")]
    MissingPublicKey(PeerId),

    #[error("no signaling answer within {0:?}")]
    SignalingTimeout(std::time::Duration),

    #[error("session task ended abnormally")]
    Aborted,
}
