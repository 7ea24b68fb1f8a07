//! Shared wire types for Duet: peer identities, signaling envelopes and their
//! relay-side validation, the encrypted chat frame format, and the relay
//! control protocol.

pub mod codec;
pub mod error;
pub mod frame;
pub mod messages;
pub mod signaling;
pub mod types;

pub use error::ProtocolError;
pub use frame::{decode_chat_message, encode_chat_message, ChatEnvelope, Frame, IV_LEN};
pub use signaling::{
    validate, PresenceLookup, RawSignal, SignalKind, SignalingMessage, SignalingValidationError,
    SIGNAL_EVENT,
};
pub use types::{PeerId, PeerIdentity, PeerInfo};
