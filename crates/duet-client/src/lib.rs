//! Duet client core.
//!
//! Signaling over a relay (TLS or in-process), the transport collaborator
//! interface, and the per-peer [`ConnectionSession`] that ties key
//! derivation, signaling and encrypted framing together.

pub mod config;
pub mod error;
pub mod loopback;
pub mod relay;
pub mod session;
pub mod signaling;
pub mod transcript;
pub mod transport;

pub use config::ClientConfig;
pub use error::{SessionError, SignalingError, TransportError};
pub use loopback::{LoopbackEndpoint, LoopbackRelay};
pub use relay::RelayClient;
pub use session::{
    ConnectionSession, Role, SessionConfig, SessionDeps, SessionEvent, SessionHandle, SessionState,
};
pub use signaling::{SignalingRelay, Subscription};
pub use transcript::{Author, Transcript, TranscriptEntry};
pub use transport::{Transport, TransportConnector, TransportEvent, TransportSink};
