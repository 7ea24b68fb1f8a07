use serde::{Deserialize, Serialize};

use crate::signaling::{RawSignal, SignalingMessage, SignalingValidationError};
use crate::types::*;

/// Messages sent from a client to the relay over the TLS control channel.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum ClientMessage {
    /// Initial authentication. Sent immediately after the TLS handshake.
    Authenticate {
        peer_id: PeerId,
        username: String,
        /// Base64 X25519 public key published to the directory.
        #[serde(default)]
        public_key: Option<String>,
        /// Protocol version for forward compatibility.
        protocol_version: u32,
    },

    /// Start receiving messages published on `channel`.
    Subscribe { channel: PeerId },

    /// Stop receiving messages published on `channel`.
    Unsubscribe { channel: PeerId },

    /// Publish a signaling message on the caller's own channel.
    Publish {
        /// Echoed back in the accept/reject reply.
        request_id: u32,
        channel: PeerId,
        event: String,
        signal: RawSignal,
    },

    /// Request the current directory snapshot.
    RequestPeerList,

    /// Ping for latency measurement.
    Ping { timestamp: u64 },

    /// Client is disconnecting gracefully.
    Disconnect,
}

/// Messages sent from the relay to a client.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum ServerMessage {
    /// Authentication succeeded.
    Authenticated { peer_id: PeerId },

    /// Authentication failed.
    AuthError { reason: String },

    /// Full directory snapshot (sent on connect and on request).
    PeerList { peers: Vec<PeerInfo> },

    /// A peer came online.
    PeerJoined { peer: PeerInfo },

    /// A peer went offline.
    PeerLeft { peer_id: PeerId },

    /// A signaling message delivered on a subscribed channel.
    Signal {
        channel: PeerId,
        event: String,
        message: SignalingMessage,
    },

    /// The publish with this id was validated and routed.
    PublishAccepted { request_id: u32 },

    /// The publish with this id was refused and not forwarded.
    PublishRejected {
        request_id: u32,
        error: SignalingValidationError,
    },

    /// Pong response for latency measurement.
    Pong { timestamp: u64 },
}
