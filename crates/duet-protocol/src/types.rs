use std::fmt;

use serde::{Deserialize, Serialize};

/// Maximum length of a peer identifier, in characters.
pub const MAX_PEER_ID_LEN: usize = 64;

/// Stable, opaque identifier of a peer.
///
/// Ordering is plain byte-wise lexicographic order of the underlying string,
/// which both ends of a conversation use to agree on who initiates.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PeerId(String);

impl PeerId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Whether this id is acceptable as an account identity on the relay.
    pub fn is_well_formed(&self) -> bool {
        let count = self.0.chars().count();
        count > 0 && count <= MAX_PEER_ID_LEN && !self.0.chars().any(|c| c.is_control())
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for PeerId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for PeerId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// A directory entry as published by the relay.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerInfo {
    pub peer_id: PeerId,
    pub username: String,
    pub online: bool,
    /// Standard base64 of the peer's 32-byte X25519 public key.
    #[serde(default)]
    pub public_key: Option<String>,
}

/// The read-only view of a remote peer a conversation is started with.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerIdentity {
    pub id: PeerId,
    pub username: String,
    pub public_key: Option<String>,
}

impl From<PeerInfo> for PeerIdentity {
    fn from(info: PeerInfo) -> Self {
        Self {
            id: info.peer_id,
            username: info.username,
            public_key: info.public_key,
        }
    }
}
