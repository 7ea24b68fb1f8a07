use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use duet_protocol::{PeerId, PeerInfo, PresenceLookup};
use tokio::sync::mpsc;

use crate::config::ServerConfig;
use crate::settings::ServerSettings;

/// Simple token-bucket rate limiter.
pub struct RateLimiter {
    tokens: f64,
    max_tokens: f64,
    refill_rate: f64, // tokens per second
    last_refill: Instant,
}

impl RateLimiter {
    pub fn new(max_tokens: f64, refill_rate: f64) -> Self {
        Self {
            tokens: max_tokens,
            max_tokens,
            refill_rate,
            last_refill: Instant::now(),
        }
    }

    /// Try to consume one token. Returns true if allowed, false if rate-limited.
    pub fn try_consume(&mut self) -> bool {
        let now = Instant::now();
        let elapsed = now.duration_since(self.last_refill).as_secs_f64();
        self.tokens = (self.tokens + elapsed * self.refill_rate).min(self.max_tokens);
        self.last_refill = now;

        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            true
        } else {
            false
        }
    }
}

/// One authenticated relay connection.
pub struct PeerSession {
    pub info: PeerInfo,
    /// Distinguishes reconnects of the same identity.
    pub connection_id: u64,
    /// Sender for pushing control messages to this peer's writer task.
    pub tx: mpsc::Sender<Vec<u8>>,
    /// Channels this peer listens on.
    pub subscriptions: HashSet<PeerId>,
    pub publish_rate: RateLimiter,
}

#[derive(Debug, PartialEq, Eq)]
pub enum RegisterError {
    AlreadyOnline,
    Full,
}

/// The shared relay state, designed for concurrent access.
pub struct ServerState {
    /// Online peers, keyed by identity.
    pub peers: DashMap<PeerId, PeerSession>,
    /// Channel name -> identities subscribed to it.
    pub channels: DashMap<PeerId, HashSet<PeerId>>,
    pub max_peers: u32,
    pub settings: ServerSettings,
    next_connection_id: AtomicU64,
}

impl ServerState {
    pub fn new(config: &ServerConfig, settings: ServerSettings) -> Self {
        Self {
            peers: DashMap::new(),
            channels: DashMap::new(),
            max_peers: config.max_peers,
            settings,
            next_connection_id: AtomicU64::new(1),
        }
    }

    pub fn next_connection_id(&self) -> u64 {
        self.next_connection_id.fetch_add(1, Ordering::Relaxed)
    }

    pub fn peer_count(&self) -> usize {
        self.peers.len()
    }

    pub fn new_rate_limiter(&self) -> RateLimiter {
        RateLimiter::new(
            self.settings.publish_burst,
            self.settings.publish_rate_per_sec,
        )
    }

    /// Bring a freshly authenticated peer online.
    pub fn register(&self, session: PeerSession) -> Result<(), RegisterError> {
        if self.peer_count() >= self.max_peers as usize {
            return Err(RegisterError::Full);
        }
        match self.peers.entry(session.info.peer_id.clone()) {
            Entry::Occupied(_) => Err(RegisterError::AlreadyOnline),
            Entry::Vacant(slot) => {
                slot.insert(session);
                Ok(())
            }
        }
    }

    /// Take a peer offline, unless the identity has already been reclaimed
    /// by a newer connection.
    pub fn remove_peer(&self, peer_id: &PeerId, connection_id: u64) -> Option<PeerSession> {
        let (_, session) = self
            .peers
            .remove_if(peer_id, |_, s| s.connection_id == connection_id)?;
        for channel in &session.subscriptions {
            self.drop_subscriber(channel, peer_id);
        }
        Some(session)
    }

    /// Directory snapshot, sorted by identity.
    pub fn peer_list(&self) -> Vec<PeerInfo> {
        let mut list: Vec<PeerInfo> = self.peers.iter().map(|e| e.value().info.clone()).collect();
        list.sort_by(|a, b| a.peer_id.cmp(&b.peer_id));
        list
    }

    pub fn subscribe(&self, channel: &PeerId, subscriber: &PeerId) {
        if let Some(mut session) = self.peers.get_mut(subscriber) {
            session.subscriptions.insert(channel.clone());
        }
        self.channels
            .entry(channel.clone())
            .or_default()
            .insert(subscriber.clone());
    }

    pub fn unsubscribe(&self, channel: &PeerId, subscriber: &PeerId) {
        if let Some(mut session) = self.peers.get_mut(subscriber) {
            session.subscriptions.remove(channel);
        }
        self.drop_subscriber(channel, subscriber);
    }

    fn drop_subscriber(&self, channel: &PeerId, subscriber: &PeerId) {
        if let Some(mut members) = self.channels.get_mut(channel) {
            members.remove(subscriber);
        }
        self.channels.remove_if(channel, |_, members| members.is_empty());
    }

    /// Writer of `recipient`, if it is online and subscribed to `channel`.
    pub fn subscriber_sender(&self, channel: &PeerId, recipient: &PeerId) -> Option<mpsc::Sender<Vec<u8>>> {
        let subscribed = self
            .channels
            .get(channel)
            .is_some_and(|members| members.contains(recipient));
        if !subscribed {
            return None;
        }
        self.peers.get(recipient).map(|s| s.tx.clone())
    }

    /// Writers of every online peer except `exclude`.
    pub fn senders_except(&self, exclude: &PeerId) -> Vec<mpsc::Sender<Vec<u8>>> {
        self.peers
            .iter()
            .filter(|e| e.key() != exclude)
            .map(|e| e.value().tx.clone())
            .collect()
    }

    /// Charge one publish against `peer_id`'s bucket.
    pub fn try_publish(&self, peer_id: &PeerId) -> bool {
        self.peers
            .get_mut(peer_id)
            .is_some_and(|mut s| s.publish_rate.try_consume())
    }
}

impl PresenceLookup for ServerState {
    fn is_online(&self, peer: &PeerId) -> bool {
        self.peers.get(peer).is_some_and(|s| s.info.online)
    }
}
