//! In-process signaling relay.
//!
//! Peers living in the same process (embedded setups, tests) share one
//! [`LoopbackRelay`]; each gets a [`LoopbackEndpoint`] bound to its identity.
//! Published messages go through the same validation as on the relay server
//! and are routed only to the addressed subscriber.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use duet_protocol::{validate, PeerId, PresenceLookup, RawSignal, SignalingMessage};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::error::SignalingError;
use crate::signaling::{SignalingRelay, Subscription};

struct Subscriber {
    id: u64,
    peer: PeerId,
    tx: mpsc::UnboundedSender<SignalingMessage>,
}

#[derive(Default)]
struct Hub {
    online: HashSet<PeerId>,
    channels: HashMap<PeerId, Vec<Subscriber>>,
    next_subscriber_id: u64,
}

impl PresenceLookup for Hub {
    fn is_online(&self, peer: &PeerId) -> bool {
        self.online.contains(peer)
    }
}

#[derive(Clone, Default)]
pub struct LoopbackRelay {
    hub: Arc<Mutex<Hub>>,
}

impl LoopbackRelay {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bring `peer` online and return its relay handle.
    pub fn connect(&self, peer: impl Into<PeerId>) -> LoopbackEndpoint {
        let id = peer.into();
        if let Ok(mut hub) = self.hub.lock() {
            hub.online.insert(id.clone());
        }
        LoopbackEndpoint {
            id,
            relay: self.clone(),
        }
    }

    pub fn is_online(&self, peer: &PeerId) -> bool {
        self.hub.lock().map(|hub| hub.is_online(peer)).unwrap_or(false)
    }

    /// Number of live subscriptions on `channel`.
    pub fn subscriber_count(&self, channel: &PeerId) -> usize {
        self.hub
            .lock()
            .map(|hub| hub.channels.get(channel).map_or(0, Vec::len))
            .unwrap_or(0)
    }

    fn lock(&self) -> Result<MutexGuard<'_, Hub>, SignalingError> {
        self.hub.lock().map_err(|_| SignalingError::Disconnected)
    }
}

/// One peer's connection to a [`LoopbackRelay`]. Goes offline on drop.
pub struct LoopbackEndpoint {
    id: PeerId,
    relay: LoopbackRelay,
}

impl Drop for LoopbackEndpoint {
    fn drop(&mut self) {
        if let Ok(mut hub) = self.relay.hub.lock() {
            hub.online.remove(&self.id);
        }
    }
}

#[async_trait]
impl SignalingRelay for LoopbackEndpoint {
    fn local_id(&self) -> &PeerId {
        &self.id
    }

    async fn publish(&self, message: SignalingMessage) -> Result<(), SignalingError> {
        let mut hub = self.relay.lock()?;
        let checked = match validate(&RawSignal::from(&message), &self.id, &*hub) {
            Ok(checked) => checked,
            Err(e) => {
                warn!(caller = %self.id, error = %e, "signaling message rejected");
                return Err(e.into());
            }
        };

        if let Some(subscribers) = hub.channels.get_mut(&self.id) {
            subscribers.retain(|sub| {
                if sub.peer != checked.to {
                    return true;
                }
                sub.tx.send(checked.clone()).is_ok()
            });
        }
        debug!(from = %checked.from, to = %checked.to, kind = checked.kind.as_str(), "signal relayed");
        Ok(())
    }

    async fn subscribe(&self, peer: &PeerId) -> Result<Subscription, SignalingError> {
        let (tx, rx) = mpsc::unbounded_channel();
        let sub_id = {
            let mut hub = self.relay.lock()?;
            let id = hub.next_subscriber_id;
            hub.next_subscriber_id += 1;
            hub.channels.entry(peer.clone()).or_default().push(Subscriber {
                id,
                peer: self.id.clone(),
                tx,
            });
            id
        };

        let hub = Arc::clone(&self.relay.hub);
        let channel = peer.clone();
        Ok(Subscription::new(peer.clone(), self.id.clone(), rx, move || {
            if let Ok(mut hub) = hub.lock() {
                if let Some(subscribers) = hub.channels.get_mut(&channel) {
                    subscribers.retain(|sub| sub.id != sub_id);
                    if subscribers.is_empty() {
                        hub.channels.remove(&channel);
                    }
                }
            }
        }))
    }
}

#[cfg(test)]
mod tests {
    use duet_protocol::{SignalKind, SignalingValidationError};

    use super::*;

    fn offer(from: &str, to: &str) -> SignalingMessage {
        SignalingMessage {
            kind: SignalKind::Offer,
            from: from.into(),
            to: to.into(),
            payload: "v=0".into(),
        }
    }

    #[tokio::test]
    async fn delivers_to_addressed_subscriber() {
        let relay = LoopbackRelay::new();
        let alice = relay.connect("alice");
        let bob = relay.connect("bob");

        let mut from_alice = bob.subscribe(&"alice".into()).await.unwrap();
        alice.publish(offer("alice", "bob")).await.unwrap();

        let got = from_alice.next().await.unwrap();
        assert_eq!(got, offer("alice", "bob"));
    }

    #[tokio::test]
    async fn spoofed_sender_never_forwarded() {
        let relay = LoopbackRelay::new();
        let _alice = relay.connect("alice");
        let bob = relay.connect("bob");
        let mallory = relay.connect("mallory");

        let mut from_alice = bob.subscribe(&"alice".into()).await.unwrap();
        let err = mallory.publish(offer("alice", "bob")).await.unwrap_err();
        assert!(matches!(
            err,
            SignalingError::Rejected(SignalingValidationError::SenderMismatch)
        ));
        assert!(tokio::time::timeout(std::time::Duration::from_millis(20), from_alice.next())
            .await
            .is_err());
    }

    #[tokio::test]
    async fn offline_recipient_rejected() {
        let relay = LoopbackRelay::new();
        let alice = relay.connect("alice");
        let bob = relay.connect("bob");
        drop(bob);

        let err = alice.publish(offer("alice", "bob")).await.unwrap_err();
        assert!(matches!(
            err,
            SignalingError::Rejected(SignalingValidationError::RecipientNotFound(_))
        ));
    }

    #[tokio::test]
    async fn dropping_subscription_releases_channel() {
        let relay = LoopbackRelay::new();
        let bob = relay.connect("bob");
        let sub = bob.subscribe(&"alice".into()).await.unwrap();
        assert_eq!(relay.subscriber_count(&"alice".into()), 1);
        drop(sub);
        assert_eq!(relay.subscriber_count(&"alice".into()), 0);
    }
}
