//! Client side of the signaling exchange.
//!
//! Every identity publishes on the relay channel named after itself. To hear
//! from a peer we subscribe to the peer's channel and keep only messages
//! addressed to us.

use async_trait::async_trait;
use duet_protocol::{PeerId, SignalingMessage};
use tokio::sync::mpsc;
use tracing::trace;

use crate::error::SignalingError;

#[async_trait]
pub trait SignalingRelay: Send + Sync {
    /// The identity this relay handle is authenticated as.
    fn local_id(&self) -> &PeerId;

    /// Publish on the channel named by `message.from`.
    ///
    /// Resolves once the relay has accepted or rejected the message.
    async fn publish(&self, message: SignalingMessage) -> Result<(), SignalingError>;

    /// Open the channel named by `peer`, yielding messages addressed to us.
    async fn subscribe(&self, peer: &PeerId) -> Result<Subscription, SignalingError>;
}

/// A live subscription to one relay channel.
///
/// Unbounded and lazy; the relay-side registration is released when this
/// value is dropped.
pub struct Subscription {
    channel: PeerId,
    local: PeerId,
    rx: mpsc::UnboundedReceiver<SignalingMessage>,
    release: Option<Box<dyn FnOnce() + Send>>,
}

impl Subscription {
    pub fn new(
        channel: PeerId,
        local: PeerId,
        rx: mpsc::UnboundedReceiver<SignalingMessage>,
        release: impl FnOnce() + Send + 'static,
    ) -> Self {
        Self {
            channel,
            local,
            rx,
            release: Some(Box::new(release)),
        }
    }

    pub fn channel(&self) -> &PeerId {
        &self.channel
    }

    /// Next message on the channel addressed to the local identity.
    /// `None` once the relay side has gone away.
    pub async fn next(&mut self) -> Option<SignalingMessage> {
        while let Some(msg) = self.rx.recv().await {
            if msg.to == self.local {
                return Some(msg);
            }
            trace!(channel = %self.channel, to = %msg.to, "ignoring signal for another recipient");
        }
        None
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(release) = self.release.take() {
            release();
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;

    use duet_protocol::SignalKind;

    use super::*;

    fn msg(to: &str) -> SignalingMessage {
        SignalingMessage {
            kind: SignalKind::Offer,
            from: "bob".into(),
            to: to.into(),
            payload: format!("for {to}"),
        }
    }

    #[tokio::test]
    async fn filters_by_recipient() {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut sub = Subscription::new("bob".into(), "alice".into(), rx, || {});
        tx.send(msg("carol")).unwrap();
        tx.send(msg("alice")).unwrap();
        drop(tx);

        let got = sub.next().await.unwrap();
        assert_eq!(got.payload, "for alice");
        assert!(sub.next().await.is_none());
    }

    #[tokio::test]
    async fn release_runs_once_on_drop() {
        let released = Arc::new(AtomicBool::new(false));
        let flag = released.clone();
        let (_tx, rx) = mpsc::unbounded_channel();
        let sub = Subscription::new("bob".into(), "alice".into(), rx, move || {
            assert!(!flag.swap(true, Ordering::SeqCst));
        });
        assert_eq!(sub.channel().as_str(), "bob");
        drop(sub);
        assert!(released.load(Ordering::SeqCst));
    }
}
