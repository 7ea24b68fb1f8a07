//! The direct peer-to-peer transport, as seen by a session.
//!
//! The transport itself (ICE, DTLS, data channels...) lives outside this
//! crate. A session opens one through a [`TransportConnector`], feeds it the
//! remote signaling it receives, and learns about progress through the
//! [`TransportSink`] it handed over at open time.

use async_trait::async_trait;
use duet_protocol::SignalKind;
use tokio::sync::mpsc;

use crate::error::TransportError;
use crate::session::{Role, SessionEvent};

/// What a transport reports back to its session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    /// Connection-setup data to hand to the remote peer via the relay.
    Signal { kind: SignalKind, payload: String },
    /// The direct channel is established.
    Connected,
    Data(Vec<u8>),
    Closed,
    Error(String),
}

/// Event callback handed to a transport when it is opened.
///
/// Cheap to clone; events sent after the session has ended are discarded.
#[derive(Clone)]
pub struct TransportSink {
    tx: mpsc::UnboundedSender<SessionEvent>,
}

impl TransportSink {
    pub(crate) fn new(tx: mpsc::UnboundedSender<SessionEvent>) -> Self {
        Self { tx }
    }

    fn emit(&self, event: TransportEvent) {
        let _ = self.tx.send(SessionEvent::Transport(event));
    }

    pub fn signal(&self, kind: SignalKind, payload: impl Into<String>) {
        self.emit(TransportEvent::Signal {
            kind,
            payload: payload.into(),
        });
    }

    pub fn connected(&self) {
        self.emit(TransportEvent::Connected);
    }

    pub fn data(&self, bytes: impl Into<Vec<u8>>) {
        self.emit(TransportEvent::Data(bytes.into()));
    }

    pub fn closed(&self) {
        self.emit(TransportEvent::Closed);
    }

    pub fn error(&self, reason: impl Into<String>) {
        self.emit(TransportEvent::Error(reason.into()));
    }

    /// True once the owning session is gone.
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

#[async_trait]
pub trait Transport: Send {
    /// Apply a signaling message received from the remote peer.
    async fn accept_signal(&mut self, kind: SignalKind, payload: &str)
        -> Result<(), TransportError>;

    /// Send one application message over the established channel.
    async fn send(&mut self, data: &[u8]) -> Result<(), TransportError>;

    async fn close(&mut self);
}

#[async_trait]
pub trait TransportConnector: Send + Sync {
    /// Start a transport in `role`. An initiator is expected to emit its
    /// offer through `sink` shortly after opening.
    async fn open(
        &self,
        role: Role,
        sink: TransportSink,
    ) -> Result<Box<dyn Transport>, TransportError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sink_wraps_events() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let sink = TransportSink::new(tx);
        sink.signal(SignalKind::Offer, "v=0");
        sink.connected();
        sink.data(vec![1, 2, 3]);

        let mut got = Vec::new();
        while let Ok(SessionEvent::Transport(event)) = rx.try_recv() {
            got.push(event);
        }
        assert_eq!(
            got,
            vec![
                TransportEvent::Signal {
                    kind: SignalKind::Offer,
                    payload: "v=0".into()
                },
                TransportEvent::Connected,
                TransportEvent::Data(vec![1, 2, 3]),
            ]
        );
    }

    #[test]
    fn sink_survives_dropped_session() {
        let (tx, rx) = mpsc::unbounded_channel();
        let sink = TransportSink::new(tx);
        drop(rx);
        assert!(sink.is_closed());
        sink.error("late");
    }
}
