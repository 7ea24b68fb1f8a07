//! Per-peer connection state machine.
//!
//! A [`ConnectionSession`] walks `Idle → Deriving → Signaling → Connected`
//! and ends in `Closed` or `Failed`. It is owned by a single task; transport
//! callbacks, relayed signals and commands from the [`SessionHandle`] all
//! arrive on one event queue, so counters and transport state need no locks.

use std::collections::VecDeque;
use std::future::Future;
use std::ops::ControlFlow;
use std::sync::Arc;
use std::time::Duration;

use duet_crypto::{derive_from_base64, framer, load_or_generate, KeyStore, SharedSecret};
use duet_protocol::{decode_chat_message, encode_chat_message, PeerId, PeerIdentity, SignalingMessage};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::{SessionError, SignalingError, TransportError};
use crate::signaling::SignalingRelay;
use crate::transcript::{Author, Transcript, TranscriptEntry};
use crate::transport::{Transport, TransportConnector, TransportEvent, TransportSink};

/// Which side drives connection setup.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Role {
    Initiator,
    Responder,
}

impl Role {
    /// The lexicographically lower identity initiates. Both sides compute
    /// the same answer independently.
    pub fn for_pair(local: &PeerId, peer: &PeerId) -> Self {
        if local < peer {
            Role::Initiator
        } else {
            Role::Responder
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    Deriving,
    Signaling,
    Connected,
    Closed,
    Failed,
}

impl SessionState {
    pub fn is_terminal(self) -> bool {
        matches!(self, SessionState::Closed | SessionState::Failed)
    }
}

/// Everything a session reacts to.
#[derive(Debug)]
pub enum SessionEvent {
    Transport(TransportEvent),
    /// Remote signaling relayed from the peer's channel.
    Signal(SignalingMessage),
    /// The relay subscription ended.
    SignalingEnded,
    Send {
        text: String,
        reply: oneshot::Sender<bool>,
    },
    Close,
}

#[derive(Debug, Clone, Default)]
pub struct SessionConfig {
    /// Fail the session if it is still signaling after this long.
    pub signaling_timeout: Option<Duration>,
}

/// External collaborators of a session.
#[derive(Clone)]
pub struct SessionDeps {
    pub keystore: Arc<dyn KeyStore>,
    pub relay: Arc<dyn SignalingRelay>,
    pub connector: Arc<dyn TransportConnector>,
}

pub struct ConnectionSession {
    local: PeerId,
    peer: PeerIdentity,
    role: Role,
    deps: SessionDeps,
    config: SessionConfig,

    state: SessionState,
    state_tx: watch::Sender<SessionState>,
    events_tx: mpsc::UnboundedSender<SessionEvent>,
    events_rx: mpsc::UnboundedReceiver<SessionEvent>,
    /// Events that arrived while setup was still in progress.
    backlog: VecDeque<SessionEvent>,
    /// Set on entering `Signaling` when a signaling timeout is configured.
    signaling_deadline: Option<(Instant, Duration)>,
    transcript_tx: mpsc::UnboundedSender<TranscriptEntry>,
    transcript: Transcript,

    secret: Option<SharedSecret>,
    transport: Option<Box<dyn Transport>>,
    forwarder: Option<JoinHandle<()>>,
    /// Sequence number for the next outgoing frame.
    outgoing: u64,
    /// Sequence number the next inbound frame must carry.
    expected: u64,
}

impl ConnectionSession {
    /// Build an idle session with `peer`, as the identity `deps.relay` is
    /// authenticated as. Nothing is acquired until [`run`](Self::run).
    pub fn new(
        peer: PeerIdentity,
        deps: SessionDeps,
        config: SessionConfig,
    ) -> Result<(Self, SessionHandle), SessionError> {
        let local = deps.relay.local_id().clone();
        if local == peer.id {
            return Err(SessionError::SelfConversation(local));
        }

        let role = Role::for_pair(&local, &peer.id);
        let (state_tx, state_rx) = watch::channel(SessionState::Idle);
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (transcript_tx, transcript_rx) = mpsc::unbounded_channel();

        let handle = SessionHandle {
            peer: peer.id.clone(),
            events: events_tx.clone(),
            state: state_rx,
            transcript: transcript_rx,
            task: None,
        };
        let session = Self {
            local,
            peer,
            role,
            deps,
            config,
            state: SessionState::Idle,
            state_tx,
            events_tx,
            events_rx,
            backlog: VecDeque::new(),
            signaling_deadline: None,
            transcript_tx,
            transcript: Transcript::new(),
            secret: None,
            transport: None,
            forwarder: None,
            outgoing: 0,
            expected: 0,
        };
        Ok((session, handle))
    }

    /// [`new`](Self::new) and run the session on its own task.
    pub fn spawn(
        peer: PeerIdentity,
        deps: SessionDeps,
        config: SessionConfig,
    ) -> Result<SessionHandle, SessionError> {
        let (session, mut handle) = Self::new(peer, deps, config)?;
        handle.task = Some(tokio::spawn(session.run()));
        Ok(handle)
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Drive the session to completion.
    ///
    /// Returns the transcript when the session closes normally and the
    /// cause when it fails. Resources are released either way.
    pub async fn run(mut self) -> Result<Transcript, SessionError> {
        let result = match self.start().await {
            Ok(ControlFlow::Continue(())) => self.event_loop().await,
            Ok(ControlFlow::Break(())) => {
                debug!(peer = %self.peer.id, "session closed during setup");
                Ok(())
            }
            Err(e) => Err(e),
        };
        self.teardown().await;

        match result {
            Ok(()) => {
                info!(peer = %self.peer.id, messages = self.transcript.len(), "session closed");
                self.set_state(SessionState::Closed);
                Ok(self.transcript)
            }
            Err(e) => {
                warn!(peer = %self.peer.id, error = %e, "session failed");
                self.set_state(SessionState::Failed);
                Err(e)
            }
        }
    }

    /// Acquire the secret, the subscription and the transport. Breaks if
    /// the session is closed before setup completes.
    async fn start(&mut self) -> Result<ControlFlow<()>, SessionError> {
        self.set_state(SessionState::Deriving);
        let keystore = self.deps.keystore.clone();
        let loaded = until_closed(
            &mut self.events_rx,
            &mut self.backlog,
            None,
            load_or_generate(keystore.as_ref()),
        )
        .await?;
        let ControlFlow::Continue(pair) = loaded else {
            return Ok(ControlFlow::Break(()));
        };
        let pair = pair?;
        let peer_key = self
            .peer
            .public_key
            .as_deref()
            .ok_or_else(|| SessionError::MissingPublicKey(self.peer.id.clone()))?;
        self.secret = Some(derive_from_base64(&pair, peer_key)?);
        drop(pair);

        let relay = self.deps.relay.clone();
        let subscribed = until_closed(
            &mut self.events_rx,
            &mut self.backlog,
            None,
            relay.subscribe(&self.peer.id),
        )
        .await?;
        let ControlFlow::Continue(subscription) = subscribed else {
            return Ok(ControlFlow::Break(()));
        };
        let mut subscription = subscription?;
        let tx = self.events_tx.clone();
        let peer = self.peer.id.clone();
        self.forwarder = Some(tokio::spawn(async move {
            while let Some(message) = subscription.next().await {
                if message.from != peer {
                    debug!(from = %message.from, "ignoring signal from unexpected sender");
                    continue;
                }
                if tx.send(SessionEvent::Signal(message)).is_err() {
                    return;
                }
            }
            let _ = tx.send(SessionEvent::SignalingEnded);
        }));
        self.set_state(SessionState::Signaling);
        self.signaling_deadline = self
            .config
            .signaling_timeout
            .map(|timeout| (Instant::now() + timeout, timeout));

        info!(local = %self.local, peer = %self.peer.id, role = ?self.role, "opening transport");
        let sink = TransportSink::new(self.events_tx.clone());
        let connector = self.deps.connector.clone();
        let opened = until_closed(
            &mut self.events_rx,
            &mut self.backlog,
            self.signaling_deadline,
            connector.open(self.role, sink),
        )
        .await?;
        let ControlFlow::Continue(transport) = opened else {
            return Ok(ControlFlow::Break(()));
        };
        self.transport = Some(transport?);
        Ok(ControlFlow::Continue(()))
    }

    async fn event_loop(&mut self) -> Result<(), SessionError> {
        loop {
            let event = match (self.backlog.pop_front(), self.signaling_deadline) {
                (Some(event), _) => Some(event),
                (None, Some((at, timeout))) if self.state == SessionState::Signaling => {
                    match tokio::time::timeout_at(at, self.events_rx.recv()).await {
                        Ok(event) => event,
                        Err(_) => return Err(SessionError::SignalingTimeout(timeout)),
                    }
                }
                (None, _) => self.events_rx.recv().await,
            };
            let Some(event) = event else {
                return Ok(());
            };
            if let ControlFlow::Break(()) = self.handle_event(event).await? {
                return Ok(());
            }
        }
    }

    async fn handle_event(&mut self, event: SessionEvent) -> Result<ControlFlow<()>, SessionError> {
        match event {
            SessionEvent::Transport(TransportEvent::Signal { kind, payload }) => {
                let message = SignalingMessage {
                    kind,
                    from: self.local.clone(),
                    to: self.peer.id.clone(),
                    payload,
                };
                debug!(peer = %self.peer.id, kind = kind.as_str(), "publishing local signal");
                self.deps.relay.publish(message).await?;
            }
            SessionEvent::Transport(TransportEvent::Connected) => {
                if self.state == SessionState::Signaling {
                    self.outgoing = 0;
                    self.expected = 0;
                    self.set_state(SessionState::Connected);
                    info!(peer = %self.peer.id, "direct channel established");
                }
            }
            SessionEvent::Transport(TransportEvent::Data(bytes)) => self.receive(&bytes),
            SessionEvent::Transport(TransportEvent::Closed) => {
                debug!(peer = %self.peer.id, "transport closed");
                return Ok(ControlFlow::Break(()));
            }
            SessionEvent::Transport(TransportEvent::Error(reason)) => {
                return Err(TransportError::Failed(reason).into());
            }
            SessionEvent::Signal(message) => {
                if let Some(transport) = self.transport.as_mut() {
                    transport.accept_signal(message.kind, &message.payload).await?;
                }
            }
            SessionEvent::SignalingEnded => {
                if self.state == SessionState::Signaling {
                    return Err(SignalingError::Disconnected.into());
                }
                debug!(peer = %self.peer.id, "signaling subscription ended");
            }
            SessionEvent::Send { text, reply } => {
                let sent = self.send(&text).await?;
                let _ = reply.send(sent);
            }
            SessionEvent::Close => return Ok(ControlFlow::Break(())),
        }
        Ok(ControlFlow::Continue(()))
    }

    /// Encrypt and transmit one message. A no-op returning `false` unless
    /// the session is connected.
    async fn send(&mut self, text: &str) -> Result<bool, SessionError> {
        if self.state != SessionState::Connected {
            debug!(state = ?self.state, "send ignored, not connected");
            return Ok(false);
        }
        let (Some(secret), Some(transport)) = (self.secret.as_ref(), self.transport.as_mut()) else {
            return Ok(false);
        };

        let frame = framer::encrypt(text, secret, self.outgoing)?;
        let wire = encode_chat_message(&frame)?;
        transport.send(&wire).await?;
        self.outgoing += 1;

        self.record(Author::Local, Uuid::new_v4(), text.to_string(), frame.sequence, frame.timestamp);
        Ok(true)
    }

    /// Inbound frames that fail any check are dropped; the transcript and
    /// the expected counter stay as they were.
    fn receive(&mut self, bytes: &[u8]) {
        if self.state != SessionState::Connected {
            debug!(state = ?self.state, "dropping data received before connect");
            return;
        }
        let Some(secret) = self.secret.as_ref() else {
            return;
        };

        let (envelope, frame) = match decode_chat_message(bytes) {
            Ok(decoded) => decoded,
            Err(e) => {
                warn!(peer = %self.peer.id, error = %e, "dropping undecodable message");
                return;
            }
        };

        match framer::decrypt(&frame, secret, self.expected) {
            Ok(payload) => {
                self.expected += 1;
                self.record(
                    Author::Peer,
                    envelope.id,
                    payload.text,
                    payload.sequence_number,
                    payload.timestamp,
                );
            }
            Err(e) => {
                warn!(peer = %self.peer.id, sequence = frame.sequence, error = %e, "dropping inbound frame");
            }
        }
    }

    fn record(&mut self, author: Author, id: Uuid, text: String, sequence: u64, timestamp: u64) {
        let entry = TranscriptEntry {
            id,
            author,
            text,
            sequence,
            timestamp,
        };
        let _ = self.transcript_tx.send(entry.clone());
        self.transcript.push(entry);
    }

    fn set_state(&mut self, state: SessionState) {
        if self.state != state {
            debug!(peer = %self.peer.id, from = ?self.state, to = ?state, "session state");
        }
        self.state = state;
        self.state_tx.send_replace(state);
    }

    async fn teardown(&mut self) {
        if let Some(forwarder) = self.forwarder.take() {
            forwarder.abort();
            // Wait for the subscription inside it to be released.
            let _ = forwarder.await;
        }
        if let Some(mut transport) = self.transport.take() {
            transport.close().await;
        }
        self.secret = None;
    }
}

/// Await `work` unless a `Close` arrives or `deadline` passes first. Any
/// other event is parked in `backlog`. Dropping `work` cancels it.
async fn until_closed<T>(
    events: &mut mpsc::UnboundedReceiver<SessionEvent>,
    backlog: &mut VecDeque<SessionEvent>,
    deadline: Option<(Instant, Duration)>,
    work: impl Future<Output = T>,
) -> Result<ControlFlow<(), T>, SessionError> {
    tokio::pin!(work);
    let expired = async move {
        match deadline {
            Some((at, timeout)) => {
                tokio::time::sleep_until(at).await;
                timeout
            }
            None => std::future::pending().await,
        }
    };
    tokio::pin!(expired);

    loop {
        tokio::select! {
            output = &mut work => return Ok(ControlFlow::Continue(output)),
            event = events.recv() => match event {
                Some(SessionEvent::Close) | None => return Ok(ControlFlow::Break(())),
                Some(event) => backlog.push_back(event),
            },
            timeout = &mut expired => return Err(SessionError::SignalingTimeout(timeout)),
        }
    }
}

/// Control side of a session. Dropping it closes the session.
pub struct SessionHandle {
    peer: PeerId,
    events: mpsc::UnboundedSender<SessionEvent>,
    state: watch::Receiver<SessionState>,
    transcript: mpsc::UnboundedReceiver<TranscriptEntry>,
    task: Option<JoinHandle<Result<Transcript, SessionError>>>,
}

impl SessionHandle {
    pub fn peer(&self) -> &PeerId {
        &self.peer
    }

    /// Queue `text` for sending. `false` if the session was not connected
    /// (the message is dropped) or has ended.
    pub async fn send(&self, text: impl Into<String>) -> bool {
        let (reply, rx) = oneshot::channel();
        let event = SessionEvent::Send {
            text: text.into(),
            reply,
        };
        if self.events.send(event).is_err() {
            return false;
        }
        rx.await.unwrap_or(false)
    }

    pub fn close(&self) {
        let _ = self.events.send(SessionEvent::Close);
    }

    pub fn state(&self) -> SessionState {
        *self.state.borrow()
    }

    pub fn watch_state(&self) -> watch::Receiver<SessionState> {
        self.state.clone()
    }

    /// Wait until the state satisfies `f`, or the session has ended.
    pub async fn wait_for(&mut self, f: impl FnMut(&SessionState) -> bool) -> SessionState {
        let reached = self.state.wait_for(f).await.map(|state| *state);
        match reached {
            Ok(state) => state,
            Err(_) => *self.state.borrow(),
        }
    }

    /// Next transcript entry, local or remote, in the order recorded.
    pub async fn next_entry(&mut self) -> Option<TranscriptEntry> {
        self.transcript.recv().await
    }

    /// Wait for a session started with [`ConnectionSession::spawn`] to end.
    pub async fn join(mut self) -> Result<Transcript, SessionError> {
        match self.task.take() {
            Some(task) => task.await.map_err(|_| SessionError::Aborted)?,
            None => Err(SessionError::Aborted),
        }
    }
}

impl Drop for SessionHandle {
    fn drop(&mut self) {
        let _ = self.events.send(SessionEvent::Close);
    }
}
