//! TLS connection to the relay server.
//!
//! [`RelayClient`] authenticates once, then runs a writer task fed by a
//! bounded channel and a reader task that resolves publish requests, fans
//! relayed signals out to subscriptions and keeps the directory snapshot.

use std::collections::HashMap;
use std::io::BufReader;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use bytes::BytesMut;
use duet_protocol::codec::{
    decode_server_msg, encode_client_msg, try_decode_frame, PROTOCOL_VERSION,
};
use duet_protocol::messages::{ClientMessage, ServerMessage};
use duet_protocol::{
    PeerId, PeerIdentity, PeerInfo, RawSignal, SignalingMessage, SignalingValidationError,
    SIGNAL_EVENT,
};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio_rustls::TlsConnector;
use tracing::{debug, error, info, trace, warn};

use crate::config::ClientConfig;
use crate::error::SignalingError;
use crate::signaling::{SignalingRelay, Subscription};

/// How long the relay may take to answer our `Authenticate`.
const AUTH_TIMEOUT: Duration = Duration::from_secs(5);

type PublishResult = Result<(), SignalingValidationError>;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// State shared between the client handle and its reader task.
struct Shared {
    pending: Mutex<HashMap<u32, oneshot::Sender<PublishResult>>>,
    subscriptions: Mutex<HashMap<PeerId, Vec<(u64, mpsc::UnboundedSender<SignalingMessage>)>>>,
    peers: watch::Sender<Vec<PeerInfo>>,
    /// Set once the reader is gone. Checked under the `pending` and
    /// `subscriptions` locks so no waiter is registered after shutdown.
    closed: AtomicBool,
}

impl Shared {
    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Wake every waiter with a disconnect and forget the directory.
    fn shut_down(&self) {
        self.closed.store(true, Ordering::Release);
        lock(&self.pending).clear();
        lock(&self.subscriptions).clear();
        self.peers.send_replace(Vec::new());
    }
}

/// Shuts the shared state down when the reader exits, including on abort.
struct ReaderGuard(Arc<Shared>);

impl Drop for ReaderGuard {
    fn drop(&mut self) {
        self.0.shut_down();
    }
}

pub struct RelayClient {
    local: PeerId,
    outbound: mpsc::Sender<Vec<u8>>,
    shared: Arc<Shared>,
    next_request_id: AtomicU32,
    next_subscription_id: AtomicU64,
    reader: JoinHandle<()>,
}

impl RelayClient {
    /// Connect over TLS to the relay named in `config` and authenticate as
    /// `identity`.
    pub async fn connect(config: &ClientConfig, identity: PeerIdentity) -> Result<Self, SignalingError> {
        let (host, port) = parse_address(&config.relay_address)?;

        let tcp_stream = TcpStream::connect((host.as_str(), port)).await?;
        info!(address = %config.relay_address, "TCP connected to relay");

        let tls_config = tls_client_config(config.ca_cert_path.as_deref())?;
        let connector = TlsConnector::from(Arc::new(tls_config));
        let server_name = if let Ok(ip) = host.parse::<std::net::IpAddr>() {
            rustls::pki_types::ServerName::IpAddress(ip.into())
        } else {
            rustls::pki_types::ServerName::try_from(host.clone())
                .map_err(|e| SignalingError::InvalidAddress(format!("{host}: {e}")))?
        };

        let tls_stream = connector.connect(server_name, tcp_stream).await?;
        info!("TLS handshake with relay complete");

        Self::from_stream(tls_stream, identity).await
    }

    /// Authenticate over an already established stream.
    pub async fn from_stream<S>(stream: S, identity: PeerIdentity) -> Result<Self, SignalingError>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let (mut read_half, mut write_half) = tokio::io::split(stream);

        let auth = ClientMessage::Authenticate {
            peer_id: identity.id.clone(),
            username: identity.username.clone(),
            public_key: identity.public_key.clone(),
            protocol_version: PROTOCOL_VERSION,
        };
        write_half.write_all(&encode_client_msg(&auth)?).await?;

        let mut buf = BytesMut::with_capacity(4096);
        let reply = tokio::time::timeout(AUTH_TIMEOUT, read_message(&mut read_half, &mut buf))
            .await
            .map_err(|_| SignalingError::AuthFailed("relay did not answer in time".into()))??;

        let local = match reply {
            ServerMessage::Authenticated { peer_id } => peer_id,
            ServerMessage::AuthError { reason } => return Err(SignalingError::AuthFailed(reason)),
            other => {
                return Err(SignalingError::AuthFailed(format!(
                    "unexpected reply to authentication: {other:?}"
                )))
            }
        };
        info!(peer_id = %local, "authenticated with relay");

        let (peers, _) = watch::channel(Vec::new());
        let shared = Arc::new(Shared {
            pending: Mutex::new(HashMap::new()),
            subscriptions: Mutex::new(HashMap::new()),
            peers,
            closed: AtomicBool::new(false),
        });

        let (outbound, rx) = mpsc::channel::<Vec<u8>>(64);
        tokio::spawn(writer_task(write_half, rx));
        let reader = tokio::spawn(reader_task(read_half, buf, shared.clone()));

        Ok(Self {
            local,
            outbound,
            shared,
            next_request_id: AtomicU32::new(1),
            next_subscription_id: AtomicU64::new(1),
            reader,
        })
    }

    async fn send(&self, msg: &ClientMessage) -> Result<(), SignalingError> {
        let data = encode_client_msg(msg)?;
        self.outbound
            .send(data)
            .await
            .map_err(|_| SignalingError::Disconnected)
    }

    /// Current directory snapshot.
    pub fn peers(&self) -> Vec<PeerInfo> {
        self.shared.peers.borrow().clone()
    }

    /// Directory snapshot that updates on every join or leave.
    pub fn watch_peers(&self) -> watch::Receiver<Vec<PeerInfo>> {
        self.shared.peers.subscribe()
    }

    /// Look up one online peer in the directory.
    pub fn peer(&self, peer_id: &PeerId) -> Option<PeerIdentity> {
        self.shared
            .peers
            .borrow()
            .iter()
            .find(|p| &p.peer_id == peer_id && p.online)
            .cloned()
            .map(PeerIdentity::from)
    }

    pub async fn request_peer_list(&self) -> Result<(), SignalingError> {
        self.send(&ClientMessage::RequestPeerList).await
    }

    pub async fn ping(&self, timestamp: u64) -> Result<(), SignalingError> {
        self.send(&ClientMessage::Ping { timestamp }).await
    }

    /// Say goodbye to the relay. Pending publishes resolve as disconnected.
    pub async fn disconnect(self) {
        let _ = self.send(&ClientMessage::Disconnect).await;
    }
}

impl Drop for RelayClient {
    fn drop(&mut self) {
        if let Ok(data) = encode_client_msg(&ClientMessage::Disconnect) {
            let _ = self.outbound.try_send(data);
        }
        self.reader.abort();
    }
}

#[async_trait]
impl SignalingRelay for RelayClient {
    fn local_id(&self) -> &PeerId {
        &self.local
    }

    async fn publish(&self, message: SignalingMessage) -> Result<(), SignalingError> {
        let request_id = self.next_request_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        {
            let mut pending = lock(&self.shared.pending);
            if self.shared.is_closed() {
                return Err(SignalingError::Disconnected);
            }
            pending.insert(request_id, tx);
        }

        let msg = ClientMessage::Publish {
            request_id,
            channel: message.from.clone(),
            event: SIGNAL_EVENT.to_string(),
            signal: RawSignal::from(&message),
        };
        if let Err(e) = self.send(&msg).await {
            lock(&self.shared.pending).remove(&request_id);
            return Err(e);
        }

        match rx.await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(rejection)) => {
                warn!(request_id, to = %message.to, error = %rejection, "relay rejected signal");
                Err(rejection.into())
            }
            Err(_) => Err(SignalingError::Disconnected),
        }
    }

    async fn subscribe(&self, peer: &PeerId) -> Result<Subscription, SignalingError> {
        let (tx, rx) = mpsc::unbounded_channel();
        let id = self.next_subscription_id.fetch_add(1, Ordering::Relaxed);
        let first = {
            let mut subs = lock(&self.shared.subscriptions);
            if self.shared.is_closed() {
                return Err(SignalingError::Disconnected);
            }
            let entry = subs.entry(peer.clone()).or_default();
            entry.push((id, tx));
            entry.len() == 1
        };

        let shared = self.shared.clone();
        let outbound = self.outbound.clone();
        let channel = peer.clone();
        let subscription = Subscription::new(peer.clone(), self.local.clone(), rx, move || {
            let mut subs = lock(&shared.subscriptions);
            let Some(entry) = subs.get_mut(&channel) else {
                return;
            };
            entry.retain(|(sub_id, _)| *sub_id != id);
            if entry.is_empty() {
                subs.remove(&channel);
                if let Ok(data) = encode_client_msg(&ClientMessage::Unsubscribe { channel }) {
                    let _ = outbound.try_send(data);
                }
            }
        });

        if first {
            self.send(&ClientMessage::Subscribe {
                channel: peer.clone(),
            })
            .await?;
            debug!(channel = %peer, "subscribed");
        }
        Ok(subscription)
    }
}

/// Read one complete server message.
async fn read_message<R: AsyncRead + Unpin>(
    read_half: &mut R,
    buf: &mut BytesMut,
) -> Result<ServerMessage, SignalingError> {
    loop {
        if let Some(payload) = try_decode_frame(buf)? {
            return Ok(decode_server_msg(&payload)?);
        }
        if read_half.read_buf(buf).await? == 0 {
            return Err(SignalingError::Disconnected);
        }
    }
}

async fn writer_task<S: AsyncWrite>(mut write_half: WriteHalf<S>, mut rx: mpsc::Receiver<Vec<u8>>) {
    while let Some(data) = rx.recv().await {
        if let Err(e) = write_half.write_all(&data).await {
            error!("relay write error: {}", e);
            break;
        }
    }
    let _ = write_half.shutdown().await;
    debug!("relay writer task ended");
}

async fn reader_task<S: AsyncRead>(mut read_half: ReadHalf<S>, mut buf: BytesMut, shared: Arc<Shared>) {
    let _guard = ReaderGuard(shared.clone());
    'read: loop {
        loop {
            match try_decode_frame(&mut buf) {
                Ok(Some(payload)) => match decode_server_msg(&payload) {
                    Ok(msg) => handle_server_message(msg, &shared),
                    Err(e) => warn!("failed to decode relay message: {}", e),
                },
                Ok(None) => break,
                Err(e) => {
                    error!("relay frame error: {}", e);
                    break 'read;
                }
            }
        }

        match read_half.read_buf(&mut buf).await {
            Ok(0) => {
                info!("relay closed the connection");
                break;
            }
            Ok(_) => {}
            Err(e) => {
                error!("relay read error: {}", e);
                break;
            }
        }
    }

    debug!("relay reader task ended");
}

fn handle_server_message(msg: ServerMessage, shared: &Shared) {
    match msg {
        ServerMessage::PeerList { peers } => {
            debug!(count = peers.len(), "directory snapshot");
            shared.peers.send_replace(peers);
        }
        ServerMessage::PeerJoined { peer } => {
            debug!(peer_id = %peer.peer_id, "peer joined");
            shared.peers.send_modify(|peers| {
                match peers.iter_mut().find(|p| p.peer_id == peer.peer_id) {
                    Some(existing) => *existing = peer,
                    None => peers.push(peer),
                }
            });
        }
        ServerMessage::PeerLeft { peer_id } => {
            debug!(peer_id = %peer_id, "peer left");
            shared.peers.send_modify(|peers| peers.retain(|p| p.peer_id != peer_id));
        }
        ServerMessage::Signal {
            channel,
            event,
            message,
        } => {
            if event != SIGNAL_EVENT {
                trace!(%channel, %event, "ignoring unknown channel event");
                return;
            }
            let mut subs = lock(&shared.subscriptions);
            if let Some(entry) = subs.get_mut(&channel) {
                entry.retain(|(_, tx)| tx.send(message.clone()).is_ok());
            }
        }
        ServerMessage::PublishAccepted { request_id } => {
            if let Some(tx) = lock(&shared.pending).remove(&request_id) {
                let _ = tx.send(Ok(()));
            }
        }
        ServerMessage::PublishRejected { request_id, error } => {
            if let Some(tx) = lock(&shared.pending).remove(&request_id) {
                let _ = tx.send(Err(error));
            }
        }
        ServerMessage::Pong { timestamp } => trace!(timestamp, "pong"),
        ServerMessage::Authenticated { .. } | ServerMessage::AuthError { .. } => {
            warn!("unexpected authentication message after login");
        }
    }
}

/// Trust the PEM certificates at `ca_path`, or the public web PKI.
fn tls_client_config(ca_path: Option<&str>) -> Result<rustls::ClientConfig, SignalingError> {
    let mut root_store = rustls::RootCertStore::empty();
    match ca_path {
        Some(path) => {
            let file = std::fs::File::open(path)?;
            let mut reader = BufReader::new(file);
            for cert in rustls_pemfile::certs(&mut reader) {
                root_store
                    .add(cert?)
                    .map_err(|e| SignalingError::Tls(format!("{path}: {e}")))?;
            }
            if root_store.is_empty() {
                return Err(SignalingError::Tls(format!("no certificates found in {path}")));
            }
        }
        None => root_store.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned()),
    }
    Ok(rustls::ClientConfig::builder()
        .with_root_certificates(root_store)
        .with_no_client_auth())
}

/// Split `host:port` or `[v6]:port`.
fn parse_address(address: &str) -> Result<(String, u16), SignalingError> {
    let invalid = |reason: &str| SignalingError::InvalidAddress(format!("{address}: {reason}"));

    let (host, port_str) = if let Some(rest) = address.strip_prefix('[') {
        let bracket_end = rest
            .find("]:")
            .ok_or_else(|| invalid("expected [host]:port"))?;
        (rest[..bracket_end].to_string(), &rest[bracket_end + 2..])
    } else {
        let (host, port) = address
            .rsplit_once(':')
            .ok_or_else(|| invalid("expected host:port"))?;
        (host.to_string(), port)
    };
    let port: u16 = port_str.parse().map_err(|_| invalid("invalid port number"))?;
    if host.is_empty() {
        return Err(invalid("host cannot be empty"));
    }
    Ok((host, port))
}

#[cfg(test)]
mod tests {
    use duet_protocol::codec::{decode_client_msg, encode_server_msg};
    use duet_protocol::SignalKind;
    use tokio::io::DuplexStream;

    use super::*;

    struct FakeRelay {
        stream: DuplexStream,
        buf: BytesMut,
    }

    impl FakeRelay {
        async fn recv(&mut self) -> ClientMessage {
            loop {
                if let Some(payload) = try_decode_frame(&mut self.buf).unwrap() {
                    return decode_client_msg(&payload).unwrap();
                }
                let n = self.stream.read_buf(&mut self.buf).await.unwrap();
                assert!(n > 0, "client hung up");
            }
        }

        async fn send(&mut self, msg: ServerMessage) {
            self.stream
                .write_all(&encode_server_msg(&msg).unwrap())
                .await
                .unwrap();
        }
    }

    fn info(id: &str) -> PeerInfo {
        PeerInfo {
            peer_id: id.into(),
            username: id.to_uppercase(),
            online: true,
            public_key: Some("AAAA".into()),
        }
    }

    fn identity(id: &str) -> PeerIdentity {
        PeerIdentity {
            id: id.into(),
            username: id.to_uppercase(),
            public_key: Some("AAAA".into()),
        }
    }

    async fn connected(id: &str) -> (RelayClient, FakeRelay) {
        let (client_io, server_io) = tokio::io::duplex(64 * 1024);
        let client = tokio::spawn(RelayClient::from_stream(client_io, identity(id)));
        let mut relay = FakeRelay {
            stream: server_io,
            buf: BytesMut::new(),
        };

        match relay.recv().await {
            ClientMessage::Authenticate {
                peer_id,
                protocol_version,
                ..
            } => {
                assert_eq!(peer_id.as_str(), id);
                assert_eq!(protocol_version, PROTOCOL_VERSION);
                relay.send(ServerMessage::Authenticated { peer_id }).await;
            }
            other => panic!("expected Authenticate, got {other:?}"),
        }
        relay
            .send(ServerMessage::PeerList {
                peers: vec![info(id), info("bob")],
            })
            .await;

        (client.await.unwrap().unwrap(), relay)
    }

    fn offer(from: &str, to: &str) -> SignalingMessage {
        SignalingMessage {
            kind: SignalKind::Offer,
            from: from.into(),
            to: to.into(),
            payload: "v=0".into(),
        }
    }

    #[test]
    fn parse_address_forms() {
        assert_eq!(parse_address("localhost:7443").unwrap(), ("localhost".into(), 7443));
        assert_eq!(parse_address("[::1]:7443").unwrap(), ("::1".into(), 7443));
        assert!(parse_address("localhost").is_err());
        assert!(parse_address(":7443").is_err());
        assert!(parse_address("host:99999").is_err());
    }

    #[tokio::test]
    async fn auth_error_surfaces() {
        let (client_io, server_io) = tokio::io::duplex(4096);
        let client = tokio::spawn(RelayClient::from_stream(client_io, identity("alice")));
        let mut relay = FakeRelay {
            stream: server_io,
            buf: BytesMut::new(),
        };
        relay.recv().await;
        relay
            .send(ServerMessage::AuthError {
                reason: "peer id already online".into(),
            })
            .await;

        match client.await.unwrap() {
            Err(SignalingError::AuthFailed(reason)) => assert_eq!(reason, "peer id already online"),
            other => panic!("expected AuthFailed, got {:?}", other.map(|c| c.local.clone())),
        }
    }

    #[tokio::test]
    async fn directory_tracks_joins_and_leaves() {
        let (client, mut relay) = connected("alice").await;
        let mut peers = client.watch_peers();
        peers.wait_for(|p| p.len() == 2).await.unwrap();
        assert_eq!(client.peer(&"bob".into()).unwrap().username, "BOB");

        relay.send(ServerMessage::PeerJoined { peer: info("carol") }).await;
        peers.wait_for(|p| p.len() == 3).await.unwrap();

        relay
            .send(ServerMessage::PeerLeft {
                peer_id: "bob".into(),
            })
            .await;
        peers.wait_for(|p| p.len() == 2).await.unwrap();
        assert!(client.peer(&"bob".into()).is_none());
    }

    #[tokio::test]
    async fn publish_resolves_on_relay_verdict() {
        let (client, mut relay) = connected("alice").await;

        let (result, ()) = tokio::join!(client.publish(offer("alice", "bob")), async {
            match relay.recv().await {
                ClientMessage::Publish {
                    request_id,
                    channel,
                    event,
                    signal,
                } => {
                    assert_eq!(channel.as_str(), "alice");
                    assert_eq!(event, SIGNAL_EVENT);
                    assert_eq!(signal.kind.as_deref(), Some("offer"));
                    relay.send(ServerMessage::PublishAccepted { request_id }).await;
                }
                other => panic!("expected Publish, got {other:?}"),
            }
        });
        result.unwrap();

        let (result, ()) = tokio::join!(client.publish(offer("alice", "dave")), async {
            if let ClientMessage::Publish { request_id, .. } = relay.recv().await {
                relay
                    .send(ServerMessage::PublishRejected {
                        request_id,
                        error: SignalingValidationError::RecipientNotFound("dave".into()),
                    })
                    .await;
            }
        });
        assert!(matches!(
            result,
            Err(SignalingError::Rejected(SignalingValidationError::RecipientNotFound(_)))
        ));
    }

    #[tokio::test]
    async fn subscription_receives_and_releases() {
        let (client, mut relay) = connected("alice").await;

        let mut sub = client.subscribe(&"bob".into()).await.unwrap();
        match relay.recv().await {
            ClientMessage::Subscribe { channel } => assert_eq!(channel.as_str(), "bob"),
            other => panic!("expected Subscribe, got {other:?}"),
        }

        for to in ["carol", "alice"] {
            relay
                .send(ServerMessage::Signal {
                    channel: "bob".into(),
                    event: SIGNAL_EVENT.into(),
                    message: offer("bob", to),
                })
                .await;
        }
        assert_eq!(sub.next().await.unwrap(), offer("bob", "alice"));

        drop(sub);
        match relay.recv().await {
            ClientMessage::Unsubscribe { channel } => assert_eq!(channel.as_str(), "bob"),
            other => panic!("expected Unsubscribe, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn relay_hangup_ends_subscriptions_and_publishes() {
        let (client, mut relay) = connected("alice").await;
        let mut sub = client.subscribe(&"bob".into()).await.unwrap();
        relay.recv().await;

        let (result, ()) = tokio::join!(client.publish(offer("alice", "bob")), async move {
            relay.recv().await;
            drop(relay);
        });
        assert!(matches!(result, Err(SignalingError::Disconnected)));
        assert!(sub.next().await.is_none());
    }

    #[tokio::test]
    async fn requests_after_hangup_fail_fast() {
        let (client, mut relay) = connected("alice").await;
        let mut sub = client.subscribe(&"bob".into()).await.unwrap();
        relay.recv().await;

        drop(relay);
        assert!(sub.next().await.is_none());

        assert!(matches!(
            client.subscribe(&"carol".into()).await,
            Err(SignalingError::Disconnected)
        ));
        let result = tokio::time::timeout(Duration::from_secs(5), client.publish(offer("alice", "bob")))
            .await
            .expect("publish does not hang");
        assert!(matches!(result, Err(SignalingError::Disconnected)));
        assert!(client.peers().is_empty());
    }
}
