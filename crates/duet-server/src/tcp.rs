use std::collections::HashSet;
use std::ops::ControlFlow;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use bytes::BytesMut;
use duet_protocol::codec::{decode_client_msg, encode_server_msg, try_decode_frame, PROTOCOL_VERSION};
use duet_protocol::messages::{ClientMessage, ServerMessage};
use duet_protocol::{validate, PeerId, PeerInfo, RawSignal, SignalingValidationError, SIGNAL_EVENT};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::state::{PeerSession, RegisterError, ServerState};

/// How long a new connection may take to authenticate.
const AUTH_TIMEOUT: Duration = Duration::from_secs(5);

/// Messages handled per read before yielding to other connections.
const MAX_MSGS_PER_READ: u32 = 20;

/// A well-formed login request, not yet admitted.
struct Hello {
    peer_id: PeerId,
    username: String,
    public_key: Option<String>,
}

/// Handle a single relay connection (already TLS-wrapped in production).
pub async fn handle_connection<S>(mut stream: S, peer_addr: String, state: Arc<ServerState>)
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    info!(peer = %peer_addr, "new connection");

    // --- Authentication phase (with timeout) ---
    let mut buf = BytesMut::with_capacity(4096);
    let hello = match tokio::time::timeout(AUTH_TIMEOUT, read_hello(&mut stream, &mut buf)).await {
        Ok(Ok(hello)) => hello,
        Ok(Err(e)) => {
            warn!(peer = %peer_addr, "authentication failed: {}", e);
            return;
        }
        Err(_) => {
            warn!(peer = %peer_addr, "authentication timed out");
            return;
        }
    };

    // The writer channel is registered with the session before the writer
    // task starts, so anything queued for this peer lands after Authenticated.
    let (tx, mut rx) = mpsc::channel::<Vec<u8>>(64);
    let (peer_id, connection_id) = match admit(&mut stream, hello, &state, tx.clone()).await {
        Ok(admitted) => admitted,
        Err(e) => {
            warn!(peer = %peer_addr, "authentication failed: {}", e);
            return;
        }
    };
    info!(peer = %peer_addr, peer_id = %peer_id, "authenticated");

    // --- Split into reader/writer ---
    let (mut read_half, mut write_half) = tokio::io::split(stream);

    let writer_handle = tokio::spawn(async move {
        while let Some(data) = rx.recv().await {
            if let Err(e) = write_half.write_all(&data).await {
                error!("write error: {}", e);
                break;
            }
        }
    });

    let _ = send_msg(&tx, &ServerMessage::PeerList { peers: state.peer_list() }).await;

    if let Some(info) = state.peers.get(&peer_id).map(|s| s.info.clone()) {
        broadcast_except(&state, &peer_id, &ServerMessage::PeerJoined { peer: info }).await;
    }

    // --- Message loop ---
    'conn: loop {
        // Process complete messages in the buffer (bounded per read to prevent burst DoS)
        let mut msgs_this_read = 0u32;
        loop {
            if msgs_this_read >= MAX_MSGS_PER_READ {
                tokio::task::yield_now().await;
                msgs_this_read = 0;
            }
            match try_decode_frame(&mut buf) {
                Ok(Some(payload)) => {
                    msgs_this_read += 1;
                    match decode_client_msg(&payload) {
                        Ok(msg) => match handle_message(msg, &state, &peer_id, &tx).await {
                            Ok(ControlFlow::Continue(())) => {}
                            Ok(ControlFlow::Break(())) => {
                                info!(peer_id = %peer_id, "client disconnected");
                                break 'conn;
                            }
                            Err(e) => error!(peer_id = %peer_id, "error handling message: {}", e),
                        },
                        Err(e) => warn!(peer_id = %peer_id, "failed to decode client message: {}", e),
                    }
                }
                Ok(None) => break, // need more data
                Err(e) => {
                    error!(peer_id = %peer_id, "frame decode error: {}", e);
                    break 'conn;
                }
            }
        }

        match read_half.read_buf(&mut buf).await {
            Ok(0) => {
                info!(peer_id = %peer_id, "client disconnected (EOF)");
                break;
            }
            Ok(_) => {}
            Err(e) => {
                error!(peer_id = %peer_id, "read error: {}", e);
                break;
            }
        }
    }

    // --- Cleanup ---
    cleanup_session(&state, &peer_id, connection_id).await;
    writer_handle.abort();
}

/// Read and check the Authenticate message.
async fn read_hello<S>(stream: &mut S, buf: &mut BytesMut) -> Result<Hello>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    // Read until we get a complete message
    let payload = loop {
        if let Some(payload) = try_decode_frame(buf)? {
            break payload;
        }
        if stream.read_buf(buf).await? == 0 {
            anyhow::bail!("connection closed before authentication");
        }
    };

    let ClientMessage::Authenticate {
        peer_id,
        username,
        public_key,
        protocol_version,
    } = decode_client_msg(&payload)?
    else {
        anyhow::bail!("expected Authenticate message");
    };

    if protocol_version != PROTOCOL_VERSION {
        let reason = format!(
            "protocol version mismatch: client={}, server={}",
            protocol_version, PROTOCOL_VERSION
        );
        reject(stream, reason).await?;
        anyhow::bail!("protocol version mismatch");
    }

    if !peer_id.is_well_formed() {
        reject(stream, "peer id must be 1-64 characters without control characters".into()).await?;
        anyhow::bail!("invalid peer id");
    }

    Ok(Hello {
        peer_id,
        username: username.trim().to_string(),
        public_key,
    })
}

/// Bring the peer online and confirm the login.
async fn admit<S>(
    stream: &mut S,
    hello: Hello,
    state: &ServerState,
    tx: mpsc::Sender<Vec<u8>>,
) -> Result<(PeerId, u64)>
where
    S: AsyncWrite + Unpin,
{
    let connection_id = state.next_connection_id();
    let session = PeerSession {
        info: PeerInfo {
            peer_id: hello.peer_id.clone(),
            username: hello.username,
            online: true,
            public_key: hello.public_key,
        },
        connection_id,
        tx,
        subscriptions: HashSet::new(),
        publish_rate: state.new_rate_limiter(),
    };

    match state.register(session) {
        Ok(()) => {}
        Err(RegisterError::AlreadyOnline) => {
            reject(stream, "peer id already online".into()).await?;
            anyhow::bail!("peer id {} already online", hello.peer_id);
        }
        Err(RegisterError::Full) => {
            reject(stream, "server is full".into()).await?;
            anyhow::bail!("server full");
        }
    }

    let data = encode_server_msg(&ServerMessage::Authenticated {
        peer_id: hello.peer_id.clone(),
    })?;
    if let Err(e) = stream.write_all(&data).await {
        state.remove_peer(&hello.peer_id, connection_id);
        return Err(e.into());
    }
    Ok((hello.peer_id, connection_id))
}

async fn reject<S: AsyncWrite + Unpin>(stream: &mut S, reason: String) -> Result<()> {
    let data = encode_server_msg(&ServerMessage::AuthError { reason })?;
    stream.write_all(&data).await?;
    Ok(())
}

/// Handle a client message after authentication.
async fn handle_message(
    msg: ClientMessage,
    state: &ServerState,
    peer_id: &PeerId,
    tx: &mpsc::Sender<Vec<u8>>,
) -> Result<ControlFlow<()>> {
    match msg {
        ClientMessage::Subscribe { channel } => {
            if channel.is_well_formed() {
                state.subscribe(&channel, peer_id);
                debug!(peer_id = %peer_id, channel = %channel, "subscribed");
            }
        }

        ClientMessage::Unsubscribe { channel } => {
            state.unsubscribe(&channel, peer_id);
            debug!(peer_id = %peer_id, channel = %channel, "unsubscribed");
        }

        ClientMessage::Publish {
            request_id,
            channel,
            event,
            signal,
        } => {
            let reply = match publish(state, peer_id, channel, event, &signal).await {
                Ok(()) => ServerMessage::PublishAccepted { request_id },
                Err(error) => {
                    warn!(peer_id = %peer_id, request_id, error = %error, "signal rejected");
                    ServerMessage::PublishRejected { request_id, error }
                }
            };
            send_msg(tx, &reply).await?;
        }

        ClientMessage::RequestPeerList => {
            send_msg(tx, &ServerMessage::PeerList { peers: state.peer_list() }).await?;
        }

        ClientMessage::Ping { timestamp } => {
            send_msg(tx, &ServerMessage::Pong { timestamp }).await?;
        }

        ClientMessage::Disconnect => return Ok(ControlFlow::Break(())),

        ClientMessage::Authenticate { .. } => {
            warn!(peer_id = %peer_id, "ignoring repeated Authenticate");
        }
    }
    Ok(ControlFlow::Continue(()))
}

/// Validate a published signal and forward it to its recipient.
///
/// Only the recipient named in the message receives it, and only if it is
/// subscribed to the publisher's channel. Rejected messages go nowhere.
async fn publish(
    state: &ServerState,
    caller: &PeerId,
    channel: PeerId,
    event: String,
    signal: &RawSignal,
) -> Result<(), SignalingValidationError> {
    if !state.try_publish(caller) {
        return Err(SignalingValidationError::RateLimited);
    }
    if event != SIGNAL_EVENT {
        return Err(SignalingValidationError::InvalidFormat(format!(
            "unknown event `{event}`"
        )));
    }
    let payload_len = signal.payload.as_ref().map_or(0, String::len);
    if payload_len > state.settings.max_payload_len {
        return Err(SignalingValidationError::InvalidFormat(format!(
            "payload of {payload_len} bytes exceeds {}",
            state.settings.max_payload_len
        )));
    }

    let message = validate(signal, caller, state)?;
    if &channel != caller {
        return Err(SignalingValidationError::SenderMismatch);
    }

    match state.subscriber_sender(&channel, &message.to) {
        Some(recipient) => {
            debug!(from = %message.from, to = %message.to, kind = message.kind.as_str(), "relaying signal");
            let forward = ServerMessage::Signal {
                channel,
                event,
                message,
            };
            let _ = send_msg(&recipient, &forward).await;
        }
        None => {
            debug!(from = %message.from, to = %message.to, "recipient not subscribed, signal dropped");
        }
    }
    Ok(())
}

async fn cleanup_session(state: &ServerState, peer_id: &PeerId, connection_id: u64) {
    if state.remove_peer(peer_id, connection_id).is_some() {
        broadcast_except(
            state,
            peer_id,
            &ServerMessage::PeerLeft {
                peer_id: peer_id.clone(),
            },
        )
        .await;
        info!(peer_id = %peer_id, "session cleaned up");
    }
}

/// Broadcast a message to every online peer except one.
async fn broadcast_except(state: &ServerState, exclude: &PeerId, msg: &ServerMessage) {
    for tx in state.senders_except(exclude) {
        let _ = send_msg(&tx, msg).await;
    }
}

/// Send a server message to a client via their writer channel.
async fn send_msg(tx: &mpsc::Sender<Vec<u8>>, msg: &ServerMessage) -> Result<()> {
    let data = encode_server_msg(msg)?;
    tx.send(data)
        .await
        .map_err(|_| anyhow::anyhow!("send channel closed"))?;
    Ok(())
}
