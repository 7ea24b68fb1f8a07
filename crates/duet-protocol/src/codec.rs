use bytes::{Buf, BytesMut};

use crate::error::ProtocolError;
use crate::messages::{ClientMessage, ServerMessage};

/// Maximum relay control message size: 64 KiB.
pub const MAX_MSG_SIZE: u32 = 65_536;

/// Current relay protocol version.
pub const PROTOCOL_VERSION: u32 = 1;

fn length_prefixed(payload: Vec<u8>) -> Result<Vec<u8>, ProtocolError> {
    if payload.len() > MAX_MSG_SIZE as usize {
        return Err(ProtocolError::MessageTooLarge(payload.len()));
    }
    let mut buf = Vec::with_capacity(4 + payload.len());
    buf.extend_from_slice(&(payload.len() as u32).to_be_bytes());
    buf.extend_from_slice(&payload);
    Ok(buf)
}

/// Encode a `ClientMessage` into a length-prefixed byte buffer.
pub fn encode_client_msg(msg: &ClientMessage) -> Result<Vec<u8>, ProtocolError> {
    length_prefixed(postcard::to_allocvec(msg)?)
}

/// Decode a `ClientMessage` from a postcard payload (without length prefix).
pub fn decode_client_msg(payload: &[u8]) -> Result<ClientMessage, ProtocolError> {
    Ok(postcard::from_bytes(payload)?)
}

/// Encode a `ServerMessage` into a length-prefixed byte buffer.
pub fn encode_server_msg(msg: &ServerMessage) -> Result<Vec<u8>, ProtocolError> {
    length_prefixed(postcard::to_allocvec(msg)?)
}

/// Decode a `ServerMessage` from a postcard payload (without length prefix).
pub fn decode_server_msg(payload: &[u8]) -> Result<ServerMessage, ProtocolError> {
    Ok(postcard::from_bytes(payload)?)
}

/// Attempt to extract one complete length-prefixed frame from a byte buffer.
///
/// Returns `Ok(Some(payload))` if a complete message is available,
/// `Ok(None)` if more data is needed, or `Err` if the message is too large.
///
/// Advances the buffer past the consumed frame.
pub fn try_decode_frame(buf: &mut BytesMut) -> Result<Option<Vec<u8>>, ProtocolError> {
    if buf.len() < 4 {
        return Ok(None);
    }

    let length = u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]) as usize;

    if length > MAX_MSG_SIZE as usize {
        return Err(ProtocolError::MessageTooLarge(length));
    }

    if buf.len() < 4 + length {
        return Ok(None);
    }

    buf.advance(4);
    let payload = buf.split_to(length).to_vec();
    Ok(Some(payload))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::signaling::{RawSignal, SignalKind, SignalingMessage, SignalingValidationError};

    #[test]
    fn roundtrip_authenticate() {
        let msg = ClientMessage::Authenticate {
            peer_id: "alice".into(),
            username: "Alice".into(),
            public_key: Some("cHVi".into()),
            protocol_version: PROTOCOL_VERSION,
        };
        let encoded = encode_client_msg(&msg).unwrap();
        match decode_client_msg(&encoded[4..]).unwrap() {
            ClientMessage::Authenticate {
                peer_id,
                public_key,
                protocol_version,
                ..
            } => {
                assert_eq!(peer_id.as_str(), "alice");
                assert_eq!(public_key.as_deref(), Some("cHVi"));
                assert_eq!(protocol_version, PROTOCOL_VERSION);
            }
            _ => panic!("wrong variant"),
        }
    }

    #[test]
    fn publish_keeps_partial_signal() {
        let msg = ClientMessage::Publish {
            request_id: 9,
            channel: "alice".into(),
            event: "signal".into(),
            signal: RawSignal {
                kind: Some("offer".into()),
                from: Some("alice".into()),
                to: None,
                payload: Some("sdp".into()),
            },
        };
        let encoded = encode_client_msg(&msg).unwrap();
        match decode_client_msg(&encoded[4..]).unwrap() {
            ClientMessage::Publish { request_id, signal, .. } => {
                assert_eq!(request_id, 9);
                assert!(signal.to.is_none());
                assert_eq!(signal.payload.as_deref(), Some("sdp"));
            }
            _ => panic!("wrong variant"),
        }
    }

    #[test]
    fn server_signal_and_rejection() {
        let msg = ServerMessage::Signal {
            channel: "bob".into(),
            event: "signal".into(),
            message: SignalingMessage {
                kind: SignalKind::Candidate,
                from: "bob".into(),
                to: "alice".into(),
                payload: "cand".into(),
            },
        };
        let encoded = encode_server_msg(&msg).unwrap();
        assert!(matches!(
            decode_server_msg(&encoded[4..]).unwrap(),
            ServerMessage::Signal { message: SignalingMessage { kind: SignalKind::Candidate, .. }, .. }
        ));

        let msg = ServerMessage::PublishRejected {
            request_id: 1,
            error: SignalingValidationError::SenderMismatch,
        };
        let encoded = encode_server_msg(&msg).unwrap();
        assert!(matches!(
            decode_server_msg(&encoded[4..]).unwrap(),
            ServerMessage::PublishRejected { request_id: 1, error: SignalingValidationError::SenderMismatch }
        ));
    }

    #[test]
    fn frame_decoding() {
        let msg = ClientMessage::Ping { timestamp: 12345 };
        let encoded = encode_client_msg(&msg).unwrap();

        let mut buf = BytesMut::new();

        buf.extend_from_slice(&encoded[..3]);
        assert!(try_decode_frame(&mut buf).unwrap().is_none());

        buf.extend_from_slice(&encoded[3..]);
        let payload = try_decode_frame(&mut buf).unwrap().unwrap();
        match decode_client_msg(&payload).unwrap() {
            ClientMessage::Ping { timestamp } => assert_eq!(timestamp, 12345),
            _ => panic!("wrong variant"),
        }
        assert!(buf.is_empty());
    }

    #[test]
    fn frame_message_too_large() {
        let mut buf = BytesMut::new();
        buf.extend_from_slice(&(MAX_MSG_SIZE + 1).to_be_bytes());
        buf.extend_from_slice(&[0u8; 100]);
        assert!(matches!(
            try_decode_frame(&mut buf),
            Err(ProtocolError::MessageTooLarge(_))
        ));
    }

    #[test]
    fn oversized_payload_not_encoded() {
        let msg = ClientMessage::Publish {
            request_id: 0,
            channel: "alice".into(),
            event: "signal".into(),
            signal: RawSignal {
                payload: Some("x".repeat(MAX_MSG_SIZE as usize + 1)),
                ..RawSignal::default()
            },
        };
        assert!(matches!(
            encode_client_msg(&msg),
            Err(ProtocolError::MessageTooLarge(_))
        ));
    }

    #[test]
    fn frame_multiple_messages() {
        let enc1 = encode_client_msg(&ClientMessage::RequestPeerList).unwrap();
        let enc2 = encode_client_msg(&ClientMessage::Disconnect).unwrap();

        let mut buf = BytesMut::new();
        buf.extend_from_slice(&enc1);
        buf.extend_from_slice(&enc2);

        let p1 = try_decode_frame(&mut buf).unwrap().unwrap();
        let p2 = try_decode_frame(&mut buf).unwrap().unwrap();
        assert!(matches!(decode_client_msg(&p1).unwrap(), ClientMessage::RequestPeerList));
        assert!(matches!(decode_client_msg(&p2).unwrap(), ClientMessage::Disconnect));
        assert!(buf.is_empty());
    }
}
