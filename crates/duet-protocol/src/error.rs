use thiserror::Error;

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("message too large: {0} bytes (max 65536)")]
    MessageTooLarge(usize),

    #[error("serialization error: {0}")]
    Serialization(#[from] postcard::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("invalid base64 field `{field}`: {source}")]
    Base64 {
        field: &'static str,
        #[source]
        source: base64::DecodeError,
    },

    #[error("invalid length for `{field}`: expected {expected} bytes, got {got}")]
    FieldLength {
        field: &'static str,
        expected: usize,
        got: usize,
    },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn message_too_large_display() {
        let e = ProtocolError::MessageTooLarge(100000);
        assert!(e.to_string().contains("100000"));
    }

    #[test]
    fn field_length_display() {
        let e = ProtocolError::FieldLength {
            field: "iv",
            expected: 12,
            got: 7,
        };
        let msg = e.to_string();
        assert!(msg.contains("iv"));
        assert!(msg.contains("12"));
        assert!(msg.contains('7'));
    }

    #[test]
    fn from_io_error() {
        let io_err = std::io::Error::new(std::io::ErrorKind::BrokenPipe, "broken");
        let proto_err: ProtocolError = io_err.into();
        assert!(proto_err.to_string().contains("broken"));
    }
}
