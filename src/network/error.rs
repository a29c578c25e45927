use std::time::Duration;
use thiserror::Error;

use crate::network::message::MessageType;

/// Failures of a message handler or of the framing underneath it
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("message handler is closed")]
    Disposed,

    #[error("no response within {0:?}")]
    Timeout(Duration),

    #[error("another caller is already waiting for a response")]
    WaiterBusy,

    #[error("frame of {0} bytes exceeds the maximum frame size")]
    FrameTooLarge(u64),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("codec error: {0}")]
    Codec(#[from] serde_json::Error),

    #[error("unexpected payload for {0:?} message")]
    UnexpectedPayload(MessageType),
}

impl ProtocolError {
    /// Whether the error only means the peer closed the stream
    pub fn is_disconnect(&self) -> bool {
        match self {
            ProtocolError::Disposed => true,
            ProtocolError::Io(e) => matches!(
                e.kind(),
                std::io::ErrorKind::UnexpectedEof
                    | std::io::ErrorKind::ConnectionReset
                    | std::io::ErrorKind::ConnectionAborted
                    | std::io::ErrorKind::BrokenPipe
            ),
            _ => false,
        }
    }
}

/// Failures of the join handshake
#[derive(Debug, Error)]
pub enum HandshakeError {
    #[error("rejected by host: {0}")]
    Rejected(String),

    #[error("protocol violation: {0}")]
    ProtocolViolation(String),

    #[error("incorrect password")]
    IncorrectPassword,

    #[error("host accepted without assigning a client id")]
    MissingClientId,

    #[error(transparent)]
    Protocol(#[from] ProtocolError),
}
