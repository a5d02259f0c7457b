//! Wire protocol between clients and the daemon.
//!
//! Every message is a [`Frame`]: a fixed 24-byte header followed by a JSON
//! payload whose shape depends on the message type. Requests are answered
//! in order on the same connection; FEEDBACK frames may arrive between
//! replies at any time.

pub mod client;
pub mod codec;
pub mod message;

pub use client::{ClientError, SosClient};
pub use codec::{Frame, HEADER_LEN, MsgType, SosCodec};
pub use message::*;

use crate::error::{Coded, ErrorCode};

/// Malformed traffic. The daemon answers with a final ACK and closes the
/// connection.
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("frame size {size} is outside the allowed range 24..={max}")]
    FrameSize { size: i64, max: usize },

    #[error("unknown message type {0}")]
    UnknownMessage(u32),

    #[error("malformed {msg_type:?} payload: {source}")]
    Payload {
        msg_type: MsgType,
        source: serde_json::Error,
    },

    #[error("{0:?} is not a request")]
    Unexpected(MsgType),

    #[error("connection error: {0}")]
    Io(#[from] std::io::Error),
}

impl Coded for ProtocolError {
    fn code(&self) -> ErrorCode {
        match self {
            ProtocolError::Io(_) => ErrorCode::ConnectionError,
            _ => ErrorCode::ProtocolError,
        }
    }
}
