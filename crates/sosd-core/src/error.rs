//! Error codes reported to clients.
//!
//! Every per-request failure inside the daemon maps onto one [`ErrorCode`],
//! which travels back in the ACK or result envelope as a [`WireError`].

use std::fmt;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    /// Transport failure; the client may reconnect.
    ConnectionError,
    /// Malformed message; the connection is dropped.
    ProtocolError,
    TypeMismatch,
    UnknownPublisher,
    /// A commit whose frame precedes the pub's latest frame.
    FrameRegression,
    UnknownType,
    NotAnnounced,
    QuerySyntaxError,
    QueryExecutionError,
    QueryTimeout,
    QueryCancelled,
    QueryPending,
    UnknownQuery,
    ResultTooLarge,
    StoreIoError,
    Unauthorized,
    ShuttingDown,
}

impl ErrorCode {
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorCode::ConnectionError => "ConnectionError",
            ErrorCode::ProtocolError => "ProtocolError",
            ErrorCode::TypeMismatch => "TypeMismatch",
            ErrorCode::UnknownPublisher => "UnknownPublisher",
            ErrorCode::FrameRegression => "FrameRegression",
            ErrorCode::UnknownType => "UnknownType",
            ErrorCode::NotAnnounced => "NotAnnounced",
            ErrorCode::QuerySyntaxError => "QuerySyntaxError",
            ErrorCode::QueryExecutionError => "QueryExecutionError",
            ErrorCode::QueryTimeout => "QueryTimeout",
            ErrorCode::QueryCancelled => "QueryCancelled",
            ErrorCode::QueryPending => "QueryPending",
            ErrorCode::UnknownQuery => "UnknownQuery",
            ErrorCode::ResultTooLarge => "ResultTooLarge",
            ErrorCode::StoreIoError => "StoreIOError",
            ErrorCode::Unauthorized => "Unauthorized",
            ErrorCode::ShuttingDown => "ShuttingDown",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An error as carried on the wire.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WireError {
    pub code: ErrorCode,
    pub message: String,
}

impl WireError {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }
}

impl fmt::Display for WireError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.code, self.message)
    }
}

/// Errors that know which wire code they map to.
pub trait Coded: std::error::Error {
    fn code(&self) -> ErrorCode;

    fn to_wire(&self) -> WireError {
        WireError::new(self.code(), self.to_string())
    }
}
