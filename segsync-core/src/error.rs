//! Error types for segsync
//!
//! Errors fall into two groups:
//!
//! - **Request-level** failures (`ChannelNotOpen`, `NoActiveSession`,
//!   `Server`, `MalformedResponse`) are reported once to the originating
//!   continuation and otherwise swallowed.
//! - **Transport-level** failures (`TransportClosed`, `WebSocket`) are
//!   recovered by the reconnect loop and never thrown at callers of the
//!   request API.
//!
//! The presentation layer only ever sees a single "last error" string plus
//! the connection flags; there is no error queue.
//!
//! # Examples
//!
//! ```rust
//! use segsync_core::{Error, RequestKind};
//!
//! let err = Error::malformed(&RequestKind::Companies, "missing data");
//! assert!(err.to_string().contains("get-companies"));
//! assert!(Error::ChannelNotOpen.is_request_level());
//! ```

use crate::types::RequestKind;
use thiserror::Error;

/// Result type for segsync operations
pub type Result<T> = std::result::Result<T, Error>;

/// Application-level error type for segsync operations
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Error {
    /// A request was attempted while no channel is open.
    ///
    /// Rejected synchronously and never queued.
    #[error("WebSocket is not connected")]
    ChannelNotOpen,

    /// A session-scoped request was attempted with no session token set.
    #[error("No session ID")]
    NoActiveSession,

    /// An inbound `error` frame, or a response carrying an `error` field.
    #[error("Server error: {0}")]
    Server(String),

    /// A response payload is missing the fields its handler expects.
    #[error("Malformed {kind} response: {reason}")]
    MalformedResponse {
        /// Wire type of the request whose response was malformed
        kind: String,
        /// What was missing or wrong
        reason: String,
    },

    /// The channel closed before the response arrived.
    ///
    /// Continuations are never invoked with this error; only awaiting
    /// callers observe it when their receiver is dropped.
    #[error("Connection closed")]
    TransportClosed,

    /// WebSocket transport failure
    #[error("WebSocket error: {0}")]
    WebSocket(String),

    /// Serialization or deserialization error
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Durable session storage failure
    #[error("Storage error: {0}")]
    Storage(String),

    /// Anything else
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Build a `MalformedResponse` for the given request kind
    pub fn malformed(kind: &RequestKind, reason: impl Into<String>) -> Self {
        Error::MalformedResponse {
            kind: kind.wire_type().to_string(),
            reason: reason.into(),
        }
    }

    /// Whether this error belongs to a single request rather than the transport
    pub fn is_request_level(&self) -> bool {
        matches!(
            self,
            Error::ChannelNotOpen
                | Error::NoActiveSession
                | Error::Server(_)
                | Error::MalformedResponse { .. }
        )
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Serialization(err.to_string())
    }
}
