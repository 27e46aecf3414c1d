//! Error taxonomy for chat sessions.
//!
//! Every failure here is local and non-fatal. Callers surface the message on
//! the status line; nothing in the session core terminates the process.

use thiserror::Error;

use crate::transport::SessionKind;

/// Errors raised by the session core and the transports beneath it.
#[derive(Debug, Error)]
pub enum ChatError {
    /// A start attempt did not establish a session. Retried by the session manager.
    #[error("Failed to connect {session} session: {reason}")]
    ConnectionFailure {
        /// Which logical session was starting.
        session: SessionKind,
        /// Underlying failure.
        reason: String,
    },

    /// An established session terminated.
    #[error("Connection closed: {}", cause.as_deref().unwrap_or("no error"))]
    ConnectionClosed {
        /// Reason reported by the transport, if any.
        cause: Option<String>,
    },

    /// A remote operation was rejected or failed in flight.
    #[error("Invocation of '{method}' failed: {reason}")]
    Invocation {
        /// Remote operation name.
        method: String,
        /// Error reported by the hub or the transport.
        reason: String,
    },

    /// A remote operation was attempted without a live connection.
    #[error("Cannot invoke '{method}': connection is not in the Connected state")]
    NotConnected {
        /// Remote operation name.
        method: String,
    },

    /// An inbound payload did not match the shape expected for its event.
    #[error("Failed to decode '{event}' payload: {source}")]
    Decode {
        /// Event name the payload arrived under.
        event: String,
        #[source]
        source: serde_json::Error,
    },

    /// Malformed hub frame or failed handshake.
    #[error("Protocol error: {0}")]
    Protocol(String),
}

impl ChatError {
    /// Build an invocation failure from any displayable reason.
    pub fn invocation(method: &str, reason: impl std::fmt::Display) -> Self {
        ChatError::Invocation {
            method: method.to_string(),
            reason: reason.to_string(),
        }
    }

    /// Whether this failure counts against an outbound operation (as opposed
    /// to a connection lifecycle failure).
    pub fn is_invocation_failure(&self) -> bool {
        matches!(
            self,
            ChatError::Invocation { .. } | ChatError::NotConnected { .. }
        )
    }
}

pub type Result<T> = std::result::Result<T, ChatError>;
