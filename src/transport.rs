//! Seam between the session core and the real-time connection layer.
//!
//! The core never sees sockets or frames. A transport opens the connection,
//! performs named invocations and pushes [`TransportEvent`]s onto a channel
//! that the driver loop feeds into the session manager.

use async_trait::async_trait;
use serde_json::Value;
use strum::Display;
use tokio::sync::mpsc;

use crate::error::Result;

/// The two independent logical sessions a client keeps open.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display)]
#[strum(serialize_all = "lowercase")]
pub enum SessionKind {
    /// Broadcast, private and group messaging.
    Primary,
    /// Streaming AI generation.
    Ai,
}

/// Connection lifecycle as seen by the core.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    /// The transport lost its link and is retrying beneath the core.
    Reconnecting,
}

impl ConnectionState {
    pub fn as_u8(self) -> u8 {
        match self {
            ConnectionState::Disconnected => 0,
            ConnectionState::Connecting => 1,
            ConnectionState::Connected => 2,
            ConnectionState::Reconnecting => 3,
        }
    }

    pub fn from_u8(value: u8) -> Self {
        match value {
            1 => ConnectionState::Connecting,
            2 => ConnectionState::Connected,
            3 => ConnectionState::Reconnecting,
            _ => ConnectionState::Disconnected,
        }
    }
}

/// Everything a transport can push up to the core.
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    /// A named event sent by the hub with positional arguments.
    Invocation { target: String, arguments: Vec<Value> },
    /// The transport re-established its link, possibly under a new id.
    Reconnected { connection_id: String },
    /// The link ended and the transport gave up on it.
    Closed { cause: Option<String> },
}

pub type EventSender = mpsc::UnboundedSender<TransportEvent>;
pub type EventReceiver = mpsc::UnboundedReceiver<TransportEvent>;

/// Create the channel a transport publishes its events on.
pub fn event_channel() -> (EventSender, EventReceiver) {
    mpsc::unbounded_channel()
}

/// A real-time connection delivering named events and accepting named
/// invocations.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Open the connection and return the transport-assigned connection id.
    async fn start(&self) -> Result<String>;

    /// Invoke a named remote operation and wait for its completion.
    async fn invoke(&self, method: &str, args: Vec<Value>) -> Result<Value>;

    /// Close the connection. A `Closed` event follows.
    async fn stop(&self);

    /// Current connection state.
    fn state(&self) -> ConnectionState;
}
