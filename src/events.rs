use chrono::{DateTime, Utc};
use serde::de::{DeserializeOwned, Error as _};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{ChatError, Result};
use crate::transport::SessionKind;

/// Roster of connected peers, sent as a JSON string.
pub const RECEIVE_CONNECTED_USERS: &str = "ReceiveConnectedUsers";
/// Roster of groups and their members, sent as a JSON string.
pub const RECEIVE_GROUPS: &str = "ReceiveGroups";
/// Broadcast message: `(username, connectionId, message)`.
pub const RECEIVE_MESSAGE: &str = "ReceiveMessage";
/// Private message envelope, sent as a JSON string.
pub const RECEIVE_PRIVATE_MESSAGE: &str = "ReceivePrivateMessage";
/// One fragment of a streamed AI response.
pub const RECEIVE_AI_MESSAGE: &str = "ReceiveAiMessage";

/// Remote operations the client invokes on the hub
pub mod methods {
    pub const SAVE_USERNAME: &str = "SaveUsername";
    pub const SEND_MESSAGE_TO_ALL: &str = "SendMessageToAll";
    pub const SEND_PRIVATE_MESSAGE: &str = "SendPrivateMessage";
    pub const ADD_TO_GROUP: &str = "AddToGroup";
    pub const REMOVE_FROM_GROUP: &str = "RemoveFromGroup";
    pub const SEND_MESSAGE_TO_GROUP: &str = "SendMessageToGroup";
    pub const GET_GROUPS: &str = "GetGroups";
    pub const SEND_AI_MESSAGE: &str = "SendAiMessage";
}

/// A remote participant as published by the hub roster
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Peer {
    pub connection_id: String,
    #[serde(default)]
    pub name: Option<String>,
}

/// A named group and its current members
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Group {
    pub name: String,
    #[serde(default)]
    pub members: Vec<Peer>,
}

/// Inbound private message
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct PrivateEnvelope {
    pub sender_connection_id: String,
    pub message: String,
}

/// One piece of a token-streamed AI response
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct AiFragment {
    #[serde(default)]
    pub done: bool,
    #[serde(default)]
    pub message: FragmentContent,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct FragmentContent {
    #[serde(default)]
    pub content: String,
}

#[cfg(test)]
impl AiFragment {
    pub fn partial(content: impl Into<String>) -> Self {
        Self {
            done: false,
            message: FragmentContent {
                content: content.into(),
            },
        }
    }

    pub fn terminal() -> Self {
        Self {
            done: true,
            message: FragmentContent::default(),
        }
    }
}

/// Role of an entry in the AI conversation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChatRole {
    User,
    Assistant,
}

/// Entry of the rolling AI history, sent back to the generator on every turn
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: ChatRole,
    pub content: String,
}

impl ChatMessage {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: ChatRole::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: ChatRole::Assistant,
            content: content.into(),
        }
    }
}

/// Conversation stream a chat entry belongs to
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ConversationChannel {
    Broadcast,
    Private,
    Group(String),
}

impl ConversationChannel {
    pub fn display_name(&self) -> String {
        match self {
            ConversationChannel::Broadcast => "all".to_string(),
            ConversationChannel::Private => "private".to_string(),
            ConversationChannel::Group(name) => format!("group:{}", name),
        }
    }
}

/// Individual chat entry. Immutable once appended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConversationEntry {
    /// Resolved display label of the author
    pub author: String,
    pub author_id: String,
    pub body: String,
    pub received_at: DateTime<Utc>,
}

impl ConversationEntry {
    pub fn new(author: impl Into<String>, author_id: impl Into<String>, body: impl Into<String>) -> Self {
        Self {
            author: author.into(),
            author_id: author_id.into(),
            body: body.into(),
            received_at: Utc::now(),
        }
    }
}

/// Decoded form of every event name the dispatcher knows statically
#[derive(Debug, Clone, PartialEq)]
pub enum InboundEvent {
    Roster(Vec<Peer>),
    Groups(Vec<Group>),
    Broadcast {
        username: String,
        connection_id: String,
        message: String,
    },
    Private(PrivateEnvelope),
    AiFragment(AiFragment),
    /// Any other name. Only routed while a group listener exists for it.
    Topic { name: String, arguments: Vec<Value> },
}

impl InboundEvent {
    /// Decode a named event and its positional arguments.
    pub fn decode(target: &str, arguments: Vec<Value>) -> Result<Self> {
        let event = match target {
            RECEIVE_CONNECTED_USERS => InboundEvent::Roster(json_arg(target, &arguments, 0)?),
            RECEIVE_GROUPS => InboundEvent::Groups(json_arg(target, &arguments, 0)?),
            RECEIVE_MESSAGE => InboundEvent::Broadcast {
                username: string_arg(target, &arguments, 0).unwrap_or_default(),
                connection_id: string_arg(target, &arguments, 1)?,
                message: string_arg(target, &arguments, 2)?,
            },
            RECEIVE_PRIVATE_MESSAGE => InboundEvent::Private(json_arg(target, &arguments, 0)?),
            RECEIVE_AI_MESSAGE => InboundEvent::AiFragment(json_arg(target, &arguments, 0)?),
            _ => InboundEvent::Topic {
                name: target.to_string(),
                arguments,
            },
        };
        Ok(event)
    }

    /// The session this event is expected on
    pub fn session(&self) -> SessionKind {
        match self {
            InboundEvent::AiFragment(_) => SessionKind::Ai,
            _ => SessionKind::Primary,
        }
    }
}

/// Decode the `(senderConnectionId, message)` pair carried by group topics.
pub fn decode_topic_message(topic: &str, arguments: &[Value]) -> Result<(String, String)> {
    Ok((
        string_arg(topic, arguments, 0)?,
        string_arg(topic, arguments, 1)?,
    ))
}

fn missing(event: &str, index: usize) -> ChatError {
    ChatError::Decode {
        event: event.to_string(),
        source: serde_json::Error::custom(format!("missing argument {}", index)),
    }
}

fn string_arg(event: &str, arguments: &[Value], index: usize) -> Result<String> {
    match arguments.get(index) {
        Some(Value::String(s)) => Ok(s.clone()),
        Some(Value::Null) => Ok(String::new()),
        Some(other) => Err(ChatError::Decode {
            event: event.to_string(),
            source: serde_json::Error::custom(format!(
                "argument {} should be a string, got {}",
                index, other
            )),
        }),
        None => Err(missing(event, index)),
    }
}

/// The hub serializes structured payloads to JSON strings before sending
/// them; accept either that or the plain JSON value.
fn json_arg<T: DeserializeOwned>(event: &str, arguments: &[Value], index: usize) -> Result<T> {
    let raw = arguments.get(index).ok_or_else(|| missing(event, index))?;
    let decoded = match raw {
        Value::String(text) => serde_json::from_str(text),
        other => serde_json::from_value(other.clone()),
    };
    decoded.map_err(|source| ChatError::Decode {
        event: event.to_string(),
        source,
    })
}
