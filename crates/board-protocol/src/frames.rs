//! Frame types for the live channel.
//!
//! Every frame is an adjacently tagged object: `{"event": <name>, "data": <payload>}`.

use crate::message::{Message, MessageId};
use serde::{Deserialize, Serialize};

/// Payload of a `send_message` frame.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SendMessage {
    /// Raw text as typed by the user; validated server-side.
    #[serde(default)]
    pub text: String,
}

/// Payload of a `delete_message` event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeletedMessage {
    /// Identifier of the removed message.
    pub id: MessageId,
}

/// A frame sent by a client over the live channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "snake_case")]
pub enum ClientFrame {
    /// Post a new message to the board.
    SendMessage(SendMessage),
}

impl ClientFrame {
    /// Create a new `send_message` frame.
    #[must_use]
    pub fn send_message(text: impl Into<String>) -> Self {
        ClientFrame::SendMessage(SendMessage { text: text.into() })
    }
}

/// An event fanned out by the server to every live client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "snake_case")]
pub enum ServerEvent {
    /// A message was durably inserted.
    NewMessage(Message),
    /// A delete request was processed. The id may never have existed.
    DeleteMessage(DeletedMessage),
}

impl ServerEvent {
    /// Create a `new_message` event.
    #[must_use]
    pub fn new_message(message: Message) -> Self {
        ServerEvent::NewMessage(message)
    }

    /// Create a `delete_message` event.
    #[must_use]
    pub fn delete_message(id: MessageId) -> Self {
        ServerEvent::DeleteMessage(DeletedMessage { id })
    }

    /// Get the event name as it appears on the wire.
    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            ServerEvent::NewMessage(_) => "new_message",
            ServerEvent::DeleteMessage(_) => "delete_message",
        }
    }

    /// Get the id of the message this event is about.
    #[must_use]
    pub fn message_id(&self) -> MessageId {
        match self {
            ServerEvent::NewMessage(m) => m.id,
            ServerEvent::DeleteMessage(d) => d.id,
        }
    }
}
