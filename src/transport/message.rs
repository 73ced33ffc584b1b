use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::channel::ChatMessage;

/// Frames a client may send, one JSON object per text frame.
#[derive(Debug, Deserialize, Serialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    /// Start receiving a channel: history first, then live messages.
    Listen { channel: String },
    Unlisten { channel: String },
    Post { channel: String, message: String },
    ListChannels,
    CreateChannel { channel: String },
    #[serde(rename = "whoami")]
    WhoAmI,
}

#[derive(Debug, Deserialize, Serialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    History {
        channel: String,
        messages: Vec<ChatMessage>,
    },
    Message {
        channel: String,
        author: String,
        message: String,
        timestamp: DateTime<Utc>,
    },
    Channels {
        channels: Vec<String>,
    },
    ChannelCreated {
        channel: String,
    },
    Posted {
        channel: String,
    },
    Identity {
        name: String,
    },
    Error {
        message: String,
    },
}

impl ServerMessage {
    pub fn live(channel: &str, message: &ChatMessage) -> Self {
        ServerMessage::Message {
            channel: channel.to_string(),
            author: message.author().to_string(),
            message: message.text().to_string(),
            timestamp: message.timestamp(),
        }
    }

    pub fn error(message: impl ToString) -> Self {
        ServerMessage::Error {
            message: message.to_string(),
        }
    }
}
