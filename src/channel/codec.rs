//! Chat message codec
//!
//! Turns broker payloads into [`ChatMessage`]s and back. Anything that does
//! not decode, or lacks an author or a message, is rejected here and never
//! reaches a cache or a viewer.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::broker::Delivery;

/// Cleans user-provided text before it is cached, fanned out or published.
pub trait Sanitizer: Send + Sync {
    fn clean(&self, raw: &str) -> String;
}

/// Allow-list HTML cleaning: scripts, event handlers and unknown tags are
/// removed, harmless inline markup is kept.
#[derive(Debug, Default, Clone, Copy)]
pub struct HtmlSanitizer;

impl Sanitizer for HtmlSanitizer {
    fn clean(&self, raw: &str) -> String {
        ammonia::clean(raw)
    }
}

#[derive(Debug, Error)]
pub enum CodecError {
    #[error("payload is not a chat message: {0}")]
    Malformed(#[from] serde_json::Error),
    #[error("payload has no author")]
    MissingAuthor,
    #[error("payload has no message")]
    MissingMessage,
    #[error("message is empty after sanitizing")]
    Empty,
}

/// A validated, sanitized chat message.
///
/// Serializes to the viewer wire shape
/// `{ "author": string, "message": string, "timestamp": ISO-8601 }`.
/// Deserializing checks that author and text are non-empty; the text is
/// taken as already sanitized.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "WireMessage")]
pub struct ChatMessage {
    author: String,
    #[serde(rename = "message")]
    text: String,
    timestamp: DateTime<Utc>,
}

impl ChatMessage {
    /// Builds a message from untrusted parts.
    pub fn compose(
        author: &str,
        text: &str,
        timestamp: DateTime<Utc>,
        sanitizer: &dyn Sanitizer,
    ) -> Result<Self, CodecError> {
        let author = author.trim();
        if author.is_empty() {
            return Err(CodecError::MissingAuthor);
        }

        let text = sanitizer.clean(text);
        if text.trim().is_empty() {
            return Err(CodecError::Empty);
        }

        Ok(Self {
            author: author.to_string(),
            text,
            timestamp,
        })
    }

    pub fn author(&self) -> &str {
        &self.author
    }

    pub fn text(&self) -> &str {
        &self.text
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }
}

#[derive(Debug, Deserialize)]
struct WireMessage {
    author: String,
    message: String,
    timestamp: DateTime<Utc>,
}

impl TryFrom<WireMessage> for ChatMessage {
    type Error = CodecError;

    fn try_from(wire: WireMessage) -> Result<Self, Self::Error> {
        let author = wire.author.trim();
        if author.is_empty() {
            return Err(CodecError::MissingAuthor);
        }
        if wire.message.trim().is_empty() {
            return Err(CodecError::Empty);
        }
        Ok(Self {
            author: author.to_string(),
            text: wire.message,
            timestamp: wire.timestamp,
        })
    }
}

/// Authors arrive either as a bare id or as `{ "name": id }`.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum RawAuthor {
    Id(String),
    Named { name: String },
}

impl RawAuthor {
    fn into_name(self) -> String {
        match self {
            RawAuthor::Id(id) => id,
            RawAuthor::Named { name } => name,
        }
    }
}

#[derive(Debug, Deserialize)]
struct RawPayload {
    author: Option<RawAuthor>,
    message: Option<String>,
    timestamp: Option<String>,
}

/// Decodes a delivery. Payloads without a usable timestamp take the broker
/// publish time.
pub fn decode(delivery: &Delivery, sanitizer: &dyn Sanitizer) -> Result<ChatMessage, CodecError> {
    let raw: RawPayload = serde_json::from_slice(&delivery.data)?;

    let author = raw.author.ok_or(CodecError::MissingAuthor)?.into_name();
    let text = raw.message.ok_or(CodecError::MissingMessage)?;
    let timestamp = raw
        .timestamp
        .as_deref()
        .and_then(|ts| DateTime::parse_from_rfc3339(ts).ok())
        .map(|ts| ts.with_timezone(&Utc))
        .unwrap_or(delivery.publish_time);

    ChatMessage::compose(&author, &text, timestamp, sanitizer)
}

/// [`decode`], but rejections are logged and swallowed.
pub fn validate(delivery: &Delivery, sanitizer: &dyn Sanitizer) -> Option<ChatMessage> {
    match decode(delivery, sanitizer) {
        Ok(message) => Some(message),
        Err(e) => {
            tracing::warn!(id = %delivery.id, error = %e, "received invalid message from subscription, skipping");
            None
        }
    }
}

pub fn encode(message: &ChatMessage) -> Result<Vec<u8>, serde_json::Error> {
    serde_json::to_vec(message)
}
