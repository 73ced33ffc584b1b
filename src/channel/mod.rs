//! The `channel` module is the relay core: per-channel fan-out and replay.
//!
//! - `codec`: broker payload ⇄ [`ChatMessage`], with sanitizing.
//! - `history`: the bounded replay buffer.
//! - `viewers`: viewer sinks and the registry that fans out to them.
//! - `session`: one broker subscription + cache + viewers per channel.
//! - `hub`: the process-wide channel map the transport calls into.

pub mod codec;
pub mod history;
pub mod hub;
pub mod session;
pub mod viewers;

pub use codec::{ChatMessage, HtmlSanitizer, Sanitizer};
pub use history::{HistoryCache, MAX_MESSAGE_CACHE_LENGTH};
pub use hub::ChannelHub;
pub use session::{ChannelSession, SessionConfig, SessionPhase, SessionStats};
pub use viewers::{ViewerId, ViewerRegistry, ViewerSink};

#[cfg(test)]
mod tests;
