//! Channel hub
//!
//! The process-wide map from channel name to [`ChannelSession`], and the only
//! entry point the transport talks to. Built once at start-up and shared as
//! `Arc<ChannelHub>`.
//!
//! Session creation is single-winner: the map holds one `OnceCell` per
//! channel, inserted under a short synchronous lock, and the broker round
//! trip runs inside `get_or_try_init`. Concurrent first attaches therefore
//! wait on the same initialisation and share one subscription. A failed
//! initialisation removes the channel's entry again, so the channel is
//! unknown to `stats` and the next attach retries from scratch.
//!
//! Sessions are never reaped; `SessionStats::last_accessed` and
//! `active_viewers` are tracked but nothing acts on them.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::Utc;
use tokio::sync::OnceCell;

use super::codec::{self, ChatMessage, HtmlSanitizer, Sanitizer};
use super::session::{ChannelSession, SessionConfig, SessionStats};
use super::viewers::{ViewerId, ViewerSink};
use crate::broker::{Broker, BrokerError};
use crate::utils::error::{RelayError, RelayResult};

/// Longest accepted channel name.
pub const MAX_CHANNEL_NAME_LENGTH: usize = 64;

type SessionCell = Arc<OnceCell<Arc<ChannelSession>>>;

pub struct ChannelHub {
    broker: Arc<dyn Broker>,
    config: SessionConfig,
    sanitizer: Arc<dyn Sanitizer>,
    sessions: Mutex<HashMap<String, SessionCell>>,
}

impl std::fmt::Debug for ChannelHub {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChannelHub")
            .field("config", &self.config)
            .field("channels", &self.lock().len())
            .finish()
    }
}

impl ChannelHub {
    pub fn new(broker: Arc<dyn Broker>, config: SessionConfig) -> Self {
        Self::with_sanitizer(broker, config, Arc::new(HtmlSanitizer))
    }

    pub fn with_sanitizer(
        broker: Arc<dyn Broker>,
        config: SessionConfig,
        sanitizer: Arc<dyn Sanitizer>,
    ) -> Self {
        Self {
            broker,
            config,
            sanitizer,
            sessions: Mutex::new(HashMap::new()),
        }
    }

    /// Returns the channel's session, opening its subscription if this is
    /// the first request for it.
    pub async fn get_or_create_session(&self, channel: &str) -> RelayResult<Arc<ChannelSession>> {
        let (session, _) = self.resolve(channel).await?;
        Ok(session)
    }

    /// Attaches a viewer and returns the history it should replay first,
    /// ordered by message timestamp.
    ///
    /// The attach that creates the session waits out the preload window
    /// before registering. Attaches to an existing session register at once.
    pub async fn attach(
        &self,
        channel: &str,
        sink: ViewerSink,
    ) -> RelayResult<Vec<Arc<ChatMessage>>> {
        let (session, created) = self.resolve(channel).await?;
        if created {
            session.wait_live().await;
        }
        Ok(session.attach(sink))
    }

    /// Detaches a viewer. No-op if the channel has no session.
    pub fn detach(&self, channel: &str, viewer: &ViewerId) -> bool {
        match self.session(channel) {
            Some(session) => session.detach(viewer),
            None => false,
        }
    }

    /// Publishes a post straight to the channel's topic.
    ///
    /// Never creates a topic: a channel that does not exist is `NotFound`
    /// and the broker is left untouched.
    pub async fn post(&self, channel: &str, author: &str, text: &str) -> RelayResult<ChatMessage> {
        validate_channel_name(channel)?;

        let message = ChatMessage::compose(author, text, Utc::now(), self.sanitizer.as_ref())
            .map_err(|e| RelayError::InvalidMessage(e.to_string()))?;

        if !self.broker.topic_exists(channel).await? {
            tracing::warn!(channel, "channel/topic not found, rejecting post");
            return Err(RelayError::NotFound(channel.to_string()));
        }

        let payload = codec::encode(&message).map_err(BrokerError::from)?;
        match self.broker.publish(channel, payload).await {
            Ok(id) => {
                tracing::info!(channel, author = %message.author(), %id, "message published");
                Ok(message)
            }
            Err(BrokerError::TopicNotFound(_)) => Err(RelayError::NotFound(channel.to_string())),
            Err(e) => Err(e.into()),
        }
    }

    pub async fn list_channels(&self) -> RelayResult<Vec<String>> {
        Ok(self.broker.list_topics().await?)
    }

    pub async fn create_channel(&self, channel: &str) -> RelayResult<()> {
        validate_channel_name(channel)?;
        match self.broker.create_topic(channel).await {
            Ok(()) => Ok(()),
            Err(BrokerError::TopicExists(_)) => Err(RelayError::AlreadyExists(channel.to_string())),
            Err(e) => Err(e.into()),
        }
    }

    /// The session for `channel`, if one has finished opening.
    pub fn session(&self, channel: &str) -> Option<Arc<ChannelSession>> {
        self.lock()
            .get(channel)
            .and_then(|cell| cell.get().cloned())
    }

    /// Stats for `channel`; `Opening` while its subscription is being set up,
    /// `None` if no session exists or the last open failed.
    pub fn stats(&self, channel: &str) -> Option<SessionStats> {
        let cell = self.lock().get(channel).cloned()?;
        match cell.get() {
            Some(session) => Some(session.stats()),
            None => Some(SessionStats::opening(channel)),
        }
    }

    /// Stops every session. The hub is not meant to be used afterwards.
    pub fn shutdown(&self) {
        let sessions: Vec<_> = self
            .lock()
            .values()
            .filter_map(|cell| cell.get().cloned())
            .collect();
        for session in sessions {
            session.close();
        }
    }

    async fn resolve(&self, channel: &str) -> RelayResult<(Arc<ChannelSession>, bool)> {
        validate_channel_name(channel)?;

        let cell = {
            let mut sessions = self.lock();
            Arc::clone(sessions.entry(channel.to_string()).or_default())
        };

        let mut created = false;
        let created_flag = &mut created;
        let opened = cell
            .get_or_try_init(|| async move {
                *created_flag = true;
                tracing::info!(channel, "no session for channel, creating");
                ChannelSession::open(
                    self.broker.as_ref(),
                    channel,
                    &self.config,
                    Arc::clone(&self.sanitizer),
                )
                .await
            })
            .await;

        match opened {
            Ok(session) => {
                if created {
                    // a waiter may have retried after an earlier failure removed the entry
                    self.lock()
                        .entry(channel.to_string())
                        .or_insert_with(|| Arc::clone(&cell));
                }
                Ok((Arc::clone(session), created))
            }
            Err(e) => {
                self.forget_failed(channel, &cell);
                Err(e)
            }
        }
    }

    /// Drops the map entry for a channel whose open failed, unless another
    /// attach has since replaced or filled it.
    fn forget_failed(&self, channel: &str, cell: &SessionCell) {
        let mut sessions = self.lock();
        let stale = sessions
            .get(channel)
            .is_some_and(|current| Arc::ptr_eq(current, cell) && !current.initialized());
        if stale {
            sessions.remove(channel);
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, SessionCell>> {
        self.sessions.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Channel names map 1:1 to broker topics: 1-64 characters of
/// `[A-Za-z0-9._-]`.
pub fn validate_channel_name(name: &str) -> RelayResult<()> {
    let valid = !name.is_empty()
        && name.len() <= MAX_CHANNEL_NAME_LENGTH
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-'));
    if valid {
        Ok(())
    } else {
        Err(RelayError::InvalidChannelName(name.to_string()))
    }
}
