//! Channel session
//!
//! One session per channel: the broker subscription, the replay cache, the
//! attached viewers and the preload state machine.
//!
//! ```text
//!   Opening --subscription open--> Preloading --preload timer--> Live
//! ```
//!
//! While `Preloading`, deliveries only fill the cache: they are presumed to
//! be backlog the broker kept for the subscription, which new viewers get
//! through the attach snapshot anyway. The switch to `Live` is a one-shot
//! timer and does not look at what arrived. It is a heuristic cut-over
//! between history and live traffic; a delivery racing the timer can land
//! on either side.

use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::watch;
use tokio::task::AbortHandle;

use super::codec::{self, ChatMessage, Sanitizer};
use super::history::HistoryCache;
use super::viewers::{ViewerId, ViewerRegistry, ViewerSink};
use crate::broker::{Broker, Delivery, Subscription, SubscriptionOptions, get_or_create_subscription};
use crate::utils::error::{RelayError, RelayResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionPhase {
    Opening,
    Preloading,
    Live,
}

/// Point-in-time view of a session, for logs and status queries.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SessionStats {
    pub channel: String,
    pub phase: SessionPhase,
    pub active_viewers: usize,
    pub cached: usize,
    pub last_accessed: Option<DateTime<Utc>>,
}

impl SessionStats {
    pub(crate) fn opening(channel: &str) -> Self {
        Self {
            channel: channel.to_string(),
            phase: SessionPhase::Opening,
            active_viewers: 0,
            cached: 0,
            last_accessed: None,
        }
    }
}

#[derive(Debug)]
struct SessionState {
    cache: HistoryCache,
    viewers: ViewerRegistry,
}

/// Tuning shared by every session the hub opens.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub history_capacity: usize,
    pub preload: Duration,
    pub subscription: SubscriptionOptions,
}

pub struct ChannelSession {
    channel: String,
    subscription: String,
    state: Mutex<SessionState>,
    phase: watch::Sender<SessionPhase>,
    sanitizer: Arc<dyn Sanitizer>,
    tasks: Mutex<Vec<AbortHandle>>,
}

impl std::fmt::Debug for ChannelSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChannelSession")
            .field("channel", &self.channel)
            .field("subscription", &self.subscription)
            .field("phase", &self.phase())
            .finish()
    }
}

impl ChannelSession {
    /// Opens the channel's broker subscription and starts the session in
    /// `Preloading`. Returns as soon as the subscription is open; use
    /// [`ChannelSession::wait_live`] to wait out the preload window.
    pub async fn open(
        broker: &dyn Broker,
        channel: &str,
        config: &SessionConfig,
        sanitizer: Arc<dyn Sanitizer>,
    ) -> RelayResult<Arc<Self>> {
        let subscription = get_or_create_subscription(broker, channel, config.subscription)
            .await
            .map_err(|source| {
                tracing::warn!(channel, error = %source, "couldn't open subscription for channel");
                RelayError::ChannelUnavailable {
                    channel: channel.to_string(),
                    source,
                }
            })?;

        tracing::info!(
            channel,
            subscription = subscription.name(),
            topic = subscription.topic(),
            ordered = subscription.options().ordered,
            "subscription open"
        );

        let (phase, _) = watch::channel(SessionPhase::Preloading);
        let session = Arc::new(Self {
            channel: channel.to_string(),
            subscription: subscription.name().to_string(),
            state: Mutex::new(SessionState {
                cache: HistoryCache::new(config.history_capacity),
                viewers: ViewerRegistry::new(),
            }),
            phase,
            sanitizer,
            tasks: Mutex::new(Vec::new()),
        });

        let pump = tokio::spawn(Arc::clone(&session).pump(subscription));
        let timer = tokio::spawn(Arc::clone(&session).finish_preload(config.preload));
        session
            .lock_tasks()
            .extend([pump.abort_handle(), timer.abort_handle()]);

        tracing::info!(channel, preload_ms = config.preload.as_millis() as u64, "channel session opened, preloading");
        Ok(session)
    }

    pub fn channel(&self) -> &str {
        &self.channel
    }

    pub fn subscription(&self) -> &str {
        &self.subscription
    }

    pub fn phase(&self) -> SessionPhase {
        *self.phase.borrow()
    }

    /// Resolves once the session has gone `Live`.
    pub async fn wait_live(&self) {
        let mut rx = self.phase.subscribe();
        // the sender lives as long as `self`
        let _ = rx.wait_for(|phase| *phase == SessionPhase::Live).await;
    }

    /// Registers `sink` and returns the replay snapshot, oldest timestamp
    /// first.
    pub fn attach(&self, sink: ViewerSink) -> Vec<Arc<ChatMessage>> {
        let mut state = self.lock_state();
        tracing::debug!(channel = %self.channel, viewer = %sink.id(), "viewer attached");
        state.viewers.attach(sink);
        state.cache.sorted_snapshot()
    }

    pub fn detach(&self, viewer: &ViewerId) -> bool {
        let removed = self.lock_state().viewers.detach(viewer);
        if removed {
            tracing::debug!(channel = %self.channel, %viewer, "viewer detached");
        }
        removed
    }

    /// Validates one broker delivery, caches it and, once live, fans it out.
    pub fn handle_delivery(&self, delivery: Delivery) {
        let Some(message) = codec::validate(&delivery, self.sanitizer.as_ref()) else {
            return;
        };
        let message = Arc::new(message);
        let live = self.phase() == SessionPhase::Live;

        let mut state = self.lock_state();
        if live {
            let report = state.viewers.broadcast(&message);
            tracing::trace!(
                channel = %self.channel,
                delivered = report.delivered,
                lagged = report.lagged,
                removed = report.removed.len(),
                "fanned out"
            );
        } else {
            tracing::debug!(channel = %self.channel, id = %delivery.id, "preloading, not fanning out");
        }
        state.cache.append(message);
    }

    pub fn stats(&self) -> SessionStats {
        let state = self.lock_state();
        SessionStats {
            channel: self.channel.clone(),
            phase: self.phase(),
            active_viewers: state.viewers.active_count(),
            cached: state.cache.len(),
            last_accessed: Some(state.viewers.last_accessed()),
        }
    }

    /// Cached messages in arrival order.
    pub fn history(&self) -> Vec<Arc<ChatMessage>> {
        self.lock_state().cache.snapshot()
    }

    /// Stops consuming the subscription. Undelivered broker messages stay
    /// with the broker.
    pub fn close(&self) {
        for task in self.lock_tasks().drain(..) {
            task.abort();
        }
        tracing::info!(channel = %self.channel, "channel session closed");
    }

    async fn pump(self: Arc<Self>, mut subscription: Subscription) {
        while let Some(delivery) = subscription.recv().await {
            self.handle_delivery(delivery);
        }
        tracing::warn!(channel = %self.channel, subscription = %self.subscription, "subscription ended");
    }

    async fn finish_preload(self: Arc<Self>, preload: Duration) {
        tokio::time::sleep(preload).await;
        self.phase.send_replace(SessionPhase::Live);
        tracing::info!(channel = %self.channel, "done preload, channel is live");
    }

    fn lock_state(&self) -> MutexGuard<'_, SessionState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn lock_tasks(&self) -> MutexGuard<'_, Vec<AbortHandle>> {
        self.tasks.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
