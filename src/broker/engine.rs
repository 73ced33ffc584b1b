//! In-process broker engine
//!
//! `MemoryBroker` keeps topics and subscriptions in memory and mirrors them
//! to [`Persistence`] so they survive a restart. Each subscription has at
//! most one open handle. A publish is pushed straight into the open handle's
//! channel; when there is none (or the handle was dropped) the delivery is
//! parked in the subscription's backlog and replayed, in publish order, to
//! the next handle opened on it.
//!
//! The public API is async to satisfy [`Broker`], but nothing here awaits
//! while holding the state lock.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::mpsc::{self, UnboundedSender};
use uuid::Uuid;

use super::message::Delivery;
use super::subscription::{Subscription, SubscriptionOptions};
use super::topic::Topic;
use super::{Broker, BrokerError, BrokerResult};
use crate::persistence::Persistence;
use crate::persistence::sled_store::StoredSubscription;

#[derive(Debug)]
struct SubscriptionState {
    topic: String,
    options: SubscriptionOptions,
    sender: Option<UnboundedSender<Delivery>>,
}

#[derive(Debug, Default)]
struct BrokerState {
    topics: HashMap<String, Topic>,
    subscriptions: HashMap<String, SubscriptionState>,
}

#[derive(Debug)]
pub struct MemoryBroker {
    state: Mutex<BrokerState>,
    persistence: Persistence,
}

impl MemoryBroker {
    /// A broker whose state disappears with the process.
    pub fn temporary() -> BrokerResult<Self> {
        Self::with_persistence(Persistence::temporary()?)
    }

    /// Opens a durable broker at `path`, or a temporary one when `None`.
    pub fn open(path: Option<&str>) -> BrokerResult<Self> {
        match path {
            Some(path) => Self::with_persistence(Persistence::open(path)?),
            None => Self::temporary(),
        }
    }

    /// Builds the broker from whatever `persistence` already holds.
    pub fn with_persistence(persistence: Persistence) -> BrokerResult<Self> {
        let mut state = BrokerState::default();

        for name in persistence.load_topics()? {
            state.topics.insert(name.clone(), Topic::new(&name));
        }

        for sub in persistence.load_subscriptions()? {
            let Some(topic) = state.topics.get_mut(&sub.topic) else {
                tracing::warn!(subscription = %sub.name, topic = %sub.topic, "subscription bound to unknown topic, skipping");
                continue;
            };
            topic.bind(sub.name.clone());
            state.subscriptions.insert(
                sub.name,
                SubscriptionState {
                    topic: sub.topic,
                    options: SubscriptionOptions {
                        ordered: sub.ordered,
                    },
                    sender: None,
                },
            );
        }

        tracing::info!(
            topics = state.topics.len(),
            subscriptions = state.subscriptions.len(),
            "broker state loaded"
        );

        Ok(Self {
            state: Mutex::new(state),
            persistence,
        })
    }

    /// Number of deliveries waiting for `subscription` to be opened.
    pub fn backlog_len(&self, subscription: &str) -> BrokerResult<usize> {
        self.persistence.backlog_len(subscription)
    }

    fn lock(&self) -> MutexGuard<'_, BrokerState> {
        // a panic while holding the lock cannot leave the maps half-updated
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Hands a new delivery to every subscription of `topic`, parking it for
    /// those without an open handle. Returns the id and how many were parked.
    fn deliver(&self, topic: &str, payload: Vec<u8>) -> BrokerResult<(String, usize)> {
        let mut state = self.lock();
        let BrokerState {
            topics,
            subscriptions,
        } = &mut *state;

        let t = topics
            .get(topic)
            .ok_or_else(|| BrokerError::TopicNotFound(topic.to_string()))?;

        let delivery = Delivery {
            id: Uuid::new_v4().to_string(),
            data: payload,
            publish_time: Utc::now(),
        };

        let mut parked = 0;
        for name in &t.subscriptions {
            let Some(sub) = subscriptions.get_mut(name) else {
                continue;
            };

            let delivered = match &sub.sender {
                Some(sender) => sender.send(delivery.clone()).is_ok(),
                None => false,
            };

            if !delivered {
                if sub.sender.take().is_some() {
                    tracing::debug!(subscription = %name, "subscription handle gone, parking deliveries");
                }
                self.persistence.push_backlog(name, &(&delivery).into())?;
                parked += 1;
            }
        }

        Ok((delivery.id, parked))
    }

    /// Wires a fresh handle to `name`, replaying its backlog first.
    fn attach_handle(&self, state: &mut BrokerState, name: &str) -> BrokerResult<Subscription> {
        let sub = state
            .subscriptions
            .get_mut(name)
            .ok_or_else(|| BrokerError::SubscriptionNotFound(name.to_string()))?;

        let (tx, rx) = mpsc::unbounded_channel();
        let backlog = self.persistence.drain_backlog(name)?;
        if !backlog.is_empty() {
            tracing::info!(subscription = name, count = backlog.len(), "replaying backlog");
        }
        for stored in backlog {
            // rx is alive right here, so this cannot fail
            let _ = tx.send(Delivery::from(stored));
        }

        sub.sender = Some(tx);
        Ok(Subscription::new(name, sub.topic.clone(), sub.options, rx))
    }
}

#[async_trait]
impl Broker for MemoryBroker {
    async fn topic_exists(&self, topic: &str) -> BrokerResult<bool> {
        Ok(self.lock().topics.contains_key(topic))
    }

    async fn list_topics(&self) -> BrokerResult<Vec<String>> {
        let mut topics: Vec<String> = self.lock().topics.keys().cloned().collect();
        topics.sort();
        Ok(topics)
    }

    async fn create_topic(&self, topic: &str) -> BrokerResult<()> {
        let mut state = self.lock();
        if state.topics.contains_key(topic) {
            return Err(BrokerError::TopicExists(topic.to_string()));
        }
        self.persistence.store_topic(topic)?;
        state.topics.insert(topic.to_string(), Topic::new(topic));
        tracing::info!(topic, "topic created");
        Ok(())
    }

    async fn subscription_exists(&self, name: &str) -> BrokerResult<bool> {
        Ok(self.lock().subscriptions.contains_key(name))
    }

    async fn create_subscription(
        &self,
        topic: &str,
        name: &str,
        options: SubscriptionOptions,
    ) -> BrokerResult<Subscription> {
        let mut state = self.lock();
        if !state.topics.contains_key(topic) {
            return Err(BrokerError::TopicNotFound(topic.to_string()));
        }
        if state.subscriptions.contains_key(name) {
            return Err(BrokerError::SubscriptionExists(name.to_string()));
        }

        self.persistence.store_subscription(&StoredSubscription {
            name: name.to_string(),
            topic: topic.to_string(),
            ordered: options.ordered,
        })?;

        if let Some(t) = state.topics.get_mut(topic) {
            t.bind(name.to_string());
        }
        state.subscriptions.insert(
            name.to_string(),
            SubscriptionState {
                topic: topic.to_string(),
                options,
                sender: None,
            },
        );
        tracing::info!(topic, subscription = name, ordered = options.ordered, "subscription created");

        self.attach_handle(&mut state, name)
    }

    async fn open_subscription(&self, name: &str) -> BrokerResult<Subscription> {
        let mut state = self.lock();
        self.attach_handle(&mut state, name)
    }

    async fn publish(&self, topic: &str, payload: Vec<u8>) -> BrokerResult<String> {
        let (id, parked) = self.deliver(topic, payload)?;

        if parked > 0 {
            // sled flushes synchronously; keep it off the lock and the async workers
            let persistence = self.persistence.clone();
            match tokio::task::spawn_blocking(move || persistence.flush()).await {
                Ok(flushed) => flushed?,
                Err(e) => tracing::warn!(error = %e, "backlog flush task failed"),
            }
        }

        tracing::trace!(topic, %id, parked, "published");
        Ok(id)
    }
}
