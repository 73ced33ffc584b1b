//! Broker collaborator
//!
//! The relay never routes chat messages through its own memory alone: every
//! post is published to a broker topic named after the channel, and each
//! channel session consumes that topic through one subscription. This module
//! defines the narrow [`Broker`] interface the relay relies on and ships
//! [`MemoryBroker`], an in-process implementation with durable backlog.

pub mod engine;
pub mod message;
pub mod subscription;
pub mod topic;

use async_trait::async_trait;
use thiserror::Error;

pub use engine::MemoryBroker;
pub use message::Delivery;
pub use subscription::{Subscription, SubscriptionOptions};

#[derive(Debug, Error)]
pub enum BrokerError {
    #[error("topic not found: {0}")]
    TopicNotFound(String),
    #[error("topic already exists: {0}")]
    TopicExists(String),
    #[error("subscription not found: {0}")]
    SubscriptionNotFound(String),
    #[error("subscription already exists: {0}")]
    SubscriptionExists(String),
    #[error("broker storage error: {0}")]
    Storage(#[from] sled::Error),
    #[error("broker codec error: {0}")]
    Codec(#[from] serde_json::Error),
}

pub type BrokerResult<T> = Result<T, BrokerError>;

#[async_trait]
pub trait Broker: Send + Sync {
    async fn topic_exists(&self, topic: &str) -> BrokerResult<bool>;

    async fn list_topics(&self) -> BrokerResult<Vec<String>>;

    async fn create_topic(&self, topic: &str) -> BrokerResult<()>;

    async fn subscription_exists(&self, name: &str) -> BrokerResult<bool>;

    /// Creates a subscription bound to `topic` and returns an open handle.
    async fn create_subscription(
        &self,
        topic: &str,
        name: &str,
        options: SubscriptionOptions,
    ) -> BrokerResult<Subscription>;

    /// Opens a handle on an existing subscription. Any previously opened
    /// handle for the same subscription stops receiving.
    async fn open_subscription(&self, name: &str) -> BrokerResult<Subscription>;

    /// Publishes `payload` to `topic`, returning the broker-assigned id.
    async fn publish(&self, topic: &str, payload: Vec<u8>) -> BrokerResult<String>;
}

/// Subscription name the relay uses for a channel.
pub fn subscription_name(channel: &str) -> String {
    format!("{channel}-relay")
}

/// Re-opens the channel's subscription if the broker already knows it,
/// otherwise creates it.
pub async fn get_or_create_subscription(
    broker: &dyn Broker,
    channel: &str,
    options: SubscriptionOptions,
) -> BrokerResult<Subscription> {
    let name = subscription_name(channel);
    if broker.subscription_exists(&name).await? {
        tracing::debug!(channel, subscription = %name, "re-opening existing subscription");
        broker.open_subscription(&name).await
    } else {
        tracing::debug!(channel, subscription = %name, "creating subscription");
        broker.create_subscription(channel, &name, options).await
    }
}
