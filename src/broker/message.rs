//! What a subscription hands to its consumer.
//!
//! `data` is opaque to the broker; the relay encodes chat messages as JSON.
//! `publish_time` is assigned by the broker and is used by the codec as a
//! fallback when a payload carries no timestamp of its own.

use chrono::{DateTime, Utc};

use crate::persistence::StoredDelivery;

#[derive(Debug, Clone, PartialEq)]
pub struct Delivery {
    pub id: String,
    pub data: Vec<u8>,
    pub publish_time: DateTime<Utc>,
}

impl From<StoredDelivery> for Delivery {
    fn from(stored: StoredDelivery) -> Self {
        Self {
            id: stored.id,
            data: stored.data,
            publish_time: stored.publish_time,
        }
    }
}

impl From<&Delivery> for StoredDelivery {
    fn from(delivery: &Delivery) -> Self {
        Self {
            id: delivery.id.clone(),
            data: delivery.data.clone(),
            publish_time: delivery.publish_time,
        }
    }
}
