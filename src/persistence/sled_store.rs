use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sled::{Db, Tree};

use crate::broker::BrokerError;

const TOPICS_TREE: &str = "__topics";
const SUBSCRIPTIONS_TREE: &str = "__subscriptions";
const BACKLOG_PREFIX: &str = "backlog/";

/// A delivery parked for a subscription that had no open handle.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct StoredDelivery {
    pub id: String,
    pub data: Vec<u8>,
    pub publish_time: DateTime<Utc>,
}

/// Subscription metadata as persisted.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct StoredSubscription {
    pub name: String,
    pub topic: String,
    pub ordered: bool,
}

#[derive(Clone)]
pub struct Persistence {
    db: Db,
}

impl Persistence {
    /// Opens (or creates) the store at `path`.
    pub fn open(path: &str) -> Result<Self, BrokerError> {
        let db = sled::open(path)?;
        Ok(Self { db })
    }

    /// A store that is removed when the last handle is dropped.
    pub fn temporary() -> Result<Self, BrokerError> {
        let db = sled::Config::new().temporary(true).open()?;
        Ok(Self { db })
    }

    pub fn store_topic(&self, topic: &str) -> Result<(), BrokerError> {
        self.db
            .open_tree(TOPICS_TREE)?
            .insert(topic.as_bytes(), Vec::<u8>::new())?;
        self.db.flush()?;
        Ok(())
    }

    pub fn load_topics(&self) -> Result<Vec<String>, BrokerError> {
        let tree = self.db.open_tree(TOPICS_TREE)?;
        let mut topics = Vec::new();
        for entry in tree.iter() {
            let (key, _) = entry?;
            topics.push(String::from_utf8_lossy(&key).into_owned());
        }
        Ok(topics)
    }

    pub fn store_subscription(&self, sub: &StoredSubscription) -> Result<(), BrokerError> {
        let serialized = serde_json::to_vec(sub)?;
        self.db
            .open_tree(SUBSCRIPTIONS_TREE)?
            .insert(sub.name.as_bytes(), serialized)?;
        self.db.flush()?;
        Ok(())
    }

    pub fn load_subscriptions(&self) -> Result<Vec<StoredSubscription>, BrokerError> {
        let tree = self.db.open_tree(SUBSCRIPTIONS_TREE)?;
        let mut subs = Vec::new();
        for entry in tree.iter() {
            let (_, value) = entry?;
            match serde_json::from_slice(&value) {
                Ok(sub) => subs.push(sub),
                Err(e) => tracing::warn!(error = %e, "skipping unreadable subscription record"),
            }
        }
        Ok(subs)
    }

    /// Appends a delivery to the subscription's backlog.
    ///
    /// Keys come from `sled::Db::generate_id`, which is monotonic, so the
    /// tree iterates in publish order. Not flushed here; callers batch a
    /// [`Persistence::flush`] after parking.
    pub fn push_backlog(
        &self,
        subscription: &str,
        delivery: &StoredDelivery,
    ) -> Result<(), BrokerError> {
        let serialized = serde_json::to_vec(delivery)?;
        let key = self.db.generate_id()?;
        self.backlog_tree(subscription)?
            .insert(key.to_be_bytes(), serialized)?;
        Ok(())
    }

    /// Removes and returns everything parked for `subscription`, oldest first.
    pub fn drain_backlog(&self, subscription: &str) -> Result<Vec<StoredDelivery>, BrokerError> {
        let tree = self.backlog_tree(subscription)?;
        let mut drained = Vec::new();
        while let Some((_, value)) = tree.pop_min()? {
            match serde_json::from_slice(&value) {
                Ok(delivery) => drained.push(delivery),
                Err(e) => tracing::warn!(subscription, error = %e, "dropping unreadable backlog entry"),
            }
        }
        Ok(drained)
    }

    /// Blocks until everything written so far is on disk.
    pub fn flush(&self) -> Result<(), BrokerError> {
        self.db.flush()?;
        Ok(())
    }

    pub fn backlog_len(&self, subscription: &str) -> Result<usize, BrokerError> {
        Ok(self.backlog_tree(subscription)?.len())
    }

    fn backlog_tree(&self, subscription: &str) -> Result<Tree, BrokerError> {
        Ok(self.db.open_tree(format!("{BACKLOG_PREFIX}{subscription}"))?)
    }
}

impl std::fmt::Debug for Persistence {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Persistence")
            .field("db", &"sled::Db")
            .finish()
    }
}
