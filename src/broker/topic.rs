//! Topic management
//!
//! A `Topic` holds the names of the subscriptions bound to it. Publishing to
//! a topic delivers to every one of them.
//!
//! Callers must synchronize access (the broker keeps topics behind its lock).

use std::collections::BTreeSet;

pub type SubscriptionName = String;

#[derive(Debug, Default)]
pub struct Topic {
    pub name: String,
    pub subscriptions: BTreeSet<SubscriptionName>,
}

impl Topic {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            subscriptions: BTreeSet::new(),
        }
    }

    /// Bind a subscription to the topic. Duplicate binds are ignored.
    pub fn bind(&mut self, subscription: SubscriptionName) {
        self.subscriptions.insert(subscription);
    }
}
