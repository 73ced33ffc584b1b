use std::collections::VecDeque;
use std::sync::Arc;

use super::codec::ChatMessage;

/// Default number of messages replayed to a viewer on attach.
pub const MAX_MESSAGE_CACHE_LENGTH: usize = 50;

/// Fixed-capacity replay buffer, oldest first.
///
/// Order is arrival order; reading never reorders or refreshes entries.
#[derive(Debug)]
pub struct HistoryCache {
    capacity: usize,
    messages: VecDeque<Arc<ChatMessage>>,
}

impl Default for HistoryCache {
    fn default() -> Self {
        Self::new(MAX_MESSAGE_CACHE_LENGTH)
    }
}

impl HistoryCache {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            messages: VecDeque::with_capacity(capacity + 1),
        }
    }

    /// Appends to the tail, evicting the single oldest entry on overflow.
    pub fn append(&mut self, message: Arc<ChatMessage>) {
        self.messages.push_back(message);
        if self.messages.len() > self.capacity {
            self.messages.pop_front();
        }
    }

    /// Contents in arrival order.
    pub fn snapshot(&self) -> Vec<Arc<ChatMessage>> {
        self.messages.iter().cloned().collect()
    }

    /// Contents ordered by each message's own timestamp. Ties keep arrival
    /// order.
    pub fn sorted_snapshot(&self) -> Vec<Arc<ChatMessage>> {
        let mut snapshot = self.snapshot();
        snapshot.sort_by_key(|m| m.timestamp());
        snapshot
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}
