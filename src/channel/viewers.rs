//! Viewer sinks and the per-channel registry that fans messages out to them.
//!
//! A sink is the sending half of a bounded channel. Fan-out never waits on
//! it: a full sink misses that one message, a closed sink is dropped from
//! the registry on the spot.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::mpsc::{self, Receiver, Sender, error::TrySendError};
use uuid::Uuid;

use super::codec::ChatMessage;

pub type ViewerId = String;

#[derive(Debug, Clone)]
pub struct ViewerSink {
    id: ViewerId,
    sender: Sender<Arc<ChatMessage>>,
}

impl ViewerSink {
    /// Creates a sink and the receiver its viewer reads from.
    pub fn channel(buffer: usize) -> (Self, Receiver<Arc<ChatMessage>>) {
        let (sender, receiver) = mpsc::channel(buffer.max(1));
        let sink = Self {
            id: Uuid::new_v4().to_string(),
            sender,
        };
        (sink, receiver)
    }

    pub fn id(&self) -> &ViewerId {
        &self.id
    }

    fn try_deliver(&self, message: &Arc<ChatMessage>) -> Delivered {
        match self.sender.try_send(message.clone()) {
            Ok(()) => Delivered::Yes,
            Err(TrySendError::Full(_)) => Delivered::Lagged,
            Err(TrySendError::Closed(_)) => Delivered::Gone,
        }
    }
}

enum Delivered {
    Yes,
    Lagged,
    Gone,
}

/// Outcome of one fan-out.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct BroadcastReport {
    pub delivered: usize,
    pub lagged: usize,
    pub removed: Vec<ViewerId>,
}

#[derive(Debug)]
pub struct ViewerRegistry {
    sinks: HashMap<ViewerId, ViewerSink>,
    active_count: usize,
    last_accessed: DateTime<Utc>,
}

impl Default for ViewerRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ViewerRegistry {
    pub fn new() -> Self {
        Self {
            sinks: HashMap::new(),
            active_count: 0,
            last_accessed: Utc::now(),
        }
    }

    /// Registers `sink` for future fan-out.
    pub fn attach(&mut self, sink: ViewerSink) {
        if self.sinks.insert(sink.id.clone(), sink).is_none() {
            self.active_count += 1;
        }
        self.last_accessed = Utc::now();
    }

    /// Removes the sink registered under `id`. Returns whether it was there.
    pub fn detach(&mut self, id: &str) -> bool {
        self.last_accessed = Utc::now();
        if self.sinks.remove(id).is_some() {
            self.active_count -= 1;
            true
        } else {
            false
        }
    }

    /// Offers `message` to every registered sink.
    pub fn broadcast(&mut self, message: &Arc<ChatMessage>) -> BroadcastReport {
        let mut report = BroadcastReport::default();

        for (id, sink) in &self.sinks {
            match sink.try_deliver(message) {
                Delivered::Yes => report.delivered += 1,
                Delivered::Lagged => {
                    tracing::warn!(viewer = %id, "viewer is lagging, dropping message for it");
                    report.lagged += 1;
                }
                Delivered::Gone => report.removed.push(id.clone()),
            }
        }

        for id in &report.removed {
            tracing::debug!(viewer = %id, "viewer sink closed, detaching");
            self.detach(id);
        }

        report
    }

    pub fn active_count(&self) -> usize {
        self.active_count
    }

    pub fn last_accessed(&self) -> DateTime<Utc> {
        self.last_accessed
    }

    pub fn contains(&self, id: &str) -> bool {
        self.sinks.contains_key(id)
    }
}
