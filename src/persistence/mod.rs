//! The `persistence` module keeps the bundled broker's durable state.
//!
//! Topics, subscriptions and the backlog of deliveries that arrived while a
//! subscription had no open handle are stored in `sled`, so a restarted
//! relay re-opens its subscriptions and receives what it missed. This is the
//! backlog the channel preload window is there to absorb.

pub mod sled_store;

pub use sled_store::{Persistence, StoredDelivery};
