//! # chatrelay
//!
//! A real-time chat relay. Clients post messages to named channels and
//! receive, per channel, a short replay of recent history followed by a
//! live, ordered stream. Every post goes through a publish/subscribe broker;
//! the relay keeps exactly one broker subscription per channel and
//! multiplexes it to all connected viewers.
//!
//! ## Core Modules
//!
//! - `channel`: the fan-out and history-cache core (codec, cache, viewer
//!   registry, channel sessions, hub).
//! - `broker`: the broker interface and a durable in-process broker.
//! - `persistence`: sled storage behind the in-process broker.
//! - `client`: a connected WebSocket client and its guest identity.
//! - `transport`: the WebSocket server and its JSON protocol.
//! - `config`: layered settings.
//! - `utils`: errors and logging.

pub mod broker;
pub mod channel;
pub mod client;
pub mod config;
pub mod persistence;
pub mod transport;
pub mod utils;
