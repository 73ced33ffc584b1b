//! The `client` module defines a connected transport client.
//!
//! A client is one WebSocket connection: it has a generated guest identity,
//! used as the author of everything it posts, and the sending side of its
//! outbound frame queue.

pub mod pubsub_client;
pub use pubsub_client::Client;
