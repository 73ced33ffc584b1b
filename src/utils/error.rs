//! The `error` module defines the error types surfaced by the relay core.
//!
//! Only two kinds of failure ever reach a viewer or poster: a channel whose
//! session cannot be opened, and a post aimed at a channel that does not
//! exist. Malformed deliveries and dead viewer sinks are recovered locally
//! and never show up here.

use thiserror::Error;

use crate::broker::BrokerError;

pub type RelayResult<T> = Result<T, RelayError>;

#[derive(Debug, Error)]
pub enum RelayError {
    /// The broker could not provide a subscription for the channel.
    #[error("channel unavailable: {channel}")]
    ChannelUnavailable {
        channel: String,
        #[source]
        source: BrokerError,
    },

    /// A post targeted a channel whose topic does not exist.
    #[error("channel not found: {0}")]
    NotFound(String),

    #[error("channel already exists: {0}")]
    AlreadyExists(String),

    #[error("invalid channel name: {0}")]
    InvalidChannelName(String),

    #[error("invalid message: {0}")]
    InvalidMessage(String),

    #[error(transparent)]
    Broker(#[from] BrokerError),
}
