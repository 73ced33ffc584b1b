//! The `utils` module provides a collection of utility functions and common
//! definitions used across the relay.
//!
//! It centralizes the error taxonomy shared by the hub and the transport,
//! and the one-time tracing subscriber setup.

pub mod error;
pub mod logging;

pub use error::RelayError;
