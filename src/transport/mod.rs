//! The `transport` module carries the relay over WebSockets.
//!
//! It defines the JSON protocol between clients and the relay and the
//! server loop that turns client frames into hub calls and hub fan-out into
//! outbound frames.

pub mod message;
pub mod websocket;

pub use message::{ClientMessage, ServerMessage};
pub use websocket::{serve, start_websocket_server};
