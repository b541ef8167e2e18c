//! Browser-facing transports.

pub mod websocket;

pub use websocket::{start_listener, AcceptedTerminal};
