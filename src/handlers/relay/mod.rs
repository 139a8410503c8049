//! WebSocket relay between a browser client and the hosted realtime API.

mod handler;

pub use handler::{RelayParams, relay_handler};
