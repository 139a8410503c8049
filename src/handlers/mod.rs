//! HTTP and WebSocket request handlers
//!
//! - `api` - Health check endpoint
//! - `image_proxy` - Remote image fetch for the overlay
//! - `relay` - Realtime audio relay WebSocket

pub mod api;
pub mod image_proxy;
pub mod relay;

pub use relay::relay_handler;
