//! Realtime relay route configuration

use axum::{Router, routing::get};
use tower_http::trace::TraceLayer;

use crate::handlers::relay_handler;
use crate::state::AppState;
use std::sync::Arc;

/// Create the relay WebSocket router
///
/// # Endpoint
///
/// `GET /realtime[?mode=auto|manual]` - WebSocket upgrade
///
/// # Protocol
///
/// The server opens one upstream realtime connection per client and sends
/// the `session.update` initialization event for the selected mode. From then
/// on frames are relayed verbatim in both directions. Client frames sent
/// before the upstream is open are dropped. Upstream failures reach the
/// client as:
///
/// ```json
/// {"type": "error", "error": "Connection failed: ..."}
/// ```
///
/// # Authentication
///
/// Uses the same auth middleware as REST endpoints; browsers pass the token
/// as `?token=`.
pub fn create_realtime_router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/realtime", get(relay_handler))
        .layer(TraceLayer::new_for_http())
}
