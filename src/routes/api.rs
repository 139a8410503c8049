use axum::{Router, routing::get};
use tower_http::trace::TraceLayer;

use crate::handlers::image_proxy;
use crate::state::AppState;
use std::sync::Arc;

/// Create the API router with protected routes
///
/// Note: Authentication middleware is applied by the application router
pub fn create_api_router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/proxy-image", get(image_proxy::proxy_image))
        .layer(TraceLayer::new_for_http())
}
