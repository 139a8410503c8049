//! Application router assembly.
//!
//! Shared by the `serve` command and the integration tests.

use std::sync::Arc;

use axum::{Router, middleware, routing::get};
use http::{
    HeaderValue, Method,
    header::{AUTHORIZATION, CONTENT_TYPE},
};
use tower_governor::{
    GovernorLayer, governor::GovernorConfigBuilder, key_extractor::SmartIpKeyExtractor,
};
use tower_http::cors::{Any, CorsLayer};
use tower_http::set_header::SetResponseHeaderLayer;
use tracing::{info, warn};

use crate::handlers::api::health_check;
use crate::middleware::{auth_middleware, connection_limit_middleware};
use crate::routes;
use crate::state::AppState;

/// Rates at or above this disable the rate limiter
pub const RATE_LIMIT_DISABLED_THRESHOLD: u32 = 100_000;

/// Build the complete router: health, image proxy and relay, wrapped in CORS,
/// rate limiting and security headers.
///
/// The relay needs `ConnectInfo<SocketAddr>`, so serve the router with
/// `into_make_service_with_connect_info::<SocketAddr>()`.
pub fn build_router(app_state: Arc<AppState>) -> Router {
    let config = &app_state.config;

    // Protected REST routes. `route_layer` keeps unmatched paths a plain 404.
    let protected_routes = routes::api::create_api_router().route_layer(
        middleware::from_fn_with_state(app_state.clone(), auth_middleware),
    );

    // Layer order (outer to inner): connection_limit -> auth -> handler
    let realtime_routes = routes::realtime::create_realtime_router()
        .route_layer(middleware::from_fn_with_state(
            app_state.clone(),
            auth_middleware,
        ))
        .route_layer(middleware::from_fn_with_state(
            app_state.clone(),
            connection_limit_middleware,
        ));

    let public_routes = Router::new().route("/", get(health_check));

    let governor_layer = if config.rate_limit_requests_per_second < RATE_LIMIT_DISABLED_THRESHOLD {
        let governor_config = GovernorConfigBuilder::default()
            .per_second(config.rate_limit_requests_per_second as u64)
            .burst_size(config.rate_limit_burst_size)
            .key_extractor(SmartIpKeyExtractor)
            .finish();
        match governor_config {
            Some(governor_config) => Some(GovernorLayer::new(governor_config)),
            None => {
                warn!("Invalid rate limiter settings, rate limiting disabled");
                None
            }
        }
    } else {
        info!(
            "Rate limiting disabled (rate >= {}/s)",
            RATE_LIMIT_DISABLED_THRESHOLD
        );
        None
    };

    let cors_layer = cors_layer(config.cors_allowed_origins.as_deref());

    let security_headers = tower::ServiceBuilder::new()
        .layer(SetResponseHeaderLayer::overriding(
            http::header::X_CONTENT_TYPE_OPTIONS,
            HeaderValue::from_static("nosniff"),
        ))
        .layer(SetResponseHeaderLayer::overriding(
            http::header::X_FRAME_OPTIONS,
            HeaderValue::from_static("DENY"),
        ));

    public_routes
        .merge(protected_routes)
        .merge(realtime_routes)
        .with_state(app_state)
        .layer(cors_layer)
        .layer(tower::util::option_layer(governor_layer))
        .layer(security_headers)
}

fn cors_layer(origins: Option<&str>) -> CorsLayer {
    let base = CorsLayer::new()
        .allow_methods([Method::GET, Method::OPTIONS])
        .allow_headers([AUTHORIZATION, CONTENT_TYPE]);

    match origins {
        Some("*") => base.allow_origin(Any).allow_credentials(false),
        Some(origins) => {
            let origins: Vec<HeaderValue> = origins
                .split(',')
                .filter_map(|s| s.trim().parse().ok())
                .collect();
            base.allow_origin(origins).allow_credentials(true)
        }
        None => {
            // No allow_origin: browsers block cross-origin requests
            info!(
                "CORS not configured, defaulting to same-origin only. \
                 Set CORS_ALLOWED_ORIGINS to enable cross-origin access."
            );
            base.allow_credentials(false)
        }
    }
}
