//! Image proxy endpoint
//!
//! Fetches a remote image on behalf of the browser so it can be shown without
//! cross-origin restrictions. Targets are checked against SSRF rules, the body
//! is capped at the configured size and the request is bounded by the HTTP
//! client timeout.

use std::sync::Arc;

use axum::{
    body::Body,
    extract::{Query, State},
    http::{HeaderValue, header},
    response::Response,
};
use futures::StreamExt;
use serde::Deserialize;
use tracing::{debug, info};

use crate::errors::app_error::{AppError, AppResult};
use crate::state::AppState;
use crate::utils::validate_fetch_url;

const FALLBACK_CONTENT_TYPE: &str = "application/octet-stream";

#[derive(Debug, Default, Deserialize)]
pub struct ImageProxyParams {
    pub url: Option<String>,
}

/// `GET /proxy-image?url=<url>`
///
/// Responds with the upstream bytes and `Content-Type`.
pub async fn proxy_image(
    State(state): State<Arc<AppState>>,
    Query(params): Query<ImageProxyParams>,
) -> AppResult<Response> {
    let settings = &state.config.image_proxy;
    if !settings.enabled {
        return Err(AppError::NotFound("Image proxy is disabled".to_string()));
    }

    let raw_url = params
        .url
        .filter(|url| !url.trim().is_empty())
        .ok_or_else(|| AppError::InvalidRequest("Missing 'url' query parameter".to_string()))?;

    let url = validate_fetch_url(&raw_url, settings.allow_private_hosts).await?;
    debug!(url = %url, "Proxying image");

    let response = state.http_client.get(url.clone()).send().await?;
    let status = response.status();
    if !status.is_success() {
        return Err(AppError::Upstream(format!("{url} returned {status}")));
    }

    let max_bytes = settings.max_bytes;
    if let Some(length) = response.content_length()
        && length > max_bytes as u64
    {
        return Err(AppError::PayloadTooLarge(format!(
            "image is {length} bytes, limit is {max_bytes}"
        )));
    }

    let content_type = response
        .headers()
        .get(header::CONTENT_TYPE)
        .cloned()
        .unwrap_or_else(|| HeaderValue::from_static(FALLBACK_CONTENT_TYPE));

    let mut body = Vec::new();
    let mut chunks = response.bytes_stream();
    while let Some(chunk) = chunks.next().await {
        let chunk = chunk?;
        if body.len() + chunk.len() > max_bytes {
            return Err(AppError::PayloadTooLarge(format!(
                "image exceeds limit of {max_bytes} bytes"
            )));
        }
        body.extend_from_slice(&chunk);
    }

    info!(url = %url, bytes = body.len(), "Image proxied");

    let mut proxied = Response::new(Body::from(body));
    proxied
        .headers_mut()
        .insert(header::CONTENT_TYPE, content_type);
    Ok(proxied)
}
