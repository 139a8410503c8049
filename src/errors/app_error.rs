use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde_json::json;
use thiserror::Error;

use crate::utils::UrlValidationError;

/// Errors surfaced by REST handlers
#[derive(Debug, Error)]
pub enum AppError {
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Blocked URL: {0}")]
    Blocked(String),

    #[error("Payload too large: {0}")]
    PayloadTooLarge(String),

    #[error("Upstream request failed: {0}")]
    Upstream(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

pub type AppResult<T> = Result<T, AppError>;

impl AppError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::InvalidRequest(_) => StatusCode::BAD_REQUEST,
            Self::Blocked(_) => StatusCode::FORBIDDEN,
            Self::PayloadTooLarge(_) => StatusCode::PAYLOAD_TOO_LARGE,
            Self::Upstream(_) => StatusCode::BAD_GATEWAY,
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl From<UrlValidationError> for AppError {
    fn from(error: UrlValidationError) -> Self {
        match error {
            UrlValidationError::PrivateIpDetected(_) => Self::Blocked(error.to_string()),
            UrlValidationError::DnsResolutionFailed(_) => Self::Upstream(error.to_string()),
            _ => Self::InvalidRequest(error.to_string()),
        }
    }
}

impl From<reqwest::Error> for AppError {
    fn from(error: reqwest::Error) -> Self {
        if error.is_timeout() {
            Self::Upstream(format!("timed out: {error}"))
        } else {
            Self::Upstream(error.to_string())
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        if status.is_server_error() {
            tracing::error!(error = %self, "Request failed");
        } else {
            tracing::debug!(error = %self, "Request rejected");
        }
        (status, Json(json!({ "error": self.to_string() }))).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{IpAddr, Ipv4Addr};

    #[test]
    fn test_url_validation_mapping() {
        let blocked: AppError =
            UrlValidationError::PrivateIpDetected(IpAddr::V4(Ipv4Addr::LOCALHOST)).into();
        assert_eq!(blocked.status_code(), StatusCode::FORBIDDEN);

        let scheme: AppError = UrlValidationError::UnsupportedScheme("ftp".into()).into();
        assert_eq!(scheme.status_code(), StatusCode::BAD_REQUEST);

        let dns: AppError = UrlValidationError::DnsResolutionFailed("nowhere".into()).into();
        assert_eq!(dns.status_code(), StatusCode::BAD_GATEWAY);
    }

    #[test]
    fn test_into_response() {
        let response = AppError::PayloadTooLarge("12 MiB".into()).into_response();
        assert_eq!(response.status(), StatusCode::PAYLOAD_TOO_LARGE);
    }
}
