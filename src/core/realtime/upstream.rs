//! Upstream leg of a relay session.
//!
//! Opens the WebSocket to the hosted realtime endpoint with the server's
//! credential and sends the `session.update` initialization event before the
//! connection is handed to the relay.

use std::time::Duration;

use futures_util::SinkExt;
use thiserror::Error;
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::{self, Message, client::IntoClientRequest};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tracing::info;
use url::Url;
use zeroize::Zeroize;

use super::config::{REALTIME_BETA_HEADER, REALTIME_BETA_VALUE, SessionMode};
use super::events::{ClientEvent, SessionConfig};

/// Errors that can occur while opening or using the upstream connection.
#[derive(Debug, Error)]
pub enum RealtimeError {
    #[error("Invalid configuration: {0}")]
    InvalidConfiguration(String),

    #[error("Authentication failed: {0}")]
    AuthenticationFailed(String),

    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    #[error("WebSocket error: {0}")]
    WebSocketError(String),

    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    #[error("Operation timed out: {0}")]
    Timeout(String),
}

pub type RealtimeResult<T> = Result<T, RealtimeError>;

pub type UpstreamSocket = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Everything needed to open one upstream connection.
#[derive(Clone)]
pub struct UpstreamConfig {
    pub url: String,
    pub model: String,
    pub voice: String,
    pub api_key: Option<String>,
    pub connect_timeout: Duration,
}

impl std::fmt::Debug for UpstreamConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UpstreamConfig")
            .field("url", &self.url)
            .field("model", &self.model)
            .field("voice", &self.voice)
            .field("api_key", &self.api_key.as_ref().map(|_| "<redacted>"))
            .field("connect_timeout", &self.connect_timeout)
            .finish()
    }
}

impl Drop for UpstreamConfig {
    fn drop(&mut self) {
        if let Some(ref mut key) = self.api_key {
            key.zeroize();
        }
    }
}

impl UpstreamConfig {
    /// Endpoint URL with the model as a query parameter.
    pub fn endpoint(&self) -> RealtimeResult<Url> {
        let mut url = Url::parse(&self.url)
            .map_err(|e| RealtimeError::InvalidConfiguration(format!("{}: {e}", self.url)))?;
        match url.scheme() {
            "ws" | "wss" => {}
            other => {
                return Err(RealtimeError::InvalidConfiguration(format!(
                    "Realtime URL must use ws or wss, got {other}"
                )));
            }
        }
        url.query_pairs_mut().append_pair("model", &self.model);
        Ok(url)
    }

    /// Build the handshake request carrying the credential headers.
    pub fn build_request(&self) -> RealtimeResult<http::Request<()>> {
        let api_key = self
            .api_key
            .as_deref()
            .filter(|key| !key.is_empty())
            .ok_or_else(|| {
                RealtimeError::AuthenticationFailed(
                    "OpenAI API key not configured in server environment".to_string(),
                )
            })?;

        let mut request = self
            .endpoint()?
            .as_str()
            .into_client_request()
            .map_err(|e| RealtimeError::InvalidConfiguration(e.to_string()))?;

        let headers = request.headers_mut();
        headers.insert(
            http::header::AUTHORIZATION,
            http::HeaderValue::from_str(&format!("Bearer {api_key}"))
                .map_err(|e| RealtimeError::InvalidConfiguration(e.to_string()))?,
        );
        headers.insert(
            REALTIME_BETA_HEADER,
            http::HeaderValue::from_static(REALTIME_BETA_VALUE),
        );

        Ok(request)
    }

    /// The initialization event for a session in `mode`.
    pub fn session_update(&self, mode: SessionMode) -> ClientEvent {
        ClientEvent::SessionUpdate {
            session: SessionConfig::for_mode(&self.model, &self.voice, mode),
        }
    }
}

/// Open the upstream connection and send the initialization event.
///
/// The returned socket is ready for verbatim forwarding.
pub async fn connect_upstream(
    config: &UpstreamConfig,
    mode: SessionMode,
) -> RealtimeResult<UpstreamSocket> {
    let request = config.build_request()?;

    let (mut socket, response) =
        tokio::time::timeout(config.connect_timeout, tokio_tungstenite::connect_async(request))
            .await
            .map_err(|_| {
                RealtimeError::Timeout(format!(
                    "Realtime connection not established within {:?}",
                    config.connect_timeout
                ))
            })?
            .map_err(map_handshake_error)?;

    info!(
        status = %response.status(),
        model = %config.model,
        mode = %mode,
        "Connected to realtime API"
    );

    let init = config.session_update(mode).to_json()?;
    socket
        .send(Message::Text(init.into()))
        .await
        .map_err(|e| RealtimeError::WebSocketError(e.to_string()))?;

    Ok(socket)
}

fn map_handshake_error(error: tungstenite::Error) -> RealtimeError {
    match error {
        tungstenite::Error::Http(response)
            if response.status() == http::StatusCode::UNAUTHORIZED
                || response.status() == http::StatusCode::FORBIDDEN =>
        {
            RealtimeError::AuthenticationFailed(format!(
                "Realtime API rejected credentials ({})",
                response.status()
            ))
        }
        other => RealtimeError::ConnectionFailed(other.to_string()),
    }
}
