//! Environment variable loading.
//!
//! Produces the base [`ServerConfig`] that YAML values are layered over.

use std::env;
use std::path::PathBuf;
use std::str::FromStr;

use super::{AuthApiSecret, ServerConfig, TlsConfig, parse_auth_api_secrets_json};
use crate::core::realtime::SessionMode;

/// Id assigned to the secret given by `AUTH_API_SECRET` when no id is set.
pub(super) const DEFAULT_API_SECRET_ID: &str = "default";

fn var(name: &str) -> Option<String> {
    env::var(name).ok().filter(|value| !value.trim().is_empty())
}

fn parse_var<T>(name: &str) -> Result<Option<T>, Box<dyn std::error::Error>>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match var(name) {
        Some(raw) => raw
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|e| format!("Invalid value for {name} '{raw}': {e}").into()),
        None => Ok(None),
    }
}

fn parse_bool(name: &str) -> Result<Option<bool>, Box<dyn std::error::Error>> {
    match var(name) {
        Some(raw) => match raw.trim().to_ascii_lowercase().as_str() {
            "1" | "true" | "yes" | "on" => Ok(Some(true)),
            "0" | "false" | "no" | "off" => Ok(Some(false)),
            _ => Err(format!("Invalid boolean for {name}: '{raw}'").into()),
        },
        None => Ok(None),
    }
}

/// Explicit `AUTH_REQUIRED` setting, if any.
pub(super) fn auth_required_from_env() -> Result<Option<bool>, Box<dyn std::error::Error>> {
    parse_bool("AUTH_REQUIRED")
}

/// Secrets from `AUTH_API_SECRETS_JSON`, falling back to the single
/// `AUTH_API_SECRET` / `AUTH_API_SECRET_ID` pair.
fn auth_api_secrets_from_env() -> Result<Vec<AuthApiSecret>, Box<dyn std::error::Error>> {
    if let Some(json) = var("AUTH_API_SECRETS_JSON") {
        return parse_auth_api_secrets_json(&json);
    }

    Ok(var("AUTH_API_SECRET")
        .map(|secret| {
            vec![AuthApiSecret {
                id: var("AUTH_API_SECRET_ID")
                    .unwrap_or_else(|| DEFAULT_API_SECRET_ID.to_string()),
                secret,
            }]
        })
        .unwrap_or_default())
}

fn tls_from_env() -> Result<Option<TlsConfig>, Box<dyn std::error::Error>> {
    match (var("TLS_CERT_PATH"), var("TLS_KEY_PATH")) {
        (Some(cert), Some(key)) => Ok(Some(TlsConfig {
            cert_path: PathBuf::from(cert),
            key_path: PathBuf::from(key),
        })),
        (None, None) => Ok(None),
        _ => Err("TLS_CERT_PATH and TLS_KEY_PATH must be set together".into()),
    }
}

/// Build a configuration from environment variables over defaults.
pub(super) fn load_from_env() -> Result<ServerConfig, Box<dyn std::error::Error>> {
    let mut config = ServerConfig::default();

    if let Some(host) = var("HOST") {
        config.host = host;
    }
    if let Some(port) = parse_var::<u16>("PORT")? {
        config.port = port;
    }
    config.tls = tls_from_env()?;

    config.openai_api_key = var("OPENAI_API_KEY").or_else(|| var("REACT_APP_OPENAI_API_KEY"));

    if let Some(url) = var("REALTIME_URL") {
        config.realtime_url = url;
    }
    if let Some(model) = var("REALTIME_MODEL") {
        config.realtime_model = model;
    }
    if let Some(voice) = var("REALTIME_VOICE") {
        config.realtime_voice = voice;
    }
    if let Some(mode) = var("REALTIME_DEFAULT_MODE") {
        config.default_mode = SessionMode::from_str(&mode)
            .map_err(|e| format!("Invalid value for REALTIME_DEFAULT_MODE: {e}"))?;
    }
    if let Some(secs) = parse_var::<u64>("REALTIME_CONNECT_TIMEOUT_SECONDS")? {
        config.realtime_connect_timeout_seconds = secs;
    }
    if let Some(secs) = parse_var::<u64>("RELAY_IDLE_TIMEOUT_SECONDS")? {
        config.relay_idle_timeout_seconds = secs;
    }

    config.auth_api_secrets = auth_api_secrets_from_env()?;
    config.auth_required = auth_required_from_env()?.unwrap_or(!config.auth_api_secrets.is_empty());

    config.cors_allowed_origins = var("CORS_ALLOWED_ORIGINS");
    if let Some(rps) = parse_var::<u32>("RATE_LIMIT_REQUESTS_PER_SECOND")? {
        config.rate_limit_requests_per_second = rps;
    }
    if let Some(burst) = parse_var::<u32>("RATE_LIMIT_BURST_SIZE")? {
        config.rate_limit_burst_size = burst;
    }
    config.max_websocket_connections = parse_var::<usize>("MAX_WEBSOCKET_CONNECTIONS")?;
    if let Some(per_ip) = parse_var::<u32>("MAX_CONNECTIONS_PER_IP")? {
        config.max_connections_per_ip = per_ip;
    }

    if let Some(enabled) = parse_bool("IMAGE_PROXY_ENABLED")? {
        config.image_proxy.enabled = enabled;
    }
    if let Some(max_bytes) = parse_var::<usize>("IMAGE_PROXY_MAX_BYTES")? {
        config.image_proxy.max_bytes = max_bytes;
    }
    if let Some(secs) = parse_var::<u64>("IMAGE_PROXY_TIMEOUT_SECONDS")? {
        config.image_proxy.timeout_seconds = secs;
    }
    if let Some(allow) = parse_bool("IMAGE_PROXY_ALLOW_PRIVATE_HOSTS")? {
        config.image_proxy.allow_private_hosts = allow;
    }

    Ok(config)
}
