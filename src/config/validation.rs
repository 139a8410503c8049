//! Configuration validation logic.

use std::collections::HashSet;

use url::Url;

use super::ServerConfig;
use crate::core::realtime::RealtimeVoice;

/// Validate the merged configuration.
pub(super) fn validate(config: &ServerConfig) -> Result<(), Box<dyn std::error::Error>> {
    validate_auth(config)?;
    validate_realtime(config)?;
    validate_tls(config)?;
    validate_limits(config)?;
    Ok(())
}

fn validate_auth(config: &ServerConfig) -> Result<(), Box<dyn std::error::Error>> {
    let mut seen = HashSet::new();
    for entry in &config.auth_api_secrets {
        if entry.id.trim().is_empty() {
            return Err("API secret entries must have a non-empty id".into());
        }
        if entry.secret.is_empty() {
            return Err(format!("API secret '{}' is empty", entry.id).into());
        }
        if !seen.insert(entry.id.as_str()) {
            return Err(format!("Duplicate API secret id '{}'", entry.id).into());
        }
    }

    if config.auth_required && config.auth_api_secrets.is_empty() {
        return Err(
            "AUTH_REQUIRED is enabled but no API secrets are configured (set AUTH_API_SECRET or AUTH_API_SECRETS_JSON)"
                .into(),
        );
    }

    Ok(())
}

fn validate_realtime(config: &ServerConfig) -> Result<(), Box<dyn std::error::Error>> {
    let url = Url::parse(&config.realtime_url)
        .map_err(|e| format!("Invalid REALTIME_URL '{}': {e}", config.realtime_url))?;
    if !matches!(url.scheme(), "ws" | "wss") {
        return Err(format!(
            "REALTIME_URL must use ws:// or wss://, got '{}'",
            config.realtime_url
        )
        .into());
    }

    if config.realtime_model.trim().is_empty() {
        return Err("REALTIME_MODEL must not be empty".into());
    }

    if RealtimeVoice::parse(&config.realtime_voice).is_none() {
        let known: Vec<&str> = RealtimeVoice::all().iter().map(|v| v.as_str()).collect();
        return Err(format!(
            "Unknown realtime voice '{}', expected one of: {}",
            config.realtime_voice,
            known.join(", ")
        )
        .into());
    }

    if config.realtime_connect_timeout_seconds == 0 {
        return Err("Realtime connect timeout must be greater than zero".into());
    }
    if config.relay_idle_timeout_seconds == 0 {
        return Err("RELAY_IDLE_TIMEOUT_SECONDS must be greater than zero".into());
    }

    Ok(())
}

fn validate_tls(config: &ServerConfig) -> Result<(), Box<dyn std::error::Error>> {
    if let Some(tls) = &config.tls {
        if !tls.cert_path.exists() {
            return Err(format!(
                "TLS certificate file not found: {}",
                tls.cert_path.display()
            )
            .into());
        }
        if !tls.key_path.exists() {
            return Err(format!("TLS key file not found: {}", tls.key_path.display()).into());
        }
    }
    Ok(())
}

fn validate_limits(config: &ServerConfig) -> Result<(), Box<dyn std::error::Error>> {
    if config.rate_limit_requests_per_second == 0 {
        return Err("RATE_LIMIT_REQUESTS_PER_SECOND must be greater than zero".into());
    }
    if config.rate_limit_burst_size == 0 {
        return Err("RATE_LIMIT_BURST_SIZE must be greater than zero".into());
    }
    if config.max_connections_per_ip == 0 {
        return Err("MAX_CONNECTIONS_PER_IP must be greater than zero".into());
    }
    if config.image_proxy.enabled && config.image_proxy.max_bytes == 0 {
        return Err("IMAGE_PROXY_MAX_BYTES must be greater than zero".into());
    }
    Ok(())
}
