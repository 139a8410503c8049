//! Layering of YAML values over the environment configuration.

use std::path::PathBuf;
use std::str::FromStr;

use super::env::{DEFAULT_API_SECRET_ID, auth_required_from_env, load_from_env};
use super::yaml::YamlConfig;
use super::{AuthApiSecret, ServerConfig, TlsConfig};
use crate::core::realtime::SessionMode;

/// Merge YAML configuration over environment values.
///
/// Any value present in YAML wins. `auth_required` follows YAML, then
/// `AUTH_REQUIRED`, and otherwise is on whenever secrets are configured.
pub(super) fn merge_config(
    yaml: Option<YamlConfig>,
) -> Result<ServerConfig, Box<dyn std::error::Error>> {
    let mut config = load_from_env()?;
    let Some(yaml) = yaml else {
        return Ok(config);
    };

    let mut yaml_auth_required = None;

    if let Some(server) = yaml.server {
        if let Some(host) = server.host {
            config.host = host;
        }
        if let Some(port) = server.port {
            config.port = port;
        }
        if let Some(tls) = server.tls {
            if tls.enabled == Some(false) {
                config.tls = None;
            } else {
                match (tls.cert_path, tls.key_path) {
                    (Some(cert), Some(key)) => {
                        config.tls = Some(TlsConfig {
                            cert_path: PathBuf::from(cert),
                            key_path: PathBuf::from(key),
                        });
                    }
                    (None, None) if tls.enabled != Some(true) => {}
                    _ => {
                        return Err("server.tls requires both cert_path and key_path".into());
                    }
                }
            }
        }
    }

    if let Some(providers) = yaml.providers
        && let Some(key) = providers.openai_api_key
    {
        config.openai_api_key = Some(key);
    }

    if let Some(realtime) = yaml.realtime {
        if let Some(url) = realtime.url {
            config.realtime_url = url;
        }
        if let Some(model) = realtime.model {
            config.realtime_model = model;
        }
        if let Some(voice) = realtime.voice {
            config.realtime_voice = voice;
        }
        if let Some(mode) = realtime.default_mode {
            config.default_mode = SessionMode::from_str(&mode)
                .map_err(|e| format!("Invalid realtime.default_mode: {e}"))?;
        }
        if let Some(secs) = realtime.connect_timeout_seconds {
            config.realtime_connect_timeout_seconds = secs;
        }
        if let Some(secs) = realtime.idle_timeout_seconds {
            config.relay_idle_timeout_seconds = secs;
        }
    }

    if let Some(auth) = yaml.auth {
        yaml_auth_required = auth.required;
        if !auth.api_secrets.is_empty() {
            config.auth_api_secrets = auth
                .api_secrets
                .into_iter()
                .map(|entry| AuthApiSecret {
                    id: entry.id,
                    secret: entry.secret,
                })
                .collect();
        } else if let Some(secret) = auth.api_secret {
            config.auth_api_secrets = vec![AuthApiSecret {
                id: DEFAULT_API_SECRET_ID.to_string(),
                secret,
            }];
        }
    }

    config.auth_required = match yaml_auth_required {
        Some(required) => required,
        None => auth_required_from_env()?.unwrap_or(config.has_api_secret_auth()),
    };

    if let Some(security) = yaml.security {
        if let Some(origins) = security.cors_allowed_origins {
            config.cors_allowed_origins = Some(origins);
        }
        if let Some(rps) = security.rate_limit_requests_per_second {
            config.rate_limit_requests_per_second = rps;
        }
        if let Some(burst) = security.rate_limit_burst_size {
            config.rate_limit_burst_size = burst;
        }
        if let Some(max) = security.max_websocket_connections {
            config.max_websocket_connections = Some(max);
        }
        if let Some(per_ip) = security.max_connections_per_ip {
            config.max_connections_per_ip = per_ip;
        }
    }

    if let Some(proxy) = yaml.image_proxy {
        if let Some(enabled) = proxy.enabled {
            config.image_proxy.enabled = enabled;
        }
        if let Some(max_bytes) = proxy.max_bytes {
            config.image_proxy.max_bytes = max_bytes;
        }
        if let Some(secs) = proxy.timeout_seconds {
            config.image_proxy.timeout_seconds = secs;
        }
        if let Some(allow) = proxy.allow_private_hosts {
            config.image_proxy.allow_private_hosts = allow;
        }
    }

    Ok(config)
}
