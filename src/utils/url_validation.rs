//! URL validation utilities for SSRF protection
//!
//! Outbound fetches on behalf of clients (the image proxy) must not reach
//! loopback, private or otherwise internal addresses. Every address a host
//! resolves to is checked, so a public name pointing at an internal address
//! is rejected as well.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use thiserror::Error;
use tracing::warn;
use url::Url;

/// Errors that can occur during URL validation
#[derive(Debug, Error)]
pub enum UrlValidationError {
    #[error("Invalid URL format: {0}")]
    InvalidFormat(#[from] url::ParseError),

    #[error("URL scheme must be http or https, got: {0}")]
    UnsupportedScheme(String),

    #[error("URL must have a host")]
    MissingHost,

    #[error("URL resolves to private/internal IP address: {0}")]
    PrivateIpDetected(IpAddr),

    #[error("Failed to resolve hostname: {0}")]
    DnsResolutionFailed(String),
}

impl UrlValidationError {
    /// True when the URL was well formed but points somewhere forbidden.
    pub fn is_blocked(&self) -> bool {
        matches!(self, Self::PrivateIpDetected(_))
    }
}

/// Checks if an IPv4 address is private/internal
///
/// Covers loopback, RFC 1918, link-local, broadcast, unspecified,
/// documentation, shared CGNAT (100.64.0.0/10) and benchmarking
/// (198.18.0.0/15) ranges.
pub fn is_private_ipv4(ip: &Ipv4Addr) -> bool {
    let [a, b, ..] = ip.octets();
    ip.is_loopback()
        || ip.is_private()
        || ip.is_link_local()
        || ip.is_broadcast()
        || ip.is_unspecified()
        || ip.is_documentation()
        || (a == 100 && (b & 0xC0) == 64)
        || (a == 198 && (b == 18 || b == 19))
}

/// Checks if an IPv6 address is private/internal
///
/// Covers loopback, unspecified, link-local (fe80::/10), unique local
/// (fc00::/7), documentation (2001:db8::/32) and IPv4-mapped private
/// addresses.
pub fn is_private_ipv6(ip: &Ipv6Addr) -> bool {
    if ip.is_loopback() || ip.is_unspecified() {
        return true;
    }
    let segments = ip.segments();
    if segments[0] & 0xFFC0 == 0xFE80 || segments[0] & 0xFE00 == 0xFC00 {
        return true;
    }
    if segments[0] == 0x2001 && segments[1] == 0x0DB8 {
        return true;
    }
    ip.to_ipv4_mapped()
        .map(|ipv4| is_private_ipv4(&ipv4))
        .unwrap_or(false)
}

/// Checks if an IP address is private/internal
pub fn is_private_ip(ip: &IpAddr) -> bool {
    match ip {
        IpAddr::V4(ipv4) => is_private_ipv4(ipv4),
        IpAddr::V6(ipv6) => is_private_ipv6(ipv6),
    }
}

/// Parse a URL and check its scheme and host, without resolving it.
pub fn parse_fetch_url(url: &str) -> Result<Url, UrlValidationError> {
    let parsed = Url::parse(url.trim())?;

    if !matches!(parsed.scheme(), "http" | "https") {
        return Err(UrlValidationError::UnsupportedScheme(
            parsed.scheme().to_string(),
        ));
    }
    if parsed.host().is_none() {
        return Err(UrlValidationError::MissingHost);
    }

    Ok(parsed)
}

/// Validate a URL the server is about to fetch on a client's behalf.
///
/// The host is resolved and every resulting address must be public, unless
/// `allow_private` is set.
///
/// # Example
/// ```rust,ignore
/// use voice_relay_gateway::utils::url_validation::validate_fetch_url;
///
/// assert!(validate_fetch_url("https://example.com/cat.png", false).await.is_ok());
/// assert!(validate_fetch_url("http://127.0.0.1/admin", false).await.is_err());
/// assert!(validate_fetch_url("ftp://example.com/cat.png", false).await.is_err());
/// ```
pub async fn validate_fetch_url(url: &str, allow_private: bool) -> Result<Url, UrlValidationError> {
    let parsed = parse_fetch_url(url)?;
    if allow_private {
        return Ok(parsed);
    }

    let addresses: Vec<IpAddr> = match parsed.host() {
        Some(url::Host::Ipv4(ip)) => vec![IpAddr::V4(ip)],
        Some(url::Host::Ipv6(ip)) => vec![IpAddr::V6(ip)],
        Some(url::Host::Domain(domain)) => {
            let port = parsed.port_or_known_default().unwrap_or(443);
            let resolved: Vec<IpAddr> = tokio::net::lookup_host((domain, port))
                .await
                .map_err(|e| UrlValidationError::DnsResolutionFailed(format!("{domain}: {e}")))?
                .map(|addr| addr.ip())
                .collect();
            if resolved.is_empty() {
                return Err(UrlValidationError::DnsResolutionFailed(format!(
                    "{domain}: no addresses"
                )));
            }
            resolved
        }
        None => return Err(UrlValidationError::MissingHost),
    };

    if let Some(ip) = addresses.iter().find(|ip| is_private_ip(ip)) {
        warn!(url = %parsed, ip = %ip, "Blocked fetch of private address");
        return Err(UrlValidationError::PrivateIpDetected(*ip));
    }

    Ok(parsed)
}
