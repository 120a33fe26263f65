//! Validation for device-supplied provider URLs (`connect_to_vapi`).
//!
//! A device may only point the relay at a secure WebSocket endpoint with a
//! public host. Plain `ws://` and private addresses are accepted only when
//! insecure upstreams are explicitly allowed (local development and tests).

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use thiserror::Error;
use tracing::warn;
use url::{Host, Url};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum UrlValidationError {
    #[error("Invalid URL format: {0}")]
    InvalidFormat(#[from] url::ParseError),

    #[error("URL scheme must be wss, got: {0}")]
    SchemeNotAllowed(String),

    #[error("URL must have a host")]
    MissingHost,

    #[error("URL points at a private/internal address: {0}")]
    PrivateIpDetected(IpAddr),
}

/// Loopback, private, link-local, CGNAT and other non-routable IPv4 ranges.
pub fn is_private_ipv4(ip: &Ipv4Addr) -> bool {
    let octets = ip.octets();
    ip.is_loopback()
        || ip.is_private()
        || ip.is_link_local()
        || ip.is_broadcast()
        || ip.is_unspecified()
        || ip.is_documentation()
        || (octets[0] == 100 && (octets[1] & 0xC0) == 64)
}

pub fn is_private_ipv6(ip: &Ipv6Addr) -> bool {
    if let Some(v4) = ip.to_ipv4_mapped() {
        return is_private_ipv4(&v4);
    }
    let first = ip.segments()[0];
    ip.is_loopback()
        || ip.is_unspecified()
        || (first & 0xfe00) == 0xfc00
        || (first & 0xffc0) == 0xfe80
}

pub fn is_private_ip(ip: &IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => is_private_ipv4(v4),
        IpAddr::V6(v6) => is_private_ipv6(v6),
    }
}

/// Check a provider channel URL and return it parsed.
pub fn validate_upstream_url(raw: &str, allow_insecure: bool) -> Result<Url, UrlValidationError> {
    let url = Url::parse(raw.trim())?;

    match url.scheme() {
        "wss" => {}
        "ws" if allow_insecure => {}
        other => return Err(UrlValidationError::SchemeNotAllowed(other.to_string())),
    }

    let ip = match url.host() {
        None => return Err(UrlValidationError::MissingHost),
        Some(Host::Domain(domain)) if domain.is_empty() => {
            return Err(UrlValidationError::MissingHost);
        }
        Some(Host::Domain(_)) => None,
        Some(Host::Ipv4(v4)) => Some(IpAddr::V4(v4)),
        Some(Host::Ipv6(v6)) => Some(IpAddr::V6(v6)),
    };

    if let Some(ip) = ip
        && !allow_insecure
        && is_private_ip(&ip)
    {
        warn!(url = %url, "Rejected provider URL with private address");
        return Err(UrlValidationError::PrivateIpDetected(ip));
    }

    Ok(url)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_accepts_secure_public_url() {
        let url = validate_upstream_url("wss://phone.vapi.ai/call/abc/transport", false).unwrap();
        assert_eq!(url.host_str(), Some("phone.vapi.ai"));
    }

    #[test]
    fn test_rejects_plain_ws_unless_allowed() {
        assert_eq!(
            validate_upstream_url("ws://phone.vapi.ai/x", false).unwrap_err(),
            UrlValidationError::SchemeNotAllowed("ws".to_string())
        );
        assert!(validate_upstream_url("ws://127.0.0.1:9000/x", true).is_ok());
    }

    #[test]
    fn test_rejects_other_schemes_and_garbage() {
        assert!(matches!(
            validate_upstream_url("https://api.vapi.ai", true),
            Err(UrlValidationError::SchemeNotAllowed(_))
        ));
        assert!(matches!(
            validate_upstream_url("not a url", true),
            Err(UrlValidationError::InvalidFormat(_))
        ));
    }

    #[test]
    fn test_rejects_private_addresses() {
        assert!(matches!(
            validate_upstream_url("wss://10.0.0.5/socket", false),
            Err(UrlValidationError::PrivateIpDetected(_))
        ));
        assert!(matches!(
            validate_upstream_url("wss://[::1]/socket", false),
            Err(UrlValidationError::PrivateIpDetected(_))
        ));
        assert!(validate_upstream_url("wss://8.8.8.8/socket", false).is_ok());
    }

    #[test]
    fn test_private_ranges() {
        assert!(is_private_ipv4(&Ipv4Addr::new(100, 64, 0, 1)));
        assert!(is_private_ipv4(&Ipv4Addr::new(192, 168, 1, 1)));
        assert!(!is_private_ipv4(&Ipv4Addr::new(1, 1, 1, 1)));
        assert!(is_private_ipv6(&"fd00::1".parse().unwrap()));
        assert!(!is_private_ipv6(&"2606:4700::1111".parse().unwrap()));
    }
}
