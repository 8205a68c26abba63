use std::net::IpAddr;
use thiserror::Error;
use url::{Host, Url};

/// Reasons a source-supplied URL is refused before any request is made.
#[derive(Error, Debug)]
pub enum UrlValidationError {
    #[error("Invalid URL: {0}")]
    InvalidUrl(#[from] url::ParseError),
    #[error("Unsupported scheme: {0} (only http/https allowed)")]
    UnsupportedScheme(String),
    #[error("URL has no host")]
    MissingHost,
    #[error("Private or loopback address not allowed: {0}")]
    PrivateHost(String),
}

/// Validates a URL taken from a source identifier.
///
/// Identifiers are operator input but may be pasted from anywhere, so the
/// direct-feed strategy refuses non-HTTP schemes and, unless
/// `allow_private_hosts` is set, loopback, link-local and private ranges.
/// Self-hosted setups that run their bridge on the LAN turn the flag on.
pub fn validate_url(url_str: &str, allow_private_hosts: bool) -> Result<Url, UrlValidationError> {
    let url = Url::parse(url_str)?;

    match url.scheme() {
        "http" | "https" => {}
        scheme => return Err(UrlValidationError::UnsupportedScheme(scheme.to_owned())),
    }

    let host = url.host().ok_or(UrlValidationError::MissingHost)?;
    if allow_private_hosts {
        return Ok(url);
    }

    let blocked = match host {
        Host::Domain(domain) => {
            let domain = domain.to_ascii_lowercase();
            domain == "localhost" || domain.ends_with(".localhost") || domain.ends_with(".local")
        }
        Host::Ipv4(ip) => is_private_ip(&IpAddr::V4(ip)),
        Host::Ipv6(ip) => is_private_ip(&IpAddr::V6(ip)),
    };

    if blocked {
        return Err(UrlValidationError::PrivateHost(host.to_string()));
    }
    Ok(url)
}

fn is_private_ip(ip: &IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => {
            v4.is_private()
                || v4.is_loopback()
                || v4.is_link_local()
                || v4.is_unspecified()
                || v4.is_broadcast()
        }
        IpAddr::V6(v6) => {
            if v6.is_loopback() || v6.is_unspecified() {
                return true;
            }
            let first = v6.segments()[0];
            // fc00::/7 unique local, fe80::/10 link local
            (first & 0xfe00) == 0xfc00 || (first & 0xffc0) == 0xfe80
        }
    }
}
