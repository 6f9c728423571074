//! Destination safety checks for remote sources.
//!
//! A remote source may only reach public `http`/`https` hosts. The literal
//! host is checked at registration; the resolved addresses are checked again
//! before every fetch.

use crate::{Error, Result};
use reqwest::Url;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

/// Validate a remote location without touching the network.
pub fn validate_destination(location: &str) -> Result<Url> {
    let url = Url::parse(location.trim())
        .map_err(|e| Error::Validation(format!("invalid URL '{}': {}", location, e)))?;

    match url.scheme() {
        "http" | "https" => {}
        other => {
            return Err(Error::Validation(format!(
                "unsupported URL scheme '{}', only http and https are allowed",
                other
            )))
        }
    }

    let host = url
        .host_str()
        .ok_or_else(|| Error::Validation(format!("URL '{}' has no host", location)))?;

    let bare = host.trim_start_matches('[').trim_end_matches(']');
    if bare.eq_ignore_ascii_case("localhost") || bare.to_ascii_lowercase().ends_with(".localhost") {
        return Err(Error::Validation(format!("destination '{}' is loopback", host)));
    }

    if let Ok(ip) = bare.parse::<IpAddr>() {
        if is_forbidden_ip(&ip) {
            return Err(Error::Validation(format!(
                "destination '{}' is not a public address",
                host
            )));
        }
    }

    Ok(url)
}

/// Resolve the URL host and reject it if any address is non-public.
pub async fn ensure_public_resolution(url: &Url) -> Result<()> {
    let host = url
        .host_str()
        .ok_or_else(|| Error::Validation(format!("URL '{}' has no host", url)))?;
    let port = url.port_or_known_default().unwrap_or(80);

    let addrs = tokio::net::lookup_host((host.trim_start_matches('[').trim_end_matches(']'), port))
        .await
        .map_err(|e| Error::Http {
            message: format!("failed to resolve '{}': {}", host, e),
            transient: true,
        })?;

    for addr in addrs {
        if is_forbidden_ip(&addr.ip()) {
            return Err(Error::Validation(format!(
                "destination '{}' resolves to non-public address {}",
                host,
                addr.ip()
            )));
        }
    }
    Ok(())
}

/// Loopback, private, link-local, unspecified, or unique-local addresses.
pub fn is_forbidden_ip(ip: &IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => is_forbidden_v4(v4),
        IpAddr::V6(v6) => match v6.to_ipv4_mapped() {
            Some(v4) => is_forbidden_v4(&v4),
            None => is_forbidden_v6(v6),
        },
    }
}

fn is_forbidden_v4(ip: &Ipv4Addr) -> bool {
    ip.is_loopback() || ip.is_private() || ip.is_link_local() || ip.is_unspecified()
}

fn is_forbidden_v6(ip: &Ipv6Addr) -> bool {
    let first = ip.segments()[0];
    ip.is_loopback()
        || ip.is_unspecified()
        || (first & 0xffc0) == 0xfe80
        || (first & 0xfe00) == 0xfc00
}
