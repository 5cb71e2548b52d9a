//! Bearer-token and trusted-IP checks.
//!
//! Tokens and CIDR lists arrive already resolved over the config chain
//! (master, project, dataset); this module only decides the client IP and
//! answers yes or no. Every failure maps to 401.

use std::net::IpAddr;

use axum::http::HeaderMap;
use ipnetwork::IpNetwork;
use thiserror::Error;
use tracing::warn;

use sashimi_registry::EffectiveConfig;

#[derive(Debug, Error)]
pub enum AuthError {
    #[error("token not found, sorry")]
    UnknownToken,
    #[error("cannot parse client ip from {0:?}")]
    UnparseableIp(String),
    #[error("client IP {0:?} not found in trusted_ips, sorry")]
    UntrustedIp(String),
}

/// Full check for a mutating or privileged request: client IP against the
/// trusted CIDRs (when any are configured), then the bearer token against
/// the effective list.
pub fn authorize(
    headers: &HeaderMap,
    peer: IpAddr,
    token: &str,
    effective: &EffectiveConfig,
) -> Result<(), AuthError> {
    let ip = client_ip(headers, peer, effective.ip_header.as_deref())?;
    if !effective.trusted_ips.is_empty() && !ip_trusted(ip, &effective.trusted_ips) {
        return Err(AuthError::UntrustedIp(ip.to_string()));
    }
    if !effective.tokens.iter().any(|candidate| candidate == token) {
        return Err(AuthError::UnknownToken);
    }
    Ok(())
}

/// The client IP: taken from the configured header when one is set (first
/// dotted-quad in the value, so proxy lists work), else the socket peer.
pub fn client_ip(
    headers: &HeaderMap,
    peer: IpAddr,
    ip_header: Option<&str>,
) -> Result<IpAddr, AuthError> {
    let Some(header) = ip_header else {
        return Ok(peer);
    };
    let raw = headers
        .get(header)
        .and_then(|value| value.to_str().ok())
        .ok_or_else(|| AuthError::UnparseableIp(header.to_string()))?;
    extract_ipv4(raw).ok_or_else(|| AuthError::UnparseableIp(raw.to_string()))
}

/// Pulls the leading dotted-quad out of a header value like
/// `203.0.113.9, 10.0.0.1`.
fn extract_ipv4(raw: &str) -> Option<IpAddr> {
    let prefix: String = raw
        .trim_start()
        .chars()
        .take_while(|c| c.is_ascii_digit() || *c == '.')
        .collect();
    prefix.parse::<std::net::Ipv4Addr>().ok().map(IpAddr::V4)
}

fn ip_trusted(ip: IpAddr, cidrs: &[String]) -> bool {
    cidrs.iter().any(|cidr| match cidr.parse::<IpNetwork>() {
        Ok(network) => network.contains(ip),
        Err(error) => {
            warn!(%cidr, %error, "ignoring unparseable trusted_ips entry");
            false
        }
    })
}
