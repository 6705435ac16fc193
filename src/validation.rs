//! Centralized validation for values that reach the kernel or the network.
//!
//! - change-record members (IP or CIDR)
//! - kernel set names
//! - remote host URLs and request timeouts

use anyhow::{bail, Result};
use ipnet::IpNet;
use std::net::IpAddr;

/// ipset refuses set names longer than this.
pub const MAX_SET_NAME_LEN: usize = 31;

/// Upper bound for the configurable request timeout, in seconds.
pub const MAX_TIMEOUT_SECS: u64 = 300;

/// Parse a change-record member into a network.
///
/// Plain addresses become /32 or /128 networks; host bits of a CIDR are
/// cleared so that add and remove of the same record address the same
/// set element.
///
/// # Examples
/// ```
/// use blocksync::validation::validate_member;
/// assert_eq!(validate_member("10.0.0.1").unwrap().to_string(), "10.0.0.1/32");
/// assert_eq!(validate_member("10.1.2.3/8").unwrap().to_string(), "10.0.0.0/8");
/// assert!(validate_member("999.999.999.999").is_err());
/// ```
pub fn validate_member(raw: &str) -> Result<IpNet> {
    let trimmed = raw.trim();
    if trimmed.contains('/') {
        trimmed
            .parse::<IpNet>()
            .map(|net| net.trunc())
            .map_err(|_| anyhow::anyhow!("Invalid CIDR: {}", raw))
    } else {
        let ip: IpAddr = trimmed
            .parse()
            .map_err(|_| anyhow::anyhow!("Invalid IP address: {}", raw))?;
        Ok(IpNet::from(ip))
    }
}

/// Check that a name is usable as both an ipset and an nftables set name.
pub fn validate_set_name(name: &str) -> Result<()> {
    if name.is_empty() || name.len() > MAX_SET_NAME_LEN {
        bail!(
            "'{}' must be between 1 and {} characters",
            name,
            MAX_SET_NAME_LEN
        );
    }
    if !name
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.'))
    {
        bail!("'{}' contains characters other than [A-Za-z0-9_.-]", name);
    }
    Ok(())
}

/// Normalize the configured host into a base URL without trailing slash.
///
/// A bare host gets `https://`. Plain HTTP is only accepted for loopback
/// targets, since the request carries a bearer token.
pub fn normalize_host(host: &str) -> Result<String> {
    let host = host.trim().trim_end_matches('/');
    if host.is_empty() {
        bail!("Host cannot be empty");
    }

    if let Some(rest) = host.strip_prefix("http://") {
        if !is_loopback_authority(rest) {
            bail!("Host must use HTTPS: {}", host);
        }
        return Ok(host.to_string());
    }

    if host.starts_with("https://") {
        return Ok(host.to_string());
    }

    if host.contains("://") {
        bail!("Unsupported URL scheme in host: {}", host);
    }

    Ok(format!("https://{}", host))
}

fn is_loopback_authority(rest: &str) -> bool {
    let authority = rest.split('/').next().unwrap_or("");
    let hostname = if let Some(stripped) = authority.strip_prefix('[') {
        stripped.split(']').next().unwrap_or("")
    } else {
        authority.rsplit_once(':').map(|(h, _)| h).unwrap_or(authority)
    };
    hostname == "localhost"
        || hostname
            .parse::<IpAddr>()
            .map(|ip| ip.is_loopback())
            .unwrap_or(false)
}

pub fn validate_timeout(secs: u64) -> Result<()> {
    if secs == 0 || secs > MAX_TIMEOUT_SECS {
        bail!(
            "Invalid timeout {}s. Must be between 1 and {} seconds",
            secs,
            MAX_TIMEOUT_SECS
        );
    }
    Ok(())
}
