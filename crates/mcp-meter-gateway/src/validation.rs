use std::collections::HashSet;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use url::Url;

use crate::db::RegisterServer;
use crate::error::GatewayError;

const MAX_NAME_LEN: usize = 128;
const MAX_DESCRIPTION_LEN: usize = 1024;
const MAX_TOOL_NAME_LEN: usize = 128;
const MAX_TOOLS: usize = 256;

/// Check if an IPv4 address is private, loopback, or otherwise non-routable.
pub fn is_private_ipv4(ip: &Ipv4Addr) -> bool {
    ip.is_loopback()          // 127.0.0.0/8
        || ip.is_private()    // 10.0.0.0/8, 172.16.0.0/12, 192.168.0.0/16
        || ip.is_link_local() // 169.254.0.0/16
        || ip.is_broadcast()  // 255.255.255.255
        || ip.is_unspecified() // 0.0.0.0
        || ip.octets()[0] == 100 && (ip.octets()[1] & 0xC0) == 64 // 100.64.0.0/10 (CGNAT)
}

/// Check if an IPv6 address is private, loopback, or otherwise non-routable.
pub fn is_private_ipv6(ip: &Ipv6Addr) -> bool {
    ip.is_loopback()       // ::1
        || ip.is_unspecified() // ::
        || {
            let segments = ip.segments();
            // fc00::/7 (unique local)
            (segments[0] & 0xFE00) == 0xFC00
            // fe80::/10 (link-local)
            || (segments[0] & 0xFFC0) == 0xFE80
            // IPv4-mapped IPv6: check the mapped IPv4 address
            || match ip.to_ipv4_mapped() {
                Some(v4) => is_private_ipv4(&v4),
                None => false,
            }
        }
}

pub fn is_private_ip(ip: &IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => is_private_ipv4(v4),
        IpAddr::V6(v6) => is_private_ipv6(v6),
    }
}

/// Validate an upstream server URL.
///
/// Always requires an http(s) URL with a host. Unless `allow_private` is set,
/// also requires HTTPS and a host that is not localhost or a private address.
pub fn validate_upstream_url(url: &str, allow_private: bool) -> Result<Url, GatewayError> {
    let parsed =
        Url::parse(url).map_err(|_| GatewayError::InvalidUrl("invalid URL format".to_string()))?;

    if parsed.scheme() != "https" && parsed.scheme() != "http" {
        return Err(GatewayError::InvalidUrl(
            "upstream must use HTTP or HTTPS".to_string(),
        ));
    }
    if !parsed.username().is_empty() || parsed.password().is_some() {
        return Err(GatewayError::InvalidUrl(
            "upstream URL must not embed credentials".to_string(),
        ));
    }

    let host = parsed
        .host()
        .ok_or_else(|| GatewayError::InvalidUrl("upstream URL must have a host".to_string()))?;

    if allow_private {
        return Ok(parsed);
    }

    if parsed.scheme() != "https" {
        return Err(GatewayError::InvalidUrl(
            "upstream must use HTTPS".to_string(),
        ));
    }

    // Prevent SSRF: validate the host is not a private/loopback address
    match host {
        url::Host::Ipv4(ip) if is_private_ipv4(&ip) => Err(GatewayError::InvalidUrl(
            "upstream cannot be a private or loopback IP address".to_string(),
        )),
        url::Host::Ipv6(ip) if is_private_ipv6(&ip) => Err(GatewayError::InvalidUrl(
            "upstream cannot be a private or loopback IP address".to_string(),
        )),
        url::Host::Domain(domain) => {
            let domain_lower = domain.to_lowercase();
            if domain_lower == "localhost"
                || domain_lower.ends_with(".localhost")
                || domain_lower.ends_with(".local")
                || domain_lower.ends_with(".internal")
            {
                Err(GatewayError::InvalidUrl(
                    "upstream cannot be localhost or local domain".to_string(),
                ))
            } else {
                Ok(parsed)
            }
        }
        _ => Ok(parsed),
    }
}

/// Resolve the URL's host and reject it if any address is private.
/// Catches public names that point at internal addresses (DNS rebinding).
pub async fn ensure_public_host(url: &Url) -> Result<(), String> {
    let host = match url.host() {
        Some(url::Host::Ipv4(ip)) => {
            return check_ip(IpAddr::V4(ip));
        }
        Some(url::Host::Ipv6(ip)) => {
            return check_ip(IpAddr::V6(ip));
        }
        Some(url::Host::Domain(domain)) => domain.to_string(),
        None => return Err("upstream URL has no host".to_string()),
    };

    let port = url.port_or_known_default().unwrap_or(443);
    let addrs = tokio::net::lookup_host((host.as_str(), port))
        .await
        .map_err(|e| format!("DNS resolution failed for {}: {}", host, e))?;

    let mut resolved = false;
    for addr in addrs {
        check_ip(addr.ip())?;
        resolved = true;
    }
    if !resolved {
        return Err(format!("DNS resolution returned no addresses for {}", host));
    }
    Ok(())
}

fn check_ip(ip: IpAddr) -> Result<(), String> {
    if is_private_ip(&ip) {
        Err("upstream resolves to a private IP address".to_string())
    } else {
        Ok(())
    }
}

/// Validate a registration payload's descriptive fields and price table.
pub fn validate_registration(req: &RegisterServer) -> Result<(), GatewayError> {
    if let Some(ref name) = req.name {
        if name.chars().count() > MAX_NAME_LEN {
            return Err(GatewayError::BadRequest(format!(
                "name must be at most {} characters",
                MAX_NAME_LEN
            )));
        }
    }
    if let Some(ref description) = req.description {
        if description.chars().count() > MAX_DESCRIPTION_LEN {
            return Err(GatewayError::BadRequest(format!(
                "description must be at most {} characters",
                MAX_DESCRIPTION_LEN
            )));
        }
    }

    if let Some(base) = req.base_price {
        if base < 0 {
            return Err(GatewayError::InvalidPrice(
                "base_price must not be negative".to_string(),
            ));
        }
    }

    if req.tool_prices.len() > MAX_TOOLS {
        return Err(GatewayError::BadRequest(format!(
            "at most {} tool prices per server",
            MAX_TOOLS
        )));
    }

    let mut seen = HashSet::new();
    for tp in &req.tool_prices {
        if tp.tool_name.trim().is_empty() {
            return Err(GatewayError::BadRequest(
                "tool_name must not be empty".to_string(),
            ));
        }
        if tp.tool_name.chars().count() > MAX_TOOL_NAME_LEN {
            return Err(GatewayError::BadRequest(format!(
                "tool_name must be at most {} characters",
                MAX_TOOL_NAME_LEN
            )));
        }
        if tp.price_in_credits < 0 {
            return Err(GatewayError::InvalidPrice(format!(
                "price for tool '{}' must not be negative",
                tp.tool_name
            )));
        }
        if !seen.insert(tp.tool_name.as_str()) {
            return Err(GatewayError::BadRequest(format!(
                "duplicate tool_name '{}'",
                tp.tool_name
            )));
        }
    }

    Ok(())
}
