//! Header pipeline: client-IP resolution and upstream header construction.
//!
//! Both functions are pure: given the same inputs they always produce the
//! same output, and neither one touches I/O. That purity is what makes
//! them straightforward to unit test against the universal properties a
//! proxy's header handling should satisfy (idempotence, hop-by-hop drop,
//! forwarding append, trust gating).

use std::net::IpAddr;

use http::{HeaderMap, HeaderName, HeaderValue};
use ipnet::IpNet;

use crate::config::RelayConfig;

/// Hop-by-hop headers per RFC 7230 §6.1. Never forwarded upstream.
pub(crate) const HOP_BY_HOP_HEADERS: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailers",
    "transfer-encoding",
    "upgrade",
];

/// Resolve the IP address attributed to the originating client.
///
/// Trust is transport-based: header values are only consulted once
/// `peer_addr` itself is verified to sit inside a trusted CIDR. A header
/// value never substitutes for that check.
pub fn resolve_client_ip(peer_addr: IpAddr, inbound_headers: &HeaderMap, cfg: &RelayConfig) -> IpAddr {
    if !cfg.trust_proxy {
        return peer_addr;
    }
    if !is_trusted(peer_addr, &cfg.trusted_cidrs) {
        return peer_addr;
    }

    if let Some(ip) = inbound_headers
        .get("forwarded")
        .and_then(|v| v.to_str().ok())
        .and_then(parse_forwarded_for)
    {
        return ip;
    }

    if let Some(ip) = inbound_headers
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(',').next())
        .and_then(|s| s.trim().parse::<IpAddr>().ok())
    {
        return ip;
    }

    if let Some(ip) = inbound_headers
        .get("x-real-ip")
        .and_then(|v| v.to_str().ok())
        .and_then(|s| s.trim().parse::<IpAddr>().ok())
    {
        return ip;
    }

    peer_addr
}

fn is_trusted(peer_addr: IpAddr, trusted_cidrs: &[IpNet]) -> bool {
    trusted_cidrs.iter().any(|net| net.contains(&peer_addr))
}

/// Parse the leftmost `for=` value out of an RFC 7239 `Forwarded` header,
/// stripping quoting, a trailing port, and IPv6 brackets.
fn parse_forwarded_for(value: &str) -> Option<IpAddr> {
    let first_element = value.split(',').next()?;
    for directive in first_element.split(';') {
        let directive = directive.trim();
        if directive.len() < 4 || !directive[..4].eq_ignore_ascii_case("for=") {
            continue;
        }
        let mut rest = directive[4..].trim().trim_matches('"');

        if let Some(stripped) = rest.strip_prefix('[') {
            // Bracketed IPv6, optionally with a trailing `:port`.
            if let Some(end) = stripped.find(']') {
                rest = &stripped[..end];
            } else {
                rest = stripped;
            }
        } else if let Some((host, port)) = rest.rsplit_once(':') {
            // A bare `ip:port` pair — but a bare (unbracketed) IPv6 address
            // also contains colons, so only split when the prefix alone
            // parses and the suffix looks like a port number.
            if host.parse::<IpAddr>().is_ok() && port.chars().all(|c| c.is_ascii_digit()) {
                rest = host;
            }
        }

        if let Ok(ip) = rest.parse::<IpAddr>() {
            return Some(ip);
        }
    }
    None
}

/// Build the headers to send upstream.
#[allow(clippy::too_many_arguments)]
pub fn build_upstream_headers(
    inbound_headers: &HeaderMap,
    client_ip: IpAddr,
    scheme: &str,
    host: &str,
    port: Option<u16>,
) -> HeaderMap {
    let mut out = HeaderMap::new();

    let extra_hop_by_hop: Vec<String> = inbound_headers
        .get("connection")
        .and_then(|v| v.to_str().ok())
        .map(|v| {
            v.split(',')
                .map(|s| s.trim().to_lowercase())
                .filter(|s| !s.is_empty())
                .collect()
        })
        .unwrap_or_default();

    for (name, value) in inbound_headers.iter() {
        let lower = name.as_str().to_lowercase();
        if HOP_BY_HOP_HEADERS.contains(&lower.as_str()) {
            continue;
        }
        if extra_hop_by_hop.iter().any(|h| h == &lower) {
            continue;
        }
        if lower == "host" || lower == "content-length" {
            continue;
        }
        out.append(name.clone(), value.clone());
    }

    append_csv_header(&mut out, "x-forwarded-for", &client_ip.to_string());

    let forwarded_host = match client_ip {
        IpAddr::V6(_) => format!("\"[{client_ip}]\""),
        IpAddr::V4(_) => format!("\"{client_ip}\""),
    };
    let forwarded_element = format!("for={forwarded_host};proto={scheme};host={host}");
    append_csv_header(&mut out, "forwarded", &forwarded_element);

    set_header(&mut out, "x-real-ip", &client_ip.to_string());

    if !out.contains_key("x-forwarded-proto") {
        set_header(&mut out, "x-forwarded-proto", scheme);
    }
    if !out.contains_key("x-forwarded-host") {
        set_header(&mut out, "x-forwarded-host", host);
    }
    if let Some(port) = port {
        if !out.contains_key("x-forwarded-port") {
            set_header(&mut out, "x-forwarded-port", &port.to_string());
        }
    }

    out
}

fn set_header(map: &mut HeaderMap, name: &'static str, value: &str) {
    if let Ok(hv) = HeaderValue::from_str(value) {
        map.insert(HeaderName::from_static(name), hv);
    }
}

/// Append `value` to a comma-joined header, creating it if absent.
fn append_csv_header(map: &mut HeaderMap, name: &'static str, value: &str) {
    let header_name = HeaderName::from_static(name);
    let combined = match map.get(&header_name).and_then(|v| v.to_str().ok()) {
        Some(existing) if !existing.is_empty() => format!("{existing}, {value}"),
        _ => value.to_string(),
    };
    if let Ok(hv) = HeaderValue::from_str(&combined) {
        map.insert(header_name, hv);
    }
}
