//! Which address a click is attributed to.
//!
//! Forwarding headers are only believed in the configured proxy mode, and a
//! chain is walked from the right so a client cannot spoof its own entry.

use axum::http::HeaderMap;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use tracing::warn;

use crate::config::{AnalyticsConfig, TrustedProxyMode};

/// Address to record for a request arriving from `socket_addr`, anonymized
/// when configured.
pub fn extract_client_ip(
    headers: &HeaderMap,
    socket_addr: IpAddr,
    config: &AnalyticsConfig,
) -> IpAddr {
    let ip = match config.trusted_proxy_mode {
        TrustedProxyMode::Cloudflare => extract_cloudflare_ip(headers).unwrap_or_else(|| {
            warn!("CF-Connecting-IP header missing in Cloudflare mode, using socket address");
            socket_addr
        }),
        TrustedProxyMode::Standard => extract_standard_ip(headers, config).unwrap_or(socket_addr),
        TrustedProxyMode::None => socket_addr,
    };

    if config.ip_anonymization {
        anonymize_ip(ip)
    } else {
        ip
    }
}

/// Extract IP from Cloudflare-specific header
fn extract_cloudflare_ip(headers: &HeaderMap) -> Option<IpAddr> {
    headers
        .get("cf-connecting-ip")
        .and_then(|h| h.to_str().ok())
        .and_then(|s| s.trim().parse::<IpAddr>().ok())
}

/// Extract IP from standard headers (Forwarded, X-Forwarded-For) with trust validation
fn extract_standard_ip(headers: &HeaderMap, config: &AnalyticsConfig) -> Option<IpAddr> {
    // Prefer RFC 7239 Forwarded header
    let forwarded = forwarded_chain(headers);
    if !forwarded.is_empty() {
        return pick_from_chain(&forwarded, config);
    }

    let xff = x_forwarded_for_chain(headers);
    if !xff.is_empty() {
        return pick_from_chain(&xff, config);
    }

    None
}

/// `for=` addresses of an RFC 7239 Forwarded header, client first
fn forwarded_chain(headers: &HeaderMap) -> Vec<IpAddr> {
    let Some(forwarded) = headers.get("forwarded").and_then(|h| h.to_str().ok()) else {
        return Vec::new();
    };

    // Forwarded: for=192.0.2.60;proto=http, for="[2001:db8::1]:4711"
    forwarded
        .split(',')
        .filter_map(|element| {
            element.split(';').find_map(|param| {
                let (name, value) = param.trim().split_once('=')?;
                if !name.eq_ignore_ascii_case("for") {
                    return None;
                }
                parse_node(value.trim().trim_matches('"'))
            })
        })
        .collect()
}

/// Parse a Forwarded node: `1.2.3.4`, `1.2.3.4:80`, `[::1]` or `[::1]:80`
fn parse_node(node: &str) -> Option<IpAddr> {
    if let Some(rest) = node.strip_prefix('[') {
        return rest.split(']').next()?.parse().ok();
    }
    if let Ok(ip) = node.parse() {
        return Some(ip);
    }
    node.rsplit_once(':')?.0.parse().ok()
}

fn x_forwarded_for_chain(headers: &HeaderMap) -> Vec<IpAddr> {
    let Some(xff) = headers.get("x-forwarded-for").and_then(|h| h.to_str().ok()) else {
        return Vec::new();
    };

    xff.split(',')
        .filter_map(|s| s.trim().parse::<IpAddr>().ok())
        .collect()
}

/// Right-to-left trust validation over a proxy chain (client first)
fn pick_from_chain(ips: &[IpAddr], config: &AnalyticsConfig) -> Option<IpAddr> {
    // If num_trusted_proxies is specified, skip that many from the right
    if let Some(num_trusted) = config.num_trusted_proxies {
        return if ips.len() > num_trusted {
            Some(ips[ips.len() - num_trusted - 1])
        } else {
            // Not enough IPs in chain, return the leftmost (least trusted)
            ips.first().copied()
        };
    }

    // Walk from the right past every address inside a trusted range
    if !config.trusted_proxies.is_empty() {
        return ips
            .iter()
            .rev()
            .find(|ip| !config.trusted_proxies.iter().any(|net| net.contains(*ip)))
            .or_else(|| ips.first())
            .copied();
    }

    // No trust configuration, return the rightmost IP
    ips.last().copied()
}

/// Zero the host part of an address: IPv4 keeps its /24, IPv6 its /48.
pub fn anonymize_ip(ip: IpAddr) -> IpAddr {
    match ip {
        IpAddr::V4(addr) => IpAddr::V4(Ipv4Addr::from(u32::from(addr) & 0xFFFF_FF00)),
        IpAddr::V6(addr) => IpAddr::V6(Ipv6Addr::from(u128::from(addr) & !(u128::MAX >> 48))),
    }
}
