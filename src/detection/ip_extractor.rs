//! Client IP extraction from edge and proxy headers
//!
//! Headers are only honoured according to the configured trust mode; anything
//! that cannot be validated falls back to the socket address.

use axum::http::HeaderMap;
use ipnet::IpNet;
use std::net::IpAddr;
use tracing::debug;

use crate::config::{NetworkConfig, TrustedProxyMode};

pub fn extract_client_ip(headers: &HeaderMap, socket_addr: IpAddr, config: &NetworkConfig) -> IpAddr {
    match config.trusted_proxy_mode {
        TrustedProxyMode::Cloudflare => header_ip(headers, "cf-connecting-ip").unwrap_or_else(|| {
            debug!("CF-Connecting-IP missing, using socket address");
            socket_addr
        }),
        TrustedProxyMode::Standard => {
            let chain = forwarded_chain(headers);
            if chain.is_empty() {
                socket_addr
            } else {
                pick_from_chain(&chain, socket_addr, config)
            }
        }
        TrustedProxyMode::None => socket_addr,
    }
}

fn header_ip(headers: &HeaderMap, name: &str) -> Option<IpAddr> {
    headers
        .get(name)
        .and_then(|h| h.to_str().ok())
        .and_then(|s| s.trim().parse::<IpAddr>().ok())
}

/// Hops in client-to-proxy order, from `Forwarded` if present, else `X-Forwarded-For`
fn forwarded_chain(headers: &HeaderMap) -> Vec<IpAddr> {
    let from_forwarded: Vec<IpAddr> = headers
        .get_all("forwarded")
        .iter()
        .filter_map(|h| h.to_str().ok())
        .flat_map(|value| value.split(','))
        .filter_map(|element| {
            element.split(';').find_map(|param| {
                let (name, value) = param.trim().split_once('=')?;
                if !name.eq_ignore_ascii_case("for") {
                    return None;
                }
                parse_forwarded_node(value)
            })
        })
        .collect();
    if !from_forwarded.is_empty() {
        return from_forwarded;
    }

    headers
        .get_all("x-forwarded-for")
        .iter()
        .filter_map(|h| h.to_str().ok())
        .flat_map(|value| value.split(','))
        .filter_map(|s| s.trim().parse::<IpAddr>().ok())
        .collect()
}

/// `for=` node: `1.2.3.4`, `"1.2.3.4:80"`, `"[2001:db8::1]:443"`
fn parse_forwarded_node(value: &str) -> Option<IpAddr> {
    let value = value.trim().trim_matches('"');
    if let Some(rest) = value.strip_prefix('[') {
        return rest.split(']').next()?.parse().ok();
    }
    if let Ok(ip) = value.parse::<IpAddr>() {
        return Some(ip);
    }
    value.rsplit_once(':')?.0.parse().ok()
}

fn pick_from_chain(chain: &[IpAddr], socket_addr: IpAddr, config: &NetworkConfig) -> IpAddr {
    if let Some(num_trusted) = config.num_trusted_proxies {
        // The socket peer is the nearest proxy; it counts as the first trusted hop
        let skip = num_trusted.saturating_sub(1);
        return if chain.len() > skip {
            chain[chain.len() - skip - 1]
        } else {
            chain[0]
        };
    }

    if !config.trusted_proxies.is_empty() {
        if !is_trusted(&config.trusted_proxies, socket_addr) {
            return socket_addr;
        }
        // Right to left: the first hop we do not operate is the client
        return chain
            .iter()
            .rev()
            .find(|ip| !is_trusted(&config.trusted_proxies, **ip))
            .copied()
            .unwrap_or(chain[0]);
    }

    chain[chain.len() - 1]
}

fn is_trusted(trusted: &[IpNet], ip: IpAddr) -> bool {
    trusted.iter().any(|net| net.contains(&ip))
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    fn config(mode: TrustedProxyMode) -> NetworkConfig {
        NetworkConfig {
            trusted_proxy_mode: mode,
            trusted_proxies: vec![],
            num_trusted_proxies: None,
            geoip_city_db_path: None,
            geoip_asn_db_path: None,
        }
    }

    fn ip(s: &str) -> IpAddr {
        s.parse().unwrap()
    }

    #[test]
    fn test_none_mode_ignores_headers() {
        let mut headers = HeaderMap::new();
        headers.insert("cf-connecting-ip", HeaderValue::from_static("203.0.113.1"));
        let result = extract_client_ip(&headers, ip("10.0.0.1"), &config(TrustedProxyMode::None));
        assert_eq!(result, ip("10.0.0.1"));
    }

    #[test]
    fn test_cloudflare_header() {
        let mut headers = HeaderMap::new();
        headers.insert("cf-connecting-ip", HeaderValue::from_static("203.0.113.1"));
        let cfg = config(TrustedProxyMode::Cloudflare);
        assert_eq!(extract_client_ip(&headers, ip("10.0.0.1"), &cfg), ip("203.0.113.1"));
        assert_eq!(
            extract_client_ip(&HeaderMap::new(), ip("10.0.0.1"), &cfg),
            ip("10.0.0.1")
        );
    }

    #[test]
    fn test_x_forwarded_for_without_trust_config_takes_rightmost() {
        let mut headers = HeaderMap::new();
        headers.insert(
            "x-forwarded-for",
            HeaderValue::from_static("203.0.113.1, 198.51.100.1"),
        );
        let result = extract_client_ip(&headers, ip("10.0.0.1"), &config(TrustedProxyMode::Standard));
        assert_eq!(result, ip("198.51.100.1"));
    }

    #[test]
    fn test_trusted_cidrs_walk_right_to_left() {
        let mut headers = HeaderMap::new();
        headers.insert(
            "x-forwarded-for",
            HeaderValue::from_static("1.1.1.1, 203.0.113.7, 10.0.0.5, 10.0.0.6"),
        );
        let mut cfg = config(TrustedProxyMode::Standard);
        cfg.trusted_proxies = vec!["10.0.0.0/8".parse().unwrap()];

        assert_eq!(extract_client_ip(&headers, ip("10.0.0.9"), &cfg), ip("203.0.113.7"));
        // An untrusted peer cannot vouch for the chain
        assert_eq!(extract_client_ip(&headers, ip("8.8.8.8"), &cfg), ip("8.8.8.8"));
    }

    #[test]
    fn test_forwarded_header_is_preferred() {
        let mut headers = HeaderMap::new();
        headers.insert(
            "forwarded",
            HeaderValue::from_static("for=\"[2001:db8::1]:443\";proto=https, for=198.51.100.2"),
        );
        headers.insert("x-forwarded-for", HeaderValue::from_static("192.0.2.1"));
        let mut cfg = config(TrustedProxyMode::Standard);
        cfg.num_trusted_proxies = Some(2);

        assert_eq!(extract_client_ip(&headers, ip("10.0.0.1"), &cfg), ip("2001:db8::1"));
    }
}
