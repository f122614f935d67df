//! Caller identity for admission control.
//!
//! Authenticated callers are identified by a hash of their bearer token.
//! Anonymous callers fall back to the client IP; `x-forwarded-for` is
//! only honored when the TCP peer is a known proxy, and the chain is
//! walked right to left so an attacker-prepended hop is never trusted.

use std::collections::HashSet;
use std::net::{IpAddr, SocketAddr};

use axum::http::HeaderMap;

/// Resolve the client IP from connection info plus proxy headers.
pub fn client_ip(
    headers: &HeaderMap,
    peer: Option<SocketAddr>,
    trusted_proxies: &HashSet<IpAddr>,
) -> String {
    let Some(peer) = peer else {
        return "local".to_string();
    };
    let peer_ip = peer.ip();

    if trusted_proxies.contains(&peer_ip) {
        if let Some(forwarded) = headers.get("x-forwarded-for").and_then(|v| v.to_str().ok()) {
            // Rightmost hop that is not itself a trusted proxy is the
            // real client; anything further left is caller-controlled.
            for hop in forwarded.rsplit(',') {
                if let Ok(ip) = hop.trim().parse::<IpAddr>() {
                    if !trusted_proxies.contains(&ip) {
                        return ip.to_string();
                    }
                }
            }
        }
    }

    peer_ip.to_string()
}

/// Admission identity: bearer hash when authenticated, client IP
/// otherwise.
pub fn caller_identity(
    headers: &HeaderMap,
    peer: Option<SocketAddr>,
    trusted_proxies: &HashSet<IpAddr>,
) -> String {
    if let Some(token) = bearer_token(headers) {
        return format!("key:{}", crate::hygiene::hash_pii(token));
    }
    format!("ip:{}", client_ip(headers, peer, trusted_proxies))
}

pub fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(axum::http::header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .filter(|t| !t.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    fn addr(ip: &str) -> SocketAddr {
        format!("{}:9999", ip).parse().unwrap()
    }

    fn trusted(ips: &[&str]) -> HashSet<IpAddr> {
        ips.iter().map(|ip| ip.parse().unwrap()).collect()
    }

    #[test]
    fn test_forwarded_ignored_from_untrusted_peer() {
        let mut headers = HeaderMap::new();
        headers.insert("x-forwarded-for", HeaderValue::from_static("1.2.3.4"));
        assert_eq!(client_ip(&headers, Some(addr("9.9.9.9")), &trusted(&["10.0.0.1"])), "9.9.9.9");
    }

    #[test]
    fn test_rightmost_untrusted_hop_wins() {
        // The leftmost entry is attacker-controlled; the rightmost
        // untrusted hop is the client the proxy actually saw.
        let mut headers = HeaderMap::new();
        headers.insert("x-forwarded-for", HeaderValue::from_static("6.6.6.6, 5.5.5.5"));
        assert_eq!(
            client_ip(&headers, Some(addr("10.0.0.1")), &trusted(&["10.0.0.1"])),
            "5.5.5.5"
        );
    }

    #[test]
    fn test_trusted_hops_are_skipped() {
        let mut headers = HeaderMap::new();
        headers.insert("x-forwarded-for", HeaderValue::from_static("1.2.3.4, 10.0.0.2"));
        assert_eq!(
            client_ip(&headers, Some(addr("10.0.0.1")), &trusted(&["10.0.0.1", "10.0.0.2"])),
            "1.2.3.4"
        );
    }

    #[test]
    fn test_all_trusted_falls_back_to_peer() {
        let mut headers = HeaderMap::new();
        headers.insert("x-forwarded-for", HeaderValue::from_static("10.0.0.2"));
        assert_eq!(
            client_ip(&headers, Some(addr("10.0.0.1")), &trusted(&["10.0.0.1", "10.0.0.2"])),
            "10.0.0.1"
        );
    }

    #[test]
    fn test_garbage_forwarded_falls_back_to_peer() {
        let mut headers = HeaderMap::new();
        headers.insert("x-forwarded-for", HeaderValue::from_static("not-an-ip"));
        assert_eq!(
            client_ip(&headers, Some(addr("10.0.0.1")), &trusted(&["10.0.0.1"])),
            "10.0.0.1"
        );
    }

    #[test]
    fn test_identity_prefers_bearer() {
        let mut headers = HeaderMap::new();
        headers.insert(
            axum::http::header::AUTHORIZATION,
            HeaderValue::from_static("Bearer secret-token"),
        );
        let id = caller_identity(&headers, Some(addr("9.9.9.9")), &HashSet::new());
        assert!(id.starts_with("key:"));
        assert!(!id.contains("secret-token"), "raw token never becomes an identity");
    }

    #[test]
    fn test_identity_without_bearer_is_ip() {
        let headers = HeaderMap::new();
        let id = caller_identity(&headers, Some(addr("9.9.9.9")), &HashSet::new());
        assert_eq!(id, "ip:9.9.9.9");
    }
}
