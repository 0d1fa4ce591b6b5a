//! Caller address resolution.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use axum::http::HeaderMap;

/// IANA IPv4 special-purpose blocks as `(network, prefix length)`.
const RESERVED_V4: &[(Ipv4Addr, u8)] = &[
    (Ipv4Addr::new(0, 0, 0, 0), 8),
    (Ipv4Addr::new(10, 0, 0, 0), 8),
    (Ipv4Addr::new(100, 64, 0, 0), 10),
    (Ipv4Addr::new(127, 0, 0, 0), 8),
    (Ipv4Addr::new(169, 254, 0, 0), 16),
    (Ipv4Addr::new(172, 16, 0, 0), 12),
    (Ipv4Addr::new(192, 0, 0, 0), 24),
    (Ipv4Addr::new(192, 0, 2, 0), 24),
    (Ipv4Addr::new(192, 31, 196, 0), 24),
    (Ipv4Addr::new(192, 52, 193, 0), 24),
    (Ipv4Addr::new(192, 88, 99, 0), 24),
    (Ipv4Addr::new(192, 168, 0, 0), 16),
    (Ipv4Addr::new(192, 175, 48, 0), 24),
    (Ipv4Addr::new(198, 18, 0, 0), 15),
    (Ipv4Addr::new(198, 51, 100, 0), 24),
    (Ipv4Addr::new(203, 0, 113, 0), 24),
    (Ipv4Addr::new(240, 0, 0, 0), 4),
    (Ipv4Addr::new(255, 255, 255, 255), 32),
];

/// IANA IPv6 special-purpose blocks.
const RESERVED_V6: &[(Ipv6Addr, u8)] = &[
    (Ipv6Addr::new(0, 0, 0, 0, 0, 0, 0, 1), 128),
    (Ipv6Addr::new(0, 0, 0, 0, 0, 0, 0, 0), 128),
    (Ipv6Addr::new(0, 0, 0, 0, 0, 0xffff, 0, 0), 96),
    (Ipv6Addr::new(0x64, 0xff9b, 0, 0, 0, 0, 0, 0), 96),
    (Ipv6Addr::new(0x64, 0xff9b, 1, 0, 0, 0, 0, 0), 48),
    (Ipv6Addr::new(0x100, 0, 0, 0, 0, 0, 0, 0), 64),
    (Ipv6Addr::new(0x2001, 0, 0, 0, 0, 0, 0, 0), 23),
    (Ipv6Addr::new(0x2001, 0xdb8, 0, 0, 0, 0, 0, 0), 32),
    (Ipv6Addr::new(0x2002, 0, 0, 0, 0, 0, 0, 0), 16),
    (Ipv6Addr::new(0x2620, 0x4f, 0x8000, 0, 0, 0, 0, 0), 48),
    (Ipv6Addr::new(0xfc00, 0, 0, 0, 0, 0, 0, 0), 7),
    (Ipv6Addr::new(0xfe80, 0, 0, 0, 0, 0, 0, 0), 10),
];

/// True if `ip` is a routable public address that can identify a caller.
pub fn is_usable(ip: IpAddr) -> bool {
    match ip.to_canonical() {
        IpAddr::V4(v4) => {
            let bits = u32::from(v4);
            !RESERVED_V4.iter().any(|(net, len)| {
                let mask = u32::MAX.checked_shl(32 - u32::from(*len)).unwrap_or(0);
                bits & mask == u32::from(*net) & mask
            })
        }
        IpAddr::V6(v6) => {
            let bits = u128::from(v6);
            !RESERVED_V6.iter().any(|(net, len)| {
                let mask = u128::MAX.checked_shl(128 - u32::from(*len)).unwrap_or(0);
                bits & mask == u128::from(*net) & mask
            })
        }
    }
}

fn parse_usable(s: &str) -> Option<IpAddr> {
    s.trim()
        .parse::<IpAddr>()
        .ok()
        .map(|ip| ip.to_canonical())
        .filter(|ip| is_usable(*ip))
}

/// Resolve the caller's address for rate limiting.
///
/// With `trust_proxy` the first usable entry of `X-Forwarded-For` wins, then
/// `X-Real-IP`, then the peer address. Without it only the peer address is
/// considered. Returns `None` when no usable address is found.
pub fn client_ip(headers: &HeaderMap, peer: IpAddr, trust_proxy: bool) -> Option<IpAddr> {
    if trust_proxy {
        if let Some(xff) = headers.get("x-forwarded-for").and_then(|v| v.to_str().ok()) {
            if let Some(ip) = xff.split(',').find_map(parse_usable) {
                return Some(ip);
            }
        }
        if let Some(ip) = headers
            .get("x-real-ip")
            .and_then(|v| v.to_str().ok())
            .and_then(parse_usable)
        {
            return Some(ip);
        }
    }
    Some(peer.to_canonical()).filter(|ip| is_usable(*ip))
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    fn ip(s: &str) -> IpAddr {
        s.parse().unwrap()
    }

    #[test]
    fn reserved_ranges_are_unusable() {
        for s in [
            "10.1.2.3",
            "127.0.0.1",
            "172.20.0.1",
            "192.168.1.1",
            "100.64.0.1",
            "169.254.3.3",
            "255.255.255.255",
            "::1",
            "::",
            "fe80::1",
            "fd00::1",
            "2001:db8::1",
            "::ffff:10.0.0.1",
        ] {
            assert!(!is_usable(ip(s)), "{s} should be unusable");
        }
    }

    #[test]
    fn public_addresses_are_usable() {
        for s in ["8.8.8.8", "1.1.1.1", "172.32.0.1", "2606:4700::1111", "::ffff:8.8.4.4"] {
            assert!(is_usable(ip(s)), "{s} should be usable");
        }
    }

    #[test]
    fn peer_only_without_trusted_proxy() {
        let mut headers = HeaderMap::new();
        headers.insert("x-forwarded-for", HeaderValue::from_static("8.8.8.8"));
        assert_eq!(client_ip(&headers, ip("1.1.1.1"), false), Some(ip("1.1.1.1")));
        assert_eq!(client_ip(&headers, ip("127.0.0.1"), false), None);
    }

    #[test]
    fn forwarded_for_preferred_with_trusted_proxy() {
        let mut headers = HeaderMap::new();
        headers.insert(
            "x-forwarded-for",
            HeaderValue::from_static("10.0.0.7, garbage, 9.9.9.9, 8.8.8.8"),
        );
        assert_eq!(client_ip(&headers, ip("127.0.0.1"), true), Some(ip("9.9.9.9")));
    }

    #[test]
    fn falls_back_to_real_ip_then_peer() {
        let mut headers = HeaderMap::new();
        headers.insert("x-forwarded-for", HeaderValue::from_static("192.168.0.2"));
        headers.insert("x-real-ip", HeaderValue::from_static("4.4.4.4"));
        assert_eq!(client_ip(&headers, ip("127.0.0.1"), true), Some(ip("4.4.4.4")));

        let empty = HeaderMap::new();
        assert_eq!(client_ip(&empty, ip("5.5.5.5"), true), Some(ip("5.5.5.5")));
        assert_eq!(client_ip(&empty, ip("127.0.0.1"), true), None);
    }
}
