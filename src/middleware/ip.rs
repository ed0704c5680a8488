//! Client IP resolution shared by the rate limiter and the access log.
//!
//! # Lookup Order
//!
//! 1. `X-Forwarded-For` (first entry of the list)
//! 2. `X-Real-IP`
//! 3. TCP peer address from Axum's `ConnectInfo<SocketAddr>`
//! 4. [`UNKNOWN_IP`]
//!
//! # Trusted Proxies
//!
//! Forwarding headers are set by whoever sent the request. When trusted proxy
//! ranges are configured, they are honored only if the TCP peer sits inside one
//! of those ranges; otherwise the peer address itself is the client. With no
//! ranges configured every source is trusted, which is only safe behind a
//! proxy that overwrites these headers.
//!
//! The rate limiter keys on [`extract_peer_ip_with_validation`], which puts
//! the peer address first so a client cannot pick its own bucket. The access
//! log uses header-first [`extract_client_ip_with_validation`].
//!
//! The peer address is only available when the server is started with
//! `into_make_service_with_connect_info::<SocketAddr>()`.

use std::borrow::Cow;
use std::net::{IpAddr, SocketAddr};

use axum::extract::ConnectInfo;
use axum::http::Request;
use tracing::{debug, warn};

/// Fallback IP value when no client IP can be determined.
///
/// All requests without identifiable IPs share this key, so they are
/// rate-limited collectively.
pub const UNKNOWN_IP: &str = "unknown";

/// Parsed CIDR network range.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CidrRange {
    network: IpAddr,
    prefix_len: u8,
}

impl CidrRange {
    /// Parse `"10.0.0.0/8"`, `"::1/128"` or a bare address (host route).
    pub fn parse(cidr: &str) -> Option<Self> {
        let cidr = cidr.trim();

        let (ip, prefix_len) = match cidr.split_once('/') {
            Some((ip, prefix)) => (ip.parse::<IpAddr>().ok()?, Some(prefix.parse::<u8>().ok()?)),
            None => (cidr.parse::<IpAddr>().ok()?, None),
        };

        let max_prefix = match ip {
            IpAddr::V4(_) => 32,
            IpAddr::V6(_) => 128,
        };
        let prefix_len = prefix_len.unwrap_or(max_prefix);
        if prefix_len > max_prefix {
            return None;
        }

        Some(Self {
            network: ip,
            prefix_len,
        })
    }

    pub fn contains(&self, ip: &IpAddr) -> bool {
        match (&self.network, ip) {
            (IpAddr::V4(net), IpAddr::V4(addr)) => {
                let mask = u32::MAX
                    .checked_shl(32 - u32::from(self.prefix_len))
                    .unwrap_or(0);
                (u32::from(*net) & mask) == (u32::from(*addr) & mask)
            }
            (IpAddr::V6(net), IpAddr::V6(addr)) => {
                let mask = u128::MAX
                    .checked_shl(128 - u32::from(self.prefix_len))
                    .unwrap_or(0);
                (u128::from(*net) & mask) == (u128::from(*addr) & mask)
            }
            _ => false,
        }
    }
}

/// Trusted reverse proxy ranges.
#[derive(Debug, Clone, Default)]
pub struct TrustedProxyConfig {
    ranges: Vec<CidrRange>,
}

impl TrustedProxyConfig {
    /// Invalid CIDR strings are logged and skipped.
    pub fn new(cidrs: &[String]) -> Self {
        let ranges: Vec<CidrRange> = cidrs
            .iter()
            .filter_map(|cidr| {
                let parsed = CidrRange::parse(cidr);
                if parsed.is_none() {
                    warn!(cidr = %cidr, "Invalid CIDR range in TRUSTED_PROXIES, skipping");
                }
                parsed
            })
            .collect();

        if !ranges.is_empty() {
            debug!(count = ranges.len(), "Trusted proxy validation enabled");
        }

        Self { ranges }
    }

    pub fn is_enabled(&self) -> bool {
        !self.ranges.is_empty()
    }

    /// `true` when no ranges are configured (trust-all mode).
    pub fn is_trusted(&self, ip: &IpAddr) -> bool {
        self.ranges.is_empty() || self.ranges.iter().any(|range| range.contains(ip))
    }
}

/// Where a forwarding header put the client address.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ForwardedIp<'a> {
    Xff(&'a str),
    RealIp(&'a str),
    None,
}

#[inline]
fn forwarded_ip<B>(req: &Request<B>) -> ForwardedIp<'_> {
    // Format: "client, proxy1, proxy2" - the first entry is the client
    if let Some(forwarded) = req.headers().get("x-forwarded-for")
        && let Ok(value) = forwarded.to_str()
        && let Some(first_ip) = value.split(',').next().map(str::trim)
        && !first_ip.is_empty()
    {
        return ForwardedIp::Xff(first_ip);
    }

    if let Some(real_ip) = req.headers().get("x-real-ip")
        && let Ok(value) = real_ip.to_str()
        && !value.trim().is_empty()
    {
        return ForwardedIp::RealIp(value.trim());
    }

    ForwardedIp::None
}

#[inline]
fn peer_ip<B>(req: &Request<B>) -> Option<IpAddr> {
    req.extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| addr.ip())
}

/// Resolve the client IP, honoring forwarding headers only from trusted peers.
///
/// Returns `Cow::Borrowed(UNKNOWN_IP)` without allocating when nothing is known.
pub fn extract_client_ip_with_validation<B>(
    req: &Request<B>,
    trusted_proxies: &TrustedProxyConfig,
) -> Cow<'static, str> {
    let peer = peer_ip(req);

    let headers_trusted = match peer {
        Some(ip) => trusted_proxies.is_trusted(&ip),
        // No peer info: fall back to trusting headers as the only signal
        None => true,
    };

    if headers_trusted {
        match forwarded_ip(req) {
            ForwardedIp::Xff(ip) | ForwardedIp::RealIp(ip) => return Cow::Owned(ip.to_string()),
            ForwardedIp::None => {}
        }
    } else if forwarded_ip(req) != ForwardedIp::None {
        debug!(
            peer = ?peer,
            "Ignoring forwarding headers from untrusted peer"
        );
    }

    match peer {
        Some(ip) => Cow::Owned(ip.to_string()),
        None => Cow::Borrowed(UNKNOWN_IP),
    }
}

/// Resolve the client IP preferring the TCP peer address.
///
/// Forwarding headers are used only when the peer is a configured trusted
/// proxy, or when no peer address is known. Used to key rate limiting, where
/// a client-chosen header must not pick the bucket.
pub fn extract_peer_ip_with_validation<B>(
    req: &Request<B>,
    trusted_proxies: &TrustedProxyConfig,
) -> Cow<'static, str> {
    match peer_ip(req) {
        Some(ip) if trusted_proxies.is_enabled() && trusted_proxies.is_trusted(&ip) => {
            extract_client_ip_with_validation(req, trusted_proxies)
        }
        Some(ip) => Cow::Owned(ip.to_string()),
        None => extract_client_ip_with_validation(req, trusted_proxies),
    }
}

/// Resolve the client IP trusting every source.
#[inline]
pub fn extract_client_ip<B>(req: &Request<B>) -> Cow<'static, str> {
    extract_client_ip_with_validation(req, &TrustedProxyConfig::default())
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use axum::body::Body;

    fn with_peer(builder: axum::http::request::Builder, peer: &str) -> Request<Body> {
        let mut req = builder.body(Body::empty()).unwrap();
        let addr: SocketAddr = peer.parse().unwrap();
        req.extensions_mut().insert(ConnectInfo(addr));
        req
    }

    #[test]
    fn test_extract_ip_from_xff() {
        let req = Request::builder()
            .header("x-forwarded-for", "192.168.1.1, 10.0.0.1")
            .body(Body::empty())
            .unwrap();

        assert_eq!(extract_client_ip(&req), "192.168.1.1");
    }

    #[test]
    fn test_extract_ip_from_real_ip() {
        let req = Request::builder()
            .header("x-real-ip", " 192.168.1.1 ")
            .body(Body::empty())
            .unwrap();

        assert_eq!(extract_client_ip(&req), "192.168.1.1");
    }

    #[test]
    fn test_extract_ip_xff_priority_over_real_ip() {
        let req = Request::builder()
            .header("x-forwarded-for", "10.0.0.1")
            .header("x-real-ip", "192.168.1.1")
            .body(Body::empty())
            .unwrap();

        assert_eq!(extract_client_ip(&req), "10.0.0.1");
    }

    #[test]
    fn test_extract_ip_falls_back_to_peer() {
        let req = with_peer(Request::builder(), "203.0.113.9:51000");
        assert_eq!(extract_client_ip(&req), "203.0.113.9");
    }

    #[test]
    fn test_extract_ip_unknown_is_borrowed() {
        let req = Request::builder().body(Body::empty()).unwrap();

        let ip = extract_client_ip(&req);
        assert_eq!(ip, UNKNOWN_IP);
        assert!(matches!(ip, Cow::Borrowed(_)));
    }

    #[test]
    fn test_trusted_peer_headers_honored() {
        let trusted = TrustedProxyConfig::new(&["10.0.0.0/8".to_string()]);
        let req = with_peer(
            Request::builder().header("x-forwarded-for", "198.51.100.7"),
            "10.1.2.3:443",
        );

        assert_eq!(
            extract_client_ip_with_validation(&req, &trusted),
            "198.51.100.7"
        );
    }

    #[test]
    fn test_untrusted_peer_headers_ignored() {
        let trusted = TrustedProxyConfig::new(&["10.0.0.0/8".to_string()]);
        let req = with_peer(
            Request::builder().header("x-forwarded-for", "198.51.100.7"),
            "203.0.113.9:51000",
        );

        assert_eq!(
            extract_client_ip_with_validation(&req, &trusted),
            "203.0.113.9"
        );
    }

    #[test]
    fn test_empty_forwarding_headers_ignored() {
        for xff in ["", " ", ",198.51.100.7"] {
            let req = with_peer(
                Request::builder().header("x-forwarded-for", xff),
                "203.0.113.9:51000",
            );
            assert_eq!(extract_client_ip(&req), "203.0.113.9", "xff={xff:?}");
        }

        let req = Request::builder()
            .header("x-forwarded-for", " ")
            .header("x-real-ip", "192.168.1.1")
            .body(Body::empty())
            .unwrap();
        assert_eq!(extract_client_ip(&req), "192.168.1.1");

        let req = Request::builder()
            .header("x-real-ip", "")
            .body(Body::empty())
            .unwrap();
        assert_eq!(extract_client_ip(&req), UNKNOWN_IP);
    }

    #[test]
    fn test_peer_first_ignores_headers_without_trusted_proxies() {
        let req = with_peer(
            Request::builder().header("x-forwarded-for", "10.9.9.1"),
            "203.0.113.9:51000",
        );

        assert_eq!(
            extract_peer_ip_with_validation(&req, &TrustedProxyConfig::default()),
            "203.0.113.9"
        );
    }

    #[test]
    fn test_peer_first_honors_trusted_proxy_headers() {
        let trusted = TrustedProxyConfig::new(&["10.0.0.0/8".to_string()]);

        let via_proxy = with_peer(
            Request::builder().header("x-forwarded-for", "198.51.100.7"),
            "10.1.2.3:443",
        );
        assert_eq!(
            extract_peer_ip_with_validation(&via_proxy, &trusted),
            "198.51.100.7"
        );

        let direct = with_peer(
            Request::builder().header("x-forwarded-for", "198.51.100.7"),
            "203.0.113.9:51000",
        );
        assert_eq!(
            extract_peer_ip_with_validation(&direct, &trusted),
            "203.0.113.9"
        );
    }

    #[test]
    fn test_peer_first_falls_back_to_headers_without_peer() {
        let req = Request::builder()
            .header("x-forwarded-for", "198.51.100.7")
            .body(Body::empty())
            .unwrap();

        assert_eq!(
            extract_peer_ip_with_validation(&req, &TrustedProxyConfig::default()),
            "198.51.100.7"
        );
    }

    #[test]
    fn test_extract_ip_xff_with_ipv6() {
        let req = Request::builder()
            .header("x-forwarded-for", "2001:db8::1, 10.0.0.1")
            .body(Body::empty())
            .unwrap();

        assert_eq!(extract_client_ip(&req), "2001:db8::1");
    }

    #[test]
    fn test_cidr_parse() {
        assert_eq!(CidrRange::parse("10.0.0.0/8").unwrap().prefix_len, 8);
        assert_eq!(CidrRange::parse("::1/128").unwrap().prefix_len, 128);
        assert_eq!(CidrRange::parse("192.168.1.1").unwrap().prefix_len, 32);
        assert!(CidrRange::parse("not-an-ip").is_none());
        assert!(CidrRange::parse("10.0.0.0/33").is_none());
        assert!(CidrRange::parse("10.0.0.0/x").is_none());
    }

    #[test]
    fn test_cidr_contains() {
        let cidr = CidrRange::parse("192.168.1.0/24").unwrap();
        assert!(cidr.contains(&"192.168.1.254".parse().unwrap()));
        assert!(!cidr.contains(&"192.168.2.1".parse().unwrap()));
        assert!(!cidr.contains(&"::1".parse().unwrap()));

        let everything = CidrRange::parse("0.0.0.0/0").unwrap();
        assert!(everything.contains(&"8.8.8.8".parse().unwrap()));
    }

    #[test]
    fn test_trusted_proxy_config_skips_invalid() {
        let config = TrustedProxyConfig::new(&["bogus".to_string(), "172.16.0.0/12".to_string()]);
        assert!(config.is_enabled());
        assert!(config.is_trusted(&"172.31.255.255".parse().unwrap()));
        assert!(!config.is_trusted(&"8.8.8.8".parse().unwrap()));
    }

    #[test]
    fn test_trusted_proxy_config_empty_trusts_all() {
        let config = TrustedProxyConfig::new(&[]);
        assert!(!config.is_enabled());
        assert!(config.is_trusted(&"1.2.3.4".parse().unwrap()));
    }
}
