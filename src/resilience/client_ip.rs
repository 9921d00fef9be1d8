// Client identity extraction for rate limiting
// Forwarded headers are only believed when the immediate peer is a trusted proxy

use axum::http::HeaderMap;
use std::net::IpAddr;
use std::str::FromStr;

pub const X_FORWARDED_FOR: &str = "x-forwarded-for";
pub const X_REAL_IP: &str = "x-real-ip";

/// Strip the port from a `host:port` socket address.
///
/// Handles `1.2.3.4:80`, `[::1]:8080`, bare IPv4/IPv6 and `[::1]`.
pub fn strip_port(addr: &str) -> &str {
    let addr = addr.trim();
    if let Some(rest) = addr.strip_prefix('[') {
        return match rest.find(']') {
            Some(end) => &rest[..end],
            None => addr,
        };
    }
    // more than one colon and no brackets is a bare IPv6 address
    match (addr.find(':'), addr.rfind(':')) {
        (Some(first), Some(last)) if first == last => &addr[..first],
        _ => addr,
    }
}

/// A trusted proxy entry: a literal address or a CIDR block
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProxyRule {
    Addr(IpAddr),
    Cidr { network: IpAddr, prefix: u8 },
}

impl ProxyRule {
    pub fn contains(&self, ip: &IpAddr) -> bool {
        match self {
            ProxyRule::Addr(addr) => addr == ip,
            ProxyRule::Cidr { network, prefix } => match (network, ip) {
                (IpAddr::V4(net), IpAddr::V4(ip)) => {
                    let mask = mask_u32(*prefix);
                    u32::from(*net) & mask == u32::from(*ip) & mask
                }
                (IpAddr::V6(net), IpAddr::V6(ip)) => {
                    let mask = mask_u128(*prefix);
                    u128::from(*net) & mask == u128::from(*ip) & mask
                }
                _ => false,
            },
        }
    }
}

fn mask_u32(prefix: u8) -> u32 {
    if prefix == 0 {
        0
    } else {
        u32::MAX << (32 - u32::from(prefix.min(32)))
    }
}

fn mask_u128(prefix: u8) -> u128 {
    if prefix == 0 {
        0
    } else {
        u128::MAX << (128 - u32::from(prefix.min(128)))
    }
}

impl FromStr for ProxyRule {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        match s.split_once('/') {
            None => s
                .parse::<IpAddr>()
                .map(ProxyRule::Addr)
                .map_err(|_| format!("invalid trusted proxy address: {}", s)),
            Some((addr, prefix)) => {
                let network: IpAddr = addr
                    .parse()
                    .map_err(|_| format!("invalid trusted proxy CIDR: {}", s))?;
                let prefix: u8 = prefix
                    .parse()
                    .map_err(|_| format!("invalid trusted proxy CIDR prefix: {}", s))?;
                let max = if network.is_ipv4() { 32 } else { 128 };
                if prefix > max {
                    return Err(format!("trusted proxy CIDR prefix out of range: {}", s));
                }
                Ok(ProxyRule::Cidr { network, prefix })
            }
        }
    }
}

/// Policy deciding which address identifies a client
#[derive(Debug, Clone, Default)]
pub struct ClientIdentity {
    trust_proxy_headers: bool,
    trusted_proxies: Vec<ProxyRule>,
}

impl ClientIdentity {
    /// Identity is always the socket peer
    pub fn peer_only() -> Self {
        Self::default()
    }

    /// Believe forwarded headers from the given proxies. Every entry must
    /// parse; all parse failures are returned together.
    pub fn trusting<I, S>(proxies: I) -> Result<Self, Vec<String>>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut rules = Vec::new();
        let mut errors = Vec::new();
        for proxy in proxies {
            match proxy.as_ref().parse::<ProxyRule>() {
                Ok(rule) => rules.push(rule),
                Err(err) => errors.push(err),
            }
        }
        if !errors.is_empty() {
            return Err(errors);
        }
        Ok(Self {
            trust_proxy_headers: true,
            trusted_proxies: rules,
        })
    }

    pub fn is_trusted(&self, ip: &IpAddr) -> bool {
        self.trusted_proxies.iter().any(|rule| rule.contains(ip))
    }

    /// Resolve the identity for a request from its socket peer (`host:port`)
    /// and headers.
    pub fn resolve(&self, remote_addr: &str, headers: &HeaderMap) -> String {
        let peer = strip_port(remote_addr);
        if !self.trust_proxy_headers {
            return peer.to_string();
        }

        let peer_ip = match peer.parse::<IpAddr>() {
            Ok(ip) => ip,
            Err(_) => return peer.to_string(),
        };
        if !self.is_trusted(&peer_ip) {
            return peer.to_string();
        }

        if let Some(ip) = forwarded_for(headers) {
            return ip;
        }
        if let Some(ip) = header_ip(headers, X_REAL_IP) {
            return ip;
        }
        peer.to_string()
    }
}

/// Leftmost X-Forwarded-For entry, if it is an address
fn forwarded_for(headers: &HeaderMap) -> Option<String> {
    let value = headers.get(X_FORWARDED_FOR)?.to_str().ok()?;
    let first = value.split(',').next()?.trim();
    first.parse::<IpAddr>().ok().map(|ip| ip.to_string())
}

fn header_ip(headers: &HeaderMap, name: &str) -> Option<String> {
    let value = headers.get(name)?.to_str().ok()?.trim();
    value.parse::<IpAddr>().ok().map(|ip| ip.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    fn headers(pairs: &[(&'static str, &str)]) -> HeaderMap {
        let mut map = HeaderMap::new();
        for (name, value) in pairs {
            map.insert(*name, HeaderValue::from_str(value).unwrap());
        }
        map
    }

    #[test]
    fn test_strip_port() {
        assert_eq!(strip_port("10.0.0.1:8080"), "10.0.0.1");
        assert_eq!(strip_port("[::1]:8080"), "::1");
        assert_eq!(strip_port("[2001:db8::1]"), "2001:db8::1");
        assert_eq!(strip_port("2001:db8::1"), "2001:db8::1");
        assert_eq!(strip_port("10.0.0.1"), "10.0.0.1");
    }

    #[test]
    fn test_proxy_rules() {
        let rule: ProxyRule = "10.0.0.0/8".parse().unwrap();
        assert!(rule.contains(&"10.1.2.3".parse().unwrap()));
        assert!(!rule.contains(&"11.0.0.1".parse().unwrap()));
        assert!(!rule.contains(&"::1".parse().unwrap()));

        let rule: ProxyRule = "fd00::/8".parse().unwrap();
        assert!(rule.contains(&"fd12::1".parse().unwrap()));

        let rule: ProxyRule = "0.0.0.0/0".parse().unwrap();
        assert!(rule.contains(&"8.8.8.8".parse().unwrap()));

        assert!("10.0.0.0/33".parse::<ProxyRule>().is_err());
        assert!("not-an-ip".parse::<ProxyRule>().is_err());
    }

    #[test]
    fn test_untrusting_policy_ignores_headers() {
        let identity = ClientIdentity::peer_only();
        let h = headers(&[(X_FORWARDED_FOR, "1.1.1.1")]);
        assert_eq!(identity.resolve("10.0.0.5:4000", &h), "10.0.0.5");
    }

    #[test]
    fn test_trusted_peer_uses_leftmost_forwarded_for() {
        let identity = ClientIdentity::trusting(["10.0.0.0/8"]).unwrap();
        let h = headers(&[(X_FORWARDED_FOR, "203.0.113.9, 10.0.0.2"), (X_REAL_IP, "198.51.100.1")]);
        assert_eq!(identity.resolve("10.0.0.5:4000", &h), "203.0.113.9");

        let h = headers(&[(X_REAL_IP, "198.51.100.1")]);
        assert_eq!(identity.resolve("10.0.0.5:4000", &h), "198.51.100.1");

        let h = headers(&[(X_FORWARDED_FOR, "garbage")]);
        assert_eq!(identity.resolve("10.0.0.5:4000", &h), "10.0.0.5");
    }

    #[test]
    fn test_untrusted_peer_cannot_spoof() {
        let identity = ClientIdentity::trusting(["10.0.0.1"]).unwrap();
        let h = headers(&[(X_FORWARDED_FOR, "1.2.3.4")]);
        assert_eq!(identity.resolve("192.0.2.7:5555", &h), "192.0.2.7");
        assert_eq!(identity.resolve("[::1]:5555", &h), "::1");
    }

    #[test]
    fn test_invalid_proxies_are_collected() {
        let errors = ClientIdentity::trusting(["10.0.0.1", "bad", "1.2.3.4/99"]).unwrap_err();
        assert_eq!(errors.len(), 2);
    }
}
