//! Address parsing shared by the panel and node services.
//!
//! Tunnel specs carry addresses in every shape the cores accept: bare IPv4,
//! bare IPv6, `host:port`, `[ipv6]:port`, bare hostnames. Hostnames are left
//! unresolved; classification only decides whether brackets are needed when
//! a port is attached.

use std::net::Ipv6Addr;

/// A parsed `host[:port]` string.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedAddr {
    pub host: String,
    pub port: Option<u16>,
    pub is_ipv6: bool,
}

/// Parse an address string into `(host, optional port, is_ipv6)`.
///
/// Rules, in order:
/// - `[ipv6]` or `[ipv6]:port` — the bracketed form always means IPv6.
/// - A string that parses whole as an IPv6 address is IPv6 with no port
///   (colon-containing, so it must be checked before the rsplit).
/// - Otherwise rsplit once on `:`; the tail is a port iff it parses as u16.
///   A host part that itself parses as IPv6 keeps the IPv6 classification.
/// - Anything else is a host with no port.
pub fn parse_address_port(address: &str) -> ParsedAddr {
    let address = address.trim();

    if address.is_empty() {
        return ParsedAddr {
            host: String::new(),
            port: None,
            is_ipv6: false,
        };
    }

    if let Some(stripped) = address.strip_prefix('[') {
        if let Some(end) = stripped.find(']') {
            let host = &stripped[..end];
            let rest = &stripped[end + 1..];
            let port = rest
                .strip_prefix(':')
                .and_then(|p| p.parse::<u16>().ok());
            return ParsedAddr {
                host: host.to_string(),
                port,
                is_ipv6: true,
            };
        }
    }

    if address.parse::<Ipv6Addr>().is_ok() {
        return ParsedAddr {
            host: address.to_string(),
            port: None,
            is_ipv6: true,
        };
    }

    if let Some((host, port_str)) = address.rsplit_once(':') {
        if let Ok(port) = port_str.parse::<u16>() {
            let is_ipv6 = host.parse::<Ipv6Addr>().is_ok();
            return ParsedAddr {
                host: host.to_string(),
                port: Some(port),
                is_ipv6,
            };
        }
    }

    ParsedAddr {
        host: address.to_string(),
        port: None,
        is_ipv6: false,
    }
}

/// Format a host and optional port back into a single address string,
/// re-bracketing IPv6 hosts when a port is attached.
pub fn format_address_port(host: &str, port: Option<u16>) -> String {
    if host.is_empty() {
        return String::new();
    }

    let is_ipv6 = host.parse::<Ipv6Addr>().is_ok();

    match port {
        Some(port) if is_ipv6 => format!("[{}]:{}", host, port),
        Some(port) => format!("{}:{}", host, port),
        None => host.to_string(),
    }
}

pub fn is_ipv6_address(host: &str) -> bool {
    host.parse::<Ipv6Addr>().is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_ipv4_with_port() {
        let parsed = parse_address_port("127.0.0.1:8080");
        assert_eq!(parsed.host, "127.0.0.1");
        assert_eq!(parsed.port, Some(8080));
        assert!(!parsed.is_ipv6);
    }

    #[test]
    fn parses_bracketed_ipv6() {
        let parsed = parse_address_port("[2001:db8::1]:443");
        assert_eq!(parsed.host, "2001:db8::1");
        assert_eq!(parsed.port, Some(443));
        assert!(parsed.is_ipv6);

        let bare = parse_address_port("[2001:db8::1]");
        assert_eq!(bare.host, "2001:db8::1");
        assert_eq!(bare.port, None);
        assert!(bare.is_ipv6);
    }

    #[test]
    fn bare_ipv6_has_no_port() {
        let parsed = parse_address_port("2001:db8::1");
        assert_eq!(parsed.host, "2001:db8::1");
        assert_eq!(parsed.port, None);
        assert!(parsed.is_ipv6);
    }

    #[test]
    fn hostname_with_and_without_port() {
        let parsed = parse_address_port("example.com:9000");
        assert_eq!(parsed.host, "example.com");
        assert_eq!(parsed.port, Some(9000));
        assert!(!parsed.is_ipv6);

        let bare = parse_address_port("example.com");
        assert_eq!(bare.host, "example.com");
        assert_eq!(bare.port, None);
    }

    #[test]
    fn non_numeric_tail_is_part_of_host() {
        let parsed = parse_address_port("example.com:notaport");
        assert_eq!(parsed.host, "example.com:notaport");
        assert_eq!(parsed.port, None);
    }

    #[test]
    fn format_rebrackets_ipv6_only_with_port() {
        assert_eq!(
            format_address_port("2001:db8::1", Some(7777)),
            "[2001:db8::1]:7777"
        );
        assert_eq!(format_address_port("2001:db8::1", None), "2001:db8::1");
        assert_eq!(format_address_port("10.0.0.5", Some(80)), "10.0.0.5:80");
    }

    #[test]
    fn round_trips_well_formed_inputs() {
        for input in [
            "127.0.0.1:8080",
            "10.0.0.5",
            "[2001:db8::1]:443",
            "2001:db8::1",
            "relay.example.net:7000",
            "relay.example.net",
        ] {
            let parsed = parse_address_port(input);
            assert_eq!(format_address_port(&parsed.host, parsed.port), input);
        }
    }
}
