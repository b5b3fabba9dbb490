//! SSRF resolution guard (spec §4.8): a subscription URL is rejected if
//! *any* address its hostname resolves to falls in a reserved or private
//! range. Resolution uses blocking stdlib DNS — no extra crate needed.

use std::net::{IpAddr, ToSocketAddrs};

use kiln_types::{ErrorKind, KilnError};
use url::Url;

fn is_reserved_or_private(ip: IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => {
            v4.is_private()
                || v4.is_loopback()
                || v4.is_link_local()
                || v4.is_multicast()
                || v4.is_unspecified()
                || v4.is_broadcast()
        }
        IpAddr::V6(v6) => {
            v6.is_loopback()
                || v6.is_multicast()
                || v6.is_unspecified()
                || v6.is_unique_local()
                || v6.is_unicast_link_local()
        }
    }
}

/// Parses `raw`, resolves its host, and rejects it with `SSRF_BLOCKED` if
/// any resolved address is reserved/private. Returns the parsed URL on
/// success so callers don't have to re-parse it.
pub fn validate_url(raw: &str) -> Result<Url, KilnError> {
    let parsed = Url::parse(raw)
        .map_err(|e| KilnError::new(ErrorKind::SsrfBlocked, format!("invalid webhook URL: {e}")))?;

    if parsed.scheme() != "http" && parsed.scheme() != "https" {
        return Err(KilnError::new(
            ErrorKind::SsrfBlocked,
            format!("unsupported scheme {}", parsed.scheme()),
        ));
    }

    let host = parsed
        .host_str()
        .ok_or_else(|| KilnError::new(ErrorKind::SsrfBlocked, "webhook URL has no host"))?;
    let port = parsed.port_or_known_default().unwrap_or(443);

    let addrs = (host, port).to_socket_addrs().map_err(|e| {
        KilnError::new(ErrorKind::SsrfBlocked, format!("failed to resolve {host}: {e}"))
    })?;

    let mut resolved_any = false;
    for addr in addrs {
        resolved_any = true;
        if is_reserved_or_private(addr.ip()) {
            return Err(KilnError::new(
                ErrorKind::SsrfBlocked,
                format!("{host} resolves to reserved/private address {}", addr.ip()),
            ));
        }
    }
    if !resolved_any {
        return Err(KilnError::new(ErrorKind::SsrfBlocked, format!("{host} resolved to no addresses")));
    }

    Ok(parsed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{Ipv4Addr, Ipv6Addr};

    #[test]
    fn rejects_rfc1918_ranges() {
        assert!(is_reserved_or_private(IpAddr::V4(Ipv4Addr::new(10, 0, 0, 5))));
        assert!(is_reserved_or_private(IpAddr::V4(Ipv4Addr::new(172, 16, 0, 1))));
        assert!(is_reserved_or_private(IpAddr::V4(Ipv4Addr::new(192, 168, 1, 1))));
    }

    #[test]
    fn rejects_loopback_and_link_local() {
        assert!(is_reserved_or_private(IpAddr::V4(Ipv4Addr::new(127, 0, 0, 1))));
        assert!(is_reserved_or_private(IpAddr::V4(Ipv4Addr::new(169, 254, 1, 1))));
        assert!(is_reserved_or_private(IpAddr::V6(Ipv6Addr::LOCALHOST)));
    }

    #[test]
    fn rejects_unique_local_ipv6_and_multicast() {
        assert!(is_reserved_or_private(IpAddr::V6(Ipv6Addr::new(
            0xfc00, 0, 0, 0, 0, 0, 0, 1
        ))));
        assert!(is_reserved_or_private(IpAddr::V4(Ipv4Addr::new(224, 0, 0, 1))));
    }

    #[test]
    fn accepts_public_address() {
        assert!(!is_reserved_or_private(IpAddr::V4(Ipv4Addr::new(93, 184, 216, 34))));
    }

    #[test]
    fn rejects_non_http_scheme() {
        let err = validate_url("ftp://example.test/hook").unwrap_err();
        assert_eq!(err.kind, ErrorKind::SsrfBlocked);
    }

    #[test]
    fn rejects_malformed_url() {
        let err = validate_url("not a url").unwrap_err();
        assert_eq!(err.kind, ErrorKind::SsrfBlocked);
    }

    #[test]
    fn rejects_literal_private_ip_in_url() {
        let err = validate_url("http://10.0.0.5/hook").unwrap_err();
        assert_eq!(err.kind, ErrorKind::SsrfBlocked);
    }
}
