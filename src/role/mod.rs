//! Deterministic assignment of the TLS client role.
//!
//! Both peers must agree on who drives the handshake as the client
//! before any byte crosses the wire; negotiating it in-band would
//! defeat simultaneous open. Instead each side derives the role from
//! data both already have, the two public addresses.

use std::net::IpAddr;

use smallvec::SmallVec;

/// Returns `true` when this peer takes the TLS client role.
///
/// The peer with the lexicographically greater address bytes becomes
/// the client, so for any two distinct addresses of the same family
/// exactly one side answers `true` here.
pub fn is_client(my_ip: IpAddr, peer_ip: IpAddr) -> bool {
    ip_bytes(my_ip) > ip_bytes(peer_ip)
}

fn ip_bytes(ip: IpAddr) -> SmallVec<[u8; 16]> {
    match ip {
        IpAddr::V4(ip) => SmallVec::from_slice(&ip.octets()),
        IpAddr::V6(ip) => SmallVec::from_slice(&ip.octets()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ip(s: &str) -> IpAddr {
        s.parse().unwrap()
    }

    #[test]
    fn greater_address_takes_the_client_role() {
        assert!(!is_client(ip("127.0.0.2"), ip("127.0.0.3")));
        assert!(is_client(ip("127.0.0.3"), ip("127.0.0.2")));
    }

    #[test]
    fn exactly_one_side_is_client() {
        let addrs = [
            ("1.2.3.4", "1.2.3.5"),
            ("10.0.0.1", "192.168.0.1"),
            ("255.255.255.254", "0.0.0.1"),
            ("2001:db8::1", "2001:db8::2"),
            ("fe80::1", "::1"),
        ];
        for (a, b) in addrs {
            assert_ne!(is_client(ip(a), ip(b)), is_client(ip(b), ip(a)));
        }
    }

    #[test]
    fn comparison_is_bytewise_not_stringwise() {
        // "100..." sorts before "2..." as a string, not as bytes
        assert!(is_client(ip("100.0.0.1"), ip("2.0.0.1")));
    }
}
