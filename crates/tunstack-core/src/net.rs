//! Address family and address classification helpers

use ipnet::{IpNet, Ipv4Net, Ipv6Net};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

/// IP address family
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Family {
    /// IPv4
    V4,
    /// IPv6
    V6,
}

impl Family {
    /// Both families, IPv4 first
    pub const ALL: [Family; 2] = [Family::V4, Family::V6];

    /// Family of an address
    pub fn of(addr: IpAddr) -> Self {
        match addr {
            IpAddr::V4(_) => Family::V4,
            IpAddr::V6(_) => Family::V6,
        }
    }

    /// Family of a prefix
    pub fn of_net(net: &IpNet) -> Self {
        Self::of(net.addr())
    }

    /// Human-readable name
    pub fn as_str(self) -> &'static str {
        match self {
            Family::V4 => "IPv4",
            Family::V6 => "IPv6",
        }
    }

    /// Unspecified address of this family
    pub fn unspecified(self) -> IpAddr {
        match self {
            Family::V4 => IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            Family::V6 => IpAddr::V6(Ipv6Addr::UNSPECIFIED),
        }
    }

    /// The 0/0 prefix of this family
    pub fn default_route(self) -> IpNet {
        match self {
            Family::V4 => IpNet::V4(Ipv4Net::default()),
            Family::V6 => IpNet::V6(Ipv6Net::default()),
        }
    }
}

impl fmt::Display for Family {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Link-local unicast: 169.254.0.0/16 or fe80::/10
pub fn is_link_local_unicast(addr: IpAddr) -> bool {
    match addr {
        IpAddr::V4(v4) => v4.is_link_local(),
        IpAddr::V6(v6) => (v6.segments()[0] & 0xffc0) == 0xfe80,
    }
}

/// Global unicast in the routing sense: anything a packet can be sent to
/// through a gateway. Private ranges count as global; loopback, link-local,
/// multicast, broadcast and unspecified do not.
pub fn is_global_unicast(addr: IpAddr) -> bool {
    let addr = match addr {
        IpAddr::V6(v6) => v6.to_ipv4_mapped().map_or(addr, IpAddr::V4),
        v4 => v4,
    };

    match addr {
        IpAddr::V4(v4) => {
            !v4.is_unspecified()
                && !v4.is_loopback()
                && !v4.is_multicast()
                && !v4.is_broadcast()
                && !v4.is_link_local()
        }
        IpAddr::V6(v6) => {
            !v6.is_unspecified()
                && !v6.is_loopback()
                && !v6.is_multicast()
                && !is_link_local_unicast(addr)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ip(s: &str) -> IpAddr {
        s.parse().unwrap()
    }

    #[test]
    fn test_global_unicast() {
        assert!(is_global_unicast(ip("93.184.216.34")));
        assert!(is_global_unicast(ip("10.1.2.3")));
        assert!(is_global_unicast(ip("192.168.1.1")));
        assert!(is_global_unicast(ip("2001:db8::1")));
        assert!(is_global_unicast(ip("::ffff:8.8.8.8")));

        assert!(!is_global_unicast(ip("0.0.0.0")));
        assert!(!is_global_unicast(ip("127.0.0.1")));
        assert!(!is_global_unicast(ip("169.254.10.1")));
        assert!(!is_global_unicast(ip("224.0.0.251")));
        assert!(!is_global_unicast(ip("255.255.255.255")));
        assert!(!is_global_unicast(ip("::")));
        assert!(!is_global_unicast(ip("::1")));
        assert!(!is_global_unicast(ip("fe80::1")));
        assert!(!is_global_unicast(ip("ff02::1")));
        assert!(!is_global_unicast(ip("::ffff:127.0.0.1")));
    }

    #[test]
    fn test_link_local() {
        assert!(is_link_local_unicast(ip("169.254.0.1")));
        assert!(is_link_local_unicast(ip("febf::1")));
        assert!(!is_link_local_unicast(ip("fec0::1")));
        assert!(!is_link_local_unicast(ip("10.0.0.1")));
    }

    #[test]
    fn test_default_route() {
        assert_eq!(Family::V4.default_route().to_string(), "0.0.0.0/0");
        assert_eq!(Family::V6.default_route().to_string(), "::/0");
    }
}
