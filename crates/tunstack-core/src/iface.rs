//! Host interface registry
//!
//! A snapshot of the host's network interfaces, taken once per process and
//! read-only afterwards. Both the outbound binder and the default-route
//! resolvers consult it.

use crate::error::{Error, Result};
use crate::net::{is_link_local_unicast, Family};
use ipnet::IpNet;
use once_cell::sync::OnceCell;
use std::collections::HashMap;
use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::sync::Arc;
use tracing::{debug, info};

pub use crate::net::is_global_unicast;

static REGISTRY: OnceCell<Arc<Registry>> = OnceCell::new();

/// Global registry, resolving the host snapshot on first use.
///
/// Concurrent first callers block until a single resolution finishes.
/// Callers should invoke this once at startup and abort on error.
pub fn try_registry() -> Result<Arc<Registry>> {
    REGISTRY
        .get_or_try_init(|| Registry::resolve().map(Arc::new))
        .map(Arc::clone)
}

/// Global registry, if it has already been resolved
pub fn registry() -> Option<Arc<Registry>> {
    REGISTRY.get().cloned()
}

/// Hardware (MAC) address
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct HardwareAddr(pub [u8; 6]);

impl fmt::Display for HardwareAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let b = &self.0;
        write!(
            f,
            "{:02x}:{:02x}:{:02x}:{:02x}:{:02x}:{:02x}",
            b[0], b[1], b[2], b[3], b[4], b[5]
        )
    }
}

/// A host network interface
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Interface {
    /// Interface name (unique)
    pub name: String,
    /// OS interface index (unique)
    pub index: u32,
    /// Assigned prefixes, in OS order
    pub addresses: Vec<IpNet>,
    /// Hardware address, if the link has one
    pub hardware_addr: Option<HardwareAddr>,
    has_ipv4: bool,
}

impl Interface {
    /// Create an interface record
    pub fn new(
        name: impl Into<String>,
        index: u32,
        addresses: Vec<IpNet>,
        hardware_addr: Option<HardwareAddr>,
    ) -> Self {
        let has_ipv4 = addresses.iter().any(|a| matches!(a, IpNet::V4(_)));
        Self {
            name: name.into(),
            index,
            addresses,
            hardware_addr,
            has_ipv4,
        }
    }

    /// Whether at least one IPv4 prefix is assigned
    pub fn has_ipv4(&self) -> bool {
        self.has_ipv4
    }

    /// Best local address of `family` for reaching `dst`.
    ///
    /// A prefix whose subnet contains `dst` wins. Otherwise the first
    /// non-link-local address of the family is returned. With no `dst`
    /// (listen-only binds) that first address is returned straight away.
    pub fn pick_address(&self, dst: Option<IpAddr>, family: Family) -> Option<IpAddr> {
        let mut fallback = None;

        for net in self
            .addresses
            .iter()
            .filter(|net| Family::of_net(net) == family)
        {
            if fallback.is_none() && !is_link_local_unicast(net.addr()) {
                fallback = Some(net.addr());
                if dst.is_none() {
                    return fallback;
                }
            }

            if let Some(dst) = dst {
                if net.contains(&dst) {
                    return Some(net.addr());
                }
            }
        }

        fallback
    }

    /// IPv4 variant of [`Interface::pick_address`]
    pub fn pick_ipv4(&self, dst: Option<Ipv4Addr>) -> Option<Ipv4Addr> {
        match self.pick_address(dst.map(IpAddr::V4), Family::V4) {
            Some(IpAddr::V4(v4)) => Some(v4),
            _ => None,
        }
    }

    /// IPv6 variant of [`Interface::pick_address`]
    pub fn pick_ipv6(&self, dst: Option<Ipv6Addr>) -> Option<Ipv6Addr> {
        match self.pick_address(dst.map(IpAddr::V6), Family::V6) {
            Some(IpAddr::V6(v6)) => Some(v6),
            _ => None,
        }
    }

    /// Whether `addr` is assigned to this interface
    pub fn owns(&self, addr: IpAddr) -> bool {
        self.addresses.iter().any(|net| net.addr() == addr)
    }
}

/// Immutable snapshot of host interfaces
#[derive(Debug, Default)]
pub struct Registry {
    interfaces: Vec<Interface>,
    by_name: HashMap<String, usize>,
    by_index: HashMap<u32, usize>,
}

impl Registry {
    /// Enumerate the host's interfaces
    pub fn resolve() -> Result<Self> {
        let interfaces: Vec<Interface> = pnet::datalink::interfaces()
            .into_iter()
            .map(|ni| {
                let addresses = ni
                    .ips
                    .iter()
                    .filter_map(|ip| IpNet::new(ip.ip(), ip.prefix()).ok())
                    .collect();
                let hardware_addr = ni
                    .mac
                    .map(|m| HardwareAddr([m.0, m.1, m.2, m.3, m.4, m.5]));
                Interface::new(ni.name, ni.index, addresses, hardware_addr)
            })
            .collect();

        if interfaces.is_empty() {
            return Err(Error::Config(
                "Host interface enumeration returned nothing".to_string(),
            ));
        }

        let registry = Self::from_interfaces(interfaces)?;
        info!(count = registry.len(), "Interface registry resolved");
        Ok(registry)
    }

    /// Build a registry from known interfaces
    pub fn from_interfaces(interfaces: Vec<Interface>) -> Result<Self> {
        let mut by_name = HashMap::with_capacity(interfaces.len());
        let mut by_index = HashMap::with_capacity(interfaces.len());

        for (pos, iface) in interfaces.iter().enumerate() {
            if by_name.insert(iface.name.clone(), pos).is_some() {
                return Err(Error::Config(format!(
                    "Duplicate interface name '{}'",
                    iface.name
                )));
            }
            if by_index.insert(iface.index, pos).is_some() {
                return Err(Error::Config(format!(
                    "Duplicate interface index {}",
                    iface.index
                )));
            }
            debug!(
                name = %iface.name,
                index = iface.index,
                addresses = iface.addresses.len(),
                "Registered interface"
            );
        }

        Ok(Self {
            interfaces,
            by_name,
            by_index,
        })
    }

    /// Look up an interface by name
    pub fn lookup_by_name(&self, name: &str) -> Result<&Interface> {
        self.by_name
            .get(name)
            .map(|&pos| &self.interfaces[pos])
            .ok_or_else(|| Error::not_found("interface name", name))
    }

    /// Look up an interface by OS index
    pub fn lookup_by_index(&self, index: u32) -> Result<&Interface> {
        self.by_index
            .get(&index)
            .map(|&pos| &self.interfaces[pos])
            .ok_or_else(|| Error::not_found("interface index", index))
    }

    /// Interface that owns `addr`
    pub fn lookup_by_address(&self, addr: IpAddr) -> Result<&Interface> {
        self.interfaces
            .iter()
            .find(|iface| iface.owns(addr))
            .ok_or_else(|| Error::not_found("interface address", addr))
    }

    /// Names of interfaces with at least one IPv4 address
    pub fn ipv4_capable(&self) -> Vec<&str> {
        self.interfaces
            .iter()
            .filter(|iface| iface.has_ipv4())
            .map(|iface| iface.name.as_str())
            .collect()
    }

    /// All interfaces, in enumeration order
    pub fn iter(&self) -> impl Iterator<Item = &Interface> {
        self.interfaces.iter()
    }

    /// Number of interfaces
    pub fn len(&self) -> usize {
        self.interfaces.len()
    }

    /// Whether the snapshot is empty
    pub fn is_empty(&self) -> bool {
        self.interfaces.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn nets(list: &[&str]) -> Vec<IpNet> {
        list.iter().map(|s| s.parse().unwrap()).collect()
    }

    fn sample() -> Registry {
        Registry::from_interfaces(vec![
            Interface::new("lo", 1, nets(&["127.0.0.1/8", "::1/128"]), None),
            Interface::new(
                "eth0",
                2,
                nets(&["10.0.0.5/24", "192.168.1.9/24", "fe80::1/64", "2001:db8::5/64"]),
                Some(HardwareAddr([0x02, 0, 0, 0, 0, 0x01])),
            ),
            Interface::new("wg0", 7, nets(&["fd00::2/64"]), None),
        ])
        .unwrap()
    }

    #[test]
    fn test_pick_same_subnet_wins() {
        let iface = Interface::new("eth0", 2, nets(&["10.0.0.5/24", "192.168.1.9/24"]), None);
        assert_eq!(
            iface.pick_address(Some("10.0.0.200".parse().unwrap()), Family::V4),
            Some("10.0.0.5".parse().unwrap())
        );
        assert_eq!(
            iface.pick_address(Some("192.168.1.40".parse().unwrap()), Family::V4),
            Some("192.168.1.9".parse().unwrap())
        );
    }

    #[test]
    fn test_pick_falls_back_to_first_non_link_local() {
        let iface = Interface::new(
            "eth0",
            2,
            nets(&["169.254.3.3/16", "10.0.0.5/24", "192.168.1.9/24"]),
            None,
        );
        assert_eq!(
            iface.pick_address(Some("8.8.8.8".parse().unwrap()), Family::V4),
            Some("10.0.0.5".parse().unwrap())
        );
        assert_eq!(iface.pick_address(None, Family::V4), Some("10.0.0.5".parse().unwrap()));
    }

    #[test]
    fn test_pick_link_local_only() {
        let iface = Interface::new("eth0", 2, nets(&["169.254.1.1/16", "fe80::1/64"]), None);
        assert_eq!(iface.pick_address(Some("8.8.8.8".parse().unwrap()), Family::V4), None);
        assert_eq!(iface.pick_ipv6(None), None);
    }

    #[test]
    fn test_pick_respects_family() {
        let registry = sample();
        let eth0 = registry.lookup_by_name("eth0").unwrap();
        assert_eq!(
            eth0.pick_ipv6(Some("2606:4700::1111".parse().unwrap())),
            Some("2001:db8::5".parse().unwrap())
        );
        assert_eq!(eth0.pick_ipv4(None), Some(Ipv4Addr::new(10, 0, 0, 5)));
    }

    #[test]
    fn test_lookups() {
        let registry = sample();
        assert_eq!(registry.lookup_by_index(7).unwrap().name, "wg0");
        assert_eq!(registry.lookup_by_name("lo").unwrap().index, 1);
        assert_eq!(
            registry
                .lookup_by_address("192.168.1.9".parse().unwrap())
                .unwrap()
                .name,
            "eth0"
        );

        let err = registry.lookup_by_name("eth9").unwrap_err();
        assert!(matches!(err, Error::NotFound { .. }));
        assert!(registry.lookup_by_index(99).is_err());
    }

    #[test]
    fn test_ipv4_capable() {
        let registry = sample();
        assert_eq!(registry.ipv4_capable(), ["lo", "eth0"]);
        assert!(!registry.lookup_by_name("wg0").unwrap().has_ipv4());
    }

    #[test]
    fn test_duplicates_rejected() {
        let result = Registry::from_interfaces(vec![
            Interface::new("eth0", 2, vec![], None),
            Interface::new("eth0", 3, vec![], None),
        ]);
        assert!(result.is_err());

        let result = Registry::from_interfaces(vec![
            Interface::new("eth0", 2, vec![], None),
            Interface::new("eth1", 2, vec![], None),
        ]);
        assert!(result.is_err());
    }

    #[test]
    fn test_hardware_addr_display() {
        let mac = HardwareAddr([0xde, 0xad, 0xbe, 0xef, 0x00, 0x01]);
        assert_eq!(mac.to_string(), "de:ad:be:ef:00:01");
    }
}
