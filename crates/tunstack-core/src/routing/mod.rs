//! Host routing configuration
//!
//! On platforms with policy routing the device gets an isolated routing
//! table holding only default routes through it, plus a block of policy
//! rules deciding which traffic consults that table. Everything installed
//! is recorded in a [`RoutingState`] so it can be removed again without
//! touching unrelated configuration.
//!
//! Platforms without policy routing implement [`TunRouting`] directly with
//! their native configuration commands.

mod memory;
mod plan;
mod state;

pub use crate::net::Family;
pub use memory::MemoryRouting;
pub use plan::{allocate_table, RulePlan, DEFAULT_TABLE_INDEX};
pub use state::{PolicyRouting, RoutingState};

use crate::config::TunConfig;
use crate::error::{Error, Result};
use ipnet::{IpNet, Ipv4Net};
use std::fmt;
use std::net::Ipv4Addr;

/// Id of the kernel's main routing table
pub const MAIN_TABLE: u32 = 254;

/// Route keyed by (table, destination, link)
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RouteEntry {
    /// Routing table id
    pub table: u32,
    /// Destination prefix
    pub destination: IpNet,
    /// Outgoing link name
    pub link: Option<String>,
}

impl RouteEntry {
    /// Route to `destination` through `link` in `table`
    pub fn new(table: u32, destination: IpNet, link: impl Into<String>) -> Self {
        Self {
            table,
            destination,
            link: Some(link.into()),
        }
    }

    /// Address family of the destination
    pub fn family(&self) -> Family {
        Family::of_net(&self.destination)
    }
}

impl fmt::Display for RouteEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.destination)?;
        if let Some(ref link) = self.link {
            write!(f, " dev {link}")?;
        }
        write!(f, " table {}", self.table)
    }
}

/// Table a policy rule points at
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RuleTable {
    /// The kernel's main table
    Main,
    /// Any other table
    Id(u32),
}

impl RuleTable {
    /// Numeric table id
    pub fn id(self) -> u32 {
        match self {
            RuleTable::Main => MAIN_TABLE,
            RuleTable::Id(id) => id,
        }
    }
}

impl From<u32> for RuleTable {
    fn from(id: u32) -> Self {
        if id == MAIN_TABLE {
            RuleTable::Main
        } else {
            RuleTable::Id(id)
        }
    }
}

impl fmt::Display for RuleTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RuleTable::Main => f.write_str("main"),
            RuleTable::Id(id) => write!(f, "{id}"),
        }
    }
}

/// Inclusive port range
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PortRange {
    /// First port
    pub start: u16,
    /// Last port
    pub end: u16,
}

impl PortRange {
    /// A single port
    pub fn single(port: u16) -> Self {
        Self {
            start: port,
            end: port,
        }
    }
}

impl fmt::Display for PortRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.start == self.end {
            write!(f, "{}", self.start)
        } else {
            write!(f, "{}-{}", self.start, self.end)
        }
    }
}

/// Policy routing rule
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PolicyRule {
    /// Rule priority (lower is consulted first)
    pub priority: u32,
    /// Address family
    pub family: Family,
    /// Source match
    pub src: Option<IpNet>,
    /// Destination match
    pub dst: Option<IpNet>,
    /// Incoming interface match
    pub iif: Option<String>,
    /// Negate the selector
    pub invert: bool,
    /// Destination port match
    pub dport: Option<PortRange>,
    /// Reject lookup results with a prefix length at or below this value
    pub suppress_prefix_len: Option<u8>,
    /// Table to consult
    pub table: RuleTable,
}

impl PolicyRule {
    /// Match-all rule
    pub fn new(priority: u32, family: Family, table: RuleTable) -> Self {
        Self {
            priority,
            family,
            src: None,
            dst: None,
            iif: None,
            invert: false,
            dport: None,
            suppress_prefix_len: None,
            table,
        }
    }

    /// Match on source prefix
    pub fn with_src(mut self, src: IpNet) -> Self {
        self.src = Some(src);
        self
    }

    /// Match on destination prefix
    pub fn with_dst(mut self, dst: IpNet) -> Self {
        self.dst = Some(dst);
        self
    }

    /// Match on incoming interface
    pub fn with_iif(mut self, name: impl Into<String>) -> Self {
        self.iif = Some(name.into());
        self
    }

    /// Negate the selector
    pub fn inverted(mut self) -> Self {
        self.invert = true;
        self
    }

    /// Match on destination port
    pub fn with_dport(mut self, range: PortRange) -> Self {
        self.dport = Some(range);
        self
    }

    /// Set the specificity floor
    pub fn with_suppress_prefix_len(mut self, len: u8) -> Self {
        self.suppress_prefix_len = Some(len);
        self
    }
}

impl fmt::Display for PolicyRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:", self.priority)?;
        if self.invert {
            f.write_str(" not")?;
        }
        match self.src {
            Some(src) => write!(f, " from {src}")?,
            None => f.write_str(" from all")?,
        }
        if let Some(dst) = self.dst {
            write!(f, " to {dst}")?;
        }
        if let Some(ref iif) = self.iif {
            write!(f, " iif {iif}")?;
        }
        if let Some(dport) = self.dport {
            write!(f, " dport {dport}")?;
        }
        write!(f, " lookup {}", self.table)?;
        if let Some(len) = self.suppress_prefix_len {
            write!(f, " suppress_prefixlength {len}")?;
        }
        Ok(())
    }
}

/// Kernel routing and policy collaborator.
///
/// Implementations are expected to be synchronous; every call maps onto
/// one kernel request.
pub trait KernelRouting: Send + Sync {
    /// Assign an address prefix to a link
    fn add_address(&self, link: &str, addr: &IpNet) -> Result<()>;

    /// Remove an address prefix from a link
    fn del_address(&self, link: &str, addr: &IpNet) -> Result<()>;

    /// Bring a link up
    fn set_link_up(&self, link: &str) -> Result<()>;

    /// Bring a link down
    fn set_link_down(&self, link: &str) -> Result<()>;

    /// Routes of `family` across every table
    fn list_routes(&self, family: Family) -> Result<Vec<RouteEntry>>;

    /// Install a route
    fn add_route(&self, route: &RouteEntry) -> Result<()>;

    /// Remove a route
    fn del_route(&self, route: &RouteEntry) -> Result<()>;

    /// Policy rules of `family`
    fn list_rules(&self, family: Family) -> Result<Vec<PolicyRule>>;

    /// Install a policy rule
    fn add_rule(&self, rule: &PolicyRule) -> Result<()>;

    /// Remove a policy rule
    fn del_rule(&self, rule: &PolicyRule) -> Result<()>;
}

impl<K: KernelRouting + ?Sized> KernelRouting for std::sync::Arc<K> {
    fn add_address(&self, link: &str, addr: &IpNet) -> Result<()> {
        (**self).add_address(link, addr)
    }

    fn del_address(&self, link: &str, addr: &IpNet) -> Result<()> {
        (**self).del_address(link, addr)
    }

    fn set_link_up(&self, link: &str) -> Result<()> {
        (**self).set_link_up(link)
    }

    fn set_link_down(&self, link: &str) -> Result<()> {
        (**self).set_link_down(link)
    }

    fn list_routes(&self, family: Family) -> Result<Vec<RouteEntry>> {
        (**self).list_routes(family)
    }

    fn add_route(&self, route: &RouteEntry) -> Result<()> {
        (**self).add_route(route)
    }

    fn del_route(&self, route: &RouteEntry) -> Result<()> {
        (**self).del_route(route)
    }

    fn list_rules(&self, family: Family) -> Result<Vec<PolicyRule>> {
        (**self).list_rules(family)
    }

    fn add_rule(&self, rule: &PolicyRule) -> Result<()> {
        (**self).add_rule(rule)
    }

    fn del_rule(&self, rule: &PolicyRule) -> Result<()> {
        (**self).del_rule(rule)
    }
}

/// Device address and route configuration as one reversible unit
pub trait TunRouting: Send {
    /// Apply the configuration; a failure leaves nothing behind
    fn setup(&mut self, config: &TunConfig) -> Result<()>;

    /// Undo everything `setup` applied. Best-effort: the returned errors
    /// describe steps that failed, later steps still ran.
    fn teardown(&mut self) -> Vec<Error>;
}

/// IPv4 prefixes covering everything but 0.0.0.0/8 without replacing the
/// host's default route
pub fn split_default_routes() -> Vec<IpNet> {
    (0..8u8)
        .filter_map(|bit| {
            let first = 1u8 << bit;
            Ipv4Net::new(Ipv4Addr::new(first, 0, 0, 0), 8 - bit).ok()
        })
        .map(IpNet::V4)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::IpAddr;

    #[test]
    fn test_split_default_routes() {
        let routes: Vec<String> = split_default_routes().iter().map(ToString::to_string).collect();
        assert_eq!(
            routes,
            [
                "1.0.0.0/8",
                "2.0.0.0/7",
                "4.0.0.0/6",
                "8.0.0.0/5",
                "16.0.0.0/4",
                "32.0.0.0/3",
                "64.0.0.0/2",
                "128.0.0.0/1"
            ]
        );
        // Nothing but 0.0.0.0/8 is left out.
        let probe: Ipv4Addr = "1.2.3.4".parse().unwrap();
        assert!(split_default_routes().iter().any(|n| n.contains(&IpAddr::from(probe))));
        let zero: Ipv4Addr = "0.1.2.3".parse().unwrap();
        assert!(!split_default_routes().iter().any(|n| n.contains(&IpAddr::from(zero))));
    }

    #[test]
    fn test_rule_display() {
        let rule = PolicyRule::new(9003, Family::V4, RuleTable::Id(2022))
            .with_iif("lo")
            .inverted();
        assert_eq!(rule.to_string(), "9003: not from all iif lo lookup 2022");

        let rule = PolicyRule::new(9002, Family::V4, RuleTable::Main).with_dport(PortRange::single(53));
        assert_eq!(rule.to_string(), "9002: from all dport 53 lookup main");

        let rule = PolicyRule::new(9001, Family::V6, RuleTable::Main).with_suppress_prefix_len(0);
        assert_eq!(rule.to_string(), "9001: from all lookup main suppress_prefixlength 0");
    }

    #[test]
    fn test_rule_table_from_id() {
        assert_eq!(RuleTable::from(254), RuleTable::Main);
        assert_eq!(RuleTable::from(2022), RuleTable::Id(2022));
        assert_eq!(RuleTable::Main.id(), MAIN_TABLE);
    }
}
