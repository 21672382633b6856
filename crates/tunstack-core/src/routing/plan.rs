//! Table allocation and the policy rule block

use super::{Family, KernelRouting, PolicyRule, PortRange, RuleTable};
use crate::config::TunConfig;
use crate::error::{Error, Result};
use ipnet::IpNet;
use rand::Rng;
use std::collections::HashSet;
use std::ops::RangeInclusive;
use tracing::debug;

/// First table id proposed when the config names none
pub const DEFAULT_TABLE_INDEX: u32 = 2022;

/// Where random probes land; clear of the reserved 253..=255
const TABLE_PROBE_RANGE: RangeInclusive<u32> = 1000..=65535;

const MAX_TABLE_PROBES: usize = 256;

/// Priority of the kernel's `lookup main` rule
const MAIN_RULE_PRIORITY: u32 = 32766;

const DNS_PORT: u16 = 53;

const LOOPBACK_IF: &str = "lo";

/// Pick a routing table id no existing route lives in.
///
/// `preferred` is tried first, then random candidates. The probe and the
/// later claim are not atomic with respect to other processes.
pub fn allocate_table<R: Rng + ?Sized>(
    kernel: &dyn KernelRouting,
    preferred: Option<u32>,
    rng: &mut R,
) -> Result<u32> {
    let mut occupied = HashSet::new();
    for family in Family::ALL {
        occupied.extend(kernel.list_routes(family)?.into_iter().map(|r| r.table));
    }

    let mut candidate = preferred.unwrap_or(DEFAULT_TABLE_INDEX);
    for _ in 0..MAX_TABLE_PROBES {
        if !occupied.contains(&candidate) {
            debug!(table = candidate, "Allocated routing table");
            return Ok(candidate);
        }
        debug!(table = candidate, "Routing table occupied");
        candidate = rng.gen_range(TABLE_PROBE_RANGE);
    }

    Err(Error::kernel(
        "table allocation",
        format!("no free routing table after {MAX_TABLE_PROBES} probes"),
    ))
}

/// Policy rules for one device, in ascending priority order.
///
/// For each family with `n` assigned prefixes the block holds `2n + 4`
/// rules on consecutive priorities starting at the base:
///
/// | offset | rule |
/// |---|---|
/// | `0..n` | `to <prefix> lookup <table>` |
/// | `n` | `lookup main suppress_prefixlength 0` |
/// | `n+1` | `dport 53 lookup main` |
/// | `n+2` | `not iif lo lookup <table>` |
/// | `n+3` | `iif lo from <unspecified>/<max> lookup <table>` |
/// | `n+4..2n+4` | `iif lo from <device address> lookup <table>` |
///
/// The suppress rule lets any non-default route of the main table win
/// before the isolated table's default route is consulted. Locally
/// generated traffic (`iif lo`) reaches the isolated table while it has no
/// source yet, or when it is sourced from one of the device's addresses.
/// Sockets already bound to another local address stay on the main table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RulePlan {
    rules: Vec<PolicyRule>,
}

impl RulePlan {
    /// Number of rules installed for a family with `prefixes` addresses
    pub fn rules_per_family(prefixes: usize) -> u32 {
        if prefixes == 0 {
            0
        } else {
            // Prefix counts are bounded by the config, far below u32::MAX.
            2 * u32::try_from(prefixes).unwrap_or(u32::MAX / 4) + 4
        }
    }

    /// Build the rule block for `config` pointing at `table`.
    ///
    /// The catch-all consults `main` with `suppress_prefixlength 0` rather
    /// than the isolated table; only main's default route is skipped, and
    /// later rules send the rest to the isolated table.
    pub fn build(config: &TunConfig, table: u32) -> Result<Self> {
        let base = config.rule_priority_base();
        let isolated = RuleTable::Id(table);
        let mut rules = Vec::new();

        for family in Family::ALL {
            let prefixes: Vec<&IpNet> = config
                .addresses
                .iter()
                .filter(|net| Family::of_net(net) == family)
                .collect();
            if prefixes.is_empty() {
                continue;
            }

            let count = Self::rules_per_family(prefixes.len());
            if base.saturating_add(count) > MAIN_RULE_PRIORITY {
                return Err(Error::config_value(
                    "tun.rule_priority",
                    format!("{count} rules from {base} would reach the main table rule"),
                ));
            }

            let mut priority = base;
            let mut next = || {
                let p = priority;
                priority += 1;
                p
            };

            for net in &prefixes {
                rules.push(PolicyRule::new(next(), family, isolated).with_dst(net.trunc()));
            }
            rules.push(PolicyRule::new(next(), family, RuleTable::Main).with_suppress_prefix_len(0));
            rules.push(
                PolicyRule::new(next(), family, RuleTable::Main)
                    .with_dport(PortRange::single(DNS_PORT)),
            );
            rules.push(
                PolicyRule::new(next(), family, isolated)
                    .with_iif(LOOPBACK_IF)
                    .inverted(),
            );
            rules.push(
                PolicyRule::new(next(), family, isolated)
                    .with_iif(LOOPBACK_IF)
                    .with_src(IpNet::from(family.unspecified())),
            );
            for net in &prefixes {
                rules.push(
                    PolicyRule::new(next(), family, isolated)
                        .with_iif(LOOPBACK_IF)
                        .with_src(IpNet::from(net.addr())),
                );
            }
        }

        Ok(Self { rules })
    }

    /// All rules, IPv4 block first
    pub fn rules(&self) -> &[PolicyRule] {
        &self.rules
    }

    /// Priority range occupied in `family`, if any rule is planned for it
    pub fn range(&self, family: Family) -> Option<RangeInclusive<u32>> {
        let mut priorities = self
            .rules
            .iter()
            .filter(|r| r.family == family)
            .map(|r| r.priority);
        let first = priorities.next()?;
        let last = priorities.last().unwrap_or(first);
        Some(first..=last)
    }

    /// Ranges of every family with rules
    pub fn ranges(&self) -> Vec<(Family, RangeInclusive<u32>)> {
        Family::ALL
            .iter()
            .filter_map(|&family| self.range(family).map(|r| (family, r)))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::routing::{MemoryRouting, RouteEntry};
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn config(addrs: &[&str]) -> TunConfig {
        TunConfig::new("tun0", addrs.iter().map(|a| a.parse().unwrap()).collect())
    }

    #[test]
    fn test_plan_two_ipv4_prefixes() {
        let plan = RulePlan::build(&config(&["198.18.0.1/16", "10.10.0.1/24"]), 2022).unwrap();
        let rendered: Vec<String> = plan.rules().iter().map(ToString::to_string).collect();

        assert_eq!(
            rendered,
            [
                "9000: from all to 198.18.0.0/16 lookup 2022",
                "9001: from all to 10.10.0.0/24 lookup 2022",
                "9002: from all lookup main suppress_prefixlength 0",
                "9003: from all dport 53 lookup main",
                "9004: not from all iif lo lookup 2022",
                "9005: from 0.0.0.0/32 iif lo lookup 2022",
                "9006: from 198.18.0.1/32 iif lo lookup 2022",
                "9007: from 10.10.0.1/32 iif lo lookup 2022",
            ]
        );
        assert_eq!(plan.range(Family::V4), Some(9000..=9007));
        assert_eq!(plan.range(Family::V6), None);
    }

    #[test]
    fn test_plan_dual_stack_ranges() {
        let mut cfg = config(&["198.18.0.1/16", "fd00:18::1/64"]);
        cfg.rule_priority = Some(100);
        let plan = RulePlan::build(&cfg, 3000).unwrap();

        assert_eq!(plan.range(Family::V4), Some(100..=105));
        assert_eq!(plan.range(Family::V6), Some(100..=105));
        assert_eq!(plan.rules().len(), 12);
        assert!(plan.rules()[..6].iter().all(|r| r.family == Family::V4));
        assert_eq!(
            plan.rules()[9].to_string(),
            "103: from ::/128 iif lo lookup 3000"
        );
    }

    #[test]
    fn test_plan_rejects_priority_overflow() {
        let mut cfg = config(&["198.18.0.1/16"]);
        cfg.rule_priority = Some(32764);
        assert!(RulePlan::build(&cfg, 3000).is_err());
    }

    #[test]
    fn test_allocate_preferred_when_free() {
        let kernel = MemoryRouting::new();
        let mut rng = StdRng::seed_from_u64(7);
        assert_eq!(allocate_table(&kernel, Some(4242), &mut rng).unwrap(), 4242);
        assert_eq!(allocate_table(&kernel, None, &mut rng).unwrap(), DEFAULT_TABLE_INDEX);
    }

    #[test]
    fn test_allocate_skips_occupied_table() {
        let kernel = MemoryRouting::new()
            .with_route(RouteEntry::new(
                DEFAULT_TABLE_INDEX,
                "0.0.0.0/0".parse().unwrap(),
                "wg0",
            ))
            .with_route(RouteEntry::new(5000, "::/0".parse().unwrap(), "wg0"));
        let mut rng = StdRng::seed_from_u64(7);

        let table = allocate_table(&kernel, None, &mut rng).unwrap();
        assert_ne!(table, DEFAULT_TABLE_INDEX);
        assert_ne!(table, 5000);
        assert!(TABLE_PROBE_RANGE.contains(&table));
        assert!(kernel.routes().iter().all(|r| r.table != table));
    }
}
