//! Integration tests for the routing plan and its kernel bookkeeping

use ipnet::IpNet;
use proptest::prelude::*;
use std::net::{Ipv4Addr, Ipv6Addr};
use tunstack_core::routing::{
    Family, MemoryRouting, PolicyRouting, RoutingState, RulePlan, RuleTable, TunRouting,
};
use tunstack_core::TunConfig;

fn prefixes(v4: usize, v6: usize) -> Vec<IpNet> {
    let mut nets = Vec::new();
    for i in 0..v4 {
        let octet = u8::try_from(i + 1).unwrap();
        nets.push(IpNet::new(Ipv4Addr::new(10, octet, 0, 1).into(), 24).unwrap());
    }
    for i in 0..v6 {
        let seg = u16::try_from(i + 1).unwrap();
        nets.push(IpNet::new(Ipv6Addr::new(0xfd00, seg, 0, 0, 0, 0, 0, 1).into(), 64).unwrap());
    }
    nets
}

#[test]
fn test_documented_end_priority() {
    let config = TunConfig::new("tun0", prefixes(2, 0));
    let plan = RulePlan::build(&config, 2022).unwrap();
    assert_eq!(plan.range(Family::V4), Some(9000..=9007));
    assert_eq!(RulePlan::rules_per_family(2), 8);
}

#[test]
fn test_teardown_leaves_range_empty() {
    let kernel = MemoryRouting::new().with_default_rules();
    let config = TunConfig::new("tun0", prefixes(2, 0));

    let mut state = RoutingState::setup(&kernel, &config).unwrap();
    let range = state.rule_range(Family::V4).unwrap();
    assert!(state.teardown(&kernel).is_empty());

    assert!(!kernel
        .rules()
        .iter()
        .any(|r| r.family == Family::V4 && range.contains(&r.priority)));
    assert_eq!(kernel.rules().len(), 6);
}

#[test]
fn test_dns_and_loopback_precedence() {
    let config = TunConfig::new("tun0", prefixes(1, 0));
    let plan = RulePlan::build(&config, 2022).unwrap();
    let rules = plan.rules();

    let dns = rules.iter().position(|r| r.dport.is_some()).unwrap();
    let not_lo = rules.iter().position(|r| r.invert).unwrap();
    let reinclude = rules.iter().position(|r| r.src.is_some()).unwrap();
    assert!(dns < not_lo && not_lo < reinclude);
    assert_eq!(rules[dns].table, RuleTable::Main);
    assert_eq!(rules[reinclude].table, RuleTable::Id(2022));
}

#[test]
fn test_unbound_local_traffic_reaches_isolated_table() {
    let config = TunConfig::new("tun0", prefixes(1, 1));
    let plan = RulePlan::build(&config, 2022).unwrap();

    for family in [Family::V4, Family::V6] {
        let unspecified = IpNet::from(family.unspecified());
        let rule = plan
            .rules()
            .iter()
            .find(|r| r.family == family && r.src == Some(unspecified))
            .unwrap();
        assert_eq!(rule.iif.as_deref(), Some("lo"));
        assert!(!rule.invert);
        assert_eq!(rule.table, RuleTable::Id(2022));

        let suppress = plan
            .rules()
            .iter()
            .find(|r| r.family == family && r.suppress_prefix_len.is_some())
            .unwrap();
        assert!(suppress.priority < rule.priority);
    }
}

proptest! {
    #[test]
    fn prop_rule_block_is_contiguous(v4 in 0usize..5, v6 in 0usize..5, base in 1u32..30000) {
        prop_assume!(v4 + v6 > 0);
        let mut config = TunConfig::new("tun0", prefixes(v4, v6));
        config.rule_priority = Some(base);
        let plan = RulePlan::build(&config, 4000).unwrap();

        for (family, count) in [(Family::V4, v4), (Family::V6, v6)] {
            let priorities: Vec<u32> = plan
                .rules()
                .iter()
                .filter(|r| r.family == family)
                .map(|r| r.priority)
                .collect();
            let expected = RulePlan::rules_per_family(count);
            prop_assert_eq!(priorities.len(), expected as usize);
            if count > 0 {
                let want: Vec<u32> = (base..base + expected).collect();
                prop_assert_eq!(&priorities, &want);
                prop_assert_eq!(plan.range(family), Some(base..=base + expected - 1));
            } else {
                prop_assert_eq!(plan.range(family), None);
            }
        }
    }

    #[test]
    fn prop_teardown_restores_kernel(v4 in 0usize..4, v6 in 0usize..4, base in 1u32..20000) {
        prop_assume!(v4 + v6 > 0);
        let kernel = MemoryRouting::new().with_default_rules();
        let before = kernel.rules();

        let mut config = TunConfig::new("tun0", prefixes(v4, v6));
        config.rule_priority = Some(base);

        let mut routing = PolicyRouting::new(kernel);
        routing.setup(&config).unwrap();
        prop_assert!(routing.teardown().is_empty());

        prop_assert_eq!(routing.kernel().rules(), before);
        prop_assert!(routing.kernel().routes().is_empty());
        prop_assert!(routing.kernel().addresses("tun0").is_empty());
    }
}
