//! Kernel routing through iproute2
//!
//! Every [`KernelRouting`] call is one `ip` invocation; listings use the JSON
//! output (`ip -j`).

use crate::command::{CommandRunner, SystemRunner};
use crate::error::{PlatformError, Result};
use ipnet::IpNet;
use serde::Deserialize;
use serde_json::{Map, Value};
use std::net::IpAddr;
use tracing::trace;
use tunstack_core::routing::{
    Family, KernelRouting, PolicyRule, PortRange, RouteEntry, RuleTable, MAIN_TABLE,
};
use tunstack_core::Error;

const LOCAL_TABLE: u32 = 255;
const DEFAULT_TABLE: u32 = 253;

/// [`KernelRouting`] backed by the `ip` command
#[derive(Debug, Default)]
pub struct IpRoute2<R: CommandRunner = SystemRunner> {
    runner: R,
}

impl IpRoute2 {
    /// Routing through the host's `ip` binary
    pub fn new() -> Self {
        Self::with_runner(SystemRunner)
    }
}

impl<R: CommandRunner> IpRoute2<R> {
    /// Routing through `runner`
    pub fn with_runner(runner: R) -> Self {
        Self { runner }
    }

    fn ip(&self, op: &'static str, args: Vec<String>) -> tunstack_core::Result<String> {
        trace!(op, args = ?args, "ip");
        self.runner
            .run("ip", &args)
            .map_err(|e| Error::kernel(op, e))
    }

    /// Listing that tolerates a family or table the kernel does not have
    fn list(&self, op: &'static str, args: Vec<String>) -> tunstack_core::Result<String> {
        match self.runner.run("ip", &args) {
            Ok(out) => Ok(out),
            Err(PlatformError::CommandFailed { ref stderr, .. })
                if stderr.contains("does not exist") || stderr.contains("not supported") =>
            {
                Ok(String::new())
            }
            Err(e) => Err(Error::kernel(op, e)),
        }
    }
}

fn family_flag(family: Family) -> String {
    match family {
        Family::V4 => "-4".to_string(),
        Family::V6 => "-6".to_string(),
    }
}

fn strings(parts: &[&str]) -> Vec<String> {
    parts.iter().map(|s| (*s).to_string()).collect()
}

fn route_args(verb: &str, route: &RouteEntry) -> Vec<String> {
    let mut args = vec![family_flag(route.family()), "route".into(), verb.into()];
    args.push(route.destination.to_string());
    if let Some(ref link) = route.link {
        args.extend(["dev".to_string(), link.clone()]);
    }
    args.extend(["table".to_string(), route.table.to_string()]);
    args
}

/// `ip rule` arguments selecting exactly `rule`
pub fn rule_args(verb: &str, rule: &PolicyRule) -> Vec<String> {
    let mut args = vec![family_flag(rule.family), "rule".into(), verb.into()];
    args.extend(["priority".to_string(), rule.priority.to_string()]);
    if rule.invert {
        args.push("not".into());
    }
    args.push("from".into());
    args.push(rule.src.map_or_else(|| "all".to_string(), |src| src.to_string()));
    if let Some(dst) = rule.dst {
        args.extend(["to".to_string(), dst.to_string()]);
    }
    if let Some(ref iif) = rule.iif {
        args.extend(["iif".to_string(), iif.clone()]);
    }
    if let Some(dport) = rule.dport {
        args.extend(["dport".to_string(), dport.to_string()]);
    }
    args.extend(["lookup".to_string(), rule.table.to_string()]);
    if let Some(len) = rule.suppress_prefix_len {
        args.extend(["suppress_prefixlength".to_string(), len.to_string()]);
    }
    args
}

impl<R: CommandRunner> KernelRouting for IpRoute2<R> {
    fn add_address(&self, link: &str, addr: &IpNet) -> tunstack_core::Result<()> {
        let args = strings(&["addr", "add", &addr.to_string(), "dev", link]);
        self.ip("address add", args).map(drop)
    }

    fn del_address(&self, link: &str, addr: &IpNet) -> tunstack_core::Result<()> {
        let args = strings(&["addr", "del", &addr.to_string(), "dev", link]);
        self.ip("address del", args).map(drop)
    }

    fn set_link_up(&self, link: &str) -> tunstack_core::Result<()> {
        self.ip("link up", strings(&["link", "set", "dev", link, "up"]))
            .map(drop)
    }

    fn set_link_down(&self, link: &str) -> tunstack_core::Result<()> {
        self.ip("link down", strings(&["link", "set", "dev", link, "down"]))
            .map(drop)
    }

    fn list_routes(&self, family: Family) -> tunstack_core::Result<Vec<RouteEntry>> {
        let flag = family_flag(family);
        let out = self.list(
            "route list",
            strings(&["-j", &flag, "route", "show", "table", "all"]),
        )?;
        parse_routes(&out, family).map_err(|e| Error::kernel("route list", e))
    }

    fn add_route(&self, route: &RouteEntry) -> tunstack_core::Result<()> {
        self.ip("route add", route_args("add", route)).map(drop)
    }

    fn del_route(&self, route: &RouteEntry) -> tunstack_core::Result<()> {
        self.ip("route del", route_args("del", route)).map(drop)
    }

    fn list_rules(&self, family: Family) -> tunstack_core::Result<Vec<PolicyRule>> {
        let flag = family_flag(family);
        let out = self.list("rule list", strings(&["-j", &flag, "rule", "show"]))?;
        parse_rules(&out, family).map_err(|e| Error::kernel("rule list", e))
    }

    fn add_rule(&self, rule: &PolicyRule) -> tunstack_core::Result<()> {
        self.ip("rule add", rule_args("add", rule)).map(drop)
    }

    fn del_rule(&self, rule: &PolicyRule) -> tunstack_core::Result<()> {
        self.ip("rule del", rule_args("del", rule)).map(drop)
    }
}

#[derive(Debug, Deserialize)]
struct RouteJson {
    dst: String,
    dev: Option<String>,
    table: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RuleJson {
    priority: u32,
    src: Option<String>,
    srclen: Option<u8>,
    dst: Option<String>,
    dstlen: Option<u8>,
    iif: Option<String>,
    dport: Option<u16>,
    dport_start: Option<u16>,
    dport_end: Option<u16>,
    suppress_prefixlength: Option<u8>,
    table: Option<String>,
}

fn table_id(name: Option<&str>) -> Result<u32> {
    match name {
        None | Some("main") => Ok(MAIN_TABLE),
        Some("local") => Ok(LOCAL_TABLE),
        Some("default") => Ok(DEFAULT_TABLE),
        Some(id) => id
            .parse()
            .map_err(|_| PlatformError::parse(format!("unknown table '{id}'"))),
    }
}

/// `addr` with an optional prefix length; a missing length means a host prefix
fn prefix(addr: &str, len: Option<u8>) -> Result<IpNet> {
    let ip: IpAddr = addr
        .parse()
        .map_err(|_| PlatformError::parse(format!("bad address '{addr}'")))?;
    match len {
        Some(len) => IpNet::new(ip, len).map_err(PlatformError::parse),
        None => Ok(IpNet::from(ip)),
    }
}

fn empty_or<T>(json: &str, parse: impl FnOnce(&str) -> Result<Vec<T>>) -> Result<Vec<T>> {
    if json.trim().is_empty() {
        Ok(Vec::new())
    } else {
        parse(json)
    }
}

/// Routes from `ip -j route show table all` output
pub fn parse_routes(json: &str, family: Family) -> Result<Vec<RouteEntry>> {
    empty_or(json, |json| {
        let raw: Vec<RouteJson> = serde_json::from_str(json)?;
        raw.into_iter()
            .map(|r| -> Result<RouteEntry> {
                let destination = match r.dst.as_str() {
                    "default" => family.default_route(),
                    dst => match dst.split_once('/') {
                        Some((addr, len)) => {
                            let len = len
                                .parse()
                                .map_err(|_| PlatformError::parse(format!("bad prefix '{dst}'")))?;
                            prefix(addr, Some(len))?
                        }
                        None => prefix(dst, None)?,
                    },
                };
                Ok(RouteEntry {
                    table: table_id(r.table.as_deref())?,
                    destination,
                    link: r.dev,
                })
            })
            .collect()
    })
}

/// Rules from `ip -j rule show` output.
///
/// Rules without a lookup table (`goto`, `nop`, blackhole actions) are skipped.
pub fn parse_rules(json: &str, family: Family) -> Result<Vec<PolicyRule>> {
    empty_or(json, |json| {
        let raw: Vec<Map<String, Value>> = serde_json::from_str(json)?;
        let mut rules = Vec::with_capacity(raw.len());

        for object in raw {
            let invert = object.contains_key("not");
            let r: RuleJson = serde_json::from_value(Value::Object(object))?;
            let Some(ref table) = r.table else {
                trace!(priority = r.priority, "Skipping rule without lookup table");
                continue;
            };

            let mut rule = PolicyRule::new(
                r.priority,
                family,
                RuleTable::from(table_id(Some(table))?),
            );
            if let Some(ref src) = r.src.filter(|s| s != "all") {
                rule = rule.with_src(prefix(src, r.srclen)?);
            }
            if let Some(ref dst) = r.dst.filter(|d| d != "all") {
                rule = rule.with_dst(prefix(dst, r.dstlen)?);
            }
            if let Some(iif) = r.iif {
                rule = rule.with_iif(iif);
            }
            if invert {
                rule = rule.inverted();
            }
            match (r.dport, r.dport_start, r.dport_end) {
                (Some(port), _, _) => rule = rule.with_dport(PortRange::single(port)),
                (None, Some(start), Some(end)) => {
                    rule = rule.with_dport(PortRange { start, end });
                }
                _ => {}
            }
            if let Some(len) = r.suppress_prefixlength {
                rule = rule.with_suppress_prefix_len(len);
            }
            rules.push(rule);
        }
        Ok(rules)
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use tunstack_core::routing::{RoutingState, RulePlan};
    use tunstack_core::TunConfig;

    const ROUTES: &str = r#"[
        {"type":"unicast","dst":"default","gateway":"10.0.0.1","dev":"eth0","protocol":"dhcp","metric":100,"flags":[]},
        {"type":"unicast","dst":"10.0.0.0/24","dev":"eth0","protocol":"kernel","scope":"link","prefsrc":"10.0.0.5","flags":[]},
        {"type":"unicast","dst":"default","dev":"tun0","table":"2022","flags":[]},
        {"type":"local","dst":"10.0.0.5","table":"local","dev":"eth0","protocol":"kernel","scope":"host","prefsrc":"10.0.0.5","flags":[]}
    ]"#;

    const RULES: &str = r#"[
        {"priority":0,"src":"all","table":"local"},
        {"priority":9000,"src":"all","dst":"198.18.0.0","dstlen":16,"table":"2022"},
        {"priority":9001,"src":"all","table":"main","suppress_prefixlength":0},
        {"priority":9002,"src":"all","dport":53,"table":"main"},
        {"priority":9003,"not":null,"src":"all","iif":"lo","table":"2022"},
        {"priority":9004,"src":"0.0.0.0","iif":"lo","table":"2022"},
        {"priority":9005,"src":"198.18.0.1","iif":"lo","table":"2022"},
        {"priority":9100,"src":"all","dport_start":1000,"dport_end":2000,"table":"main"},
        {"priority":9200,"src":"all","goto":9300},
        {"priority":32766,"src":"all","table":"main"},
        {"priority":32767,"src":"all","table":"default"}
    ]"#;

    #[test]
    fn test_parse_routes() {
        let routes = parse_routes(ROUTES, Family::V4).unwrap();
        assert_eq!(routes.len(), 4);
        assert_eq!(routes[0].table, MAIN_TABLE);
        assert_eq!(routes[0].destination.to_string(), "0.0.0.0/0");
        assert_eq!(routes[2].table, 2022);
        assert_eq!(routes[2].link.as_deref(), Some("tun0"));
        assert_eq!(routes[3].destination.to_string(), "10.0.0.5/32");
        assert_eq!(routes[3].table, LOCAL_TABLE);
    }

    #[test]
    fn test_parse_rules_matches_plan() {
        let rules = parse_rules(RULES, Family::V4).unwrap();
        assert_eq!(rules.len(), 10);

        let config = TunConfig::new("tun0", vec!["198.18.0.1/16".parse().unwrap()]);
        let plan = RulePlan::build(&config, 2022).unwrap();
        for planned in plan.rules() {
            assert!(
                rules.contains(planned),
                "planned rule '{planned}' missing from parsed output"
            );
        }

        let ranged = rules.iter().find(|r| r.priority == 9100).unwrap();
        assert_eq!(ranged.dport, Some(PortRange { start: 1000, end: 2000 }));
        assert_eq!(rules.last().unwrap().table, RuleTable::Id(DEFAULT_TABLE));
    }

    #[test]
    fn test_rule_args() {
        let rule = PolicyRule::new(9003, Family::V4, RuleTable::Id(2022))
            .with_iif("lo")
            .inverted();
        assert_eq!(
            rule_args("add", &rule).join(" "),
            "-4 rule add priority 9003 not from all iif lo lookup 2022"
        );

        let rule = PolicyRule::new(9001, Family::V6, RuleTable::Main).with_suppress_prefix_len(0);
        assert_eq!(
            rule_args("del", &rule).join(" "),
            "-6 rule del priority 9001 from all lookup main suppress_prefixlength 0"
        );
    }

    #[test]
    fn test_parse_empty_output() {
        assert!(parse_rules("", Family::V6).unwrap().is_empty());
        assert!(parse_routes("[]", Family::V6).unwrap().is_empty());
        assert!(matches!(
            parse_routes("{", Family::V4),
            Err(PlatformError::Json(_))
        ));
    }

    /// Answers listings from canned JSON and records every other call
    #[derive(Default)]
    struct FakeIp {
        calls: Mutex<Vec<String>>,
        missing_v6: bool,
    }

    impl CommandRunner for FakeIp {
        fn run(&self, program: &str, args: &[String]) -> Result<String> {
            let line = args.join(" ");
            assert_eq!(program, "ip");
            if line.starts_with("-j -6") && self.missing_v6 {
                return Err(PlatformError::CommandFailed {
                    command: format!("ip {line}"),
                    status: "exit status: 2".into(),
                    stderr: "RTNETLINK answers: Address family not supported by protocol".into(),
                });
            }
            let out = match line.as_str() {
                "-j -4 route show table all" => ROUTES,
                "-j -4 rule show" => RULES,
                "-j -6 route show table all" | "-j -6 rule show" => "[]",
                _ => {
                    self.calls.lock().push(line);
                    ""
                }
            };
            Ok(out.to_string())
        }
    }

    #[test]
    fn test_missing_family_lists_empty() {
        let ip = IpRoute2::with_runner(FakeIp {
            missing_v6: true,
            ..Default::default()
        });
        assert!(ip.list_rules(Family::V6).unwrap().is_empty());
        assert_eq!(ip.list_routes(Family::V4).unwrap().len(), 4);
    }

    #[test]
    fn test_setup_commands() {
        let ip = IpRoute2::with_runner(FakeIp::default());
        let mut config = TunConfig::new("tun1", vec!["198.19.0.1/16".parse().unwrap()]);
        config.table_index = Some(3000);
        config.rule_priority = Some(12000);

        let mut state = RoutingState::setup(&ip, &config).unwrap();
        assert_eq!(state.table(), 3000);
        let calls = ip.runner.calls.lock().clone();
        assert_eq!(calls[0], "addr add 198.19.0.1/16 dev tun1");
        assert_eq!(calls[1], "link set dev tun1 up");
        assert_eq!(calls[2], "-4 route add 0.0.0.0/0 dev tun1 table 3000");
        assert_eq!(calls[3], "-4 rule add priority 12000 from all to 198.19.0.0/16 lookup 3000");
        assert_eq!(calls[7], "-4 rule add priority 12004 from 0.0.0.0/32 iif lo lookup 3000");
        assert_eq!(calls.len(), 3 + 6);

        ip.runner.calls.lock().clear();
        assert!(state.teardown(&ip).is_empty());
        let calls = ip.runner.calls.lock().clone();
        assert_eq!(calls[0], "-4 route del 0.0.0.0/0 dev tun1 table 3000");
        assert_eq!(calls[1], "addr del 198.19.0.1/16 dev tun1");
        assert_eq!(calls[2], "link set dev tun1 down");
    }
}
