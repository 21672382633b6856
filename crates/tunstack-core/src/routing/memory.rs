//! In-memory kernel routing, for tests and dry runs

use super::{Family, KernelRouting, PolicyRule, RouteEntry, RuleTable};
use crate::error::{Error, Result};
use ipnet::IpNet;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};

#[derive(Debug, Default)]
struct Tables {
    addresses: Vec<(String, IpNet)>,
    up: HashSet<String>,
    routes: Vec<RouteEntry>,
    rules: Vec<PolicyRule>,
    /// Operation name -> successful calls left before it starts failing
    failures: HashMap<&'static str, usize>,
}

impl Tables {
    fn check(&mut self, op: &'static str) -> Result<()> {
        match self.failures.get_mut(op) {
            Some(0) => Err(Error::kernel(op, "injected failure")),
            Some(left) => {
                *left -= 1;
                Ok(())
            }
            None => Ok(()),
        }
    }
}

/// [`KernelRouting`] over plain vectors. Mirrors the kernel's duplicate
/// and missing-entry errors.
#[derive(Debug, Default)]
pub struct MemoryRouting {
    tables: Mutex<Tables>,
}

impl MemoryRouting {
    /// Empty routing state
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed the rules every Linux host starts with
    pub fn with_default_rules(self) -> Self {
        for family in Family::ALL {
            self.tables.lock().rules.extend([
                PolicyRule::new(0, family, RuleTable::Id(255)),
                PolicyRule::new(32766, family, RuleTable::Main),
                PolicyRule::new(32767, family, RuleTable::Id(253)),
            ]);
        }
        self
    }

    /// Seed a route
    pub fn with_route(self, route: RouteEntry) -> Self {
        self.tables.lock().routes.push(route);
        self
    }

    /// Seed a rule
    pub fn with_rule(self, rule: PolicyRule) -> Self {
        self.tables.lock().rules.push(rule);
        self
    }

    /// Make `op` fail once it has succeeded `after` times
    pub fn fail_on(self, op: &'static str, after: usize) -> Self {
        self.tables.lock().failures.insert(op, after);
        self
    }

    /// Snapshot of all routes
    pub fn routes(&self) -> Vec<RouteEntry> {
        self.tables.lock().routes.clone()
    }

    /// Snapshot of all rules
    pub fn rules(&self) -> Vec<PolicyRule> {
        self.tables.lock().rules.clone()
    }

    /// Addresses assigned to `link`
    pub fn addresses(&self, link: &str) -> Vec<IpNet> {
        self.tables
            .lock()
            .addresses
            .iter()
            .filter(|(l, _)| l == link)
            .map(|(_, a)| *a)
            .collect()
    }

    /// Whether `link` is up
    pub fn is_up(&self, link: &str) -> bool {
        self.tables.lock().up.contains(link)
    }
}

impl KernelRouting for MemoryRouting {
    fn add_address(&self, link: &str, addr: &IpNet) -> Result<()> {
        let mut t = self.tables.lock();
        t.check("address add")?;
        if t.addresses.iter().any(|(l, a)| l == link && a == addr) {
            return Err(Error::kernel("address add", "File exists"));
        }
        t.addresses.push((link.to_string(), *addr));
        Ok(())
    }

    fn del_address(&self, link: &str, addr: &IpNet) -> Result<()> {
        let mut t = self.tables.lock();
        t.check("address del")?;
        let pos = t
            .addresses
            .iter()
            .position(|(l, a)| l == link && a == addr)
            .ok_or_else(|| Error::kernel("address del", "Cannot assign requested address"))?;
        t.addresses.remove(pos);
        Ok(())
    }

    fn set_link_up(&self, link: &str) -> Result<()> {
        let mut t = self.tables.lock();
        t.check("link up")?;
        t.up.insert(link.to_string());
        Ok(())
    }

    fn set_link_down(&self, link: &str) -> Result<()> {
        let mut t = self.tables.lock();
        t.check("link down")?;
        t.up.remove(link);
        Ok(())
    }

    fn list_routes(&self, family: Family) -> Result<Vec<RouteEntry>> {
        let t = self.tables.lock();
        Ok(t.routes.iter().filter(|r| r.family() == family).cloned().collect())
    }

    fn add_route(&self, route: &RouteEntry) -> Result<()> {
        let mut t = self.tables.lock();
        t.check("route add")?;
        if t.routes.contains(route) {
            return Err(Error::kernel("route add", "File exists"));
        }
        t.routes.push(route.clone());
        Ok(())
    }

    fn del_route(&self, route: &RouteEntry) -> Result<()> {
        let mut t = self.tables.lock();
        t.check("route del")?;
        let pos = t
            .routes
            .iter()
            .position(|r| r == route)
            .ok_or_else(|| Error::kernel("route del", "No such process"))?;
        t.routes.remove(pos);
        Ok(())
    }

    fn list_rules(&self, family: Family) -> Result<Vec<PolicyRule>> {
        let t = self.tables.lock();
        Ok(t.rules.iter().filter(|r| r.family == family).cloned().collect())
    }

    fn add_rule(&self, rule: &PolicyRule) -> Result<()> {
        let mut t = self.tables.lock();
        t.check("rule add")?;
        if t.rules.contains(rule) {
            return Err(Error::kernel("rule add", "File exists"));
        }
        t.rules.push(rule.clone());
        Ok(())
    }

    fn del_rule(&self, rule: &PolicyRule) -> Result<()> {
        let mut t = self.tables.lock();
        t.check("rule del")?;
        let pos = t
            .rules
            .iter()
            .position(|r| r == rule)
            .ok_or_else(|| Error::kernel("rule del", "No such file or directory"))?;
        t.rules.remove(pos);
        Ok(())
    }
}
