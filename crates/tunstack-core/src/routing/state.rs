//! Reversible policy routing setup

use super::plan::{allocate_table, RulePlan};
use super::{Family, KernelRouting, RouteEntry, TunRouting};
use crate::config::TunConfig;
use crate::error::{Error, Result};
use ipnet::IpNet;
use rand::Rng;
use std::ops::RangeInclusive;
use tracing::{debug, error, info, instrument, warn};

/// Everything one setup installed, and nothing else
#[derive(Debug, Default)]
pub struct RoutingState {
    link: String,
    table: u32,
    addresses: Vec<IpNet>,
    link_up: bool,
    routes: Vec<RouteEntry>,
    rule_ranges: Vec<(Family, RangeInclusive<u32>)>,
}

impl RoutingState {
    /// Configure the device and the policy rules.
    ///
    /// On failure every step already applied is undone before the error is
    /// returned.
    #[instrument(skip_all, fields(device = %config.name))]
    pub fn setup(kernel: &dyn KernelRouting, config: &TunConfig) -> Result<Self> {
        Self::setup_with_rng(kernel, config, &mut rand::thread_rng())
    }

    /// [`RoutingState::setup`] with a caller-supplied table probe source
    pub fn setup_with_rng<R: Rng + ?Sized>(
        kernel: &dyn KernelRouting,
        config: &TunConfig,
        rng: &mut R,
    ) -> Result<Self> {
        config.validate()?;

        let table = allocate_table(kernel, config.table_index, rng)?;
        let plan = RulePlan::build(config, table)?;
        let mut state = Self {
            link: config.name.clone(),
            table,
            ..Default::default()
        };

        if let Err(e) = state.apply(kernel, config, &plan) {
            error!(error = %e, "Routing setup failed, unwinding");
            state.teardown(kernel);
            return Err(e);
        }

        info!(
            table,
            rules = plan.rules().len(),
            addresses = state.addresses.len(),
            "Policy routing configured"
        );
        Ok(state)
    }

    fn apply(&mut self, kernel: &dyn KernelRouting, config: &TunConfig, plan: &RulePlan) -> Result<()> {
        let ranges = plan.ranges();
        for (family, range) in &ranges {
            if let Some(rule) = kernel
                .list_rules(*family)?
                .into_iter()
                .find(|r| range.contains(&r.priority))
            {
                return Err(Error::kernel(
                    "rule add",
                    format!("priority {} is already taken by '{rule}'", rule.priority),
                ));
            }
        }

        for addr in &config.addresses {
            kernel.add_address(&self.link, addr)?;
            self.addresses.push(*addr);
            debug!(%addr, "Address assigned");
        }

        kernel.set_link_up(&self.link)?;
        self.link_up = true;

        for (family, _) in &ranges {
            let route = RouteEntry::new(self.table, family.default_route(), self.link.clone());
            kernel.add_route(&route)?;
            debug!(%route, "Default route installed");
            self.routes.push(route);
        }

        // Recorded up front so a partial install is still removed.
        self.rule_ranges = ranges;
        for rule in plan.rules() {
            kernel.add_rule(rule)?;
            debug!(%rule, "Policy rule installed");
        }

        Ok(())
    }

    /// Undo the setup in reverse order. Every step runs; failures are
    /// logged and returned.
    #[instrument(skip_all, fields(device = %self.link, table = self.table))]
    pub fn teardown(&mut self, kernel: &dyn KernelRouting) -> Vec<Error> {
        let mut errors = Vec::new();

        for route in std::mem::take(&mut self.routes).iter().rev() {
            record(kernel.del_route(route), "route delete", &mut errors);
        }

        for addr in std::mem::take(&mut self.addresses).iter().rev() {
            record(kernel.del_address(&self.link, addr), "address delete", &mut errors);
        }

        if std::mem::take(&mut self.link_up) {
            record(kernel.set_link_down(&self.link), "link down", &mut errors);
        }

        for (family, range) in std::mem::take(&mut self.rule_ranges) {
            let rules = match kernel.list_rules(family) {
                Ok(rules) => rules,
                Err(e) => {
                    record(Err(e), "rule list", &mut errors);
                    continue;
                }
            };
            for rule in rules
                .iter()
                .filter(|r| r.family == family && range.contains(&r.priority))
            {
                record(kernel.del_rule(rule), "rule delete", &mut errors);
            }
        }

        if errors.is_empty() {
            info!("Policy routing removed");
        } else {
            warn!(failures = errors.len(), "Policy routing removed with errors");
        }
        errors
    }

    /// Device name
    pub fn link(&self) -> &str {
        &self.link
    }

    /// Isolated table id
    pub fn table(&self) -> u32 {
        self.table
    }

    /// Addresses this setup assigned
    pub fn addresses(&self) -> &[IpNet] {
        &self.addresses
    }

    /// Rule priority range installed for `family`
    pub fn rule_range(&self, family: Family) -> Option<RangeInclusive<u32>> {
        self.rule_ranges
            .iter()
            .find(|(f, _)| *f == family)
            .map(|(_, r)| r.clone())
    }
}

fn record(result: Result<()>, step: &'static str, errors: &mut Vec<Error>) {
    if let Err(e) = result {
        warn!(step, error = %e, "Teardown step failed");
        errors.push(e);
    }
}

/// [`TunRouting`] for hosts with policy routing
pub struct PolicyRouting<K> {
    kernel: K,
    state: Option<RoutingState>,
}

impl<K: KernelRouting> PolicyRouting<K> {
    /// Wrap a kernel routing backend
    pub fn new(kernel: K) -> Self {
        Self { kernel, state: None }
    }

    /// Backend
    pub fn kernel(&self) -> &K {
        &self.kernel
    }

    /// Current state, while configured
    pub fn state(&self) -> Option<&RoutingState> {
        self.state.as_ref()
    }
}

impl<K: KernelRouting> TunRouting for PolicyRouting<K> {
    fn setup(&mut self, config: &TunConfig) -> Result<()> {
        if self.state.is_some() {
            return Err(Error::Lifecycle("Routing is already configured".to_string()));
        }
        self.state = Some(RoutingState::setup(&self.kernel, config)?);
        Ok(())
    }

    fn teardown(&mut self) -> Vec<Error> {
        match self.state.take() {
            Some(mut state) => state.teardown(&self.kernel),
            None => Vec::new(),
        }
    }
}
