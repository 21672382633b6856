//! External command execution and command-based link configuration
//!
//! Platforms without policy routing get the device configured through their
//! native tools (`ifconfig`/`route` on macOS and the BSDs, `netsh` on
//! Windows). Traffic is captured with split default routes rather than an
//! isolated table.

use crate::error::{PlatformError, Result};
use ipnet::IpNet;
use std::process::Command;
use tracing::{debug, info, instrument, trace, warn};
use tunstack_core::routing::{split_default_routes, TunRouting};
use tunstack_core::{Error, TunConfig};

/// Runs external programs and returns their standard output
pub trait CommandRunner: Send + Sync {
    /// Run `program` with `args`; a non-zero exit is an error
    fn run(&self, program: &str, args: &[String]) -> Result<String>;
}

/// Runs commands on the host
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemRunner;

impl CommandRunner for SystemRunner {
    fn run(&self, program: &str, args: &[String]) -> Result<String> {
        run(program, args)
    }
}

/// Run `program` and capture its standard output
pub(crate) fn run<S: AsRef<str>>(program: &str, args: &[S]) -> Result<String> {
    let args: Vec<&str> = args.iter().map(AsRef::as_ref).collect();
    let command = format!("{program} {}", args.join(" "));
    trace!(%command, "Running");

    let output = Command::new(program).args(&args).output()?;
    if !output.status.success() {
        return Err(PlatformError::CommandFailed {
            command,
            status: output.status.to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        });
    }
    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}

/// Native tool family used to configure the link
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkFlavor {
    /// `ifconfig` and `route` (macOS, FreeBSD, OpenBSD, NetBSD)
    Bsd,
    /// `netsh`
    Windows,
}

impl LinkFlavor {
    /// Flavor of the running OS
    pub fn host() -> Self {
        if cfg!(windows) {
            Self::Windows
        } else {
            Self::Bsd
        }
    }
}

/// IPv6 halves routed through the device alongside the IPv4 split routes
const SPLIT_ROUTES_V6: [&str; 2] = ["::/1", "8000::/1"];

/// One configuration command and the command reverting it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinkStep {
    /// Program to run
    pub program: &'static str,
    /// Arguments applying the change
    pub apply: Vec<String>,
    /// Arguments reverting it, if anything needs reverting
    pub undo: Option<Vec<String>>,
}

impl LinkStep {
    fn new(program: &'static str, apply: Vec<String>, undo: Option<Vec<String>>) -> Self {
        Self {
            program,
            apply,
            undo,
        }
    }
}

fn args(parts: &[&str]) -> Vec<String> {
    parts.iter().map(|s| (*s).to_string()).collect()
}

fn split_routes(config: &TunConfig) -> Vec<IpNet> {
    let mut routes = Vec::new();
    if config.ipv4_addresses().next().is_some() {
        routes.extend(config.ipv4_addresses().map(IpNet::trunc));
        routes.extend(split_default_routes());
    }
    if config.ipv6_addresses().next().is_some() {
        routes.extend(SPLIT_ROUTES_V6.iter().filter_map(|r| r.parse::<IpNet>().ok()));
    }
    routes
}

/// Commands configuring the device described by `config`, in apply order
pub fn link_plan(config: &TunConfig, flavor: LinkFlavor) -> Vec<LinkStep> {
    match flavor {
        LinkFlavor::Bsd => bsd_plan(config),
        LinkFlavor::Windows => windows_plan(config),
    }
}

fn bsd_plan(config: &TunConfig) -> Vec<LinkStep> {
    let name = config.name.as_str();
    let mtu = config.effective_mtu().to_string();
    let mut steps = vec![LinkStep::new(
        "ifconfig",
        args(&[name, "mtu", &mtu, "up"]),
        Some(args(&[name, "down"])),
    )];

    for addr in &config.addresses {
        let ip = addr.addr().to_string();
        let step = match addr {
            IpNet::V4(net) => LinkStep::new(
                "ifconfig",
                args(&[name, "inet", &ip, &ip, "netmask", &net.netmask().to_string(), "alias"]),
                Some(args(&[name, "inet", &ip, "-alias"])),
            ),
            IpNet::V6(net) => LinkStep::new(
                "ifconfig",
                args(&[name, "inet6", &ip, "prefixlen", &net.prefix_len().to_string(), "alias"]),
                Some(args(&[name, "inet6", &ip, "-alias"])),
            ),
        };
        steps.push(step);
    }

    for route in split_routes(config) {
        let family = match route {
            IpNet::V4(_) => "-inet",
            IpNet::V6(_) => "-inet6",
        };
        let prefix = route.to_string();
        steps.push(LinkStep::new(
            "route",
            args(&["-n", "add", family, "-net", &prefix, "-interface", name]),
            Some(args(&["-n", "delete", family, "-net", &prefix, "-interface", name])),
        ));
    }
    steps
}

fn windows_plan(config: &TunConfig) -> Vec<LinkStep> {
    let name = format!("name={}", config.name);
    let interface = format!("interface={}", config.name);
    let mtu = format!("mtu={}", config.effective_mtu());
    let mut steps = vec![LinkStep::new(
        "netsh",
        args(&["interface", "ipv4", "set", "subinterface", &config.name, &mtu, "store=active"]),
        None,
    )];

    for addr in &config.addresses {
        let ip = format!("address={}", addr.addr());
        let step = match addr {
            IpNet::V4(net) => LinkStep::new(
                "netsh",
                args(&[
                    "interface",
                    "ipv4",
                    "add",
                    "address",
                    &name,
                    &ip,
                    &format!("mask={}", net.netmask()),
                    "store=active",
                ]),
                Some(args(&["interface", "ipv4", "delete", "address", &name, &ip])),
            ),
            IpNet::V6(_) => LinkStep::new(
                "netsh",
                args(&[
                    "interface",
                    "ipv6",
                    "add",
                    "address",
                    &interface,
                    &format!("address={addr}"),
                    "store=active",
                ]),
                Some(args(&["interface", "ipv6", "delete", "address", &interface, &ip])),
            ),
        };
        steps.push(step);
    }

    for route in split_routes(config) {
        let family = match route {
            IpNet::V4(_) => "ipv4",
            IpNet::V6(_) => "ipv6",
        };
        let prefix = format!("prefix={route}");
        steps.push(LinkStep::new(
            "netsh",
            args(&["interface", family, "add", "route", &prefix, &interface, "store=active"]),
            Some(args(&["interface", family, "delete", "route", &prefix, &interface, "store=active"])),
        ));
    }
    steps
}

/// Whether a failed apply only reports state that is already in place
fn already_applied(err: &PlatformError) -> bool {
    match err {
        PlatformError::CommandFailed { stderr, .. } => {
            let stderr = stderr.to_ascii_lowercase();
            stderr.contains("already exists") || stderr.contains("file exists")
        }
        _ => false,
    }
}

/// Command-driven [`TunRouting`] for hosts without policy routing
pub struct CommandLink<R: CommandRunner = SystemRunner> {
    runner: R,
    flavor: LinkFlavor,
    applied: Vec<LinkStep>,
    configured: bool,
}

impl CommandLink {
    /// Link configuration for the running OS
    pub fn new() -> Self {
        Self::with_runner(SystemRunner, LinkFlavor::host())
    }
}

impl Default for CommandLink {
    fn default() -> Self {
        Self::new()
    }
}

impl<R: CommandRunner> CommandLink<R> {
    /// Link configuration running commands through `runner`
    pub fn with_runner(runner: R, flavor: LinkFlavor) -> Self {
        Self {
            runner,
            flavor,
            applied: Vec::new(),
            configured: false,
        }
    }

    /// Steps applied by this instance. Steps whose state already existed
    /// on the host are not recorded and are never undone.
    pub fn applied(&self) -> &[LinkStep] {
        &self.applied
    }
}

impl<R: CommandRunner> TunRouting for CommandLink<R> {
    #[instrument(skip_all, fields(device = %config.name))]
    fn setup(&mut self, config: &TunConfig) -> tunstack_core::Result<()> {
        if self.configured {
            return Err(Error::Lifecycle("Link is already configured".to_string()));
        }
        config.validate()?;

        for step in link_plan(config, self.flavor) {
            match self.runner.run(step.program, &step.apply) {
                Ok(_) => self.applied.push(step),
                Err(e) if already_applied(&e) => {
                    debug!(program = step.program, args = ?step.apply, "Already present, left to the host");
                }
                Err(e) => {
                    warn!(error = %e, "Link configuration failed, reverting");
                    let _ = self.teardown();
                    return Err(e.into());
                }
            }
        }

        self.configured = true;
        info!(steps = self.applied.len(), "Link configured");
        Ok(())
    }

    fn teardown(&mut self) -> Vec<Error> {
        self.configured = false;
        let mut failures = Vec::new();
        while let Some(step) = self.applied.pop() {
            let Some(undo) = step.undo else {
                continue;
            };
            if let Err(e) = self.runner.run(step.program, &undo) {
                warn!(program = step.program, args = ?undo, error = %e, "Undo step failed");
                failures.push(e.into());
            }
        }
        failures
    }
}
