//! Iface command - interface registry listing

use anyhow::{Context, Result};
use clap::Args;
use colored::Colorize;
use tracing::warn;
use tunstack_core::iface::{self, Interface};

/// Iface command arguments
#[derive(Args, Debug)]
pub struct IfaceArgs {
    /// Only list interfaces with an IPv4 address
    #[arg(long)]
    pub ipv4: bool,
}

/// Execute iface command
pub fn execute(args: IfaceArgs) -> Result<()> {
    let registry = iface::try_registry().context("Failed to enumerate interfaces")?;

    let default = match tunstack_platform::current_default_interface() {
        Ok(name) => Some(name),
        Err(e) => {
            warn!(error = %e, "Could not determine the default route interface");
            None
        }
    };

    let capable = registry.ipv4_capable();
    for interface in registry.iter() {
        if args.ipv4 && !capable.contains(&interface.name.as_str()) {
            continue;
        }
        let is_default = default.as_deref() == Some(interface.name.as_str());
        println!("{}", describe(interface, is_default));
    }

    match default {
        Some(name) => println!("\nDefault route: {}", name.green().bold()),
        None => println!("\nDefault route: {}", "unknown".yellow()),
    }
    Ok(())
}

fn describe(interface: &Interface, is_default: bool) -> String {
    let marker = if is_default { "*" } else { " " };
    let mut line = format!(
        "{marker} {:>3}  {:<16}",
        interface.index,
        interface.name.bold()
    );
    if let Some(mac) = interface.hardware_addr {
        line.push_str(&format!(" {mac}"));
    }
    for addr in &interface.addresses {
        line.push_str(&format!("\n        {addr}"));
    }
    line
}
