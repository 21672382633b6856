//! Run command - main interception loop

use anyhow::{Context, Result};
use clap::Args;
use ipnet::IpNet;
use std::path::Path;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{info, warn};
use tunstack_core::bind::OutboundBinder;
use tunstack_core::iface;
use tunstack_core::routing::{RulePlan, DEFAULT_TABLE_INDEX};
use tunstack_core::{Config, TunNetstack};
use tunstack_platform::HostBackend;

use super::relay::Relay;

/// Run command arguments
#[derive(Args, Debug, Default)]
pub struct RunArgs {
    /// Virtual device name
    #[arg(long, value_name = "NAME")]
    pub name: Option<String>,

    /// Device address prefix (repeatable, e.g. 198.18.0.1/16)
    #[arg(long = "addr", value_name = "PREFIX")]
    pub addresses: Vec<IpNet>,

    /// Device MTU (0 = default)
    #[arg(long)]
    pub mtu: Option<u32>,

    /// Preferred routing table id
    #[arg(long, value_name = "ID")]
    pub table: Option<u32>,

    /// First policy rule priority
    #[arg(long, value_name = "PRIORITY")]
    pub priority: Option<u32>,

    /// Interface for relayed traffic (default: default route interface)
    #[arg(long, value_name = "IFACE")]
    pub outbound_interface: Option<String>,

    /// Capacity of each dispatcher queue
    #[arg(long, value_name = "N")]
    pub queue_capacity: Option<usize>,

    /// Validate the configuration and print the routing plan, then exit
    #[arg(long)]
    pub dry_run: bool,
}

impl RunArgs {
    /// Apply command-line overrides on top of the file configuration
    pub fn apply(&self, config: &mut Config) {
        if let Some(ref name) = self.name {
            config.tun.name = name.clone();
        }
        if !self.addresses.is_empty() {
            config.tun.addresses = self.addresses.clone();
        }
        if let Some(mtu) = self.mtu {
            config.tun.mtu = mtu;
        }
        if self.table.is_some() {
            config.tun.table_index = self.table;
        }
        if self.priority.is_some() {
            config.tun.rule_priority = self.priority;
        }
        if self.outbound_interface.is_some() {
            config.outbound.interface = self.outbound_interface.clone();
        }
        if let Some(capacity) = self.queue_capacity {
            config.dispatch.queue_capacity = capacity;
        }
    }
}

/// Execute the run command
pub fn execute(args: RunArgs, config_path: Option<&Path>) -> Result<()> {
    let mut config = super::config::load(config_path)?;
    args.apply(&mut config);
    config.validate().context("Invalid configuration")?;

    if args.dry_run {
        return print_plan(&config);
    }

    let registry = iface::try_registry().context("Failed to enumerate interfaces")?;
    let outbound = match config.outbound.interface.clone() {
        Some(name) => name,
        None => tunstack_platform::current_default_interface()
            .context("No outbound interface given and the default route is unknown")?,
    };
    registry
        .lookup_by_name(&outbound)
        .with_context(|| format!("Outbound interface {outbound} is not available"))?;
    info!(device = %config.tun.name, %outbound, "Starting tunstack");

    let binder: Arc<dyn OutboundBinder> = Arc::from(tunstack_platform::binder(registry));

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .thread_name("tunstack-worker")
        .build()
        .context("Failed to build async runtime")?;
    runtime.block_on(serve(config, binder, outbound))
}

async fn serve(config: Config, binder: Arc<dyn OutboundBinder>, outbound: String) -> Result<()> {
    let (stop_tx, mut stop_rx) = watch::channel(false);
    ctrlc::set_handler(move || {
        info!("Received interrupt signal, shutting down...");
        let _ = stop_tx.send(true);
    })
    .context("Failed to set signal handler")?;

    let mut netstack = TunNetstack::new(
        config.tun,
        config.dispatch.queue_capacity,
        Box::new(HostBackend),
    );
    netstack.register_conn_handler(Arc::new(Relay::new(binder, outbound)));
    netstack.start().context("Failed to start interception")?;
    info!("Interception running, press Ctrl+C to stop");

    if stop_rx.wait_for(|stop| *stop).await.is_err() {
        warn!("Signal handler went away, shutting down");
    }

    netstack.close().context("Failed to stop interception")?;
    info!("tunstack stopped");
    Ok(())
}

fn print_plan(config: &Config) -> Result<()> {
    let table = config.tun.table_index.unwrap_or(DEFAULT_TABLE_INDEX);
    let plan = RulePlan::build(&config.tun, table).context("Invalid routing plan")?;

    println!("Device {} (MTU {})", config.tun.name, config.tun.effective_mtu());
    for addr in &config.tun.addresses {
        println!("  address {addr}");
    }
    println!("Policy rules (table {table}, may move if occupied):");
    for rule in plan.rules() {
        println!("  {rule}");
    }
    println!(
        "Outbound: {}",
        config.outbound.interface.as_deref().unwrap_or("<default route>")
    );
    Ok(())
}
