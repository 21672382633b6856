//! CLI commands

pub mod completions;
pub mod config;
pub mod iface;
pub mod relay;
pub mod run;

use clap::Subcommand;

/// CLI commands
#[derive(Subcommand, Debug)]
pub enum Command {
    /// Start interception (main command)
    Run(run::RunArgs),

    /// Show host interfaces and the default route interface
    Iface(iface::IfaceArgs),

    /// Configuration management
    Config(config::ConfigArgs),

    /// Generate shell completions
    Completions(completions::CompletionsArgs),
}
