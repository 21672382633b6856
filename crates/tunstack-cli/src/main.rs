//! tunstack CLI
//!
//! Command-line interface for transparent TUN interception.

mod args;
mod commands;
mod logging;

use anyhow::Result;
use clap::Parser;
use std::io::IsTerminal;
use tracing::error;

use args::Args;
use commands::Command;

fn main() -> Result<()> {
    let args = Args::parse();

    // The file's log level only matters when it loads; errors surface later.
    let configured_level = commands::config::load(args.config.as_deref())
        .ok()
        .map(|c| c.logging.level);
    let _log_guard = logging::init(&args, configured_level.as_deref())?;

    if matches!(args.command, Command::Run(_)) && !args.quiet && std::io::stdout().is_terminal() {
        print_banner();
    }

    let result = run(args);

    if let Err(ref e) = result {
        error!("Fatal error: {:#}", e);
    }

    result
}

fn run(args: Args) -> Result<()> {
    let config_path = args.config.as_deref();
    match args.command {
        Command::Run(run_args) => commands::run::execute(run_args, config_path),
        Command::Iface(iface_args) => commands::iface::execute(iface_args),
        Command::Config(config_args) => commands::config::execute(config_args, config_path),
        Command::Completions(comp_args) => commands::completions::execute(comp_args),
    }
}

fn print_banner() {
    use colored::Colorize;

    println!();
    println!(
        "{} {}",
        "tunstack".green().bold(),
        env!("CARGO_PKG_VERSION").white()
    );
    println!("{}", "transparent TUN interception".cyan());
    println!();
}
