//! Config command - configuration management

use anyhow::{Context, Result};
use clap::{Args, Subcommand};
use std::path::{Path, PathBuf};
use tracing::{debug, info};
use tunstack_core::Config;

/// Config command arguments
#[derive(Args, Debug)]
pub struct ConfigArgs {
    #[command(subcommand)]
    pub action: ConfigAction,
}

/// Config subcommands
#[derive(Subcommand, Debug)]
pub enum ConfigAction {
    /// Show the effective configuration
    Show,

    /// Write a configuration file with the defaults
    Generate {
        /// Output file path
        #[arg(short, long, default_value = "tunstack.toml")]
        output: PathBuf,

        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },

    /// Validate a configuration file
    Validate {
        /// Config file to validate
        file: PathBuf,
    },

    /// Show config file locations
    Paths,
}

/// Execute config command
pub fn execute(args: ConfigArgs, config_path: Option<&Path>) -> Result<()> {
    match args.action {
        ConfigAction::Show => show_config(config_path),
        ConfigAction::Generate { output, force } => generate_config(&output, force),
        ConfigAction::Validate { file } => validate_config(&file),
        ConfigAction::Paths => {
            show_paths();
            Ok(())
        }
    }
}

/// Load the configuration from `explicit`, else from the first file found in
/// the search paths, else the defaults
pub fn load(explicit: Option<&Path>) -> Result<Config> {
    let path = match explicit {
        Some(path) => Some(path.to_path_buf()),
        None => find_config_file(),
    };

    match path {
        Some(path) => {
            debug!(path = %path.display(), "Loading configuration");
            Config::load(&path)
                .with_context(|| format!("Failed to load config from {}", path.display()))
        }
        None => Ok(Config::default()),
    }
}

fn show_config(config_path: Option<&Path>) -> Result<()> {
    let config = load(config_path)?;
    let toml_str = config.to_toml().context("Failed to serialize config")?;
    println!("{toml_str}");
    Ok(())
}

fn generate_config(output: &Path, force: bool) -> Result<()> {
    if output.exists() && !force {
        anyhow::bail!("{} already exists (use --force to overwrite)", output.display());
    }

    let toml_str = Config::default()
        .to_toml()
        .context("Failed to serialize config")?;
    let content = format!(
        "# tunstack configuration\n\
         # Unset [outbound] interface means the default route interface.\n\n\
         {toml_str}"
    );

    std::fs::write(output, content)
        .with_context(|| format!("Failed to write config to {}", output.display()))?;

    info!(path = %output.display(), "Generated config file");
    println!("Configuration file generated: {}", output.display());
    Ok(())
}

fn validate_config(file: &Path) -> Result<()> {
    let config = Config::load(file)
        .with_context(|| format!("Failed to load config from {}", file.display()))?;
    config.validate().context("Configuration validation failed")?;

    println!("✓ Configuration is valid");
    println!("  Device: {} (MTU {})", config.tun.name, config.tun.effective_mtu());
    for addr in &config.tun.addresses {
        println!("  Address: {addr}");
    }
    println!(
        "  Outbound: {}",
        config.outbound.interface.as_deref().unwrap_or("<default route>")
    );
    Ok(())
}

fn search_paths() -> Vec<PathBuf> {
    let mut paths = vec![PathBuf::from("tunstack.toml")];
    if let Some(dirs) = directories::ProjectDirs::from("", "", "tunstack") {
        paths.push(dirs.config_dir().join("tunstack.toml"));
    }
    #[cfg(unix)]
    paths.push(PathBuf::from("/etc/tunstack/tunstack.toml"));
    paths
}

fn show_paths() {
    println!("Configuration file search paths:");
    println!();
    for (i, path) in search_paths().iter().enumerate() {
        println!("  {}. {}", i + 1, path.display());
    }
}

fn find_config_file() -> Option<PathBuf> {
    search_paths().into_iter().find(|p| p.exists())
}
