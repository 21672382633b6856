//! Configuration management for tunstack
//!
//! Provides a strongly-typed configuration system with TOML support.
//! The `[tun]` table maps onto [`TunConfig`], the rest tunes the
//! dispatcher, the outbound interface and logging.

mod tun;

pub use tun::{TunConfig, DEFAULT_MTU, DEFAULT_RULE_PRIORITY};

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Default capacity of each dispatcher intake queue
pub const DEFAULT_QUEUE_CAPACITY: usize = 128;

/// Main configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Virtual device settings
    pub tun: TunConfig,

    /// Connection dispatcher settings
    pub dispatch: DispatchConfig,

    /// Upstream (anti-loop) interface settings
    pub outbound: OutboundConfig,

    /// Logging configuration
    pub logging: LoggingConfig,
}

impl Config {
    /// Load configuration from a TOML file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|_| Error::ConfigNotFound {
            path: path.display().to_string(),
        })?;
        Self::from_toml(&content)
    }

    /// Parse configuration from TOML string
    pub fn from_toml(content: &str) -> Result<Self> {
        toml::from_str(content).map_err(Error::from)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        self.tun.validate()?;

        if self.dispatch.queue_capacity == 0 {
            return Err(Error::config_value(
                "dispatch.queue_capacity",
                "Must be greater than zero",
            ));
        }

        if let Some(ref iface) = self.outbound.interface {
            if iface.is_empty() {
                return Err(Error::config_value("outbound.interface", "Must not be empty"));
            }
            if *iface == self.tun.name {
                return Err(Error::config_value(
                    "outbound.interface",
                    "Must not be the tun device itself",
                ));
            }
        }

        Ok(())
    }

    /// Serialize to TOML string
    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).map_err(|e| Error::Config(e.to_string()))
    }
}

/// Connection dispatcher settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DispatchConfig {
    /// Capacity of each intake queue (TCP and UDP)
    pub queue_capacity: usize,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
        }
    }
}

/// Upstream interface settings
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct OutboundConfig {
    /// Physical interface for upstream dials (default route interface when unset)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub interface: Option<String>,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Default level directive
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}
