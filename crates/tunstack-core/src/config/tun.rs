//! Virtual device configuration

use crate::error::{Error, Result};
use ipnet::IpNet;
use serde::{Deserialize, Serialize};
use std::net::Ipv4Addr;

/// MTU used when the caller leaves it at zero
pub const DEFAULT_MTU: u32 = 1350;

/// First policy rule priority when none is configured
pub const DEFAULT_RULE_PRIORITY: u32 = 9000;

/// Priority of the kernel's own `lookup main` rule; ours must stay below it
const MAIN_RULE_PRIORITY: u32 = 32766;

/// Longest interface name the kernel accepts (IFNAMSIZ - 1)
const MAX_NAME_LEN: usize = 15;

/// Routing table ids the kernel reserves (unspec, default, main, local)
const RESERVED_TABLES: [u32; 4] = [0, 253, 254, 255];

/// Virtual device settings supplied by the caller
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TunConfig {
    /// Device name
    pub name: String,
    /// Address prefixes assigned to the device
    pub addresses: Vec<IpNet>,
    /// Device MTU (0 = [`DEFAULT_MTU`])
    pub mtu: u32,
    /// Preferred isolated routing table id (random when absent or occupied)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub table_index: Option<u32>,
    /// First policy rule priority
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rule_priority: Option<u32>,
}

impl Default for TunConfig {
    fn default() -> Self {
        Self {
            name: default_name().to_string(),
            addresses: IpNet::new(Ipv4Addr::new(198, 18, 0, 1).into(), 16)
                .into_iter()
                .collect(),
            mtu: DEFAULT_MTU,
            table_index: None,
            rule_priority: None,
        }
    }
}

#[cfg(target_os = "macos")]
fn default_name() -> &'static str {
    "utun9"
}

#[cfg(not(target_os = "macos"))]
fn default_name() -> &'static str {
    "tunstack0"
}

impl TunConfig {
    /// Create a config for `name` with the given prefixes
    pub fn new(name: impl Into<String>, addresses: Vec<IpNet>) -> Self {
        Self {
            name: name.into(),
            addresses,
            ..Default::default()
        }
    }

    /// MTU to apply to the device
    pub fn effective_mtu(&self) -> u32 {
        if self.mtu == 0 {
            DEFAULT_MTU
        } else {
            self.mtu
        }
    }

    /// First policy rule priority
    pub fn rule_priority_base(&self) -> u32 {
        self.rule_priority.unwrap_or(DEFAULT_RULE_PRIORITY)
    }

    /// IPv4 prefixes, in configured order
    pub fn ipv4_addresses(&self) -> impl Iterator<Item = &IpNet> {
        self.addresses.iter().filter(|a| matches!(a, IpNet::V4(_)))
    }

    /// IPv6 prefixes, in configured order
    pub fn ipv6_addresses(&self) -> impl Iterator<Item = &IpNet> {
        self.addresses.iter().filter(|a| matches!(a, IpNet::V6(_)))
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if self.name.is_empty() {
            return Err(Error::config_value("tun.name", "Must not be empty"));
        }
        if self.name.len() > MAX_NAME_LEN {
            return Err(Error::config_value(
                "tun.name",
                format!("'{}' is longer than {MAX_NAME_LEN} bytes", self.name),
            ));
        }
        if self
            .name
            .chars()
            .any(|c| c.is_whitespace() || c == '/' || c == ':')
        {
            return Err(Error::config_value(
                "tun.name",
                format!("'{}' contains invalid characters", self.name),
            ));
        }

        if self.addresses.is_empty() {
            return Err(Error::config_value(
                "tun.addresses",
                "At least one address prefix is required",
            ));
        }

        let mtu = self.effective_mtu();
        if !(576..=65535).contains(&mtu) {
            return Err(Error::config_value("tun.mtu", "Must be between 576 and 65535"));
        }
        if mtu < 1280 && self.ipv6_addresses().next().is_some() {
            return Err(Error::config_value(
                "tun.mtu",
                "IPv6 addresses need an MTU of at least 1280",
            ));
        }

        if let Some(table) = self.table_index {
            if RESERVED_TABLES.contains(&table) {
                return Err(Error::config_value(
                    "tun.table_index",
                    format!("Table {table} is reserved by the kernel"),
                ));
            }
        }

        if let Some(priority) = self.rule_priority {
            if priority == 0 || priority >= MAIN_RULE_PRIORITY {
                return Err(Error::config_value(
                    "tun.rule_priority",
                    format!("Must be between 1 and {}", MAIN_RULE_PRIORITY - 1),
                ));
            }
        }

        Ok(())
    }
}
