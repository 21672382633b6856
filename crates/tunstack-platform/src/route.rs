//! Default-route resolution
//!
//! Each OS exposes its routing table differently:
//!
//! - **Linux**: `/proc/net/route`
//! - **macOS / BSD**: `route -n get default`
//! - **Windows**: `route print 0.0.0.0`, mapped back to an interface through
//!   the registry

use crate::error::{PlatformError, Result};
use bitflags::bitflags;
use std::net::IpAddr;
use tunstack_core::Error;

bitflags! {
    /// Route flags as reported in `/proc/net/route`
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct RouteFlags: u32 {
        /// Route is usable
        const UP = 0x0001;
        /// Destination is reached through a gateway
        const GATEWAY = 0x0002;
        /// Host route
        const HOST = 0x0004;
        /// Rejecting route
        const REJECT = 0x0200;
    }
}

/// Name of the interface carrying the host's default route
#[cfg(any(target_os = "linux", target_os = "android"))]
pub fn current_default_interface() -> Result<String> {
    default_interface_from("/proc/net/route")
}

/// Name of the interface carrying the host's default route
#[cfg(any(
    target_os = "macos",
    target_os = "ios",
    target_os = "freebsd",
    target_os = "openbsd",
    target_os = "netbsd"
))]
pub fn current_default_interface() -> Result<String> {
    let output = crate::command::run("route", &["-n", "get", "default"])?;
    parse_route_get(&output)
}

/// Name of the interface carrying the host's default route
#[cfg(windows)]
pub fn current_default_interface() -> Result<String> {
    let output = crate::command::run("route", &["print", "0.0.0.0"])?;
    let addr = parse_route_print(&output)?;
    let registry = tunstack_core::iface::try_registry()?;
    let iface = registry.lookup_by_address(addr)?;
    Ok(iface.name.clone())
}

/// Name of the interface carrying the host's default route
#[cfg(not(any(
    target_os = "linux",
    target_os = "android",
    target_os = "macos",
    target_os = "ios",
    target_os = "freebsd",
    target_os = "openbsd",
    target_os = "netbsd",
    windows
)))]
pub fn current_default_interface() -> Result<String> {
    Err(PlatformError::Unsupported(
        "default route lookup".to_string(),
    ))
}

/// Read a `/proc/net/route` formatted file
pub fn default_interface_from(path: impl AsRef<std::path::Path>) -> Result<String> {
    let table = std::fs::read_to_string(path)?;
    parse_proc_net_route(&table)
}

/// Pick the default route out of `/proc/net/route` content.
///
/// Only routes flagged up and via a gateway with a zero destination and mask
/// count. The lowest metric wins; a tie between two interfaces is ambiguous.
pub fn parse_proc_net_route(table: &str) -> Result<String> {
    let mut best: Option<(u32, &str)> = None;
    let mut tied = false;

    for line in table.lines().skip(1) {
        let fields: Vec<&str> = line.split_whitespace().collect();
        if fields.len() < 8 {
            continue;
        }
        let flags = RouteFlags::from_bits_truncate(parse_hex(fields[3])?);
        let destination = parse_hex(fields[1])?;
        let mask = parse_hex(fields[7])?;
        let metric: u32 = fields[6]
            .parse()
            .map_err(|_| PlatformError::parse(format!("bad metric '{}'", fields[6])))?;

        if !flags.contains(RouteFlags::UP | RouteFlags::GATEWAY) || destination != 0 || mask != 0
        {
            continue;
        }

        match best {
            Some((m, _)) if metric > m => {}
            Some((m, name)) if metric == m => tied |= name != fields[0],
            _ => {
                best = Some((metric, fields[0]));
                tied = false;
            }
        }
    }

    match best {
        None => Err(Error::AmbiguousRoute("no default route".to_string()).into()),
        Some((metric, _)) if tied => Err(Error::AmbiguousRoute(format!(
            "several interfaces share metric {metric}"
        ))
        .into()),
        Some((_, name)) => Ok(name.to_string()),
    }
}

fn parse_hex(field: &str) -> Result<u32> {
    u32::from_str_radix(field, 16)
        .map_err(|_| PlatformError::parse(format!("bad hex field '{field}'")))
}

/// Interface name from `route -n get default` output
pub fn parse_route_get(output: &str) -> Result<String> {
    output
        .lines()
        .filter_map(|line| line.trim().strip_prefix("interface:"))
        .map(str::trim)
        .find(|name| !name.is_empty())
        .map(str::to_string)
        .ok_or_else(|| Error::AmbiguousRoute("no interface in route output".to_string()).into())
}

/// Interface address of the lowest-metric default route in `route print`
/// output
pub fn parse_route_print(output: &str) -> Result<IpAddr> {
    let mut best: Option<(u32, IpAddr)> = None;

    for line in output.lines() {
        let fields: Vec<&str> = line.split_whitespace().collect();
        if fields.len() != 5 || fields[0] != "0.0.0.0" || fields[1] != "0.0.0.0" {
            continue;
        }
        let (Ok(addr), Ok(metric)) = (fields[3].parse::<IpAddr>(), fields[4].parse::<u32>())
        else {
            continue;
        };
        if best.map_or(true, |(m, _)| metric < m) {
            best = Some((metric, addr));
        }
    }

    best.map(|(_, addr)| addr)
        .ok_or_else(|| Error::AmbiguousRoute("no active default route".to_string()).into())
}
