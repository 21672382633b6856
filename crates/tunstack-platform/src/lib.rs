//! tunstack platform layer
//!
//! OS-specific pieces plugged into `tunstack-core`.
//!
//! ## Supported Platforms
//!
//! - **Linux**: policy routing through iproute2, `SO_BINDTODEVICE`
//! - **macOS**: `ifconfig`/`route` with split default routes, `IP_BOUND_IF`
//! - **Windows**: `netsh` with split default routes, `IP_UNICAST_IF`
//! - **Other BSDs**: `ifconfig`/`route`, source-address binding

#![warn(missing_docs)]
#![warn(clippy::all)]

mod error;
pub use error::{PlatformError, Result};

pub mod command;
pub mod device;
pub mod ipstack_backend;
pub mod linux;
pub mod route;
pub mod sockopt;

pub use command::CommandLink;
pub use device::{open_device, TunDevice};
pub use ipstack_backend::IpStackBackend;
pub use linux::IpRoute2;
pub use route::current_default_interface;
pub use sockopt::{bind_socket_to_interface, binder};

use tunstack_core::netstack::Backend;
use tunstack_core::routing::TunRouting;
use tunstack_core::stack::{UserspaceStack, VirtualDevice};
use tunstack_core::TunConfig;

/// Routing configuration for this OS
#[cfg(target_os = "linux")]
pub fn routing_for(_config: &TunConfig) -> Box<dyn TunRouting> {
    Box::new(tunstack_core::routing::PolicyRouting::new(IpRoute2::new()))
}

/// Routing configuration for this OS
#[cfg(not(target_os = "linux"))]
pub fn routing_for(_config: &TunConfig) -> Box<dyn TunRouting> {
    Box::new(CommandLink::new())
}

/// [`Backend`] wiring the host's TUN device, routing and ipstack together
#[derive(Debug, Default, Clone, Copy)]
pub struct HostBackend;

impl Backend for HostBackend {
    fn open_device(&self, config: &TunConfig) -> tunstack_core::Result<Box<dyn VirtualDevice>> {
        Ok(Box::new(open_device(config)?))
    }

    fn routing(&self, config: &TunConfig) -> tunstack_core::Result<Box<dyn TunRouting>> {
        Ok(routing_for(config))
    }

    fn stack(&self, config: &TunConfig) -> tunstack_core::Result<Box<dyn UserspaceStack>> {
        Ok(Box::new(IpStackBackend::new(config.effective_mtu())))
    }
}
