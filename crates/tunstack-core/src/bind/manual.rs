//! Manual source-address binding strategy
//!
//! Used where the OS has no interface-bound socket option: the socket is
//! bound to a local address owned by the interface, which makes the kernel
//! pick a route through it.

use super::{DialIntent, ListenIntent, Network, OutboundBinder};
use crate::error::{Error, Result};
use crate::iface::{is_global_unicast, Registry};
use crate::net::Family;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use tracing::{debug, trace};

/// Pins sockets by binding an interface-owned source address
pub struct ManualSourceBinder {
    registry: Arc<Registry>,
}

impl ManualSourceBinder {
    /// Strategy resolving addresses through `registry`
    pub fn new(registry: Arc<Registry>) -> Self {
        Self { registry }
    }

    fn lookup_local(
        &self,
        iface: &str,
        family: Family,
        dst: Option<IpAddr>,
        port: u16,
    ) -> Result<SocketAddr> {
        let interface = self.registry.lookup_by_name(iface)?;
        interface
            .pick_address(dst, family)
            .map(|ip| SocketAddr::new(ip, port))
            .ok_or_else(|| Error::AddressResolution {
                iface: iface.to_string(),
                family: family.as_str(),
            })
    }
}

impl OutboundBinder for ManualSourceBinder {
    fn bind_for_dial(
        &self,
        iface: &str,
        intent: &mut DialIntent,
        network: Network,
        dst: SocketAddr,
    ) -> Result<()> {
        if !is_global_unicast(dst.ip()) {
            trace!(%dst, "Not global unicast, leaving source address alone");
            return Ok(());
        }

        let port = intent.local_addr().map_or(0, |a| a.port());
        let family = network.family().unwrap_or_else(|| Family::of(dst.ip()));
        let local = self.lookup_local(iface, family, Some(dst.ip()), port)?;
        intent.set_local_addr(Some(local));
        debug!(iface, %local, %dst, "Dial pinned by source address");
        Ok(())
    }

    fn bind_for_listen(&self, iface: &str, intent: &mut ListenIntent) -> Result<SocketAddr> {
        let hint = intent.local_addr();
        let family = intent
            .network()
            .family()
            .or_else(|| hint.map(|a| Family::of(a.ip())))
            .unwrap_or(Family::V4);
        let port = hint.map_or(0, |a| a.port());
        let local = self.lookup_local(iface, family, None, port)?;
        intent.set_local_addr(Some(local));
        debug!(iface, %local, "Listen pinned by source address");
        Ok(local)
    }
}
