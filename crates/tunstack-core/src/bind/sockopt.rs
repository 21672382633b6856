//! Socket-option binding strategy

use super::{DialIntent, HookContext, ListenIntent, Network, OutboundBinder};
use crate::error::{Error, Result};
use crate::iface::{is_global_unicast, Interface, Registry};
use crate::net::Family;
use socket2::Socket;
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::{debug, trace};

/// Sets the OS option that pins `socket` to `iface` for `family`
pub type BindFn = fn(&Socket, &Interface, Family) -> std::io::Result<()>;

/// Pins sockets with an interface-bound socket option set by a hook
pub struct SocketOptionBinder {
    registry: Arc<Registry>,
    bind_fn: BindFn,
}

impl SocketOptionBinder {
    /// Strategy resolving interfaces through `registry` and pinning sockets
    /// with `bind_fn`
    pub fn new(registry: Arc<Registry>, bind_fn: BindFn) -> Self {
        Self { registry, bind_fn }
    }

    fn hook(
        &self,
        iface: &str,
    ) -> Result<impl Fn(&HookContext, &Socket) -> Result<()> + Send + Sync + 'static> {
        let iface = self.registry.lookup_by_name(iface)?.clone();
        let bind_fn = self.bind_fn;

        Ok(move |ctx: &HookContext, socket: &Socket| {
            if let Some(remote) = ctx.remote {
                if !is_global_unicast(remote.ip()) {
                    trace!(%remote, iface = %iface.name, "Not global unicast, leaving socket unbound");
                    return Ok(());
                }
            }
            bind_fn(socket, &iface, ctx.family())
                .map_err(|e| Error::bind(iface.name.clone(), e.to_string()))
        })
    }
}

impl OutboundBinder for SocketOptionBinder {
    fn bind_for_dial(
        &self,
        iface: &str,
        intent: &mut DialIntent,
        network: Network,
        dst: SocketAddr,
    ) -> Result<()> {
        intent.add_hook(self.hook(iface)?);
        debug!(iface, %network, %dst, "Dial pinned by socket option");
        Ok(())
    }

    fn bind_for_listen(&self, iface: &str, intent: &mut ListenIntent) -> Result<SocketAddr> {
        intent.add_hook(self.hook(iface)?);

        let local = intent.local_addr().unwrap_or_else(|| {
            let family = intent.network().family().unwrap_or(Family::V4);
            SocketAddr::new(family.unspecified(), 0)
        });
        intent.set_local_addr(Some(local));
        debug!(iface, %local, "Listen pinned by socket option");
        Ok(local)
    }
}
