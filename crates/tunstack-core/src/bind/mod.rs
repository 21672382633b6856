//! Outbound interface binding
//!
//! Upstream sockets opened by a connection handler must leave through the
//! physical interface, not through the tun device that intercepted the
//! connection. An [`OutboundBinder`] prepares a [`DialIntent`] or
//! [`ListenIntent`] so the socket it eventually creates is pinned to a
//! given interface.
//!
//! Two strategies share the contract:
//! - [`SocketOptionBinder`] attaches a pre-connect hook setting an
//!   interface-bound socket option
//! - [`ManualSourceBinder`] rewrites the intent's local address to one
//!   owned by the interface

mod manual;
mod sockopt;

pub use manual::ManualSourceBinder;
pub use sockopt::{BindFn, SocketOptionBinder};

use crate::error::{Error, Result};
use crate::net::Family;
use socket2::{Domain, Protocol, Socket, Type};
use std::fmt;
use std::net::SocketAddr;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpSocket, TcpStream, UdpSocket};
use tracing::trace;

/// Transport network of a dial or listen, optionally family-qualified
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Network {
    /// TCP, family from the address
    Tcp,
    /// TCP over IPv4
    Tcp4,
    /// TCP over IPv6
    Tcp6,
    /// UDP, family from the address
    Udp,
    /// UDP over IPv4
    Udp4,
    /// UDP over IPv6
    Udp6,
}

impl Network {
    /// Whether this is a TCP network
    pub fn is_tcp(self) -> bool {
        matches!(self, Network::Tcp | Network::Tcp4 | Network::Tcp6)
    }

    /// Family fixed by the network name, if any
    pub fn family(self) -> Option<Family> {
        match self {
            Network::Tcp4 | Network::Udp4 => Some(Family::V4),
            Network::Tcp6 | Network::Udp6 => Some(Family::V6),
            Network::Tcp | Network::Udp => None,
        }
    }

    fn as_str(self) -> &'static str {
        match self {
            Network::Tcp => "tcp",
            Network::Tcp4 => "tcp4",
            Network::Tcp6 => "tcp6",
            Network::Udp => "udp",
            Network::Udp4 => "udp4",
            Network::Udp6 => "udp6",
        }
    }
}

impl fmt::Display for Network {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Network {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "tcp" => Ok(Network::Tcp),
            "tcp4" => Ok(Network::Tcp4),
            "tcp6" => Ok(Network::Tcp6),
            "udp" => Ok(Network::Udp),
            "udp4" => Ok(Network::Udp4),
            "udp6" => Ok(Network::Udp6),
            other => Err(Error::Config(format!("Unknown network '{other}'"))),
        }
    }
}

/// What a hook sees of the socket about to be connected or bound
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HookContext {
    /// Network of the operation
    pub network: Network,
    /// Local address the socket will bind, if any
    pub local: Option<SocketAddr>,
    /// Remote address for dials; `None` for listens
    pub remote: Option<SocketAddr>,
}

impl HookContext {
    /// Family of the socket
    pub fn family(&self) -> Family {
        self.remote
            .or(self.local)
            .map(|a| Family::of(a.ip()))
            .or_else(|| self.network.family())
            .unwrap_or(Family::V4)
    }
}

/// Handle for removing a hook again
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HookId(u64);

/// Pre-connect socket hook
pub type Hook = Arc<dyn Fn(&HookContext, &Socket) -> Result<()> + Send + Sync>;

/// Ordered hook list; hooks run in attach order and the first error wins
#[derive(Clone, Default)]
struct HookChain {
    hooks: Vec<(HookId, Hook)>,
    next_id: u64,
}

impl HookChain {
    fn add(&mut self, hook: Hook) -> HookId {
        let id = HookId(self.next_id);
        self.next_id += 1;
        self.hooks.push((id, hook));
        id
    }

    fn remove(&mut self, id: HookId) -> bool {
        let before = self.hooks.len();
        self.hooks.retain(|(hid, _)| *hid != id);
        self.hooks.len() != before
    }

    fn run(&self, ctx: &HookContext, socket: &Socket) -> Result<()> {
        for (id, hook) in &self.hooks {
            trace!(hook = id.0, network = %ctx.network, "Running socket hook");
            hook(ctx, socket)?;
        }
        Ok(())
    }
}

impl fmt::Debug for HookChain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.hooks.iter().map(|(id, _)| id)).finish()
    }
}

fn new_socket(network: Network, family: Family) -> Result<Socket> {
    let domain = match family {
        Family::V4 => Domain::IPV4,
        Family::V6 => Domain::IPV6,
    };
    let socket = if network.is_tcp() {
        Socket::new(domain, Type::STREAM, Some(Protocol::TCP))?
    } else {
        Socket::new(domain, Type::DGRAM, Some(Protocol::UDP))?
    };
    socket.set_nonblocking(true)?;
    Ok(socket)
}

/// How an outbound connection should be made
#[derive(Debug, Clone, Default)]
pub struct DialIntent {
    local_addr: Option<SocketAddr>,
    timeout: Option<Duration>,
    hooks: HookChain,
}

impl DialIntent {
    /// Intent with no local address and no hooks
    pub fn new() -> Self {
        Self::default()
    }

    /// Abort connects that take longer than `timeout`
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Local address to bind before connecting
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    /// Set the local address
    pub fn set_local_addr(&mut self, addr: Option<SocketAddr>) {
        self.local_addr = addr;
    }

    /// Attach a hook after the ones already present
    pub fn add_hook<F>(&mut self, hook: F) -> HookId
    where
        F: Fn(&HookContext, &Socket) -> Result<()> + Send + Sync + 'static,
    {
        self.hooks.add(Arc::new(hook))
    }

    /// Detach one hook; the others stay
    pub fn remove_hook(&mut self, id: HookId) -> bool {
        self.hooks.remove(id)
    }

    /// Number of attached hooks
    pub fn hook_count(&self) -> usize {
        self.hooks.hooks.len()
    }

    /// Run the hooks against `socket`
    pub fn run_hooks(&self, ctx: &HookContext, socket: &Socket) -> Result<()> {
        self.hooks.run(ctx, socket)
    }

    fn prepare(&self, network: Network, dst: SocketAddr) -> Result<Socket> {
        let ctx = HookContext {
            network,
            local: self.local_addr,
            remote: Some(dst),
        };
        let socket = new_socket(network, Family::of(dst.ip()))?;
        self.run_hooks(&ctx, &socket)?;
        if let Some(local) = self.local_addr {
            socket.bind(&local.into())?;
        }
        Ok(socket)
    }

    /// Open a TCP connection to `dst`
    pub async fn connect_tcp(&self, dst: SocketAddr) -> Result<TcpStream> {
        let socket = self.prepare(Network::Tcp, dst)?;
        let socket = TcpSocket::from_std_stream(socket.into());
        let connect = socket.connect(dst);

        let stream = match self.timeout {
            Some(limit) => tokio::time::timeout(limit, connect).await.map_err(|_| {
                Error::Io(std::io::Error::new(
                    std::io::ErrorKind::TimedOut,
                    format!("connect to {dst} timed out"),
                ))
            })??,
            None => connect.await?,
        };
        Ok(stream)
    }

    /// Open a UDP socket connected to `dst`
    pub async fn connect_udp(&self, dst: SocketAddr) -> Result<UdpSocket> {
        let socket = self.prepare(Network::Udp, dst)?;
        let socket = UdpSocket::from_std(socket.into())?;
        socket.connect(dst).await?;
        Ok(socket)
    }
}

/// How a local socket should be bound
#[derive(Debug, Clone)]
pub struct ListenIntent {
    network: Network,
    local_addr: Option<SocketAddr>,
    hooks: HookChain,
}

impl ListenIntent {
    /// Intent for `network` with no local address and no hooks
    pub fn new(network: Network) -> Self {
        Self {
            network,
            local_addr: None,
            hooks: HookChain::default(),
        }
    }

    /// Network of the listen
    pub fn network(&self) -> Network {
        self.network
    }

    /// Local address to bind
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    /// Set the local address
    pub fn set_local_addr(&mut self, addr: Option<SocketAddr>) {
        self.local_addr = addr;
    }

    /// Attach a hook after the ones already present
    pub fn add_hook<F>(&mut self, hook: F) -> HookId
    where
        F: Fn(&HookContext, &Socket) -> Result<()> + Send + Sync + 'static,
    {
        self.hooks.add(Arc::new(hook))
    }

    /// Detach one hook; the others stay
    pub fn remove_hook(&mut self, id: HookId) -> bool {
        self.hooks.remove(id)
    }

    /// Number of attached hooks
    pub fn hook_count(&self) -> usize {
        self.hooks.hooks.len()
    }

    fn prepare(&self) -> Result<Socket> {
        let local = self.local_addr.unwrap_or_else(|| {
            SocketAddr::new(self.network.family().unwrap_or(Family::V4).unspecified(), 0)
        });
        let ctx = HookContext {
            network: self.network,
            local: Some(local),
            remote: None,
        };
        let socket = new_socket(self.network, Family::of(local.ip()))?;
        self.hooks.run(&ctx, &socket)?;
        socket.bind(&local.into())?;
        Ok(socket)
    }

    /// Bind a UDP socket
    pub fn bind_udp(&self) -> Result<UdpSocket> {
        let socket = self.prepare()?;
        Ok(UdpSocket::from_std(socket.into())?)
    }

    /// Bind a TCP listener
    pub fn bind_tcp(&self, backlog: i32) -> Result<TcpListener> {
        let socket = self.prepare()?;
        socket.listen(backlog)?;
        Ok(TcpListener::from_std(socket.into())?)
    }
}

/// Pins dials and listens to an interface
pub trait OutboundBinder: Send + Sync {
    /// Prepare `intent` so a dial to `dst` over `network` leaves through
    /// `iface`
    fn bind_for_dial(
        &self,
        iface: &str,
        intent: &mut DialIntent,
        network: Network,
        dst: SocketAddr,
    ) -> Result<()>;

    /// Prepare `intent` so its socket is bound on `iface`, returning the
    /// local address to use.
    ///
    /// The intent carries the rest of the request: its network gives the
    /// address family, and its local address (if set) is the caller's hint.
    /// A hint's port is kept; for a family-agnostic network the hint's
    /// address also picks the family.
    fn bind_for_listen(&self, iface: &str, intent: &mut ListenIntent) -> Result<SocketAddr>;
}
