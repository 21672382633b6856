//! Userspace network stack attachment
//!
//! The TCP/IP implementation itself is an external collaborator behind
//! [`UserspaceStack`]. [`StackAdapter`] drives it through the attachment
//! sequence: accept callbacks first, then the NIC, then promiscuous mode,
//! address spoofing and the internal default routes.

use crate::dispatch::AcceptSink;
use crate::error::Result;
use crate::net::Family;
use ipnet::IpNet;
use std::fmt;
use tokio::io::{AsyncRead, AsyncWrite};
use tracing::{debug, info, instrument, warn};

/// Stack-local NIC identifier
pub type NicId = u32;

/// Transport protocols whose accepted connections are dispatched
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransportProtocol {
    /// TCP streams
    Tcp,
    /// UDP flows
    Udp,
}

impl fmt::Display for TransportProtocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransportProtocol::Tcp => f.write_str("tcp"),
            TransportProtocol::Udp => f.write_str("udp"),
        }
    }
}

/// Route inside the userspace stack
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StackRoute {
    /// Destination prefix
    pub destination: IpNet,
    /// Outgoing NIC
    pub nic: NicId,
}

/// Raw packet device (one IP packet per read/write)
pub trait VirtualDevice: AsyncRead + AsyncWrite + Send + Unpin {
    /// OS-visible device name
    fn name(&self) -> &str;
}

/// Link-layer endpoint wrapping a virtual device
pub struct LinkEndpoint {
    device: Box<dyn VirtualDevice>,
    mtu: u32,
}

impl LinkEndpoint {
    /// Wrap `device` with the given MTU
    pub fn new(device: Box<dyn VirtualDevice>, mtu: u32) -> Self {
        Self { device, mtu }
    }

    /// Device name
    pub fn name(&self) -> &str {
        self.device.name()
    }

    /// Link MTU
    pub fn mtu(&self) -> u32 {
        self.mtu
    }

    /// Hand the device over to the stack
    pub fn into_device(self) -> Box<dyn VirtualDevice> {
        self.device
    }
}

impl fmt::Debug for LinkEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LinkEndpoint")
            .field("name", &self.name())
            .field("mtu", &self.mtu)
            .finish()
    }
}

/// Embedded userspace TCP/IP stack
#[cfg_attr(test, mockall::automock)]
pub trait UserspaceStack: Send {
    /// Deliver accepted connections of `protocol` to `sink`
    fn set_transport_handler(&mut self, protocol: TransportProtocol, sink: AcceptSink)
        -> Result<()>;

    /// Fresh NIC identifier
    fn unique_nic_id(&mut self) -> NicId;

    /// Create a NIC bound to `endpoint`; packets start flowing afterwards
    fn create_nic(&mut self, nic: NicId, endpoint: LinkEndpoint) -> Result<()>;

    /// Accept packets for any destination address
    fn set_promiscuous(&mut self, nic: NicId, enabled: bool) -> Result<()>;

    /// Allow replies from addresses the NIC does not own
    fn set_spoofing(&mut self, nic: NicId, enabled: bool) -> Result<()>;

    /// Replace the stack's route table
    fn set_route_table(&mut self, routes: Vec<StackRoute>) -> Result<()>;

    /// Stop the stack and release the device
    fn close(&mut self);
}

/// A userspace stack attached to the virtual device
pub struct StackAdapter {
    stack: Box<dyn UserspaceStack>,
    nic: NicId,
}

impl StackAdapter {
    /// Attach `endpoint` to `stack`, dispatching accepted connections to `sink`
    #[instrument(skip_all, fields(device = %endpoint.name(), mtu = endpoint.mtu()))]
    pub fn attach(
        mut stack: Box<dyn UserspaceStack>,
        endpoint: LinkEndpoint,
        sink: &AcceptSink,
    ) -> Result<Self> {
        // Handlers must exist before the NIC starts delivering packets.
        stack.set_transport_handler(TransportProtocol::Tcp, sink.clone())?;
        stack.set_transport_handler(TransportProtocol::Udp, sink.clone())?;

        let nic = stack.unique_nic_id();
        stack.create_nic(nic, endpoint)?;
        debug!(nic, "NIC created");

        if let Err(e) = configure_nic(stack.as_mut(), nic) {
            warn!(nic, error = %e, "Stack configuration failed");
            stack.close();
            return Err(e);
        }

        info!(nic, "Userspace stack attached");
        Ok(Self { stack, nic })
    }

    /// NIC the device is bound to
    pub fn nic(&self) -> NicId {
        self.nic
    }

    /// Stop the stack
    pub fn close(mut self) {
        self.stack.close();
        debug!(nic = self.nic, "Userspace stack closed");
    }
}

fn configure_nic(stack: &mut dyn UserspaceStack, nic: NicId) -> Result<()> {
    stack.set_promiscuous(nic, true)?;
    stack.set_spoofing(nic, true)?;
    stack.set_route_table(
        Family::ALL
            .iter()
            .map(|family| StackRoute {
                destination: family.default_route(),
                nic,
            })
            .collect(),
    )
}
