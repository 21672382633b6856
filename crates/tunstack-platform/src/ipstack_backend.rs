//! Userspace TCP/IP stack backed by the `ipstack` crate
//!
//! `ipstack` reads raw IP packets from the device and yields reconstructed
//! TCP streams and UDP flows. They are wrapped into the core connection
//! traits and submitted to the dispatcher's sinks.

use async_trait::async_trait;
use ipstack::stream::{IpStackStream, IpStackTcpStream, IpStackUdpStream};
use ipstack::{IpStack, IpStackConfig};
use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadBuf};
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};
use tunstack_core::conn::{Connection, DatagramConn, EndpointId, StreamConn};
use tunstack_core::dispatch::{AcceptSink, SubmitError};
use tunstack_core::stack::{
    LinkEndpoint, NicId, StackRoute, TransportProtocol, UserspaceStack,
};
use tunstack_core::{Error, Result};

/// TCP stream reconstructed by ipstack.
///
/// ipstack reports the intercepted host socket as the local address and
/// the destination the host dialled as the peer.
struct TcpConn {
    id: EndpointId,
    inner: IpStackTcpStream,
}

impl TcpConn {
    fn new(inner: IpStackTcpStream) -> Self {
        let id = EndpointId {
            local: inner.peer_addr(),
            remote: inner.local_addr(),
        };
        Self { id, inner }
    }
}

impl StreamConn for TcpConn {
    fn id(&self) -> EndpointId {
        self.id
    }
}

impl AsyncRead for TcpConn {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_read(cx, buf)
    }
}

impl AsyncWrite for TcpConn {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.inner).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_shutdown(cx)
    }
}

/// UDP flow reconstructed by ipstack; each read yields one datagram
struct UdpConn {
    id: EndpointId,
    inner: IpStackUdpStream,
}

impl UdpConn {
    fn new(inner: IpStackUdpStream) -> Self {
        let id = EndpointId {
            local: inner.peer_addr(),
            remote: inner.local_addr(),
        };
        Self { id, inner }
    }
}

#[async_trait]
impl DatagramConn for UdpConn {
    fn id(&self) -> EndpointId {
        self.id
    }

    async fn recv(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.inner.read(buf).await
    }

    async fn send(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.inner.write(buf).await
    }

    async fn close(&mut self) -> io::Result<()> {
        self.inner.shutdown().await
    }
}

/// [`UserspaceStack`] running ipstack over the device
pub struct IpStackBackend {
    mtu: u16,
    packet_information: bool,
    tcp_sink: Option<AcceptSink>,
    udp_sink: Option<AcceptSink>,
    next_nic: NicId,
    nic: Option<NicId>,
    promiscuous: bool,
    spoofing: bool,
    routes: Vec<StackRoute>,
    accept_loop: Option<JoinHandle<()>>,
}

impl IpStackBackend {
    /// Stack for a device carrying packets of at most `mtu` bytes
    pub fn new(mtu: u32) -> Self {
        Self {
            mtu: u16::try_from(mtu).unwrap_or(u16::MAX),
            // utun prepends a 4-byte address family header
            packet_information: cfg!(any(target_os = "macos", target_os = "ios")),
            tcp_sink: None,
            udp_sink: None,
            next_nic: 1,
            nic: None,
            promiscuous: false,
            spoofing: false,
            routes: Vec::new(),
            accept_loop: None,
        }
    }

    /// Routes installed with [`UserspaceStack::set_route_table`]
    pub fn routes(&self) -> &[StackRoute] {
        &self.routes
    }

    fn require_nic(&self, nic: NicId) -> Result<()> {
        match self.nic {
            Some(id) if id == nic => Ok(()),
            _ => Err(Error::stack(format!("Unknown NIC {nic}"))),
        }
    }
}

impl UserspaceStack for IpStackBackend {
    fn set_transport_handler(&mut self, protocol: TransportProtocol, sink: AcceptSink) -> Result<()> {
        match protocol {
            TransportProtocol::Tcp => self.tcp_sink = Some(sink),
            TransportProtocol::Udp => self.udp_sink = Some(sink),
        }
        Ok(())
    }

    fn unique_nic_id(&mut self) -> NicId {
        let id = self.next_nic;
        self.next_nic += 1;
        id
    }

    fn create_nic(&mut self, nic: NicId, endpoint: LinkEndpoint) -> Result<()> {
        if self.nic.is_some() {
            return Err(Error::stack("Only one NIC is supported"));
        }
        let (Some(tcp), Some(udp)) = (self.tcp_sink.clone(), self.udp_sink.clone()) else {
            return Err(Error::stack("Transport handlers must be set before the NIC"));
        };

        let mut config = IpStackConfig::default();
        config.mtu(self.mtu);
        config.packet_information(self.packet_information);

        let device = endpoint.name().to_string();
        let stack = IpStack::new(config, endpoint.into_device());
        self.accept_loop = Some(tokio::spawn(accept_loop(stack, tcp, udp)));
        self.nic = Some(nic);
        debug!(nic, %device, mtu = self.mtu, "ipstack NIC created");
        Ok(())
    }

    fn set_promiscuous(&mut self, nic: NicId, enabled: bool) -> Result<()> {
        self.require_nic(nic)?;
        // ipstack terminates every destination address; nothing to switch.
        self.promiscuous = enabled;
        Ok(())
    }

    fn set_spoofing(&mut self, nic: NicId, enabled: bool) -> Result<()> {
        self.require_nic(nic)?;
        self.spoofing = enabled;
        Ok(())
    }

    fn set_route_table(&mut self, routes: Vec<StackRoute>) -> Result<()> {
        if let Some(route) = routes.iter().find(|r| Some(r.nic) != self.nic) {
            return Err(Error::stack(format!(
                "Route {} points at unknown NIC {}",
                route.destination, route.nic
            )));
        }
        trace!(
            routes = routes.len(),
            promiscuous = self.promiscuous,
            spoofing = self.spoofing,
            "Route table set"
        );
        self.routes = routes;
        Ok(())
    }

    fn close(&mut self) {
        if let Some(task) = self.accept_loop.take() {
            task.abort();
        }
        self.nic = None;
        self.tcp_sink = None;
        self.udp_sink = None;
        debug!("ipstack closed");
    }
}

impl Drop for IpStackBackend {
    fn drop(&mut self) {
        if let Some(task) = self.accept_loop.take() {
            task.abort();
        }
    }
}

async fn accept_loop(mut stack: IpStack, tcp: AcceptSink, udp: AcceptSink) {
    info!("Accepting intercepted connections");
    loop {
        let stream = match stack.accept().await {
            Ok(stream) => stream,
            Err(e) => {
                warn!(error = %e, "ipstack stopped");
                break;
            }
        };

        let (sink, conn) = match stream {
            IpStackStream::Tcp(tcp_stream) => {
                (&tcp, Connection::Stream(Box::new(TcpConn::new(tcp_stream))))
            }
            IpStackStream::Udp(udp_stream) => {
                (&udp, Connection::Datagram(Box::new(UdpConn::new(udp_stream))))
            }
            IpStackStream::UnknownTransport(packet) => {
                trace!(
                    src = %packet.src_addr(),
                    dst = %packet.dst_addr(),
                    "Dropping packet with unsupported transport"
                );
                continue;
            }
            IpStackStream::UnknownNetwork(packet) => {
                trace!(len = packet.len(), "Dropping non-IP packet");
                continue;
            }
        };

        let tuple = conn.tuple();
        trace!(%tuple, "Accepted");
        if let Err(SubmitError::Closed(_)) = sink.submit(conn).await {
            debug!("Dispatcher closed, stopping accept loop");
            break;
        }
    }
}
