//! Accepted connections and the user handler contract

use async_trait::async_trait;
use std::fmt;
use std::io;
use std::net::{IpAddr, SocketAddr};
use tokio::io::{AsyncRead, AsyncWrite};

/// Transport endpoint identity as the userspace stack reports it.
///
/// `local` is the address the stack accepted on (the original destination,
/// thanks to promiscuous mode); `remote` is the host-side originator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct EndpointId {
    /// Stack-side address
    pub local: SocketAddr,
    /// Peer address
    pub remote: SocketAddr,
}

/// Source/destination pair of an intercepted connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnTuple {
    /// Originating host address
    pub src_ip: IpAddr,
    /// Originating port
    pub src_port: u16,
    /// Original destination address
    pub dst_ip: IpAddr,
    /// Original destination port
    pub dst_port: u16,
}

impl ConnTuple {
    /// Source socket address
    pub fn src(&self) -> SocketAddr {
        SocketAddr::new(self.src_ip, self.src_port)
    }

    /// Destination socket address
    pub fn dst(&self) -> SocketAddr {
        SocketAddr::new(self.dst_ip, self.dst_port)
    }
}

impl From<EndpointId> for ConnTuple {
    fn from(id: EndpointId) -> Self {
        Self {
            src_ip: id.remote.ip(),
            src_port: id.remote.port(),
            dst_ip: id.local.ip(),
            dst_port: id.local.port(),
        }
    }
}

impl fmt::Display for ConnTuple {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} -> {}", self.src(), self.dst())
    }
}

/// A reconstructed TCP stream
pub trait StreamConn: AsyncRead + AsyncWrite + Send + Unpin {
    /// Endpoint identity
    fn id(&self) -> EndpointId;
}

/// A reconstructed UDP flow between one host socket and one destination
#[async_trait]
pub trait DatagramConn: Send {
    /// Endpoint identity
    fn id(&self) -> EndpointId;

    /// Receive the next datagram sent by the host
    async fn recv(&mut self, buf: &mut [u8]) -> io::Result<usize>;

    /// Send a datagram back to the host, appearing to come from the destination
    async fn send(&mut self, buf: &[u8]) -> io::Result<usize>;

    /// Release the flow
    async fn close(&mut self) -> io::Result<()>;
}

/// Dispatch queue entry
pub enum Connection {
    /// TCP stream
    Stream(Box<dyn StreamConn>),
    /// UDP flow
    Datagram(Box<dyn DatagramConn>),
}

impl Connection {
    /// Endpoint identity
    pub fn id(&self) -> EndpointId {
        match self {
            Connection::Stream(conn) => conn.id(),
            Connection::Datagram(conn) => conn.id(),
        }
    }

    /// Tuple derived from the endpoint identity
    pub fn tuple(&self) -> ConnTuple {
        self.id().into()
    }

    /// Whether this is a TCP stream
    pub fn is_stream(&self) -> bool {
        matches!(self, Connection::Stream(_))
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = if self.is_stream() { "Stream" } else { "Datagram" };
        f.debug_struct("Connection")
            .field("kind", &kind)
            .field("tuple", &self.tuple())
            .finish()
    }
}

/// User code receiving intercepted connections.
///
/// The connection is closed by the dispatcher once the call returns.
#[async_trait]
pub trait ConnHandler: Send + Sync + 'static {
    /// Handle one TCP stream
    async fn handle_tcp(&self, tuple: ConnTuple, conn: &mut dyn StreamConn);

    /// Handle one UDP flow
    async fn handle_udp(&self, tuple: ConnTuple, conn: &mut dyn DatagramConn);
}

/// In-memory connections for tests
#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use std::pin::Pin;
    use std::task::{Context, Poll};
    use tokio::io::{DuplexStream, ReadBuf};
    use tokio::sync::oneshot;

    /// Stream backed by a duplex pipe; reports shutdown through a channel
    pub struct FakeStream {
        pub id: EndpointId,
        pub io: DuplexStream,
        pub closed: Option<oneshot::Sender<()>>,
    }

    impl FakeStream {
        pub fn new(local: &str, remote: &str) -> (Self, DuplexStream, oneshot::Receiver<()>) {
            let (io, peer) = tokio::io::duplex(1024);
            let (tx, rx) = oneshot::channel();
            let id = EndpointId {
                local: local.parse().unwrap(),
                remote: remote.parse().unwrap(),
            };
            (
                Self {
                    id,
                    io,
                    closed: Some(tx),
                },
                peer,
                rx,
            )
        }
    }

    impl StreamConn for FakeStream {
        fn id(&self) -> EndpointId {
            self.id
        }
    }

    impl AsyncRead for FakeStream {
        fn poll_read(
            mut self: Pin<&mut Self>,
            cx: &mut Context<'_>,
            buf: &mut ReadBuf<'_>,
        ) -> Poll<io::Result<()>> {
            Pin::new(&mut self.io).poll_read(cx, buf)
        }
    }

    impl AsyncWrite for FakeStream {
        fn poll_write(
            mut self: Pin<&mut Self>,
            cx: &mut Context<'_>,
            buf: &[u8],
        ) -> Poll<io::Result<usize>> {
            Pin::new(&mut self.io).poll_write(cx, buf)
        }

        fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
            Pin::new(&mut self.io).poll_flush(cx)
        }

        fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
            if let Some(tx) = self.closed.take() {
                let _ = tx.send(());
            }
            Pin::new(&mut self.io).poll_shutdown(cx)
        }
    }

    /// Datagram flow that never receives; reports close through a channel
    pub struct FakeDatagram {
        pub id: EndpointId,
        pub closed: Option<oneshot::Sender<()>>,
    }

    impl FakeDatagram {
        pub fn new(local: &str, remote: &str) -> (Self, oneshot::Receiver<()>) {
            let (tx, rx) = oneshot::channel();
            let id = EndpointId {
                local: local.parse().unwrap(),
                remote: remote.parse().unwrap(),
            };
            (Self { id, closed: Some(tx) }, rx)
        }
    }

    #[async_trait]
    impl DatagramConn for FakeDatagram {
        fn id(&self) -> EndpointId {
            self.id
        }

        async fn recv(&mut self, _buf: &mut [u8]) -> io::Result<usize> {
            std::future::pending().await
        }

        async fn send(&mut self, buf: &[u8]) -> io::Result<usize> {
            Ok(buf.len())
        }

        async fn close(&mut self) -> io::Result<()> {
            if let Some(tx) = self.closed.take() {
                let _ = tx.send(());
            }
            Ok(())
        }
    }
}
