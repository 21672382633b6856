//! Relay handler
//!
//! Forwards every intercepted connection to its original destination
//! through a socket pinned to the outbound interface, so relayed traffic
//! does not loop back into the virtual device.

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::copy_bidirectional;
use tracing::{debug, warn};
use tunstack_core::bind::{DialIntent, Network, OutboundBinder};
use tunstack_core::{ConnHandler, ConnTuple, DatagramConn, StreamConn};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const UDP_IDLE_TIMEOUT: Duration = Duration::from_secs(60);
const MAX_DATAGRAM: usize = 65535;

/// Relays intercepted connections out through one interface
pub struct Relay {
    binder: Arc<dyn OutboundBinder>,
    iface: String,
}

impl Relay {
    /// Relay dialling through `iface` with `binder`
    pub fn new(binder: Arc<dyn OutboundBinder>, iface: impl Into<String>) -> Self {
        Self {
            binder,
            iface: iface.into(),
        }
    }

    fn intent(&self, network: Network, tuple: &ConnTuple) -> tunstack_core::Result<DialIntent> {
        let mut intent = DialIntent::new().with_timeout(CONNECT_TIMEOUT);
        self.binder
            .bind_for_dial(&self.iface, &mut intent, network, tuple.dst())?;
        Ok(intent)
    }
}

#[async_trait]
impl ConnHandler for Relay {
    async fn handle_tcp(&self, tuple: ConnTuple, conn: &mut dyn StreamConn) {
        let upstream = match self.intent(Network::Tcp, &tuple) {
            Ok(intent) => intent.connect_tcp(tuple.dst()).await,
            Err(e) => Err(e),
        };
        let mut upstream = match upstream {
            Ok(stream) => stream,
            Err(e) => {
                warn!(%tuple, error = %e, "Upstream connect failed");
                return;
            }
        };

        match copy_bidirectional(conn, &mut upstream).await {
            Ok((sent, received)) => debug!(%tuple, sent, received, "TCP relay finished"),
            Err(e) => debug!(%tuple, error = %e, "TCP relay aborted"),
        }
    }

    async fn handle_udp(&self, tuple: ConnTuple, conn: &mut dyn DatagramConn) {
        let upstream = match self.intent(Network::Udp, &tuple) {
            Ok(intent) => intent.connect_udp(tuple.dst()).await,
            Err(e) => Err(e),
        };
        let upstream = match upstream {
            Ok(socket) => socket,
            Err(e) => {
                warn!(%tuple, error = %e, "Upstream socket failed");
                return;
            }
        };

        let mut outbound = vec![0u8; MAX_DATAGRAM];
        let mut inbound = vec![0u8; MAX_DATAGRAM];
        let (mut sent, mut received) = (0usize, 0usize);

        loop {
            tokio::select! {
                n = conn.recv(&mut outbound) => match n {
                    Ok(0) => break,
                    Ok(n) => {
                        if let Err(e) = upstream.send(&outbound[..n]).await {
                            debug!(%tuple, error = %e, "Upstream send failed");
                            break;
                        }
                        sent += 1;
                    }
                    Err(e) => {
                        debug!(%tuple, error = %e, "Flow read failed");
                        break;
                    }
                },
                n = upstream.recv(&mut inbound) => match n {
                    Ok(n) => {
                        if let Err(e) = conn.send(&inbound[..n]).await {
                            debug!(%tuple, error = %e, "Flow write failed");
                            break;
                        }
                        received += 1;
                    }
                    Err(e) => {
                        debug!(%tuple, error = %e, "Upstream recv failed");
                        break;
                    }
                },
                () = tokio::time::sleep(UDP_IDLE_TIMEOUT) => break,
            }
        }
        debug!(%tuple, sent, received, "UDP relay finished");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io;
    use std::net::SocketAddr;
    use std::pin::Pin;
    use std::task::{Context, Poll};
    use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, DuplexStream, ReadBuf};
    use tokio::net::{TcpListener, UdpSocket};
    use tokio::sync::mpsc;
    use tunstack_core::bind::ManualSourceBinder;
    use tunstack_core::conn::EndpointId;
    use tunstack_core::{Interface, Registry};

    fn relay() -> Relay {
        let lo = Interface::new("lo", 1, vec!["127.0.0.1/8".parse().unwrap()], None);
        let registry = Arc::new(Registry::from_interfaces(vec![lo]).unwrap());
        Relay::new(Arc::new(ManualSourceBinder::new(registry)), "lo")
    }

    fn id(dst: SocketAddr) -> EndpointId {
        EndpointId {
            local: dst,
            remote: "198.18.0.1:40000".parse().unwrap(),
        }
    }

    struct PipeStream {
        id: EndpointId,
        io: DuplexStream,
    }

    impl StreamConn for PipeStream {
        fn id(&self) -> EndpointId {
            self.id
        }
    }

    impl AsyncRead for PipeStream {
        fn poll_read(
            mut self: Pin<&mut Self>,
            cx: &mut Context<'_>,
            buf: &mut ReadBuf<'_>,
        ) -> Poll<io::Result<()>> {
            Pin::new(&mut self.io).poll_read(cx, buf)
        }
    }

    impl AsyncWrite for PipeStream {
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
            Pin::new(&mut self.io).poll_shutdown(cx)
        }
    }

    /// Datagram flow fed from and draining into channels
    struct ChannelFlow {
        id: EndpointId,
        from_host: mpsc::Receiver<Vec<u8>>,
        to_host: mpsc::Sender<Vec<u8>>,
    }

    #[async_trait]
    impl DatagramConn for ChannelFlow {
        fn id(&self) -> EndpointId {
            self.id
        }

        async fn recv(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            match self.from_host.recv().await {
                Some(data) => {
                    buf[..data.len()].copy_from_slice(&data);
                    Ok(data.len())
                }
                None => Ok(0),
            }
        }

        async fn send(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.to_host
                .send(buf.to_vec())
                .await
                .map_err(|_| io::Error::from(io::ErrorKind::BrokenPipe))?;
            Ok(buf.len())
        }

        async fn close(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_tcp_relay_round_trip() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let dst = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let (mut rd, mut wr) = socket.split();
            tokio::io::copy(&mut rd, &mut wr).await.unwrap();
        });

        let (ours, mut host) = tokio::io::duplex(1024);
        let mut conn = PipeStream { id: id(dst), io: ours };
        let relay = relay();
        let task = tokio::spawn(async move {
            let tuple = ConnTuple::from(conn.id);
            relay.handle_tcp(tuple, &mut conn).await;
        });

        host.write_all(b"ping").await.unwrap();
        let mut buf = [0u8; 4];
        host.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");

        host.shutdown().await.unwrap();
        tokio::time::timeout(Duration::from_secs(5), task)
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn test_udp_relay_round_trip() {
        let server = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let dst = server.local_addr().unwrap();
        tokio::spawn(async move {
            let mut buf = [0u8; 64];
            let (n, peer) = server.recv_from(&mut buf).await.unwrap();
            server.send_to(&buf[..n], peer).await.unwrap();
        });

        let (host_tx, from_host) = mpsc::channel(4);
        let (to_host, mut host_rx) = mpsc::channel(4);
        let mut flow = ChannelFlow {
            id: id(dst),
            from_host,
            to_host,
        };
        let relay = relay();
        let task = tokio::spawn(async move {
            let tuple = ConnTuple::from(flow.id);
            relay.handle_udp(tuple, &mut flow).await;
        });

        host_tx.send(b"query".to_vec()).await.unwrap();
        let reply = tokio::time::timeout(Duration::from_secs(5), host_rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(reply, b"query");

        drop(host_tx);
        tokio::time::timeout(Duration::from_secs(5), task)
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn test_unreachable_upstream_is_contained() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let dst = listener.local_addr().unwrap();
        drop(listener);

        let (ours, _host) = tokio::io::duplex(64);
        let mut conn = PipeStream { id: id(dst), io: ours };
        relay().handle_tcp(ConnTuple::from(conn.id), &mut conn).await;
    }
}
