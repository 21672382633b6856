//! Interception lifecycle
//!
//! [`TunNetstack`] ties the pieces together: it opens the device, applies
//! the host routing, starts the dispatcher and attaches the userspace stack.
//! `close` reverses all of it.

use crate::config::TunConfig;
use crate::conn::ConnHandler;
use crate::dispatch::Dispatcher;
use crate::error::{Error, Result};
use crate::routing::TunRouting;
use crate::stack::{LinkEndpoint, StackAdapter, UserspaceStack, VirtualDevice};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{error, info, instrument, warn};

/// Source of the platform collaborators
pub trait Backend: Send + Sync {
    /// Create or open the virtual device
    fn open_device(&self, config: &TunConfig) -> Result<Box<dyn VirtualDevice>>;

    /// Routing configuration for this host
    fn routing(&self, config: &TunConfig) -> Result<Box<dyn TunRouting>>;

    /// A fresh userspace stack
    fn stack(&self, config: &TunConfig) -> Result<Box<dyn UserspaceStack>>;
}

struct Running {
    routing: Box<dyn TunRouting>,
    adapter: StackAdapter,
    dispatcher: Dispatcher,
    coordinator: JoinHandle<()>,
}

/// A virtual device turned into a connection source
pub struct TunNetstack {
    config: TunConfig,
    queue_capacity: usize,
    backend: Box<dyn Backend>,
    handler: Option<Arc<dyn ConnHandler>>,
    running: Option<Running>,
}

impl TunNetstack {
    /// Create a stopped instance
    pub fn new(config: TunConfig, queue_capacity: usize, backend: Box<dyn Backend>) -> Self {
        Self {
            config,
            queue_capacity,
            backend,
            handler: None,
            running: None,
        }
    }

    /// Device configuration
    pub fn config(&self) -> &TunConfig {
        &self.config
    }

    /// Whether `start` has succeeded and `close` has not run yet
    pub fn is_running(&self) -> bool {
        self.running.is_some()
    }

    /// Set the handler for intercepted connections. May be called before
    /// or after `start`.
    pub fn register_conn_handler(&mut self, handler: Arc<dyn ConnHandler>) {
        if let Some(ref running) = self.running {
            running.dispatcher.register_handler(Arc::clone(&handler));
        }
        self.handler = Some(handler);
    }

    /// Bring interception up. Must be called within a Tokio runtime.
    ///
    /// Any failure after routing was applied removes it again.
    #[instrument(skip(self), fields(device = %self.config.name))]
    pub fn start(&mut self) -> Result<()> {
        if self.running.is_some() {
            return Err(Error::Lifecycle("Netstack is already running".to_string()));
        }
        self.config.validate()?;

        let device = self.backend.open_device(&self.config)?;
        let endpoint = LinkEndpoint::new(device, self.config.effective_mtu());

        let mut routing = self.backend.routing(&self.config)?;
        routing.setup(&self.config)?;

        let dispatcher = Dispatcher::new(self.queue_capacity);
        if let Some(ref handler) = self.handler {
            dispatcher.register_handler(Arc::clone(handler));
        }

        let attached = dispatcher.run().and_then(|coordinator| {
            let adapter = self
                .backend
                .stack(&self.config)
                .and_then(|stack| StackAdapter::attach(stack, endpoint, &dispatcher.sink()));
            if adapter.is_err() {
                dispatcher.finish();
            }
            adapter.map(|adapter| (adapter, coordinator))
        });

        let (adapter, coordinator) = match attached {
            Ok(parts) => parts,
            Err(e) => {
                error!(error = %e, "Netstack start failed, removing routing");
                for failure in routing.teardown() {
                    warn!(error = %failure, "Routing cleanup step failed");
                }
                return Err(e);
            }
        };

        self.running = Some(Running {
            routing,
            adapter,
            dispatcher,
            coordinator,
        });
        info!(
            mtu = self.config.effective_mtu(),
            addresses = self.config.addresses.len(),
            "Netstack started"
        );
        Ok(())
    }

    /// Tear interception down. Cleanup failures are logged, not returned.
    #[instrument(skip(self), fields(device = %self.config.name))]
    pub fn close(&mut self) -> Result<()> {
        let Running {
            mut routing,
            adapter,
            dispatcher,
            coordinator,
        } = self
            .running
            .take()
            .ok_or_else(|| Error::Lifecycle("Netstack is not running".to_string()))?;

        let failures = routing.teardown();
        for failure in &failures {
            warn!(error = %failure, "Routing cleanup step failed");
        }
        adapter.close();
        dispatcher.finish();
        drop(coordinator);

        info!(cleanup_failures = failures.len(), "Netstack stopped");
        Ok(())
    }
}

impl Drop for TunNetstack {
    fn drop(&mut self) {
        if self.running.is_some() {
            warn!(device = %self.config.name, "Netstack dropped while running, closing");
            let _ = self.close();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conn::testing::FakeStream;
    use crate::conn::{Connection, ConnTuple, DatagramConn, StreamConn};
    use crate::dispatch::AcceptSink;
    use crate::routing::{MemoryRouting, PolicyRouting};
    use crate::stack::{NicId, StackRoute, TransportProtocol};
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use std::pin::Pin;
    use std::task::{Context, Poll};
    use std::time::Duration;
    use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
    use tokio::sync::mpsc;

    struct NullDevice;

    impl VirtualDevice for NullDevice {
        fn name(&self) -> &str {
            "tun0"
        }
    }

    impl AsyncRead for NullDevice {
        fn poll_read(
            self: Pin<&mut Self>,
            _cx: &mut Context<'_>,
            _buf: &mut ReadBuf<'_>,
        ) -> Poll<std::io::Result<()>> {
            Poll::Pending
        }
    }

    impl AsyncWrite for NullDevice {
        fn poll_write(
            self: Pin<&mut Self>,
            _cx: &mut Context<'_>,
            buf: &[u8],
        ) -> Poll<std::io::Result<usize>> {
            Poll::Ready(Ok(buf.len()))
        }

        fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
            Poll::Ready(Ok(()))
        }

        fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
            Poll::Ready(Ok(()))
        }
    }

    /// Stack that exposes its TCP sink so tests can inject connections
    struct LoopbackStack {
        sinks: Arc<Mutex<Vec<AcceptSink>>>,
        fail_nic: bool,
        closed: Arc<Mutex<bool>>,
    }

    impl UserspaceStack for LoopbackStack {
        fn set_transport_handler(&mut self, protocol: TransportProtocol, sink: AcceptSink) -> Result<()> {
            if protocol == TransportProtocol::Tcp {
                self.sinks.lock().push(sink);
            }
            Ok(())
        }

        fn unique_nic_id(&mut self) -> NicId {
            1
        }

        fn create_nic(&mut self, _nic: NicId, _endpoint: LinkEndpoint) -> Result<()> {
            if self.fail_nic {
                Err(Error::stack("NIC creation refused"))
            } else {
                Ok(())
            }
        }

        fn set_promiscuous(&mut self, _nic: NicId, _enabled: bool) -> Result<()> {
            Ok(())
        }

        fn set_spoofing(&mut self, _nic: NicId, _enabled: bool) -> Result<()> {
            Ok(())
        }

        fn set_route_table(&mut self, _routes: Vec<StackRoute>) -> Result<()> {
            Ok(())
        }

        fn close(&mut self) {
            *self.closed.lock() = true;
        }
    }

    #[derive(Clone, Default)]
    struct TestBackend {
        kernel: Arc<MemoryRouting>,
        sinks: Arc<Mutex<Vec<AcceptSink>>>,
        closed: Arc<Mutex<bool>>,
        fail_nic: bool,
    }

    impl Backend for TestBackend {
        fn open_device(&self, _config: &TunConfig) -> Result<Box<dyn VirtualDevice>> {
            Ok(Box::new(NullDevice))
        }

        fn routing(&self, _config: &TunConfig) -> Result<Box<dyn TunRouting>> {
            Ok(Box::new(PolicyRouting::new(Arc::clone(&self.kernel))))
        }

        fn stack(&self, _config: &TunConfig) -> Result<Box<dyn UserspaceStack>> {
            Ok(Box::new(LoopbackStack {
                sinks: Arc::clone(&self.sinks),
                fail_nic: self.fail_nic,
                closed: Arc::clone(&self.closed),
            }))
        }
    }

    struct Recorder(mpsc::UnboundedSender<ConnTuple>);

    #[async_trait]
    impl ConnHandler for Recorder {
        async fn handle_tcp(&self, tuple: ConnTuple, _conn: &mut dyn StreamConn) {
            let _ = self.0.send(tuple);
        }

        async fn handle_udp(&self, _tuple: ConnTuple, _conn: &mut dyn DatagramConn) {}
    }

    fn config() -> TunConfig {
        TunConfig::new("tun0", vec!["198.18.0.1/16".parse().unwrap()])
    }

    #[tokio::test]
    async fn test_lifecycle_end_to_end() {
        let backend = TestBackend::default();
        let mut netstack = TunNetstack::new(config(), 16, Box::new(backend.clone()));
        let (tx, mut rx) = mpsc::unbounded_channel();
        netstack.register_conn_handler(Arc::new(Recorder(tx)));

        assert!(matches!(netstack.close(), Err(Error::Lifecycle(_))));
        netstack.start().unwrap();
        assert!(netstack.is_running());
        assert!(matches!(netstack.start(), Err(Error::Lifecycle(_))));
        assert!(backend.kernel.is_up("tun0"));

        let sink = backend.sinks.lock()[0].clone();
        let (conn, _peer, closed) = FakeStream::new("93.184.216.34:80", "198.18.0.1:40000");
        sink.submit(Connection::Stream(Box::new(conn))).await.unwrap();

        let tuple = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(tuple.dst(), "93.184.216.34:80".parse().unwrap());
        tokio::time::timeout(Duration::from_secs(2), closed).await.unwrap().unwrap();

        netstack.close().unwrap();
        assert!(!netstack.is_running());
        assert!(*backend.closed.lock());
        assert!(backend.kernel.rules().is_empty());
        assert!(backend.kernel.addresses("tun0").is_empty());
        assert!(matches!(netstack.close(), Err(Error::Lifecycle(_))));
    }

    #[tokio::test]
    async fn test_stack_failure_removes_routing() {
        let backend = TestBackend {
            fail_nic: true,
            ..Default::default()
        };
        let mut netstack = TunNetstack::new(config(), 16, Box::new(backend.clone()));

        assert!(matches!(netstack.start(), Err(Error::Stack(_))));
        assert!(!netstack.is_running());
        assert!(backend.kernel.rules().is_empty());
        assert!(backend.kernel.routes().is_empty());
        assert!(backend.kernel.addresses("tun0").is_empty());
    }

    #[tokio::test]
    async fn test_restart_after_close() {
        let backend = TestBackend::default();
        let mut netstack = TunNetstack::new(config(), 16, Box::new(backend.clone()));
        netstack.start().unwrap();
        netstack.close().unwrap();
        netstack.start().unwrap();
        assert!(netstack.is_running());
        drop(netstack);
        assert!(backend.kernel.rules().is_empty());
    }
}
