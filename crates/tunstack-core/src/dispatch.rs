//! Connection dispatcher
//!
//! The userspace stack pushes accepted connections into two bounded intake
//! queues through an [`AcceptSink`]. A single coordinator task drains both
//! queues and hands every connection to its own worker task, which invokes
//! the registered [`ConnHandler`] and closes the connection afterwards,
//! also when the handler panics.
//!
//! A full queue stalls the producer until the coordinator frees a slot.

use crate::conn::{ConnHandler, ConnTuple, Connection, DatagramConn, StreamConn};
use crate::error::{Error, Result};
use parking_lot::{Mutex, RwLock};
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, trace, warn};

type SharedHandler = Arc<RwLock<Option<Arc<dyn ConnHandler>>>>;

/// Rejected submission; the connection is handed back
#[derive(thiserror::Error, Debug)]
pub enum SubmitError {
    /// Queue is at capacity
    #[error("Dispatch queue is full")]
    Full(Connection),

    /// Dispatcher has shut down
    #[error("Dispatcher is closed")]
    Closed(Connection),
}

impl SubmitError {
    /// Recover the rejected connection
    pub fn into_inner(self) -> Connection {
        match self {
            SubmitError::Full(conn) | SubmitError::Closed(conn) => conn,
        }
    }
}

/// Producer side of the intake queues, handed to the userspace stack
#[derive(Clone)]
pub struct AcceptSink {
    streams: mpsc::Sender<Box<dyn StreamConn>>,
    datagrams: mpsc::Sender<Box<dyn DatagramConn>>,
}

impl AcceptSink {
    /// Queue a connection, waiting while its queue is full
    pub async fn submit(&self, conn: Connection) -> std::result::Result<(), SubmitError> {
        match conn {
            Connection::Stream(s) => self
                .streams
                .send(s)
                .await
                .map_err(|e| SubmitError::Closed(Connection::Stream(e.0))),
            Connection::Datagram(d) => self
                .datagrams
                .send(d)
                .await
                .map_err(|e| SubmitError::Closed(Connection::Datagram(e.0))),
        }
    }

    /// Queue a connection without waiting
    pub fn try_submit(&self, conn: Connection) -> std::result::Result<(), SubmitError> {
        use mpsc::error::TrySendError;

        match conn {
            Connection::Stream(s) => self.streams.try_send(s).map_err(|e| match e {
                TrySendError::Full(s) => SubmitError::Full(Connection::Stream(s)),
                TrySendError::Closed(s) => SubmitError::Closed(Connection::Stream(s)),
            }),
            Connection::Datagram(d) => self.datagrams.try_send(d).map_err(|e| match e {
                TrySendError::Full(d) => SubmitError::Full(Connection::Datagram(d)),
                TrySendError::Closed(d) => SubmitError::Closed(Connection::Datagram(d)),
            }),
        }
    }

    /// Whether the dispatcher has stopped taking connections
    pub fn is_closed(&self) -> bool {
        self.streams.is_closed()
    }
}

type Intake = (
    mpsc::Receiver<Box<dyn StreamConn>>,
    mpsc::Receiver<Box<dyn DatagramConn>>,
);

/// Bounded queues plus a coordinator spawning one worker per connection
pub struct Dispatcher {
    sink: AcceptSink,
    intake: Mutex<Option<Intake>>,
    shutdown_tx: watch::Sender<bool>,
    shutdown_rx: watch::Receiver<bool>,
    handler: SharedHandler,
    capacity: usize,
}

impl Dispatcher {
    /// Create a dispatcher whose queues each hold `capacity` entries
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        let (stream_tx, stream_rx) = mpsc::channel(capacity);
        let (datagram_tx, datagram_rx) = mpsc::channel(capacity);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        Self {
            sink: AcceptSink {
                streams: stream_tx,
                datagrams: datagram_tx,
            },
            intake: Mutex::new(Some((stream_rx, datagram_rx))),
            shutdown_tx,
            shutdown_rx,
            handler: Arc::new(RwLock::new(None)),
            capacity,
        }
    }

    /// Producer handle for the stack's accept path
    pub fn sink(&self) -> AcceptSink {
        self.sink.clone()
    }

    /// Queue capacity
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Install the handler for connections dispatched from now on
    pub fn register_handler(&self, handler: Arc<dyn ConnHandler>) {
        *self.handler.write() = Some(handler);
        debug!("Connection handler registered");
    }

    /// Spawn the coordinator task. Must be called within a Tokio runtime.
    pub fn run(&self) -> Result<JoinHandle<()>> {
        let (mut streams, mut datagrams) = self
            .intake
            .lock()
            .take()
            .ok_or_else(|| Error::Lifecycle("Dispatcher is already running".to_string()))?;
        let mut shutdown = self.shutdown_rx.clone();
        let handler = Arc::clone(&self.handler);

        info!(capacity = self.capacity, "Dispatcher started");

        Ok(tokio::spawn(async move {
            loop {
                tokio::select! {
                    biased;
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            break;
                        }
                    }
                    Some(conn) = streams.recv() => {
                        spawn_worker(&handler, Connection::Stream(conn));
                    }
                    Some(conn) = datagrams.recv() => {
                        spawn_worker(&handler, Connection::Datagram(conn));
                    }
                    else => break,
                }
            }
            info!("Dispatcher stopped");
        }))
    }

    /// Stop the coordinator. Workers already spawned run to completion.
    pub fn finish(&self) {
        let _ = self.shutdown_tx.send(true);
    }
}

fn spawn_worker(handler: &SharedHandler, conn: Connection) {
    let tuple = conn.tuple();
    let current = handler.read().clone();

    tokio::spawn(async move {
        let worker = tokio::spawn(serve(current, tuple, conn));
        if let Err(e) = worker.await {
            if e.is_panic() {
                error!(%tuple, "Connection worker panicked");
            } else {
                warn!(%tuple, error = %e, "Connection worker aborted");
            }
        }
    });
}

/// Owns a dispatched connection until it is closed. Dropped without
/// [`CloseGuard::close`] (handler panic, aborted worker), it closes the
/// connection on a fresh task.
struct CloseGuard {
    tuple: ConnTuple,
    conn: Option<Connection>,
}

impl CloseGuard {
    fn new(tuple: ConnTuple, conn: Connection) -> Self {
        Self {
            tuple,
            conn: Some(conn),
        }
    }

    async fn close(mut self) {
        if let Some(conn) = self.conn.take() {
            close(self.tuple, conn).await;
        }
    }
}

impl Drop for CloseGuard {
    fn drop(&mut self) {
        let Some(conn) = self.conn.take() else {
            return;
        };
        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                debug!(tuple = %self.tuple, "Closing connection left by a failed worker");
                runtime.spawn(close(self.tuple, conn));
            }
            Err(_) => warn!(tuple = %self.tuple, "No runtime to close connection, dropping it"),
        }
    }
}

async fn serve(handler: Option<Arc<dyn ConnHandler>>, tuple: ConnTuple, conn: Connection) {
    let mut guard = CloseGuard::new(tuple, conn);

    match (handler, guard.conn.as_mut()) {
        (Some(h), Some(Connection::Stream(stream))) => {
            trace!(%tuple, "Handling TCP connection");
            h.handle_tcp(tuple, stream.as_mut()).await;
        }
        (Some(h), Some(Connection::Datagram(flow))) => {
            trace!(%tuple, "Handling UDP flow");
            h.handle_udp(tuple, flow.as_mut()).await;
        }
        (None, _) => debug!(%tuple, "No handler registered, closing connection"),
        (Some(_), None) => {}
    }

    guard.close().await;
}

async fn close(tuple: ConnTuple, conn: Connection) {
    match conn {
        Connection::Stream(mut stream) => {
            if let Err(e) = stream.shutdown().await {
                trace!(%tuple, error = %e, "TCP close failed");
            }
        }
        Connection::Datagram(mut flow) => {
            if let Err(e) = flow.close().await {
                trace!(%tuple, error = %e, "UDP close failed");
            }
        }
    }
}
