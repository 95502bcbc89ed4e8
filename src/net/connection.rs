//! Lifecycle-aware wrapper around one TCP socket.
//!
//! A connection is either adopted from an accepted socket or dialed to a
//! target endpoint. Inbound bytes flow through a handler queue so consumers
//! can pull "the next buffer" or install a permanent forwarder; outbound
//! writes are queued per connection and each yields an awaitable result.
//! Close is idempotent and classified into a [`SocketCloseKind`], emitted
//! exactly once.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;

use crate::error::{Error, Result};
use crate::net::{ConnectionInfo, ConnectionState, Endpoint, SocketCloseKind};
use crate::queue::{HandlerQueue, Signal};

/// Process-global counter for connection ids.
static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(0);

const READ_BUFFER_SIZE: usize = 16 * 1024;

/// Result of a completed socket write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WriteInfo {
    /// Number of bytes written to the socket.
    pub bytes_written: usize,
}

/// How to obtain the underlying socket. Exactly one variant exists per
/// connection, so the adopt-vs-dial choice is made at the type level.
pub enum SocketKind {
    /// Wrap an already-accepted socket. The connection starts `Connected`.
    Adopt {
        /// The accepted stream.
        stream: TcpStream,
        /// Server-assigned socket id, reflected in the connection id.
        socket_id: u64,
    },
    /// Open an outbound connection. The connection starts `Connecting`.
    Dial {
        /// Target to connect to.
        target: Endpoint,
        /// Keep the socket paused after connect instead of resuming reads.
        start_paused: bool,
    },
}

type PendingWrite = (Bytes, oneshot::Sender<Result<WriteInfo>>);

/// One TCP connection: lifecycle state machine plus duplex byte streams.
pub struct TcpConnection {
    id: String,
    state: Mutex<ConnectionState>,
    inbound: Arc<HandlerQueue<Bytes, Bytes>>,
    outbound_tx: mpsc::UnboundedSender<PendingWrite>,
    connected: Signal<Result<ConnectionInfo>>,
    closed: Signal<SocketCloseKind>,
    paused: watch::Sender<bool>,
    close_requested: watch::Sender<bool>,
    closing_locally: AtomicBool,
}

impl TcpConnection {
    /// Create a connection from the given socket kind and start its I/O.
    pub fn new(kind: SocketKind) -> Arc<Self> {
        let n = NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed);
        let (id, initial_state, start_paused) = match &kind {
            SocketKind::Adopt { socket_id, .. } => {
                (format!("N{}.A{}", n, socket_id), ConnectionState::Connected, false)
            }
            SocketKind::Dial { start_paused, .. } => {
                (format!("N{}", n), ConnectionState::Connecting, *start_paused)
            }
        };

        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let (paused, _) = watch::channel(start_paused);
        let (close_requested, _) = watch::channel(false);

        let conn = Arc::new(Self {
            id,
            state: Mutex::new(initial_state),
            inbound: Arc::new(HandlerQueue::new()),
            outbound_tx,
            connected: Signal::new(),
            closed: Signal::new(),
            paused,
            close_requested,
            closing_locally: AtomicBool::new(false),
        });

        match kind {
            SocketKind::Adopt { stream, .. } => {
                let _ = stream.set_nodelay(true);
                conn.connected.fulfill(Ok(query_info(&stream)));
                conn.spawn_io(stream, outbound_rx);
            }
            SocketKind::Dial { target, .. } => {
                let c = Arc::clone(&conn);
                tokio::spawn(async move { c.run_dial(target, outbound_rx).await });
            }
        }

        conn
    }

    /// Wrap an accepted socket; starts in `Connected`.
    pub fn adopt(stream: TcpStream, socket_id: u64) -> Arc<Self> {
        Self::new(SocketKind::Adopt { stream, socket_id })
    }

    /// Open an outbound connection; starts in `Connecting`.
    pub fn dial(target: Endpoint, start_paused: bool) -> Arc<Self> {
        Self::new(SocketKind::Dial {
            target,
            start_paused,
        })
    }

    /// Process-unique connection id, e.g. `N7` or `N7.A3`.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Current lifecycle state.
    pub fn state(&self) -> ConnectionState {
        *self.state.lock()
    }

    /// Whether the connection reached the `Closed` state.
    pub fn is_closed(&self) -> bool {
        self.state() == ConnectionState::Closed
    }

    /// Whether the connection reached a terminal state (`Closed` or `Error`).
    pub fn is_terminal(&self) -> bool {
        matches!(
            self.state(),
            ConnectionState::Closed | ConnectionState::Error
        )
    }

    /// Resolves once the connection is established, or fails if it never is.
    pub async fn once_connected(&self) -> Result<ConnectionInfo> {
        self.connected.wait().await
    }

    /// Resolves exactly once, when the socket's lifetime ends.
    pub async fn once_closed(&self) -> SocketCloseKind {
        self.closed.wait().await
    }

    /// The close kind, if the connection has already ended.
    pub fn closed_kind(&self) -> Option<SocketCloseKind> {
        self.closed.peek()
    }

    /// The inbound byte queue. Already-enqueued buffers keep draining to the
    /// installed consumer even after the connection closes.
    pub fn inbound(&self) -> &Arc<HandlerQueue<Bytes, Bytes>> {
        &self.inbound
    }

    /// Pull the next inbound buffer. Buffers enqueued before the connection
    /// closed are still delivered; waiting on a closed connection with an
    /// empty queue fails with [`Error::ConnectionClosed`].
    pub async fn receive_next(&self) -> Result<Bytes> {
        let next = self.inbound.set_sync_next_handler(|buf| buf);
        if self.is_terminal() {
            // No more data can arrive; release the waiter unless a buffered
            // item already resolved it.
            self.inbound.stop_handling();
        }
        match next.await {
            Err(Error::QueueCleared) => Err(Error::ConnectionClosed),
            other => other,
        }
    }

    /// Queue a buffer for writing and await the write result.
    ///
    /// Sends issued before the connection is established are buffered and
    /// written in offer order once it is.
    pub async fn send(&self, buf: Bytes) -> Result<WriteInfo> {
        let (done, rx) = oneshot::channel();
        self.enqueue_write(buf, done)?;
        rx.await.map_err(|_| Error::ConnectionClosed)?
    }

    /// Queue a buffer for writing without awaiting the result; a write that
    /// cannot be queued is dropped with a log entry.
    pub fn send_nowait(&self, buf: Bytes) {
        let (done, _rx) = oneshot::channel();
        if self.enqueue_write(buf, done).is_err() {
            tracing::debug!("connection {}: dropping write, connection closed", self.id);
        }
    }

    fn enqueue_write(&self, buf: Bytes, done: oneshot::Sender<Result<WriteInfo>>) -> Result<()> {
        if self.is_terminal() {
            return Err(Error::ConnectionClosed);
        }
        self.outbound_tx
            .send((buf, done))
            .map_err(|_| Error::ConnectionClosed)
    }

    /// Stop reading from the socket until [`resume`](Self::resume).
    pub fn pause(&self) {
        let _ = self.paused.send(true);
    }

    /// Resume reading from the socket.
    pub fn resume(&self) {
        let _ = self.paused.send(false);
    }

    /// Request the socket to close if it is not already closed, then wait
    /// for the close to complete. Idempotent.
    pub async fn close(&self) -> SocketCloseKind {
        if !self.is_terminal() {
            self.closing_locally.store(true, Ordering::SeqCst);
            let _ = self.close_requested.send(true);
        }
        self.closed.wait().await
    }

    fn signal_io_stop(&self) {
        let _ = self.close_requested.send(true);
    }

    async fn run_dial(
        self: Arc<Self>,
        target: Endpoint,
        mut outbound_rx: mpsc::UnboundedReceiver<PendingWrite>,
    ) {
        let addr = format!("{}:{}", target.address, target.port);
        let mut close_rx = self.close_requested.subscribe();

        let stream = tokio::select! {
            _ = wait_for_close(&mut close_rx) => {
                self.finish(
                    SocketCloseKind::WeClosedIt,
                    ConnectionState::Closed,
                    &mut outbound_rx,
                    Error::ConnectionClosed,
                );
                return;
            }
            res = TcpStream::connect(&addr) => match res {
                Ok(s) => s,
                Err(e) => {
                    tracing::debug!("connection {}: connect to {} failed: {}", self.id, addr, e);
                    self.finish(
                        SocketCloseKind::NeverConnected,
                        ConnectionState::Error,
                        &mut outbound_rx,
                        e.into(),
                    );
                    return;
                }
            }
        };

        let _ = stream.set_nodelay(true);
        // The reader is not running yet, so no data event can slip in
        // between connect completion and the endpoint query below.
        let info = query_info(&stream);
        *self.state.lock() = ConnectionState::Connected;
        self.connected.fulfill(Ok(info));
        self.spawn_io(stream, outbound_rx);
    }

    fn spawn_io(self: &Arc<Self>, stream: TcpStream, outbound_rx: mpsc::UnboundedReceiver<PendingWrite>) {
        let (rd, wr) = stream.into_split();
        let reader = tokio::spawn(Arc::clone(self).read_loop(rd));
        let writer = tokio::spawn(Arc::clone(self).write_loop(wr, outbound_rx));
        tokio::spawn(Arc::clone(self).supervise(reader, writer));
    }

    /// Awaits both I/O halves, so the socket resource is fully released
    /// before `once_closed` fulfills, then classifies the close.
    async fn supervise(
        self: Arc<Self>,
        reader: JoinHandle<Option<SocketCloseKind>>,
        writer: JoinHandle<(mpsc::UnboundedReceiver<PendingWrite>, Option<SocketCloseKind>)>,
    ) {
        let read_cause = reader.await.ok().flatten();
        let Ok((mut outbound_rx, write_cause)) = writer.await else {
            return;
        };
        let kind = read_cause.or(write_cause).unwrap_or_else(|| {
            if self.closing_locally.load(Ordering::SeqCst) {
                SocketCloseKind::WeClosedIt
            } else {
                SocketCloseKind::Unknown
            }
        });
        self.finish(
            kind,
            ConnectionState::Closed,
            &mut outbound_rx,
            Error::ConnectionClosed,
        );
    }

    /// Single authority for the end of the connection's lifetime: flips the
    /// state, clears the outbound queue, and fulfills the signals. A second
    /// disconnect is logged and ignored.
    fn finish(
        &self,
        kind: SocketCloseKind,
        end_state: ConnectionState,
        outbound_rx: &mut mpsc::UnboundedReceiver<PendingWrite>,
        connect_err: Error,
    ) {
        {
            let mut state = self.state.lock();
            if matches!(*state, ConnectionState::Closed | ConnectionState::Error) {
                tracing::debug!("connection {}: duplicate disconnect ignored", self.id);
                return;
            }
            *state = end_state;
        }
        outbound_rx.close();
        while let Ok((_, done)) = outbound_rx.try_recv() {
            let _ = done.send(Err(Error::ConnectionClosed));
        }
        // Release any reader parked on the inbound queue. Queued buffers
        // stay consumable; only an empty-queue waiter can be parked here.
        self.inbound.stop_handling();
        self.connected.fulfill(Err(connect_err));
        self.closed.fulfill(kind);
        tracing::debug!("connection {} closed: {:?}", self.id, kind);
    }

    async fn read_loop(self: Arc<Self>, mut rd: OwnedReadHalf) -> Option<SocketCloseKind> {
        let mut close_rx = self.close_requested.subscribe();
        let mut paused_rx = self.paused.subscribe();
        let mut buf = vec![0u8; READ_BUFFER_SIZE];

        loop {
            // Pause gate: while paused, only watch for resume or close.
            loop {
                if *close_rx.borrow() {
                    return None;
                }
                if !*paused_rx.borrow() {
                    break;
                }
                tokio::select! {
                    _ = close_rx.changed() => {}
                    _ = paused_rx.changed() => {}
                }
            }

            tokio::select! {
                _ = wait_for_close(&mut close_rx) => return None,
                res = rd.read(&mut buf) => match res {
                    Ok(0) => {
                        self.signal_io_stop();
                        return Some(SocketCloseKind::RemotelyClosed);
                    }
                    Ok(n) => {
                        let _ = self.inbound.handle(Bytes::copy_from_slice(&buf[..n]));
                    }
                    Err(e) => {
                        tracing::debug!("connection {}: read error: {}", self.id, e);
                        self.signal_io_stop();
                        return Some(SocketCloseKind::Unknown);
                    }
                }
            }
        }
    }

    async fn write_loop(
        self: Arc<Self>,
        mut wr: OwnedWriteHalf,
        mut outbound_rx: mpsc::UnboundedReceiver<PendingWrite>,
    ) -> (mpsc::UnboundedReceiver<PendingWrite>, Option<SocketCloseKind>) {
        let mut close_rx = self.close_requested.subscribe();
        let cause = loop {
            tokio::select! {
                biased;
                _ = wait_for_close(&mut close_rx) => break None,
                next = outbound_rx.recv() => match next {
                    Some((buf, done)) => match wr.write_all(&buf).await {
                        Ok(()) => {
                            let _ = done.send(Ok(WriteInfo {
                                bytes_written: buf.len(),
                            }));
                        }
                        Err(e) => {
                            tracing::debug!("connection {}: write error: {}", self.id, e);
                            let _ = done.send(Err(e.into()));
                            self.signal_io_stop();
                            break Some(SocketCloseKind::Unknown);
                        }
                    },
                    None => break None,
                }
            }
        };
        // Protocol-level shutdown first; dropping the half releases the
        // handle afterwards.
        let _ = wr.shutdown().await;
        (outbound_rx, cause)
    }
}

/// Awaits `true` on a `close_requested` watch channel without holding a
/// `watch::Ref` across an `.await`, which would make the enclosing future
/// non-`Send` (the ref is backed by a non-`Send` `std::sync::RwLockReadGuard`).
async fn wait_for_close(rx: &mut watch::Receiver<bool>) {
    loop {
        if *rx.borrow() {
            return;
        }
        if rx.changed().await.is_err() {
            return;
        }
    }
}

fn query_info(stream: &TcpStream) -> ConnectionInfo {
    ConnectionInfo {
        bound: stream.local_addr().ok().map(Endpoint::from),
        remote: stream.peer_addr().ok().map(Endpoint::from),
    }
}
