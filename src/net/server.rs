//! TCP server: bind, accept, registry, admission, graceful shutdown.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;

use crate::error::{Error, Result};
use crate::net::{Endpoint, SocketCloseKind, TcpConnection};
use crate::queue::{HandlerQueue, Signal};

/// Default admission limit.
pub const DEFAULT_MAX_CONNECTIONS: usize = 1_048_576;

/// Process-global counter for accepted-socket ids.
static NEXT_SOCKET_ID: AtomicU64 = AtomicU64::new(0);

/// Accepting TCP server with a per-server connection registry.
///
/// Accepted sockets are wrapped in [`TcpConnection`]s and produced, in
/// accept order, on [`connections_queue`](Self::connections_queue). Each
/// connection removes itself from the registry when it closes.
pub struct TcpServer {
    endpoint: Mutex<Endpoint>,
    max_connections: usize,
    registry: Arc<Mutex<HashMap<u64, Arc<TcpConnection>>>>,
    connections_queue: Arc<HandlerQueue<Arc<TcpConnection>, Arc<TcpConnection>>>,
    listening_signal: Signal<Result<Endpoint>>,
    shutdown_signal: Signal<SocketCloseKind>,
    listen_called: AtomicBool,
    listening: AtomicBool,
    stop_requested: watch::Sender<bool>,
}

impl TcpServer {
    /// Create a server for the given endpoint. `max_connections` defaults to
    /// [`DEFAULT_MAX_CONNECTIONS`].
    pub fn new(endpoint: Endpoint, max_connections: Option<usize>) -> Arc<Self> {
        Arc::new(Self {
            endpoint: Mutex::new(endpoint),
            max_connections: max_connections.unwrap_or(DEFAULT_MAX_CONNECTIONS),
            registry: Arc::new(Mutex::new(HashMap::new())),
            connections_queue: Arc::new(HandlerQueue::new()),
            listening_signal: Signal::new(),
            shutdown_signal: Signal::new(),
            listen_called: AtomicBool::new(false),
            listening: AtomicBool::new(false),
            stop_requested: watch::channel(false).0,
        })
    }

    /// Bind and start accepting. May be called at most once.
    ///
    /// Binding port 0 is allowed; the server's endpoint is rewritten to the
    /// kernel-assigned port before this returns.
    pub async fn listen(self: &Arc<Self>) -> Result<Endpoint> {
        if self.listen_called.swap(true, Ordering::SeqCst) {
            return Err(Error::Misuse("listen may only be called once"));
        }

        let addr = self.endpoint.lock().to_string();
        let listener = match TcpListener::bind(&addr).await {
            Ok(l) => l,
            Err(e) => {
                let err: Error = e.into();
                self.listening_signal.fulfill(Err(err.clone()));
                self.shutdown_signal.fulfill(SocketCloseKind::NeverConnected);
                return Err(err);
            }
        };

        let bound = Endpoint::from(listener.local_addr()?);
        *self.endpoint.lock() = bound.clone();
        self.listening.store(true, Ordering::SeqCst);
        tracing::info!("listening on {}", bound);

        tokio::spawn(Arc::clone(self).accept_loop(listener));
        self.listening_signal.fulfill(Ok(bound.clone()));
        Ok(bound)
    }

    async fn accept_loop(self: Arc<Self>, listener: TcpListener) {
        let mut stop_rx = self.stop_requested.subscribe();
        loop {
            tokio::select! {
                _ = stop_rx.wait_for(|v| *v) => break,
                res = listener.accept() => match res {
                    Ok((stream, peer)) => self.admit(stream, peer.to_string()),
                    Err(e) => {
                        tracing::warn!("accept error: {}", e);
                    }
                }
            }
        }
        // The listening socket must be released before the shutdown signal
        // fires, so no accept can race with connection closure.
        drop(listener);
        self.listening.store(false, Ordering::SeqCst);
        self.shutdown_signal.fulfill(SocketCloseKind::WeClosedIt);
    }

    fn admit(self: &Arc<Self>, stream: TcpStream, peer: String) {
        let conn = {
            let mut registry = self.registry.lock();
            if registry.len() >= self.max_connections {
                tracing::debug!("connection limit reached, dropping {}", peer);
                drop(stream);
                return;
            }
            let socket_id = NEXT_SOCKET_ID.fetch_add(1, Ordering::Relaxed);
            let conn = TcpConnection::adopt(stream, socket_id);
            registry.insert(socket_id, Arc::clone(&conn));

            let registry2 = Arc::clone(&self.registry);
            let watched = Arc::clone(&conn);
            tokio::spawn(async move {
                watched.once_closed().await;
                registry2.lock().remove(&socket_id);
            });
            conn
        };
        tracing::debug!("accepted {} as {}", peer, conn.id());
        let _ = self.connections_queue.handle(conn);
    }

    /// Close the listening socket, then close and await every registered
    /// connection. Returns the listener's close kind.
    pub async fn shutdown(&self) -> SocketCloseKind {
        self.stop_listening();
        let kind = self.shutdown_signal.wait().await;
        self.close_all().await;
        kind
    }

    /// Close and release the listening socket only.
    pub fn stop_listening(&self) {
        let _ = self.stop_requested.send(true);
        if !self.listening.load(Ordering::SeqCst) {
            // Never listened (or listen failed): there is no accept loop to
            // report the close.
            self.shutdown_signal.fulfill(SocketCloseKind::NeverConnected);
        }
    }

    /// Close every registered connection and await all of them.
    pub async fn close_all(&self) {
        let conns: Vec<_> = self.registry.lock().values().cloned().collect();
        for conn in conns {
            conn.close().await;
        }
    }

    /// Snapshot of the registered connections.
    pub fn connections(&self) -> Vec<Arc<TcpConnection>> {
        self.registry.lock().values().cloned().collect()
    }

    /// Number of registered connections.
    pub fn connections_count(&self) -> usize {
        self.registry.lock().len()
    }

    /// Whether the server is currently accepting.
    pub fn is_listening(&self) -> bool {
        self.listening.load(Ordering::SeqCst)
    }

    /// Whether the server has shut down.
    pub fn is_shutdown(&self) -> bool {
        self.shutdown_signal.is_fulfilled()
    }

    /// The accept queue, producing each admitted connection in accept order.
    pub fn connections_queue(&self) -> &Arc<HandlerQueue<Arc<TcpConnection>, Arc<TcpConnection>>> {
        &self.connections_queue
    }

    /// Resolves with the bound endpoint once listening, or the bind error.
    pub async fn once_listening(&self) -> Result<Endpoint> {
        self.listening_signal.wait().await
    }

    /// Resolves once the listening socket has been released.
    pub async fn once_shutdown(&self) -> SocketCloseKind {
        self.shutdown_signal.wait().await
    }

    /// The configured (post-listen: resolved) endpoint.
    pub fn endpoint(&self) -> Endpoint {
        self.endpoint.lock().clone()
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tokio::io::AsyncReadExt;
    use tokio::net::TcpStream;
    use tokio::time::timeout;

    use super::*;

    #[tokio::test]
    async fn test_listen_resolves_ephemeral_port() {
        let server = TcpServer::new(Endpoint::new("127.0.0.1", 0), None);
        let bound = server.listen().await.unwrap();
        assert_ne!(bound.port, 0);
        assert_eq!(server.endpoint(), bound);
        assert!(server.is_listening());
        assert_eq!(server.once_listening().await.unwrap(), bound);
    }

    #[tokio::test]
    async fn test_listen_twice_is_misuse() {
        let server = TcpServer::new(Endpoint::new("127.0.0.1", 0), None);
        server.listen().await.unwrap();
        assert!(matches!(server.listen().await, Err(Error::Misuse(_))));
    }

    #[tokio::test]
    async fn test_bind_failure_rejects_and_shuts_down() {
        let occupied = TcpServer::new(Endpoint::new("127.0.0.1", 0), None);
        let bound = occupied.listen().await.unwrap();

        let server = TcpServer::new(bound, None);
        assert!(server.listen().await.is_err());
        assert!(server.once_listening().await.is_err());
        assert_eq!(
            server.once_shutdown().await,
            SocketCloseKind::NeverConnected
        );
    }

    #[tokio::test]
    async fn test_accepted_connections_enqueue_and_register() {
        let server = TcpServer::new(Endpoint::new("127.0.0.1", 0), None);
        let bound = server.listen().await.unwrap();

        let _c1 = TcpStream::connect(bound.to_string()).await.unwrap();
        let conn = server
            .connections_queue()
            .set_sync_next_handler(|c| c)
            .await
            .unwrap();
        assert!(conn.id().contains(".A"));
        assert_eq!(server.connections_count(), 1);

        // Self-removal on close.
        conn.close().await;
        timeout(Duration::from_secs(1), async {
            while server.connections_count() != 0 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn test_admission_drops_over_limit() {
        let server = TcpServer::new(Endpoint::new("127.0.0.1", 0), Some(2));
        let bound = server.listen().await.unwrap();

        let mut c1 = TcpStream::connect(bound.to_string()).await.unwrap();
        let mut c2 = TcpStream::connect(bound.to_string()).await.unwrap();
        let mut c3 = TcpStream::connect(bound.to_string()).await.unwrap();

        // The third socket is destroyed at admission: exactly one of the
        // three observes EOF, and the registry never exceeds the limit.
        let mut eofs = 0;
        for c in [&mut c1, &mut c2, &mut c3] {
            let mut buf = [0u8; 1];
            match timeout(Duration::from_millis(300), c.read(&mut buf)).await {
                Ok(Ok(0)) => eofs += 1,
                _ => {}
            }
        }
        assert_eq!(eofs, 1);
        assert!(server.connections_count() <= 2);
        assert_eq!(server.connections_count(), 2);
    }

    #[tokio::test]
    async fn test_shutdown_closes_listener_then_connections() {
        let server = TcpServer::new(Endpoint::new("127.0.0.1", 0), None);
        let bound = server.listen().await.unwrap();

        let _c1 = TcpStream::connect(bound.to_string()).await.unwrap();
        let conn = server
            .connections_queue()
            .set_sync_next_handler(|c| c)
            .await
            .unwrap();

        let kind = server.shutdown().await;
        assert_eq!(kind, SocketCloseKind::WeClosedIt);
        assert!(server.is_shutdown());
        assert!(!server.is_listening());
        assert!(conn.is_closed());

        // A second shutdown settles with the same kind.
        assert_eq!(server.shutdown().await, SocketCloseKind::WeClosedIt);

        // The port is released: a new bind on it succeeds.
        let rebound = TcpListener::bind(bound.to_string()).await;
        assert!(rebound.is_ok());

        timeout(Duration::from_secs(1), async {
            while server.connections_count() != 0 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
    }
}
