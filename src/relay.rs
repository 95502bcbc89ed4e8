//! The relay: one TCP server, one peer connection, all active sessions.
//!
//! Accepted SOCKS clients become sessions keyed by channel label; inbound
//! peer frames are routed to the addressed session; outbound signalling is
//! surfaced on a queue for the embedder. Failure of either leg tears the
//! whole relay down exactly once.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::config::RelayConfig;
use crate::error::{Error, Result};
use crate::metrics::RelayMetrics;
use crate::net::{Endpoint, TcpConnection, TcpServer};
use crate::peer::{ChannelFrame, PeerEvent, PeerTransport, SignalMessage, CONTROL_CHANNEL_LABEL};
use crate::queue::{HandlerQueue, Signal};
use crate::session::Session;

/// SOCKS5 relay over a peer-to-peer data-channel transport.
pub struct Relay {
    server: Arc<TcpServer>,
    peer: Arc<dyn PeerTransport>,
    sessions: Arc<Mutex<HashMap<String, Arc<Session>>>>,
    signals_for_peer: Arc<HandlerQueue<SignalMessage, SignalMessage>>,
    metrics: Arc<RelayMetrics>,
    ready: Signal<Result<Endpoint>>,
    stopped: Signal<()>,
    started: AtomicBool,
    stopping: AtomicBool,
}

impl Relay {
    /// Create a relay from a validated config and a peer transport. Call
    /// [`start`](Self::start) to bring it up, or use [`open`](Self::open).
    pub fn new(config: &RelayConfig, peer: Arc<dyn PeerTransport>) -> Arc<Self> {
        Arc::new(Self {
            server: TcpServer::new(config.listen.clone(), Some(config.max_connections)),
            peer,
            sessions: Arc::new(Mutex::new(HashMap::new())),
            signals_for_peer: Arc::new(HandlerQueue::new()),
            metrics: Arc::new(RelayMetrics::new()),
            ready: Signal::new(),
            stopped: Signal::new(),
            started: AtomicBool::new(false),
            stopping: AtomicBool::new(false),
        })
    }

    /// Construct and immediately start a relay.
    pub fn open(config: &RelayConfig, peer: Arc<dyn PeerTransport>) -> Result<Arc<Self>> {
        config.validate().map_err(Error::Config)?;
        let relay = Self::new(config, peer);
        relay.start()?;
        Ok(relay)
    }

    /// Wire the event handlers, kick off negotiation, and begin listening.
    /// May be called at most once.
    pub fn start(self: &Arc<Self>) -> Result<()> {
        if self.started.swap(true, Ordering::SeqCst) {
            return Err(Error::Misuse("start may only be called once"));
        }

        // Accepted connections become sessions.
        let relay = Arc::clone(self);
        self.server
            .connections_queue()
            .set_sync_handler(move |conn| {
                relay.make_session(Arc::clone(&conn));
                conn
            })?;

        // Peer events route to sessions by channel label.
        let relay = Arc::clone(self);
        self.peer
            .events()
            .set_sync_handler(move |ev| relay.dispatch_peer_event(ev))?;

        // Outbound signalling passes through to the embedder-facing queue.
        let signals = Arc::clone(&self.signals_for_peer);
        self.peer
            .signals_out()
            .set_sync_handler(move |msg| {
                let _ = signals.handle(msg);
            })?;

        // Negotiate the peer connection.
        let relay = Arc::clone(self);
        tokio::spawn(async move {
            if let Err(e) = relay.peer.negotiate().await {
                tracing::warn!("peer negotiation failed: {}", e);
                relay.ready.fulfill(Err(e));
                relay.initiate_shutdown();
            }
        });

        // Ready when both legs are up.
        let relay = Arc::clone(self);
        tokio::spawn(async move {
            let up = tokio::try_join!(relay.server.listen(), relay.peer.once_connected());
            match up {
                Ok((endpoint, ())) => {
                    tracing::info!("relay ready on {}", endpoint);
                    relay.ready.fulfill(Ok(endpoint));
                }
                Err(e) => {
                    relay.ready.fulfill(Err(e));
                    relay.initiate_shutdown();
                }
            }
        });

        // Either leg stopping ends the relay.
        let relay = Arc::clone(self);
        tokio::spawn(async move {
            relay.peer.once_disconnected().await;
            tracing::debug!("peer connection ended");
            relay.initiate_shutdown();
        });
        let relay = Arc::clone(self);
        tokio::spawn(async move {
            relay.server.once_shutdown().await;
            relay.initiate_shutdown();
        });

        Ok(())
    }

    fn make_session(self: &Arc<Self>, conn: Arc<TcpConnection>) {
        let session = Session::new(conn, Arc::clone(&self.peer), Arc::clone(&self.metrics));
        let label = session.label().to_string();
        let active = {
            let mut sessions = self.sessions.lock();
            sessions.insert(label.clone(), Arc::clone(&session));
            sessions.len()
        };
        tracing::debug!("session {} opened ({} active)", label, active);
        session.start();

        let sessions = Arc::clone(&self.sessions);
        let watched = Arc::clone(&session);
        tokio::spawn(async move {
            watched.once_closed().await;
            sessions.lock().remove(&label);
            tracing::debug!("session {} removed", label);
        });
    }

    fn dispatch_peer_event(&self, event: PeerEvent) {
        match event {
            PeerEvent::Data { label, frame } => {
                if label == CONTROL_CHANNEL_LABEL {
                    tracing::debug!("discarding control-channel message");
                    return;
                }
                if let ChannelFrame::Buffer(b) = &frame {
                    self.metrics.bytes_received_from_peer.record(b.len());
                }
                let session = self.sessions.lock().get(&label).cloned();
                match session {
                    Some(session) => {
                        let _ = session.peer_queue().handle(frame);
                    }
                    None => {
                        tracing::warn!("dropping frame for unknown channel {}", label);
                    }
                }
            }
            PeerEvent::ChannelClosed { label } => {
                let session = self.sessions.lock().get(&label).cloned();
                if let Some(session) = session {
                    session.on_channel_closed();
                }
            }
            PeerEvent::ChannelOpened { label } => {
                // The ingress side opens its own channels; a remote open is
                // not part of the protocol.
                tracing::debug!("ignoring remote channel open for {}", label);
            }
        }
    }

    /// Feed a signalling message received from the remote peer.
    pub fn handle_signal_from_peer(&self, msg: SignalMessage) -> Result<()> {
        self.peer.handle_signal(msg)
    }

    /// Outbound signalling messages for the embedder to transport.
    pub fn signals_for_peer(&self) -> &Arc<HandlerQueue<SignalMessage, SignalMessage>> {
        &self.signals_for_peer
    }

    /// Byte counters, shared with all sessions.
    pub fn metrics(&self) -> &Arc<RelayMetrics> {
        &self.metrics
    }

    /// The owned TCP server.
    pub fn server(&self) -> &Arc<TcpServer> {
        &self.server
    }

    /// Number of active sessions.
    pub fn session_count(&self) -> usize {
        self.sessions.lock().len()
    }

    /// Resolves with the bound endpoint when both legs are up, or with the
    /// first startup failure.
    pub async fn once_ready(&self) -> Result<Endpoint> {
        self.ready.wait().await
    }

    /// Resolves after shutdown has completed. A relay stops at most once.
    pub async fn once_stopped(&self) {
        self.stopped.wait().await
    }

    /// Stop the relay and wait for shutdown to complete. Idempotent.
    pub async fn stop(self: &Arc<Self>) {
        self.initiate_shutdown();
        self.stopped.wait().await
    }

    fn initiate_shutdown(self: &Arc<Self>) {
        if self.stopping.swap(true, Ordering::SeqCst) {
            return;
        }
        tracing::info!("relay stopping");
        let relay = Arc::clone(self);
        tokio::spawn(async move {
            tokio::join!(relay.server.shutdown(), relay.peer.close());
            relay.stopped.fulfill(());
            tracing::info!("relay stopped");
        });
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::{TcpListener, TcpStream};
    use tokio::time::timeout;

    use crate::egress::Egress;
    use crate::peer::pair;

    use super::*;

    fn test_config() -> RelayConfig {
        RelayConfig::new(Endpoint::new("127.0.0.1", 0))
    }

    /// Spawn a TCP server that echoes everything back, once, per client.
    async fn spawn_echo_target() -> Endpoint {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let ep = Endpoint::from(listener.local_addr().unwrap());
        tokio::spawn(async move {
            loop {
                let Ok((mut stream, _)) = listener.accept().await else {
                    break;
                };
                tokio::spawn(async move {
                    let mut buf = [0u8; 1024];
                    while let Ok(n) = stream.read(&mut buf).await {
                        if n == 0 || stream.write_all(&buf[..n]).await.is_err() {
                            break;
                        }
                    }
                });
            }
        });
        ep
    }

    async fn socks_connect(relay_ep: &Endpoint, target: &Endpoint) -> TcpStream {
        let mut client = TcpStream::connect(relay_ep.to_string()).await.unwrap();
        client.write_all(&[0x05, 0x01, 0x00]).await.unwrap();
        let mut reply = [0u8; 2];
        client.read_exact(&mut reply).await.unwrap();
        assert_eq!(reply, [0x05, 0x00]);

        let mut request = vec![0x05, 0x01, 0x00, 0x03, target.address.len() as u8];
        request.extend_from_slice(target.address.as_bytes());
        request.extend_from_slice(&target.port.to_be_bytes());
        client.write_all(&request).await.unwrap();

        let mut reply = [0u8; 10];
        client.read_exact(&mut reply).await.unwrap();
        assert_eq!(&reply[..4], &[0x05, 0x00, 0x00, 0x01]);
        client
    }

    async fn wait_until(mut cond: impl FnMut() -> bool) {
        timeout(Duration::from_secs(2), async {
            while !cond() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("condition not reached in time");
    }

    #[tokio::test]
    async fn test_happy_path_round_trip() {
        let target = spawn_echo_target().await;

        let (left, right) = pair();
        let _egress = Egress::start(right).unwrap();
        let relay = Relay::open(&test_config(), left).unwrap();

        let bound = relay.once_ready().await.unwrap();
        assert_ne!(bound.port, 0);

        let mut client = socks_connect(&bound, &target).await;
        assert_eq!(relay.session_count(), 1);
        let conn = relay.server().connections().pop().unwrap();

        client.write_all(b"PING").await.unwrap();
        let mut echo = [0u8; 4];
        client.read_exact(&mut echo).await.unwrap();
        assert_eq!(&echo, b"PING");

        assert_eq!(relay.metrics().bytes_sent_to_peer.total(), 4);
        assert_eq!(relay.metrics().bytes_received_from_peer.total(), 4);

        drop(client);
        wait_until(|| relay.session_count() == 0).await;
        assert_eq!(conn.once_closed().await, crate::net::SocketCloseKind::RemotelyClosed);

        relay.stop().await;
    }

    #[tokio::test]
    async fn test_concurrent_clients_get_independent_sessions() {
        let target = spawn_echo_target().await;

        let (left, right) = pair();
        let _egress = Egress::start(right).unwrap();
        let relay = Relay::open(&test_config(), left).unwrap();
        let bound = relay.once_ready().await.unwrap();

        let mut a = socks_connect(&bound, &target).await;
        let mut b = socks_connect(&bound, &target).await;
        assert_eq!(relay.session_count(), 2);

        a.write_all(b"aaa").await.unwrap();
        b.write_all(b"bb").await.unwrap();

        let mut buf_a = [0u8; 3];
        a.read_exact(&mut buf_a).await.unwrap();
        assert_eq!(&buf_a, b"aaa");
        let mut buf_b = [0u8; 2];
        b.read_exact(&mut buf_b).await.unwrap();
        assert_eq!(&buf_b, b"bb");

        assert_eq!(relay.metrics().bytes_sent_to_peer.total(), 5);
        relay.stop().await;
    }

    #[tokio::test]
    async fn test_peer_disconnect_stops_relay_and_sessions() {
        let target = spawn_echo_target().await;

        let (left, right) = pair();
        let _egress = Egress::start(Arc::clone(&right) as Arc<dyn PeerTransport>).unwrap();
        let relay = Relay::open(&test_config(), left).unwrap();
        let bound = relay.once_ready().await.unwrap();

        let mut client = socks_connect(&bound, &target).await;

        // The peer connection drops mid-stream.
        right.close().await;

        relay.once_stopped().await;
        assert!(relay.server().is_shutdown());
        wait_until(|| relay.session_count() == 0).await;

        // The client socket ends up closed.
        let mut buf = [0u8; 1];
        assert_eq!(client.read(&mut buf).await.unwrap_or(0), 0);
    }

    #[tokio::test]
    async fn test_bind_failure_fails_ready_and_stops() {
        // Occupy a port.
        let occupied = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let ep = Endpoint::from(occupied.local_addr().unwrap());

        let (left, right) = pair();
        let _egress = Egress::start(right).unwrap();
        let relay = Relay::open(&RelayConfig::new(ep), left).unwrap();

        assert!(relay.once_ready().await.is_err());
        relay.once_stopped().await;
    }

    #[tokio::test]
    async fn test_start_twice_is_misuse() {
        let (left, right) = pair();
        let _egress = Egress::start(right).unwrap();
        let relay = Relay::open(&test_config(), left).unwrap();
        assert!(matches!(relay.start(), Err(Error::Misuse(_))));
        relay.stop().await;
    }

    #[tokio::test]
    async fn test_stop_is_idempotent() {
        let (left, right) = pair();
        let _egress = Egress::start(right).unwrap();
        let relay = Relay::open(&test_config(), left).unwrap();
        relay.once_ready().await.unwrap();

        relay.stop().await;
        relay.stop().await;
    }

    #[tokio::test]
    async fn test_unknown_channel_frame_is_dropped_not_fatal() {
        let target = spawn_echo_target().await;

        let (left, right) = pair();
        let _egress = Egress::start(Arc::clone(&right) as Arc<dyn PeerTransport>).unwrap();
        let relay = Relay::open(&test_config(), Arc::clone(&left) as Arc<dyn PeerTransport>)
            .unwrap();
        let bound = relay.once_ready().await.unwrap();

        // A frame for a label no session owns: logged and discarded.
        right.open_channel("zz99").await.unwrap();
        right
            .send("zz99", ChannelFrame::Buffer(bytes::Bytes::from_static(b"x")))
            .unwrap();

        // The relay keeps proxying.
        let mut client = socks_connect(&bound, &target).await;
        client.write_all(b"ok").await.unwrap();
        let mut buf = [0u8; 2];
        client.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ok");

        relay.stop().await;
    }
}
