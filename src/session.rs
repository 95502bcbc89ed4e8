//! One proxied client: a TCP connection bound to one data channel.
//!
//! The session drives the SOCKS5 handshake on the TCP side, exchanges the
//! request/endpoint handshake with the egress peer over its channel, then
//! forwards bytes in both directions until either leg closes. On a SOCKS
//! or peer handshake failure the TCP socket is closed without a SOCKS
//! error reply.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::Mutex;

use crate::error::{Error, Result};
use crate::metrics::RelayMetrics;
use crate::net::{Endpoint, TcpConnection};
use crate::peer::{ChannelFrame, PeerTransport};
use crate::queue::{HandlerQueue, Signal};
use crate::socks;

/// Process-global counter for channel labels.
static NEXT_CHANNEL_LABEL: AtomicU64 = AtomicU64::new(0);

/// Session lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Waiting for the client greeting / channel open.
    HandshakeAuth,
    /// Waiting for the CONNECT request and the peer's endpoint reply.
    HandshakeRequest,
    /// Forwarding bytes.
    Ready,
    /// Both legs closed; terminal.
    Closed,
}

/// One SOCKS client relayed over one data channel.
pub struct Session {
    label: String,
    conn: Arc<TcpConnection>,
    peer: Arc<dyn PeerTransport>,
    peer_rx: Arc<HandlerQueue<ChannelFrame, ChannelFrame>>,
    state: Mutex<SessionState>,
    data_channel_closed: AtomicBool,
    tcp_closed: AtomicBool,
    closing: AtomicBool,
    ready: Signal<Result<Endpoint>>,
    closed: Signal<()>,
    metrics: Arc<RelayMetrics>,
}

impl Session {
    /// Create a session over an accepted connection, assigning it a fresh
    /// channel label.
    pub fn new(
        conn: Arc<TcpConnection>,
        peer: Arc<dyn PeerTransport>,
        metrics: Arc<RelayMetrics>,
    ) -> Arc<Self> {
        let label = format!("c{}", NEXT_CHANNEL_LABEL.fetch_add(1, Ordering::Relaxed));
        Arc::new(Self {
            label,
            conn,
            peer,
            peer_rx: Arc::new(HandlerQueue::new()),
            state: Mutex::new(SessionState::HandshakeAuth),
            data_channel_closed: AtomicBool::new(false),
            tcp_closed: AtomicBool::new(false),
            closing: AtomicBool::new(false),
            ready: Signal::new(),
            closed: Signal::new(),
            metrics,
        })
    }

    /// The session's channel label, e.g. `c0`.
    pub fn label(&self) -> &str {
        &self.label
    }

    /// Current lifecycle state.
    pub fn state(&self) -> SessionState {
        *self.state.lock()
    }

    /// Whether the session has fully closed.
    pub fn is_closed(&self) -> bool {
        self.closed.is_fulfilled()
    }

    /// Resolves with the endpoint the peer reached once the handshake, the
    /// channel open, and the peer connect reply have all completed.
    pub async fn once_ready(&self) -> Result<Endpoint> {
        self.ready.wait().await
    }

    /// Resolves after both the TCP connection and the data channel closed.
    pub async fn once_closed(&self) {
        self.closed.wait().await
    }

    /// The queue of data-channel frames addressed to this session. The
    /// relay feeds it; during the handshake the session pulls from it, and
    /// after readiness a forwarder consumes it.
    pub fn peer_queue(&self) -> &Arc<HandlerQueue<ChannelFrame, ChannelFrame>> {
        &self.peer_rx
    }

    /// Kick off the handshake and lifecycle watchers.
    pub fn start(self: &Arc<Self>) {
        let session = Arc::clone(self);
        tokio::spawn(async move {
            session.conn.once_closed().await;
            session.tcp_closed.store(true, Ordering::SeqCst);
            session.close();
        });

        let session = Arc::clone(self);
        tokio::spawn(async move { session.run().await });
    }

    async fn run(self: Arc<Self>) {
        match self.handshake().await {
            Ok(endpoint) => {
                self.install_forwarders();
                *self.state.lock() = SessionState::Ready;
                self.ready.fulfill(Ok(endpoint.clone()));
                tracing::debug!("session {} ready, reached {}", self.label, endpoint);
            }
            Err(e) => {
                tracing::debug!("session {} handshake failed: {}", self.label, e);
                self.ready.fulfill(Err(e));
                self.close();
            }
        }
    }

    async fn handshake(&self) -> Result<Endpoint> {
        // Channel open and SOCKS auth negotiation proceed concurrently.
        tokio::try_join!(self.peer.open_channel(&self.label), self.negotiate_auth())?;
        *self.state.lock() = SessionState::HandshakeRequest;

        let buf = self.conn.receive_next().await?;
        let request = socks::parse_request(&buf)?;
        tracing::debug!("session {}: connect request for {}", self.label, request.target);

        self.peer.send(
            &self.label,
            ChannelFrame::Str(serde_json::to_string(&request)?),
        )?;

        let reply = self.peer_rx.set_sync_next_handler(|frame| frame).await?;
        let endpoint = match reply {
            ChannelFrame::Str(s) => serde_json::from_str::<Endpoint>(&s)
                .map_err(|e| Error::protocol(format!("malformed endpoint reply: {}", e)))?,
            ChannelFrame::Buffer(_) => {
                return Err(Error::protocol("expected textual endpoint reply, got binary"));
            }
        };

        self.conn
            .send(socks::compose_success_reply(&endpoint)?)
            .await?;
        Ok(endpoint)
    }

    /// Read the client greeting and select "no authentication". The
    /// greeting is assumed to arrive in a single buffer.
    async fn negotiate_auth(&self) -> Result<()> {
        let buf = self.conn.receive_next().await?;
        let methods = socks::parse_auth_methods(&buf)?;
        if !methods.contains(&socks::METHOD_NOAUTH) {
            return Err(Error::protocol("client offers no acceptable auth method"));
        }
        self.conn.send(socks::compose_auth_reply()).await?;
        Ok(())
    }

    fn install_forwarders(&self) {
        // TCP inbound -> peer, as binary frames.
        let peer = Arc::clone(&self.peer);
        let label = self.label.clone();
        let metrics = Arc::clone(&self.metrics);
        if let Err(e) = self.conn.inbound().set_sync_handler(move |buf: Bytes| {
            metrics.bytes_sent_to_peer.record(buf.len());
            if let Err(e) = peer.send(&label, ChannelFrame::Buffer(buf.clone())) {
                tracing::debug!("session {}: forward to peer failed: {}", label, e);
            }
            buf
        }) {
            tracing::warn!("session {}: inbound forwarder rejected: {}", self.label, e);
        }

        // Peer frames -> TCP. Only binary frames are valid in this phase;
        // stray text is dropped without closing the session.
        let conn = Arc::clone(&self.conn);
        let label = self.label.clone();
        if let Err(e) = self.peer_rx.set_sync_handler(move |frame: ChannelFrame| {
            match &frame {
                ChannelFrame::Buffer(b) => conn.send_nowait(b.clone()),
                ChannelFrame::Str(_) => {
                    tracing::warn!("session {}: dropping text frame after handshake", label);
                }
            }
            frame
        }) {
            tracing::warn!("session {}: peer forwarder rejected: {}", self.label, e);
        }
    }

    /// Called by the relay when the transport reports this session's
    /// channel closed.
    pub fn on_channel_closed(&self) {
        self.data_channel_closed.store(true, Ordering::SeqCst);
        self.close();
    }

    /// Close both legs. Idempotent: each leg's close side-effect is issued
    /// at most once.
    pub fn close(&self) {
        if !self.closing.swap(true, Ordering::SeqCst) {
            tracing::debug!("session {}: closing", self.label);
        }

        if !self.conn.is_terminal() {
            let conn = Arc::clone(&self.conn);
            tokio::spawn(async move {
                conn.close().await;
            });
        }

        // Flag first, so the ChannelClosed echo does not re-enter.
        if !self.data_channel_closed.swap(true, Ordering::SeqCst) {
            self.peer.close_channel(&self.label);
        }

        // Fail any handshake waiter still parked on the peer queue.
        self.peer_rx.stop_handling();
        self.maybe_finish();
    }

    fn maybe_finish(&self) {
        if self.tcp_closed.load(Ordering::SeqCst)
            && self.data_channel_closed.load(Ordering::SeqCst)
            && !self.closed.is_fulfilled()
        {
            *self.state.lock() = SessionState::Closed;
            self.closed.fulfill(());
            tracing::debug!("session {} closed", self.label);
        }
    }
}
