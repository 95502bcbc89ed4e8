//! In-process transport pair.
//!
//! Two linked [`PeerTransport`] endpoints delivering frames and channel
//! events to each other in order, with negotiation reduced to a local
//! handshake. Backs the standalone binary and the end-to-end tests.

use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;

use crate::error::{Error, Result};
use crate::peer::{ChannelFrame, PeerEvent, PeerTransport, SignalMessage};
use crate::queue::{HandlerQueue, Signal};

/// Shared state of a linked pair.
struct Link {
    connected: Signal<Result<()>>,
    disconnected: Signal<()>,
    channels: Mutex<HashSet<String>>,
}

/// One endpoint of an in-process transport pair.
pub struct PairTransport {
    name: &'static str,
    link: Arc<Link>,
    local_events: Arc<HandlerQueue<PeerEvent, ()>>,
    remote_events: Arc<HandlerQueue<PeerEvent, ()>>,
    signals_out: Arc<HandlerQueue<SignalMessage, ()>>,
}

/// Create two linked transports. Frames sent on one surface as events on
/// the other.
pub fn pair() -> (Arc<PairTransport>, Arc<PairTransport>) {
    let link = Arc::new(Link {
        connected: Signal::new(),
        disconnected: Signal::new(),
        channels: Mutex::new(HashSet::new()),
    });
    let left_events: Arc<HandlerQueue<PeerEvent, ()>> = Arc::new(HandlerQueue::new());
    let right_events: Arc<HandlerQueue<PeerEvent, ()>> = Arc::new(HandlerQueue::new());

    let left = Arc::new(PairTransport {
        name: "left",
        link: Arc::clone(&link),
        local_events: Arc::clone(&left_events),
        remote_events: Arc::clone(&right_events),
        signals_out: Arc::new(HandlerQueue::new()),
    });
    let right = Arc::new(PairTransport {
        name: "right",
        link,
        local_events: right_events,
        remote_events: left_events,
        signals_out: Arc::new(HandlerQueue::new()),
    });
    (left, right)
}

impl PairTransport {
    fn ensure_up(&self) -> Result<()> {
        if self.link.disconnected.is_fulfilled() {
            return Err(Error::transport("peer connection closed"));
        }
        if !self.link.connected.is_fulfilled() {
            return Err(Error::transport("peer connection not negotiated"));
        }
        Ok(())
    }
}

#[async_trait]
impl PeerTransport for PairTransport {
    async fn negotiate(&self) -> Result<()> {
        // Both endpoints live in one process: negotiation is immediate.
        self.link.connected.fulfill(Ok(()));
        tracing::debug!("pair transport {}: negotiated", self.name);
        Ok(())
    }

    async fn once_connected(&self) -> Result<()> {
        self.link.connected.wait().await
    }

    async fn once_disconnected(&self) {
        self.link.disconnected.wait().await
    }

    async fn open_channel(&self, label: &str) -> Result<()> {
        self.ensure_up()?;
        let inserted = self.link.channels.lock().insert(label.to_string());
        if !inserted {
            return Err(Error::transport(format!("channel {} already open", label)));
        }
        let _ = self.remote_events.handle(PeerEvent::ChannelOpened {
            label: label.to_string(),
        });
        Ok(())
    }

    fn send(&self, label: &str, frame: ChannelFrame) -> Result<()> {
        self.ensure_up()?;
        if !self.link.channels.lock().contains(label) {
            return Err(Error::transport(format!("channel {} is not open", label)));
        }
        let _ = self.remote_events.handle(PeerEvent::Data {
            label: label.to_string(),
            frame,
        });
        Ok(())
    }

    fn close_channel(&self, label: &str) {
        if !self.link.channels.lock().remove(label) {
            return;
        }
        let closed = PeerEvent::ChannelClosed {
            label: label.to_string(),
        };
        let _ = self.local_events.handle(closed.clone());
        let _ = self.remote_events.handle(closed);
    }

    async fn close(&self) {
        if !self.link.disconnected.fulfill(()) {
            return;
        }
        tracing::debug!("pair transport {}: closed", self.name);
        let labels: Vec<String> = self.link.channels.lock().drain().collect();
        for label in labels {
            let closed = PeerEvent::ChannelClosed { label };
            let _ = self.local_events.handle(closed.clone());
            let _ = self.remote_events.handle(closed);
        }
    }

    fn events(&self) -> Arc<HandlerQueue<PeerEvent, ()>> {
        Arc::clone(&self.local_events)
    }

    fn signals_out(&self) -> Arc<HandlerQueue<SignalMessage, ()>> {
        Arc::clone(&self.signals_out)
    }

    fn handle_signal(&self, _msg: SignalMessage) -> Result<()> {
        // Signalling loops back internally; nothing to apply.
        tracing::debug!("pair transport {}: ignoring external signal", self.name);
        Ok(())
    }
}
