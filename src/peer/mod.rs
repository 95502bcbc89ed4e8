//! Peer-connection transport interface.
//!
//! The relay treats the peer connection (ICE/DTLS/SCTP, obfuscation, ...)
//! as a black box behind [`PeerTransport`]: labeled data channels carrying
//! discrete frames that are either binary buffers or text, lifetime signals,
//! and an opaque signalling stream the embedder shuttles out of band.

mod pair;

pub use pair::{pair, PairTransport};

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;

use crate::error::Result;
use crate::queue::HandlerQueue;

/// Reserved label for out-of-band control strings; never dispatched to a
/// session.
pub const CONTROL_CHANNEL_LABEL: &str = "_control_";

/// One discrete frame on a data channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelFrame {
    /// Textual control/handshake payload.
    Str(String),
    /// Forwarded TCP payload.
    Buffer(Bytes),
}

impl ChannelFrame {
    /// Payload length in bytes.
    pub fn len(&self) -> usize {
        match self {
            ChannelFrame::Str(s) => s.len(),
            ChannelFrame::Buffer(b) => b.len(),
        }
    }

    /// Whether the frame carries no payload.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Whether the frame is a binary buffer.
    pub fn is_binary(&self) -> bool {
        matches!(self, ChannelFrame::Buffer(_))
    }
}

/// Events produced by the transport for its consumer.
#[derive(Debug, Clone)]
pub enum PeerEvent {
    /// The remote side opened a channel with this label.
    ChannelOpened {
        /// Channel label.
        label: String,
    },
    /// A frame arrived on a channel.
    Data {
        /// Channel label.
        label: String,
        /// The frame.
        frame: ChannelFrame,
    },
    /// A channel was closed.
    ChannelClosed {
        /// Channel label.
        label: String,
    },
}

/// Opaque out-of-band message used to negotiate the peer connection; not
/// interpreted by the relay.
pub type SignalMessage = serde_json::Value;

/// A bidirectional peer transport with multiple labeled data channels.
///
/// Implementations deliver [`PeerEvent`]s on [`events`](Self::events) in
/// arrival order and produce outbound signalling on
/// [`signals_out`](Self::signals_out). `send` and `close_channel` are
/// synchronous enqueue operations, matching data-channel semantics where
/// the transport buffers internally.
#[async_trait]
pub trait PeerTransport: Send + Sync {
    /// Start connection negotiation. Progress surfaces as signalling
    /// messages and, eventually, [`once_connected`](Self::once_connected).
    async fn negotiate(&self) -> Result<()>;

    /// Resolves once the transport is connected, or fails if negotiation
    /// does.
    async fn once_connected(&self) -> Result<()>;

    /// Resolves when the transport's lifetime ends. Teardown is terminal;
    /// there is no reconnect.
    async fn once_disconnected(&self);

    /// Open a data channel with the given label; resolves when the channel
    /// is usable.
    async fn open_channel(&self, label: &str) -> Result<()>;

    /// Send one frame on a channel.
    fn send(&self, label: &str, frame: ChannelFrame) -> Result<()>;

    /// Close one data channel. The transport echoes a
    /// [`PeerEvent::ChannelClosed`] to both sides.
    fn close_channel(&self, label: &str);

    /// Tear the whole transport down.
    async fn close(&self);

    /// The inbound event queue (single-consumer).
    fn events(&self) -> Arc<HandlerQueue<PeerEvent, ()>>;

    /// Outbound signalling messages for the embedder to deliver.
    fn signals_out(&self) -> Arc<HandlerQueue<SignalMessage, ()>>;

    /// Feed a signalling message received from the remote peer.
    fn handle_signal(&self, msg: SignalMessage) -> Result<()>;
}
