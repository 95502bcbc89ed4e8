//! TCP connection and server abstractions.
//!
//! Wraps tokio sockets in lifecycle-aware entities: each connection exposes
//! its state machine, an inbound byte queue, ordered buffered writes, and
//! exactly-once close signalling; the server owns the accept loop, the
//! connection registry, and admission control.

mod connection;
mod server;

pub use connection::{SocketKind, TcpConnection, WriteInfo};
pub use server::{TcpServer, DEFAULT_MAX_CONNECTIONS};

use std::fmt;
use std::net::SocketAddr;

use serde::{Deserialize, Serialize};

/// A TCP host:port pair, used both for bound/listening addresses and for
/// SOCKS targets. Serialized as JSON in the data-channel handshake.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Endpoint {
    /// Host address: an IP literal or a domain name.
    pub address: String,
    /// TCP port.
    pub port: u16,
}

impl Endpoint {
    /// Create an endpoint from an address string and port.
    pub fn new(address: impl Into<String>, port: u16) -> Self {
        Self {
            address: address.into(),
            port,
        }
    }
}

impl From<SocketAddr> for Endpoint {
    fn from(addr: SocketAddr) -> Self {
        Self {
            address: addr.ip().to_string(),
            port: addr.port(),
        }
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.address, self.port)
    }
}

/// Local and peer addresses of an established connection. Either field may
/// be absent if the socket could not report it.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConnectionInfo {
    /// The locally bound endpoint.
    pub bound: Option<Endpoint>,
    /// The remote peer's endpoint.
    pub remote: Option<Endpoint>,
}

/// How a socket's lifetime ended. Emitted exactly once per socket.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SocketCloseKind {
    /// The local side requested the close.
    WeClosedIt,
    /// The remote side closed the connection.
    RemotelyClosed,
    /// The socket never reached the connected state.
    NeverConnected,
    /// The connection ended for an unclassified reason (I/O error).
    Unknown,
}

/// Connection lifecycle states.
///
/// `Connecting → Connected → Closed`; `Connecting → Error` and
/// `Connected → Error` on failure. `Closed` and `Error` are terminal. A
/// connection adopted from an accepted socket starts in `Connected`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Outbound connect in progress.
    Connecting,
    /// Byte streams are live.
    Connected,
    /// Cleanly closed; terminal.
    Closed,
    /// Failed before or during use; terminal.
    Error,
}
