//! # sprelay
//!
//! A SOCKS5 relay that tunnels client TCP traffic over a peer-to-peer
//! data-channel transport. A local TCP server accepts SOCKS5 clients; each
//! accepted connection is bound to a freshly-labeled data channel on a
//! single peer connection, through which the request is forwarded to a
//! remote egress peer that performs the actual outbound TCP connection.
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────┐
//! │                         Relay                            │
//! │  ┌──────────────┐   ┌───────────────┐   ┌────────────┐   │
//! │  │  TcpServer   │   │   Sessions    │   │   Peer     │   │
//! │  │  (SOCKS5     │──▶│  (one client  │──▶│ Transport  │   │
//! │  │   listener)  │   │   ↔ channel)  │   │ (channels) │   │
//! │  └──────────────┘   └───────────────┘   └─────┬──────┘   │
//! └────────────────────────────────────────────────┼─────────┘
//!                                                  │ frames
//! ┌────────────────────────────────────────────────┼─────────┐
//! │                        Egress                  ▼         │
//! │        request in ──▶ dial target ──▶ relay buffers      │
//! └──────────────────────────────────────────────────────────┘
//! ```
//!
//! Everything push-style (socket reads, accepted connections, channel
//! frames) flows through [`queue::HandlerQueue`], the crate's single
//! concurrency adapter; lifecycle edges are [`queue::Signal`]s that fulfill
//! exactly once. The peer connection itself (ICE/DTLS/SCTP, obfuscation) is
//! behind the [`peer::PeerTransport`] trait; an in-process
//! [`peer::pair`] backs tests and the standalone binary.

#![deny(unsafe_code)]
#![warn(missing_docs, rust_2018_idioms)]

pub mod config;
pub mod egress;
pub mod error;
pub mod metrics;
pub mod net;
pub mod peer;
pub mod queue;
pub mod relay;
pub mod session;
pub mod socks;

pub use config::{RelayConfig, RelayConfigFile};
pub use error::{Error, Result};
pub use net::{Endpoint, SocketCloseKind, TcpConnection, TcpServer};
pub use relay::Relay;
pub use session::Session;
