//! SOCKS5 wire codec (RFC 1928 subset: no-auth CONNECT).
//!
//! Pure functions over byte buffers. Each parser consumes one complete
//! protocol record; the two handshake records are assumed to arrive
//! unfragmented, one per TCP segment, matching how common SOCKS clients
//! behave. Fragmented handshakes fail parsing and close the session.

use std::net::IpAddr;

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::net::Endpoint;

/// Protocol version byte.
pub const VERSION: u8 = 0x05;
/// "No authentication required" method.
pub const METHOD_NOAUTH: u8 = 0x00;
/// CONNECT command.
pub const CMD_CONNECT: u8 = 0x01;
/// Reply code: succeeded.
pub const REPLY_SUCCEEDED: u8 = 0x00;

const ATYP_IPV4: u8 = 0x01;
const ATYP_DOMAIN: u8 = 0x03;
const ATYP_IPV6: u8 = 0x04;

/// SOCKS commands understood by the relay.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Command {
    /// Establish an outbound TCP connection.
    Connect,
}

/// A decoded SOCKS5 request, also the JSON handshake frame sent to the
/// egress peer over the data channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SocksRequest {
    /// The requested command.
    pub command: Command,
    /// The target the client wants to reach.
    #[serde(flatten)]
    pub target: Endpoint,
}

/// Parse the client greeting: version, method count, offered auth methods.
pub fn parse_auth_methods(buf: &[u8]) -> Result<Vec<u8>> {
    if buf.len() < 2 {
        return Err(Error::invalid(format!("greeting too short: {} bytes", buf.len())));
    }
    if buf[0] != VERSION {
        return Err(Error::invalid(format!("not SOCKS5: version 0x{:02x}", buf[0])));
    }
    let count = buf[1] as usize;
    if buf.len() != 2 + count {
        return Err(Error::invalid(format!(
            "greeting length mismatch: {} methods, {} bytes",
            count,
            buf.len()
        )));
    }
    Ok(buf[2..].to_vec())
}

/// Compose the method-selection reply choosing "no authentication".
pub fn compose_auth_reply() -> Bytes {
    Bytes::from_static(&[VERSION, METHOD_NOAUTH])
}

/// Parse a SOCKS5 request record into a [`SocksRequest`].
///
/// Only CONNECT is supported; BIND and UDP ASSOCIATE fail with a protocol
/// error.
pub fn parse_request(buf: &[u8]) -> Result<SocksRequest> {
    if buf.len() < 4 {
        return Err(Error::invalid(format!("request too short: {} bytes", buf.len())));
    }
    if buf[0] != VERSION {
        return Err(Error::invalid(format!("not SOCKS5: version 0x{:02x}", buf[0])));
    }
    if buf[1] != CMD_CONNECT {
        return Err(Error::protocol(format!("unsupported command: 0x{:02x}", buf[1])));
    }
    if buf[2] != 0x00 {
        return Err(Error::invalid("nonzero reserved byte"));
    }

    let (address, rest) = match buf[3] {
        ATYP_IPV4 => {
            if buf.len() < 8 {
                return Err(Error::invalid("IPv4 request truncated"));
            }
            let ip = format!("{}.{}.{}.{}", buf[4], buf[5], buf[6], buf[7]);
            (ip, &buf[8..])
        }
        ATYP_DOMAIN => {
            if buf.len() < 5 {
                return Err(Error::invalid("domain request truncated"));
            }
            let len = buf[4] as usize;
            if buf.len() < 5 + len {
                return Err(Error::invalid("domain request truncated"));
            }
            let domain = std::str::from_utf8(&buf[5..5 + len])
                .map_err(|_| Error::invalid("domain is not valid UTF-8"))?
                .to_string();
            (domain, &buf[5 + len..])
        }
        ATYP_IPV6 => {
            if buf.len() < 20 {
                return Err(Error::invalid("IPv6 request truncated"));
            }
            let mut segments = [0u16; 8];
            for (i, seg) in segments.iter_mut().enumerate() {
                *seg = u16::from_be_bytes([buf[4 + i * 2], buf[5 + i * 2]]);
            }
            let ip = std::net::Ipv6Addr::new(
                segments[0], segments[1], segments[2], segments[3], segments[4], segments[5],
                segments[6], segments[7],
            );
            (ip.to_string(), &buf[20..])
        }
        other => {
            return Err(Error::protocol(format!("unknown address type: 0x{:02x}", other)));
        }
    };

    if rest.len() != 2 {
        return Err(Error::invalid("request length mismatch"));
    }
    let port = u16::from_be_bytes([rest[0], rest[1]]);

    Ok(SocksRequest {
        command: Command::Connect,
        target: Endpoint::new(address, port),
    })
}

/// Compose the 10-byte (IPv4), 22-byte (IPv6), or variable-length (domain)
/// success reply carrying the endpoint the remote side actually reached.
pub fn compose_success_reply(endpoint: &Endpoint) -> Result<Bytes> {
    let mut buf = vec![VERSION, REPLY_SUCCEEDED, 0x00];
    match endpoint.address.parse::<IpAddr>() {
        Ok(IpAddr::V4(ip)) => {
            buf.push(ATYP_IPV4);
            buf.extend_from_slice(&ip.octets());
        }
        Ok(IpAddr::V6(ip)) => {
            buf.push(ATYP_IPV6);
            buf.extend_from_slice(&ip.octets());
        }
        Err(_) => {
            let name = endpoint.address.as_bytes();
            if name.len() > 255 {
                return Err(Error::invalid("domain name longer than 255 bytes"));
            }
            buf.push(ATYP_DOMAIN);
            buf.push(name.len() as u8);
            buf.extend_from_slice(name);
        }
    }
    buf.extend_from_slice(&endpoint.port.to_be_bytes());
    Ok(Bytes::from(buf))
}
