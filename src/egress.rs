//! Egress peer: the remote end of the tunnel.
//!
//! For each data channel the ingress relay opens, the egress awaits the
//! JSON-encoded request, dials the target, replies with the endpoint it
//! actually reached, then relays buffers bidirectionally. A connect
//! failure closes the channel without a reply, which the ingress session
//! surfaces as a closed client socket.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::error::{Error, Result};
use crate::net::TcpConnection;
use crate::peer::{ChannelFrame, PeerEvent, PeerTransport, CONTROL_CHANNEL_LABEL};
use crate::queue::HandlerQueue;
use crate::socks::SocksRequest;

/// Per-channel link: the frame queue and, once dialed, the outbound
/// connection.
struct Link {
    frames: Arc<HandlerQueue<ChannelFrame, ChannelFrame>>,
    conn: Mutex<Option<Arc<TcpConnection>>>,
}

/// Server-side relay opening outbound TCP connections on behalf of proxied
/// clients.
pub struct Egress {
    peer: Arc<dyn PeerTransport>,
    links: Arc<Mutex<HashMap<String, Arc<Link>>>>,
}

impl Egress {
    /// Attach to a transport and start serving channels. Fails if the
    /// transport's event queue already has a consumer.
    pub fn start(peer: Arc<dyn PeerTransport>) -> Result<Arc<Self>> {
        let egress = Arc::new(Self {
            peer: Arc::clone(&peer),
            links: Arc::new(Mutex::new(HashMap::new())),
        });

        let handler = Arc::clone(&egress);
        peer.events()
            .set_sync_handler(move |ev| handler.dispatch(ev))?;

        let negotiator = Arc::clone(&peer);
        tokio::spawn(async move {
            if let Err(e) = negotiator.negotiate().await {
                tracing::warn!("egress negotiation failed: {}", e);
            }
        });

        let teardown = Arc::clone(&egress);
        tokio::spawn(async move {
            teardown.peer.once_disconnected().await;
            teardown.close_all();
        });

        Ok(egress)
    }

    /// Number of live channels.
    pub fn link_count(&self) -> usize {
        self.links.lock().len()
    }

    fn dispatch(self: &Arc<Self>, event: PeerEvent) {
        match event {
            PeerEvent::ChannelOpened { label } => {
                let link = Arc::new(Link {
                    frames: Arc::new(HandlerQueue::new()),
                    conn: Mutex::new(None),
                });
                self.links.lock().insert(label.clone(), Arc::clone(&link));
                tracing::debug!("egress: channel {} opened", label);

                let egress = Arc::clone(self);
                tokio::spawn(async move {
                    if let Err(e) = egress.serve_channel(&label, Arc::clone(&link)).await {
                        tracing::debug!("egress: channel {} failed: {}", label, e);
                        egress.drop_link(&label);
                    }
                });
            }
            PeerEvent::Data { label, frame } => {
                if label == CONTROL_CHANNEL_LABEL {
                    tracing::debug!("egress: discarding control-channel message");
                    return;
                }
                let link = self.links.lock().get(&label).cloned();
                match link {
                    Some(link) => {
                        let _ = link.frames.handle(frame);
                    }
                    None => tracing::warn!("egress: dropping frame for unknown channel {}", label),
                }
            }
            PeerEvent::ChannelClosed { label } => {
                if let Some(link) = self.links.lock().remove(&label) {
                    tracing::debug!("egress: channel {} closed", label);
                    link.frames.stop_handling();
                    if let Some(conn) = link.conn.lock().take() {
                        tokio::spawn(async move {
                            conn.close().await;
                        });
                    }
                }
            }
        }
    }

    async fn serve_channel(&self, label: &str, link: Arc<Link>) -> Result<()> {
        // First frame carries the request.
        let first = link.frames.set_sync_next_handler(|frame| frame).await?;
        let request: SocksRequest = match first {
            ChannelFrame::Str(s) => serde_json::from_str(&s)
                .map_err(|e| Error::protocol(format!("malformed request frame: {}", e)))?,
            ChannelFrame::Buffer(_) => {
                return Err(Error::protocol("expected textual request frame, got binary"));
            }
        };
        tracing::debug!("egress: channel {} connecting to {}", label, request.target);

        let conn = TcpConnection::dial(request.target.clone(), false);
        let info = conn.once_connected().await?;
        let reached = info.remote.unwrap_or(request.target);

        *link.conn.lock() = Some(Arc::clone(&conn));
        self.peer
            .send(label, ChannelFrame::Str(serde_json::to_string(&reached)?))?;

        // Channel frames -> target socket.
        let target = Arc::clone(&conn);
        let channel = label.to_string();
        link.frames.set_sync_handler(move |frame: ChannelFrame| {
            match &frame {
                ChannelFrame::Buffer(b) => target.send_nowait(b.clone()),
                ChannelFrame::Str(_) => {
                    tracing::warn!("egress: channel {}: dropping late text frame", channel);
                }
            }
            frame
        })?;

        // Target socket -> channel, as binary frames.
        let peer = Arc::clone(&self.peer);
        let channel = label.to_string();
        conn.inbound().set_sync_handler(move |buf| {
            if let Err(e) = peer.send(&channel, ChannelFrame::Buffer(buf.clone())) {
                tracing::debug!("egress: channel {}: forward failed: {}", channel, e);
            }
            buf
        })?;

        // Target close ends the channel.
        let peer = Arc::clone(&self.peer);
        let channel = label.to_string();
        let links = Arc::clone(&self.links);
        tokio::spawn(async move {
            conn.once_closed().await;
            if links.lock().remove(&channel).is_some() {
                peer.close_channel(&channel);
            }
        });

        Ok(())
    }

    /// Close the channel and the outbound socket for a failed link.
    fn drop_link(&self, label: &str) {
        if let Some(link) = self.links.lock().remove(label) {
            if let Some(conn) = link.conn.lock().take() {
                tokio::spawn(async move {
                    conn.close().await;
                });
            }
        }
        self.peer.close_channel(label);
    }

    fn close_all(&self) {
        let links: Vec<(String, Arc<Link>)> = self.links.lock().drain().collect();
        for (label, link) in links {
            tracing::debug!("egress: tearing down channel {}", label);
            link.frames.stop_handling();
            if let Some(conn) = link.conn.lock().take() {
                tokio::spawn(async move {
                    conn.close().await;
                });
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;
    use std::time::Duration;

    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;
    use tokio::time::timeout;

    use crate::net::Endpoint;
    use crate::peer::pair;

    use super::*;

    #[tokio::test]
    async fn test_dials_and_relays() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let target = Endpoint::from(listener.local_addr().unwrap());

        let (left, right) = pair();
        left.negotiate().await.unwrap();
        let egress = Egress::start(right).unwrap();

        // Collect frames arriving back on the ingress side.
        let got: Arc<Mutex<Vec<ChannelFrame>>> = Arc::new(Mutex::new(Vec::new()));
        let got2 = Arc::clone(&got);
        left.events()
            .set_sync_handler(move |ev| {
                if let PeerEvent::Data { frame, .. } = ev {
                    got2.lock().push(frame);
                }
            })
            .unwrap();

        left.open_channel("c100").await.unwrap();
        let request = SocksRequest {
            command: crate::socks::Command::Connect,
            target: target.clone(),
        };
        left.send(
            "c100",
            ChannelFrame::Str(serde_json::to_string(&request).unwrap()),
        )
        .unwrap();

        let (mut accepted, _) = listener.accept().await.unwrap();

        // First frame back is the textual endpoint reply.
        timeout(Duration::from_secs(2), async {
            loop {
                if !got.lock().is_empty() {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
        let reply = got.lock().remove(0);
        let ChannelFrame::Str(json) = reply else {
            panic!("expected textual reply");
        };
        let reached: Endpoint = serde_json::from_str(&json).unwrap();
        assert_eq!(reached.port, target.port);
        assert_eq!(egress.link_count(), 1);

        // Binary payload reaches the target...
        left.send("c100", ChannelFrame::Buffer(Bytes::from_static(b"GET /")))
            .unwrap();
        let mut buf = [0u8; 5];
        accepted.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"GET /");

        // ...and target bytes come back as binary frames.
        accepted.write_all(b"200").await.unwrap();
        timeout(Duration::from_secs(2), async {
            loop {
                if !got.lock().is_empty() {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
        assert_eq!(
            got.lock().remove(0),
            ChannelFrame::Buffer(Bytes::from_static(b"200"))
        );
    }

    #[tokio::test]
    async fn test_connect_failure_closes_channel_without_reply() {
        // A port with nothing listening.
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let target = Endpoint::from(listener.local_addr().unwrap());
        drop(listener);

        let (left, right) = pair();
        left.negotiate().await.unwrap();
        let _egress = Egress::start(right).unwrap();

        let closed: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));
        let closed2 = Arc::clone(&closed);
        left.events()
            .set_sync_handler(move |ev| {
                if let PeerEvent::ChannelClosed { label } = ev {
                    closed2.lock().push(label);
                }
            })
            .unwrap();

        left.open_channel("c101").await.unwrap();
        let request = SocksRequest {
            command: crate::socks::Command::Connect,
            target,
        };
        left.send(
            "c101",
            ChannelFrame::Str(serde_json::to_string(&request).unwrap()),
        )
        .unwrap();

        timeout(Duration::from_secs(2), async {
            loop {
                if !closed.lock().is_empty() {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
        assert_eq!(*closed.lock(), vec!["c101".to_string()]);
    }
}
