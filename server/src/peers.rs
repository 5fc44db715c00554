//! Duplex peer links: one reader task and one writer task per connection,
//! serialized writes, and request/response correlation.
//!
//! Replies are matched to in-flight requests through a per-link correlation
//! map keyed by sequence number, so a caller awaits a oneshot with an explicit
//! timeout instead of polling for its answer. Liveness pings are answered
//! directly in the reader task and never queue behind the owner's event loop.
//! Dropping the last handle to a link tears the connection down.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use log::{debug, warn};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot, watch, Mutex};

use shared::{Packet, PacketStream};

/// Who is on the other end of a link.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum PeerId {
    /// The directory service's control link.
    Directory,
    /// Another game server, identified by its advertised address.
    Server(String),
    /// A game or bootstrap client session.
    Client(u32),
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PeerId::Directory => write!(f, "directory"),
            PeerId::Server(host) => write!(f, "server {}", host),
            PeerId::Client(id) => write!(f, "client {}", id),
        }
    }
}

/// Events a link surfaces to its owning component.
#[derive(Debug)]
pub enum LinkEvent {
    /// An unsolicited packet arrived (requests and notifications; replies are
    /// consumed by the correlation map and never show up here).
    Packet { from: Arc<Link>, packet: Packet },
    /// The connection is gone: clean close or transport error.
    Closed { peer: PeerId },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkError {
    /// No reply within the deadline; the peer may still be alive.
    Timeout,
    /// The connection is closed; no reply can ever arrive.
    Closed,
}

impl fmt::Display for LinkError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LinkError::Timeout => write!(f, "request timed out"),
            LinkError::Closed => write!(f, "link closed"),
        }
    }
}

impl std::error::Error for LinkError {}

type PendingReplies = Arc<Mutex<HashMap<u64, oneshot::Sender<Packet>>>>;

/// A live connection to one peer.
pub struct Link {
    peer: PeerId,
    out_tx: mpsc::UnboundedSender<Packet>,
    pending: PendingReplies,
    next_seq: AtomicU64,
    // Dropped together with the link; its death wakes the reader task so the
    // connection closes when the last handle goes away.
    _shutdown_tx: watch::Sender<()>,
}

impl fmt::Debug for Link {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Link").field("peer", &self.peer).finish()
    }
}

impl Link {
    /// Wraps an established stream, spawning its reader and writer tasks.
    /// Unsolicited inbound packets and the final close are delivered on
    /// `events`.
    pub fn spawn(
        stream: TcpStream,
        peer: PeerId,
        events: mpsc::UnboundedSender<LinkEvent>,
    ) -> Arc<Link> {
        let (out_tx, mut out_rx) = mpsc::unbounded_channel::<Packet>();
        let (shutdown_tx, mut shutdown_rx) = watch::channel(());
        let (mut reader, mut writer) = PacketStream::new(stream).into_split();

        let link = Arc::new(Link {
            peer: peer.clone(),
            out_tx: out_tx.clone(),
            pending: Arc::new(Mutex::new(HashMap::new())),
            next_seq: AtomicU64::new(1),
            _shutdown_tx: shutdown_tx,
        });

        {
            let peer = peer.clone();
            tokio::spawn(async move {
                // Ends when every sender is gone: the link handle itself plus
                // the reader task's clone.
                while let Some(packet) = out_rx.recv().await {
                    if let Err(e) = writer.write_packet(&packet).await {
                        warn!("write to {} failed: {}", peer, e);
                        break;
                    }
                }
            });
        }

        {
            let weak = Arc::downgrade(&link);
            let pending = Arc::clone(&link.pending);
            tokio::spawn(async move {
                loop {
                    let packet = tokio::select! {
                        read = reader.read_packet() => match read {
                            Ok(Some(packet)) => packet,
                            Ok(None) => break,
                            Err(e) => {
                                debug!("read from {} failed: {}", peer, e);
                                break;
                            }
                        },
                        _ = shutdown_rx.changed() => break,
                    };

                    match packet {
                        Packet::Ping { seq } => {
                            let _ = out_tx.send(Packet::Pong { seq });
                        }
                        packet => {
                            if let Some(seq) = packet.reply_seq() {
                                if let Some(tx) = pending.lock().await.remove(&seq) {
                                    let _ = tx.send(packet);
                                } else {
                                    debug!("uncorrelated reply from {}: {:?}", peer, packet);
                                }
                                continue;
                            }
                            let Some(from) = Weak::upgrade(&weak) else {
                                break;
                            };
                            if events.send(LinkEvent::Packet { from, packet }).is_err() {
                                break;
                            }
                        }
                    }
                }
                // Fail every in-flight request, then report the close once.
                pending.lock().await.clear();
                let _ = events.send(LinkEvent::Closed { peer });
            });
        }

        link
    }

    /// Dials `addr` and wraps the resulting stream.
    pub async fn connect(
        addr: &str,
        peer: PeerId,
        events: mpsc::UnboundedSender<LinkEvent>,
    ) -> std::io::Result<Arc<Link>> {
        let stream = TcpStream::connect(addr).await?;
        Ok(Link::spawn(stream, peer, events))
    }

    pub fn peer(&self) -> &PeerId {
        &self.peer
    }

    /// Queues a packet for the writer task. Best-effort: a closed link drops
    /// the packet with a debug log, matching the fire-and-forget broadcast
    /// semantics of commit and abort.
    pub fn send(&self, packet: Packet) {
        if self.out_tx.send(packet).is_err() {
            debug!("dropping packet for closed link to {}", self.peer);
        }
    }

    /// Sends a request built around a fresh sequence number and awaits the
    /// correlated reply, bounded by `timeout`.
    pub async fn request(
        &self,
        build: impl FnOnce(u64) -> Packet,
        timeout: Duration,
    ) -> Result<Packet, LinkError> {
        let seq = self.next_seq.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        self.pending.lock().await.insert(seq, tx);

        if self.out_tx.send(build(seq)).is_err() {
            self.pending.lock().await.remove(&seq);
            return Err(LinkError::Closed);
        }

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(packet)) => Ok(packet),
            Ok(Err(_)) => Err(LinkError::Closed),
            Err(_) => {
                self.pending.lock().await.remove(&seq);
                Err(LinkError::Timeout)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    async fn linked_pair(
        events_a: mpsc::UnboundedSender<LinkEvent>,
        events_b: mpsc::UnboundedSender<LinkEvent>,
    ) -> (Arc<Link>, Arc<Link>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let dialed = TcpStream::connect(addr).await.unwrap();
        let (accepted, _) = listener.accept().await.unwrap();
        (
            Link::spawn(dialed, PeerId::Server("a".into()), events_a),
            Link::spawn(accepted, PeerId::Server("b".into()), events_b),
        )
    }

    #[tokio::test]
    async fn unsolicited_packets_become_events() {
        let (tx_a, _rx_a) = mpsc::unbounded_channel();
        let (tx_b, mut rx_b) = mpsc::unbounded_channel();
        let (a, _b) = linked_pair(tx_a, tx_b).await;

        a.send(Packet::SetMaster { master: true });
        match rx_b.recv().await.unwrap() {
            LinkEvent::Packet { packet, .. } => {
                assert!(matches!(packet, Packet::SetMaster { master: true }))
            }
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[tokio::test]
    async fn pings_are_answered_without_an_event() {
        let (tx_a, _rx_a) = mpsc::unbounded_channel();
        let (tx_b, mut rx_b) = mpsc::unbounded_channel();
        let (a, _b) = linked_pair(tx_a, tx_b).await;

        let reply = a
            .request(|seq| Packet::Ping { seq }, Duration::from_secs(1))
            .await
            .unwrap();
        assert!(matches!(reply, Packet::Pong { .. }));
        assert!(rx_b.try_recv().is_err());
    }

    #[tokio::test]
    async fn unanswered_request_times_out() {
        let (tx_a, _rx_a) = mpsc::unbounded_channel();
        let (tx_b, _rx_b) = mpsc::unbounded_channel();
        let (a, _b) = linked_pair(tx_a, tx_b).await;

        let err = a
            .request(
                |seq| Packet::ClientCountRequest { seq },
                Duration::from_millis(50),
            )
            .await
            .unwrap_err();
        assert_eq!(err, LinkError::Timeout);
    }

    #[tokio::test]
    async fn dropping_a_link_closes_the_peer() {
        let (tx_a, mut rx_a) = mpsc::unbounded_channel();
        let (tx_b, _rx_b) = mpsc::unbounded_channel();
        let (a, b) = linked_pair(tx_a, tx_b).await;

        let pending = tokio::spawn({
            let a = Arc::clone(&a);
            async move {
                a.request(
                    |seq| Packet::ClientCountRequest { seq },
                    Duration::from_secs(5),
                )
                .await
            }
        });

        // Let the request reach the wire, then drop the remote side.
        tokio::time::sleep(Duration::from_millis(20)).await;
        drop(b);

        match rx_a.recv().await.unwrap() {
            LinkEvent::Closed { peer } => assert_eq!(peer, PeerId::Server("a".into())),
            other => panic!("unexpected event {:?}", other),
        }
        assert!(matches!(pending.await.unwrap(), Err(LinkError::Closed)));
    }
}
