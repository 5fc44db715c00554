//! Client-side networking: directory lookup and server sessions.
//!
//! The master session carries the game traffic: updates go up as `Submit`,
//! committed changes come down and are applied to the local grid mirror. The
//! bootstrap session to the assigned replica only identifies the client and
//! answers liveness pings; it becomes useful when the replica is promoted.

use std::error::Error;
use std::sync::Arc;

use log::{debug, info, warn};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, Mutex};

use shared::{Grid, Packet, PacketStream, Update};

/// Events a session surfaces to the caller.
#[derive(Debug)]
pub enum SessionEvent {
    /// A committed update was applied to the mirror.
    Committed(Update),
    /// Answer to an own query.
    Cell {
        target: shared::Position,
        entity: Option<shared::Entity>,
    },
    /// The connection is gone.
    Closed,
}

/// One connection to a game server.
pub struct ServerSession {
    out_tx: mpsc::UnboundedSender<Packet>,
}

impl ServerSession {
    /// Opens the game connection: the server's first message assigns the
    /// client id.
    pub async fn connect_master(
        addr: &str,
        mirror: Arc<Mutex<Grid>>,
        events: mpsc::UnboundedSender<SessionEvent>,
    ) -> Result<(ServerSession, u32), Box<dyn Error>> {
        let stream = TcpStream::connect(addr).await?;
        let mut stream = PacketStream::new(stream);
        stream.write_packet(&Packet::ClientHello).await?;

        let client_id = match stream.read_packet().await? {
            Some(Packet::Welcome { client_id }) => client_id,
            Some(Packet::Refused { reason }) => {
                return Err(format!("server refused connection: {}", reason).into())
            }
            other => return Err(format!("unexpected greeting: {:?}", other).into()),
        };
        info!("connected to master {} as client {}", addr, client_id);

        let session = Self::spawn(stream, Some(mirror), events);
        Ok((session, client_id))
    }

    /// Opens the standby connection to the assigned replica.
    pub async fn connect_bootstrap(
        addr: &str,
        client_id: u32,
        events: mpsc::UnboundedSender<SessionEvent>,
    ) -> Result<ServerSession, Box<dyn Error>> {
        let stream = TcpStream::connect(addr).await?;
        let mut stream = PacketStream::new(stream);
        stream
            .write_packet(&Packet::BootstrapHello { client_id })
            .await?;
        info!("bootstrapped with replica {}", addr);

        // No mirror: the master session is the single source of applied
        // state, otherwise every update would be applied twice.
        Ok(Self::spawn(stream, None, events))
    }

    fn spawn(
        stream: PacketStream,
        mirror: Option<Arc<Mutex<Grid>>>,
        events: mpsc::UnboundedSender<SessionEvent>,
    ) -> ServerSession {
        let (out_tx, mut out_rx) = mpsc::unbounded_channel::<Packet>();
        let (mut reader, mut writer) = stream.into_split();

        tokio::spawn(async move {
            while let Some(packet) = out_rx.recv().await {
                if let Err(e) = writer.write_packet(&packet).await {
                    warn!("write to server failed: {}", e);
                    break;
                }
            }
        });

        let pong_tx = out_tx.clone();
        tokio::spawn(async move {
            loop {
                match reader.read_packet().await {
                    Ok(Some(Packet::Ping { seq })) => {
                        let _ = pong_tx.send(Packet::Pong { seq });
                    }
                    Ok(Some(Packet::Committed { update })) => {
                        if let Some(mirror) = &mirror {
                            mirror.lock().await.apply(&update);
                            let _ = events.send(SessionEvent::Committed(update));
                        }
                    }
                    Ok(Some(Packet::CellState { target, entity })) => {
                        let _ = events.send(SessionEvent::Cell { target, entity });
                    }
                    Ok(Some(Packet::Refused { reason })) => {
                        warn!("server refused: {}", reason);
                    }
                    Ok(Some(other)) => debug!("ignoring packet {:?}", other),
                    Ok(None) => break,
                    Err(e) => {
                        warn!("read from server failed: {}", e);
                        break;
                    }
                }
            }
            let _ = events.send(SessionEvent::Closed);
        });

        ServerSession { out_tx }
    }

    /// Queues an update for submission; fire-and-forget.
    pub fn submit(&self, update: Update) {
        let _ = self.out_tx.send(Packet::Submit { update });
    }
}

/// One-shot directory lookup: connect, receive the assignment, disconnect.
pub async fn fetch_assignment(
    directory_addr: &str,
) -> Result<(String, Option<String>), Box<dyn Error>> {
    let stream = TcpStream::connect(directory_addr).await?;
    let mut stream = PacketStream::new(stream);
    match stream.read_packet().await? {
        Some(Packet::Assignment { master, replica }) => Ok((master, replica)),
        Some(Packet::Refused { reason }) => {
            Err(format!("directory refused assignment: {}", reason).into())
        }
        other => Err(format!("unexpected assignment response: {:?}", other).into()),
    }
}
