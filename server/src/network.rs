//! TCP networking for a game server: connection acceptance and
//! classification, the central event loop, and directory bootstrap.
//!
//! Every accepted connection identifies itself with its first packet: a game
//! client (`ClientHello`), a bootstrap client (`BootstrapHello`), a master
//! adopting this server (`AdoptReplica`), the directory opening its control
//! link (`DirectoryHello`), or a booting replica asking to be adopted
//! (`RegisterReplica`). All long-lived connections become [`Link`]s feeding
//! one event loop.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use log::{debug, error, info, warn};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, RwLock};
use tokio::time::timeout;

use shared::{ApplyOutcome, Grid, Packet, PacketStream};

use crate::client_manager::ClientManager;
use crate::monitor::{self, MonitorConfig, ProbeError};
use crate::peers::{Link, LinkEvent, PeerId};
use crate::replication::{CommitResult, Replication, DEFAULT_VOTE_TIMEOUT};

/// Tunable knobs for one server process.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address other processes use to reach this server. Defaults to the
    /// bound local address, which is right for loopback clusters.
    pub advertised_addr: Option<String>,
    pub max_clients: usize,
    /// Bound on one vote round-trip; also the replica's abort-timer deadline.
    pub vote_timeout: Duration,
    /// Bound on control handshakes (registration, adoption).
    pub handshake_timeout: Duration,
    /// Liveness probing of client sessions.
    pub monitor: MonitorConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            advertised_addr: None,
            max_clients: 64,
            vote_timeout: DEFAULT_VOTE_TIMEOUT,
            handshake_timeout: Duration::from_secs(5),
            monitor: MonitorConfig::default(),
        }
    }
}

/// State shared between the accept loop, the event loop and spawned tasks.
struct Shared {
    advertised: String,
    config: ServerConfig,
    replication: Arc<Replication>,
    clients: Arc<RwLock<ClientManager>>,
    /// Control link the directory dialed; kept alive here.
    directory: RwLock<Option<Arc<Link>>>,
    /// Link to the current master while in the replica role.
    master_link: RwLock<Option<Arc<Link>>>,
    events_tx: mpsc::UnboundedSender<LinkEvent>,
}

/// One game server process.
pub struct Server {
    local_addr: SocketAddr,
    events_rx: mpsc::UnboundedReceiver<LinkEvent>,
    shared: Arc<Shared>,
}

impl Server {
    /// Binds the listening socket and starts accepting connections, so the
    /// directory can dial back during registration before the event loop
    /// runs. The server starts as an unassigned replica;
    /// [`register_with_directory`](Self::register_with_directory) resolves
    /// the actual role.
    pub async fn bind(bind_addr: &str, config: ServerConfig) -> io::Result<Server> {
        let listener = TcpListener::bind(bind_addr).await?;
        let local_addr = listener.local_addr()?;
        let advertised = match &config.advertised_addr {
            Some(addr) => addr.clone(),
            None => local_addr.to_string(),
        };
        let (events_tx, events_rx) = mpsc::unbounded_channel();

        let shared = Arc::new(Shared {
            replication: Arc::new(Replication::new(Grid::new(), config.vote_timeout)),
            clients: Arc::new(RwLock::new(ClientManager::new(config.max_clients))),
            directory: RwLock::new(None),
            master_link: RwLock::new(None),
            advertised,
            config,
            events_tx,
        });

        tokio::spawn(accept_loop(listener, Arc::clone(&shared)));

        Ok(Server {
            local_addr,
            events_rx,
            shared,
        })
    }

    pub fn advertised_addr(&self) -> &str {
        &self.shared.advertised
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Handle on the replication component, e.g. for state inspection.
    pub fn replication(&self) -> Arc<Replication> {
        Arc::clone(&self.shared.replication)
    }

    /// Registers with the directory and takes the role it dictates: the
    /// first registrant becomes master, later ones become replicas and ask
    /// the master for adoption. A registration error aborts startup.
    pub async fn register_with_directory(&self, directory_addr: &str) -> io::Result<()> {
        let stream = TcpStream::connect(directory_addr).await?;
        let mut stream = PacketStream::new(stream);
        stream
            .write_packet(&Packet::Register {
                host: self.shared.advertised.clone(),
            })
            .await?;

        let response = timeout(self.shared.config.handshake_timeout, stream.read_packet())
            .await
            .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, "registration timed out"))??;

        match response {
            Some(Packet::RegisterAck { master }) => {
                if master == self.shared.advertised {
                    info!("registered with directory as master");
                    self.shared.replication.become_master().await;
                } else {
                    info!("registered with directory; master is {}", master);
                    self.shared
                        .replication
                        .become_replica(Some(master.clone()))
                        .await;
                    // Ask the master to adopt this server; it dials back to
                    // complete the handshake.
                    let stream = TcpStream::connect(&master).await?;
                    let mut stream = PacketStream::new(stream);
                    stream
                        .write_packet(&Packet::RegisterReplica {
                            host: self.shared.advertised.clone(),
                        })
                        .await?;
                }
                Ok(())
            }
            Some(Packet::RegisterError { reason }) => Err(io::Error::new(
                io::ErrorKind::ConnectionRefused,
                format!("directory refused registration: {}", reason),
            )),
            other => Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("unexpected registration response: {:?}", other),
            )),
        }
    }

    /// Runs the event loop until the process dies.
    pub async fn run(self) {
        let Server {
            mut events_rx,
            shared,
            ..
        } = self;

        info!("server {} running", shared.advertised);
        while let Some(event) = events_rx.recv().await {
            shared.handle_event(event).await;
        }
    }
}

async fn accept_loop(listener: TcpListener, shared: Arc<Shared>) {
    loop {
        match listener.accept().await {
            Ok((stream, addr)) => {
                let shared = Arc::clone(&shared);
                tokio::spawn(async move {
                    shared.classify_connection(stream, addr).await;
                });
            }
            Err(e) => {
                error!("accept failed: {}", e);
                tokio::time::sleep(Duration::from_millis(100)).await;
            }
        }
    }
}

impl Shared {
    /// Reads the first packet of a fresh connection and hands it to the
    /// matching role.
    async fn classify_connection(self: Arc<Self>, stream: TcpStream, addr: SocketAddr) {
        let mut stream = PacketStream::new(stream);
        let first = match timeout(self.config.handshake_timeout, stream.read_packet()).await {
            Ok(Ok(Some(packet))) => packet,
            Ok(Ok(None)) => return,
            Ok(Err(e)) => {
                debug!("handshake read from {} failed: {}", addr, e);
                return;
            }
            Err(_) => {
                debug!("handshake from {} timed out", addr);
                return;
            }
        };

        match first {
            Packet::ClientHello => self.accept_game_client(stream, addr).await,
            Packet::BootstrapHello { client_id } => {
                self.accept_bootstrap_client(stream, addr, client_id).await
            }
            Packet::AdoptReplica { seq, master } => self.accept_adoption(stream, master, seq).await,
            Packet::DirectoryHello { seq } => {
                info!("directory control link established");
                let link = Link::spawn(
                    stream.into_inner(),
                    PeerId::Directory,
                    self.events_tx.clone(),
                );
                link.send(Packet::DirectoryWelcome { seq });
                *self.directory.write().await = Some(link);
            }
            Packet::RegisterReplica { host } => {
                // A booting replica announces itself on a short-lived
                // connection; the adoption handshake runs on a fresh dial.
                if self.replication.is_master().await {
                    self.spawn_adoption(host);
                } else {
                    warn!("ignoring replica registration from {}: not the master", host);
                }
            }
            packet @ (Packet::VoteRequest { .. }
            | Packet::Commit { .. }
            | Packet::CommitSnapshot { .. }
            | Packet::Abort { .. }
            | Packet::Unregister { .. }
            | Packet::ClientCountRequest { .. }
            | Packet::ReplicaCountRequest { .. }) => {
                // The replication surface needs no prior handshake; the
                // connection becomes an anonymous server link.
                let link = Link::spawn(
                    stream.into_inner(),
                    PeerId::Server(addr.to_string()),
                    self.events_tx.clone(),
                );
                self.handle_packet(link, packet).await;
            }
            other => warn!("unexpected handshake packet from {}: {:?}", addr, other),
        }
    }

    async fn accept_game_client(self: Arc<Self>, mut stream: PacketStream, addr: SocketAddr) {
        if !self.replication.is_master().await {
            let _ = stream
                .write_packet(&Packet::Refused {
                    reason: "not the master".to_string(),
                })
                .await;
            return;
        }
        let Some(id) = self.clients.write().await.reserve_id() else {
            let _ = stream
                .write_packet(&Packet::Refused {
                    reason: "server full".to_string(),
                })
                .await;
            return;
        };

        let link = Link::spawn(
            stream.into_inner(),
            PeerId::Client(id),
            self.events_tx.clone(),
        );
        // The first message on the wire assigns the client its identifier.
        link.send(Packet::Welcome { client_id: id });
        self.clients.write().await.insert(id, Arc::clone(&link));
        self.watch_client(id, &link);
        info!("client {} connected from {}", id, addr);
    }

    async fn accept_bootstrap_client(
        self: Arc<Self>,
        mut stream: PacketStream,
        addr: SocketAddr,
        client_id: u32,
    ) {
        if self.replication.is_master().await {
            let _ = stream
                .write_packet(&Packet::Refused {
                    reason: "master holds no bootstrap sessions".to_string(),
                })
                .await;
            return;
        }
        let link = Link::spawn(
            stream.into_inner(),
            PeerId::Client(client_id),
            self.events_tx.clone(),
        );
        if self.clients.write().await.adopt(client_id, Arc::clone(&link)) {
            self.watch_client(client_id, &link);
            info!("client {} bootstrapped from {}", client_id, addr);
        } else {
            link.send(Packet::Refused {
                reason: "server full".to_string(),
            });
        }
    }

    /// A master dialed in to adopt this server as its replica.
    async fn accept_adoption(self: Arc<Self>, stream: PacketStream, master: String, seq: u64) {
        info!("adopted as replica of {}", master);
        self.replication.become_replica(Some(master.clone())).await;
        let link = Link::spawn(
            stream.into_inner(),
            PeerId::Server(master),
            self.events_tx.clone(),
        );
        link.send(Packet::AdoptAck { seq });
        *self.master_link.write().await = Some(link);
    }

    /// Master-side adoption: dial the host, instruct it to take the replica
    /// role, resynchronize it with a full snapshot and record the link.
    /// Handshake failure is logged, not retried.
    fn spawn_adoption(self: &Arc<Self>, host: String) {
        let shared = Arc::clone(self);
        tokio::spawn(async move {
            let link = match Link::connect(
                &host,
                PeerId::Server(host.clone()),
                shared.events_tx.clone(),
            )
            .await
            {
                Ok(link) => link,
                Err(e) => {
                    warn!("could not reach replica candidate {}: {}", host, e);
                    return;
                }
            };

            let master = shared.advertised.clone();
            match link
                .request(
                    |seq| Packet::AdoptReplica {
                        seq,
                        master: master.clone(),
                    },
                    shared.config.handshake_timeout,
                )
                .await
            {
                Ok(Packet::AdoptAck { .. }) => {
                    link.send(Packet::CommitSnapshot {
                        grid: shared.replication.snapshot().await,
                    });
                    shared.replication.adopt_replica(host, link).await;
                }
                Ok(other) => warn!("unexpected adoption reply from {}: {:?}", host, other),
                Err(e) => warn!("replica handshake with {} failed: {}", host, e),
            }
        });
    }

    /// Starts a liveness watch on a client session; a failure episode drops
    /// the session and, at the master, tells replicas to drop theirs.
    fn watch_client(self: &Arc<Self>, id: u32, link: &Arc<Link>) {
        let probe_timeout = self.config.monitor.probe_timeout;
        let weak = Arc::downgrade(link);
        let failed = monitor::watch(PeerId::Client(id), self.config.monitor, move || {
            let weak = weak.clone();
            async move {
                match weak.upgrade() {
                    Some(link) => link
                        .request(|seq| Packet::Ping { seq }, probe_timeout)
                        .await
                        .map(|_| ())
                        .map_err(ProbeError::from),
                    // Session already dropped elsewhere.
                    None => Err(ProbeError::Transport),
                }
            }
        });

        let shared = Arc::clone(self);
        tokio::spawn(async move {
            if let Ok(PeerId::Client(id)) = failed.await {
                shared.drop_client_session(id).await;
            }
        });
    }

    async fn drop_client_session(&self, id: u32) {
        if self.clients.write().await.remove(id) {
            info!("client {} disconnected", id);
            if self.replication.is_master().await {
                self.replication
                    .broadcast_to_replicas(Packet::Unregister { client_id: id })
                    .await;
            }
        }
    }

    async fn handle_event(self: &Arc<Self>, event: LinkEvent) {
        match event {
            LinkEvent::Packet { from, packet } => self.handle_packet(from, packet).await,
            LinkEvent::Closed { peer } => match peer {
                PeerId::Server(host) => {
                    self.replication.remove_replica(&host).await;
                    let mut master_link = self.master_link.write().await;
                    let lost_master = master_link
                        .as_ref()
                        .map_or(false, |link| *link.peer() == PeerId::Server(host.clone()));
                    if lost_master {
                        *master_link = None;
                        warn!("lost link to master {}; awaiting directory failover", host);
                    }
                }
                PeerId::Client(id) => self.drop_client_session(id).await,
                PeerId::Directory => {
                    *self.directory.write().await = None;
                    warn!("lost directory control link");
                }
            },
        }
    }

    async fn handle_packet(self: &Arc<Self>, from: Arc<Link>, packet: Packet) {
        match packet {
            Packet::Submit { update } => {
                // The session id is authoritative for the originator, not
                // whatever the client wrote into the update.
                let mut update = update;
                if let PeerId::Client(id) = from.peer() {
                    update.origin = *id;
                }
                match self.replication.receive_update(update).await {
                    CommitResult::Committed { update, outcome } => match outcome {
                        ApplyOutcome::Applied => {
                            self.clients
                                .read()
                                .await
                                .broadcast(&Packet::Committed { update });
                        }
                        ApplyOutcome::Cell(entity) => {
                            self.clients.read().await.send_to(
                                update.origin,
                                Packet::CellState {
                                    target: update.target,
                                    entity,
                                },
                            );
                        }
                        ApplyOutcome::Rejected => {
                            debug!("update {:?} rejected against current state", update.id())
                        }
                    },
                    CommitResult::Aborted { update } => {
                        debug!("update {:?} aborted", update.id())
                    }
                    CommitResult::NotMaster => {}
                }
            }
            Packet::VoteRequest { seq, update } => {
                let granted = self.replication.handle_vote_request(update).await;
                from.send(Packet::VoteReply { seq, granted });
            }
            Packet::Commit { update } => {
                if let Some(ApplyOutcome::Applied) =
                    self.replication.handle_commit(update.clone()).await
                {
                    self.clients
                        .read()
                        .await
                        .broadcast(&Packet::Committed { update });
                }
            }
            Packet::CommitSnapshot { grid } => {
                self.replication.handle_snapshot(grid).await;
            }
            Packet::Abort { update } => self.replication.handle_abort(&update).await,
            Packet::SetMaster { master } => {
                if master {
                    info!("promoted to master by the directory");
                    *self.master_link.write().await = None;
                    self.replication.become_master().await;
                } else {
                    self.replication.become_replica(None).await;
                }
            }
            Packet::RegisterReplica { host } => {
                if self.replication.is_master().await {
                    self.spawn_adoption(host);
                } else {
                    warn!("ignoring replica registration for {}: not the master", host);
                }
            }
            Packet::ClientCountRequest { seq } => {
                let count = self.clients.read().await.len() as u32;
                from.send(Packet::ClientCountReply { seq, count });
            }
            Packet::ReplicaCountRequest { seq } => {
                let count = self.replication.replica_count().await;
                from.send(Packet::ReplicaCountReply { seq, count });
            }
            Packet::Unregister { client_id } => {
                self.clients.write().await.remove(client_id);
            }
            other => debug!("unhandled packet from {}: {:?}", from.peer(), other),
        }
    }
}
