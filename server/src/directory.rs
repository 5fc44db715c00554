//! The directory service: server registration, load-balanced client
//! assignment and master failover.
//!
//! Servers register over a short-lived connection; the directory dials the
//! claimed address back, keeps that control link for liveness probing and
//! instructions, and answers clients on a separate one-shot assignment
//! endpoint. When the master's failure episode fires, the least-loaded live
//! replica is promoted and handed the remaining hosts to adopt.

use std::collections::HashMap;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use log::{debug, error, info, warn};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, RwLock};
use tokio::time::timeout;

use shared::{Packet, PacketStream};

use crate::monitor::{self, MonitorConfig, ProbeError};
use crate::peers::{Link, LinkEvent, PeerId};

#[derive(Debug, Clone)]
pub struct DirectoryConfig {
    /// Bound on control queries (hello handshake, client counts).
    pub query_timeout: Duration,
    /// Liveness probing of registered servers.
    pub monitor: MonitorConfig,
}

impl Default for DirectoryConfig {
    fn default() -> Self {
        Self {
            query_timeout: Duration::from_secs(3),
            monitor: MonitorConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ServerRole {
    Master,
    Replica,
}

/// One registered game server.
struct ServerRecord {
    link: Arc<Link>,
    role: ServerRole,
    /// Client count from the most recent successful query.
    observed_clients: u32,
}

struct Inner {
    config: DirectoryConfig,
    servers: RwLock<HashMap<String, ServerRecord>>,
    master: RwLock<Option<String>>,
    events_tx: mpsc::UnboundedSender<LinkEvent>,
}

/// The directory daemon: two listeners plus the shared registry.
pub struct Directory {
    registration: TcpListener,
    assignment: TcpListener,
    events_rx: mpsc::UnboundedReceiver<LinkEvent>,
    inner: Arc<Inner>,
}

impl Directory {
    /// Binds the registration and assignment listeners.
    pub async fn bind(
        registration_addr: &str,
        assignment_addr: &str,
        config: DirectoryConfig,
    ) -> io::Result<Directory> {
        let registration = TcpListener::bind(registration_addr).await?;
        let assignment = TcpListener::bind(assignment_addr).await?;
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        Ok(Directory {
            registration,
            assignment,
            events_rx,
            inner: Arc::new(Inner {
                config,
                servers: RwLock::new(HashMap::new()),
                master: RwLock::new(None),
                events_tx,
            }),
        })
    }

    pub fn registration_addr(&self) -> io::Result<SocketAddr> {
        self.registration.local_addr()
    }

    pub fn assignment_addr(&self) -> io::Result<SocketAddr> {
        self.assignment.local_addr()
    }

    /// Current master, for inspection.
    pub async fn master(&self) -> Option<String> {
        self.inner.master.read().await.clone()
    }

    /// Registered host count, for inspection.
    pub async fn server_count(&self) -> usize {
        self.inner.servers.read().await.len()
    }

    /// Cloneable inspection handle that stays usable while the daemon runs.
    pub fn handle(&self) -> DirectoryHandle {
        DirectoryHandle {
            inner: Arc::clone(&self.inner),
        }
    }

    /// Runs both accept loops and drains control-link events until the
    /// process dies.
    pub async fn run(self) {
        let Directory {
            registration,
            assignment,
            mut events_rx,
            inner,
        } = self;

        info!(
            "directory running (registration {}, assignment {})",
            registration
                .local_addr()
                .map(|a| a.to_string())
                .unwrap_or_else(|_| "?".to_string()),
            assignment
                .local_addr()
                .map(|a| a.to_string())
                .unwrap_or_else(|_| "?".to_string()),
        );

        tokio::spawn(registration_loop(registration, Arc::clone(&inner)));
        tokio::spawn(assignment_loop(assignment, Arc::clone(&inner)));

        // Servers never send unsolicited packets on control links; the
        // channel exists for close notifications, which the monitors turn
        // into failure episodes on their next probe.
        while let Some(event) = events_rx.recv().await {
            match event {
                LinkEvent::Closed { peer } => debug!("control link to {} closed", peer),
                LinkEvent::Packet { from, packet } => {
                    debug!("unexpected packet from {}: {:?}", from.peer(), packet)
                }
            }
        }
    }
}

/// Inspection view of a running directory.
#[derive(Clone)]
pub struct DirectoryHandle {
    inner: Arc<Inner>,
}

impl DirectoryHandle {
    pub async fn master(&self) -> Option<String> {
        self.inner.master.read().await.clone()
    }

    pub async fn server_count(&self) -> usize {
        self.inner.servers.read().await.len()
    }

    /// Same computation the one-shot assignment endpoint serves.
    pub async fn assign(&self) -> Option<(String, Option<String>)> {
        self.inner.assign().await
    }
}

async fn registration_loop(listener: TcpListener, inner: Arc<Inner>) {
    loop {
        match listener.accept().await {
            Ok((stream, addr)) => {
                let inner = Arc::clone(&inner);
                tokio::spawn(async move {
                    inner.handle_registration(stream, addr).await;
                });
            }
            Err(e) => {
                error!("registration accept failed: {}", e);
                tokio::time::sleep(Duration::from_millis(100)).await;
            }
        }
    }
}

/// One-shot endpoint: on connect the directory immediately writes a single
/// assignment packet and hangs up.
async fn assignment_loop(listener: TcpListener, inner: Arc<Inner>) {
    loop {
        match listener.accept().await {
            Ok((stream, addr)) => {
                let inner = Arc::clone(&inner);
                tokio::spawn(async move {
                    let mut stream = PacketStream::new(stream);
                    let packet = match inner.assign().await {
                        Some((master, replica)) => Packet::Assignment { master, replica },
                        None => Packet::Refused {
                            reason: "no servers registered".to_string(),
                        },
                    };
                    if let Err(e) = stream.write_packet(&packet).await {
                        debug!("assignment write to {} failed: {}", addr, e);
                    }
                });
            }
            Err(e) => {
                error!("assignment accept failed: {}", e);
                tokio::time::sleep(Duration::from_millis(100)).await;
            }
        }
    }
}

impl Inner {
    async fn handle_registration(self: Arc<Self>, stream: TcpStream, addr: SocketAddr) {
        let mut stream = PacketStream::new(stream);
        let host = match timeout(self.config.query_timeout, stream.read_packet()).await {
            Ok(Ok(Some(Packet::Register { host }))) => host,
            Ok(Ok(other)) => {
                debug!("unexpected registration packet from {}: {:?}", addr, other);
                return;
            }
            Ok(Err(e)) => {
                debug!("registration read from {} failed: {}", addr, e);
                return;
            }
            Err(_) => {
                debug!("registration from {} timed out", addr);
                return;
            }
        };

        let response = match self.register(host).await {
            Ok(master) => Packet::RegisterAck { master },
            Err(reason) => Packet::RegisterError { reason },
        };
        if let Err(e) = stream.write_packet(&response).await {
            debug!("registration response to {} failed: {}", addr, e);
        }
    }

    /// Registers `host`, idempotently. The first registrant becomes master.
    /// The directory must be able to dial the claimed address back; if it
    /// cannot, the registration fails and the caller is expected to abort.
    async fn register(self: &Arc<Self>, host: String) -> Result<String, String> {
        {
            let servers = self.servers.read().await;
            if servers.contains_key(&host) {
                let master = self.master.read().await.clone();
                return Ok(master.unwrap_or_else(|| host.clone()));
            }
        }

        let link = Link::connect(&host, PeerId::Server(host.clone()), self.events_tx.clone())
            .await
            .map_err(|e| format!("could not reach {}: {}", host, e))?;
        match link
            .request(
                |seq| Packet::DirectoryHello { seq },
                self.config.query_timeout,
            )
            .await
        {
            Ok(Packet::DirectoryWelcome { .. }) => {}
            Ok(other) => return Err(format!("unexpected hello reply from {}: {:?}", host, other)),
            Err(e) => return Err(format!("hello handshake with {} failed: {}", host, e)),
        }

        let master = {
            let mut master = self.master.write().await;
            match &*master {
                Some(current) => current.clone(),
                None => {
                    info!("{} is the first registrant, designating it master", host);
                    *master = Some(host.clone());
                    host.clone()
                }
            }
        };

        let role = if master == host {
            ServerRole::Master
        } else {
            ServerRole::Replica
        };
        self.servers.write().await.insert(
            host.clone(),
            ServerRecord {
                link: Arc::clone(&link),
                role,
                observed_clients: 0,
            },
        );
        info!("registered {} (master is {})", host, master);

        self.watch_server(host, link);
        Ok(master)
    }

    /// Starts the liveness watch on a registered server. The oneshot failure
    /// signal fires at most once per episode, so unregistration cannot be
    /// processed twice.
    fn watch_server(self: &Arc<Self>, host: String, link: Arc<Link>) {
        let probe_timeout = self.config.monitor.probe_timeout;
        let weak = Arc::downgrade(&link);
        let failed = monitor::watch(host, self.config.monitor, move || {
            let weak = weak.clone();
            async move {
                match weak.upgrade() {
                    Some(link) => link
                        .request(|seq| Packet::Ping { seq }, probe_timeout)
                        .await
                        .map(|_| ())
                        .map_err(ProbeError::from),
                    None => Err(ProbeError::Transport),
                }
            }
        });

        let inner = Arc::clone(self);
        tokio::spawn(async move {
            if let Ok(host) = failed.await {
                inner.on_failure_detected(host).await;
            }
        });
    }

    /// Master host plus the live non-master server with the fewest clients,
    /// or no replica when the master stands alone.
    async fn assign(&self) -> Option<(String, Option<String>)> {
        let master = self.master.read().await.clone()?;

        let candidates: Vec<(String, Arc<Link>)> = {
            let servers = self.servers.read().await;
            servers
                .iter()
                .filter(|(_, record)| record.role == ServerRole::Replica)
                .map(|(host, record)| (host.clone(), Arc::clone(&record.link)))
                .collect()
        };

        let mut best: Option<(String, u32)> = None;
        for (host, link) in candidates {
            let Some(count) = self.query_client_count(&host, &link).await else {
                continue;
            };
            if best.as_ref().map_or(true, |(_, min)| count < *min) {
                best = Some((host, count));
            }
        }

        Some((master, best.map(|(host, _)| host)))
    }

    /// Queries one server's session count, caching the answer in its record.
    /// A failed query skips the candidate; the monitor handles its fate.
    async fn query_client_count(&self, host: &str, link: &Arc<Link>) -> Option<u32> {
        match link
            .request(
                |seq| Packet::ClientCountRequest { seq },
                self.config.query_timeout,
            )
            .await
        {
            Ok(Packet::ClientCountReply { count, .. }) => {
                if let Some(record) = self.servers.write().await.get_mut(host) {
                    record.observed_clients = count;
                }
                Some(count)
            }
            Ok(other) => {
                debug!("unexpected client count reply from {}: {:?}", host, other);
                None
            }
            Err(e) => {
                debug!("client count query to {} failed: {}", host, e);
                None
            }
        }
    }

    /// Removes a failed host; when it was the master, promotes the
    /// least-loaded live replica and hands it the remaining hosts.
    async fn on_failure_detected(&self, host: String) {
        if self.servers.write().await.remove(&host).is_none() {
            return;
        }
        warn!("{} down, unregistered", host);

        {
            let master = self.master.read().await;
            if master.as_deref() != Some(host.as_str()) {
                return;
            }
        }

        let remaining: Vec<(String, Arc<Link>)> = {
            let servers = self.servers.read().await;
            servers
                .iter()
                .map(|(host, record)| (host.clone(), Arc::clone(&record.link)))
                .collect()
        };

        if remaining.is_empty() {
            *self.master.write().await = None;
            warn!("master {} failed with no live replicas; awaiting registrations", host);
            return;
        }

        // Fresh counts where reachable; a server that cannot answer falls
        // back to its last observed count rather than being skipped, so a
        // replacement is always chosen.
        let mut best: Option<(String, Arc<Link>, u32)> = None;
        for (candidate, link) in &remaining {
            let count = match self.query_client_count(candidate, link).await {
                Some(count) => count,
                None => {
                    let servers = self.servers.read().await;
                    servers
                        .get(candidate)
                        .map(|record| record.observed_clients)
                        .unwrap_or(u32::MAX)
                }
            };
            if best.as_ref().map_or(true, |(_, _, min)| count < *min) {
                best = Some((candidate.clone(), Arc::clone(link), count));
            }
        }
        let Some((new_master, master_link, count)) = best else {
            return;
        };

        info!(
            "promoting {} to master ({} clients, {} live hosts)",
            new_master,
            count,
            remaining.len()
        );
        master_link.send(Packet::SetMaster { master: true });
        for (candidate, _) in &remaining {
            if *candidate != new_master {
                master_link.send(Packet::RegisterReplica {
                    host: candidate.clone(),
                });
            }
        }
        if let Some(record) = self.servers.write().await.get_mut(&new_master) {
            record.role = ServerRole::Master;
        }
        *self.master.write().await = Some(new_master);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn assignment_without_registrations_is_refused() {
        let directory = Directory::bind("127.0.0.1:0", "127.0.0.1:0", DirectoryConfig::default())
            .await
            .unwrap();
        assert!(directory.inner.assign().await.is_none());
    }

    #[tokio::test]
    async fn failure_of_unknown_host_is_ignored() {
        let directory = Directory::bind("127.0.0.1:0", "127.0.0.1:0", DirectoryConfig::default())
            .await
            .unwrap();
        directory
            .inner
            .on_failure_detected("203.0.113.1:9999".to_string())
            .await;
        assert_eq!(directory.server_count().await, 0);
        assert!(directory.master().await.is_none());
    }

    #[tokio::test]
    async fn registration_of_unreachable_host_fails() {
        let directory = Directory::bind("127.0.0.1:0", "127.0.0.1:0", DirectoryConfig::default())
            .await
            .unwrap();
        // A bound-then-dropped listener yields a port nobody listens on.
        let unreachable = {
            let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
            listener.local_addr().unwrap().to_string()
        };
        let result = directory.inner.register(unreachable).await;
        assert!(result.is_err());
        assert!(directory.master().await.is_none());
    }
}
