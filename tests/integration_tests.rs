//! Integration tests for the distributed backend: real directory, real
//! servers and real clients over loopback TCP.
//!
//! Each game server runs on its own single-threaded runtime in its own
//! thread, so killing one drops every socket it holds, exactly like a dead
//! process looks to the rest of the cluster.

use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time::sleep;

use client::network::fetch_assignment;
use server::directory::{Directory, DirectoryConfig, DirectoryHandle};
use server::monitor::MonitorConfig;
use server::network::{Server, ServerConfig};
use server::replication::Replication;
use shared::{Packet, PacketStream, Position, Update, UpdateKind};

fn fast_monitor() -> MonitorConfig {
    MonitorConfig {
        probe_interval: Duration::from_millis(100),
        probe_timeout: Duration::from_millis(200),
        max_missed_probes: 2,
    }
}

fn test_server_config() -> ServerConfig {
    ServerConfig {
        vote_timeout: Duration::from_secs(2),
        handshake_timeout: Duration::from_secs(2),
        monitor: fast_monitor(),
        ..ServerConfig::default()
    }
}

async fn start_directory() -> (DirectoryHandle, String, String) {
    let directory = Directory::bind(
        "127.0.0.1:0",
        "127.0.0.1:0",
        DirectoryConfig {
            query_timeout: Duration::from_secs(1),
            monitor: fast_monitor(),
        },
    )
    .await
    .unwrap();
    let handle = directory.handle();
    let registration = directory.registration_addr().unwrap().to_string();
    let assignment = directory.assignment_addr().unwrap().to_string();
    tokio::spawn(directory.run());
    (handle, registration, assignment)
}

/// A game server running in its own thread on its own runtime.
struct ServerProc {
    addr: String,
    replication: Arc<Replication>,
    shutdown: Option<tokio::sync::oneshot::Sender<()>>,
    thread: Option<std::thread::JoinHandle<()>>,
}

impl ServerProc {
    fn spawn(directory_addr: &str, config: ServerConfig) -> ServerProc {
        let directory_addr = directory_addr.to_string();
        let (ready_tx, ready_rx) = std::sync::mpsc::channel();
        let (shutdown_tx, shutdown_rx) = tokio::sync::oneshot::channel::<()>();

        let thread = std::thread::spawn(move || {
            let rt = tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()
                .unwrap();
            rt.block_on(async move {
                let server = Server::bind("127.0.0.1:0", config).await.unwrap();
                let addr = server.advertised_addr().to_string();
                server.register_with_directory(&directory_addr).await.unwrap();
                ready_tx.send((addr, server.replication())).unwrap();
                tokio::select! {
                    _ = server.run() => {}
                    _ = shutdown_rx => {}
                }
            });
            // Dropping the runtime here closes every socket the server held.
        });

        let (addr, replication) = ready_rx
            .recv_timeout(Duration::from_secs(5))
            .expect("server failed to start");
        ServerProc {
            addr,
            replication,
            shutdown: Some(shutdown_tx),
            thread: Some(thread),
        }
    }

    /// Simulates a process death.
    fn kill(mut self) {
        if let Some(shutdown) = self.shutdown.take() {
            let _ = shutdown.send(());
        }
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

/// Minimal scripted client: answers pings, queues everything else.
struct FakeClient {
    out_tx: mpsc::UnboundedSender<Packet>,
    inbox: mpsc::UnboundedReceiver<Packet>,
}

impl FakeClient {
    async fn connect_game(addr: &str) -> (u32, FakeClient) {
        let mut stream = PacketStream::new(TcpStream::connect(addr).await.unwrap());
        stream.write_packet(&Packet::ClientHello).await.unwrap();
        let client_id = match stream.read_packet().await.unwrap() {
            Some(Packet::Welcome { client_id }) => client_id,
            other => panic!("unexpected greeting: {:?}", other),
        };
        (client_id, Self::run(stream))
    }

    async fn connect_bootstrap(addr: &str, client_id: u32) -> FakeClient {
        let mut stream = PacketStream::new(TcpStream::connect(addr).await.unwrap());
        stream
            .write_packet(&Packet::BootstrapHello { client_id })
            .await
            .unwrap();
        Self::run(stream)
    }

    fn run(stream: PacketStream) -> FakeClient {
        let (out_tx, mut out_rx) = mpsc::unbounded_channel::<Packet>();
        let (in_tx, inbox) = mpsc::unbounded_channel::<Packet>();
        let (mut reader, mut writer) = stream.into_split();

        tokio::spawn(async move {
            while let Some(packet) = out_rx.recv().await {
                if writer.write_packet(&packet).await.is_err() {
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
                    Ok(Some(packet)) => {
                        if in_tx.send(packet).is_err() {
                            break;
                        }
                    }
                    _ => break,
                }
            }
        });

        FakeClient { out_tx, inbox }
    }

    fn submit(&self, update: Update) {
        let _ = self.out_tx.send(Packet::Submit { update });
    }

    async fn next_packet(&mut self, within: Duration) -> Option<Packet> {
        tokio::time::timeout(within, self.inbox.recv())
            .await
            .ok()
            .flatten()
    }

    async fn expect_committed(&mut self, within: Duration) -> Update {
        match self.next_packet(within).await {
            Some(Packet::Committed { update }) => update,
            other => panic!("expected a committed update, got {:?}", other),
        }
    }
}

fn update(kind: UpdateKind, x: u16, y: u16, value: i32, seq: u64) -> Update {
    Update {
        kind,
        target: Position::new(x, y),
        value,
        seq,
        // The server overwrites the originator with the session id.
        origin: 0,
    }
}

async fn wait_for<F, Fut>(what: &str, mut cond: F)
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    for _ in 0..200 {
        if cond().await {
            return;
        }
        sleep(Duration::from_millis(25)).await;
    }
    panic!("timed out waiting for {}", what);
}

/// Queries a server's replica and client counts over the remote surface.
async fn query_counts(addr: &str) -> (u32, u32) {
    let mut stream = PacketStream::new(TcpStream::connect(addr).await.unwrap());
    stream
        .write_packet(&Packet::ReplicaCountRequest { seq: 1 })
        .await
        .unwrap();
    let replicas = match stream.read_packet().await.unwrap() {
        Some(Packet::ReplicaCountReply { count, .. }) => count,
        other => panic!("unexpected replica count reply: {:?}", other),
    };

    let mut stream = PacketStream::new(TcpStream::connect(addr).await.unwrap());
    stream
        .write_packet(&Packet::ClientCountRequest { seq: 1 })
        .await
        .unwrap();
    let clients = match stream.read_packet().await.unwrap() {
        Some(Packet::ClientCountReply { count, .. }) => count,
        other => panic!("unexpected client count reply: {:?}", other),
    };

    (replicas, clients)
}

async fn wait_for_replicas(replication: &Arc<Replication>, count: u32) {
    wait_for("replica adoption", || {
        let replication = Arc::clone(replication);
        async move { replication.replica_count().await == count }
    })
    .await;
}

/// End-to-end with zero replicas: the proposal auto-commits, a conflicting
/// spawn is rejected without touching the cell.
#[tokio::test(flavor = "multi_thread")]
async fn single_server_auto_commits_and_rejects_conflicts() {
    let (_handle, registration, assignment) = start_directory().await;
    let master = ServerProc::spawn(&registration, test_server_config());

    let (assigned_master, assigned_replica) = fetch_assignment(&assignment).await.unwrap();
    assert_eq!(assigned_master, master.addr);
    assert_eq!(assigned_replica, None);

    let (first_id, mut first) = FakeClient::connect_game(&assigned_master).await;
    let committed = {
        first.submit(update(UpdateKind::Spawn, 2, 3, 10, 1));
        first.expect_committed(Duration::from_secs(3)).await
    };
    assert_eq!(committed.origin, first_id);

    let grid = master.replication.snapshot().await;
    assert_eq!(grid.entity_at(Position::new(2, 3)).unwrap().id, first_id);

    // A second client spawning onto the same cell commits as a no-op:
    // nobody observes a change and the cell keeps its occupant.
    let (_, mut second) = FakeClient::connect_game(&assigned_master).await;
    second.submit(update(UpdateKind::Spawn, 2, 3, 10, 1));
    assert!(second.next_packet(Duration::from_millis(600)).await.is_none());

    let grid = master.replication.snapshot().await;
    assert_eq!(grid.entity_at(Position::new(2, 3)).unwrap().id, first_id);

    // The cell answers queries with its occupant.
    second.submit(update(UpdateKind::Query, 2, 3, 0, 2));
    match second.next_packet(Duration::from_secs(3)).await {
        Some(Packet::CellState { target, entity }) => {
            assert_eq!((target.x, target.y), (2, 3));
            assert_eq!(entity.unwrap().id, first_id);
        }
        other => panic!("expected cell state, got {:?}", other),
    }

    master.kill();
}

/// One committed update leaves master and both replicas with identical state
/// for the cell, within the timeout bound.
#[tokio::test(flavor = "multi_thread")]
async fn two_replicas_converge_after_commit() {
    let (_handle, registration, assignment) = start_directory().await;
    let a = ServerProc::spawn(&registration, test_server_config());
    let b = ServerProc::spawn(&registration, test_server_config());
    let c = ServerProc::spawn(&registration, test_server_config());
    wait_for_replicas(&a.replication, 2).await;

    let (master_addr, _) = fetch_assignment(&assignment).await.unwrap();
    assert_eq!(master_addr, a.addr);

    let (_, mut game) = FakeClient::connect_game(&master_addr).await;
    game.submit(update(UpdateKind::Spawn, 5, 5, 10, 1));
    game.expect_committed(Duration::from_secs(3)).await;

    let (replicas, clients) = query_counts(&a.addr).await;
    assert_eq!(replicas, 2);
    assert_eq!(clients, 1);

    let authoritative = a.replication.snapshot().await;
    assert!(authoritative.entity_at(Position::new(5, 5)).is_some());
    for replica in [&b, &c] {
        let replication = Arc::clone(&replica.replication);
        let expected = authoritative.clone();
        wait_for("replica convergence", move || {
            let replication = Arc::clone(&replication);
            let expected = expected.clone();
            async move { replication.snapshot().await == expected }
        })
        .await;
    }

    a.kill();
    b.kill();
    c.kill();
}

/// Registration order fixes the master; assignment returns the non-master
/// server with the fewest clients.
#[tokio::test(flavor = "multi_thread")]
async fn assignment_prefers_the_least_loaded_replica() {
    let (handle, registration, assignment) = start_directory().await;
    let a = ServerProc::spawn(&registration, test_server_config());
    let b = ServerProc::spawn(&registration, test_server_config());
    let c = ServerProc::spawn(&registration, test_server_config());

    // Two standby sessions on b, one on c.
    let _b1 = FakeClient::connect_bootstrap(&b.addr, 11).await;
    let _b2 = FakeClient::connect_bootstrap(&b.addr, 12).await;
    let _c1 = FakeClient::connect_bootstrap(&c.addr, 13).await;

    let (master_addr, replica_addr) = fetch_assignment(&assignment).await.unwrap();
    assert_eq!(master_addr, a.addr);
    assert_eq!(replica_addr, Some(c.addr.clone()));
    assert_eq!(handle.master().await, Some(a.addr.clone()));

    a.kill();
    b.kill();
    c.kill();
}

/// A replica refuses direct game connections.
#[tokio::test(flavor = "multi_thread")]
async fn replicas_refuse_game_clients() {
    let (_handle, registration, _assignment) = start_directory().await;
    let a = ServerProc::spawn(&registration, test_server_config());
    let b = ServerProc::spawn(&registration, test_server_config());
    wait_for_replicas(&a.replication, 1).await;

    let mut stream = PacketStream::new(TcpStream::connect(&b.addr).await.unwrap());
    stream.write_packet(&Packet::ClientHello).await.unwrap();
    match stream.read_packet().await.unwrap() {
        Some(Packet::Refused { .. }) => {}
        other => panic!("expected refusal, got {:?}", other),
    }

    a.kill();
    b.kill();
}

/// A NO vote from one busy replica aborts the proposal everywhere, and the
/// cluster recovers once the conflict resolves.
#[tokio::test(flavor = "multi_thread")]
async fn one_no_vote_aborts_everywhere() {
    let (_handle, registration, assignment) = start_directory().await;
    let a = ServerProc::spawn(&registration, test_server_config());
    let b = ServerProc::spawn(&registration, test_server_config());
    let c = ServerProc::spawn(&registration, test_server_config());
    wait_for_replicas(&a.replication, 2).await;

    // Occupy b with a foreign proposal so it votes NO on the next round.
    // The vote surface needs no handshake, like any server-to-server call.
    let mut foreign = PacketStream::new(TcpStream::connect(&b.addr).await.unwrap());
    foreign
        .write_packet(&Packet::VoteRequest {
            seq: 2,
            update: Update {
                kind: UpdateKind::Spawn,
                target: Position::new(20, 20),
                value: 10,
                seq: 1,
                origin: 99,
            },
        })
        .await
        .unwrap();
    assert!(matches!(
        foreign.read_packet().await.unwrap(),
        Some(Packet::VoteReply { granted: true, .. })
    ));

    let (master_addr, _) = fetch_assignment(&assignment).await.unwrap();
    let (_, mut game) = FakeClient::connect_game(&master_addr).await;

    // The busy replica forces a global abort: no client and no replica
    // observes the proposed change.
    game.submit(update(UpdateKind::Spawn, 7, 7, 10, 1));
    assert!(game.next_packet(Duration::from_millis(800)).await.is_none());
    assert!(a.replication.snapshot().await.is_empty());
    assert!(c.replication.snapshot().await.is_empty());

    // The abort fan-out also released b's foreign proposal, so the next
    // update goes through on every server.
    game.submit(update(UpdateKind::Spawn, 8, 8, 10, 2));
    game.expect_committed(Duration::from_secs(3)).await;

    let authoritative = a.replication.snapshot().await;
    assert!(authoritative.entity_at(Position::new(8, 8)).is_some());
    for replica in [&b, &c] {
        let replication = Arc::clone(&replica.replication);
        let expected = authoritative.clone();
        wait_for("replica convergence after abort", move || {
            let replication = Arc::clone(&replication);
            let expected = expected.clone();
            async move { replication.snapshot().await == expected }
        })
        .await;
    }

    a.kill();
    b.kill();
    c.kill();
}

/// Killing the master promotes the least-loaded replica, which adopts the
/// remaining host; subsequent assignments name the new master.
#[tokio::test(flavor = "multi_thread")]
async fn failover_promotes_the_least_loaded_replica() {
    let (handle, registration, assignment) = start_directory().await;
    let a = ServerProc::spawn(&registration, test_server_config());
    let b = ServerProc::spawn(&registration, test_server_config());
    let c = ServerProc::spawn(&registration, test_server_config());
    wait_for_replicas(&a.replication, 2).await;

    // Load: a carries three game clients, b two standbys, c one.
    let _a1 = FakeClient::connect_game(&a.addr).await;
    let _a2 = FakeClient::connect_game(&a.addr).await;
    let _a3 = FakeClient::connect_game(&a.addr).await;
    let _b1 = FakeClient::connect_bootstrap(&b.addr, 21).await;
    let _b2 = FakeClient::connect_bootstrap(&b.addr, 22).await;
    let _c1 = FakeClient::connect_bootstrap(&c.addr, 23).await;

    a.kill();

    let c_addr = c.addr.clone();
    wait_for("failover to promote c", || {
        let handle = handle.clone();
        let c_addr = c_addr.clone();
        async move { handle.master().await == Some(c_addr) }
    })
    .await;

    wait_for("c to take the master role", || {
        let replication = Arc::clone(&c.replication);
        async move { replication.is_master().await }
    })
    .await;
    wait_for_replicas(&c.replication, 1).await;

    let (master_addr, replica_addr) = fetch_assignment(&assignment).await.unwrap();
    assert_eq!(master_addr, c.addr);
    assert_eq!(replica_addr, Some(b.addr.clone()));

    // The promoted master accepts game clients and commits through b.
    let (_, mut game) = FakeClient::connect_game(&c.addr).await;
    game.submit(update(UpdateKind::Spawn, 4, 9, 10, 1));
    game.expect_committed(Duration::from_secs(3)).await;

    let authoritative = c.replication.snapshot().await;
    let replication = Arc::clone(&b.replication);
    let expected = authoritative.clone();
    wait_for("b to follow the new master", move || {
        let replication = Arc::clone(&replication);
        let expected = expected.clone();
        async move { replication.snapshot().await == expected }
    })
    .await;

    b.kill();
    c.kill();
}
