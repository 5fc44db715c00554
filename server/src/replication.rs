//! Master/replica replication: the role state machine and the
//! vote -> commit/abort cycle run for every client-submitted update.
//!
//! The master owns the authoritative grid and drives one transaction at a
//! time: it records the proposal, asks every replica for a vote in parallel,
//! and either applies-and-commits or aborts. Any NO vote, timeout or
//! transport error aborts; the protocol always prefers abort over risking
//! divergence. Replicas apply committed updates in the order the single
//! master link delivers them, which preserves the master's commit order.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use log::{debug, info, warn};
use tokio::sync::{mpsc, Mutex, RwLock};

use shared::{ApplyOutcome, Grid, Packet, Update};

use crate::peers::Link;

/// Default bound on one vote round-trip; also arms the replica's local abort
/// timer.
pub const DEFAULT_VOTE_TIMEOUT: Duration = Duration::from_secs(10);

/// The server's current replication role.
pub enum Role {
    /// Coordinates transactions across the registered replicas.
    Master { replicas: HashMap<String, Arc<Link>> },
    /// Mirrors the master's committed state; `master` is unknown until the
    /// directory or an adoption handshake names one.
    Replica { master: Option<String> },
}

/// Per-proposal phase. At most one proposal is in flight per server.
#[derive(Debug, Default)]
struct ReplicationState {
    current: Option<Update>,
    ready_to_commit: bool,
}

/// What happened to a submitted update.
#[derive(Debug, Clone, PartialEq)]
pub enum CommitResult {
    Committed {
        update: Update,
        outcome: ApplyOutcome,
    },
    Aborted {
        update: Update,
    },
    /// This server is not the coordinator; the update was not processed.
    NotMaster,
}

pub struct Replication {
    vote_timeout: Duration,
    role: RwLock<Role>,
    state: Mutex<ReplicationState>,
    grid: Mutex<Grid>,
    /// Held across the whole vote -> commit/abort cycle; enforces the
    /// single-outstanding-transaction invariant at the coordinator.
    txn: Mutex<()>,
}

impl Replication {
    /// Takes ownership of the grid; all further mutation goes through the
    /// commit path.
    pub fn new(grid: Grid, vote_timeout: Duration) -> Self {
        Self {
            vote_timeout,
            role: RwLock::new(Role::Replica { master: None }),
            state: Mutex::new(ReplicationState::default()),
            grid: Mutex::new(grid),
            txn: Mutex::new(()),
        }
    }

    pub async fn is_master(&self) -> bool {
        matches!(&*self.role.read().await, Role::Master { .. })
    }

    pub async fn master_host(&self) -> Option<String> {
        match &*self.role.read().await {
            Role::Master { .. } => None,
            Role::Replica { master } => master.clone(),
        }
    }

    /// Switches to the master role. Existing replica links survive a repeat
    /// call; a promotion from replica starts with an empty replica set, to be
    /// seeded by the directory's adoption instructions.
    pub async fn become_master(&self) {
        let mut role = self.role.write().await;
        if !matches!(&*role, Role::Master { .. }) {
            *role = Role::Master {
                replicas: HashMap::new(),
            };
            info!("switched to master role");
        }
    }

    /// Switches to the replica role, dropping any replica links held as
    /// master (dropping a link closes its connection).
    pub async fn become_replica(&self, master: Option<String>) {
        let mut role = self.role.write().await;
        match master.as_deref() {
            Some(host) => info!("switched to replica role under {}", host),
            None => info!("switched to replica role"),
        }
        *role = Role::Replica { master };
    }

    /// Records an adopted replica. Master-side only; a replica logs and
    /// ignores the call.
    pub async fn adopt_replica(&self, host: String, link: Arc<Link>) {
        match &mut *self.role.write().await {
            Role::Master { replicas } => {
                replicas.insert(host.clone(), link);
                info!("{} joined as replica ({} total)", host, replicas.len());
            }
            Role::Replica { .. } => {
                warn!("ignoring replica adoption of {}: not the master", host)
            }
        }
    }

    /// Forgets a replica; idempotent.
    pub async fn remove_replica(&self, host: &str) {
        if let Role::Master { replicas } = &mut *self.role.write().await {
            if replicas.remove(host).is_some() {
                info!("{} removed from replica set", host);
            }
        }
    }

    pub async fn replica_count(&self) -> u32 {
        match &*self.role.read().await {
            Role::Master { replicas } => replicas.len() as u32,
            Role::Replica { .. } => 0,
        }
    }

    /// Queues a packet to every replica, fire-and-forget.
    pub async fn broadcast_to_replicas(&self, packet: Packet) {
        if let Role::Master { replicas } = &*self.role.read().await {
            for link in replicas.values() {
                link.send(packet.clone());
            }
        }
    }

    /// Copy of the authoritative grid, for snapshot commits and inspection.
    pub async fn snapshot(&self) -> Grid {
        self.grid.lock().await.clone()
    }

    /// Coordinator entry point: runs the full vote -> commit/abort cycle for
    /// one client-submitted update. Serialized by the transaction lock; with
    /// zero registered replicas the vote round trivially succeeds.
    pub async fn receive_update(&self, update: Update) -> CommitResult {
        let _txn = self.txn.lock().await;

        let replicas: Vec<(String, Arc<Link>)> = match &*self.role.read().await {
            Role::Master { replicas } => replicas
                .iter()
                .map(|(host, link)| (host.clone(), Arc::clone(link)))
                .collect(),
            Role::Replica { .. } => {
                warn!("dropping update {:?}: not the master", update.id());
                return CommitResult::NotMaster;
            }
        };

        {
            let mut state = self.state.lock().await;
            state.current = Some(update.clone());
            state.ready_to_commit = false;
        }
        debug!(
            "proposal {:?} entering vote phase ({} replicas)",
            update.id(),
            replicas.len()
        );

        if !self.collect_votes(&update, &replicas).await {
            {
                let mut state = self.state.lock().await;
                state.current = None;
                state.ready_to_commit = false;
            }
            for (_, link) in &replicas {
                link.send(Packet::Abort {
                    update: update.clone(),
                });
            }
            info!("aborted update {:?}", update.id());
            return CommitResult::Aborted { update };
        }

        let outcome = self.grid.lock().await.apply(&update);
        {
            let mut state = self.state.lock().await;
            state.ready_to_commit = true;
        }
        for (_, link) in &replicas {
            link.send(Packet::Commit {
                update: update.clone(),
            });
        }
        {
            let mut state = self.state.lock().await;
            state.current = None;
            state.ready_to_commit = false;
        }
        info!("committed update {:?} ({:?})", update.id(), outcome);
        CommitResult::Committed { update, outcome }
    }

    /// Dispatches vote requests to all replicas in parallel and waits for
    /// every vote to resolve; each is bounded by the vote timeout, so the
    /// whole phase is bounded by one timeout interval regardless of replica
    /// count. Any NO, timeout or transport error fails the round.
    async fn collect_votes(&self, update: &Update, replicas: &[(String, Arc<Link>)]) -> bool {
        if replicas.is_empty() {
            return true;
        }

        let (tx, mut rx) = mpsc::channel(replicas.len());
        for (host, link) in replicas {
            let tx = tx.clone();
            let host = host.clone();
            let link = Arc::clone(link);
            let update = update.clone();
            let vote_timeout = self.vote_timeout;
            tokio::spawn(async move {
                let granted = match link
                    .request(
                        |seq| Packet::VoteRequest {
                            seq,
                            update: update.clone(),
                        },
                        vote_timeout,
                    )
                    .await
                {
                    Ok(Packet::VoteReply { granted, .. }) => granted,
                    Ok(other) => {
                        warn!("unexpected vote reply from {}: {:?}", host, other);
                        false
                    }
                    Err(e) => {
                        warn!("vote from {} failed: {}", host, e);
                        false
                    }
                };
                let _ = tx.send(granted).await;
            });
        }
        drop(tx);

        let mut all_granted = true;
        while let Some(granted) = rx.recv().await {
            eprintln!("DBG vote reply granted={}", granted);
            if !granted {
                all_granted = false;
            }
        }
        eprintln!("DBG collect_votes all_granted={}", all_granted);
        all_granted
    }

    /// Replica-side vote handler. NO while an unresolved proposal is held, NO
    /// if this server is itself master; otherwise the proposal is recorded, a
    /// local abort timer is armed and the vote is YES.
    pub async fn handle_vote_request(self: &Arc<Self>, update: Update) -> bool {
        if self.is_master().await {
            debug!("voting NO on {:?}: holding the master role", update.id());
            return false;
        }

        {
            let mut state = self.state.lock().await;
            if state.current.is_some() && !state.ready_to_commit {
                debug!(
                    "voting NO on {:?}: unresolved proposal {:?}",
                    update.id(),
                    state.current.as_ref().map(Update::id)
                );
                return false;
            }
            state.current = Some(update.clone());
            state.ready_to_commit = false;
        }

        // Abort locally if neither commit nor abort resolves the proposal in
        // time. The timer re-checks that the armed proposal is still current,
        // so firing after a resolution is a no-op.
        let armed = update.id();
        let replication = Arc::clone(self);
        let deadline = self.vote_timeout;
        tokio::spawn(async move {
            tokio::time::sleep(deadline).await;
            let mut state = replication.state.lock().await;
            match &state.current {
                Some(current) if current.id() == armed && !state.ready_to_commit => {
                    warn!("proposal {:?} expired without commit, aborting", armed);
                    state.current = None;
                    state.ready_to_commit = false;
                }
                _ => {}
            }
        });

        debug!("voting YES on {:?}", update.id());
        true
    }

    /// Replica-side commit: ignored unless it matches the held proposal;
    /// otherwise applies locally and returns the outcome so the caller can
    /// forward the change to its sessions.
    pub async fn handle_commit(&self, update: Update) -> Option<ApplyOutcome> {
        {
            let mut state = self.state.lock().await;
            match &state.current {
                Some(current) if current.id() == update.id() => {
                    state.current = None;
                    state.ready_to_commit = false;
                }
                _ => {
                    debug!("ignoring commit {:?}: no matching proposal", update.id());
                    return None;
                }
            }
        }
        let outcome = self.grid.lock().await.apply(&update);
        info!("applied committed update {:?} ({:?})", update.id(), outcome);
        Some(outcome)
    }

    /// Full-state resynchronization fallback: replaces the replica's grid
    /// with the master's snapshot and clears any held proposal.
    pub async fn handle_snapshot(&self, snapshot: Grid) -> bool {
        if self.is_master().await {
            warn!("ignoring state snapshot: holding the master role");
            return false;
        }
        {
            let mut state = self.state.lock().await;
            state.current = None;
            state.ready_to_commit = false;
        }
        self.grid.lock().await.restore(snapshot);
        info!("restored grid from master snapshot");
        true
    }

    /// Abort handler, any role: clears the held proposal unconditionally.
    /// Always safe, always idempotent.
    pub async fn handle_abort(&self, update: &Update) {
        let mut state = self.state.lock().await;
        if state.current.is_some() {
            debug!("aborting proposal {:?}", update.id());
        }
        state.current = None;
        state.ready_to_commit = false;
    }
}
