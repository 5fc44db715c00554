//! Wire protocol for all three surfaces: client to server, server to server
//! and the directory service. Packets are bincode-encoded and framed by
//! [`crate::net`].

use serde::{Deserialize, Serialize};

use crate::grid::{Entity, Grid, Position};

/// Operation kinds a client can submit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum UpdateKind {
    Spawn,
    Move,
    Damage,
    Heal,
    Remove,
    Query,
}

/// A single state-changing proposal routed through the commit protocol.
///
/// `seq` increases monotonically per originating client; `(origin, seq)`
/// identifies the proposal everywhere in the cluster.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Update {
    pub kind: UpdateKind,
    pub target: Position,
    pub value: i32,
    pub seq: u64,
    pub origin: u32,
}

impl Update {
    pub fn id(&self) -> (u32, u64) {
        (self.origin, self.seq)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Packet {
    // Directory registration and one-shot assignment.
    Register { host: String },
    RegisterAck { master: String },
    RegisterError { reason: String },
    Assignment { master: String, replica: Option<String> },

    // Directory control link, dialed back by the directory after registration.
    DirectoryHello { seq: u64 },
    DirectoryWelcome { seq: u64 },
    SetMaster { master: bool },
    RegisterReplica { host: String },
    ClientCountRequest { seq: u64 },
    ClientCountReply { seq: u64, count: u32 },
    ReplicaCountRequest { seq: u64 },
    ReplicaCountReply { seq: u64, count: u32 },
    Ping { seq: u64 },
    Pong { seq: u64 },

    // Master to replica replication.
    AdoptReplica { seq: u64, master: String },
    AdoptAck { seq: u64 },
    VoteRequest { seq: u64, update: Update },
    VoteReply { seq: u64, granted: bool },
    Commit { update: Update },
    CommitSnapshot { grid: Grid },
    Abort { update: Update },
    Unregister { client_id: u32 },

    // Client wire protocol.
    ClientHello,
    BootstrapHello { client_id: u32 },
    Welcome { client_id: u32 },
    Refused { reason: String },
    Submit { update: Update },
    Committed { update: Update },
    CellState { target: Position, entity: Option<Entity> },
}

impl Packet {
    /// Correlation id carried by packets that answer an earlier request.
    pub fn reply_seq(&self) -> Option<u64> {
        match self {
            Packet::Pong { seq }
            | Packet::DirectoryWelcome { seq }
            | Packet::ClientCountReply { seq, .. }
            | Packet::ReplicaCountReply { seq, .. }
            | Packet::AdoptAck { seq }
            | Packet::VoteReply { seq, .. } => Some(*seq),
            _ => None,
        }
    }
}
