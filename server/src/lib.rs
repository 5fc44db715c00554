//! # Game Server Library
//!
//! Server-side building blocks for the distributed arena backend. One binary
//! runs a game server that takes part in master/replica replication; a second
//! runs the directory service that assigns clients to servers and performs
//! master failover.
//!
//! ## Module Organization
//!
//! ### Replication (`replication`)
//! The role state machine and the vote -> commit/abort protocol. The master
//! coordinates one transaction at a time across its replicas; any NO vote,
//! timeout or transport error aborts the proposal so no partial update ever
//! becomes visible.
//!
//! ### Networking (`network`)
//! Connection acceptance and classification, the per-server event loop, and
//! the directory registration bootstrap.
//!
//! ### Peer links (`peers`)
//! The framed duplex connection shared by every surface: serialized writes,
//! correlated request/response and close notification.
//!
//! ### Failure detection (`monitor`)
//! Bounded liveness probing with a single-shot failure signal per watched
//! peer; used by the directory for servers and by servers for their clients.
//!
//! ### Directory service (`directory`)
//! Registration, load-balanced assignment and master failover.
//!
//! ### Client sessions (`client_manager`)
//! Session bookkeeping: id assignment, capacity, broadcast fan-out.

pub mod client_manager;
pub mod directory;
pub mod monitor;
pub mod network;
pub mod peers;
pub mod replication;
