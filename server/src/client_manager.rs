//! Client session bookkeeping.
//!
//! A master holds game sessions: the server assigns each accepted client a
//! generated id and announces it as the first message on the connection. A
//! replica holds bootstrap sessions under the id the client already received
//! from the master; those are what the directory's load balancing counts, and
//! they receive the committed-state broadcasts.

use std::collections::HashMap;
use std::sync::Arc;

use shared::Packet;

use crate::peers::Link;

/// One connected client.
pub struct ClientSession {
    pub id: u32,
    pub link: Arc<Link>,
}

/// All sessions of one server, with capacity enforcement and id assignment.
pub struct ClientManager {
    sessions: HashMap<u32, ClientSession>,
    next_client_id: u32,
    max_clients: usize,
}

impl ClientManager {
    pub fn new(max_clients: usize) -> Self {
        Self {
            sessions: HashMap::new(),
            next_client_id: 1,
            max_clients,
        }
    }

    /// Hands out the next client id, or `None` when the server is full. The
    /// caller follows up with [`insert`](Self::insert) once the session's
    /// link exists.
    pub fn reserve_id(&mut self) -> Option<u32> {
        if self.sessions.len() >= self.max_clients {
            return None;
        }
        let id = self.next_client_id;
        self.next_client_id += 1;
        Some(id)
    }

    /// Registers a game session under a previously reserved id.
    pub fn insert(&mut self, id: u32, link: Arc<Link>) {
        self.sessions.insert(id, ClientSession { id, link });
    }

    /// Registers a bootstrap session under a client-chosen id. Returns `false`
    /// when the server is full; re-bootstrapping an existing id replaces the
    /// old session.
    pub fn adopt(&mut self, id: u32, link: Arc<Link>) -> bool {
        if !self.sessions.contains_key(&id) && self.sessions.len() >= self.max_clients {
            return false;
        }
        self.sessions.insert(id, ClientSession { id, link });
        true
    }

    /// Removes a session; idempotent. Dropping the session's link closes its
    /// connection.
    pub fn remove(&mut self, id: u32) -> bool {
        self.sessions.remove(&id).is_some()
    }

    pub fn contains(&self, id: u32) -> bool {
        self.sessions.contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    /// Queues a packet to every session.
    pub fn broadcast(&self, packet: &Packet) {
        for session in self.sessions.values() {
            session.link.send(packet.clone());
        }
    }

    /// Queues a packet to one session, if it exists.
    pub fn send_to(&self, id: u32, packet: Packet) -> bool {
        match self.sessions.get(&id) {
            Some(session) => {
                session.link.send(packet);
                true
            }
            None => false,
        }
    }
}
