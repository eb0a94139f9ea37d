//! Per-agent directories: known peers, live connections, local mailboxes.
//!
//! Each table sits behind its own `RwLock`; no operation needs to hold
//! two of them at once.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;

use beam_core::identity::NodeIdentity;

use crate::connection::PeerConnection;
use crate::mailbox::{Mailbox, RoutineId};

/// Peers this node has learned about. The first identity recorded for a
/// name wins; entries are never removed.
#[derive(Debug, Default)]
pub struct PeerTable {
    peers: RwLock<HashMap<String, NodeIdentity>>,
}

impl PeerTable {
    /// Record `identity` unless its name is already known. Returns whether
    /// it was added.
    pub fn insert(&self, identity: NodeIdentity) -> bool {
        let mut peers = self.peers.write();
        if peers.contains_key(&identity.name) {
            return false;
        }
        tracing::debug!("Learned peer {identity}");
        peers.insert(identity.name.clone(), identity);
        true
    }

    pub fn get(&self, name: &str) -> Option<NodeIdentity> {
        self.peers.read().get(name).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.peers.read().contains_key(name)
    }

    /// All known peers, sorted by name.
    pub fn snapshot(&self) -> Vec<NodeIdentity> {
        let mut all: Vec<_> = self.peers.read().values().cloned().collect();
        all.sort_by(|a, b| a.name.cmp(&b.name));
        all
    }
}

/// At most one live connection per peer name. A newer connection replaces
/// the older one; the caller is handed the old one to close.
#[derive(Debug, Default)]
pub struct ConnectionTable {
    connections: RwLock<HashMap<String, Arc<PeerConnection>>>,
}

impl ConnectionTable {
    /// Store `conn` for `name`, returning the connection it replaced.
    pub fn insert(&self, name: &str, conn: Arc<PeerConnection>) -> Option<Arc<PeerConnection>> {
        self.connections.write().insert(name.to_string(), conn)
    }

    pub fn get(&self, name: &str) -> Option<Arc<PeerConnection>> {
        self.connections.read().get(name).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.connections.read().contains_key(name)
    }

    /// Remove `conn` if it is still the entry for `name`.
    pub fn remove_if_same(&self, name: &str, conn: &Arc<PeerConnection>) -> bool {
        let mut connections = self.connections.write();
        match connections.get(name) {
            Some(current) if Arc::ptr_eq(current, conn) => {
                connections.remove(name);
                true
            }
            _ => false,
        }
    }

    /// Sorted names of connected peers.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<_> = self.connections.read().keys().cloned().collect();
        names.sort();
        names
    }

    /// Empty the table, returning every connection it held.
    pub fn drain(&self) -> Vec<Arc<PeerConnection>> {
        self.connections.write().drain().map(|(_, c)| c).collect()
    }
}

/// Local mailboxes by routine id. Registration is first-write-wins.
#[derive(Debug, Default)]
pub struct MailboxTable {
    mailboxes: RwLock<HashMap<RoutineId, Arc<Mailbox>>>,
}

impl MailboxTable {
    pub fn insert(&self, id: RoutineId, mailbox: Arc<Mailbox>) -> bool {
        let mut mailboxes = self.mailboxes.write();
        if mailboxes.contains_key(&id) {
            return false;
        }
        mailboxes.insert(id, mailbox);
        true
    }

    pub fn get(&self, id: RoutineId) -> Option<Arc<Mailbox>> {
        self.mailboxes.read().get(&id).cloned()
    }
}
