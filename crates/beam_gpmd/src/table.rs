//! The registry's name → address table.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::Serialize;

use beam_core::identity::NodeIdentity;

/// A registered node and when it registered.
#[derive(Debug, Clone, Serialize)]
pub struct RegistryEntry {
    pub identity: NodeIdentity,
    pub registered_at: DateTime<Utc>,
}

/// Node names are unique: registering a taken name is refused, never
/// overwritten. Queries take the read lock, mutations the write lock.
#[derive(Debug, Default)]
pub struct RegistryTable {
    entries: RwLock<HashMap<String, RegistryEntry>>,
}

impl RegistryTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert `identity` if its name is free. Returns whether it was inserted.
    pub fn register(&self, identity: NodeIdentity) -> bool {
        let mut entries = self.entries.write();
        if entries.contains_key(&identity.name) {
            return false;
        }
        entries.insert(
            identity.name.clone(),
            RegistryEntry {
                identity,
                registered_at: Utc::now(),
            },
        );
        true
    }

    /// Remove `name`. Returns whether it was present.
    pub fn unregister(&self, name: &str) -> bool {
        self.entries.write().remove(name).is_some()
    }

    pub fn find(&self, name: &str) -> Option<NodeIdentity> {
        self.entries.read().get(name).map(|e| e.identity.clone())
    }

    /// All entries, sorted by name.
    pub fn snapshot(&self) -> Vec<RegistryEntry> {
        let mut all: Vec<_> = self.entries.read().values().cloned().collect();
        all.sort_by(|a, b| a.identity.name.cmp(&b.identity.name));
        all
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }
}
