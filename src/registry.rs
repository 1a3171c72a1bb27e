//! Live connection side index, for diagnostics only.

use std::net::SocketAddr;
use std::time::{Duration, Instant};

use dashmap::DashMap;

use crate::transport::Role;

#[derive(Debug, Clone)]
pub struct ConnectionInfo {
    pub id: u64,
    pub role: Role,
    pub peer: SocketAddr,
    pub opened_at: Instant,
}

impl ConnectionInfo {
    pub fn age(&self) -> Duration {
        self.opened_at.elapsed()
    }
}

/// Connections currently open, keyed by id
#[derive(Debug, Default)]
pub struct ConnectionRegistry {
    entries: DashMap<u64, ConnectionInfo>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, id: u64, role: Role, peer: SocketAddr) {
        self.entries.insert(
            id,
            ConnectionInfo {
                id,
                role,
                peer,
                opened_at: Instant::now(),
            },
        );
    }

    pub fn unregister(&self, id: u64) -> Option<ConnectionInfo> {
        self.entries.remove(&id).map(|(_, info)| info)
    }

    pub fn get(&self, id: u64) -> Option<ConnectionInfo> {
        self.entries.get(&id).map(|entry| entry.value().clone())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Snapshot sorted by id
    pub fn snapshot(&self) -> Vec<ConnectionInfo> {
        let mut all: Vec<_> = self.entries.iter().map(|e| e.value().clone()).collect();
        all.sort_by_key(|info| info.id);
        all
    }

    pub fn count_by_role(&self, role: Role) -> usize {
        self.entries.iter().filter(|e| e.value().role == role).count()
    }
}
