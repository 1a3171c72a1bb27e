//! Replication freshness of one backend, fed by the topology collaborator.

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};
use std::time::Instant;

use parking_lot::Mutex;

/// Replicated log position
pub type Lsn = u64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendRole {
    /// Writable node, always current
    Leader,
    /// Read replica, lags behind by its applied position
    Replica,
}

impl BackendRole {
    fn as_u8(self) -> u8 {
        match self {
            BackendRole::Leader => 0,
            BackendRole::Replica => 1,
        }
    }

    fn from_u8(raw: u8) -> Self {
        if raw == 0 {
            BackendRole::Leader
        } else {
            BackendRole::Replica
        }
    }
}

impl std::fmt::Display for BackendRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BackendRole::Leader => write!(f, "leader"),
            BackendRole::Replica => write!(f, "replica"),
        }
    }
}

/// Freshness state read lock-free on the packet path
#[derive(Debug)]
pub struct ReplicaFreshness {
    role: AtomicU8,
    applied: AtomicU64,
    known_stale: AtomicBool,
    last_update: Mutex<Option<Instant>>,
}

impl ReplicaFreshness {
    pub fn new(role: BackendRole) -> Self {
        Self {
            role: AtomicU8::new(role.as_u8()),
            applied: AtomicU64::new(0),
            known_stale: AtomicBool::new(false),
            last_update: Mutex::new(None),
        }
    }

    pub fn role(&self) -> BackendRole {
        BackendRole::from_u8(self.role.load(Ordering::Acquire))
    }

    pub fn set_role(&self, role: BackendRole) {
        self.role.store(role.as_u8(), Ordering::Release);
    }

    pub fn is_leader(&self) -> bool {
        self.role() == BackendRole::Leader
    }

    pub fn applied_lsn(&self) -> Lsn {
        self.applied.load(Ordering::Acquire)
    }

    /// Record an applied position; positions never move backwards
    pub fn observe_applied(&self, lsn: Lsn) {
        self.applied.fetch_max(lsn, Ordering::AcqRel);
        *self.last_update.lock() = Some(Instant::now());
    }

    pub fn is_known_stale(&self) -> bool {
        self.known_stale.load(Ordering::Acquire)
    }

    pub fn mark_stale(&self) {
        self.known_stale.store(true, Ordering::Release);
    }

    pub fn clear_stale(&self) {
        self.known_stale.store(false, Ordering::Release);
    }

    pub fn last_update(&self) -> Option<Instant> {
        *self.last_update.lock()
    }

    /// Whether a read pinned at `pinned` may be served here
    pub fn satisfies(&self, pinned: Option<Lsn>) -> bool {
        match pinned {
            None => true,
            Some(_) if self.is_leader() => true,
            Some(lsn) => !self.is_known_stale() && self.applied_lsn() >= lsn,
        }
    }
}

impl Default for ReplicaFreshness {
    fn default() -> Self {
        Self::new(BackendRole::Replica)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_applied_position_is_monotonic() {
        let f = ReplicaFreshness::default();
        f.observe_applied(100);
        f.observe_applied(90);
        assert_eq!(f.applied_lsn(), 100);
        assert!(f.last_update().is_some());
    }

    #[test]
    fn test_satisfies_pinned_point() {
        let f = ReplicaFreshness::new(BackendRole::Replica);
        f.observe_applied(50);
        assert!(f.satisfies(None));
        assert!(f.satisfies(Some(50)));
        assert!(!f.satisfies(Some(51)));

        f.mark_stale();
        assert!(!f.satisfies(Some(10)));
        assert!(f.satisfies(None));
        f.clear_stale();
        assert!(f.satisfies(Some(10)));
    }

    #[test]
    fn test_leader_is_always_fresh() {
        let f = ReplicaFreshness::new(BackendRole::Leader);
        assert!(f.satisfies(Some(u64::MAX)));
        f.set_role(BackendRole::Replica);
        assert!(!f.satisfies(Some(1)));
    }
}
