//! In-memory stand-ins for sockets, backends and sessions.

use std::sync::atomic::{AtomicBool, AtomicU16, AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};

use bytes::Bytes;
use parking_lot::Mutex;

use crate::backend::{BackendLink, BackendRole, Lsn, ReplicaFreshness};
use crate::protocol::packet::{self, capabilities};
use crate::protocol::SessionChange;
use crate::session::SessionContext;
use crate::transport::{PacketSink, ReadControl, ResumeListener, TransportError};

pub(crate) const CLASSIC: u32 = capabilities::CLIENT_PROTOCOL_41;
pub(crate) const DEPRECATE: u32 =
    capabilities::CLIENT_PROTOCOL_41 | capabilities::CLIENT_DEPRECATE_EOF;

/// Client socket that records everything written to it
#[derive(Default)]
pub(crate) struct MockSink {
    caps: u32,
    packets: Mutex<Vec<Bytes>>,
    batches: AtomicUsize,
    blocked: AtomicBool,
    closed: AtomicBool,
    drain_on_register: AtomicBool,
    listeners: Mutex<Vec<Weak<dyn ResumeListener>>>,
}

impl MockSink {
    pub fn new(caps: u32) -> Arc<Self> {
        Arc::new(Self {
            caps,
            ..Default::default()
        })
    }

    pub fn caps(&self) -> u32 {
        self.caps
    }

    pub fn packets(&self) -> Vec<Bytes> {
        self.packets.lock().clone()
    }

    /// (sequence id, payload) of every packet written
    pub fn frames(&self) -> Vec<(u8, Vec<u8>)> {
        self.packets
            .lock()
            .iter()
            .map(|raw| (packet::first_sequence(raw), packet::payload(raw).into_owned()))
            .collect()
    }

    pub fn sequences(&self) -> Vec<u8> {
        self.frames().into_iter().map(|(seq, _)| seq).collect()
    }

    pub fn batches(&self) -> usize {
        self.batches.load(Ordering::SeqCst)
    }

    pub fn set_blocked(&self, blocked: bool) {
        self.blocked.store(blocked, Ordering::SeqCst);
    }

    /// Simulate a drain that lands between the blocked check and registration
    pub fn drain_on_register(&self) {
        self.drain_on_register.store(true, Ordering::SeqCst);
    }

    pub fn drain(&self) {
        self.blocked.store(false, Ordering::SeqCst);
        let listeners = std::mem::take(&mut *self.listeners.lock());
        for listener in listeners.iter().filter_map(Weak::upgrade) {
            listener.on_resume();
        }
    }

    pub fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}

impl PacketSink for MockSink {
    fn write(&self, data: Bytes) -> Result<(), TransportError> {
        if self.is_closed() {
            return Err(TransportError::Closed);
        }
        self.packets.lock().push(data);
        Ok(())
    }

    fn write_batch(&self, batch: Vec<Bytes>) -> Result<(), TransportError> {
        if self.is_closed() {
            return Err(TransportError::Closed);
        }
        self.batches.fetch_add(1, Ordering::SeqCst);
        self.packets.lock().extend(batch);
        Ok(())
    }

    fn is_write_blocked(&self) -> bool {
        self.blocked.load(Ordering::SeqCst)
    }

    fn register_resume(&self, listener: Weak<dyn ResumeListener>) -> bool {
        if self.drain_on_register.load(Ordering::SeqCst) {
            self.blocked.store(false, Ordering::SeqCst);
        }
        if !self.is_write_blocked() {
            return false;
        }
        self.listeners.lock().push(listener);
        true
    }

    fn capabilities(&self) -> u32 {
        self.caps
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

struct MockResumer(Weak<MockBackend>);

impl ResumeListener for MockResumer {
    fn on_resume(&self) {
        if let Some(backend) = self.0.upgrade() {
            backend.enable_read();
        }
    }
}

/// Backend link without a socket
pub(crate) struct MockBackend {
    caps: AtomicU32,
    freshness: ReplicaFreshness,
    read_enabled: AtomicBool,
    resumer: Arc<MockResumer>,
}

impl MockBackend {
    fn build(role: BackendRole, applied: Lsn) -> Arc<Self> {
        Arc::new_cyclic(|me| {
            let freshness = ReplicaFreshness::new(role);
            freshness.observe_applied(applied);
            Self {
                caps: AtomicU32::new(CLASSIC),
                freshness,
                read_enabled: AtomicBool::new(true),
                resumer: Arc::new(MockResumer(me.clone())),
            }
        })
    }

    pub fn replica(applied: Lsn) -> Arc<Self> {
        Self::build(BackendRole::Replica, applied)
    }

    pub fn leader() -> Arc<Self> {
        Self::build(BackendRole::Leader, 0)
    }

    pub fn with_caps(self: Arc<Self>, caps: u32) -> Arc<Self> {
        self.caps.store(caps, Ordering::SeqCst);
        self
    }

    pub fn read_enabled(&self) -> bool {
        self.read_enabled.load(Ordering::SeqCst)
    }

    pub fn mark_stale(&self) {
        self.freshness.mark_stale();
    }
}

impl ReadControl for MockBackend {
    fn enable_read(&self) {
        self.read_enabled.store(true, Ordering::SeqCst);
    }

    fn disable_read(&self) {
        self.read_enabled.store(false, Ordering::SeqCst);
    }
}

impl BackendLink for MockBackend {
    fn id(&self) -> u64 {
        0
    }

    fn capabilities(&self) -> u32 {
        self.caps.load(Ordering::SeqCst)
    }

    fn freshness(&self) -> &ReplicaFreshness {
        &self.freshness
    }

    fn resume_listener(&self) -> Arc<dyn ResumeListener> {
        self.resumer.clone()
    }
}

/// Client session with settable predicates
pub(crate) struct MockSession {
    caps: u32,
    status_flags: AtomicU16,
    warnings: AtomicU16,
    in_transaction: AtomicBool,
    authenticated: AtomicBool,
    changes: Mutex<Vec<SessionChange>>,
}

impl MockSession {
    pub fn new(caps: u32) -> Arc<Self> {
        Arc::new(Self {
            caps,
            status_flags: AtomicU16::new(0),
            warnings: AtomicU16::new(0),
            in_transaction: AtomicBool::new(false),
            authenticated: AtomicBool::new(true),
            changes: Mutex::new(Vec::new()),
        })
    }

    pub fn set_in_transaction(&self, value: bool) {
        self.in_transaction.store(value, Ordering::SeqCst);
    }

    pub fn changes(&self) -> Vec<SessionChange> {
        self.changes.lock().clone()
    }
}

impl SessionContext for MockSession {
    fn capabilities(&self) -> u32 {
        self.caps
    }

    fn update_status(&self, status_flags: u16, warnings: u16) {
        self.status_flags.store(status_flags, Ordering::SeqCst);
        self.warnings.store(warnings, Ordering::SeqCst);
    }

    fn status_flags(&self) -> u16 {
        self.status_flags.load(Ordering::SeqCst)
    }

    fn warnings(&self) -> u16 {
        self.warnings.load(Ordering::SeqCst)
    }

    fn apply_session_changes(&self, changes: &[SessionChange]) {
        self.changes.lock().extend_from_slice(changes);
    }

    fn in_transaction(&self) -> bool {
        self.in_transaction.load(Ordering::SeqCst)
    }

    fn is_authenticated(&self) -> bool {
        self.authenticated.load(Ordering::SeqCst)
    }
}
