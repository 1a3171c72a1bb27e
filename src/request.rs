//! Per-attempt request context.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use parking_lot::Mutex;

use crate::backend::Lsn;
use crate::protocol::{ColumnDefinition, Command};

static NEXT_REQUEST_ID: AtomicU64 = AtomicU64::new(1);

/// Where a read may be served
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadPreference {
    /// Only the writable leader
    Leader,
    /// Any replica that is fresh enough
    Replica,
}

/// One attempt of a logical client request
#[derive(Debug)]
pub struct RequestContext {
    id: u64,
    command: Command,
    /// Wire copy of the request, kept for replay
    literal: Option<Bytes>,
    pinned_lsn: Mutex<Option<Lsn>>,
    preference: Mutex<ReadPreference>,
    /// 0 for the original attempt
    attempt: u32,
    started_at: Instant,
    attempt_started_at: Instant,
    previous: Option<Arc<RequestContext>>,
    /// Issued by the proxy itself, not by a client
    system: bool,
    /// Column definitions a local COM_STMT_FETCH decodes against
    fetch_columns: Option<Arc<Vec<ColumnDefinition>>>,
}

impl RequestContext {
    /// Request carrying its wire bytes (header included)
    pub fn new(literal: Bytes) -> Self {
        let command = Command::of_request(&literal);
        Self::build(command, Some(literal))
    }

    /// Request without a replayable copy
    pub fn without_literal(command: Command) -> Self {
        Self::build(command, None)
    }

    fn build(command: Command, literal: Option<Bytes>) -> Self {
        let now = Instant::now();
        Self {
            id: NEXT_REQUEST_ID.fetch_add(1, Ordering::Relaxed),
            command,
            literal,
            pinned_lsn: Mutex::new(None),
            preference: Mutex::new(ReadPreference::Replica),
            attempt: 0,
            started_at: now,
            attempt_started_at: now,
            previous: None,
            system: false,
            fetch_columns: None,
        }
    }

    pub fn with_pinned_lsn(self, lsn: Lsn) -> Self {
        *self.pinned_lsn.lock() = Some(lsn);
        self
    }

    pub fn with_fetch_columns(mut self, columns: Arc<Vec<ColumnDefinition>>) -> Self {
        self.fetch_columns = Some(columns);
        self
    }

    pub fn system(mut self) -> Self {
        self.system = true;
        self
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn command(&self) -> Command {
        self.command
    }

    pub fn literal(&self) -> Option<&Bytes> {
        self.literal.as_ref()
    }

    pub fn has_literal(&self) -> bool {
        self.literal.is_some()
    }

    pub fn pinned_lsn(&self) -> Option<Lsn> {
        *self.pinned_lsn.lock()
    }

    pub fn clear_pinned_lsn(&self) {
        *self.pinned_lsn.lock() = None;
    }

    pub fn preference(&self) -> ReadPreference {
        *self.preference.lock()
    }

    pub fn set_preference(&self, preference: ReadPreference) {
        *self.preference.lock() = preference;
    }

    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    pub fn is_system(&self) -> bool {
        self.system
    }

    pub fn previous(&self) -> Option<&Arc<RequestContext>> {
        self.previous.as_ref()
    }

    pub fn fetch_columns(&self) -> Option<&Arc<Vec<ColumnDefinition>>> {
        self.fetch_columns.as_ref()
    }

    /// Time since the logical request started, across attempts
    pub fn elapsed(&self) -> Duration {
        self.started_at.elapsed()
    }

    /// Time since this attempt was sent
    pub fn attempt_elapsed(&self) -> Duration {
        self.attempt_started_at.elapsed()
    }

    pub fn deadline_elapsed(&self, deadline: Duration) -> bool {
        self.elapsed() >= deadline
    }

    /// Context for the next attempt, linked to this one
    pub fn derive_retry(self: &Arc<Self>) -> Arc<RequestContext> {
        Arc::new(Self {
            id: NEXT_REQUEST_ID.fetch_add(1, Ordering::Relaxed),
            command: self.command,
            literal: self.literal.clone(),
            pinned_lsn: Mutex::new(self.pinned_lsn()),
            preference: Mutex::new(self.preference()),
            attempt: self.attempt + 1,
            started_at: self.started_at,
            attempt_started_at: Instant::now(),
            previous: Some(self.clone()),
            system: self.system,
            fetch_columns: self.fetch_columns.clone(),
        })
    }
}
