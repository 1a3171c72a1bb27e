use bytes::Bytes;
use parking_lot::Mutex;

use crate::protocol::{status, SessionChange};

/// Character sets the relay can transcode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Charset {
    #[default]
    Utf8,
    Latin1,
    Binary,
}

impl Charset {
    /// Map a collation id from the handshake
    pub fn from_collation(id: u8) -> Self {
        match id {
            5 | 8 | 15 | 31 | 47 | 48 | 49 | 94 => Charset::Latin1,
            63 => Charset::Binary,
            _ => Charset::Utf8,
        }
    }

    pub fn decode(self, raw: &[u8]) -> String {
        match self {
            Charset::Utf8 | Charset::Binary => String::from_utf8_lossy(raw).into_owned(),
            Charset::Latin1 => raw.iter().map(|&b| char::from(b)).collect(),
        }
    }

    pub fn encode(self, text: &str) -> Bytes {
        match self {
            Charset::Utf8 | Charset::Binary => Bytes::copy_from_slice(text.as_bytes()),
            Charset::Latin1 => text
                .chars()
                .map(|c| u8::try_from(u32::from(c)).unwrap_or(b'?'))
                .collect::<Vec<u8>>()
                .into(),
        }
    }
}

#[derive(Debug, Default)]
struct Inner {
    database: Option<String>,
    /// Explicit BEGIN seen by the router
    explicit_transaction: bool,
    capability_flags: u32,
    charset: Charset,
    status_flags: u16,
    warnings: u16,
    authenticated: bool,
}

/// Client session state shared by the handlers of one client connection
#[derive(Debug, Default)]
pub struct SessionState {
    inner: Mutex<Inner>,
}

impl SessionState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Update state after the handshake completed
    pub fn set_from_handshake(
        &self,
        database: Option<String>,
        capabilities: u32,
        collation: u8,
    ) {
        let mut inner = self.inner.lock();
        inner.database = database;
        inner.capability_flags = capabilities;
        inner.charset = Charset::from_collation(collation);
        inner.authenticated = true;
    }

    pub fn database(&self) -> Option<String> {
        self.inner.lock().database.clone()
    }

    pub fn begin_transaction(&self) {
        self.inner.lock().explicit_transaction = true;
    }

    pub fn end_transaction(&self) {
        self.inner.lock().explicit_transaction = false;
    }

    pub(super) fn capabilities(&self) -> u32 {
        self.inner.lock().capability_flags
    }

    pub(super) fn charset(&self) -> Charset {
        self.inner.lock().charset
    }

    pub(super) fn update_status(&self, status_flags: u16, warnings: u16) {
        let mut inner = self.inner.lock();
        inner.status_flags = status_flags;
        inner.warnings = warnings;
    }

    pub(super) fn status(&self) -> (u16, u16) {
        let inner = self.inner.lock();
        (inner.status_flags, inner.warnings)
    }

    /// Transaction open either explicitly or according to the server
    pub(super) fn in_transaction(&self) -> bool {
        let inner = self.inner.lock();
        inner.explicit_transaction || inner.status_flags & status::SERVER_STATUS_IN_TRANS != 0
    }

    pub(super) fn is_authenticated(&self) -> bool {
        self.inner.lock().authenticated
    }

    pub(super) fn apply_changes(&self, changes: &[SessionChange]) {
        let mut inner = self.inner.lock();
        for change in changes {
            if let SessionChange::Schema(schema) = change {
                inner.database = Some(schema.clone());
            }
        }
    }
}
