//! Client session predicates read by the result handlers.

mod state;

pub use state::{Charset, SessionState};

use bytes::Bytes;

use crate::backend::{BackendLink, Lsn};
use crate::protocol::SessionChange;

/// What the protocol core needs to know about the client session
pub trait SessionContext: Send + Sync {
    /// Capability flags negotiated with the client
    fn capabilities(&self) -> u32;

    /// Record status flags and warnings of an OK or EOF
    fn update_status(&self, status_flags: u16, warnings: u16);

    fn status_flags(&self) -> u16;

    fn warnings(&self) -> u16;

    /// Apply session state changes reported by an OK
    fn apply_session_changes(&self, _changes: &[SessionChange]) {}

    /// Whether `backend` may serve a read pinned at `pinned`
    fn is_fresh_enough(&self, backend: &dyn BackendLink, pinned: Option<Lsn>) -> bool {
        backend.freshness().satisfies(pinned)
    }

    /// A multi-statement transaction is bound to this session
    fn in_transaction(&self) -> bool;

    fn is_authenticated(&self) -> bool;

    fn charset(&self) -> Charset {
        Charset::Utf8
    }

    fn decode_text(&self, raw: &[u8]) -> String {
        self.charset().decode(raw)
    }

    fn encode_text(&self, text: &str) -> Bytes {
        self.charset().encode(text)
    }
}

impl SessionContext for SessionState {
    fn capabilities(&self) -> u32 {
        SessionState::capabilities(self)
    }

    fn update_status(&self, status_flags: u16, warnings: u16) {
        SessionState::update_status(self, status_flags, warnings)
    }

    fn status_flags(&self) -> u16 {
        self.status().0
    }

    fn warnings(&self) -> u16 {
        self.status().1
    }

    fn apply_session_changes(&self, changes: &[SessionChange]) {
        self.apply_changes(changes)
    }

    fn in_transaction(&self) -> bool {
        SessionState::in_transaction(self)
    }

    fn is_authenticated(&self) -> bool {
        SessionState::is_authenticated(self)
    }

    fn charset(&self) -> Charset {
        SessionState::charset(self)
    }
}
