//! Response state machines, one per command family.

mod fetch;
mod field_list;
mod prepare;
mod query;
mod simple;

use bytes::Bytes;

use super::{Emitter, EofRewrite, ResultHandler, ResultState, StatementOutcome};
use crate::metrics::metrics;
use crate::protocol::packet::capabilities;
use crate::protocol::{
    Command, EofPacket, ErrPacket, OkPacket, ProtocolError, Row, Terminator,
};
use crate::transport::Slice;

/// Shape of the response a command gets
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandFamily {
    /// A single OK, EOF or ERR
    Simple,
    /// Column definitions ended by a terminator
    FieldList,
    /// OK, or a tabular result in text or binary protocol
    Query { binary: bool },
    /// COM_STMT_PREPARE_OK plus parameter and column groups
    Prepare,
    /// Binary rows of an open cursor
    Fetch,
}

impl CommandFamily {
    /// `None` for commands answered with nothing
    pub fn for_command(command: Command) -> Result<Option<Self>, ProtocolError> {
        let family = match command {
            Command::Query => CommandFamily::Query { binary: false },
            Command::StmtExecute => CommandFamily::Query { binary: true },
            Command::StmtPrepare => CommandFamily::Prepare,
            Command::StmtFetch => CommandFamily::Fetch,
            Command::FieldList => CommandFamily::FieldList,
            Command::InitDb
            | Command::Ping
            | Command::ResetConnection
            | Command::StmtReset
            | Command::SetOption
            | Command::Statistics
            | Command::ProcessKill
            | Command::Debug
            | Command::Sleep => CommandFamily::Simple,
            Command::Quit | Command::StmtClose | Command::StmtSendLongData => return Ok(None),
            Command::ChangeUser => return Err(ProtocolError::Unsupported("COM_CHANGE_USER")),
            Command::Unknown => return Err(ProtocolError::Unsupported("unknown command")),
        };
        Ok(Some(family))
    }
}

pub(super) enum Machine {
    Simple(simple::SimpleMachine),
    FieldList(field_list::FieldListMachine),
    Query(query::QueryMachine),
    Prepare(prepare::PrepareMachine),
    Fetch(fetch::FetchMachine),
}

impl Machine {
    pub(super) fn new(family: CommandFamily) -> Self {
        match family {
            CommandFamily::Simple => Machine::Simple(simple::SimpleMachine),
            CommandFamily::FieldList => Machine::FieldList(field_list::FieldListMachine),
            CommandFamily::Query { binary } => Machine::Query(query::QueryMachine::new(binary)),
            CommandFamily::Prepare => Machine::Prepare(prepare::PrepareMachine::default()),
            CommandFamily::Fetch => Machine::Fetch(fetch::FetchMachine),
        }
    }

    /// Feed one non-ERR packet
    pub(super) fn handle(
        &mut self,
        step: &mut Step<'_>,
        slice: &Slice,
        payload: &[u8],
    ) -> Result<(), ProtocolError> {
        match self {
            Machine::Simple(m) => m.handle(step, slice, payload),
            Machine::FieldList(m) => m.handle(step, slice, payload),
            Machine::Query(m) => m.handle(step, slice, payload),
            Machine::Prepare(m) => m.handle(step, slice, payload),
            Machine::Fetch(m) => m.handle(step, slice, payload),
        }
    }
}

/// Rewrite kinds, as labelled in metrics
pub(super) mod rewrite_kind {
    pub const INJECT: &str = "inject";
    pub const DROP: &str = "drop";
    pub const CONVERT: &str = "convert";
    pub const METADATA: &str = "metadata";
}

/// What a machine may do while handling one packet
pub(crate) struct Step<'a> {
    handler: &'a ResultHandler,
    state: &'a mut ResultState,
    emitter: &'a mut Emitter,
    outcome: &'a mut StatementOutcome,
    more: &'a mut bool,
}

impl<'a> Step<'a> {
    pub(super) fn new(
        handler: &'a ResultHandler,
        state: &'a mut ResultState,
        emitter: &'a mut Emitter,
        outcome: &'a mut StatementOutcome,
        more: &'a mut bool,
    ) -> Self {
        Self {
            handler,
            state,
            emitter,
            outcome,
            more,
        }
    }

    pub fn state(&self) -> ResultState {
        *self.state
    }

    pub fn transition(&mut self, to: ResultState) {
        self.handler.set_state(self.state, to);
    }

    pub fn command(&self) -> Command {
        self.handler.request.command()
    }

    pub fn handler(&self) -> &ResultHandler {
        self.handler
    }

    pub fn outcome(&mut self) -> &mut StatementOutcome {
        self.outcome
    }

    pub fn source_caps(&self) -> u32 {
        self.handler.backend.capabilities()
    }

    pub fn source_deprecates_eof(&self) -> bool {
        capabilities::deprecates_eof(self.source_caps())
    }

    /// Capabilities of whoever reads the output; the source's own in local mode
    pub fn dest_caps(&self) -> u32 {
        match &*self.emitter {
            Emitter::Forward(forwarder) => forwarder.dest_caps(),
            _ => self.source_caps(),
        }
    }

    pub fn rewrite(&self) -> EofRewrite {
        match &*self.emitter {
            Emitter::Forward(forwarder) => {
                EofRewrite::between(self.source_caps(), forwarder.dest_caps())
            }
            _ => EofRewrite::None,
        }
    }

    pub fn is_local(&self) -> bool {
        matches!(self.emitter, Emitter::Local)
    }

    pub fn forward(&mut self, slice: &Slice) {
        if let Emitter::Forward(forwarder) = &mut *self.emitter {
            forwarder.forward(slice);
        }
    }

    pub fn forward_payload(&mut self, slice: &Slice, payload: &[u8], kind: &'static str) {
        if let Emitter::Forward(forwarder) = &mut *self.emitter {
            forwarder.forward_payload(slice, payload);
            metrics().record_eof_rewrite(kind);
        }
    }

    pub fn inject(&mut self, payload: &[u8]) {
        if let Emitter::Forward(forwarder) = &mut *self.emitter {
            forwarder.inject(payload);
            metrics().record_eof_rewrite(rewrite_kind::INJECT);
        }
    }

    pub fn skip(&mut self, slice: &Slice) {
        if let Emitter::Forward(forwarder) = &mut *self.emitter {
            forwarder.skip(slice);
            metrics().record_eof_rewrite(rewrite_kind::DROP);
        }
    }

    pub fn hold(&mut self) {
        if let Emitter::Forward(forwarder) = &mut *self.emitter {
            forwarder.hold();
        }
    }

    pub fn release(&mut self) {
        if let Emitter::Forward(forwarder) = &mut *self.emitter {
            forwarder.release();
        }
    }

    pub fn is_holding(&self) -> bool {
        match &*self.emitter {
            Emitter::Forward(forwarder) => forwarder.is_holding(),
            _ => false,
        }
    }

    /// Relay a terminator, converted if the legs frame it differently
    pub fn emit_terminator(&mut self, slice: &Slice, terminator: &Terminator) {
        if self.rewrite() == EofRewrite::None {
            self.forward(slice);
        } else {
            let payload = terminator.encode_for(self.dest_caps());
            self.forward_payload(slice, &payload, rewrite_kind::CONVERT);
        }
    }

    /// Classic EOF in the destination's encoding
    pub fn eof_payload(&self, warnings: u16, status_flags: u16) -> Bytes {
        EofPacket::new(warnings, status_flags).encode_payload(self.dest_caps())
    }

    /// EOF carrying the status of the session's last OK or EOF.
    ///
    /// Used for metadata EOFs injected before rows: the current result's own
    /// status only arrives with its terminator.
    pub fn session_eof_payload(&self) -> Bytes {
        let session = &self.handler.session;
        self.eof_payload(session.warnings(), session.status_flags())
    }

    pub fn push_row(&mut self, row: Row) {
        if let (Emitter::Local, Some(rows)) = (&*self.emitter, &self.handler.rows) {
            rows.push(row);
        }
    }

    fn tracks_session(&self) -> bool {
        matches!(self.emitter, Emitter::Forward(_) | Emitter::Local)
    }

    pub fn record_ok(&mut self, ok: OkPacket) {
        if self.tracks_session() {
            let session = &self.handler.session;
            session.update_status(ok.status_flags, ok.warnings);
            session.apply_session_changes(&ok.session_changes);
        }
        let outcome = &mut *self.outcome;
        outcome.affected_rows = ok.affected_rows;
        outcome.last_insert_id = ok.last_insert_id;
        outcome.status_flags = ok.status_flags;
        outcome.warnings = ok.warnings;
        outcome.info = ok.info;
        outcome.session_changes = ok.session_changes;
    }

    pub fn record_terminator(&mut self, terminator: &Terminator) {
        match terminator {
            Terminator::Ok(ok) => self.record_ok(ok.clone()),
            Terminator::Eof(eof) => {
                if self.tracks_session() {
                    self.handler
                        .session
                        .update_status(eof.status_flags, eof.warnings);
                }
                self.outcome.status_flags = eof.status_flags;
                self.outcome.warnings = eof.warnings;
            }
        }
    }

    /// Another result follows this one
    pub fn open_more(&mut self) {
        *self.more = true;
    }

    /// Backend ERR: flush whatever was held, relay it, end in Error
    pub(super) fn fail(&mut self, slice: &Slice, payload: &[u8]) -> Result<(), ProtocolError> {
        let err = ErrPacket::parse(payload, self.source_caps())
            .ok_or(ProtocolError::Truncated("ERR"))?;
        self.outcome.error = Some(err);
        self.release();
        self.forward(slice);
        self.transition(ResultState::Error);
        Ok(())
    }
}

/// Relay a packet whose trailing metadata-follows byte may need adding or
/// removing. `fixed_len` is the payload length without that byte.
pub(super) fn forward_metadata_flag(
    step: &mut Step<'_>,
    slice: &Slice,
    payload: &[u8],
    fixed_len: usize,
    carried: bool,
) -> Result<(), ProtocolError> {
    let source = capabilities::has_optional_metadata(step.source_caps());
    let dest = capabilities::has_optional_metadata(step.dest_caps());
    match (source, dest) {
        (true, false) => {
            if !carried {
                return Err(ProtocolError::Violation(
                    "result metadata skipped for a client that requires it".into(),
                ));
            }
            if payload.len() > fixed_len {
                step.forward_payload(slice, &payload[..fixed_len], rewrite_kind::METADATA);
            } else {
                step.forward(slice);
            }
        }
        (false, true) => {
            let mut rewritten = Vec::with_capacity(fixed_len + 1);
            rewritten.extend_from_slice(&payload[..fixed_len.min(payload.len())]);
            // RESULTSET_METADATA_FULL
            rewritten.push(1);
            step.forward_payload(slice, &rewritten, rewrite_kind::METADATA);
        }
        _ => step.forward(slice),
    }
    Ok(())
}
