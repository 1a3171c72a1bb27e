//! COM_QUERY and COM_STMT_EXECUTE responses.

use super::{forward_metadata_flag, Step};
use crate::protocol::messages::{is_terminator, LOCAL_INFILE_HEADER, OK_HEADER};
use crate::protocol::packet::capabilities;
use crate::protocol::row::{decode_binary_row, decode_text_row};
use crate::protocol::{
    ColumnDefinition, OkPacket, PacketReader, ProtocolError, Row, Terminator,
};
use crate::result::{EofRewrite, ResultState};
use crate::transport::Slice;

pub(crate) struct QueryMachine {
    /// Rows use the binary protocol
    binary: bool,
    columns: u64,
    defs_seen: u64,
    /// Column definitions follow the count
    metadata: bool,
    /// Classic source sent its last definition, its EOF is next
    awaiting_eof: bool,
    /// Last metadata packet held until the next packet tells where the
    /// injected EOF belongs
    boundary_held: bool,
}

impl QueryMachine {
    pub fn new(binary: bool) -> Self {
        Self {
            binary,
            columns: 0,
            defs_seen: 0,
            metadata: true,
            awaiting_eof: false,
            boundary_held: false,
        }
    }

    pub fn handle(
        &mut self,
        step: &mut Step<'_>,
        slice: &Slice,
        payload: &[u8],
    ) -> Result<(), ProtocolError> {
        match step.state() {
            ResultState::Init => self.on_first(step, slice, payload),
            ResultState::Fields => self.on_metadata(step, slice, payload),
            ResultState::FieldsEOF | ResultState::Rows => self.on_rows(step, slice, payload),
            state => Err(ProtocolError::Violation(format!(
                "query result packet in state {state}"
            ))),
        }
    }

    fn on_first(
        &mut self,
        step: &mut Step<'_>,
        slice: &Slice,
        payload: &[u8],
    ) -> Result<(), ProtocolError> {
        match payload.first() {
            Some(&OK_HEADER) => {
                let ok = OkPacket::parse(payload, step.source_caps())?;
                let more = ok.has_more_results();
                step.record_ok(ok);
                step.forward(slice);
                if more {
                    step.open_more();
                }
                step.transition(ResultState::OK);
                Ok(())
            }
            Some(&LOCAL_INFILE_HEADER) => Err(ProtocolError::Unsupported("LOAD DATA LOCAL INFILE")),
            _ => self.on_column_count(step, slice, payload),
        }
    }

    fn on_column_count(
        &mut self,
        step: &mut Step<'_>,
        slice: &Slice,
        payload: &[u8],
    ) -> Result<(), ProtocolError> {
        let mut reader = PacketReader::new(payload);
        let count = reader
            .read_lenenc_int()
            .ok_or(ProtocolError::Truncated("column count"))?;
        if count == 0 {
            return Err(ProtocolError::Violation("result set without columns".into()));
        }
        let fixed_len = reader.position();
        self.metadata = if capabilities::has_optional_metadata(step.source_caps()) {
            reader.read_u8() != Some(0)
        } else {
            true
        };
        self.columns = count;

        if !self.metadata {
            self.before_boundary(step);
        }
        forward_metadata_flag(step, slice, payload, fixed_len, self.metadata)?;
        step.transition(ResultState::Fields);
        if !self.metadata {
            self.after_boundary(step);
        }
        Ok(())
    }

    fn on_metadata(
        &mut self,
        step: &mut Step<'_>,
        slice: &Slice,
        payload: &[u8],
    ) -> Result<(), ProtocolError> {
        if self.awaiting_eof {
            return self.on_metadata_eof(step, slice, payload);
        }
        if step.is_local() {
            let column = ColumnDefinition::parse(payload)?;
            step.outcome().columns.push(column);
        }
        self.defs_seen += 1;
        let last = self.defs_seen == self.columns;
        if last {
            self.before_boundary(step);
        }
        step.forward(slice);
        if last {
            self.after_boundary(step);
        }
        Ok(())
    }

    /// About to emit the last metadata packet
    fn before_boundary(&mut self, step: &mut Step<'_>) {
        if step.rewrite() == EofRewrite::InjectEof {
            step.hold();
            self.boundary_held = true;
        }
    }

    /// Emitted the last metadata packet
    fn after_boundary(&mut self, step: &mut Step<'_>) {
        if step.source_deprecates_eof() {
            step.transition(ResultState::FieldsEOF);
        } else {
            self.awaiting_eof = true;
        }
    }

    fn on_metadata_eof(
        &mut self,
        step: &mut Step<'_>,
        slice: &Slice,
        payload: &[u8],
    ) -> Result<(), ProtocolError> {
        if !is_terminator(payload, false) {
            return Err(ProtocolError::unexpected("EOF", payload));
        }
        self.awaiting_eof = false;
        let terminator = Terminator::parse(payload, step.source_caps())?;
        step.record_terminator(&terminator);
        if terminator.has_cursor() {
            // rows come later through COM_STMT_FETCH
            step.emit_terminator(slice, &terminator);
            step.transition(ResultState::EOF);
            return Ok(());
        }
        match step.rewrite() {
            EofRewrite::DropEof => step.skip(slice),
            _ => step.forward(slice),
        }
        step.transition(ResultState::FieldsEOF);
        Ok(())
    }

    fn on_rows(
        &mut self,
        step: &mut Step<'_>,
        slice: &Slice,
        payload: &[u8],
    ) -> Result<(), ProtocolError> {
        let source_deprecates = step.source_deprecates_eof();
        if self.boundary_held {
            self.boundary_held = false;
            if is_terminator(payload, source_deprecates) {
                let terminator = Terminator::parse(payload, step.source_caps())?;
                if !terminator.has_cursor() {
                    let eof = step.eof_payload(terminator.warnings(), terminator.status_flags());
                    step.inject(&eof);
                }
                step.release();
                return self.finish(step, slice, terminator);
            }
            // terminator not seen yet, so the session's last status stands in
            let eof = step.session_eof_payload();
            step.inject(&eof);
            step.release();
        }

        if is_terminator(payload, source_deprecates) {
            let terminator = Terminator::parse(payload, step.source_caps())?;
            return self.finish(step, slice, terminator);
        }
        self.on_row(step, slice, payload)
    }

    fn finish(
        &mut self,
        step: &mut Step<'_>,
        slice: &Slice,
        terminator: Terminator,
    ) -> Result<(), ProtocolError> {
        step.record_terminator(&terminator);
        step.emit_terminator(slice, &terminator);
        if terminator.has_more_results() {
            step.open_more();
        }
        step.transition(ResultState::EOF);
        Ok(())
    }

    fn on_row(
        &mut self,
        step: &mut Step<'_>,
        slice: &Slice,
        payload: &[u8],
    ) -> Result<(), ProtocolError> {
        if step.is_local() {
            let row = if self.binary {
                let columns = &step.outcome().columns;
                if columns.is_empty() {
                    return Err(ProtocolError::Violation(
                        "binary rows without column metadata".into(),
                    ));
                }
                Row::Binary(decode_binary_row(payload, columns)?)
            } else {
                Row::Text(decode_text_row(payload, self.columns as usize)?)
            };
            step.push_row(row);
        } else {
            step.forward(slice);
        }
        step.outcome().rows_seen += 1;
        step.transition(ResultState::Rows);
        Ok(())
    }
}
