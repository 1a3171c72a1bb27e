//! COM_STMT_PREPARE responses.

use super::{forward_metadata_flag, Step};
use crate::protocol::messages::{is_terminator, OK_HEADER};
use crate::protocol::packet::capabilities;
use crate::protocol::{ColumnDefinition, PacketReader, ProtocolError};
use crate::result::{EofRewrite, PreparedInfo, ResultState};
use crate::transport::Slice;

#[derive(Debug, Default)]
pub(crate) struct PrepareMachine {
    params: u16,
    columns: u16,
    /// Definitions seen in the current group
    seen: u16,
    /// Classic source finished a group, its EOF is next
    awaiting_eof: bool,
}

impl PrepareMachine {
    pub fn handle(
        &mut self,
        step: &mut Step<'_>,
        slice: &Slice,
        payload: &[u8],
    ) -> Result<(), ProtocolError> {
        match step.state() {
            ResultState::Init => self.on_prepare_ok(step, slice, payload),
            ResultState::Parameters | ResultState::Fields => {
                self.on_definition(step, slice, payload)
            }
            state => Err(ProtocolError::Violation(format!(
                "prepare response packet in state {state}"
            ))),
        }
    }

    fn on_prepare_ok(
        &mut self,
        step: &mut Step<'_>,
        slice: &Slice,
        payload: &[u8],
    ) -> Result<(), ProtocolError> {
        let truncated = || ProtocolError::Truncated("COM_STMT_PREPARE_OK");
        let mut reader = PacketReader::new(payload);
        if reader.read_u8() != Some(OK_HEADER) {
            return Err(ProtocolError::unexpected("COM_STMT_PREPARE_OK", payload));
        }
        let statement_id = reader.read_u32_le().ok_or_else(truncated)?;
        let num_columns = reader.read_u16_le().ok_or_else(truncated)?;
        let num_params = reader.read_u16_le().ok_or_else(truncated)?;
        // reserved filler
        reader.skip(1).ok_or_else(truncated)?;
        let warnings = reader.read_u16_le().unwrap_or(0);
        let fixed_len = reader.position();
        let metadata = if capabilities::has_optional_metadata(step.source_caps()) {
            reader.read_u8() != Some(0)
        } else {
            true
        };

        let outcome = step.outcome();
        outcome.warnings = warnings;
        outcome.prepared = Some(PreparedInfo {
            statement_id,
            num_params,
            num_columns,
            warnings,
            ..Default::default()
        });
        let no_groups = num_params == 0 && num_columns == 0;
        forward_metadata_flag(step, slice, payload, fixed_len, metadata || no_groups)?;

        self.params = num_params;
        self.columns = num_columns;
        if !metadata {
            step.transition(ResultState::OK);
            return Ok(());
        }
        self.enter_next_group(step);
        Ok(())
    }

    fn enter_next_group(&mut self, step: &mut Step<'_>) {
        self.seen = 0;
        let next = match step.state() {
            ResultState::Init if self.params > 0 => ResultState::Parameters,
            ResultState::Init | ResultState::ParametersEOF if self.columns > 0 => {
                ResultState::Fields
            }
            _ => ResultState::OK,
        };
        step.transition(next);
    }

    fn close_group(&mut self, step: &mut Step<'_>) {
        let closed = match step.state() {
            ResultState::Parameters => ResultState::ParametersEOF,
            _ => ResultState::FieldsEOF,
        };
        step.transition(closed);
        self.enter_next_group(step);
    }

    fn on_definition(
        &mut self,
        step: &mut Step<'_>,
        slice: &Slice,
        payload: &[u8],
    ) -> Result<(), ProtocolError> {
        if self.awaiting_eof {
            if !is_terminator(payload, false) {
                return Err(ProtocolError::unexpected("EOF", payload));
            }
            self.awaiting_eof = false;
            match step.rewrite() {
                EofRewrite::DropEof => step.skip(slice),
                _ => step.forward(slice),
            }
            self.close_group(step);
            return Ok(());
        }

        let in_params = step.state() == ResultState::Parameters;
        if step.is_local() {
            let column = ColumnDefinition::parse(payload)?;
            if let Some(prepared) = step.outcome().prepared.as_mut() {
                if in_params {
                    prepared.params.push(column);
                } else {
                    prepared.columns.push(column);
                }
            }
        }
        step.forward(slice);
        self.seen += 1;

        let expected = if in_params { self.params } else { self.columns };
        if self.seen < expected {
            return Ok(());
        }
        if step.source_deprecates_eof() {
            if step.rewrite() == EofRewrite::InjectEof {
                // PREPARE_OK carries no status of its own
                let eof = step.session_eof_payload();
                step.inject(&eof);
            }
            self.close_group(step);
        } else {
            self.awaiting_eof = true;
        }
        Ok(())
    }
}
