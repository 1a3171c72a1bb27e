//! COM_STMT_FETCH responses: binary rows of an open cursor.

use super::Step;
use crate::protocol::messages::is_terminator;
use crate::protocol::row::decode_binary_row;
use crate::protocol::{ProtocolError, Row, Terminator};
use crate::result::ResultState;
use crate::transport::Slice;

pub(crate) struct FetchMachine;

impl FetchMachine {
    pub fn handle(
        &mut self,
        step: &mut Step<'_>,
        slice: &Slice,
        payload: &[u8],
    ) -> Result<(), ProtocolError> {
        match step.state() {
            ResultState::Init | ResultState::Rows => {}
            state => {
                return Err(ProtocolError::Violation(format!(
                    "fetch packet in state {state}"
                )))
            }
        }

        if is_terminator(payload, step.source_deprecates_eof()) {
            let terminator = Terminator::parse(payload, step.source_caps())?;
            step.record_terminator(&terminator);
            step.emit_terminator(slice, &terminator);
            step.transition(ResultState::EOF);
            return Ok(());
        }

        if step.is_local() {
            // the cursor's columns came with the COM_STMT_EXECUTE that opened it
            let columns = step.handler().request().fetch_columns().cloned().ok_or_else(|| {
                ProtocolError::Violation("local fetch without cursor column definitions".into())
            })?;
            let row = Row::Binary(decode_binary_row(payload, &columns)?);
            step.push_row(row);
        } else {
            step.forward(slice);
        }
        step.outcome().rows_seen += 1;
        step.transition(ResultState::Rows);
        Ok(())
    }
}
