//! COM_FIELD_LIST responses: column definitions then a terminator.

use super::Step;
use crate::protocol::messages::is_terminator;
use crate::protocol::{ColumnDefinition, ProtocolError, Terminator};
use crate::result::ResultState;
use crate::transport::Slice;

pub(crate) struct FieldListMachine;

impl FieldListMachine {
    pub fn handle(
        &mut self,
        step: &mut Step<'_>,
        slice: &Slice,
        payload: &[u8],
    ) -> Result<(), ProtocolError> {
        match step.state() {
            ResultState::Init | ResultState::Fields => {}
            state => {
                return Err(ProtocolError::Violation(format!(
                    "field list packet in state {state}"
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
            let column = ColumnDefinition::parse(payload)?;
            step.outcome().columns.push(column);
        }
        step.forward(slice);
        step.transition(ResultState::Fields);
        Ok(())
    }
}
