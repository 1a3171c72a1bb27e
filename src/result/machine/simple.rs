//! Commands answered by a single OK, EOF or ERR.

use super::Step;
use crate::protocol::messages::{is_terminator, OK_HEADER};
use crate::protocol::{Command, OkPacket, ProtocolError, Terminator};
use crate::result::ResultState;
use crate::transport::Slice;

pub(crate) struct SimpleMachine;

impl SimpleMachine {
    pub fn handle(
        &mut self,
        step: &mut Step<'_>,
        slice: &Slice,
        payload: &[u8],
    ) -> Result<(), ProtocolError> {
        if step.state() != ResultState::Init {
            return Err(ProtocolError::Violation(format!(
                "second packet for {:?}",
                step.command()
            )));
        }

        // COM_STATISTICS replies with a bare string
        if step.command() == Command::Statistics {
            step.forward(slice);
            step.transition(ResultState::OK);
            return Ok(());
        }

        if payload.first() == Some(&OK_HEADER) {
            let ok = OkPacket::parse(payload, step.source_caps())?;
            step.record_ok(ok);
            step.forward(slice);
            step.transition(ResultState::OK);
            return Ok(());
        }

        if is_terminator(payload, step.source_deprecates_eof()) {
            let terminator = Terminator::parse(payload, step.source_caps())?;
            step.record_terminator(&terminator);
            step.emit_terminator(slice, &terminator);
            step.transition(ResultState::EOF);
            return Ok(());
        }

        Err(ProtocolError::unexpected("OK", payload))
    }
}
