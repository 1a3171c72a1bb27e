pub mod codec;
pub mod column;
pub mod messages;
pub mod packet;
pub mod row;

pub use codec::{PacketReader, PacketWriter};
pub use column::{ColumnDefinition, FieldType};
pub use messages::{
    is_err, is_ok, is_terminator, EofPacket, ErrPacket, OkPacket, SessionChange, Terminator,
};
pub use packet::{capabilities, status, Command, Packet};
pub use row::{Row, Value};

#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("Unexpected packet: expected {expected}, got header 0x{header:02x} ({len} bytes)")]
    Unexpected {
        expected: &'static str,
        header: u8,
        len: usize,
    },

    #[error("Truncated {0} packet")]
    Truncated(&'static str),

    #[error("Protocol violation: {0}")]
    Violation(String),

    #[error("Unsupported: {0}")]
    Unsupported(&'static str),
}

impl ProtocolError {
    pub fn unexpected(expected: &'static str, payload: &[u8]) -> Self {
        Self::Unexpected {
            expected,
            header: payload.first().copied().unwrap_or(0),
            len: payload.len(),
        }
    }
}
