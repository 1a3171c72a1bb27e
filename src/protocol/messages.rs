//! Generic response packets: OK, ERR and EOF, plus the conversions needed
//! when the two legs disagree on CLIENT_DEPRECATE_EOF.

use bytes::Bytes;

use super::codec::{PacketReader, PacketWriter};
use super::packet::{capabilities, status, Packet, MAX_PACKET_SIZE};
use super::ProtocolError;

pub const OK_HEADER: u8 = 0x00;
pub const EOF_HEADER: u8 = 0xFE;
pub const ERR_HEADER: u8 = 0xFF;
pub const LOCAL_INFILE_HEADER: u8 = 0xFB;

/// Classic EOF packets are always shorter than this
const EOF_MAX_LEN: usize = 9;

pub fn is_ok(payload: &[u8]) -> bool {
    payload.first() == Some(&OK_HEADER)
}

pub fn is_err(payload: &[u8]) -> bool {
    payload.first() == Some(&ERR_HEADER)
}

/// Whether `payload` ends a group (EOF, or the OK that replaces it).
///
/// `deprecate_eof` is the capability negotiated by the connection the packet
/// came from. Under it the terminator is an OK with a 0xFE header that may
/// carry session-track data, so only a full-size chunk (a row starting with an
/// 8-byte length prefix) is excluded.
pub fn is_terminator(payload: &[u8], deprecate_eof: bool) -> bool {
    if payload.first() != Some(&EOF_HEADER) {
        return false;
    }
    if deprecate_eof {
        payload.len() < MAX_PACKET_SIZE
    } else {
        payload.len() < EOF_MAX_LEN
    }
}

/// One entry of the session state change list
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionChange {
    SystemVariable { name: String, value: String },
    Schema(String),
    StateChanged(bool),
    Gtids(String),
    TransactionCharacteristics(String),
    TransactionState(String),
    Other { kind: u8, data: Bytes },
}

mod session_track {
    pub const SYSTEM_VARIABLES: u8 = 0x00;
    pub const SCHEMA: u8 = 0x01;
    pub const STATE_CHANGE: u8 = 0x02;
    pub const GTIDS: u8 = 0x03;
    pub const TRANSACTION_CHARACTERISTICS: u8 = 0x04;
    pub const TRANSACTION_STATE: u8 = 0x05;
}

impl SessionChange {
    fn parse(kind: u8, data: &[u8]) -> Option<Self> {
        let mut reader = PacketReader::new(data);
        let change = match kind {
            session_track::SYSTEM_VARIABLES => SessionChange::SystemVariable {
                name: reader.read_lenenc_string()?,
                value: reader.read_lenenc_string()?,
            },
            session_track::SCHEMA => SessionChange::Schema(reader.read_lenenc_string()?),
            session_track::STATE_CHANGE => {
                SessionChange::StateChanged(reader.read_lenenc_bytes()? == b"1")
            }
            session_track::GTIDS => {
                // encoding specification, always 0
                reader.read_u8()?;
                SessionChange::Gtids(reader.read_lenenc_string()?)
            }
            session_track::TRANSACTION_CHARACTERISTICS => {
                SessionChange::TransactionCharacteristics(reader.read_lenenc_string()?)
            }
            session_track::TRANSACTION_STATE => {
                SessionChange::TransactionState(reader.read_lenenc_string()?)
            }
            _ => SessionChange::Other {
                kind,
                data: Bytes::copy_from_slice(data),
            },
        };
        Some(change)
    }

    fn encode(&self, w: &mut PacketWriter) {
        let mut data = PacketWriter::new();
        let kind = match self {
            SessionChange::SystemVariable { name, value } => {
                data.write_lenenc_bytes(name.as_bytes());
                data.write_lenenc_bytes(value.as_bytes());
                session_track::SYSTEM_VARIABLES
            }
            SessionChange::Schema(schema) => {
                data.write_lenenc_bytes(schema.as_bytes());
                session_track::SCHEMA
            }
            SessionChange::StateChanged(changed) => {
                data.write_lenenc_bytes(if *changed { b"1" } else { b"0" });
                session_track::STATE_CHANGE
            }
            SessionChange::Gtids(gtids) => {
                data.write_u8(0);
                data.write_lenenc_bytes(gtids.as_bytes());
                session_track::GTIDS
            }
            SessionChange::TransactionCharacteristics(text) => {
                data.write_lenenc_bytes(text.as_bytes());
                session_track::TRANSACTION_CHARACTERISTICS
            }
            SessionChange::TransactionState(text) => {
                data.write_lenenc_bytes(text.as_bytes());
                session_track::TRANSACTION_STATE
            }
            SessionChange::Other { kind, data: raw } => {
                data.write_bytes(raw);
                *kind
            }
        };
        w.write_u8(kind);
        w.write_lenenc_bytes(&data.freeze());
    }
}

/// OK packet
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OkPacket {
    pub affected_rows: u64,
    pub last_insert_id: u64,
    pub status_flags: u16,
    pub warnings: u16,
    pub info: String,
    pub session_changes: Vec<SessionChange>,
}

impl OkPacket {
    pub fn new() -> Self {
        Self {
            affected_rows: 0,
            last_insert_id: 0,
            status_flags: status::SERVER_STATUS_AUTOCOMMIT,
            warnings: 0,
            info: String::new(),
            session_changes: Vec::new(),
        }
    }

    /// Parse an OK (0x00) or OK-terminator (0xFE) payload
    pub fn parse(payload: &[u8], caps: u32) -> Result<Self, ProtocolError> {
        let mut reader = PacketReader::new(payload);
        match reader.read_u8() {
            Some(OK_HEADER | EOF_HEADER) => {}
            _ => return Err(ProtocolError::unexpected("OK", payload)),
        }
        let truncated = || ProtocolError::Truncated("OK");
        let affected_rows = reader.read_lenenc_int().ok_or_else(truncated)?;
        let last_insert_id = reader.read_lenenc_int().ok_or_else(truncated)?;

        let mut ok = Self {
            affected_rows,
            last_insert_id,
            status_flags: 0,
            warnings: 0,
            info: String::new(),
            session_changes: Vec::new(),
        };
        if caps & capabilities::CLIENT_PROTOCOL_41 != 0 {
            ok.status_flags = reader.read_u16_le().ok_or_else(truncated)?;
            ok.warnings = reader.read_u16_le().ok_or_else(truncated)?;
        }

        if caps & capabilities::CLIENT_SESSION_TRACK != 0 {
            if reader.is_empty() {
                return Ok(ok);
            }
            ok.info = reader.read_lenenc_string().ok_or_else(truncated)?;
            if ok.status_flags & status::SERVER_SESSION_STATE_CHANGED != 0 {
                let state = reader.read_lenenc_bytes().ok_or_else(truncated)?;
                let mut entries = PacketReader::new(state);
                while !entries.is_empty() {
                    let kind = entries.read_u8().ok_or_else(truncated)?;
                    let data = entries.read_lenenc_bytes().ok_or_else(truncated)?;
                    let change = SessionChange::parse(kind, data)
                        .ok_or(ProtocolError::Truncated("session state"))?;
                    ok.session_changes.push(change);
                }
            }
        } else {
            ok.info = String::from_utf8_lossy(reader.read_rest()).into_owned();
        }
        Ok(ok)
    }

    /// Encode the payload with the given header byte (0x00 or 0xFE)
    pub fn encode_payload(&self, header: u8, caps: u32) -> Bytes {
        let mut w = PacketWriter::new();
        w.write_u8(header);
        w.write_lenenc_int(self.affected_rows);
        w.write_lenenc_int(self.last_insert_id);
        if caps & capabilities::CLIENT_PROTOCOL_41 != 0 {
            w.write_u16_le(self.status_flags);
            w.write_u16_le(self.warnings);
        }
        if caps & capabilities::CLIENT_SESSION_TRACK != 0 {
            let track = self.status_flags & status::SERVER_SESSION_STATE_CHANGED != 0;
            if !self.info.is_empty() || track {
                w.write_lenenc_bytes(self.info.as_bytes());
            }
            if track {
                let mut state = PacketWriter::new();
                for change in &self.session_changes {
                    change.encode(&mut state);
                }
                w.write_lenenc_bytes(&state.freeze());
            }
        } else {
            w.write_bytes(self.info.as_bytes());
        }
        w.freeze()
    }

    pub fn encode(&self, sequence_id: u8, caps: u32) -> Packet {
        Packet::new(sequence_id, self.encode_payload(OK_HEADER, caps))
    }

    pub fn has_more_results(&self) -> bool {
        self.status_flags & status::SERVER_MORE_RESULTS_EXISTS != 0
    }
}

impl Default for OkPacket {
    fn default() -> Self {
        Self::new()
    }
}

/// ERR packet
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ErrPacket {
    pub error_code: u16,
    pub sql_state: String,
    pub error_message: String,
}

impl ErrPacket {
    pub fn new(error_code: u16, sql_state: &str, error_message: &str) -> Self {
        Self {
            error_code,
            sql_state: sql_state.to_string(),
            error_message: error_message.to_string(),
        }
    }

    pub fn encode_payload(&self, caps: u32) -> Bytes {
        let mut w = PacketWriter::new();
        w.write_u8(ERR_HEADER);
        w.write_u16_le(self.error_code);
        if caps & capabilities::CLIENT_PROTOCOL_41 != 0 {
            w.write_u8(b'#');
            let mut state = [b'0'; 5];
            for (dst, src) in state.iter_mut().zip(self.sql_state.bytes()) {
                *dst = src;
            }
            w.write_bytes(&state);
        }
        w.write_bytes(self.error_message.as_bytes());
        w.freeze()
    }

    pub fn encode(&self, sequence_id: u8, caps: u32) -> Packet {
        Packet::new(sequence_id, self.encode_payload(caps))
    }

    /// Parse from packet payload
    pub fn parse(payload: &[u8], caps: u32) -> Option<Self> {
        let mut reader = PacketReader::new(payload);
        if reader.read_u8()? != ERR_HEADER {
            return None;
        }
        let error_code = reader.read_u16_le()?;

        let mut sql_state = "HY000".to_string();
        if caps & capabilities::CLIENT_PROTOCOL_41 != 0 && reader.peek() == Some(b'#') {
            reader.skip(1)?;
            if let Some(state) = reader.read_bytes(5) {
                sql_state = String::from_utf8_lossy(state).into_owned();
            }
        }
        let error_message = String::from_utf8_lossy(reader.read_rest()).into_owned();

        Some(Self {
            error_code,
            sql_state,
            error_message,
        })
    }
}

impl std::fmt::Display for ErrPacket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "ERROR {} ({}): {}",
            self.error_code, self.sql_state, self.error_message
        )
    }
}

/// Classic EOF packet
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct EofPacket {
    pub warnings: u16,
    pub status_flags: u16,
}

impl EofPacket {
    pub fn new(warnings: u16, status_flags: u16) -> Self {
        Self {
            warnings,
            status_flags,
        }
    }

    pub fn parse(payload: &[u8], caps: u32) -> Result<Self, ProtocolError> {
        let mut reader = PacketReader::new(payload);
        if reader.read_u8() != Some(EOF_HEADER) {
            return Err(ProtocolError::unexpected("EOF", payload));
        }
        if caps & capabilities::CLIENT_PROTOCOL_41 == 0 {
            return Ok(Self::default());
        }
        let warnings = reader.read_u16_le().ok_or(ProtocolError::Truncated("EOF"))?;
        let status_flags = reader.read_u16_le().ok_or(ProtocolError::Truncated("EOF"))?;
        Ok(Self {
            warnings,
            status_flags,
        })
    }

    pub fn encode_payload(&self, caps: u32) -> Bytes {
        let mut w = PacketWriter::with_capacity(5);
        w.write_u8(EOF_HEADER);
        if caps & capabilities::CLIENT_PROTOCOL_41 != 0 {
            w.write_u16_le(self.warnings);
            w.write_u16_le(self.status_flags);
        }
        w.freeze()
    }

    pub fn encode(&self, sequence_id: u8, caps: u32) -> Packet {
        Packet::new(sequence_id, self.encode_payload(caps))
    }

    pub fn has_more_results(&self) -> bool {
        self.status_flags & status::SERVER_MORE_RESULTS_EXISTS != 0
    }
}

impl From<&OkPacket> for EofPacket {
    fn from(ok: &OkPacket) -> Self {
        Self::new(ok.warnings, ok.status_flags)
    }
}

impl From<EofPacket> for OkPacket {
    fn from(eof: EofPacket) -> Self {
        Self {
            affected_rows: 0,
            last_insert_id: 0,
            status_flags: eof.status_flags,
            warnings: eof.warnings,
            info: String::new(),
            session_changes: Vec::new(),
        }
    }
}

/// Status flags and warnings of any terminator, whichever form it has
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Terminator {
    Eof(EofPacket),
    Ok(OkPacket),
}

impl Terminator {
    /// Parse a terminator as sent by a source with the given capabilities
    pub fn parse(payload: &[u8], source_caps: u32) -> Result<Self, ProtocolError> {
        if capabilities::deprecates_eof(source_caps) {
            OkPacket::parse(payload, source_caps).map(Terminator::Ok)
        } else {
            EofPacket::parse(payload, source_caps).map(Terminator::Eof)
        }
    }

    pub fn status_flags(&self) -> u16 {
        match self {
            Terminator::Eof(eof) => eof.status_flags,
            Terminator::Ok(ok) => ok.status_flags,
        }
    }

    pub fn warnings(&self) -> u16 {
        match self {
            Terminator::Eof(eof) => eof.warnings,
            Terminator::Ok(ok) => ok.warnings,
        }
    }

    pub fn has_more_results(&self) -> bool {
        self.status_flags() & status::SERVER_MORE_RESULTS_EXISTS != 0
    }

    pub fn has_cursor(&self) -> bool {
        self.status_flags() & status::SERVER_STATUS_CURSOR_EXISTS != 0
    }

    pub fn as_ok(&self) -> OkPacket {
        match self {
            Terminator::Eof(eof) => OkPacket::from(*eof),
            Terminator::Ok(ok) => ok.clone(),
        }
    }

    /// Re-encode in the form a destination with `dest_caps` expects
    pub fn encode_for(&self, dest_caps: u32) -> Bytes {
        if capabilities::deprecates_eof(dest_caps) {
            self.as_ok().encode_payload(EOF_HEADER, dest_caps)
        } else {
            let eof = match self {
                Terminator::Eof(eof) => *eof,
                Terminator::Ok(ok) => EofPacket::from(ok),
            };
            eof.encode_payload(dest_caps)
        }
    }
}
