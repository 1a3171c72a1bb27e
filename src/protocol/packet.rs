use std::borrow::Cow;

use bytes::{BufMut, Bytes, BytesMut};

/// MySQL packet header size: 3 bytes length + 1 byte sequence
pub const PACKET_HEADER_SIZE: usize = 4;
/// Maximum packet payload size (16MB - 1)
pub const MAX_PACKET_SIZE: usize = 0xFF_FF_FF;
/// Distance between consecutive chunk headers of a multi-chunk packet
pub const CHUNK_STRIDE: usize = PACKET_HEADER_SIZE + MAX_PACKET_SIZE;

/// Header of a single wire chunk
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PacketHeader {
    pub payload_length: usize,
    pub sequence_id: u8,
}

impl PacketHeader {
    pub fn new(payload_length: usize, sequence_id: u8) -> Self {
        Self {
            payload_length,
            sequence_id,
        }
    }

    /// Read a header from the first four bytes, returns None if not enough data
    pub fn parse(src: &[u8]) -> Option<Self> {
        if src.len() < PACKET_HEADER_SIZE {
            return None;
        }
        let payload_length =
            src[0] as usize | ((src[1] as usize) << 8) | ((src[2] as usize) << 16);
        Some(Self {
            payload_length,
            sequence_id: src[3],
        })
    }

    pub fn encode(&self, dst: &mut BytesMut) {
        let len = self.payload_length;
        // 3 bytes for length (little endian)
        dst.put_u8((len & 0xFF) as u8);
        dst.put_u8(((len >> 8) & 0xFF) as u8);
        dst.put_u8(((len >> 16) & 0xFF) as u8);
        // 1 byte for sequence id
        dst.put_u8(self.sequence_id);
    }
}

/// MySQL wire protocol packet (logical payload, framing added on encode)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    pub sequence_id: u8,
    pub payload: Bytes,
}

impl Packet {
    pub fn new(sequence_id: u8, payload: impl Into<Bytes>) -> Self {
        Self {
            sequence_id,
            payload: payload.into(),
        }
    }

    /// Encode packet to wire bytes, splitting into chunks above 16MB-1
    pub fn encode(&self, dst: &mut BytesMut) {
        let mut seq = self.sequence_id;
        let mut rest: &[u8] = &self.payload;
        loop {
            let take = rest.len().min(MAX_PACKET_SIZE);
            PacketHeader::new(take, seq).encode(dst);
            dst.extend_from_slice(&rest[..take]);
            rest = &rest[take..];
            seq = seq.wrapping_add(1);
            // A full chunk is always followed by another one, possibly empty
            if take < MAX_PACKET_SIZE {
                break;
            }
        }
    }

    pub fn to_wire(&self) -> Bytes {
        let mut dst = BytesMut::with_capacity(self.payload.len() + PACKET_HEADER_SIZE);
        self.encode(&mut dst);
        dst.freeze()
    }
}

/// Frame `payload` starting at `sequence_id` and return the wire bytes
pub fn encode_packet(sequence_id: u8, payload: &[u8]) -> Bytes {
    Packet::new(sequence_id, Bytes::copy_from_slice(payload)).to_wire()
}

/// Iterator over the chunk headers of one raw wire packet
pub struct Chunks<'a> {
    raw: &'a [u8],
    offset: usize,
    done: bool,
}

impl<'a> Iterator for Chunks<'a> {
    /// (offset of the chunk header, header)
    type Item = (usize, PacketHeader);

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        let header = PacketHeader::parse(self.raw.get(self.offset..)?)?;
        let at = self.offset;
        self.offset += PACKET_HEADER_SIZE + header.payload_length;
        if header.payload_length < MAX_PACKET_SIZE || self.offset >= self.raw.len() {
            self.done = true;
        }
        Some((at, header))
    }
}

/// Walk the chunk headers of a complete raw packet
pub fn chunks(raw: &[u8]) -> Chunks<'_> {
    Chunks {
        raw,
        offset: 0,
        done: false,
    }
}

/// Sequence id of the first chunk
pub fn first_sequence(raw: &[u8]) -> u8 {
    raw.get(3).copied().unwrap_or(0)
}

/// Sequence id of the last chunk
pub fn last_sequence(raw: &[u8]) -> u8 {
    chunks(raw)
        .last()
        .map(|(_, h)| h.sequence_id)
        .unwrap_or(0)
}

/// Number of sequence ids the packet occupies on the wire
pub fn chunk_count(raw: &[u8]) -> usize {
    chunks(raw).count()
}

/// Logical payload of a raw packet, joining chunk payloads when needed
pub fn payload(raw: &[u8]) -> Cow<'_, [u8]> {
    let mut iter = chunks(raw);
    let Some((at, first)) = iter.next() else {
        return Cow::Borrowed(&[]);
    };
    let start = at + PACKET_HEADER_SIZE;
    let end = (start + first.payload_length).min(raw.len());
    if first.payload_length < MAX_PACKET_SIZE {
        return Cow::Borrowed(&raw[start..end]);
    }

    let mut joined = Vec::with_capacity(raw.len());
    joined.extend_from_slice(&raw[start..end]);
    for (at, header) in iter {
        let start = at + PACKET_HEADER_SIZE;
        let end = (start + header.payload_length).min(raw.len());
        joined.extend_from_slice(&raw[start..end]);
    }
    Cow::Owned(joined)
}

/// Shift the sequence id of every chunk header by `delta` (mod 256)
pub fn renumber(raw: &mut [u8], delta: u8) {
    if delta == 0 {
        return;
    }
    let mut offset = 0;
    while offset + PACKET_HEADER_SIZE <= raw.len() {
        let len = raw[offset] as usize
            | ((raw[offset + 1] as usize) << 8)
            | ((raw[offset + 2] as usize) << 16);
        raw[offset + 3] = raw[offset + 3].wrapping_add(delta);
        if len < MAX_PACKET_SIZE {
            break;
        }
        offset += CHUNK_STRIDE;
    }
}

/// MySQL capability flags
#[allow(dead_code)]
pub mod capabilities {
    pub const CLIENT_LONG_PASSWORD: u32 = 1;
    pub const CLIENT_FOUND_ROWS: u32 = 1 << 1;
    pub const CLIENT_LONG_FLAG: u32 = 1 << 2;
    pub const CLIENT_CONNECT_WITH_DB: u32 = 1 << 3;
    pub const CLIENT_COMPRESS: u32 = 1 << 5;
    pub const CLIENT_LOCAL_FILES: u32 = 1 << 7;
    pub const CLIENT_PROTOCOL_41: u32 = 1 << 9;
    pub const CLIENT_SSL: u32 = 1 << 11;
    pub const CLIENT_TRANSACTIONS: u32 = 1 << 14;
    pub const CLIENT_SECURE_CONNECTION: u32 = 1 << 15;
    pub const CLIENT_MULTI_STATEMENTS: u32 = 1 << 16;
    pub const CLIENT_MULTI_RESULTS: u32 = 1 << 17;
    pub const CLIENT_PS_MULTI_RESULTS: u32 = 1 << 18;
    pub const CLIENT_PLUGIN_AUTH: u32 = 1 << 19;
    pub const CLIENT_SESSION_TRACK: u32 = 1 << 23;
    pub const CLIENT_DEPRECATE_EOF: u32 = 1 << 24;
    pub const CLIENT_OPTIONAL_RESULTSET_METADATA: u32 = 1 << 25;
    pub const CLIENT_QUERY_ATTRIBUTES: u32 = 1 << 27;

    /// Capabilities the relay core understands on either leg
    pub const RELAY_CAPABILITIES: u32 = CLIENT_LONG_PASSWORD
        | CLIENT_FOUND_ROWS
        | CLIENT_LONG_FLAG
        | CLIENT_CONNECT_WITH_DB
        | CLIENT_PROTOCOL_41
        | CLIENT_TRANSACTIONS
        | CLIENT_SECURE_CONNECTION
        | CLIENT_MULTI_STATEMENTS
        | CLIENT_MULTI_RESULTS
        | CLIENT_PS_MULTI_RESULTS
        | CLIENT_PLUGIN_AUTH
        | CLIENT_SESSION_TRACK
        | CLIENT_DEPRECATE_EOF
        | CLIENT_OPTIONAL_RESULTSET_METADATA
        | CLIENT_QUERY_ATTRIBUTES;

    pub fn deprecates_eof(caps: u32) -> bool {
        caps & CLIENT_DEPRECATE_EOF != 0
    }

    pub fn has_optional_metadata(caps: u32) -> bool {
        caps & CLIENT_OPTIONAL_RESULTSET_METADATA != 0
    }
}

/// Server status flags carried by OK and EOF packets
pub mod status {
    pub const SERVER_STATUS_IN_TRANS: u16 = 0x0001;
    pub const SERVER_STATUS_AUTOCOMMIT: u16 = 0x0002;
    pub const SERVER_MORE_RESULTS_EXISTS: u16 = 0x0008;
    pub const SERVER_STATUS_CURSOR_EXISTS: u16 = 0x0040;
    pub const SERVER_STATUS_LAST_ROW_SENT: u16 = 0x0080;
    pub const SERVER_SESSION_STATE_CHANGED: u16 = 0x4000;
}

/// MySQL command types
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Command {
    Sleep = 0x00,
    Quit = 0x01,
    InitDb = 0x02,
    Query = 0x03,
    FieldList = 0x04,
    Statistics = 0x09,
    ProcessKill = 0x0c,
    Debug = 0x0d,
    Ping = 0x0e,
    ChangeUser = 0x11,
    StmtPrepare = 0x16,
    StmtExecute = 0x17,
    StmtSendLongData = 0x18,
    StmtClose = 0x19,
    StmtReset = 0x1a,
    SetOption = 0x1b,
    StmtFetch = 0x1c,
    ResetConnection = 0x1f,
    Unknown = 0xff,
}

impl From<u8> for Command {
    fn from(value: u8) -> Self {
        match value {
            0x00 => Command::Sleep,
            0x01 => Command::Quit,
            0x02 => Command::InitDb,
            0x03 => Command::Query,
            0x04 => Command::FieldList,
            0x09 => Command::Statistics,
            0x0c => Command::ProcessKill,
            0x0d => Command::Debug,
            0x0e => Command::Ping,
            0x11 => Command::ChangeUser,
            0x16 => Command::StmtPrepare,
            0x17 => Command::StmtExecute,
            0x18 => Command::StmtSendLongData,
            0x19 => Command::StmtClose,
            0x1a => Command::StmtReset,
            0x1b => Command::SetOption,
            0x1c => Command::StmtFetch,
            0x1f => Command::ResetConnection,
            _ => Command::Unknown,
        }
    }
}

impl Command {
    /// Command byte of a raw request packet (header included)
    pub fn of_request(raw: &[u8]) -> Self {
        raw.get(PACKET_HEADER_SIZE)
            .copied()
            .map(Command::from)
            .unwrap_or(Command::Unknown)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn big_packet(first_seq: u8, payload_len: usize) -> Vec<u8> {
        let payload = vec![0xAB; payload_len];
        Packet::new(first_seq, payload).to_wire().to_vec()
    }

    #[test]
    fn test_encode_small_packet() {
        let wire = encode_packet(3, &[0x00, 0x01]);
        assert_eq!(&wire[..], &[0x02, 0x00, 0x00, 0x03, 0x00, 0x01]);
        assert_eq!(chunk_count(&wire), 1);
        assert_eq!(last_sequence(&wire), 3);
    }

    #[test]
    fn test_encode_exact_multiple_adds_empty_chunk() {
        let wire = big_packet(0, MAX_PACKET_SIZE);
        assert_eq!(wire.len(), CHUNK_STRIDE + PACKET_HEADER_SIZE);
        let headers: Vec<_> = chunks(&wire).map(|(_, h)| h).collect();
        assert_eq!(headers.len(), 2);
        assert_eq!(headers[0].payload_length, MAX_PACKET_SIZE);
        assert_eq!(headers[1].payload_length, 0);
        assert_eq!(headers[1].sequence_id, 1);
    }

    #[test]
    fn test_payload_joins_chunks() {
        let wire = big_packet(7, MAX_PACKET_SIZE + 10);
        let joined = payload(&wire);
        assert_eq!(joined.len(), MAX_PACKET_SIZE + 10);
        assert!(matches!(joined, Cow::Owned(_)));
        assert_eq!(first_sequence(&wire), 7);
        assert_eq!(last_sequence(&wire), 8);
    }

    #[test]
    fn test_payload_single_chunk_is_borrowed() {
        let wire = encode_packet(1, b"abc");
        let body = payload(&wire);
        assert!(matches!(body, Cow::Borrowed(_)));
        assert_eq!(body.as_ref(), b"abc");
    }

    #[test]
    fn test_renumber_plus_one_across_chunks() {
        let mut wire = big_packet(254, 2 * MAX_PACKET_SIZE + 5);
        let before: Vec<u8> = chunks(&wire).map(|(_, h)| h.sequence_id).collect();
        renumber(&mut wire, 1);
        let after: Vec<u8> = chunks(&wire).map(|(_, h)| h.sequence_id).collect();
        assert_eq!(before, vec![254, 255, 0]);
        assert_eq!(after, vec![255, 0, 1]);
    }

    #[test]
    fn test_renumber_minus_one_wraps() {
        let mut wire = encode_packet(0, b"row").to_vec();
        renumber(&mut wire, (-1i8) as u8);
        assert_eq!(first_sequence(&wire), 255);
        // payload untouched
        assert_eq!(&wire[4..], b"row");
    }

    #[test]
    fn test_renumber_is_stable_for_all_sequences() {
        for delta in [1u8, (-1i8) as u8] {
            for seq in 0..=255u8 {
                let mut wire = encode_packet(seq, b"x").to_vec();
                renumber(&mut wire, delta);
                assert_eq!(first_sequence(&wire), seq.wrapping_add(delta));
            }
        }
    }

    #[test]
    fn test_command_of_request() {
        let wire = encode_packet(0, b"\x03SELECT 1");
        assert_eq!(Command::of_request(&wire), Command::Query);
        assert_eq!(Command::of_request(&[0, 0, 0, 0]), Command::Unknown);
    }
}
