//! Cursor-style readers and writers over a packet payload.
//!
//! Fixed-width little-endian integers, length-encoded integers and strings,
//! and null-terminated strings.

use bytes::{BufMut, Bytes, BytesMut};

/// Marker for a NULL column in a text row
pub const NULL_MARKER: u8 = 0xFB;

/// A reader over one packet payload
#[derive(Debug, Clone)]
pub struct PacketReader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> PacketReader<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    pub fn remaining(&self) -> usize {
        self.data.len().saturating_sub(self.pos)
    }

    pub fn is_empty(&self) -> bool {
        self.pos >= self.data.len()
    }

    pub fn position(&self) -> usize {
        self.pos
    }

    pub fn peek(&self) -> Option<u8> {
        self.data.get(self.pos).copied()
    }

    pub fn read_u8(&mut self) -> Option<u8> {
        let byte = self.data.get(self.pos)?;
        self.pos += 1;
        Some(*byte)
    }

    pub fn read_u16_le(&mut self) -> Option<u16> {
        let b = self.read_bytes(2)?;
        Some(u16::from_le_bytes([b[0], b[1]]))
    }

    pub fn read_u24_le(&mut self) -> Option<u32> {
        let b = self.read_bytes(3)?;
        Some(u32::from(b[0]) | (u32::from(b[1]) << 8) | (u32::from(b[2]) << 16))
    }

    pub fn read_u32_le(&mut self) -> Option<u32> {
        let b = self.read_bytes(4)?;
        Some(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    pub fn read_u64_le(&mut self) -> Option<u64> {
        let b = self.read_bytes(8)?;
        let mut raw = [0u8; 8];
        raw.copy_from_slice(b);
        Some(u64::from_le_bytes(raw))
    }

    pub fn read_f32_le(&mut self) -> Option<f32> {
        self.read_u32_le().map(f32::from_bits)
    }

    pub fn read_f64_le(&mut self) -> Option<f64> {
        self.read_u64_le().map(f64::from_bits)
    }

    /// Read a length-encoded integer.
    ///
    /// - 0x00-0xFA: 1-byte value
    /// - 0xFC: 2-byte value follows
    /// - 0xFD: 3-byte value follows
    /// - 0xFE: 8-byte value follows
    /// - 0xFB (NULL) and 0xFF are not integers
    pub fn read_lenenc_int(&mut self) -> Option<u64> {
        let first = self.read_u8()?;
        match first {
            0x00..=0xFA => Some(u64::from(first)),
            0xFC => self.read_u16_le().map(u64::from),
            0xFD => self.read_u24_le().map(u64::from),
            0xFE => self.read_u64_le(),
            0xFB | 0xFF => None,
        }
    }

    pub fn read_lenenc_bytes(&mut self) -> Option<&'a [u8]> {
        let len = usize::try_from(self.read_lenenc_int()?).ok()?;
        self.read_bytes(len)
    }

    /// Length-encoded string that may be NULL (text row columns)
    pub fn read_lenenc_nullable(&mut self) -> Option<Option<&'a [u8]>> {
        if self.peek()? == NULL_MARKER {
            self.pos += 1;
            return Some(None);
        }
        self.read_lenenc_bytes().map(Some)
    }

    pub fn read_lenenc_string(&mut self) -> Option<String> {
        self.read_lenenc_bytes()
            .map(|b| String::from_utf8_lossy(b).into_owned())
    }

    /// Read a null-terminated string; a missing terminator ends at the payload end
    pub fn read_null_string(&mut self) -> Option<&'a [u8]> {
        if self.is_empty() {
            return None;
        }
        let rest = &self.data[self.pos..];
        let len = rest.iter().position(|&b| b == 0).unwrap_or(rest.len());
        self.pos += len;
        if self.pos < self.data.len() {
            self.pos += 1;
        }
        Some(&rest[..len])
    }

    pub fn read_bytes(&mut self, len: usize) -> Option<&'a [u8]> {
        if self.remaining() < len {
            return None;
        }
        let bytes = &self.data[self.pos..self.pos + len];
        self.pos += len;
        Some(bytes)
    }

    pub fn read_rest(&mut self) -> &'a [u8] {
        let rest = &self.data[self.pos.min(self.data.len())..];
        self.pos = self.data.len();
        rest
    }

    pub fn skip(&mut self, n: usize) -> Option<()> {
        self.read_bytes(n).map(|_| ())
    }
}

/// A writer that builds one packet payload
#[derive(Debug, Default)]
pub struct PacketWriter {
    buf: BytesMut,
}

impl PacketWriter {
    pub fn new() -> Self {
        Self::with_capacity(64)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            buf: BytesMut::with_capacity(capacity),
        }
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn write_u8(&mut self, value: u8) {
        self.buf.put_u8(value);
    }

    pub fn write_u16_le(&mut self, value: u16) {
        self.buf.put_u16_le(value);
    }

    pub fn write_u24_le(&mut self, value: u32) {
        self.buf.put_u8((value & 0xFF) as u8);
        self.buf.put_u8(((value >> 8) & 0xFF) as u8);
        self.buf.put_u8(((value >> 16) & 0xFF) as u8);
    }

    pub fn write_u32_le(&mut self, value: u32) {
        self.buf.put_u32_le(value);
    }

    pub fn write_u64_le(&mut self, value: u64) {
        self.buf.put_u64_le(value);
    }

    pub fn write_f32_le(&mut self, value: f32) {
        self.buf.put_f32_le(value);
    }

    pub fn write_f64_le(&mut self, value: f64) {
        self.buf.put_f64_le(value);
    }

    /// Write a length-encoded integer in its shortest form
    pub fn write_lenenc_int(&mut self, value: u64) {
        if value < 251 {
            self.write_u8(value as u8);
        } else if value < 0x1_0000 {
            self.write_u8(0xFC);
            self.write_u16_le(value as u16);
        } else if value < 0x100_0000 {
            self.write_u8(0xFD);
            self.write_u24_le(value as u32);
        } else {
            self.write_u8(0xFE);
            self.write_u64_le(value);
        }
    }

    pub fn write_lenenc_bytes(&mut self, data: &[u8]) {
        self.write_lenenc_int(data.len() as u64);
        self.buf.extend_from_slice(data);
    }

    pub fn write_lenenc_nullable(&mut self, data: Option<&[u8]>) {
        match data {
            Some(data) => self.write_lenenc_bytes(data),
            None => self.write_u8(NULL_MARKER),
        }
    }

    pub fn write_null_string(&mut self, data: &[u8]) {
        self.buf.extend_from_slice(data);
        self.buf.put_u8(0);
    }

    pub fn write_bytes(&mut self, data: &[u8]) {
        self.buf.extend_from_slice(data);
    }

    pub fn freeze(self) -> Bytes {
        self.buf.freeze()
    }
}
