//! Protocol 41 column definitions.

use bytes::Bytes;

use super::codec::{PacketReader, PacketWriter};
use super::ProtocolError;

/// MySQL column type codes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum FieldType {
    Decimal = 0x00,
    Tiny = 0x01,
    Short = 0x02,
    Long = 0x03,
    Float = 0x04,
    Double = 0x05,
    Null = 0x06,
    Timestamp = 0x07,
    LongLong = 0x08,
    Int24 = 0x09,
    Date = 0x0A,
    Time = 0x0B,
    DateTime = 0x0C,
    Year = 0x0D,
    NewDate = 0x0E,
    VarChar = 0x0F,
    Bit = 0x10,
    Timestamp2 = 0x11,
    DateTime2 = 0x12,
    Time2 = 0x13,
    Json = 0xF5,
    NewDecimal = 0xF6,
    Enum = 0xF7,
    Set = 0xF8,
    TinyBlob = 0xF9,
    MediumBlob = 0xFA,
    LongBlob = 0xFB,
    Blob = 0xFC,
    VarString = 0xFD,
    String = 0xFE,
    Geometry = 0xFF,
}

impl From<u8> for FieldType {
    fn from(value: u8) -> Self {
        match value {
            0x00 => FieldType::Decimal,
            0x01 => FieldType::Tiny,
            0x02 => FieldType::Short,
            0x03 => FieldType::Long,
            0x04 => FieldType::Float,
            0x05 => FieldType::Double,
            0x06 => FieldType::Null,
            0x07 => FieldType::Timestamp,
            0x08 => FieldType::LongLong,
            0x09 => FieldType::Int24,
            0x0A => FieldType::Date,
            0x0B => FieldType::Time,
            0x0C => FieldType::DateTime,
            0x0D => FieldType::Year,
            0x0E => FieldType::NewDate,
            0x0F => FieldType::VarChar,
            0x10 => FieldType::Bit,
            0x11 => FieldType::Timestamp2,
            0x12 => FieldType::DateTime2,
            0x13 => FieldType::Time2,
            0xF5 => FieldType::Json,
            0xF6 => FieldType::NewDecimal,
            0xF7 => FieldType::Enum,
            0xF8 => FieldType::Set,
            0xF9 => FieldType::TinyBlob,
            0xFA => FieldType::MediumBlob,
            0xFB => FieldType::LongBlob,
            0xFC => FieldType::Blob,
            0xFD => FieldType::VarString,
            0xFF => FieldType::Geometry,
            // unknown codes travel as strings
            _ => FieldType::String,
        }
    }
}

/// Column definition flags
pub mod column_flags {
    pub const NOT_NULL: u16 = 1;
    pub const PRIMARY_KEY: u16 = 2;
    pub const UNIQUE_KEY: u16 = 4;
    pub const BLOB: u16 = 16;
    pub const UNSIGNED: u16 = 32;
    pub const BINARY: u16 = 128;
    pub const AUTO_INCREMENT: u16 = 512;
}

/// Column definition packet (protocol 41)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnDefinition {
    pub catalog: Bytes,
    pub schema: Bytes,
    pub table: Bytes,
    pub org_table: Bytes,
    pub name: Bytes,
    pub org_name: Bytes,
    pub charset: u16,
    pub column_length: u32,
    pub column_type: FieldType,
    pub flags: u16,
    pub decimals: u8,
}

impl ColumnDefinition {
    /// A minimal definition, used for synthesized result sets
    pub fn new(name: &str, column_type: FieldType) -> Self {
        Self {
            catalog: Bytes::from_static(b"def"),
            schema: Bytes::new(),
            table: Bytes::new(),
            org_table: Bytes::new(),
            name: Bytes::copy_from_slice(name.as_bytes()),
            org_name: Bytes::copy_from_slice(name.as_bytes()),
            charset: 33,
            column_length: 0,
            column_type,
            flags: 0,
            decimals: 0,
        }
    }

    pub fn with_flags(mut self, flags: u16) -> Self {
        self.flags = flags;
        self
    }

    pub fn parse(payload: &[u8]) -> Result<Self, ProtocolError> {
        let truncated = || ProtocolError::Truncated("column definition");
        let mut reader = PacketReader::new(payload);
        let string = |reader: &mut PacketReader<'_>| {
            reader
                .read_lenenc_bytes()
                .map(Bytes::copy_from_slice)
                .ok_or_else(truncated)
        };
        let catalog = string(&mut reader)?;
        let schema = string(&mut reader)?;
        let table = string(&mut reader)?;
        let org_table = string(&mut reader)?;
        let name = string(&mut reader)?;
        let org_name = string(&mut reader)?;

        // length of the fixed-size fields, always 0x0c
        reader.read_lenenc_int().ok_or_else(truncated)?;
        let charset = reader.read_u16_le().ok_or_else(truncated)?;
        let column_length = reader.read_u32_le().ok_or_else(truncated)?;
        let column_type = FieldType::from(reader.read_u8().ok_or_else(truncated)?);
        let flags = reader.read_u16_le().ok_or_else(truncated)?;
        let decimals = reader.read_u8().ok_or_else(truncated)?;

        Ok(Self {
            catalog,
            schema,
            table,
            org_table,
            name,
            org_name,
            charset,
            column_length,
            column_type,
            flags,
            decimals,
        })
    }

    pub fn encode_payload(&self) -> Bytes {
        let mut w = PacketWriter::with_capacity(64);
        w.write_lenenc_bytes(&self.catalog);
        w.write_lenenc_bytes(&self.schema);
        w.write_lenenc_bytes(&self.table);
        w.write_lenenc_bytes(&self.org_table);
        w.write_lenenc_bytes(&self.name);
        w.write_lenenc_bytes(&self.org_name);
        w.write_lenenc_int(0x0c);
        w.write_u16_le(self.charset);
        w.write_u32_le(self.column_length);
        w.write_u8(self.column_type as u8);
        w.write_u16_le(self.flags);
        w.write_u8(self.decimals);
        w.write_u16_le(0);
        w.freeze()
    }

    pub fn is_unsigned(&self) -> bool {
        self.flags & column_flags::UNSIGNED != 0
    }

    pub fn name_str(&self) -> std::borrow::Cow<'_, str> {
        String::from_utf8_lossy(&self.name)
    }
}
