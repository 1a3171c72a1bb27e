//! Text and binary result rows.

use bytes::Bytes;

use super::codec::{PacketReader, PacketWriter};
use super::column::{ColumnDefinition, FieldType};
use super::ProtocolError;

/// Binary row header byte
const BINARY_ROW_HEADER: u8 = 0x00;
/// The first two bits of a binary row null bitmap are reserved
const NULL_BITMAP_OFFSET: usize = 2;

/// A typed value of a binary protocol row
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null,
    Int(i64),
    UInt(u64),
    Float(f32),
    Double(f64),
    Date {
        year: u16,
        month: u8,
        day: u8,
    },
    DateTime {
        year: u16,
        month: u8,
        day: u8,
        hour: u8,
        minute: u8,
        second: u8,
        micros: u32,
    },
    Time {
        negative: bool,
        days: u32,
        hours: u8,
        minutes: u8,
        seconds: u8,
        micros: u32,
    },
    Bytes(Bytes),
}

impl Value {
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }
}

/// One decoded row
#[derive(Debug, Clone, PartialEq)]
pub enum Row {
    Text(Vec<Option<Bytes>>),
    Binary(Vec<Value>),
}

impl Row {
    pub fn len(&self) -> usize {
        match self {
            Row::Text(values) => values.len(),
            Row::Binary(values) => values.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Raw text of column `idx`, `None` for SQL NULL or a binary row
    pub fn text(&self, idx: usize) -> Option<&[u8]> {
        match self {
            Row::Text(values) => values.get(idx)?.as_deref(),
            Row::Binary(_) => None,
        }
    }
}

/// Decode a text protocol row of `columns` values
pub fn decode_text_row(payload: &[u8], columns: usize) -> Result<Vec<Option<Bytes>>, ProtocolError> {
    let mut reader = PacketReader::new(payload);
    let mut values = Vec::with_capacity(columns);
    for _ in 0..columns {
        let value = reader
            .read_lenenc_nullable()
            .ok_or(ProtocolError::Truncated("text row"))?;
        values.push(value.map(Bytes::copy_from_slice));
    }
    if !reader.is_empty() {
        return Err(ProtocolError::Violation(format!(
            "text row has {} trailing bytes",
            reader.remaining()
        )));
    }
    Ok(values)
}

pub fn encode_text_row(values: &[Option<Bytes>]) -> Bytes {
    let mut w = PacketWriter::new();
    for value in values {
        w.write_lenenc_nullable(value.as_deref());
    }
    w.freeze()
}

fn null_bitmap_len(columns: usize) -> usize {
    (columns + 7 + NULL_BITMAP_OFFSET) / 8
}

/// Decode a binary protocol row against its column definitions
pub fn decode_binary_row(
    payload: &[u8],
    columns: &[ColumnDefinition],
) -> Result<Vec<Value>, ProtocolError> {
    let truncated = || ProtocolError::Truncated("binary row");
    let mut reader = PacketReader::new(payload);
    if reader.read_u8() != Some(BINARY_ROW_HEADER) {
        return Err(ProtocolError::unexpected("binary row", payload));
    }
    let bitmap = reader
        .read_bytes(null_bitmap_len(columns.len()))
        .ok_or_else(truncated)?;

    let mut values = Vec::with_capacity(columns.len());
    for (idx, column) in columns.iter().enumerate() {
        let bit = idx + NULL_BITMAP_OFFSET;
        if bitmap[bit / 8] & (1 << (bit % 8)) != 0 {
            values.push(Value::Null);
            continue;
        }
        let value = decode_binary_value(&mut reader, column).ok_or_else(truncated)?;
        values.push(value);
    }
    Ok(values)
}

fn decode_binary_value(reader: &mut PacketReader<'_>, column: &ColumnDefinition) -> Option<Value> {
    let unsigned = column.is_unsigned();
    let int = |raw: u64, width: u32| -> Value {
        if unsigned {
            Value::UInt(raw)
        } else {
            // sign-extend from `width` bits
            let shift = 64 - width;
            Value::Int(((raw << shift) as i64) >> shift)
        }
    };
    let value = match column.column_type {
        FieldType::Tiny => int(u64::from(reader.read_u8()?), 8),
        FieldType::Short | FieldType::Year => int(u64::from(reader.read_u16_le()?), 16),
        FieldType::Long | FieldType::Int24 => int(u64::from(reader.read_u32_le()?), 32),
        FieldType::LongLong => int(reader.read_u64_le()?, 64),
        FieldType::Float => Value::Float(reader.read_f32_le()?),
        FieldType::Double => Value::Double(reader.read_f64_le()?),
        FieldType::Null => Value::Null,
        FieldType::Date
        | FieldType::NewDate
        | FieldType::DateTime
        | FieldType::DateTime2
        | FieldType::Timestamp
        | FieldType::Timestamp2 => decode_datetime(reader, column.column_type)?,
        FieldType::Time | FieldType::Time2 => decode_time(reader)?,
        _ => Value::Bytes(Bytes::copy_from_slice(reader.read_lenenc_bytes()?)),
    };
    Some(value)
}

fn decode_datetime(reader: &mut PacketReader<'_>, field_type: FieldType) -> Option<Value> {
    let len = reader.read_u8()?;
    let (mut year, mut month, mut day) = (0, 0, 0);
    let (mut hour, mut minute, mut second, mut micros) = (0, 0, 0, 0);
    if len >= 4 {
        year = reader.read_u16_le()?;
        month = reader.read_u8()?;
        day = reader.read_u8()?;
    }
    if len >= 7 {
        hour = reader.read_u8()?;
        minute = reader.read_u8()?;
        second = reader.read_u8()?;
    }
    if len >= 11 {
        micros = reader.read_u32_le()?;
    }
    if matches!(field_type, FieldType::Date | FieldType::NewDate) {
        return Some(Value::Date { year, month, day });
    }
    Some(Value::DateTime {
        year,
        month,
        day,
        hour,
        minute,
        second,
        micros,
    })
}

fn decode_time(reader: &mut PacketReader<'_>) -> Option<Value> {
    let len = reader.read_u8()?;
    let (mut negative, mut days, mut hours, mut minutes, mut seconds, mut micros) =
        (false, 0, 0, 0, 0, 0);
    if len >= 8 {
        negative = reader.read_u8()? != 0;
        days = reader.read_u32_le()?;
        hours = reader.read_u8()?;
        minutes = reader.read_u8()?;
        seconds = reader.read_u8()?;
    }
    if len >= 12 {
        micros = reader.read_u32_le()?;
    }
    Some(Value::Time {
        negative,
        days,
        hours,
        minutes,
        seconds,
        micros,
    })
}

/// Encode a binary protocol row; values are written at the width their column declares
pub fn encode_binary_row(
    values: &[Value],
    columns: &[ColumnDefinition],
) -> Result<Bytes, ProtocolError> {
    if values.len() != columns.len() {
        return Err(ProtocolError::Violation(format!(
            "binary row has {} values for {} columns",
            values.len(),
            columns.len()
        )));
    }
    let mut bitmap = vec![0u8; null_bitmap_len(columns.len())];
    let mut body = PacketWriter::new();
    for (idx, (value, column)) in values.iter().zip(columns).enumerate() {
        if value.is_null() {
            let bit = idx + NULL_BITMAP_OFFSET;
            bitmap[bit / 8] |= 1 << (bit % 8);
            continue;
        }
        encode_binary_value(&mut body, value, column)?;
    }

    let body = body.freeze();
    let mut w = PacketWriter::with_capacity(1 + bitmap.len() + body.len());
    w.write_u8(BINARY_ROW_HEADER);
    w.write_bytes(&bitmap);
    w.write_bytes(&body);
    Ok(w.freeze())
}

fn encode_binary_value(
    w: &mut PacketWriter,
    value: &Value,
    column: &ColumnDefinition,
) -> Result<(), ProtocolError> {
    let raw_int = match value {
        Value::Int(v) => Some(*v as u64),
        Value::UInt(v) => Some(*v),
        _ => None,
    };
    match (column.column_type, raw_int, value) {
        (FieldType::Tiny, Some(v), _) => w.write_u8(v as u8),
        (FieldType::Short | FieldType::Year, Some(v), _) => w.write_u16_le(v as u16),
        (FieldType::Long | FieldType::Int24, Some(v), _) => w.write_u32_le(v as u32),
        (FieldType::LongLong, Some(v), _) => w.write_u64_le(v),
        (FieldType::Float, _, Value::Float(v)) => w.write_f32_le(*v),
        (FieldType::Double, _, Value::Double(v)) => w.write_f64_le(*v),
        (_, _, Value::Date { year, month, day }) => {
            if *year == 0 && *month == 0 && *day == 0 {
                w.write_u8(0);
            } else {
                w.write_u8(4);
                w.write_u16_le(*year);
                w.write_u8(*month);
                w.write_u8(*day);
            }
        }
        (
            _,
            _,
            Value::DateTime {
                year,
                month,
                day,
                hour,
                minute,
                second,
                micros,
            },
        ) => {
            let len = if *micros != 0 {
                11
            } else if *hour != 0 || *minute != 0 || *second != 0 {
                7
            } else if *year != 0 || *month != 0 || *day != 0 {
                4
            } else {
                0
            };
            w.write_u8(len);
            if len >= 4 {
                w.write_u16_le(*year);
                w.write_u8(*month);
                w.write_u8(*day);
            }
            if len >= 7 {
                w.write_u8(*hour);
                w.write_u8(*minute);
                w.write_u8(*second);
            }
            if len >= 11 {
                w.write_u32_le(*micros);
            }
        }
        (
            _,
            _,
            Value::Time {
                negative,
                days,
                hours,
                minutes,
                seconds,
                micros,
            },
        ) => {
            let zero = !*negative && *days == 0 && *hours == 0 && *minutes == 0 && *seconds == 0;
            let len = if *micros != 0 {
                12
            } else if zero {
                0
            } else {
                8
            };
            w.write_u8(len);
            if len >= 8 {
                w.write_u8(u8::from(*negative));
                w.write_u32_le(*days);
                w.write_u8(*hours);
                w.write_u8(*minutes);
                w.write_u8(*seconds);
            }
            if len >= 12 {
                w.write_u32_le(*micros);
            }
        }
        (_, _, Value::Bytes(data)) => w.write_lenenc_bytes(data),
        (column_type, _, value) => {
            return Err(ProtocolError::Violation(format!(
                "cannot encode {value:?} as {column_type:?}"
            )))
        }
    }
    Ok(())
}
