//! Column types, column definitions and row decoding.
//!
//! The text protocol sends every value as a string; the binary protocol
//! (prepared statements) sends type-specific encodings behind a NULL bitmap.
//! Both decode into [`marlin_core::Value`]. Unsigned integers widen to the
//! next signed type so no value is reinterpreted.

#![allow(clippy::cast_possible_truncation)]

use crate::protocol::PacketReader;
use marlin_core::{Error, ProtocolError, Result, Value};

/// Field type codes (`MYSQL_TYPE_*`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
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

impl FieldType {
    /// Map a type byte; unknown codes are treated as strings.
    pub fn from_u8(value: u8) -> Self {
        match value {
            0x00 => FieldType::Decimal,
            0x01 => FieldType::Tiny,
            0x02 => FieldType::Short,
            0x03 => FieldType::Long,
            0x04 => FieldType::Float,
            0x05 => FieldType::Double,
            0x06 => FieldType::Null,
            0x07 | 0x11 => FieldType::Timestamp,
            0x08 => FieldType::LongLong,
            0x09 => FieldType::Int24,
            0x0A => FieldType::Date,
            0x0B | 0x13 => FieldType::Time,
            0x0C | 0x12 => FieldType::DateTime,
            0x0D => FieldType::Year,
            0x0E => FieldType::NewDate,
            0x0F => FieldType::VarChar,
            0x10 => FieldType::Bit,
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
            _ => FieldType::String,
        }
    }

    pub const fn is_integer(self) -> bool {
        matches!(
            self,
            FieldType::Tiny
                | FieldType::Short
                | FieldType::Long
                | FieldType::LongLong
                | FieldType::Int24
                | FieldType::Year
        )
    }

    pub const fn is_temporal(self) -> bool {
        matches!(
            self,
            FieldType::Date
                | FieldType::NewDate
                | FieldType::Time
                | FieldType::DateTime
                | FieldType::Timestamp
        )
    }

    pub const fn is_blob(self) -> bool {
        matches!(
            self,
            FieldType::TinyBlob
                | FieldType::MediumBlob
                | FieldType::LongBlob
                | FieldType::Blob
                | FieldType::Geometry
                | FieldType::Bit
        )
    }

    /// Size of the binary encoding for fixed-width types.
    pub const fn binary_width(self) -> Option<usize> {
        match self {
            FieldType::Tiny => Some(1),
            FieldType::Short | FieldType::Year => Some(2),
            FieldType::Long | FieldType::Int24 | FieldType::Float => Some(4),
            FieldType::LongLong | FieldType::Double => Some(8),
            FieldType::Null => Some(0),
            _ => None,
        }
    }
}

/// Column definition flags.
pub mod column_flags {
    pub const NOT_NULL: u16 = 1;
    pub const PRIMARY_KEY: u16 = 2;
    pub const UNIQUE_KEY: u16 = 4;
    pub const BLOB: u16 = 16;
    pub const UNSIGNED: u16 = 32;
    pub const BINARY: u16 = 128;
    pub const AUTO_INCREMENT: u16 = 512;
}

/// Collation id of binary (non-text) columns.
const BINARY_COLLATION: u16 = 63;

/// Column definition (ColumnDefinition41).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnDef {
    pub schema: String,
    pub table: String,
    pub org_table: String,
    /// Column name or alias
    pub name: String,
    pub org_name: String,
    pub charset: u16,
    pub column_length: u32,
    pub column_type: FieldType,
    pub flags: u16,
    pub decimals: u8,
}

impl ColumnDef {
    /// A bare definition, as used for prepared-statement parameters and
    /// tests.
    pub fn new(name: impl Into<String>, column_type: FieldType) -> Self {
        Self {
            schema: String::new(),
            table: String::new(),
            org_table: String::new(),
            name: name.into(),
            org_name: String::new(),
            charset: 33,
            column_length: 0,
            column_type,
            flags: 0,
            decimals: 0,
        }
    }

    /// Parse a column definition packet.
    pub fn parse(payload: &[u8]) -> Result<Self> {
        let mut reader = PacketReader::new(payload);
        let mut text = |what: &str| {
            reader
                .read_lenenc_string()
                .ok_or_else(|| malformed(format!("column definition: missing {what}"), payload))
        };
        let _catalog = text("catalog")?;
        let schema = text("schema")?;
        let table = text("table")?;
        let org_table = text("org_table")?;
        let name = text("name")?;
        let org_name = text("org_name")?;

        let fixed = || malformed("column definition: truncated fixed fields", payload);
        // Length of the fixed-length fields, always 0x0c.
        reader.read_lenenc_int().ok_or_else(fixed)?;
        let charset = reader.read_u16_le().ok_or_else(fixed)?;
        let column_length = reader.read_u32_le().ok_or_else(fixed)?;
        let column_type = FieldType::from_u8(reader.read_u8().ok_or_else(fixed)?);
        let flags = reader.read_u16_le().ok_or_else(fixed)?;
        let decimals = reader.read_u8().ok_or_else(fixed)?;

        Ok(Self {
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

    pub const fn is_unsigned(&self) -> bool {
        self.flags & column_flags::UNSIGNED != 0
    }

    pub const fn is_not_null(&self) -> bool {
        self.flags & column_flags::NOT_NULL != 0
    }

    /// Binary string or blob rather than text.
    pub const fn is_binary(&self) -> bool {
        self.charset == BINARY_COLLATION
    }
}

fn malformed(message: impl Into<String>, raw: &[u8]) -> Error {
    Error::Protocol(ProtocolError {
        message: message.into(),
        raw_data: Some(raw.to_vec()),
    })
}

fn text_or<T: std::str::FromStr>(text: &str, wrap: impl FnOnce(T) -> Value) -> Value {
    text.parse::<T>()
        .map_or_else(|_| Value::Text(text.to_string()), wrap)
}

/// Decode one text-protocol field.
pub fn decode_text_value(column: &ColumnDef, data: &[u8]) -> Value {
    let unsigned = column.is_unsigned();
    let binary_string = column.is_binary()
        && (column.column_type.is_blob()
            || matches!(
                column.column_type,
                FieldType::VarChar | FieldType::VarString | FieldType::String
            ));
    if binary_string || column.column_type == FieldType::Bit {
        return Value::Bytes(data.to_vec());
    }
    let text = String::from_utf8_lossy(data);
    match column.column_type {
        FieldType::Tiny if unsigned => text_or::<u8>(&text, |v| Value::SmallInt(i16::from(v))),
        FieldType::Tiny => text_or(&text, Value::TinyInt),
        FieldType::Short if unsigned => text_or::<u16>(&text, |v| Value::Int(i32::from(v))),
        FieldType::Short | FieldType::Year => text_or(&text, Value::SmallInt),
        FieldType::Long | FieldType::Int24 if unsigned => {
            text_or::<u32>(&text, |v| Value::BigInt(i64::from(v)))
        }
        FieldType::Long | FieldType::Int24 => text_or(&text, Value::Int),
        FieldType::LongLong if unsigned => text_or(&text, Value::UnsignedBigInt),
        FieldType::LongLong => text_or(&text, Value::BigInt),
        FieldType::Float => text_or(&text, Value::Float),
        FieldType::Double => text_or(&text, Value::Double),
        FieldType::Decimal | FieldType::NewDecimal => Value::Decimal(text.into_owned()),
        FieldType::Json => serde_json::from_str(&text)
            .map_or_else(|_| Value::Text(text.into_owned()), Value::Json),
        FieldType::Null => Value::Null,
        t if t.is_temporal() => Value::Temporal(text.into_owned()),
        _ => Value::Text(text.into_owned()),
    }
}

/// Decode a text-protocol row.
pub fn decode_text_row(columns: &[ColumnDef], payload: &[u8]) -> Result<Vec<Value>> {
    let mut reader = PacketReader::new(payload);
    columns
        .iter()
        .map(|column| match reader.read_lenenc_field() {
            Some(Some(data)) => Ok(decode_text_value(column, data)),
            Some(None) => Ok(Value::Null),
            None => Err(malformed(
                format!("text row truncated at column '{}'", column.name),
                payload,
            )),
        })
        .collect()
}

/// Decode a binary-protocol row.
///
/// Layout: a `0x00` header, a NULL bitmap of `(columns + 7 + 2) / 8` bytes
/// whose first two bits are reserved, then the non-NULL values in order.
pub fn decode_binary_row(columns: &[ColumnDef], payload: &[u8]) -> Result<Vec<Value>> {
    let mut reader = PacketReader::new(payload);
    if reader.read_u8() != Some(0x00) {
        return Err(malformed("binary row: missing 0x00 header", payload));
    }
    let bitmap = reader
        .read_bytes((columns.len() + 7 + 2) / 8)
        .ok_or_else(|| malformed("binary row: truncated NULL bitmap", payload))?;

    let mut values = Vec::with_capacity(columns.len());
    for (i, column) in columns.iter().enumerate() {
        let bit = i + 2;
        if bitmap[bit / 8] & (1 << (bit % 8)) != 0 {
            values.push(Value::Null);
            continue;
        }
        let value = decode_binary_value(column, &mut reader).ok_or_else(|| {
            malformed(
                format!("binary row truncated at column '{}'", column.name),
                payload,
            )
        })?;
        values.push(value);
    }
    Ok(values)
}

/// Decode one binary value, consuming exactly its encoding from `reader`.
pub fn decode_binary_value(column: &ColumnDef, reader: &mut PacketReader<'_>) -> Option<Value> {
    let unsigned = column.is_unsigned();
    let value = match column.column_type {
        FieldType::Null => Value::Null,
        FieldType::Tiny if unsigned => Value::SmallInt(i16::from(reader.read_u8()?)),
        FieldType::Tiny => Value::TinyInt(reader.read_i8()?),
        FieldType::Short | FieldType::Year if unsigned => {
            Value::Int(i32::from(reader.read_u16_le()?))
        }
        FieldType::Short | FieldType::Year => Value::SmallInt(reader.read_i16_le()?),
        FieldType::Long | FieldType::Int24 if unsigned => {
            Value::BigInt(i64::from(reader.read_u32_le()?))
        }
        FieldType::Long | FieldType::Int24 => Value::Int(reader.read_i32_le()?),
        FieldType::LongLong if unsigned => Value::UnsignedBigInt(reader.read_u64_le()?),
        FieldType::LongLong => Value::BigInt(reader.read_i64_le()?),
        FieldType::Float => Value::Float(reader.read_f32_le()?),
        FieldType::Double => Value::Double(reader.read_f64_le()?),
        FieldType::Date | FieldType::NewDate => {
            let len = usize::from(reader.read_u8()?);
            Value::Temporal(decode_binary_date(reader.read_bytes(len)?, false))
        }
        FieldType::DateTime | FieldType::Timestamp => {
            let len = usize::from(reader.read_u8()?);
            Value::Temporal(decode_binary_date(reader.read_bytes(len)?, true))
        }
        FieldType::Time => {
            let len = usize::from(reader.read_u8()?);
            Value::Temporal(decode_binary_time(reader.read_bytes(len)?))
        }
        _ => decode_text_value(column, reader.read_lenenc_bytes()?),
    };
    Some(value)
}

/// `YYYY-MM-DD[ hh:mm:ss[.ffffff]]` from the binary DATE/DATETIME layout.
fn decode_binary_date(data: &[u8], with_time: bool) -> String {
    let mut reader = PacketReader::new(data);
    let year = reader.read_u16_le().unwrap_or(0);
    let month = reader.read_u8().unwrap_or(0);
    let day = reader.read_u8().unwrap_or(0);
    let mut out = format!("{year:04}-{month:02}-{day:02}");
    if with_time {
        let hour = reader.read_u8().unwrap_or(0);
        let minute = reader.read_u8().unwrap_or(0);
        let second = reader.read_u8().unwrap_or(0);
        out.push_str(&format!(" {hour:02}:{minute:02}:{second:02}"));
        if let Some(micros) = reader.read_u32_le() {
            out.push_str(&format!(".{micros:06}"));
        }
    }
    out
}

/// `[-]hh:mm:ss[.ffffff]` from the binary TIME layout; days fold into hours.
fn decode_binary_time(data: &[u8]) -> String {
    let mut reader = PacketReader::new(data);
    let negative = reader.read_u8().unwrap_or(0) != 0;
    let days = reader.read_u32_le().unwrap_or(0);
    let hours = u64::from(days) * 24 + u64::from(reader.read_u8().unwrap_or(0));
    let minutes = reader.read_u8().unwrap_or(0);
    let seconds = reader.read_u8().unwrap_or(0);
    let sign = if negative { "-" } else { "" };
    let mut out = format!("{sign}{hours:02}:{minutes:02}:{seconds:02}");
    if let Some(micros) = reader.read_u32_le() {
        out.push_str(&format!(".{micros:06}"));
    }
    out
}
