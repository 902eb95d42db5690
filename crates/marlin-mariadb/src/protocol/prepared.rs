//! Binary protocol: COM_STMT_PREPARE, COM_STMT_EXECUTE and COM_STMT_CLOSE.
//!
//! 1. **Prepare**: the client sends the SQL; the server answers with a
//!    statement id, the parameter and column counts, then one column
//!    definition per parameter and per result column.
//! 2. **Execute**: the client sends the statement id and the parameters in
//!    binary form; the server answers with an OK packet or a binary result
//!    set.
//! 3. **Close**: the client sends the statement id; the server does not
//!    answer.

#![allow(clippy::cast_possible_truncation)]

use super::{Command, PacketReader, PacketWriter};
use crate::types::FieldType;
use marlin_core::{Buffer, Result, Value};

/// Parameter type flag marking an unsigned integer.
const PARAM_UNSIGNED: u8 = 0x80;

/// COM_STMT_PREPARE_OK.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StmtPrepareOk {
    pub statement_id: u32,
    /// Result columns (0 for statements without a result set)
    pub num_columns: u16,
    /// `?` placeholders
    pub num_params: u16,
    pub warnings: u16,
}

pub fn build_stmt_prepare_packet(sql: &str) -> Result<Buffer<'static, u8>> {
    super::build_command_packet(Command::StmtPrepare, sql.as_bytes())
}

/// Build COM_STMT_EXECUTE.
///
/// Layout: command, statement id, cursor flags (always no cursor), iteration
/// count (always 1), then for statements with parameters the NULL bitmap,
/// the new-params-bound flag, one (type, flags) pair per parameter and the
/// non-NULL values.
pub fn build_stmt_execute_packet(statement_id: u32, params: &[Value]) -> Result<Buffer<'static, u8>> {
    let mut writer = PacketWriter::with_capacity(16 + params.len() * 16);
    writer.write_u8(Command::StmtExecute as u8);
    writer.write_u32_le(statement_id);
    writer.write_u8(0x00);
    writer.write_u32_le(1);

    if !params.is_empty() {
        let mut null_bitmap = vec![0u8; params.len().div_ceil(8)];
        for (i, param) in params.iter().enumerate() {
            if param.is_null() {
                null_bitmap[i / 8] |= 1 << (i % 8);
            }
        }
        writer.write_bytes(&null_bitmap);

        writer.write_u8(1);
        for param in params {
            writer.write_u8(param_field_type(param) as u8);
            let flags = if matches!(param, Value::UnsignedBigInt(_)) {
                PARAM_UNSIGNED
            } else {
                0x00
            };
            writer.write_u8(flags);
        }

        for param in params {
            encode_binary_param(&mut writer, param);
        }
    }

    writer.build_packet(0)
}

pub fn build_stmt_close_packet(statement_id: u32) -> Result<Buffer<'static, u8>> {
    super::build_command_packet(Command::StmtClose, &statement_id.to_le_bytes())
}

/// Parse COM_STMT_PREPARE_OK: status `0x00`, statement id (4), column count
/// (2), parameter count (2), a reserved byte and the warning count (2).
pub fn parse_stmt_prepare_ok(data: &[u8]) -> Option<StmtPrepareOk> {
    let mut reader = PacketReader::new(data);
    if reader.read_u8()? != 0x00 {
        return None;
    }
    let statement_id = reader.read_u32_le()?;
    let num_columns = reader.read_u16_le()?;
    let num_params = reader.read_u16_le()?;
    reader.skip(1);
    let warnings = reader.read_u16_le().unwrap_or(0);
    Some(StmtPrepareOk {
        statement_id,
        num_columns,
        num_params,
        warnings,
    })
}

/// Wire type announced for a parameter.
pub fn param_field_type(value: &Value) -> FieldType {
    match value {
        Value::Null => FieldType::Null,
        Value::Bool(_) | Value::TinyInt(_) => FieldType::Tiny,
        Value::SmallInt(_) => FieldType::Short,
        Value::Int(_) => FieldType::Long,
        Value::BigInt(_) | Value::UnsignedBigInt(_) => FieldType::LongLong,
        Value::Float(_) => FieldType::Float,
        Value::Double(_) => FieldType::Double,
        Value::Decimal(_) => FieldType::NewDecimal,
        Value::Text(_) | Value::Temporal(_) | Value::Json(_) => FieldType::VarString,
        Value::Bytes(_) => FieldType::Blob,
    }
}

/// Append the binary encoding of one parameter. NULLs live in the bitmap
/// only.
fn encode_binary_param(writer: &mut PacketWriter, value: &Value) {
    match value {
        Value::Null => {}
        Value::Bool(b) => writer.write_u8(u8::from(*b)),
        Value::TinyInt(i) => writer.write_bytes(&i.to_le_bytes()),
        Value::SmallInt(i) => writer.write_bytes(&i.to_le_bytes()),
        Value::Int(i) => writer.write_bytes(&i.to_le_bytes()),
        Value::BigInt(i) => writer.write_bytes(&i.to_le_bytes()),
        Value::UnsignedBigInt(u) => writer.write_u64_le(*u),
        Value::Float(f) => writer.write_bytes(&f.to_le_bytes()),
        Value::Double(f) => writer.write_bytes(&f.to_le_bytes()),
        // Temporal values go as text; the server converts on assignment.
        Value::Decimal(s) | Value::Text(s) | Value::Temporal(s) => writer.write_lenenc_string(s),
        Value::Bytes(b) => writer.write_lenenc_bytes(b),
        Value::Json(j) => writer.write_lenenc_string(&j.to_string()),
    }
}
