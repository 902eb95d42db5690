//! Dynamic SQL values exchanged with the server.
//!
//! Only the shapes the wire codec needs: statement parameters going out and
//! decoded column values coming back. Conversion into application types is
//! left to callers.

use serde::{Deserialize, Serialize};

/// One column value or statement parameter.
///
/// Integer variants follow the MariaDB column widths. Unsigned columns are
/// widened into the next signed variant on decode, except `BIGINT UNSIGNED`
/// which keeps its own variant.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Value {
    Null,
    Bool(bool),
    TinyInt(i8),
    SmallInt(i16),
    Int(i32),
    BigInt(i64),
    UnsignedBigInt(u64),
    Float(f32),
    Double(f64),
    /// DECIMAL/NUMERIC, kept as the server's text to avoid rounding.
    Decimal(String),
    Text(String),
    Bytes(Vec<u8>),
    /// DATE, DATETIME, TIMESTAMP or TIME as text, e.g.
    /// `2024-03-09 13:14:15.123456` or `-26:03:04`.
    Temporal(String),
    Json(serde_json::Value),
}

impl Value {
    pub const fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    /// Integer view. Text and decimals are parsed; `BIGINT UNSIGNED`
    /// values above `i64::MAX` give `None`.
    pub fn as_i64(&self) -> Option<i64> {
        match *self {
            Value::Bool(b) => Some(i64::from(b)),
            Value::TinyInt(n) => Some(n.into()),
            Value::SmallInt(n) => Some(n.into()),
            Value::Int(n) => Some(n.into()),
            Value::BigInt(n) => Some(n),
            Value::UnsignedBigInt(n) => i64::try_from(n).ok(),
            Value::Text(ref s) | Value::Decimal(ref s) => s.trim().parse().ok(),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match *self {
            Value::Float(x) => Some(x.into()),
            Value::Double(x) => Some(x),
            Value::Text(ref s) | Value::Decimal(ref s) => s.trim().parse().ok(),
            _ => self.as_i64().map(|n| n as f64),
        }
    }

    /// Text view of string-like values.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Text(s) | Value::Decimal(s) | Value::Temporal(s) => Some(s.as_str()),
            _ => None,
        }
    }

    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Value::Bytes(b) => Some(b.as_slice()),
            Value::Text(s) => Some(s.as_bytes()),
            _ => None,
        }
    }
}

macro_rules! value_from {
    ($($ty:ty => $variant:ident),* $(,)?) => {
        $(
            impl From<$ty> for Value {
                fn from(v: $ty) -> Self {
                    Value::$variant(v)
                }
            }
        )*
    };
}

value_from! {
    bool => Bool,
    i8 => TinyInt,
    i16 => SmallInt,
    i32 => Int,
    i64 => BigInt,
    u64 => UnsignedBigInt,
    f32 => Float,
    f64 => Double,
    String => Text,
    Vec<u8> => Bytes,
    serde_json::Value => Json,
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::Text(s.to_owned())
    }
}

impl From<&[u8]> for Value {
    fn from(b: &[u8]) -> Self {
        Value::Bytes(b.to_owned())
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(v: Option<T>) -> Self {
        v.map_or(Value::Null, Into::into)
    }
}
