//! Typed values exchanged between datasets and the store.
//!
//! The type vocabulary is intentionally small and maps one-to-one onto both
//! the embedded Arrow representation and the ClickHouse column types:
//!
//! | `ColumnType` | Arrow | ClickHouse |
//! |--------------|-------|------------|
//! | `Varchar` | `Utf8` | `String` |
//! | `BigInt` | `Int64` | `Int64` |
//! | `Integer` | `Int32` | `Int32` |
//! | `Double` | `Float64` | `Float64` |
//! | `Boolean` | `UInt8` | `UInt8` |
//! | `Timestamp` | `Timestamp(µs, UTC)` | `DateTime64(6, 'UTC')` |
//!
//! Booleans are physically 0/1 flags so that predicates such as
//! `is_deleted = 0` behave the same on every backend.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Declarative column type vocabulary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ColumnType {
    /// Variable-length UTF-8 string.
    Varchar,
    /// 64-bit signed integer.
    BigInt,
    /// 32-bit signed integer.
    Integer,
    /// 64-bit float.
    Double,
    /// Boolean flag.
    Boolean,
    /// UTC timestamp with microsecond precision.
    Timestamp,
}

impl ColumnType {
    /// SQL name of the type.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Varchar => "VARCHAR",
            Self::BigInt => "BIGINT",
            Self::Integer => "INTEGER",
            Self::Double => "DOUBLE",
            Self::Boolean => "BOOLEAN",
            Self::Timestamp => "TIMESTAMP",
        }
    }

    /// Returns true if `value` can be stored in a column of this type.
    #[must_use]
    pub fn accepts(self, value: &Value) -> bool {
        matches!(
            (self, value),
            (_, Value::Null)
                | (Self::Varchar, Value::String(_))
                | (Self::BigInt, Value::Int64(_) | Value::Int32(_))
                | (Self::Integer, Value::Int32(_))
                | (Self::Double, Value::Float64(_) | Value::Int64(_) | Value::Int32(_))
                | (Self::Boolean, Value::Bool(_))
                | (Self::Timestamp, Value::Timestamp(_))
        )
    }
}

impl fmt::Display for ColumnType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single column value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Value {
    /// SQL NULL.
    Null,
    /// String value.
    String(String),
    /// 64-bit integer.
    Int64(i64),
    /// 32-bit integer.
    Int32(i32),
    /// 64-bit float.
    Float64(f64),
    /// Boolean.
    Bool(bool),
    /// UTC timestamp.
    Timestamp(DateTime<Utc>),
}

/// A row keyed by column name.
pub type Record = BTreeMap<String, Value>;

impl Value {
    /// Returns true for [`Value::Null`].
    #[must_use]
    pub const fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }

    /// Returns the string payload, if any.
    #[must_use]
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::String(s) => Some(s),
            _ => None,
        }
    }

    /// Returns the value as an `i64`, widening 32-bit integers.
    #[must_use]
    pub const fn as_i64(&self) -> Option<i64> {
        match self {
            Self::Int64(v) => Some(*v),
            Self::Int32(v) => Some(*v as i64),
            _ => None,
        }
    }

    /// Returns the value as an `f64`.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub const fn as_f64(&self) -> Option<f64> {
        match self {
            Self::Float64(v) => Some(*v),
            Self::Int64(v) => Some(*v as f64),
            Self::Int32(v) => Some(*v as f64),
            _ => None,
        }
    }

    /// Returns the boolean payload, if any.
    #[must_use]
    pub const fn as_bool(&self) -> Option<bool> {
        match self {
            Self::Bool(v) => Some(*v),
            _ => None,
        }
    }

    /// Returns the timestamp payload, if any.
    #[must_use]
    pub const fn as_timestamp(&self) -> Option<DateTime<Utc>> {
        match self {
            Self::Timestamp(v) => Some(*v),
            _ => None,
        }
    }

    /// Renders the value as a SQL literal understood by every backend.
    #[must_use]
    pub fn sql_literal(&self) -> String {
        match self {
            Self::Null => "NULL".to_string(),
            Self::String(s) => quote_string(s),
            Self::Int64(v) => v.to_string(),
            Self::Int32(v) => v.to_string(),
            Self::Float64(v) if v.is_finite() => format!("{v:?}"),
            Self::Float64(_) => "NULL".to_string(),
            Self::Bool(v) => u8::from(*v).to_string(),
            Self::Timestamp(ts) => quote_string(&ts.format("%Y-%m-%d %H:%M:%S%.6f").to_string()),
        }
    }
}

fn quote_string(s: &str) -> String {
    let mut out = String::with_capacity(s.len() + 2);
    out.push('\'');
    for ch in s.chars() {
        match ch {
            '\'' => out.push_str("''"),
            '\\' => out.push_str("\\\\"),
            other => out.push(other),
        }
    }
    out.push('\'');
    out
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Self::String(v.to_string())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Self::String(v)
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Self::Int64(v)
    }
}

impl From<i32> for Value {
    fn from(v: i32) -> Self {
        Self::Int32(v)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Self::Float64(v)
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Self::Bool(v)
    }
}

impl From<DateTime<Utc>> for Value {
    fn from(v: DateTime<Utc>) -> Self {
        Self::Timestamp(v)
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(v: Option<T>) -> Self {
        v.map_or(Self::Null, Into::into)
    }
}
