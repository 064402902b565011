//! Column values decoded from result rows.

use std::fmt;

use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use rust_decimal::Decimal;
use rust_decimal::prelude::ToPrimitive;
use sqlx::mysql::MySqlRow;
use sqlx::postgres::PgRow;
use sqlx::postgres::types::Oid;
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, ValueRef};

/// A single decoded column value.
#[derive(Debug, Clone, PartialEq)]
pub enum SqlValue {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
}

/// Return the first type in the list that decodes the column, or fall back
/// to text.
macro_rules! decode_first {
    ($row:expr, $index:expr, [$($ty:ty),+ $(,)?]) => {{
        if $row.try_get_raw($index)?.is_null() {
            return Ok(SqlValue::Null);
        }
        $(
            if let Ok(value) = $row.try_get::<$ty, _>($index) {
                return Ok(SqlValue::from(value));
            }
        )+
        $row.try_get::<String, _>($index).map(SqlValue::Text)
    }};
}

/// Decode a PostgreSQL column. NUMERIC becomes a float, `name`, `bpchar`
/// and other text types become text, timestamps become RFC 3339 text.
pub(crate) fn decode_postgres(row: &PgRow, index: usize) -> Result<SqlValue, sqlx::Error> {
    if let Ok(oid) = row.try_get::<Oid, _>(index) {
        return Ok(SqlValue::Int(oid.0.into()));
    }
    decode_first!(
        row,
        index,
        [i64, i32, i16, f64, f32, Decimal, bool, DateTime<Utc>, NaiveDateTime, NaiveDate]
    )
}

/// Decode a MySQL column. DECIMAL becomes a float, unsigned integers too
/// large for `i64` become floats.
pub(crate) fn decode_mysql(row: &MySqlRow, index: usize) -> Result<SqlValue, sqlx::Error> {
    decode_first!(
        row,
        index,
        [i64, u64, f64, f32, Decimal, bool, DateTime<Utc>, NaiveDateTime, NaiveDate]
    )
}

/// Decode a SQLite column by its runtime storage class.
pub(crate) fn decode_sqlite(row: &SqliteRow, index: usize) -> Result<SqlValue, sqlx::Error> {
    decode_first!(row, index, [i64, f64, bool])
}

impl SqlValue {
    /// Numeric value for a metric. NULL counts as zero and numeric text is
    /// parsed.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Self::Null => Some(0.0),
            Self::Bool(b) => Some(if *b { 1.0 } else { 0.0 }),
            Self::Int(i) => Some(*i as f64),
            Self::Float(f) => Some(*f),
            Self::Text(s) => s.trim().parse().ok(),
        }
    }

    /// Text used as a label value or enum state.
    pub fn as_label(&self) -> String {
        match self {
            Self::Null => String::new(),
            other => other.to_string(),
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }
}

impl fmt::Display for SqlValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Null => write!(f, "NULL"),
            Self::Bool(b) => write!(f, "{b}"),
            Self::Int(i) => write!(f, "{i}"),
            Self::Float(v) => write!(f, "{v}"),
            Self::Text(s) => write!(f, "{s}"),
        }
    }
}

impl From<bool> for SqlValue {
    fn from(value: bool) -> Self {
        Self::Bool(value)
    }
}

impl From<i16> for SqlValue {
    fn from(value: i16) -> Self {
        Self::Int(value.into())
    }
}

impl From<i32> for SqlValue {
    fn from(value: i32) -> Self {
        Self::Int(value.into())
    }
}

impl From<u64> for SqlValue {
    fn from(value: u64) -> Self {
        i64::try_from(value).map_or(Self::Float(value as f64), Self::Int)
    }
}

impl From<f32> for SqlValue {
    fn from(value: f32) -> Self {
        Self::Float(value.into())
    }
}

impl From<Decimal> for SqlValue {
    fn from(value: Decimal) -> Self {
        Self::Float(value.to_f64().unwrap_or(f64::NAN))
    }
}

impl From<DateTime<Utc>> for SqlValue {
    fn from(value: DateTime<Utc>) -> Self {
        Self::Text(value.to_rfc3339())
    }
}

impl From<NaiveDateTime> for SqlValue {
    fn from(value: NaiveDateTime) -> Self {
        Self::Text(value.to_string())
    }
}

impl From<NaiveDate> for SqlValue {
    fn from(value: NaiveDate) -> Self {
        Self::Text(value.to_string())
    }
}

impl From<&str> for SqlValue {
    fn from(value: &str) -> Self {
        Self::Text(value.to_string())
    }
}

impl From<i64> for SqlValue {
    fn from(value: i64) -> Self {
        Self::Int(value)
    }
}

impl From<f64> for SqlValue {
    fn from(value: f64) -> Self {
        Self::Float(value)
    }
}
