use serde::{Deserialize, Serialize};
use std::fmt;

/// A single column value inside a row batch.
///
/// Timestamps are microseconds since the Unix epoch, matching the designated
/// timestamp resolution of the column store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Datum {
    Null,
    Bool(bool),
    Int(i32),
    Long(i64),
    Double(f64),
    Str(String),
    Timestamp(i64),
}

/// One ingested row: values in schema column order.
pub type Row = Vec<Datum>;

impl Datum {
    pub fn is_null(&self) -> bool {
        matches!(self, Datum::Null)
    }
}

impl fmt::Display for Datum {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Datum::Null => write!(f, "null"),
            Datum::Bool(v) => write!(f, "{}", v),
            Datum::Int(v) => write!(f, "{}", v),
            Datum::Long(v) => write!(f, "{}", v),
            Datum::Double(v) => write!(f, "{}", v),
            Datum::Str(v) => write!(f, "{}", v),
            Datum::Timestamp(v) => write!(f, "ts:{}", v),
        }
    }
}
