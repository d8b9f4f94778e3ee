use serde::{Deserialize, Serialize};
use std::fmt;

use crate::datum::Datum;

/// Column storage types supported by the engine core.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ColumnType {
    Bool,
    Int,
    Long,
    Double,
    Str,
    Symbol,
    Timestamp,
}

impl ColumnType {
    /// Whether a datum is storable in a column of this type. Null is
    /// accepted everywhere; symbol columns take string values.
    pub fn accepts(self, value: &Datum) -> bool {
        match (self, value) {
            (_, Datum::Null) => true,
            (ColumnType::Bool, Datum::Bool(_)) => true,
            (ColumnType::Int, Datum::Int(_)) => true,
            (ColumnType::Long, Datum::Long(_)) => true,
            (ColumnType::Double, Datum::Double(_)) => true,
            (ColumnType::Str, Datum::Str(_)) => true,
            (ColumnType::Symbol, Datum::Str(_)) => true,
            (ColumnType::Timestamp, Datum::Timestamp(_)) => true,
            _ => false,
        }
    }
}

impl fmt::Display for ColumnType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ColumnType::Bool => "BOOLEAN",
            ColumnType::Int => "INT",
            ColumnType::Long => "LONG",
            ColumnType::Double => "DOUBLE",
            ColumnType::Str => "STRING",
            ColumnType::Symbol => "SYMBOL",
            ColumnType::Timestamp => "TIMESTAMP",
        };
        f.write_str(s)
    }
}

/// Column definition as carried by the sequencer metadata and the durable
/// table metadata file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ColumnDef {
    pub name: String,
    pub col_type: ColumnType,
    /// Secondary index present on this column.
    pub indexed: bool,
    /// For symbol columns: the symbol table is write-once.
    pub symbol_static: bool,
    /// Stable per-column tag assigned at add time; distinguishes a column
    /// from an earlier same-named column that was dropped and re-added.
    pub hash: i64,
}

impl ColumnDef {
    pub fn new(name: impl Into<String>, col_type: ColumnType) -> Self {
        Self {
            name: name.into(),
            col_type,
            indexed: false,
            symbol_static: false,
            hash: 0,
        }
    }
}

/// The shape a table is created with: ordered columns, optional designated
/// timestamp, and whether mutations flow through the WAL sequencer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TableStructure {
    pub name: String,
    pub columns: Vec<ColumnDef>,
    /// Index into `columns` of the designated timestamp, if any.
    pub timestamp_index: Option<usize>,
    pub wal_enabled: bool,
}

impl TableStructure {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            columns: Vec::new(),
            timestamp_index: None,
            wal_enabled: false,
        }
    }

    pub fn column(mut self, name: impl Into<String>, col_type: ColumnType) -> Self {
        self.columns.push(ColumnDef::new(name, col_type));
        self
    }

    /// Marks the most recently added column as the designated timestamp.
    pub fn designated_timestamp(mut self) -> Self {
        self.timestamp_index = Some(self.columns.len() - 1);
        self
    }

    pub fn wal(mut self) -> Self {
        self.wal_enabled = true;
        self
    }

    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|c| c.name == name)
    }
}
