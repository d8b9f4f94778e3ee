use serde::{Deserialize, Serialize};
use std::fmt;

/// Unique identifier for a table. Assigned once at creation from a durable
/// counter and never reused, even after the table is dropped.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TableId(pub i32);

/// Identifier of one WAL within a table. Each writer checkout that needs its
/// own log gets a fresh id from the table's durable counter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct WalId(pub i32);

/// Identifier of one segment file within a WAL.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SegmentId(pub i32);

/// Per-table transaction number. Data commits and structure changes share
/// one strictly increasing sequence starting at 1.
pub type Txn = i64;

/// Sentinel meaning "no transaction was assigned". Returned by the
/// optimistic commit path when the caller's structure version is stale;
/// the caller must refresh its schema view and retry.
pub const NO_TXN: Txn = -1;

impl fmt::Display for TableId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "tbl:{}", self.0)
    }
}

impl fmt::Display for WalId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "wal:{}", self.0)
    }
}

impl fmt::Display for SegmentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "seg:{}", self.0)
    }
}

/// The pool a resource handle belongs to. Carried on listener events and in
/// busy-reason diagnostics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PoolKind {
    Writer,
    Reader,
    MetaCompressed,
    MetaUncompressed,
    WalWriter,
}

impl PoolKind {
    pub fn as_str(self) -> &'static str {
        match self {
            PoolKind::Writer => "writer",
            PoolKind::Reader => "reader",
            PoolKind::MetaCompressed => "meta-compressed",
            PoolKind::MetaUncompressed => "meta-uncompressed",
            PoolKind::WalWriter => "wal-writer",
        }
    }
}

impl fmt::Display for PoolKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Result of a filesystem-level table existence probe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TableStatus {
    /// Directory and metadata present.
    Exists,
    /// No trace of the table on disk.
    DoesNotExist,
    /// Directory present but metadata missing: mid-create or mid-drop.
    Reserved,
}
