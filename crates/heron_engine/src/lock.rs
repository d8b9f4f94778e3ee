//! Whole-table locking across the resource pools.
//!
//! One logical table lock spans four pools: writer, reader, compressed
//! metadata, uncompressed metadata. Acquisition always walks them in
//! that order and release walks them in reverse; a partial acquisition
//! unwinds whatever it already holds before reporting which pool refused
//! and why. The wal writer pool is deliberately outside the order: wal
//! ingest is gated by the sequencer, not by table files.

use std::fmt;
use std::sync::Arc;

use heron_common::error::{EngineError, EngineResult};

use crate::meta_view::{CompressedMetaView, UncompressedMetaView};
use crate::pool::Pool;
use crate::table_reader::TableReader;
use crate::table_writer::TableWriter;
use crate::wal_writer::WalWriterHandle;

/// The five pools of one engine instance.
pub(crate) struct TablePools {
    pub writers: Pool<TableWriter>,
    pub readers: Pool<TableReader>,
    pub meta_compressed: Pool<CompressedMetaView>,
    pub meta_uncompressed: Pool<UncompressedMetaView>,
    pub wal_writers: Pool<WalWriterHandle>,
}

/// Holds the whole-table lock. Dropping it releases every pool in
/// reverse acquisition order; `unlock` does the same explicitly.
pub struct TableLockGuard {
    pools: Arc<TablePools>,
    table_name: String,
    held: usize,
}

impl TableLockGuard {
    pub fn table_name(&self) -> &str {
        &self.table_name
    }

    pub fn unlock(self) {}

    fn release(&mut self) {
        if self.held >= 4 {
            self.pools.meta_uncompressed.unlock(&self.table_name);
        }
        if self.held >= 3 {
            self.pools.meta_compressed.unlock(&self.table_name);
        }
        if self.held >= 2 {
            self.pools.readers.unlock(&self.table_name);
        }
        if self.held >= 1 {
            self.pools.writers.unlock(&self.table_name);
        }
        self.held = 0;
    }
}

impl Drop for TableLockGuard {
    fn drop(&mut self) {
        self.release();
    }
}

impl fmt::Debug for TableLockGuard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TableLockGuard")
            .field("table", &self.table_name)
            .field("held", &self.held)
            .finish()
    }
}

/// Takes the whole-table lock, or reports the first refusal after
/// unwinding the pools already acquired.
pub(crate) fn lock_all(
    pools: &Arc<TablePools>,
    table_name: &str,
    reason: &str,
) -> EngineResult<TableLockGuard> {
    let mut guard = TableLockGuard {
        pools: Arc::clone(pools),
        table_name: table_name.to_string(),
        held: 0,
    };
    let steps: [&dyn Fn() -> Option<String>; 4] = [
        &|| pools.writers.lock(table_name, reason),
        &|| pools.readers.lock(table_name, reason),
        &|| pools.meta_compressed.lock(table_name, reason),
        &|| pools.meta_uncompressed.lock(table_name, reason),
    ];
    for step in steps {
        match step() {
            None => guard.held += 1,
            Some(held_by) => {
                drop(guard);
                return Err(EngineError::busy(held_by));
            }
        }
    }
    tracing::debug!(table = table_name, reason, "table locked");
    Ok(guard)
}
