//! Per-table transaction sequencer.
//!
//! One instance per WAL-enabled table owns the durable transaction catalog
//! and the table's sequenced schema. Every transaction number, data or
//! structural, is assigned here under the schema write lock; the catalog
//! append order is the table's commit order.
//!
//! Structural commits append to the catalog first and mutate the in-memory
//! schema second. If that second step fails the catalog and schema have
//! diverged and the sequencer marks itself distressed: every subsequent
//! call fails until the table is reopened and the catalog replayed.

use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;

use heron_common::error::{EngineError, EngineResult};
use heron_common::schema::TableStructure;
use heron_common::types::{SegmentId, TableId, Txn, WalId, NO_TXN};

use crate::catalog::{CatalogEntry, TxnCatalog};
use crate::commit_bus::{CommitBus, CommitNotice};
use crate::id_file::IdFile;
use crate::meta::{AlterCommand, MetadataSink, TableMeta};
use crate::segment::WalSegmentWriter;

pub const SEQ_DIR: &str = "seq";
const WAL_INDEX_FILE: &str = "_wal_index";

pub struct Sequencer {
    table_dir: RwLock<PathBuf>,
    inner: RwLock<SequencerInner>,
    wal_ids: IdFile,
    distressed: AtomicBool,
    closed: AtomicBool,
    bus: Arc<CommitBus>,
    sync: bool,
}

struct SequencerInner {
    meta: TableMeta,
    catalog: TxnCatalog,
}

impl Sequencer {
    /// One-time registration during table creation: writes the initial
    /// metadata snapshot and an empty catalog. A partial failure tears the
    /// sequencer directory back down before returning.
    pub fn create(
        table_dir: &Path,
        table_id: TableId,
        structure: &TableStructure,
        bus: Arc<CommitBus>,
        sync: bool,
    ) -> EngineResult<Self> {
        let seq_dir = table_dir.join(SEQ_DIR);
        fs::create_dir_all(&seq_dir)
            .map_err(|e| EngineError::critical("could not create sequencer directory", e))?;
        match Self::create_unchecked(table_dir, &seq_dir, table_id, structure, bus, sync) {
            Ok(seq) => {
                tracing::info!(table = %structure.name, id = %table_id, "sequencer created");
                Ok(seq)
            }
            Err(e) => {
                abort_close(&seq_dir);
                Err(e)
            }
        }
    }

    fn create_unchecked(
        table_dir: &Path,
        seq_dir: &Path,
        table_id: TableId,
        structure: &TableStructure,
        bus: Arc<CommitBus>,
        sync: bool,
    ) -> EngineResult<Self> {
        let meta = TableMeta::from_structure(table_id, structure);
        meta.write_snapshot(seq_dir, sync)?;
        let catalog = TxnCatalog::create(seq_dir, sync)?;
        let wal_ids = IdFile::open(&seq_dir.join(WAL_INDEX_FILE), sync)
            .map_err(|e| EngineError::critical("could not open wal id counter", e))?;
        Ok(Self {
            table_dir: RwLock::new(table_dir.to_path_buf()),
            inner: RwLock::new(SequencerInner { meta, catalog }),
            wal_ids,
            distressed: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            bus,
            sync,
        })
    }

    /// Reopens an existing sequencer: loads the last snapshot and replays
    /// newer structure entries from the catalog over it. The catalog, not
    /// the snapshot, is the source of truth.
    pub fn open(
        table_dir: &Path,
        table_name: &str,
        bus: Arc<CommitBus>,
        sync: bool,
    ) -> EngineResult<Self> {
        let seq_dir = table_dir.join(SEQ_DIR);
        let mut meta = TableMeta::load_snapshot(&seq_dir)?;
        // The directory name wins over the snapshot: a rename while the
        // sequencer was not loaded only moved the directory.
        meta.table_name = table_name.to_string();
        let catalog = TxnCatalog::open(&seq_dir, sync)?;

        for (txn, target_version, cmd) in catalog.structure_entries_after(meta.structure_version) {
            meta.apply(&cmd.op).map_err(|e| {
                EngineError::CriticalState(format!(
                    "catalog replay failed [table={}, txn={}, target_version={}]: {}",
                    table_name, txn, target_version, e
                ))
            })?;
            if meta.structure_version != target_version {
                return Err(EngineError::CriticalState(format!(
                    "catalog replay version drift [table={}, txn={}, expected={}, actual={}]",
                    table_name, txn, target_version, meta.structure_version
                )));
            }
        }

        let wal_ids = IdFile::open(&seq_dir.join(WAL_INDEX_FILE), sync)
            .map_err(|e| EngineError::critical("could not open wal id counter", e))?;
        tracing::debug!(
            table = table_name,
            version = meta.structure_version,
            last_txn = catalog.last_txn(),
            "sequencer opened"
        );
        Ok(Self {
            table_dir: RwLock::new(table_dir.to_path_buf()),
            inner: RwLock::new(SequencerInner { meta, catalog }),
            wal_ids,
            distressed: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            bus,
            sync,
        })
    }

    pub fn table_id(&self) -> TableId {
        self.inner.read().meta.table_id
    }

    pub fn table_name(&self) -> String {
        self.inner.read().meta.table_name.clone()
    }

    pub fn structure_version(&self) -> u64 {
        self.inner.read().meta.structure_version
    }

    pub fn last_txn(&self) -> Txn {
        self.inner.read().catalog.last_txn()
    }

    pub fn table_dir(&self) -> PathBuf {
        self.table_dir.read().clone()
    }

    /// Used by the engine when the table is renamed while loaded: the
    /// directory has already moved on disk, the live instance follows.
    pub fn relocate(&self, new_name: &str, new_dir: PathBuf) {
        self.inner.write().meta.table_name = new_name.to_string();
        *self.table_dir.write() = new_dir;
    }

    /// Streams the current schema into `sink` under the read lock.
    pub fn copy_metadata_to(&self, sink: &mut dyn MetadataSink) {
        self.inner.read().meta.copy_to(sink);
    }

    /// Structure entries with target versions above `from_version`, in txn
    /// order. An owned copy: the lock is released before the caller
    /// iterates.
    pub fn structure_change_cursor(&self, from_version: u64) -> Vec<(Txn, u64, AlterCommand)> {
        self.inner.read().catalog.structure_entries_after(from_version)
    }

    /// All catalog entries after `from_txn`, in txn order.
    pub fn txn_cursor(&self, from_txn: Txn) -> Vec<(Txn, CatalogEntry)> {
        self.inner.read().catalog.entries_after(from_txn)
    }

    /// Checks whether `op` would apply cleanly against the current schema,
    /// without committing anything. Callers validate before paying for a
    /// durable append; the commit path itself stays check-and-append.
    pub fn validate(&self, cmd: &AlterCommand) -> EngineResult<()> {
        let mut probe = self.inner.read().meta.clone();
        probe.apply(&cmd.op).map(|_| ())
    }

    /// Assigns the next data txn if `expected_version` still matches the
    /// live structure version. A mismatch returns `NO_TXN` with nothing
    /// changed; the caller must refresh its schema view and retry.
    pub fn next_txn(
        &self,
        expected_version: u64,
        wal_id: WalId,
        segment_id: SegmentId,
        segment_txn: Txn,
    ) -> EngineResult<Txn> {
        self.ensure_usable()?;
        let notice = {
            let mut inner = self.inner.write();
            if inner.meta.structure_version != expected_version {
                return Ok(NO_TXN);
            }
            let txn = inner
                .catalog
                .append(CatalogEntry::Data {
                    wal_id,
                    segment_id,
                    segment_txn,
                })
                .map_err(|e| self.distress("catalog append failed", e))?;
            CommitNotice {
                table_id: inner.meta.table_id,
                table_name: inner.meta.table_name.clone(),
                txn,
            }
        };
        // Fan-out happens after the write lock is gone.
        let txn = notice.txn;
        self.bus.publish(notice);
        Ok(txn)
    }

    /// Assigns the next structural txn under the same optimistic version
    /// check. On success the table's structure version is exactly
    /// `expected_version + 1`.
    pub fn next_structure_txn(
        &self,
        expected_version: u64,
        cmd: AlterCommand,
    ) -> EngineResult<Txn> {
        self.ensure_usable()?;
        let notice = {
            let mut inner = self.inner.write();
            if inner.meta.structure_version != expected_version {
                return Ok(NO_TXN);
            }
            let target_version = expected_version + 1;
            let txn = inner
                .catalog
                .append(CatalogEntry::Structure {
                    target_version,
                    cmd: cmd.clone(),
                })
                .map_err(|e| self.distress("catalog append failed", e))?;

            if let Err(e) = inner.meta.apply(&cmd.op) {
                // The entry is already durable; schema and catalog have
                // diverged and this instance must not serve anything more.
                self.distressed.store(true, Ordering::SeqCst);
                tracing::error!(
                    table = %inner.meta.table_name,
                    txn,
                    error = %e,
                    "structural apply failed after durable append, sequencer distressed"
                );
                return Err(EngineError::CriticalState(format!(
                    "sequencer distressed: structural apply failed after durable append \
                     [table={}, txn={}]: {}",
                    inner.meta.table_name, txn, e
                )));
            }
            if inner.meta.structure_version != target_version {
                self.distressed.store(true, Ordering::SeqCst);
                return Err(EngineError::CriticalState(format!(
                    "sequencer distressed: version drift after structural apply \
                     [table={}, expected={}, actual={}]",
                    inner.meta.table_name, target_version, inner.meta.structure_version
                )));
            }
            CommitNotice {
                table_id: inner.meta.table_id,
                table_name: inner.meta.table_name.clone(),
                txn,
            }
        };
        let txn = notice.txn;
        self.bus.publish(notice);
        Ok(txn)
    }

    /// Allocates a WAL id from the durable per-table counter and opens a
    /// segment writer bound to it.
    pub fn create_wal(&self, rollover_rows: u64) -> EngineResult<WalSegmentWriter> {
        self.ensure_usable()?;
        let id = self
            .wal_ids
            .next_id()
            .map_err(|e| EngineError::critical("could not allocate wal id", e))?;
        let wal_id = WalId(id as i32);
        let table_name = self.table_name();
        let table_dir = self.table_dir();
        WalSegmentWriter::create(&table_dir, &table_name, wal_id, rollover_rows, self.sync)
    }

    pub fn is_distressed(&self) -> bool {
        self.distressed.load(Ordering::SeqCst)
    }

    /// Flushes the catalog and refreshes the metadata snapshot so the next
    /// open replays as little as possible. Safe to call more than once.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let mut inner = self.inner.write();
        if let Err(e) = inner.catalog.flush() {
            tracing::warn!(table = %inner.meta.table_name, error = %e, "catalog flush on close failed");
        }
        if !self.is_distressed() {
            let seq_dir = self.table_dir().join(SEQ_DIR);
            if let Err(e) = inner.meta.write_snapshot(&seq_dir, self.sync) {
                tracing::warn!(table = %inner.meta.table_name, error = %e, "snapshot on close failed");
            }
        }
    }

    fn ensure_usable(&self) -> EngineResult<()> {
        if self.distressed.load(Ordering::SeqCst) {
            return Err(EngineError::CriticalState(format!(
                "sequencer distressed [table={}]",
                self.table_name()
            )));
        }
        if self.closed.load(Ordering::SeqCst) {
            return Err(EngineError::CriticalState(format!(
                "sequencer closed [table={}]",
                self.table_name()
            )));
        }
        Ok(())
    }

    fn distress(&self, context: &'static str, e: EngineError) -> EngineError {
        self.distressed.store(true, Ordering::SeqCst);
        tracing::error!(context, error = %e, "sequencer distressed");
        e
    }
}

impl fmt::Debug for Sequencer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.inner.read();
        f.debug_struct("Sequencer")
            .field("table", &inner.meta.table_name)
            .field("version", &inner.meta.structure_version)
            .field("last_txn", &inner.catalog.last_txn())
            .field("distressed", &self.is_distressed())
            .finish_non_exhaustive()
    }
}

/// Cleanup for a construction that failed partway: nothing of a
/// half-created sequencer may survive.
fn abort_close(seq_dir: &Path) {
    if let Err(e) = fs::remove_dir_all(seq_dir) {
        tracing::warn!(dir = %seq_dir.display(), error = %e, "sequencer abort cleanup failed");
    }
}
