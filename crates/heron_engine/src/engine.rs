//! The engine: top-level coordinator for table access.
//!
//! One `Engine` value owns every shared registry of the process: the five
//! resource pools, the sequencer registry, the durable table id counter,
//! and the commit-notification bus. Nothing here is a static; collaborators
//! hold an `Arc<Engine>` and reach everything through it.
//!
//! Structural operations (create, remove, rename, explicit table lock)
//! quiesce the table through the cross-pool lock first. Data access goes
//! through `get_writer`/`get_reader`/metadata checkouts, which dispatch
//! between WAL and non-WAL tables so callers never care which kind they
//! are talking to.

use std::fs;
use std::path::Path;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use heron_common::config::EngineConfig;
use heron_common::datum::Row;
use heron_common::error::{EngineError, EngineResult};
use heron_common::schema::TableStructure;
use heron_common::table_name::check_table_name;
use heron_common::types::{PoolKind, TableId, TableStatus, Txn, NO_TXN};
use heron_wal::commit_bus::{CommitBus, CommitNotice};
use heron_wal::id_file::IdFile;
use heron_wal::meta::{AlterCommand, AlterOp};
use heron_wal::registry::SequencerRegistry;

use crate::fs_ops;
use crate::lock::{lock_all, TableLockGuard, TablePools};
use crate::meta_view::{CompressedMetaView, UncompressedMetaView};
use crate::pool::{Pool, PoolListener, PoolStats, PooledHandle};
use crate::table_reader::TableReader;
use crate::table_writer::TableWriter;
use crate::wal_writer::WalWriterHandle;

const TAB_INDEX_FILE: &str = "_tab_index";

/// Writer checkout as seen by ingestion: WAL-enabled tables hand out a
/// sequenced WAL writer, plain tables the table writer itself. Callers
/// stage rows and commit without knowing which they got.
pub enum TableWriterApi {
    Table(PooledHandle<TableWriter>),
    Wal(PooledHandle<WalWriterHandle>),
}

impl TableWriterApi {
    pub fn is_wal(&self) -> bool {
        matches!(self, TableWriterApi::Wal(_))
    }

    pub fn table_name(&self) -> &str {
        match self {
            TableWriterApi::Table(w) => w.table_name(),
            TableWriterApi::Wal(w) => w.table_name(),
        }
    }

    pub fn structure_version(&self) -> u64 {
        match self {
            TableWriterApi::Table(w) => w.structure_version(),
            TableWriterApi::Wal(w) => w.structure_version(),
        }
    }

    /// Stages one row in live column order.
    pub fn append_row(&mut self, row: Row) -> EngineResult<()> {
        match self {
            TableWriterApi::Table(w) => w.append_row(row),
            TableWriterApi::Wal(w) => w.append_row(row),
        }
    }

    /// Commits the staged rows. WAL tables return the assigned txn; plain
    /// tables commit directly into storage and have no txn to report.
    pub fn commit(&mut self) -> EngineResult<Option<Txn>> {
        match self {
            TableWriterApi::Table(w) => {
                w.commit()?;
                Ok(None)
            }
            TableWriterApi::Wal(w) => w.commit(),
        }
    }

    pub fn rollback(&mut self) {
        match self {
            TableWriterApi::Table(w) => w.rollback(),
            TableWriterApi::Wal(w) => w.rollback(),
        }
    }
}

pub struct Engine {
    config: EngineConfig,
    pools: Arc<TablePools>,
    sequencers: Arc<SequencerRegistry>,
    bus: Arc<CommitBus>,
    table_ids: IdFile,
    correlation_ids: AtomicI64,
}

impl Engine {
    pub fn new(config: EngineConfig) -> EngineResult<Self> {
        fs::create_dir_all(&config.root)
            .map_err(|e| EngineError::critical("could not create engine root", e))?;
        let sync = config.sync_on_commit;
        let bus = Arc::new(CommitBus::new(config.commit_queue_capacity));
        let sequencers = Arc::new(SequencerRegistry::new(&config.root, bus.clone(), sync));
        let table_ids = IdFile::open(&config.root.join(TAB_INDEX_FILE), sync)
            .map_err(|e| EngineError::critical("could not open table id counter", e))?;

        let ttl = Duration::from_millis(config.idle_ttl_ms);
        let root = config.root.clone();
        let pools = Arc::new(TablePools {
            writers: Pool::new(PoolKind::Writer, true, ttl, {
                let root = root.clone();
                move |name| TableWriter::open(&root.join(name), sync)
            }),
            readers: Pool::new(PoolKind::Reader, false, ttl, {
                let root = root.clone();
                move |name| TableReader::open(&root.join(name))
            }),
            meta_compressed: Pool::new(PoolKind::MetaCompressed, false, ttl, {
                let root = root.clone();
                move |name| CompressedMetaView::load(&root.join(name))
            }),
            meta_uncompressed: Pool::new(PoolKind::MetaUncompressed, false, ttl, {
                let root = root.clone();
                move |name| UncompressedMetaView::load(&root.join(name))
            }),
            wal_writers: Pool::new(PoolKind::WalWriter, false, ttl, {
                let registry = sequencers.clone();
                let rollover = config.segment_rollover_rows;
                move |name| {
                    let seq = registry.get(name)?;
                    WalWriterHandle::new(seq, rollover)
                }
            }),
        });

        tracing::info!(root = %config.root.display(), "engine started");
        Ok(Self {
            config,
            pools,
            sequencers,
            bus,
            table_ids,
            correlation_ids: AtomicI64::new(0),
        })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn root(&self) -> &Path {
        &self.config.root
    }

    pub fn commit_bus(&self) -> &Arc<CommitBus> {
        &self.bus
    }

    pub fn sequencers(&self) -> &SequencerRegistry {
        &self.sequencers
    }

    /// Stamp for alter operations so appliers can report completion back
    /// to the issuing command.
    pub fn next_correlation_id(&self) -> i64 {
        self.correlation_ids.fetch_add(1, Ordering::Relaxed) + 1
    }

    // ── table lifecycle ──────────────────────────────────────────────

    /// Creates a table from `structure` and returns its durable id. The
    /// sequencer is registered before any table file exists, so a table
    /// directory without sequencer state is never a WAL table half-done.
    pub fn create_table(&self, structure: &TableStructure) -> EngineResult<TableId> {
        check_table_name(&structure.name, self.config.max_name_len)?;
        let _guard = lock_all(&self.pools, &structure.name, "createTable")?;

        let name = &structure.name;
        if fs_ops::table_status(&self.config.root, name) != TableStatus::DoesNotExist {
            return Err(EngineError::busy(format!("table exists [name={}]", name)));
        }
        let id = self
            .table_ids
            .next_id()
            .map_err(|e| EngineError::critical("could not allocate table id", e))?;
        let table_id = TableId(id as i32);

        if structure.wal_enabled {
            self.sequencers.register_table(table_id, structure)?;
        }
        let dir = fs_ops::table_dir(&self.config.root, name);
        if let Err(e) = TableWriter::bootstrap(&dir, table_id, structure, self.config.sync_on_commit)
        {
            if structure.wal_enabled {
                self.sequencers.drop_table(name);
            }
            if let Err(cleanup) = fs::remove_dir_all(&dir) {
                tracing::warn!(table = %name, error = %cleanup, "create cleanup failed");
            }
            return Err(e);
        }
        tracing::info!(table = %name, id = %table_id, wal = structure.wal_enabled, "table created");
        Ok(table_id)
    }

    /// Drops the table: closes its sequencer, removes its directory. The
    /// table id is never reused.
    pub fn remove_table(&self, table_name: &str) -> EngineResult<()> {
        check_table_name(table_name, self.config.max_name_len)?;
        let _guard = lock_all(&self.pools, table_name, "removeTable")?;
        if fs_ops::table_status(&self.config.root, table_name) == TableStatus::DoesNotExist {
            return Err(EngineError::NonCritical(format!(
                "table does not exist [name={}]",
                table_name
            )));
        }
        self.sequencers.drop_table(table_name);
        fs_ops::remove_table_dir(&self.config.root, table_name)
    }

    /// Renames the table directory and re-keys its sequencer. The lock is
    /// taken on the old name; the new name has no entries to lock yet.
    pub fn rename_table(&self, old_name: &str, new_name: &str) -> EngineResult<()> {
        check_table_name(old_name, self.config.max_name_len)?;
        check_table_name(new_name, self.config.max_name_len)?;
        let _guard = lock_all(&self.pools, old_name, "renameTable")?;
        if fs_ops::table_status(&self.config.root, old_name) == TableStatus::DoesNotExist {
            return Err(EngineError::NonCritical(format!(
                "table does not exist [name={}]",
                old_name
            )));
        }
        fs_ops::rename_table_dir(&self.config.root, old_name, new_name)?;
        self.sequencers.rename(old_name, new_name);
        Ok(())
    }

    pub fn table_status(&self, table_name: &str) -> TableStatus {
        fs_ops::table_status(&self.config.root, table_name)
    }

    /// Quiesces the table across all pools under `reason`. The returned
    /// guard keeps it quiesced; dropping the guard unlocks. A concurrent
    /// holder surfaces as `EntryUnavailable` carrying its reason.
    pub fn lock_table(&self, table_name: &str, reason: &str) -> EngineResult<TableLockGuard> {
        lock_all(&self.pools, table_name, reason)
    }

    // ── structural changes ───────────────────────────────────────────

    /// Applies one schema change. WAL tables sequence it through the
    /// table's transaction catalog under the optimistic version check,
    /// retrying when a concurrent commit moved the version; plain tables
    /// apply it to storage directly under the writer. Returns the
    /// assigned txn, or `NO_TXN` for plain tables.
    pub fn alter_table(&self, table_name: &str, op: AlterOp) -> EngineResult<Txn> {
        let cmd = AlterCommand {
            correlation_id: self.next_correlation_id(),
            op,
        };
        if !self.sequencers.is_registered(table_name) {
            let mut writer = self.pools.writers.get(table_name, "alterTable")?;
            match writer.apply_alter(&cmd, None) {
                Ok(_) => return Ok(NO_TXN),
                Err(e) => {
                    // The in-memory schema may be ahead of the snapshot.
                    writer.close_now();
                    return Err(e);
                }
            }
        }
        let seq = self.sequencers.get(table_name)?;
        loop {
            let version = seq.structure_version();
            seq.validate(&cmd)?;
            let txn = seq.next_structure_txn(version, cmd.clone())?;
            if txn != NO_TXN {
                tracing::debug!(
                    table = table_name,
                    txn,
                    version = version + 1,
                    correlation_id = cmd.correlation_id,
                    "structure change sequenced"
                );
                return Ok(txn);
            }
            // Lost the version race; revalidate against the fresh schema.
        }
    }

    // ── resource checkout ────────────────────────────────────────────

    /// Writer dispatch point: WAL tables get a sequenced WAL writer,
    /// plain tables the table writer. Interchangeable to the caller.
    pub fn get_writer(&self, table_name: &str, reason: &str) -> EngineResult<TableWriterApi> {
        if self.sequencers.is_registered(table_name) {
            Ok(TableWriterApi::Wal(
                self.pools.wal_writers.get(table_name, reason)?,
            ))
        } else {
            Ok(TableWriterApi::Table(
                self.pools.writers.get(table_name, reason)?,
            ))
        }
    }

    /// The plain table writer, regardless of WAL status. The apply job
    /// uses this to fold sequenced transactions into storage.
    pub fn get_table_writer(
        &self,
        table_name: &str,
        reason: &str,
    ) -> EngineResult<PooledHandle<TableWriter>> {
        self.pools.writers.get(table_name, reason)
    }

    /// Opens a reader at the latest committed state. With `expected`, the
    /// reader's cached identity is compared against the caller's
    /// `(table_id, structure_version)`; a mismatch closes the handle and
    /// fails with `ReaderOutOfDate`, and the caller must refresh and
    /// retry.
    pub fn get_reader(
        &self,
        table_name: &str,
        expected: Option<(TableId, u64)>,
    ) -> EngineResult<PooledHandle<TableReader>> {
        let mut reader = self.pools.readers.get(table_name, "read")?;
        if let Err(e) = reader.reload() {
            reader.close_now();
            return Err(e);
        }
        if let Some((expected_id, expected_version)) = expected {
            let (actual_id, actual_version) = (reader.table_id(), reader.structure_version());
            if actual_id != expected_id || actual_version != expected_version {
                reader.close_now();
                return Err(EngineError::ReaderOutOfDate {
                    table: table_name.to_string(),
                    expected_id,
                    expected_version,
                    actual_id,
                    actual_version,
                });
            }
        }
        Ok(reader)
    }

    /// `get_reader` plus one bounded repair attempt: a writer open runs
    /// crash recovery as a side effect, which can fix an unreadable
    /// table. A second failure is surfaced, never hidden.
    pub fn get_reader_with_repair(
        &self,
        table_name: &str,
        expected: Option<(TableId, u64)>,
    ) -> EngineResult<PooledHandle<TableReader>> {
        self.with_repair(table_name, |engine| engine.get_reader(table_name, expected))
    }

    /// Live-columns schema view, query facing.
    pub fn get_metadata(
        &self,
        table_name: &str,
    ) -> EngineResult<PooledHandle<CompressedMetaView>> {
        self.with_repair(table_name, |engine| {
            let mut view = engine.pools.meta_compressed.get(table_name, "metadata")?;
            if let Err(e) = view.reload(&engine.config.root.join(table_name)) {
                view.close_now();
                return Err(e);
            }
            Ok(view)
        })
    }

    /// All-slots schema view, tombstones included, storage facing.
    pub fn get_raw_metadata(
        &self,
        table_name: &str,
    ) -> EngineResult<PooledHandle<UncompressedMetaView>> {
        self.with_repair(table_name, |engine| {
            let mut view = engine.pools.meta_uncompressed.get(table_name, "metadata")?;
            if let Err(e) = view.reload(&engine.config.root.join(table_name)) {
                view.close_now();
                return Err(e);
            }
            Ok(view)
        })
    }

    /// Runs `attempt`; on a non-busy failure, opens and discards a writer
    /// once (writer construction recovers incomplete prior writes) and
    /// retries. A busy writer means repair cannot proceed and the
    /// original error stands.
    fn with_repair<T>(
        &self,
        table_name: &str,
        attempt: impl Fn(&Engine) -> EngineResult<T>,
    ) -> EngineResult<T> {
        let first = match attempt(self) {
            Ok(value) => return Ok(value),
            // Busy entries and stale readers are the caller's problem;
            // reopening a writer fixes neither.
            Err(e @ (EngineError::EntryUnavailable(_) | EngineError::ReaderOutOfDate { .. })) => {
                return Err(e)
            }
            Err(e) => e,
        };
        match self.pools.writers.get(table_name, "repair") {
            Ok(writer) => writer.close_now(),
            Err(EngineError::EntryUnavailable(_)) => return Err(first),
            Err(e) => {
                tracing::error!(table = table_name, error = %e, "repair writer open failed");
                return Err(first);
            }
        }
        match attempt(self) {
            Ok(value) => {
                tracing::info!(table = table_name, "table repaired");
                Ok(value)
            }
            Err(second) => {
                tracing::error!(
                    table = table_name,
                    original = %first,
                    error = %second,
                    "repair attempt did not help"
                );
                Err(second)
            }
        }
    }

    // ── commit notification ──────────────────────────────────────────

    /// Publishes a commit onto the bounded notification queue. Never
    /// blocks: a full queue drops the notice and records a rescan
    /// request for the apply job instead.
    pub fn notify_txn_committed(&self, table_id: TableId, table_name: &str, txn: Txn) {
        self.bus.publish(CommitNotice {
            table_id,
            table_name: table_name.to_string(),
            txn,
        });
    }

    // ── maintenance & teardown ───────────────────────────────────────

    pub fn set_pool_listener(&self, listener: Option<Arc<dyn PoolListener>>) {
        self.pools.writers.set_listener(listener.clone());
        self.pools.readers.set_listener(listener.clone());
        self.pools.meta_compressed.set_listener(listener.clone());
        self.pools.meta_uncompressed.set_listener(listener.clone());
        self.pools.wal_writers.set_listener(listener);
    }

    pub fn pool_stats(&self, kind: PoolKind) -> PoolStats {
        match kind {
            PoolKind::Writer => self.pools.writers.stats(),
            PoolKind::Reader => self.pools.readers.stats(),
            PoolKind::MetaCompressed => self.pools.meta_compressed.stats(),
            PoolKind::MetaUncompressed => self.pools.meta_uncompressed.stats(),
            PoolKind::WalWriter => self.pools.wal_writers.stats(),
        }
    }

    /// Evicts idle pooled resources past their TTL. Driven by the
    /// maintenance job; returns whether anything was freed.
    pub fn release_inactive(&self) -> bool {
        let mut released = self.pools.writers.release_inactive();
        released |= self.pools.readers.release_inactive();
        released |= self.pools.meta_compressed.release_inactive();
        released |= self.pools.meta_uncompressed.release_inactive();
        released |= self.pools.wal_writers.release_inactive();
        released
    }

    pub fn release_all_readers(&self) -> bool {
        self.pools.readers.release_all()
    }

    pub fn release_all_writers(&self) -> bool {
        let mut released = self.pools.writers.release_all();
        released |= self.pools.wal_writers.release_all();
        released
    }

    /// Drops every cached resource in every pool. Test teardown helper;
    /// returns whether anything was released.
    pub fn clear(&self) -> bool {
        let mut released = self.release_all_writers();
        released |= self.release_all_readers();
        released |= self.pools.meta_compressed.release_all();
        released |= self.pools.meta_uncompressed.release_all();
        released
    }

    /// Shutdown: close every pool and flush every sequencer. Outstanding
    /// handles stay usable but return nothing to the pools.
    pub fn close(&self) {
        self.pools.writers.close();
        self.pools.readers.close();
        self.pools.meta_compressed.close();
        self.pools.meta_uncompressed.close();
        self.pools.wal_writers.close();
        self.sequencers.close_all();
        tracing::info!("engine closed");
    }
}
