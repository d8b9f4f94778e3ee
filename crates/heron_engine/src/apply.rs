//! WAL apply: folds sequenced transactions into table storage.
//!
//! The apply job consumes the commit-notification bus and, per notified
//! table, walks the transaction catalog from the table's applied-txn
//! watermark forward. Data entries are read back from their WAL segment
//! and committed into the row store; structure entries are applied to the
//! table's durable schema. Notifications are lossy by design: whenever
//! the rescan counter is nonzero, a pass visits every loaded sequencer
//! instead of trusting the queue. The catalog is the source of truth.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use heron_common::error::{EngineError, EngineResult};
use heron_common::shutdown::StopSignal;
use heron_common::types::Txn;
use heron_wal::catalog::CatalogEntry;
use heron_wal::segment::WalSegmentReader;

use crate::engine::Engine;
use crate::pool::PooledHandle;
use crate::table_writer::TableWriter;

const POLL_INTERVAL: Duration = Duration::from_millis(100);

pub struct WalApplyJob {
    stop: StopSignal,
    handle: Option<JoinHandle<()>>,
}

impl WalApplyJob {
    pub fn start(engine: Arc<Engine>) -> std::io::Result<Self> {
        let stop = StopSignal::new();
        let signal = stop.clone();

        let handle = std::thread::Builder::new()
            .name("heron-wal-apply".into())
            .spawn(move || {
                tracing::debug!("wal apply started");
                while !signal.is_raised() {
                    match drain(&engine) {
                        Ok(0) => {
                            // Idle; park on the bus until something commits.
                            if engine.commit_bus().next_timeout(POLL_INTERVAL).is_some() {
                                engine.commit_bus().request_rescan();
                            }
                        }
                        Ok(applied) => {
                            tracing::debug!(applied, "wal transactions applied");
                        }
                        Err(e) => {
                            tracing::error!(error = %e, "wal apply pass failed");
                            if signal.wait_timeout(POLL_INTERVAL) {
                                break;
                            }
                        }
                    }
                }
                tracing::debug!("wal apply stopped");
            })?;
        Ok(Self {
            stop,
            handle: Some(handle),
        })
    }

    pub fn stop(&mut self) {
        self.stop.raise();
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for WalApplyJob {
    fn drop(&mut self) {
        self.stop();
    }
}

/// One apply pass: drains the queue, honors pending rescan requests, and
/// applies every outstanding transaction of every table touched. Returns
/// how many transactions were applied. Also the synchronous entry point
/// tests use to settle a table.
pub fn drain(engine: &Engine) -> EngineResult<usize> {
    let mut tables: BTreeSet<String> = BTreeSet::new();
    if engine.commit_bus().take_rescan_requests() > 0 {
        engine
            .sequencers()
            .for_each(|name, _| {
                tables.insert(name.to_string());
            });
    }
    while let Some(notice) = engine.commit_bus().try_next() {
        tables.insert(notice.table_name);
    }
    let mut applied = 0;
    for table in tables {
        applied += apply_table(engine, &table)?;
    }
    Ok(applied)
}

/// Applies every catalog entry of one table past its applied watermark.
pub fn apply_table(engine: &Engine, table_name: &str) -> EngineResult<usize> {
    let seq = match engine.sequencers().get(table_name) {
        Ok(seq) => seq,
        // Dropped or renamed between notification and apply; the catalog
        // went with it.
        Err(e) if !e.is_critical() => return Ok(0),
        Err(e) => return Err(e),
    };
    let mut writer = match engine.get_table_writer(table_name, "wal apply") {
        Ok(writer) => writer,
        Err(e) if e.is_retryable() => {
            // Someone holds the table writer; come back on the next pass.
            engine.commit_bus().request_rescan();
            return Ok(0);
        }
        Err(e) => return Err(e),
    };

    let entries = seq.txn_cursor(writer.applied_txn());
    if entries.is_empty() {
        return Ok(0);
    }
    let table_dir = seq.table_dir();
    let mut applied = 0;
    for (txn, entry) in entries {
        let result = match entry {
            CatalogEntry::Data {
                wal_id,
                segment_id,
                segment_txn,
            } => apply_data(&mut writer, &table_dir, wal_id, segment_id, segment_txn, txn),
            CatalogEntry::Structure { cmd, .. } => {
                writer.apply_alter(&cmd, Some(txn)).map(|_| ())
            }
        };
        if let Err(e) = result {
            // The writer's in-memory state may be ahead of disk; force the
            // next checkout to reopen and recover.
            writer.close_now();
            return Err(e);
        }
        applied += 1;
    }
    tracing::debug!(table = table_name, applied, "table caught up");
    Ok(applied)
}

fn apply_data(
    writer: &mut PooledHandle<TableWriter>,
    table_dir: &std::path::Path,
    wal_id: heron_common::types::WalId,
    segment_id: heron_common::types::SegmentId,
    segment_txn: Txn,
    txn: Txn,
) -> EngineResult<()> {
    let segment = WalSegmentReader::open(table_dir, wal_id, segment_id)?;
    let rows = segment.batch(segment_txn).ok_or_else(|| {
        EngineError::CriticalState(format!(
            "catalog points past wal segment [table={}, wal={}, segment={}, segment_txn={}]",
            writer.table_name(),
            wal_id,
            segment_id,
            segment_txn
        ))
    })?;
    for row in rows {
        writer.append_slot_row(row.clone());
    }
    writer.commit_applied(txn)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use heron_common::config::EngineConfig;
    use heron_common::datum::Datum;
    use heron_common::schema::{ColumnType, TableStructure};
    use heron_wal::meta::AlterOp;

    fn engine(root: &std::path::Path) -> Engine {
        let mut cfg = EngineConfig::new(root);
        cfg.sync_on_commit = false;
        Engine::new(cfg).unwrap()
    }

    fn plug() -> TableStructure {
        TableStructure::new("plug")
            .column("room", ColumnType::Str)
            .column("watts", ColumnType::Long)
            .column("timestamp", ColumnType::Timestamp)
            .designated_timestamp()
            .wal()
    }

    fn insert(engine: &Engine, watts: i64) {
        let mut w = engine.get_writer("plug", "insert").unwrap();
        w.append_row(vec![
            Datum::Str("kitchen".into()),
            Datum::Long(watts),
            Datum::Timestamp(1_000_000 + watts),
        ])
        .unwrap();
        w.commit().unwrap().unwrap();
    }

    #[test]
    fn test_drain_applies_data_and_structure_in_txn_order() {
        let dir = tempfile::tempdir().unwrap();
        let engine = engine(dir.path());
        engine.create_table(&plug()).unwrap();

        insert(&engine, 1);
        engine
            .alter_table("plug", AlterOp::add_column("label2", ColumnType::Int))
            .unwrap();
        insert(&engine, 2);

        assert_eq!(drain(&engine).unwrap(), 3);
        let reader = engine.get_reader("plug", None).unwrap();
        assert_eq!(reader.row_count(), 2);
        assert_eq!(reader.structure_version(), 1);
        assert_eq!(reader.applied_txn(), 3);
        assert!(reader.column_index("label2").is_some());
    }

    #[test]
    fn test_drain_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let engine = engine(dir.path());
        engine.create_table(&plug()).unwrap();
        insert(&engine, 1);

        assert_eq!(drain(&engine).unwrap(), 1);
        assert_eq!(drain(&engine).unwrap(), 0);
        let reader = engine.get_reader("plug", None).unwrap();
        assert_eq!(reader.row_count(), 1);
    }

    #[test]
    fn test_busy_writer_defers_apply_with_rescan() {
        let dir = tempfile::tempdir().unwrap();
        let engine = engine(dir.path());
        engine.create_table(&plug()).unwrap();
        insert(&engine, 1);

        let held = engine.get_table_writer("plug", "compaction").unwrap();
        assert_eq!(drain(&engine).unwrap(), 0);
        assert!(engine.commit_bus().rescan_requests() > 0);
        drop(held);

        assert_eq!(drain(&engine).unwrap(), 1);
    }

    #[test]
    fn test_rescan_catches_dropped_notifications() {
        let dir = tempfile::tempdir().unwrap();
        let mut cfg = EngineConfig::new(dir.path());
        cfg.sync_on_commit = false;
        cfg.commit_queue_capacity = 1;
        let engine = Engine::new(cfg).unwrap();
        engine.create_table(&plug()).unwrap();

        // Three commits through a one-slot queue: two notices dropped.
        insert(&engine, 1);
        insert(&engine, 2);
        insert(&engine, 3);
        assert_eq!(engine.commit_bus().stats().dropped, 2);

        assert_eq!(drain(&engine).unwrap(), 3);
        let reader = engine.get_reader("plug", None).unwrap();
        assert_eq!(reader.row_count(), 3);
    }
}
