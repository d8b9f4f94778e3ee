//! Table-side storage: the applied schema, the row store, and the commit
//! watermark.
//!
//! A table directory holds three files. `_meta` is the applied schema
//! snapshot, `rows.dat` is an append-only store of committed row batches,
//! and `_txn` is the watermark that makes them visible. A batch is
//! written to the row store first and the watermark moves second, so a
//! crash between the two leaves an invisible tail that the next open
//! cuts off. Rows are stored in column slot order, dropped slots
//! included, which keeps positions stable across structure changes.

use std::fs::{self, File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use heron_common::datum::{Datum, Row};
use heron_common::error::{EngineError, EngineResult};
use heron_common::schema::TableStructure;
use heron_common::types::{TableId, Txn};
use heron_wal::frame::encode_frame;
use heron_wal::meta::{AlterCommand, TableMeta};

pub const ROWS_FILE: &str = "rows.dat";
pub const ROWS_MAGIC: &[u8; 4] = b"HROW";
pub const ROWS_FORMAT_VERSION: u16 = 1;
pub const ROWS_HEADER_LEN: u64 = 6;

const TXN_FILE: &str = "_txn";

/// Durable commit watermark. Everything in the row store past
/// `committed_bytes` is uncommitted debris.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TxnRecord {
    pub committed_rows: u64,
    pub committed_bytes: u64,
    /// Highest sequenced txn already folded into this table; 0 when none.
    pub applied_txn: Txn,
}

pub struct TableWriter {
    dir: PathBuf,
    meta: TableMeta,
    rows: File,
    committed_rows: u64,
    committed_bytes: u64,
    applied_txn: Txn,
    pending: Vec<Row>,
    sync: bool,
}

impl TableWriter {
    /// Lays down a fresh table directory: schema snapshot, empty row
    /// store, zero watermark.
    pub fn bootstrap(
        dir: &Path,
        table_id: TableId,
        structure: &TableStructure,
        sync: bool,
    ) -> EngineResult<()> {
        fs::create_dir_all(dir)
            .map_err(|e| EngineError::critical("could not create table directory", e))?;
        let meta = TableMeta::from_structure(table_id, structure);
        meta.write_snapshot(dir, sync)?;
        write_txn_record(
            dir,
            &TxnRecord {
                committed_rows: 0,
                committed_bytes: ROWS_HEADER_LEN,
                applied_txn: 0,
            },
            sync,
        )?;
        let mut file = File::create(dir.join(ROWS_FILE))
            .map_err(|e| EngineError::critical("could not create row store", e))?;
        file.write_all(ROWS_MAGIC)
            .and_then(|_| file.write_all(&ROWS_FORMAT_VERSION.to_le_bytes()))
            .and_then(|_| if sync { file.sync_data() } else { Ok(()) })
            .map_err(|e| EngineError::critical("could not write row store header", e))?;
        Ok(())
    }

    pub fn open(dir: &Path, sync: bool) -> EngineResult<Self> {
        let meta = TableMeta::load_snapshot(dir)?;
        let txn = read_txn_record(dir)?;
        let mut rows = OpenOptions::new()
            .read(true)
            .write(true)
            .open(dir.join(ROWS_FILE))
            .map_err(|e| EngineError::critical("could not open row store", e))?;

        let mut header = [0u8; ROWS_HEADER_LEN as usize];
        rows.read_exact(&mut header)
            .map_err(|e| EngineError::critical("could not read row store header", e))?;
        if &header[0..4] != ROWS_MAGIC {
            return Err(EngineError::CriticalState(format!(
                "row store has bad magic [table={}]",
                meta.table_name
            )));
        }

        let len = rows
            .metadata()
            .map_err(|e| EngineError::critical("could not stat row store", e))?
            .len();
        if len < txn.committed_bytes {
            return Err(EngineError::CriticalState(format!(
                "row store shorter than committed watermark [table={}, len={}, committed={}]",
                meta.table_name, len, txn.committed_bytes
            )));
        }
        if len > txn.committed_bytes {
            tracing::warn!(
                table = %meta.table_name,
                dropped = len - txn.committed_bytes,
                "cutting uncommitted row store tail"
            );
            rows.set_len(txn.committed_bytes)
                .map_err(|e| EngineError::critical("could not truncate row store tail", e))?;
        }
        rows.seek(SeekFrom::End(0))
            .map_err(|e| EngineError::critical("could not seek row store", e))?;

        Ok(Self {
            dir: dir.to_path_buf(),
            meta,
            rows,
            committed_rows: txn.committed_rows,
            committed_bytes: txn.committed_bytes,
            applied_txn: txn.applied_txn,
            pending: Vec::new(),
            sync,
        })
    }

    pub fn table_name(&self) -> &str {
        &self.meta.table_name
    }

    pub fn table_id(&self) -> TableId {
        self.meta.table_id
    }

    pub fn structure_version(&self) -> u64 {
        self.meta.structure_version
    }

    pub fn row_count(&self) -> u64 {
        self.committed_rows
    }

    pub fn applied_txn(&self) -> Txn {
        self.applied_txn
    }

    pub fn pending_rows(&self) -> usize {
        self.pending.len()
    }

    pub fn meta(&self) -> &TableMeta {
        &self.meta
    }

    /// Stages one row, given in live column order. Missing trailing
    /// values become nulls; extra values are an error.
    pub fn append_row(&mut self, row: Row) -> EngineResult<()> {
        let live = self.meta.live_column_count();
        if row.len() > live {
            return Err(EngineError::NonCritical(format!(
                "row has {} values for {} columns [table={}]",
                row.len(),
                live,
                self.meta.table_name
            )));
        }
        let mut slot_row = Vec::with_capacity(self.meta.slots.len());
        let mut values = row.into_iter();
        for slot in &self.meta.slots {
            if slot.dropped {
                slot_row.push(Datum::Null);
                continue;
            }
            let datum = values.next().unwrap_or(Datum::Null);
            if !slot.def.col_type.accepts(&datum) {
                return Err(EngineError::NonCritical(format!(
                    "value does not fit column [table={}, column={}, type={}]",
                    self.meta.table_name, slot.def.name, slot.def.col_type
                )));
            }
            slot_row.push(datum);
        }
        self.pending.push(slot_row);
        Ok(())
    }

    /// Stages one row already in storage slot order, as read back from a
    /// WAL segment. No validation: the sequencer validated it at ingest.
    pub(crate) fn append_slot_row(&mut self, row: Row) {
        self.pending.push(row);
    }

    pub fn rollback(&mut self) {
        self.pending.clear();
    }

    /// Durably commits the staged rows. Returns the total committed row
    /// count.
    pub fn commit(&mut self) -> EngineResult<u64> {
        let applied = self.applied_txn;
        self.commit_up_to(applied)
    }

    /// Commit variant used when folding in sequenced transactions:
    /// advances the applied txn watermark together with the data.
    pub fn commit_applied(&mut self, applied_txn: Txn) -> EngineResult<u64> {
        self.commit_up_to(applied_txn)
    }

    fn commit_up_to(&mut self, applied_txn: Txn) -> EngineResult<u64> {
        if self.pending.is_empty() && applied_txn == self.applied_txn {
            return Ok(self.committed_rows);
        }
        let row_count = self.pending.len() as u64;
        let mut new_bytes = self.committed_bytes;
        if !self.pending.is_empty() {
            let rows = std::mem::take(&mut self.pending);
            let frame = encode_frame(&rows)?;
            self.rows
                .write_all(&frame)
                .and_then(|_| if self.sync { self.rows.sync_data() } else { Ok(()) })
                .map_err(|e| EngineError::critical("could not write row store", e))?;
            new_bytes += frame.len() as u64;
        }
        let record = TxnRecord {
            committed_rows: self.committed_rows + row_count,
            committed_bytes: new_bytes,
            applied_txn,
        };
        write_txn_record(&self.dir, &record, self.sync)?;
        self.committed_rows = record.committed_rows;
        self.committed_bytes = new_bytes;
        self.applied_txn = applied_txn;
        Ok(self.committed_rows)
    }

    /// Applies one structural change to the applied schema and persists
    /// the new snapshot. Returns the new structure version. On failure
    /// the writer must be discarded, not reused: the in-memory schema may
    /// be ahead of the snapshot on disk.
    pub fn apply_alter(
        &mut self,
        cmd: &AlterCommand,
        applied_txn: Option<Txn>,
    ) -> EngineResult<u64> {
        self.meta.apply(&cmd.op)?;
        self.meta.write_snapshot(&self.dir, self.sync)?;
        if let Some(txn) = applied_txn {
            self.commit_up_to(txn)?;
        }
        tracing::debug!(
            table = %self.meta.table_name,
            version = self.meta.structure_version,
            correlation_id = cmd.correlation_id,
            "structure change applied"
        );
        Ok(self.meta.structure_version)
    }
}

fn write_txn_record(dir: &Path, record: &TxnRecord, sync: bool) -> EngineResult<()> {
    let tmp = dir.join("_txn.tmp");
    let data = bincode::serialize(record)?;
    let mut file = File::create(&tmp)
        .map_err(|e| EngineError::critical("could not create txn record", e))?;
    file.write_all(&data)
        .and_then(|_| if sync { file.sync_data() } else { Ok(()) })
        .map_err(|e| EngineError::critical("could not write txn record", e))?;
    drop(file);
    fs::rename(&tmp, dir.join(TXN_FILE))
        .map_err(|e| EngineError::critical("could not publish txn record", e))?;
    Ok(())
}

pub(crate) fn read_txn_record(dir: &Path) -> EngineResult<TxnRecord> {
    let data = fs::read(dir.join(TXN_FILE))
        .map_err(|e| EngineError::critical("could not read txn record", e))?;
    Ok(bincode::deserialize(&data)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use heron_common::schema::ColumnType;
    use heron_wal::meta::AlterOp;

    fn structure() -> TableStructure {
        TableStructure::new("plug")
            .column("room", ColumnType::Str)
            .column("watts", ColumnType::Long)
            .column("timestamp", ColumnType::Timestamp)
            .designated_timestamp()
    }

    fn row(watts: i64) -> Row {
        vec![
            Datum::Str("kitchen".into()),
            Datum::Long(watts),
            Datum::Timestamp(1_000_000 + watts),
        ]
    }

    #[test]
    fn test_bootstrap_then_open_empty() {
        let dir = tempfile::tempdir().unwrap();
        TableWriter::bootstrap(dir.path(), TableId(3), &structure(), false).unwrap();
        let w = TableWriter::open(dir.path(), false).unwrap();
        assert_eq!(w.table_name(), "plug");
        assert_eq!(w.table_id(), TableId(3));
        assert_eq!(w.row_count(), 0);
        assert_eq!(w.applied_txn(), 0);
        assert_eq!(w.structure_version(), 0);
    }

    #[test]
    fn test_commit_moves_watermark_and_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        TableWriter::bootstrap(dir.path(), TableId(3), &structure(), false).unwrap();
        {
            let mut w = TableWriter::open(dir.path(), false).unwrap();
            w.append_row(row(1)).unwrap();
            w.append_row(row(2)).unwrap();
            assert_eq!(w.commit().unwrap(), 2);
            w.append_row(row(3)).unwrap();
            assert_eq!(w.commit_applied(5).unwrap(), 3);
        }
        let w = TableWriter::open(dir.path(), false).unwrap();
        assert_eq!(w.row_count(), 3);
        assert_eq!(w.applied_txn(), 5);
    }

    #[test]
    fn test_uncommitted_tail_is_cut_on_open() {
        let dir = tempfile::tempdir().unwrap();
        TableWriter::bootstrap(dir.path(), TableId(3), &structure(), false).unwrap();
        {
            let mut w = TableWriter::open(dir.path(), false).unwrap();
            w.append_row(row(1)).unwrap();
            w.commit().unwrap();
        }
        let path = dir.path().join(ROWS_FILE);
        let committed = fs::metadata(&path).unwrap().len();
        let mut file = OpenOptions::new().append(true).open(&path).unwrap();
        file.write_all(&[9u8; 17]).unwrap();
        drop(file);

        let w = TableWriter::open(dir.path(), false).unwrap();
        assert_eq!(w.row_count(), 1);
        assert_eq!(fs::metadata(&path).unwrap().len(), committed);
    }

    #[test]
    fn test_append_rejects_bad_rows() {
        let dir = tempfile::tempdir().unwrap();
        TableWriter::bootstrap(dir.path(), TableId(3), &structure(), false).unwrap();
        let mut w = TableWriter::open(dir.path(), false).unwrap();

        let mut wide = row(1);
        wide.push(Datum::Int(5));
        assert!(w.append_row(wide).is_err());

        let bad_type = vec![Datum::Long(1), Datum::Long(2), Datum::Timestamp(3)];
        assert!(w.append_row(bad_type).is_err());
        assert_eq!(w.pending_rows(), 0);
    }

    #[test]
    fn test_rollback_discards_pending() {
        let dir = tempfile::tempdir().unwrap();
        TableWriter::bootstrap(dir.path(), TableId(3), &structure(), false).unwrap();
        let mut w = TableWriter::open(dir.path(), false).unwrap();
        w.append_row(row(1)).unwrap();
        w.rollback();
        assert_eq!(w.commit().unwrap(), 0);
    }

    #[test]
    fn test_apply_alter_persists_new_version() {
        let dir = tempfile::tempdir().unwrap();
        TableWriter::bootstrap(dir.path(), TableId(3), &structure(), false).unwrap();
        {
            let mut w = TableWriter::open(dir.path(), false).unwrap();
            let cmd = AlterCommand {
                correlation_id: 11,
                op: AlterOp::add_column("label2", ColumnType::Int),
            };
            assert_eq!(w.apply_alter(&cmd, Some(2)).unwrap(), 1);
        }
        let w = TableWriter::open(dir.path(), false).unwrap();
        assert_eq!(w.structure_version(), 1);
        assert_eq!(w.applied_txn(), 2);
        assert_eq!(w.meta().live_column_count(), 4);
    }
}
