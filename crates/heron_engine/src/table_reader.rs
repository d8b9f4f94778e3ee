//! Read-only table access.
//!
//! A reader materializes the committed row range of a table at open time
//! and projects stored slot rows onto the live column list of the schema
//! it was opened with. `reload` refreshes both, which is how pooled
//! readers catch up after new commits or structure changes.

use std::fs;
use std::path::{Path, PathBuf};

use heron_common::datum::{Datum, Row};
use heron_common::error::{EngineError, EngineResult};
use heron_common::types::{TableId, Txn};
use heron_wal::frame::decode_frames;
use heron_wal::meta::TableMeta;

use crate::table_writer::{read_txn_record, TxnRecord, ROWS_FILE, ROWS_HEADER_LEN, ROWS_MAGIC};

pub struct TableReader {
    dir: PathBuf,
    meta: TableMeta,
    txn: TxnRecord,
    /// Committed rows in slot order, flattened across batches.
    slot_rows: Vec<Row>,
}

impl TableReader {
    pub fn open(dir: &Path) -> EngineResult<Self> {
        let meta = TableMeta::load_snapshot(dir)?;
        let txn = read_txn_record(dir)?;
        let slot_rows = read_committed_rows(dir, &meta, &txn)?;
        Ok(Self {
            dir: dir.to_path_buf(),
            meta,
            txn,
            slot_rows,
        })
    }

    /// Re-reads schema, watermark, and rows. Returns whether anything
    /// changed since the last load.
    pub fn reload(&mut self) -> EngineResult<bool> {
        let meta = TableMeta::load_snapshot(&self.dir)?;
        let txn = read_txn_record(&self.dir)?;
        if meta == self.meta && txn == self.txn {
            return Ok(false);
        }
        self.slot_rows = read_committed_rows(&self.dir, &meta, &txn)?;
        self.meta = meta;
        self.txn = txn;
        Ok(true)
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
        self.txn.committed_rows
    }

    pub fn applied_txn(&self) -> Txn {
        self.txn.applied_txn
    }

    pub fn meta(&self) -> &TableMeta {
        &self.meta
    }

    pub fn column_index(&self, name: &str) -> Option<usize> {
        let mut live = 0;
        for slot in &self.meta.slots {
            if slot.dropped {
                continue;
            }
            if slot.def.name == name {
                return Some(live);
            }
            live += 1;
        }
        None
    }

    /// One committed row projected onto the live columns. Slots added
    /// after the row was written read as null.
    pub fn row(&self, index: u64) -> Option<Row> {
        let slot_row = self.slot_rows.get(index as usize)?;
        let mut out = Vec::with_capacity(self.meta.live_column_count());
        for (i, slot) in self.meta.slots.iter().enumerate() {
            if slot.dropped {
                continue;
            }
            out.push(slot_row.get(i).cloned().unwrap_or(Datum::Null));
        }
        Some(out)
    }

    pub fn all_rows(&self) -> Vec<Row> {
        (0..self.row_count()).filter_map(|i| self.row(i)).collect()
    }
}

fn read_committed_rows(dir: &Path, meta: &TableMeta, txn: &TxnRecord) -> EngineResult<Vec<Row>> {
    let path = dir.join(ROWS_FILE);
    let data =
        fs::read(&path).map_err(|e| EngineError::critical("could not read row store", e))?;
    if data.len() < ROWS_HEADER_LEN as usize || &data[0..4] != ROWS_MAGIC {
        return Err(EngineError::CriticalState(format!(
            "row store has bad magic [table={}]",
            meta.table_name
        )));
    }
    if (data.len() as u64) < txn.committed_bytes {
        return Err(EngineError::CriticalState(format!(
            "row store shorter than committed watermark [table={}, len={}, committed={}]",
            meta.table_name,
            data.len(),
            txn.committed_bytes
        )));
    }
    // Anything past the watermark is an uncommitted tail; ignore it.
    let committed = &data[..txn.committed_bytes as usize];
    let (batches, _) =
        decode_frames::<Vec<Row>>(committed, ROWS_HEADER_LEN as usize, &path, "row store");
    let rows: Vec<Row> = batches.into_iter().flatten().collect();
    if rows.len() as u64 != txn.committed_rows {
        return Err(EngineError::CriticalState(format!(
            "row store does not match watermark [table={}, decoded={}, committed={}]",
            meta.table_name,
            rows.len(),
            txn.committed_rows
        )));
    }
    Ok(rows)
}
