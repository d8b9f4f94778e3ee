//! WAL segment files.
//!
//! Each WAL writer owns a `wal<N>` directory under its table and writes
//! row batches into numbered segment files. One committed batch is one
//! record; a data entry in the transaction catalog points at it as
//! `(wal_id, segment_id, segment_txn)` where `segment_txn` is the record's
//! 1-based position within its segment.

use std::fmt;
use std::fs::{self, File, OpenOptions};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use heron_common::datum::Row;
use heron_common::error::{EngineError, EngineResult};
use heron_common::types::{SegmentId, Txn, WalId};

use crate::frame::{decode_frames, encode_frame};

const SEGMENT_MAGIC: &[u8; 4] = b"HSEG";
const SEGMENT_FORMAT_VERSION: u16 = 1;

#[derive(Debug, Serialize, Deserialize)]
enum SegmentRecord {
    Rows(Vec<Row>),
}

pub fn wal_dirname(wal_id: WalId) -> String {
    format!("wal{}", wal_id.0)
}

pub fn segment_filename(segment_id: SegmentId) -> String {
    format!("heron_{:06}.seg", segment_id.0)
}

/// Location of one durably written, not yet sequenced, row batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BatchRef {
    pub segment_id: SegmentId,
    pub segment_txn: Txn,
}

pub struct WalSegmentWriter {
    table_name: String,
    wal_id: WalId,
    dir: PathBuf,
    segment_id: SegmentId,
    file: File,
    rows_in_segment: u64,
    batches_in_segment: Txn,
    pending: Vec<Row>,
    rollover_rows: u64,
    sync: bool,
}

impl WalSegmentWriter {
    /// Creates the `wal<N>` directory under `table_dir` and opens the
    /// first segment.
    pub fn create(
        table_dir: &Path,
        table_name: &str,
        wal_id: WalId,
        rollover_rows: u64,
        sync: bool,
    ) -> EngineResult<Self> {
        let dir = table_dir.join(wal_dirname(wal_id));
        fs::create_dir_all(&dir)
            .map_err(|e| EngineError::critical("could not create wal directory", e))?;
        let segment_id = SegmentId(1);
        let file = open_segment(&dir, segment_id, sync)?;
        tracing::debug!(table = table_name, wal = %wal_id, "wal created");
        Ok(Self {
            table_name: table_name.to_string(),
            wal_id,
            dir,
            segment_id,
            file,
            rows_in_segment: 0,
            batches_in_segment: 0,
            pending: Vec::new(),
            rollover_rows,
            sync,
        })
    }

    pub fn wal_id(&self) -> WalId {
        self.wal_id
    }

    pub fn segment_id(&self) -> SegmentId {
        self.segment_id
    }

    pub fn append_row(&mut self, row: Row) {
        self.pending.push(row);
    }

    pub fn pending_rows(&self) -> usize {
        self.pending.len()
    }

    pub fn discard_pending(&mut self) {
        self.pending.clear();
    }

    /// Durably writes the pending rows as one record and returns its
    /// location. Returns `None` when there is nothing pending. The record
    /// is on disk after this but not committed until a catalog entry
    /// references it; an unreferenced record is dead weight, not data.
    pub fn write_batch(&mut self) -> EngineResult<Option<BatchRef>> {
        if self.pending.is_empty() {
            return Ok(None);
        }
        let rows = std::mem::take(&mut self.pending);
        let row_count = rows.len() as u64;
        let frame = encode_frame(&SegmentRecord::Rows(rows))?;
        self.file
            .write_all(&frame)
            .and_then(|_| if self.sync { self.file.sync_data() } else { Ok(()) })
            .map_err(|e| EngineError::critical("could not write wal segment record", e))?;
        self.rows_in_segment += row_count;
        self.batches_in_segment += 1;
        Ok(Some(BatchRef {
            segment_id: self.segment_id,
            segment_txn: self.batches_in_segment,
        }))
    }

    /// Rolls to the next segment once enough rows have accumulated. Called
    /// after a successful commit so an in-flight batch never straddles a
    /// roll.
    pub fn maybe_roll(&mut self) -> EngineResult<()> {
        if self.rows_in_segment < self.rollover_rows {
            return Ok(());
        }
        let next = SegmentId(self.segment_id.0 + 1);
        self.file = open_segment(&self.dir, next, self.sync)?;
        tracing::debug!(
            table = %self.table_name,
            wal = %self.wal_id,
            old = %self.segment_id,
            new = %next,
            "wal segment rolled"
        );
        self.segment_id = next;
        self.rows_in_segment = 0;
        self.batches_in_segment = 0;
        Ok(())
    }
}

impl fmt::Debug for WalSegmentWriter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WalSegmentWriter")
            .field("table", &self.table_name)
            .field("wal", &self.wal_id)
            .field("segment", &self.segment_id)
            .field("rows", &self.rows_in_segment)
            .finish_non_exhaustive()
    }
}

fn open_segment(dir: &Path, segment_id: SegmentId, sync: bool) -> EngineResult<File> {
    let path = dir.join(segment_filename(segment_id));
    let mut file = OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(&path)
        .map_err(|e| EngineError::critical("could not create wal segment", e))?;
    file.write_all(SEGMENT_MAGIC)
        .and_then(|_| file.write_all(&SEGMENT_FORMAT_VERSION.to_le_bytes()))
        .and_then(|_| if sync { file.sync_data() } else { Ok(()) })
        .map_err(|e| EngineError::critical("could not write wal segment header", e))?;
    Ok(file)
}

/// Read side used by the apply job.
pub struct WalSegmentReader {
    batches: Vec<Vec<Row>>,
}

impl WalSegmentReader {
    pub fn open(table_dir: &Path, wal_id: WalId, segment_id: SegmentId) -> EngineResult<Self> {
        let path = table_dir
            .join(wal_dirname(wal_id))
            .join(segment_filename(segment_id));
        let mut file = File::open(&path)
            .map_err(|e| EngineError::critical("could not open wal segment", e))?;
        let mut data = Vec::new();
        file.read_to_end(&mut data)
            .map_err(|e| EngineError::critical("could not read wal segment", e))?;

        if data.len() < 6 || &data[0..4] != SEGMENT_MAGIC {
            return Err(EngineError::CriticalState(format!(
                "wal segment has bad magic [path={}]",
                path.display()
            )));
        }

        let (records, _) = decode_frames::<SegmentRecord>(&data, 6, &path, "wal segment");
        let batches = records
            .into_iter()
            .map(|r| match r {
                SegmentRecord::Rows(rows) => rows,
            })
            .collect();
        Ok(Self { batches })
    }

    /// The rows of one committed batch; `segment_txn` is 1-based.
    pub fn batch(&self, segment_txn: Txn) -> Option<&[Row]> {
        if segment_txn < 1 {
            return None;
        }
        self.batches.get(segment_txn as usize - 1).map(|v| &v[..])
    }

    pub fn batch_count(&self) -> usize {
        self.batches.len()
    }
}
