//! Durable per-table transaction catalog.
//!
//! One append-only file holds every committed transaction of a table, data
//! and structural alike, in assignment order. The entry at position N is
//! transaction N (1-based) and is immutable once written; the catalog
//! length equals the highest allocated txn.

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use heron_common::error::{EngineError, EngineResult};
use heron_common::types::{SegmentId, Txn, WalId};

use crate::frame::{decode_frames, encode_frame};
use crate::meta::AlterCommand;

const CATALOG_MAGIC: &[u8; 4] = b"HCAT";
const CATALOG_FORMAT_VERSION: u16 = 1;
const CATALOG_FILE: &str = "_txnlog";
const HEADER_LEN: u64 = 6;

/// One committed transaction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum CatalogEntry {
    /// A row-batch commit: points at one record inside one WAL segment.
    Data {
        wal_id: WalId,
        segment_id: SegmentId,
        segment_txn: Txn,
    },
    /// A schema change taking the table to `target_version`.
    Structure {
        target_version: u64,
        cmd: AlterCommand,
    },
}

pub struct TxnCatalog {
    file: File,
    path: PathBuf,
    entries: Vec<CatalogEntry>,
    sync: bool,
}

impl TxnCatalog {
    /// Creates an empty catalog in `dir`. Fails if one is already there.
    pub fn create(dir: &Path, sync: bool) -> EngineResult<Self> {
        let path = dir.join(CATALOG_FILE);
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .open(&path)
            .map_err(|e| EngineError::critical("could not create transaction catalog", e))?;
        file.write_all(CATALOG_MAGIC)
            .and_then(|_| file.write_all(&CATALOG_FORMAT_VERSION.to_le_bytes()))
            .and_then(|_| if sync { file.sync_data() } else { Ok(()) })
            .map_err(|e| EngineError::critical("could not write catalog header", e))?;
        Ok(Self {
            file,
            path,
            entries: Vec::new(),
            sync,
        })
    }

    /// Opens an existing catalog and replays it into memory. A torn tail
    /// (crash mid-append) is cut off so the file ends on a whole entry.
    pub fn open(dir: &Path, sync: bool) -> EngineResult<Self> {
        let path = dir.join(CATALOG_FILE);
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(&path)
            .map_err(|e| EngineError::critical("could not open transaction catalog", e))?;

        let mut header = [0u8; HEADER_LEN as usize];
        file.read_exact(&mut header)
            .map_err(|e| EngineError::critical("could not read catalog header", e))?;
        if &header[0..4] != CATALOG_MAGIC {
            return Err(EngineError::CriticalState(format!(
                "transaction catalog has bad magic [path={}]",
                path.display()
            )));
        }
        let version = u16::from_le_bytes([header[4], header[5]]);
        if version != CATALOG_FORMAT_VERSION {
            return Err(EngineError::CriticalState(format!(
                "unsupported catalog format {} [path={}]",
                version,
                path.display()
            )));
        }

        let mut data = Vec::new();
        file.read_to_end(&mut data)
            .map_err(|e| EngineError::critical("could not read transaction catalog", e))?;

        let (entries, consumed) = decode_frames::<CatalogEntry>(&data, 0, &path, "catalog");
        if (consumed as usize) < data.len() {
            tracing::warn!(path = %path.display(), "cutting torn catalog tail");
            file.set_len(HEADER_LEN + consumed)
                .map_err(|e| EngineError::critical("could not truncate torn catalog tail", e))?;
        }
        file.seek(SeekFrom::End(0))
            .map_err(|e| EngineError::critical("could not seek transaction catalog", e))?;

        Ok(Self {
            file,
            path,
            entries,
            sync,
        })
    }

    /// Durably appends one entry and returns its txn number.
    pub fn append(&mut self, entry: CatalogEntry) -> EngineResult<Txn> {
        let frame = encode_frame(&entry)?;
        self.file
            .write_all(&frame)
            .and_then(|_| if self.sync { self.file.sync_data() } else { Ok(()) })
            .map_err(|e| EngineError::critical("could not append to transaction catalog", e))?;
        self.entries.push(entry);
        Ok(self.last_txn())
    }

    /// Highest allocated txn; 0 when the catalog is empty.
    pub fn last_txn(&self) -> Txn {
        self.entries.len() as Txn
    }

    pub fn entry(&self, txn: Txn) -> Option<&CatalogEntry> {
        if txn < 1 {
            return None;
        }
        self.entries.get(txn as usize - 1)
    }

    /// Entries strictly after `from_txn`, paired with their txn numbers.
    pub fn entries_after(&self, from_txn: Txn) -> Vec<(Txn, CatalogEntry)> {
        let start = from_txn.max(0) as usize;
        self.entries
            .iter()
            .enumerate()
            .skip(start)
            .map(|(i, e)| (i as Txn + 1, e.clone()))
            .collect()
    }

    /// Structure entries with a target version above `from_version`.
    pub fn structure_entries_after(&self, from_version: u64) -> Vec<(Txn, u64, AlterCommand)> {
        self.entries
            .iter()
            .enumerate()
            .filter_map(|(i, e)| match e {
                CatalogEntry::Structure {
                    target_version,
                    cmd,
                } if *target_version > from_version => {
                    Some((i as Txn + 1, *target_version, cmd.clone()))
                }
                _ => None,
            })
            .collect()
    }

    pub fn flush(&mut self) -> EngineResult<()> {
        self.file
            .sync_data()
            .map_err(|e| EngineError::critical("could not sync transaction catalog", e))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}
