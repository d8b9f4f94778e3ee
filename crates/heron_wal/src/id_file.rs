//! Durable monotonic id counter.
//!
//! Backs table id and per-table WAL id allocation. The file holds the last
//! id handed out as a little-endian i64; every allocation rewrites and
//! optionally syncs it before the id is released to the caller, so a
//! restart can never re-issue an id.

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use parking_lot::Mutex;

pub struct IdFile {
    inner: Mutex<IdFileInner>,
    path: PathBuf,
    sync: bool,
}

struct IdFileInner {
    file: File,
    last: i64,
}

impl IdFile {
    /// Opens or creates the counter file. A fresh or empty file starts the
    /// sequence at 1.
    pub fn open(path: &Path, sync: bool) -> std::io::Result<Self> {
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(path)?;
        let mut buf = [0u8; 8];
        let last = match file.read_exact(&mut buf) {
            Ok(()) => i64::from_le_bytes(buf),
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => 0,
            Err(e) => return Err(e),
        };
        Ok(Self {
            inner: Mutex::new(IdFileInner { file, last }),
            path: path.to_path_buf(),
            sync,
        })
    }

    /// Allocates the next id, persisting the bump before returning it.
    pub fn next_id(&self) -> std::io::Result<i64> {
        let mut inner = self.inner.lock();
        let next = inner.last + 1;
        inner.file.seek(SeekFrom::Start(0))?;
        inner.file.write_all(&next.to_le_bytes())?;
        if self.sync {
            inner.file.sync_data()?;
        }
        inner.last = next;
        Ok(next)
    }

    /// The last id handed out; 0 when none have been.
    pub fn current(&self) -> i64 {
        self.inner.lock().last
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}
