//! Filesystem operations on table directories.
//!
//! Every table lives in `<root>/<table_name>/`. Failures carry the OS
//! errno through [`EngineError::Critical`]; removing a table that has no
//! directory is reported with ENOENT rather than being papered over.

use std::fs;
use std::path::{Path, PathBuf};

use heron_common::error::{EngineError, EngineResult};
use heron_common::types::TableStatus;
use heron_wal::meta::META_FILE;

pub fn table_dir(root: &Path, table_name: &str) -> PathBuf {
    root.join(table_name)
}

/// Existence probe straight off the filesystem; takes no locks. A
/// directory without a schema snapshot is mid-create or a leftover and
/// reports as reserved.
pub fn table_status(root: &Path, table_name: &str) -> TableStatus {
    let dir = root.join(table_name);
    if !dir.is_dir() {
        return TableStatus::DoesNotExist;
    }
    if dir.join(META_FILE).is_file() {
        TableStatus::Exists
    } else {
        TableStatus::Reserved
    }
}

pub fn remove_table_dir(root: &Path, table_name: &str) -> EngineResult<()> {
    let dir = root.join(table_name);
    fs::remove_dir_all(&dir)
        .map_err(|e| EngineError::critical("could not remove table directory", e))?;
    tracing::info!(table = table_name, "table directory removed");
    Ok(())
}

pub fn rename_table_dir(root: &Path, old_name: &str, new_name: &str) -> EngineResult<()> {
    let to = root.join(new_name);
    if to.exists() {
        return Err(EngineError::NonCritical(format!(
            "table already exists [name={}]",
            new_name
        )));
    }
    fs::rename(root.join(old_name), &to)
        .map_err(|e| EngineError::critical("could not rename table directory", e))?;
    tracing::info!(old = old_name, new = new_name, "table directory renamed");
    Ok(())
}
