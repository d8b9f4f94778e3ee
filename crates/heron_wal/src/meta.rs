//! Table schema state: the column slot list, its structure version, and
//! the alter operations that move it forward. The sequencer keeps the
//! sequenced copy, table storage keeps the applied copy.

use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::Write;
use std::path::Path;

use serde::{Deserialize, Serialize};

use heron_common::error::{EngineError, EngineResult};
use heron_common::schema::{ColumnDef, ColumnType, TableStructure};
use heron_common::types::TableId;

/// A structural change, serialized into the transaction catalog in a
/// self-describing form so a cursor can replay it without the issuing
/// process.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum AlterOp {
    AddColumn {
        name: String,
        col_type: ColumnType,
        indexed: bool,
        symbol_static: bool,
        hash: i64,
    },
    DropColumn {
        name: String,
    },
    RenameColumn {
        from: String,
        to: String,
    },
    SetIndexed {
        name: String,
        indexed: bool,
    },
    /// Table-level parameter change, e.g. max uncommitted rows.
    SetParam {
        name: String,
        value: String,
    },
}

impl AlterOp {
    pub fn add_column(name: impl Into<String>, col_type: ColumnType) -> Self {
        AlterOp::AddColumn {
            name: name.into(),
            col_type,
            indexed: false,
            symbol_static: false,
            hash: 0,
        }
    }
}

/// An alter operation plus the correlation id the engine stamped on it, so
/// appliers can report completion back to the issuing command.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlterCommand {
    pub correlation_id: i64,
    pub op: AlterOp,
}

/// One column slot in sequencer metadata. Dropped columns keep their slot
/// so row data written against older structure versions stays addressable.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ColumnSlot {
    pub def: ColumnDef,
    pub dropped: bool,
}

/// Receiver for a metadata copy. The two pooled metadata projections and
/// the WAL writer's cached schema view all fill themselves through this.
pub trait MetadataSink {
    fn begin(
        &mut self,
        table_name: &str,
        table_id: TableId,
        structure_version: u64,
        timestamp_index: Option<usize>,
    );
    /// Called once per slot in storage order, dropped slots included.
    fn column(&mut self, def: &ColumnDef, dropped: bool);
}

/// In-memory mirror of a table's schema. The sequencer's copy is only
/// mutated under its write lock; the table-side copy only by the writer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TableMeta {
    pub table_name: String,
    pub table_id: TableId,
    pub structure_version: u64,
    pub timestamp_index: Option<usize>,
    pub slots: Vec<ColumnSlot>,
    pub params: BTreeMap<String, String>,
    /// Next per-column tag; bumped whenever an add supplies no hash.
    next_hash: i64,
}

pub const META_FILE: &str = "_meta";

impl TableMeta {
    pub fn from_structure(table_id: TableId, structure: &TableStructure) -> Self {
        let mut next_hash = 0;
        let slots = structure
            .columns
            .iter()
            .map(|def| {
                let mut def = def.clone();
                if def.hash == 0 {
                    next_hash += 1;
                    def.hash = next_hash;
                }
                ColumnSlot {
                    def,
                    dropped: false,
                }
            })
            .collect();
        Self {
            table_name: structure.name.clone(),
            table_id,
            structure_version: 0,
            timestamp_index: structure.timestamp_index,
            slots,
            params: BTreeMap::new(),
            next_hash,
        }
    }

    pub fn live_column_count(&self) -> usize {
        self.slots.iter().filter(|s| !s.dropped).count()
    }

    pub fn live_column_index(&self, name: &str) -> Option<usize> {
        self.slots
            .iter()
            .position(|s| !s.dropped && s.def.name == name)
    }

    /// Applies one structural operation and bumps the structure version.
    /// On error nothing changes.
    pub fn apply(&mut self, op: &AlterOp) -> EngineResult<()> {
        match op {
            AlterOp::AddColumn {
                name,
                col_type,
                indexed,
                symbol_static,
                hash,
            } => {
                if self.live_column_index(name).is_some() {
                    return Err(EngineError::NonCritical(format!(
                        "column already exists [table={}, column={}]",
                        self.table_name, name
                    )));
                }
                let hash = if *hash != 0 {
                    *hash
                } else {
                    self.next_hash += 1;
                    self.next_hash
                };
                self.slots.push(ColumnSlot {
                    def: ColumnDef {
                        name: name.clone(),
                        col_type: *col_type,
                        indexed: *indexed,
                        symbol_static: *symbol_static,
                        hash,
                    },
                    dropped: false,
                });
            }
            AlterOp::DropColumn { name } => {
                let idx = self.require_live(name)?;
                if self.timestamp_index == Some(idx) {
                    return Err(EngineError::NonCritical(format!(
                        "cannot drop designated timestamp [table={}, column={}]",
                        self.table_name, name
                    )));
                }
                self.slots[idx].dropped = true;
            }
            AlterOp::RenameColumn { from, to } => {
                if self.live_column_index(to).is_some() {
                    return Err(EngineError::NonCritical(format!(
                        "rename target column already exists [table={}, column={}]",
                        self.table_name, to
                    )));
                }
                let idx = self.require_live(from)?;
                self.slots[idx].def.name = to.clone();
            }
            AlterOp::SetIndexed { name, indexed } => {
                let idx = self.require_live(name)?;
                self.slots[idx].def.indexed = *indexed;
            }
            AlterOp::SetParam { name, value } => {
                self.params.insert(name.clone(), value.clone());
            }
        }
        self.structure_version += 1;
        Ok(())
    }

    fn require_live(&self, name: &str) -> EngineResult<usize> {
        self.live_column_index(name).ok_or_else(|| {
            EngineError::NonCritical(format!(
                "column does not exist [table={}, column={}]",
                self.table_name, name
            ))
        })
    }

    pub fn copy_to(&self, sink: &mut dyn MetadataSink) {
        sink.begin(
            &self.table_name,
            self.table_id,
            self.structure_version,
            self.timestamp_index,
        );
        for slot in &self.slots {
            sink.column(&slot.def, slot.dropped);
        }
    }

    /// Writes the snapshot via a temp file so a crash never leaves a half
    /// written `_meta` behind.
    pub fn write_snapshot(&self, dir: &Path, sync: bool) -> EngineResult<()> {
        let tmp = dir.join("_meta.tmp");
        let target = dir.join(META_FILE);
        let data = bincode::serialize(self)?;
        let mut file = File::create(&tmp)
            .map_err(|e| EngineError::critical("could not create metadata snapshot", e))?;
        file.write_all(&data)
            .and_then(|_| if sync { file.sync_data() } else { Ok(()) })
            .map_err(|e| EngineError::critical("could not write metadata snapshot", e))?;
        drop(file);
        fs::rename(&tmp, &target)
            .map_err(|e| EngineError::critical("could not publish metadata snapshot", e))?;
        Ok(())
    }

    pub fn load_snapshot(dir: &Path) -> EngineResult<Self> {
        let data = fs::read(dir.join(META_FILE))
            .map_err(|e| EngineError::critical("could not read metadata snapshot", e))?;
        Ok(bincode::deserialize(&data)?)
    }
}
