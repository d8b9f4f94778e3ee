//! Name-keyed registry of live sequencers.
//!
//! The engine routes every structural and WAL-commit operation through
//! here. Sequencers load lazily: a table registered by an earlier process
//! is opened from disk on first use.

use std::path::PathBuf;
use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;

use heron_common::error::{EngineError, EngineResult};
use heron_common::schema::TableStructure;
use heron_common::types::TableId;

use crate::commit_bus::CommitBus;
use crate::sequencer::{Sequencer, SEQ_DIR};

pub struct SequencerRegistry {
    root: PathBuf,
    sequencers: DashMap<String, Arc<Sequencer>>,
    bus: Arc<CommitBus>,
    sync: bool,
}

impl SequencerRegistry {
    pub fn new(root: impl Into<PathBuf>, bus: Arc<CommitBus>, sync: bool) -> Self {
        Self {
            root: root.into(),
            sequencers: DashMap::new(),
            bus,
            sync,
        }
    }

    /// One-time registration during table creation. The sequencer's
    /// durable state is written before the engine creates any table files.
    pub fn register_table(
        &self,
        table_id: TableId,
        structure: &TableStructure,
    ) -> EngineResult<Arc<Sequencer>> {
        match self.sequencers.entry(structure.name.clone()) {
            Entry::Occupied(_) => Err(EngineError::NonCritical(format!(
                "sequencer already registered [table={}]",
                structure.name
            ))),
            Entry::Vacant(slot) => {
                let table_dir = self.root.join(&structure.name);
                let seq = Arc::new(Sequencer::create(
                    &table_dir,
                    table_id,
                    structure,
                    self.bus.clone(),
                    self.sync,
                )?);
                slot.insert(seq.clone());
                Ok(seq)
            }
        }
    }

    /// Whether the table routes through a sequencer. True for loaded
    /// sequencers and for tables whose sequencer directory is on disk.
    pub fn is_registered(&self, table_name: &str) -> bool {
        self.sequencers.contains_key(table_name)
            || self.root.join(table_name).join(SEQ_DIR).exists()
    }

    /// Returns the table's sequencer, opening it from disk if this process
    /// has not touched it yet.
    pub fn get(&self, table_name: &str) -> EngineResult<Arc<Sequencer>> {
        match self.sequencers.entry(table_name.to_string()) {
            Entry::Occupied(slot) => Ok(slot.get().clone()),
            Entry::Vacant(slot) => {
                let table_dir = self.root.join(table_name);
                if !table_dir.join(SEQ_DIR).exists() {
                    return Err(EngineError::NonCritical(format!(
                        "table is not WAL enabled [table={}]",
                        table_name
                    )));
                }
                let seq = Arc::new(Sequencer::open(
                    &table_dir,
                    table_name,
                    self.bus.clone(),
                    self.sync,
                )?);
                slot.insert(seq.clone());
                Ok(seq)
            }
        }
    }

    /// Closes and forgets the table's sequencer. Directory removal is the
    /// caller's business; dropping an unknown table is a no-op.
    pub fn drop_table(&self, table_name: &str) {
        if let Some((_, seq)) = self.sequencers.remove(table_name) {
            seq.close();
        }
    }

    /// Re-keys a loaded sequencer after a table rename. An unloaded
    /// sequencer needs nothing: its directory moved with the table.
    pub fn rename(&self, old_name: &str, new_name: &str) {
        if let Some((_, seq)) = self.sequencers.remove(old_name) {
            seq.relocate(new_name, self.root.join(new_name));
            self.sequencers.insert(new_name.to_string(), seq);
        }
    }

    /// Visits every loaded sequencer.
    pub fn for_each(&self, mut f: impl FnMut(&str, &Arc<Sequencer>)) {
        for entry in self.sequencers.iter() {
            f(entry.key(), entry.value());
        }
    }

    pub fn loaded_count(&self) -> usize {
        self.sequencers.len()
    }

    pub fn close_all(&self) {
        let names: Vec<String> = self.sequencers.iter().map(|e| e.key().clone()).collect();
        for name in names {
            if let Some((_, seq)) = self.sequencers.remove(&name) {
                seq.close();
            }
        }
    }
}
