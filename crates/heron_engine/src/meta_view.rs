//! Pooled schema views.
//!
//! Two projections of the same applied schema. The compressed view keeps
//! live columns only and renumbers them to query positions; the
//! uncompressed view keeps every slot, tombstones included, in storage
//! order. Both fill themselves through [`MetadataSink`], so a sequencer
//! copy and an on-disk snapshot load look the same to them.

use std::path::Path;

use heron_common::error::EngineResult;
use heron_common::schema::ColumnDef;
use heron_common::types::TableId;
use heron_wal::meta::{ColumnSlot, MetadataSink, TableMeta};

#[derive(Debug, Default)]
pub struct CompressedMetaView {
    table_name: String,
    table_id: TableId,
    structure_version: u64,
    timestamp_slot: Option<usize>,
    columns: Vec<ColumnDef>,
    /// Live position per storage slot; `None` for tombstones.
    slot_to_live: Vec<Option<usize>>,
}

impl CompressedMetaView {
    pub fn load(dir: &Path) -> EngineResult<Self> {
        let meta = TableMeta::load_snapshot(dir)?;
        let mut view = Self::default();
        meta.copy_to(&mut view);
        Ok(view)
    }

    pub fn reload(&mut self, dir: &Path) -> EngineResult<()> {
        let meta = TableMeta::load_snapshot(dir)?;
        meta.copy_to(self);
        Ok(())
    }

    pub fn table_name(&self) -> &str {
        &self.table_name
    }

    pub fn table_id(&self) -> TableId {
        self.table_id
    }

    pub fn structure_version(&self) -> u64 {
        self.structure_version
    }

    pub fn column_count(&self) -> usize {
        self.columns.len()
    }

    pub fn column(&self, index: usize) -> Option<&ColumnDef> {
        self.columns.get(index)
    }

    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|c| c.name == name)
    }

    /// Designated timestamp as a live column position.
    pub fn timestamp_index(&self) -> Option<usize> {
        self.timestamp_slot
            .and_then(|slot| self.slot_to_live.get(slot).copied().flatten())
    }
}

impl MetadataSink for CompressedMetaView {
    fn begin(
        &mut self,
        table_name: &str,
        table_id: TableId,
        structure_version: u64,
        timestamp_index: Option<usize>,
    ) {
        self.table_name = table_name.to_string();
        self.table_id = table_id;
        self.structure_version = structure_version;
        self.timestamp_slot = timestamp_index;
        self.columns.clear();
        self.slot_to_live.clear();
    }

    fn column(&mut self, def: &ColumnDef, dropped: bool) {
        if dropped {
            self.slot_to_live.push(None);
        } else {
            self.slot_to_live.push(Some(self.columns.len()));
            self.columns.push(def.clone());
        }
    }
}

#[derive(Debug, Default)]
pub struct UncompressedMetaView {
    table_name: String,
    table_id: TableId,
    structure_version: u64,
    timestamp_slot: Option<usize>,
    slots: Vec<ColumnSlot>,
}

impl UncompressedMetaView {
    pub fn load(dir: &Path) -> EngineResult<Self> {
        let meta = TableMeta::load_snapshot(dir)?;
        let mut view = Self::default();
        meta.copy_to(&mut view);
        Ok(view)
    }

    pub fn reload(&mut self, dir: &Path) -> EngineResult<()> {
        let meta = TableMeta::load_snapshot(dir)?;
        meta.copy_to(self);
        Ok(())
    }

    pub fn table_name(&self) -> &str {
        &self.table_name
    }

    pub fn table_id(&self) -> TableId {
        self.table_id
    }

    pub fn structure_version(&self) -> u64 {
        self.structure_version
    }

    pub fn slot_count(&self) -> usize {
        self.slots.len()
    }

    pub fn slot(&self, index: usize) -> Option<&ColumnSlot> {
        self.slots.get(index)
    }

    pub fn slots(&self) -> &[ColumnSlot] {
        &self.slots
    }

    pub fn live_column_count(&self) -> usize {
        self.slots.iter().filter(|s| !s.dropped).count()
    }

    /// Designated timestamp as a storage slot position.
    pub fn timestamp_slot(&self) -> Option<usize> {
        self.timestamp_slot
    }
}

impl MetadataSink for UncompressedMetaView {
    fn begin(
        &mut self,
        table_name: &str,
        table_id: TableId,
        structure_version: u64,
        timestamp_index: Option<usize>,
    ) {
        self.table_name = table_name.to_string();
        self.table_id = table_id;
        self.structure_version = structure_version;
        self.timestamp_slot = timestamp_index;
        self.slots.clear();
    }

    fn column(&mut self, def: &ColumnDef, dropped: bool) {
        self.slots.push(ColumnSlot {
            def: def.clone(),
            dropped,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use heron_common::schema::{ColumnType, TableStructure};
    use heron_wal::meta::AlterOp;

    fn meta_with_tombstone() -> TableMeta {
        let structure = TableStructure::new("plug")
            .column("room", ColumnType::Str)
            .column("watts", ColumnType::Long)
            .column("timestamp", ColumnType::Timestamp)
            .designated_timestamp();
        let mut meta = TableMeta::from_structure(TableId(4), &structure);
        meta.apply(&AlterOp::DropColumn {
            name: "room".into(),
        })
        .unwrap();
        meta.apply(&AlterOp::add_column("label2", ColumnType::Int))
            .unwrap();
        meta
    }

    #[test]
    fn test_compressed_view_renumbers_live_columns() {
        let meta = meta_with_tombstone();
        let mut view = CompressedMetaView::default();
        meta.copy_to(&mut view);

        assert_eq!(view.structure_version(), 2);
        assert_eq!(view.column_count(), 3);
        assert_eq!(view.column_index("room"), None);
        assert_eq!(view.column_index("watts"), Some(0));
        assert_eq!(view.column_index("label2"), Some(2));
        // The timestamp sits in slot 2 but live position 1.
        assert_eq!(view.timestamp_index(), Some(1));
    }

    #[test]
    fn test_uncompressed_view_keeps_tombstones() {
        let meta = meta_with_tombstone();
        let mut view = UncompressedMetaView::default();
        meta.copy_to(&mut view);

        assert_eq!(view.slot_count(), 4);
        let room = view.slot(0).unwrap();
        assert!(room.dropped);
        assert_eq!(room.def.name, "room");
        assert_eq!(view.timestamp_slot(), Some(2));
    }

    #[test]
    fn test_views_load_and_reload_from_snapshot() {
        let dir = tempfile::tempdir().unwrap();
        let mut meta = meta_with_tombstone();
        meta.write_snapshot(dir.path(), false).unwrap();

        let mut compressed = CompressedMetaView::load(dir.path()).unwrap();
        let mut raw = UncompressedMetaView::load(dir.path()).unwrap();
        assert_eq!(compressed.structure_version(), 2);
        assert_eq!(raw.structure_version(), 2);

        meta.apply(&AlterOp::add_column("label3", ColumnType::Int))
            .unwrap();
        meta.write_snapshot(dir.path(), false).unwrap();
        compressed.reload(dir.path()).unwrap();
        raw.reload(dir.path()).unwrap();
        assert_eq!(compressed.structure_version(), 3);
        assert_eq!(raw.slot_count(), 5);
    }
}
