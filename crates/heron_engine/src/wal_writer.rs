//! Per-connection WAL ingest handle.
//!
//! One handle owns one wal directory of its table and stages rows against
//! a cached copy of the sequenced schema. Committing writes the staged
//! rows durably once, then asks the sequencer for a txn under the
//! optimistic structure version check. On a version miss the handle
//! refreshes its schema copy and retries with the same already written
//! batch, so a concurrent structure change never duplicates or loses
//! rows.

use std::sync::Arc;

use heron_common::datum::{Datum, Row};
use heron_common::error::{EngineError, EngineResult};
use heron_common::types::{SegmentId, Txn, WalId, NO_TXN};
use heron_wal::segment::{BatchRef, WalSegmentWriter};
use heron_wal::sequencer::Sequencer;

use crate::meta_view::UncompressedMetaView;

pub struct WalWriterHandle {
    sequencer: Arc<Sequencer>,
    segment: WalSegmentWriter,
    schema: UncompressedMetaView,
    /// Durably written but not yet sequenced batch, kept across failed
    /// commit attempts so its rows are never written twice.
    staged: Option<BatchRef>,
}

impl WalWriterHandle {
    pub fn new(sequencer: Arc<Sequencer>, rollover_rows: u64) -> EngineResult<Self> {
        let segment = sequencer.create_wal(rollover_rows)?;
        let mut schema = UncompressedMetaView::default();
        sequencer.copy_metadata_to(&mut schema);
        Ok(Self {
            sequencer,
            segment,
            schema,
            staged: None,
        })
    }

    pub fn table_name(&self) -> &str {
        self.schema.table_name()
    }

    pub fn wal_id(&self) -> WalId {
        self.segment.wal_id()
    }

    pub fn segment_id(&self) -> SegmentId {
        self.segment.segment_id()
    }

    pub fn structure_version(&self) -> u64 {
        self.schema.structure_version()
    }

    pub fn pending_rows(&self) -> usize {
        self.segment.pending_rows()
    }

    /// Stages one row, given in live column order. Missing trailing
    /// values become nulls; extra values are an error.
    pub fn append_row(&mut self, row: Row) -> EngineResult<()> {
        let slot_row = self.to_slot_row(row)?;
        self.segment.append_row(slot_row);
        Ok(())
    }

    /// Discards everything not yet sequenced: pending rows and a staged
    /// batch alike. A staged batch stays in its segment as unreferenced
    /// dead weight; without a catalog entry it is not data.
    pub fn rollback(&mut self) {
        self.segment.discard_pending();
        self.staged = None;
    }

    /// Commits one batch and returns its txn, or `None` when there was
    /// nothing to commit. An error leaves the batch staged; calling
    /// `commit` again retries sequencing without rewriting the rows.
    pub fn commit(&mut self) -> EngineResult<Option<Txn>> {
        let batch = match self.staged.take() {
            Some(batch) => batch,
            None => match self.segment.write_batch()? {
                Some(batch) => batch,
                None => return Ok(None),
            },
        };
        loop {
            let txn = match self.sequencer.next_txn(
                self.schema.structure_version(),
                self.segment.wal_id(),
                batch.segment_id,
                batch.segment_txn,
            ) {
                Ok(txn) => txn,
                Err(e) => {
                    self.staged = Some(batch);
                    return Err(e);
                }
            };
            if txn != NO_TXN {
                self.segment.maybe_roll()?;
                return Ok(Some(txn));
            }
            // Structure moved underneath us; adopt it and retry with the
            // same durable batch.
            self.refresh_schema();
            tracing::debug!(
                table = %self.schema.table_name(),
                version = self.schema.structure_version(),
                "structure changed mid commit, retrying"
            );
        }
    }

    /// Re-copies the sequenced schema into the cached view.
    pub fn refresh_schema(&mut self) {
        self.sequencer.copy_metadata_to(&mut self.schema);
    }

    fn to_slot_row(&self, row: Row) -> EngineResult<Row> {
        let live = self.schema.live_column_count();
        if row.len() > live {
            return Err(EngineError::NonCritical(format!(
                "row has {} values for {} columns [table={}]",
                row.len(),
                live,
                self.schema.table_name()
            )));
        }
        let mut values = row.into_iter();
        let mut slot_row = Vec::with_capacity(self.schema.slot_count());
        for slot in self.schema.slots() {
            if slot.dropped {
                slot_row.push(Datum::Null);
                continue;
            }
            let datum = values.next().unwrap_or(Datum::Null);
            if !slot.def.col_type.accepts(&datum) {
                return Err(EngineError::NonCritical(format!(
                    "value does not fit column [table={}, column={}, type={}]",
                    self.schema.table_name(),
                    slot.def.name,
                    slot.def.col_type
                )));
            }
            slot_row.push(datum);
        }
        Ok(slot_row)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use heron_common::schema::{ColumnType, TableStructure};
    use heron_common::types::TableId;
    use heron_wal::commit_bus::CommitBus;
    use heron_wal::meta::{AlterCommand, AlterOp};
    use heron_wal::segment::WalSegmentReader;
    use std::path::Path;

    fn structure() -> TableStructure {
        TableStructure::new("plug")
            .column("room", ColumnType::Str)
            .column("watts", ColumnType::Long)
            .column("timestamp", ColumnType::Timestamp)
            .designated_timestamp()
            .wal()
    }

    fn sequencer(dir: &Path) -> Arc<Sequencer> {
        let bus = Arc::new(CommitBus::new(64));
        Arc::new(Sequencer::create(dir, TableId(5), &structure(), bus, false).unwrap())
    }

    fn row(watts: i64) -> Row {
        vec![
            Datum::Str("kitchen".into()),
            Datum::Long(watts),
            Datum::Timestamp(1_000_000 + watts),
        ]
    }

    #[test]
    fn test_commits_assign_consecutive_txns() {
        let dir = tempfile::tempdir().unwrap();
        let seq = sequencer(dir.path());
        let mut w = WalWriterHandle::new(seq.clone(), 1000).unwrap();

        w.append_row(row(1)).unwrap();
        w.append_row(row(2)).unwrap();
        assert_eq!(w.commit().unwrap(), Some(1));
        w.append_row(row(3)).unwrap();
        assert_eq!(w.commit().unwrap(), Some(2));
        assert_eq!(seq.last_txn(), 2);
    }

    #[test]
    fn test_commit_with_nothing_pending_is_none() {
        let dir = tempfile::tempdir().unwrap();
        let mut w = WalWriterHandle::new(sequencer(dir.path()), 1000).unwrap();
        assert_eq!(w.commit().unwrap(), None);
    }

    #[test]
    fn test_concurrent_alter_retries_without_duplicating_rows() {
        let dir = tempfile::tempdir().unwrap();
        let seq = sequencer(dir.path());
        let mut w = WalWriterHandle::new(seq.clone(), 1000).unwrap();
        assert_eq!(w.structure_version(), 0);

        w.append_row(row(1)).unwrap();
        // Another session lands a structure change first.
        let cmd = AlterCommand {
            correlation_id: 9,
            op: AlterOp::add_column("label2", ColumnType::Int),
        };
        assert_eq!(seq.next_structure_txn(0, cmd).unwrap(), 1);

        // The handle's cached version 0 misses, it refreshes and retries.
        assert_eq!(w.commit().unwrap(), Some(2));
        assert_eq!(w.structure_version(), 1);

        // Exactly one record made it into the segment.
        let r = WalSegmentReader::open(dir.path(), w.wal_id(), w.segment_id()).unwrap();
        assert_eq!(r.batch_count(), 1);
        assert_eq!(r.batch(1).unwrap().len(), 1);
    }

    #[test]
    fn test_rollback_discards_pending_rows() {
        let dir = tempfile::tempdir().unwrap();
        let seq = sequencer(dir.path());
        let mut w = WalWriterHandle::new(seq.clone(), 1000).unwrap();
        w.append_row(row(1)).unwrap();
        w.rollback();
        assert_eq!(w.commit().unwrap(), None);
        assert_eq!(seq.last_txn(), 0);
    }

    #[test]
    fn test_append_validates_against_cached_schema() {
        let dir = tempfile::tempdir().unwrap();
        let mut w = WalWriterHandle::new(sequencer(dir.path()), 1000).unwrap();
        let bad = vec![Datum::Long(1), Datum::Long(2), Datum::Timestamp(3)];
        assert!(w.append_row(bad).is_err());
        assert_eq!(w.pending_rows(), 0);
    }
}
