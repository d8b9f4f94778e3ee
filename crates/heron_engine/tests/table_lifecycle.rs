//! Table lifecycle through the engine: create, remove, rename, reader
//! staleness, bounded repair, maintenance eviction, and shutdown.

use std::sync::Arc;
use std::time::{Duration, Instant};

use heron_common::config::EngineConfig;
use heron_common::datum::{Datum, Row};
use heron_common::schema::{ColumnType, TableStructure};
use heron_common::types::{PoolKind, TableStatus};
use heron_engine::{apply, Engine, MaintenanceJob};
use heron_wal::meta::AlterOp;

fn engine_at(root: &std::path::Path) -> Arc<Engine> {
    let mut cfg = EngineConfig::new(root);
    cfg.sync_on_commit = false;
    Arc::new(Engine::new(cfg).unwrap())
}

fn structure(name: &str, wal: bool) -> TableStructure {
    let s = TableStructure::new(name)
        .column("room", ColumnType::Str)
        .column("watts", ColumnType::Long)
        .column("timestamp", ColumnType::Timestamp)
        .designated_timestamp();
    if wal {
        s.wal()
    } else {
        s
    }
}

fn row(watts: i64) -> Row {
    vec![
        Datum::Str("kitchen".into()),
        Datum::Long(watts),
        Datum::Timestamp(1_000_000 + watts),
    ]
}

#[test]
fn test_create_write_read_non_wal_table() {
    let dir = tempfile::tempdir().unwrap();
    let engine = engine_at(dir.path());
    let id = engine.create_table(&structure("meter", false)).unwrap();
    assert_eq!(engine.table_status("meter"), TableStatus::Exists);

    let mut w = engine.get_writer("meter", "insert").unwrap();
    assert!(!w.is_wal());
    w.append_row(row(1)).unwrap();
    w.append_row(row(2)).unwrap();
    assert_eq!(w.commit().unwrap(), None);
    drop(w);

    let reader = engine.get_reader("meter", Some((id, 0))).unwrap();
    assert_eq!(reader.row_count(), 2);
    assert_eq!(reader.table_id(), id);
}

#[test]
fn test_remove_table_drops_directory_and_sequencer() {
    let dir = tempfile::tempdir().unwrap();
    let engine = engine_at(dir.path());
    engine.create_table(&structure("plug", true)).unwrap();
    assert!(engine.sequencers().is_registered("plug"));

    engine.remove_table("plug").unwrap();
    assert_eq!(engine.table_status("plug"), TableStatus::DoesNotExist);
    assert!(!engine.sequencers().is_registered("plug"));
    assert!(engine.get_reader("plug", None).is_err());
}

#[test]
fn test_rename_keeps_wal_table_sequencing() {
    let dir = tempfile::tempdir().unwrap();
    let engine = engine_at(dir.path());
    engine.create_table(&structure("plug", true)).unwrap();

    let mut w = engine.get_writer("plug", "insert").unwrap();
    w.append_row(row(1)).unwrap();
    assert_eq!(w.commit().unwrap(), Some(1));
    drop(w);

    engine.rename_table("plug", "socket").unwrap();
    assert_eq!(engine.table_status("plug"), TableStatus::DoesNotExist);
    assert_eq!(engine.table_status("socket"), TableStatus::Exists);

    // Sequencing continues in the same txn space under the new name.
    let mut w = engine.get_writer("socket", "insert").unwrap();
    assert!(w.is_wal());
    w.append_row(row(2)).unwrap();
    assert_eq!(w.commit().unwrap(), Some(2));
    drop(w);

    apply::drain(&engine).unwrap();
    let reader = engine.get_reader("socket", None).unwrap();
    assert_eq!(reader.row_count(), 2);
}

#[test]
fn test_rename_rejects_missing_source_and_existing_target() {
    let dir = tempfile::tempdir().unwrap();
    let engine = engine_at(dir.path());
    engine.create_table(&structure("plug", false)).unwrap();
    engine.create_table(&structure("meter", false)).unwrap();

    let err = engine.rename_table("ghost", "new").unwrap_err();
    assert!(!err.is_critical());
    let err = engine.rename_table("plug", "meter").unwrap_err();
    assert!(!err.is_critical());
    assert_eq!(engine.table_status("plug"), TableStatus::Exists);
}

#[test]
fn test_stale_reader_is_closed_not_leaked() {
    let dir = tempfile::tempdir().unwrap();
    let engine = engine_at(dir.path());
    let id = engine.create_table(&structure("plug", false)).unwrap();

    // Warm the pool, then move the schema forward.
    drop(engine.get_reader("plug", Some((id, 0))).unwrap());
    engine
        .alter_table("plug", AlterOp::add_column("label2", ColumnType::Int))
        .unwrap();

    let err = engine.get_reader("plug", Some((id, 0))).unwrap_err();
    assert!(err.to_string().contains("out of date"));
    let stats = engine.pool_stats(PoolKind::Reader);
    assert_eq!(stats.busy, 0, "stale reader must not stay checked out");
    assert_eq!(stats.idle, 0, "stale reader must be closed, not cached");

    // The refreshed expectation succeeds.
    engine.get_reader("plug", Some((id, 1))).unwrap();
}

#[test]
fn test_stale_reader_is_not_treated_as_repairable() {
    let dir = tempfile::tempdir().unwrap();
    let engine = engine_at(dir.path());
    let id = engine.create_table(&structure("plug", false)).unwrap();
    engine
        .alter_table("plug", AlterOp::add_column("label2", ColumnType::Int))
        .unwrap();

    let writer_checkouts = engine.pool_stats(PoolKind::Writer).checkouts;
    let err = engine
        .get_reader_with_repair("plug", Some((id, 0)))
        .unwrap_err();
    assert!(err.to_string().contains("out of date"));
    assert_eq!(
        engine.pool_stats(PoolKind::Writer).checkouts,
        writer_checkouts,
        "staleness must not open a repair writer"
    );

    engine.get_reader_with_repair("plug", Some((id, 1))).unwrap();
}

#[test]
fn test_repair_is_bounded_to_one_attempt() {
    let dir = tempfile::tempdir().unwrap();
    let engine = engine_at(dir.path());
    engine.create_table(&structure("plug", false)).unwrap();
    engine.clear();

    // With the commit watermark gone neither reader nor writer can open;
    // the single repair attempt fails and the error surfaces.
    std::fs::remove_file(dir.path().join("plug").join("_txn")).unwrap();
    let err = engine.get_reader_with_repair("plug", None).unwrap_err();
    assert!(err.is_critical());
}

#[test]
fn test_repair_skipped_while_writer_busy() {
    let dir = tempfile::tempdir().unwrap();
    let engine = engine_at(dir.path());
    engine.create_table(&structure("plug", false)).unwrap();

    let _writer = engine.get_table_writer("plug", "insert").unwrap();
    std::fs::remove_file(dir.path().join("plug").join("_txn")).unwrap();

    // The original open failure is reported, not a busy-writer error.
    let err = engine.get_reader_with_repair("plug", None).unwrap_err();
    assert!(err.is_critical());
    assert!(err.to_string().contains("txn record"));
}

#[test]
fn test_metadata_views_reload_on_checkout() {
    let dir = tempfile::tempdir().unwrap();
    let engine = engine_at(dir.path());
    engine.create_table(&structure("plug", false)).unwrap();

    drop(engine.get_metadata("plug").unwrap());
    engine
        .alter_table("plug", AlterOp::DropColumn {
            name: "room".into(),
        })
        .unwrap();

    let live = engine.get_metadata("plug").unwrap();
    assert_eq!(live.structure_version(), 1);
    assert_eq!(live.column_index("room"), None);

    let raw = engine.get_raw_metadata("plug").unwrap();
    assert_eq!(raw.slot_count(), 3);
    assert!(raw.slot(0).unwrap().dropped);
}

#[test]
fn test_maintenance_job_evicts_idle_resources() {
    let dir = tempfile::tempdir().unwrap();
    let mut cfg = EngineConfig::new(dir.path());
    cfg.sync_on_commit = false;
    cfg.idle_ttl_ms = 20;
    cfg.maintenance_interval_ms = 10;
    let engine = Arc::new(Engine::new(cfg).unwrap());
    engine.create_table(&structure("plug", false)).unwrap();
    drop(engine.get_reader("plug", None).unwrap());
    assert_eq!(engine.pool_stats(PoolKind::Reader).idle, 1);

    let mut job = MaintenanceJob::start(engine.clone()).unwrap();
    let deadline = Instant::now() + Duration::from_secs(5);
    while engine.pool_stats(PoolKind::Reader).idle > 0 {
        assert!(Instant::now() < deadline, "maintenance never evicted");
        std::thread::sleep(Duration::from_millis(10));
    }
    job.stop();
}

#[test]
fn test_clear_reports_released_resources() {
    let dir = tempfile::tempdir().unwrap();
    let engine = engine_at(dir.path());
    engine.create_table(&structure("plug", false)).unwrap();
    drop(engine.get_reader("plug", None).unwrap());

    assert!(engine.clear());
    assert!(!engine.clear());
}

#[test]
fn test_closed_engine_refuses_checkouts() {
    let dir = tempfile::tempdir().unwrap();
    let engine = engine_at(dir.path());
    engine.create_table(&structure("plug", true)).unwrap();
    engine.close();
    assert!(engine.get_writer("plug", "insert").is_err());
    assert!(engine.get_reader("plug", None).is_err());
}
