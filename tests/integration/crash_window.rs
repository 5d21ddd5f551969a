#![allow(missing_docs)]

use std::fs::{self, OpenOptions};
use std::path::{Path, PathBuf};
use std::process::{abort, Command};
use std::sync::Arc;

use penumbra::db::{shadow_path, wal_path};
use penumbra::primitives::io::{OpenMode, StdFileIo};
use penumbra::primitives::wal::{Wal, WalOptions, FILE_HEADER_LEN};
use penumbra::{
    Column, ColumnType, Database, FailPoint, PenumbraError, Result, SystemConfig, Value,
};
use tempfile::tempdir;

const CRASH_ENV: &str = "PENUMBRA_CRASH_DB_PATH";

fn config() -> SystemConfig {
    SystemConfig {
        background_index_load: false,
        ..SystemConfig::default()
    }
}

fn seed(db: &Database, first: i64, count: i64) -> Result<()> {
    let mut txn = db.begin_write()?;
    if db.catalog().table_by_name("events").is_none() {
        txn.create_table(
            "events",
            vec![
                Column::new("seq", ColumnType::Int64),
                Column::new("payload", ColumnType::String),
            ],
        )?;
    }
    let rows = (first..first + count)
        .map(|seq| vec![Value::Int(seq), Value::Str(format!("event-{seq:04}").repeat(8))])
        .collect();
    txn.insert("events", rows)?;
    txn.commit()
}

fn seqs(db: &Database) -> Result<Vec<i64>> {
    Ok(db
        .table_rows("events")?
        .into_iter()
        .filter_map(|row| match row.first() {
            Some(Value::Int(seq)) => Some(*seq),
            _ => None,
        })
        .collect())
}

fn sidecar_len(path: &Path) -> u64 {
    fs::metadata(path).map(|m| m.len()).unwrap_or(0)
}

fn truncate_sidecar(path: &Path, len: u64) -> Result<()> {
    OpenOptions::new().write(true).open(path)?.set_len(len)?;
    Ok(())
}

/// Leaves `path` with a durable marker after a checkpoint failed at
/// `fail_point`, holding rows `0..20`.
fn stop_inside_the_crash_window(path: &Path, fail_point: FailPoint) -> Result<()> {
    let db = Database::open(path, config())?;
    seed(&db, 0, 20)?;
    db.set_fail_point(Some(fail_point));
    assert!(matches!(db.checkpoint(), Err(PenumbraError::RecoveryRequired)));
    assert_eq!(db.close()?, None);
    Ok(())
}

#[test]
fn failure_before_the_marker_rolls_back() -> Result<()> {
    for fail_point in [FailPoint::BeforeShadowFlush, FailPoint::AfterShadowFlush] {
        let dir = tempdir()?;
        let path = dir.path().join("rollback.penumbra");
        let db = Database::open(&path, config())?;
        seed(&db, 0, 10)?;
        db.checkpoint()?;
        let committed = db.layout();

        seed(&db, 10, 5)?;
        db.set_fail_point(Some(fail_point));
        match db.checkpoint() {
            Err(PenumbraError::Injected(at)) => assert_eq!(at, fail_point),
            other => panic!("expected injected failure, got {other:?}"),
        }
        assert!(!db.needs_recovery());
        let after = db.layout();
        assert_eq!(after.header, committed.header);
        assert_eq!(after.free_ranges, committed.free_ranges);
        assert_eq!(sidecar_len(&shadow_path(&path)), 0);

        db.set_fail_point(None);
        assert!(db.checkpoint()?.is_completed());
        db.close()?;

        let db = Database::open(&path, config())?;
        assert_eq!(seqs(&db)?, (0..15).collect::<Vec<_>>());
    }
    Ok(())
}

#[test]
fn failure_inside_the_crash_window_is_redone_on_open() -> Result<()> {
    for fail_point in [FailPoint::AfterWalMarker, FailPoint::AfterApply] {
        let dir = tempdir()?;
        let path = dir.path().join("redo.penumbra");
        {
            let db = Database::open(&path, config())?;
            seed(&db, 0, 20)?;
            db.set_fail_point(Some(fail_point));
            assert!(matches!(db.checkpoint(), Err(PenumbraError::RecoveryRequired)));
            assert!(db.needs_recovery());
            assert!(matches!(db.begin_write(), Err(PenumbraError::RecoveryRequired)));
            assert!(matches!(db.checkpoint(), Err(PenumbraError::RecoveryRequired)));
            // Close skips its checkpoint once recovery is required.
            assert_eq!(db.close()?, None);
        }
        assert!(sidecar_len(&shadow_path(&path)) > 0);

        assert!(matches!(
            Database::open(&path, SystemConfig::read_only()),
            Err(PenumbraError::RecoveryRequired)
        ));

        let db = Database::open(&path, config())?;
        assert!(!db.needs_recovery());
        assert_eq!(seqs(&db)?, (0..20).collect::<Vec<_>>());
        assert!(db.header().catalog_page_range.is_valid());
        assert_eq!(sidecar_len(&wal_path(&path)), FILE_HEADER_LEN as u64);
        assert_eq!(sidecar_len(&shadow_path(&path)), 0);
        seed(&db, 20, 1)?;
        db.close()?;

        let db = Database::open(&path, SystemConfig::read_only())?;
        assert_eq!(seqs(&db)?.len(), 21);
    }
    Ok(())
}

#[test]
fn marker_with_an_emptied_shadow_file_opens() -> Result<()> {
    let dir = tempdir()?;
    let path = dir.path().join("applied.penumbra");
    stop_inside_the_crash_window(&path, FailPoint::AfterApply)?;
    // Recovery crashed after emptying the shadow file but before the WAL.
    truncate_sidecar(&shadow_path(&path), 0)?;
    assert!(sidecar_len(&wal_path(&path)) > FILE_HEADER_LEN as u64);

    let db = Database::open(&path, config())?;
    assert!(!db.needs_recovery());
    assert_eq!(seqs(&db)?, (0..20).collect::<Vec<_>>());
    assert_eq!(sidecar_len(&wal_path(&path)), FILE_HEADER_LEN as u64);
    seed(&db, 20, 2)?;
    db.close()?;

    let db = Database::open(&path, config())?;
    assert_eq!(seqs(&db)?, (0..22).collect::<Vec<_>>());
    Ok(())
}

#[test]
fn cleared_wal_with_a_leftover_shadow_file_opens() -> Result<()> {
    let dir = tempdir()?;
    let path = dir.path().join("cleared.penumbra");
    stop_inside_the_crash_window(&path, FailPoint::AfterApply)?;
    // Crash between clearing the WAL and clearing the shadow file.
    truncate_sidecar(&wal_path(&path), FILE_HEADER_LEN as u64)?;
    assert!(sidecar_len(&shadow_path(&path)) > 0);

    let db = Database::open(&path, config())?;
    assert_eq!(seqs(&db)?, (0..20).collect::<Vec<_>>());
    assert_eq!(sidecar_len(&shadow_path(&path)), 0);
    db.close()?;
    Ok(())
}

#[test]
fn commit_behind_a_checkpoint_marker_is_corruption() -> Result<()> {
    let dir = tempdir()?;
    let path = dir.path().join("late-commit.penumbra");
    let header = {
        let db = Database::open(&path, config())?;
        let header = db.header();
        db.close()?;
        header
    };
    stop_inside_the_crash_window(&path, FailPoint::AfterWalMarker)?;

    let io = StdFileIo::open(wal_path(&path), OpenMode::ReadWriteCreate)?;
    let wal = Wal::open(Arc::new(io), WalOptions::new(header.page_size, header.database_id))?;
    wal.log_commit(b"late")?;
    drop(wal);
    let wal_len = sidecar_len(&wal_path(&path));

    match Database::open(&path, config()) {
        Err(PenumbraError::CorruptionOwned(msg)) => {
            assert!(msg.contains("follow the checkpoint marker"), "{msg}")
        }
        Err(other) => panic!("unexpected error: {other:?}"),
        Ok(_) => panic!("late commit was not reported"),
    }
    // Nothing was discarded.
    assert_eq!(sidecar_len(&wal_path(&path)), wal_len);
    assert!(sidecar_len(&shadow_path(&path)) > 0);
    Ok(())
}

#[test]
fn abort_inside_the_crash_window_recovers() -> Result<()> {
    let dir = tempdir()?;
    let db_path = dir.path().join("crash-harness.penumbra");

    // Re-run this binary in a mode that aborts after the WAL marker is durable.
    let child_status = Command::new(std::env::current_exe()?)
        .env(CRASH_ENV, &db_path)
        .arg("--nocapture")
        .arg("--ignored")
        .arg("crash_child_abort_after_marker")
        .status()?;
    assert!(!child_status.success(), "child should abort");

    let db = Database::open(&db_path, config())?;
    assert_eq!(seqs(&db)?, (0..50).collect::<Vec<_>>());
    assert_eq!(sidecar_len(&shadow_path(&db_path)), 0);
    db.close()?;
    Ok(())
}

#[test]
#[ignore]
fn crash_child_abort_after_marker() -> Result<()> {
    let path = std::env::var(CRASH_ENV).map_err(|_| PenumbraError::Invalid("missing crash path"))?;
    let db = Database::open(PathBuf::from(path), config())?;
    seed(&db, 0, 30)?;
    db.checkpoint()?;
    seed(&db, 30, 20)?;
    db.set_fail_point(Some(FailPoint::AfterWalMarker));
    let _ = db.checkpoint();
    // Simulate an abrupt crash before any cleanup.
    abort();
}

#[test]
fn abort_after_commit_replays_the_wal() -> Result<()> {
    let dir = tempdir()?;
    let db_path = dir.path().join("crash-commit.penumbra");

    let child_status = Command::new(std::env::current_exe()?)
        .env(CRASH_ENV, &db_path)
        .arg("--nocapture")
        .arg("--ignored")
        .arg("crash_child_abort_after_commit")
        .status()?;
    assert!(!child_status.success(), "child should abort");
    assert!(sidecar_len(&wal_path(&db_path)) > FILE_HEADER_LEN as u64);

    let db = Database::open(&db_path, config())?;
    assert_eq!(seqs(&db)?, (0..12).collect::<Vec<_>>());
    // Replayed records are checkpointed during open.
    assert_eq!(sidecar_len(&wal_path(&db_path)), FILE_HEADER_LEN as u64);
    Ok(())
}

#[test]
#[ignore]
fn crash_child_abort_after_commit() -> Result<()> {
    let path = std::env::var(CRASH_ENV).map_err(|_| PenumbraError::Invalid("missing crash path"))?;
    let db = Database::open(PathBuf::from(path), config())?;
    seed(&db, 0, 8)?;
    db.checkpoint()?;
    seed(&db, 8, 4)?;
    abort();
}
