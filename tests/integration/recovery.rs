#![allow(missing_docs)]

use std::fs::{self, OpenOptions};
use std::path::Path;

use penumbra::db::{shadow_path, wal_path};
use penumbra::primitives::wal::FILE_HEADER_LEN;
use penumbra::{Column, ColumnType, Database, PenumbraError, Result, SystemConfig, Value};
use tempfile::tempdir;

/// Leaves every commit in the WAL: no checkpoint on close.
fn wal_only() -> SystemConfig {
    SystemConfig {
        background_index_load: false,
        force_checkpoint_on_close: false,
        ..SystemConfig::default()
    }
}

fn config() -> SystemConfig {
    SystemConfig {
        background_index_load: false,
        ..SystemConfig::default()
    }
}

fn create_items(db: &Database) -> Result<()> {
    let mut txn = db.begin_write()?;
    txn.create_table(
        "items",
        vec![
            Column::new("id", ColumnType::Int64),
            Column::new("price", ColumnType::Float64),
        ],
    )?;
    txn.commit()
}

fn insert_items(db: &Database, ids: std::ops::Range<i64>) -> Result<()> {
    let mut txn = db.begin_write()?;
    txn.insert(
        "items",
        ids.map(|id| vec![Value::Int(id), Value::Float(id as f64 * 1.5)])
            .collect(),
    )?;
    txn.commit()
}

fn item_ids(db: &Database) -> Result<Vec<i64>> {
    Ok(db
        .table_rows("items")?
        .into_iter()
        .filter_map(|row| match row.first() {
            Some(Value::Int(id)) => Some(*id),
            _ => None,
        })
        .collect())
}

fn wal_len(path: &Path) -> Result<u64> {
    Ok(fs::metadata(wal_path(path))?.len())
}

#[test]
fn committed_records_replay_on_open() -> Result<()> {
    let dir = tempdir()?;
    let path = dir.path().join("replay.penumbra");
    {
        let db = Database::open(&path, wal_only())?;
        create_items(&db)?;
        insert_items(&db, 0..4)?;
        insert_items(&db, 4..6)?;
    }
    assert!(wal_len(&path)? > FILE_HEADER_LEN as u64);

    let db = Database::open(&path, config())?;
    assert_eq!(item_ids(&db)?, (0..6).collect::<Vec<_>>());
    assert_eq!(wal_len(&path)?, FILE_HEADER_LEN as u64);
    assert!(db.header().catalog_page_range.is_valid());

    // Transaction ids keep increasing past the replayed ones.
    let txn = db.begin_write()?;
    assert!(txn.id().0 > 3);
    txn.rollback();
    Ok(())
}

#[test]
fn read_only_open_replays_without_writing() -> Result<()> {
    let dir = tempdir()?;
    let path = dir.path().join("read-only.penumbra");
    {
        let db = Database::open(&path, wal_only())?;
        create_items(&db)?;
        insert_items(&db, 0..3)?;
    }
    let main_before = fs::read(&path)?;
    let wal_before = fs::read(wal_path(&path))?;

    let db = Database::open(&path, SystemConfig::read_only())?;
    assert!(db.is_read_only());
    assert_eq!(item_ids(&db)?, vec![0, 1, 2]);
    assert!(matches!(db.begin_write(), Err(PenumbraError::ReadOnly)));
    assert!(matches!(db.checkpoint(), Err(PenumbraError::ReadOnly)));
    assert!(db.io_stats().is_quiet());
    assert_eq!(db.close()?, None);

    assert_eq!(fs::read(&path)?, main_before);
    assert_eq!(fs::read(wal_path(&path))?, wal_before);
    assert!(!shadow_path(&path).exists() || fs::metadata(shadow_path(&path))?.len() == 0);
    Ok(())
}

#[test]
fn torn_wal_tail_is_dropped() -> Result<()> {
    let dir = tempdir()?;
    let path = dir.path().join("torn.penumbra");
    {
        let db = Database::open(&path, wal_only())?;
        create_items(&db)?;
        insert_items(&db, 0..2)?;
        insert_items(&db, 2..4)?;
    }
    // Cut into the last record.
    let len = wal_len(&path)?;
    OpenOptions::new()
        .write(true)
        .open(wal_path(&path))?
        .set_len(len - 5)?;

    let db = Database::open(&path, config())?;
    assert_eq!(item_ids(&db)?, vec![0, 1]);
    assert_eq!(wal_len(&path)?, FILE_HEADER_LEN as u64);
    db.close()?;
    Ok(())
}

#[test]
fn unreplayable_record_follows_the_failure_policy() -> Result<()> {
    let dir = tempdir()?;
    let path = dir.path().join("policy.penumbra");
    {
        let db = Database::open(&path, wal_only())?;
        create_items(&db)?;
        insert_items(&db, 0..2)?;
    }
    let stale_wal = fs::read(wal_path(&path))?;
    // Replays and checkpoints both records.
    Database::open(&path, config())?.close()?;

    // The stale records now create a table that already exists.
    fs::write(wal_path(&path), &stale_wal)?;
    match Database::open(&path, config()) {
        Err(PenumbraError::InvalidOwned(msg)) => assert!(msg.contains("already exists"), "{msg}"),
        Err(other) => panic!("unexpected error: {other:?}"),
        Ok(_) => panic!("replay failure was not reported"),
    }

    let lenient = SystemConfig {
        throw_on_wal_replay_failure: false,
        ..config()
    };
    let db = Database::open(&path, lenient)?;
    assert_eq!(item_ids(&db)?, vec![0, 1]);
    assert_eq!(wal_len(&path)?, FILE_HEADER_LEN as u64);
    insert_items(&db, 2..3)?;
    db.close()?;

    let db = Database::open(&path, config())?;
    assert_eq!(item_ids(&db)?, vec![0, 1, 2]);
    Ok(())
}

#[test]
fn corrupted_catalog_fails_open() -> Result<()> {
    let dir = tempdir()?;
    let path = dir.path().join("corrupt.penumbra");
    let header = {
        let db = Database::open(&path, config())?;
        create_items(&db)?;
        insert_items(&db, 0..10)?;
        db.close()?;
        Database::open(&path, SystemConfig::read_only())?.header()
    };

    let mut bytes = fs::read(&path)?;
    let catalog_at = header.catalog_page_range.start.byte_offset(header.page_size) as usize;
    bytes[catalog_at + 14] ^= 0x5A;
    fs::write(&path, &bytes)?;

    assert!(matches!(
        Database::open(&path, config()),
        Err(PenumbraError::Corruption(_) | PenumbraError::CorruptionOwned(_))
    ));
    Ok(())
}

#[test]
fn corrupted_header_fails_open() -> Result<()> {
    let dir = tempdir()?;
    let path = dir.path().join("bad-header.penumbra");
    Database::open(&path, config())?.close()?;

    let mut bytes = fs::read(&path)?;
    bytes[20] ^= 0xFF;
    fs::write(&path, &bytes)?;
    assert!(Database::open(&path, config()).is_err());
    Ok(())
}

#[test]
fn wal_of_another_database_is_rejected() -> Result<()> {
    let dir = tempdir()?;
    let first = dir.path().join("first.penumbra");
    let second = dir.path().join("second.penumbra");
    Database::open(&first, config())?.close()?;
    Database::open(&second, config())?.close()?;

    fs::copy(wal_path(&first), wal_path(&second))?;
    assert!(matches!(
        Database::open(&second, config()),
        Err(PenumbraError::Corruption(_))
    ));
    Ok(())
}

#[test]
fn dropped_table_pages_are_reused_after_checkpoint() -> Result<()> {
    let dir = tempdir()?;
    let path = dir.path().join("reuse.penumbra");
    let db = Database::open(&path, config())?;
    create_items(&db)?;
    insert_items(&db, 0..500)?;
    db.checkpoint()?;
    let grown = db.layout().num_pages;

    let mut txn = db.begin_write()?;
    txn.drop_table("items")?;
    txn.commit()?;
    assert!(!db.layout().pending_free.is_empty());
    db.checkpoint()?;
    let layout = db.layout();
    assert!(layout.pending_free.is_empty());
    assert!(!layout.free_ranges.is_empty());

    create_items(&db)?;
    insert_items(&db, 0..500)?;
    db.checkpoint()?;
    assert!(db.layout().num_pages <= grown + 2);
    db.close()?;
    Ok(())
}
