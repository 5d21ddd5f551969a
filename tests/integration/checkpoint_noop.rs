#![allow(missing_docs)]

use std::fs;
use std::path::Path;

use penumbra::storage::table::TableStorageInfo;
use penumbra::{
    CheckpointOutcome, Column, ColumnType, Database, Metric, Result, SimilarityIndexConfig,
    SkipReason, SystemConfig, Value,
};
use tempfile::tempdir;

fn config() -> SystemConfig {
    SystemConfig {
        background_index_load: false,
        ..SystemConfig::default()
    }
}

fn create_docs_schema(db: &Database) -> Result<()> {
    let mut txn = db.begin_write()?;
    txn.create_table(
        "docs",
        vec![
            Column::new("id", ColumnType::Int64),
            Column::new("title", ColumnType::String),
            Column::new("embedding", ColumnType::FloatVector(3)),
        ],
    )?;
    txn.create_index(
        "docs_embedding",
        "docs",
        SimilarityIndexConfig::new("embedding", Metric::Cosine, 4),
    )?;
    txn.commit()
}

fn docs_storage(db: &Database) -> Option<TableStorageInfo> {
    db.layout()
        .tables
        .into_iter()
        .find(|(_, name, _)| name == "docs")
        .map(|(_, _, info)| info)
}

fn insert_title(db: &Database, id: i64, title: &str) -> Result<()> {
    let mut txn = db.begin_write()?;
    txn.insert(
        "docs",
        vec![vec![
            Value::Int(id),
            Value::Str(title.to_string()),
            Value::Vector(vec![id as f32, 1.0, 0.0]),
        ]],
    )?;
    txn.commit()
}

#[test]
fn schema_only_database_reopens_empty_with_unloaded_index() -> Result<()> {
    let dir = tempdir()?;
    let path = dir.path().join("schema-only.penumbra");
    {
        let db = Database::open(&path, config())?;
        create_docs_schema(&db)?;
        let outcome = db.close()?;
        assert!(outcome.is_some_and(|o| o.is_completed()));
    }

    let db = Database::open(&path, config())?;
    let catalog = db.catalog();
    let table = catalog.table_by_name("docs").expect("docs table");
    assert_eq!(table.columns.len(), 3);
    let index = catalog.index_by_name("docs_embedding").expect("docs index");
    assert_eq!(index.table, table.id);
    assert!(!index.is_loaded());
    assert!(!db.is_index_materialized("docs_embedding"));
    assert!(db.table_rows("docs")?.is_empty());
    assert_eq!(docs_storage(&db), Some(TableStorageInfo::EMPTY));

    // First use materializes the empty index.
    assert_eq!(db.load_index("docs_embedding")?, 0);
    assert!(db.is_index_materialized("docs_embedding"));
    db.close()?;
    Ok(())
}

#[test]
fn second_checkpoint_performs_no_io() -> Result<()> {
    let dir = tempdir()?;
    let path = dir.path().join("idempotent.penumbra");
    let db = Database::open(&path, config())?;
    create_docs_schema(&db)?;
    insert_title(&db, 1, "short")?;
    assert!(db.checkpoint()?.is_completed());

    let layout_before = db.layout();
    let io_before = db.io_stats();
    assert_eq!(db.checkpoint()?, CheckpointOutcome::Skipped(SkipReason::NoChanges));
    let io_delta = db.io_stats().since(&io_before);
    assert!(io_delta.is_quiet(), "unexpected io: {io_delta:?}");
    let layout_after = db.layout();
    assert_eq!(layout_after.num_pages, layout_before.num_pages);
    assert_eq!(layout_after.header, layout_before.header);
    db.close()?;
    Ok(())
}

#[test]
fn schema_checkpoint_allocates_no_table_pages() -> Result<()> {
    let dir = tempdir()?;
    let path = dir.path().join("no-table-pages.penumbra");
    let db = Database::open(&path, config())?;
    create_docs_schema(&db)?;
    db.checkpoint()?;

    let layout = db.layout();
    let header = layout.header;
    assert!(header.catalog_page_range.is_valid());
    assert!(header.metadata_page_range.is_valid());
    // Header page, catalog and metadata are the only owners.
    assert_eq!(
        layout.num_pages,
        1 + header.catalog_page_range.num_pages + header.metadata_page_range.num_pages
    );
    assert_eq!(docs_storage(&db), Some(TableStorageInfo::EMPTY));
    db.close()?;
    Ok(())
}

#[test]
fn inline_limit_gates_the_overflow_store() -> Result<()> {
    let dir = tempdir()?;
    let path = dir.path().join("overflow-boundary.penumbra");
    let limit = SystemConfig::default().overflow_inline_limit;
    let at_limit = "a".repeat(limit);
    let past_limit = "b".repeat(limit + 1);
    {
        let db = Database::open(&path, config())?;
        create_docs_schema(&db)?;
        insert_title(&db, 1, &at_limit)?;
        db.checkpoint()?;
        let info = docs_storage(&db).expect("docs storage");
        assert_eq!(info.num_rows, 1);
        assert!(info.rows_range.is_valid());
        assert!(info.overflow.is_absent(), "inline value touched overflow: {info:?}");

        insert_title(&db, 2, &past_limit)?;
        db.checkpoint()?;
        let info = docs_storage(&db).expect("docs storage");
        assert_eq!(info.num_rows, 2);
        assert!(info.overflow.header_page.is_valid());
        assert!(info.overflow.data_range.is_valid());
        info.check_pairing()?;
        db.close()?;
    }

    let db = Database::open(&path, config())?;
    let rows = db.table_rows("docs")?;
    assert_eq!(rows.len(), 2);
    assert_eq!(rows[0][1], Value::Str(at_limit));
    assert_eq!(rows[1][1], Value::Str(past_limit));
    Ok(())
}

#[test]
fn reopening_a_clean_file_leaves_it_byte_identical() -> Result<()> {
    let dir = tempdir()?;
    let path = dir.path().join("clean.penumbra");
    {
        let db = Database::open(&path, config())?;
        create_docs_schema(&db)?;
        insert_title(&db, 7, "persisted")?;
        db.close()?;
    }
    let before = fs::read(&path)?;

    let db = Database::open(&path, config())?;
    assert!(db.io_stats().is_quiet());
    assert_eq!(db.table_rows("docs")?.len(), 1);
    assert_eq!(
        db.close()?,
        Some(CheckpointOutcome::Skipped(SkipReason::NoChanges))
    );
    assert_eq!(fs::read(&path)?, before);
    assert_wal_empty(&path)?;
    Ok(())
}

fn assert_wal_empty(path: &Path) -> Result<()> {
    let wal = penumbra::db::wal_path(path);
    assert_eq!(
        fs::metadata(wal)?.len(),
        penumbra::primitives::wal::FILE_HEADER_LEN as u64
    );
    Ok(())
}
