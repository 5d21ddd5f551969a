#![allow(missing_docs)]

use std::fs;
use std::path::Path;
use std::sync::mpsc;
use std::time::Duration;

use penumbra::{
    Column, ColumnType, Database, LoadStatus, Metric, Result, SimilarityIndexConfig,
    SystemConfig, Value,
};
use tempfile::tempdir;

const WAIT: Duration = Duration::from_secs(30);
const TABLES: [&str; 3] = ["papers", "images", "songs"];

fn background(threads: usize) -> SystemConfig {
    SystemConfig {
        max_num_threads: threads,
        ..SystemConfig::default()
    }
}

fn manual() -> SystemConfig {
    SystemConfig {
        background_index_load: false,
        ..SystemConfig::default()
    }
}

fn replace_all(bytes: &mut [u8], from: &[u8], to: &[u8]) -> usize {
    assert_eq!(from.len(), to.len());
    let mut replaced = 0;
    let mut at = 0;
    while at + from.len() <= bytes.len() {
        if &bytes[at..at + from.len()] == from {
            bytes[at..at + from.len()].copy_from_slice(to);
            replaced += 1;
            at += from.len();
        } else {
            at += 1;
        }
    }
    replaced
}

fn vector(seed: usize) -> Vec<f32> {
    vec![seed as f32, (seed % 7) as f32, 1.0]
}

fn seed_vectors(path: &Path, rows: usize) -> Result<()> {
    let db = Database::open(path, manual())?;
    for table in TABLES {
        let mut txn = db.begin_write()?;
        txn.create_table(
            table,
            vec![
                Column::new("id", ColumnType::Int64),
                Column::new("embedding", ColumnType::FloatVector(3)),
            ],
        )?;
        txn.create_index(
            &format!("{table}_embedding"),
            table,
            SimilarityIndexConfig::new("embedding", Metric::L2, 4),
        )?;
        txn.insert(
            table,
            (0..rows)
                .map(|i| vec![Value::Int(i as i64), Value::Vector(vector(i))])
                .collect(),
        )?;
        txn.commit()?;
    }
    db.close()?;
    Ok(())
}

#[test]
fn background_load_materializes_every_index() -> Result<()> {
    let dir = tempdir()?;
    let path = dir.path().join("vectors.penumbra");
    seed_vectors(&path, 64)?;

    let db = Database::open(&path, background(2))?;
    let (tx, rx) = mpsc::channel();
    db.set_index_load_callback(move |ok, err| {
        let _ = tx.send((ok, err.map(str::to_string)));
    });
    assert_eq!(db.wait_for_index_load(WAIT), LoadStatus::Ready);
    assert_eq!(rx.recv_timeout(WAIT).ok(), Some((true, None)));
    assert!(db.is_indexes_loaded());
    assert!(db.is_indexes_ready());
    for table in TABLES {
        assert!(db.is_index_materialized(&format!("{table}_embedding")));
    }

    let hits = db.similarity_search("songs_embedding", &vector(10), 3)?;
    assert_eq!(hits.len(), 3);
    assert_eq!(hits[0].row, 10);
    assert!(hits.windows(2).all(|w| w[0].distance <= w[1].distance));
    db.close()?;
    Ok(())
}

#[test]
fn failed_index_is_reported_and_the_rest_still_load() -> Result<()> {
    let dir = tempdir()?;
    let path = dir.path().join("broken-index.penumbra");
    seed_vectors(&path, 16)?;
    let stored = SimilarityIndexConfig::new("features", Metric::L2, 4);
    {
        let db = Database::open(&path, manual())?;
        let mut txn = db.begin_write()?;
        txn.create_table(
            "broken",
            vec![
                Column::new("id", ColumnType::Int64),
                Column::new("features", ColumnType::FloatVector(3)),
            ],
        )?;
        txn.create_index("broken_features", "broken", stored.clone())?;
        txn.insert("broken", vec![vec![Value::Int(0), Value::Vector(vector(0))]])?;
        txn.commit()?;
        db.close()?;
    }

    // Point the stored index definition at a column the table lacks.
    let mut bytes = fs::read(&path)?;
    let renamed = SimilarityIndexConfig::new("featurez", Metric::L2, 4);
    assert!(replace_all(&mut bytes, &stored.to_aux_buffer(), &renamed.to_aux_buffer()) > 0);
    fs::write(&path, &bytes)?;

    let config = SystemConfig {
        enable_checksums: false,
        ..background(2)
    };
    let db = Database::open(&path, config)?;
    let (tx, rx) = mpsc::channel();
    db.set_index_load_callback(move |ok, err| {
        let _ = tx.send((ok, err.map(str::to_string)));
    });
    let LoadStatus::Failed(reason) = db.wait_for_index_load(WAIT) else {
        panic!("load should fail, got {:?}", db.index_load_status());
    };
    assert!(reason.starts_with("similarity index loading failed:"), "{reason}");
    assert!(reason.contains("  - broken_features: "), "{reason}");
    assert!(reason.contains("featurez"), "{reason}");
    assert!(!reason.contains("songs_embedding"), "{reason}");
    assert_eq!(rx.recv_timeout(WAIT).ok(), Some((false, Some(reason.clone()))));

    assert!(!db.is_index_materialized("broken_features"));
    assert!(db.is_indexes_loaded());
    assert!(!db.is_indexes_ready());
    for table in TABLES {
        assert!(db.is_index_materialized(&format!("{table}_embedding")));
    }

    let mut txn = db.begin_write()?;
    txn.insert("papers", vec![vec![Value::Int(16), Value::Vector(vector(16))]])?;
    txn.commit()?;
    assert_eq!(db.table_rows("papers")?.len(), 17);
    let hits = db.similarity_search("images_embedding", &vector(5), 1)?;
    assert_eq!(hits[0].row, 5);
    db.close()?;
    Ok(())
}

#[test]
fn disconnected_clusters_are_all_searchable() -> Result<()> {
    let dir = tempdir()?;
    let path = dir.path().join("clusters.penumbra");
    let db = Database::open(&path, manual())?;
    let mut txn = db.begin_write()?;
    txn.create_table(
        "points",
        vec![Column::new("x", ColumnType::FloatVector(1))],
    )?;
    txn.create_index("points_x", "points", SimilarityIndexConfig::new("x", Metric::L2, 4))?;
    let near = (0..100).map(|i| i as f32);
    let far = (0..100).map(|i| 100_000.0 + i as f32);
    txn.insert(
        "points",
        near.chain(far).map(|x| vec![Value::Vector(vec![x])]).collect(),
    )?;
    txn.commit()?;

    assert!(db.start_index_load()?);
    assert_eq!(db.wait_for_index_load(WAIT), LoadStatus::Ready);
    let hits = db.similarity_search("points_x", &[100_050.0], 1)?;
    assert_eq!(hits[0].row, 150);
    assert_eq!(hits[0].distance, 0.0);
    db.close()?;
    Ok(())
}

#[test]
fn callback_registered_late_fires_immediately() -> Result<()> {
    let dir = tempdir()?;
    let path = dir.path().join("late-callback.penumbra");
    seed_vectors(&path, 8)?;

    let db = Database::open(&path, background(1))?;
    assert_eq!(db.wait_for_index_load(WAIT), LoadStatus::Ready);
    let (tx, rx) = mpsc::channel();
    db.set_index_load_callback(move |ok, err| {
        let _ = tx.send((ok, err.is_none()));
    });
    assert_eq!(rx.try_recv().ok(), Some((true, true)));
    Ok(())
}

#[test]
fn manual_load_and_invalidation() -> Result<()> {
    let dir = tempdir()?;
    let path = dir.path().join("manual.penumbra");
    seed_vectors(&path, 16)?;

    let db = Database::open(&path, manual())?;
    assert_eq!(db.index_load_status(), LoadStatus::Idle);
    assert!(!db.is_indexes_loaded());
    assert!(!db.is_index_materialized("papers_embedding"));

    assert!(db.start_index_load()?);
    assert_eq!(db.wait_for_index_load(WAIT), LoadStatus::Ready);
    assert!(db.is_index_materialized("papers_embedding"));

    let mut txn = db.begin_write()?;
    txn.insert("papers", vec![vec![Value::Int(99), Value::Vector(vector(99))]])?;
    txn.commit()?;
    assert!(!db.is_index_materialized("papers_embedding"));
    assert!(db.is_index_materialized("images_embedding"));

    assert!(db.start_index_load()?);
    assert_eq!(db.wait_for_index_load(WAIT), LoadStatus::Ready);
    assert!(db.is_index_materialized("papers_embedding"));
    let hits = db.similarity_search("papers_embedding", &vector(99), 1)?;
    assert_eq!(hits[0].row, 16);
    Ok(())
}

#[test]
fn close_right_after_open_cancels_cleanly() -> Result<()> {
    let dir = tempdir()?;
    let path = dir.path().join("cancel-race.penumbra");
    seed_vectors(&path, 256)?;
    let before = fs::read(&path)?;

    let config = SystemConfig {
        force_checkpoint_on_close: false,
        ..background(4)
    };
    for _ in 0..25 {
        let db = Database::open(&path, config.clone())?;
        let (tx, rx) = mpsc::channel();
        db.set_index_load_callback(move |ok, _| {
            let _ = tx.send(ok);
        });
        assert_eq!(db.close()?, None);
        // A cancelled load never reports; a finished one reports success.
        if let Ok(ok) = rx.try_recv() {
            assert!(ok);
        }
    }
    assert_eq!(fs::read(&path)?, before);

    let db = Database::open(&path, manual())?;
    assert_eq!(db.table_rows("papers")?.len(), 256);
    Ok(())
}

#[test]
fn drop_while_loading_does_not_hang() -> Result<()> {
    let dir = tempdir()?;
    let path = dir.path().join("drop-race.penumbra");
    seed_vectors(&path, 128)?;
    for _ in 0..10 {
        let db = Database::open(&path, background(2))?;
        drop(db);
    }
    let db = Database::open(&path, manual())?;
    assert_eq!(db.catalog().indexes().count(), 3);
    Ok(())
}

#[test]
fn read_only_database_loads_without_writing() -> Result<()> {
    let dir = tempdir()?;
    let path = dir.path().join("read-only-load.penumbra");
    seed_vectors(&path, 32)?;

    let config = SystemConfig {
        read_only: true,
        ..background(2)
    };
    let db = Database::open(&path, config)?;
    assert_eq!(db.wait_for_index_load(WAIT), LoadStatus::Ready);
    assert!(db.is_index_materialized("images_embedding"));
    assert!(db.io_stats().is_quiet());
    Ok(())
}

#[test]
fn load_status_serializes_with_its_error() -> std::result::Result<(), serde_json::Error> {
    let failed = LoadStatus::Failed("similarity index loading failed".into());
    assert_eq!(
        serde_json::to_value(&failed)?,
        serde_json::json!({"status": "failed", "error": "similarity index loading failed"})
    );
    assert_eq!(
        serde_json::to_value(LoadStatus::Ready)?,
        serde_json::json!({"status": "ready"})
    );
    Ok(())
}
