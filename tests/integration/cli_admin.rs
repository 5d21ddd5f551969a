#![allow(missing_docs)]

use std::fs;
use std::path::{Path, PathBuf};

use assert_cmd::cargo::cargo_bin_cmd;
use penumbra::db::wal_path;
use penumbra::primitives::wal::FILE_HEADER_LEN;
use penumbra::{Column, ColumnType, Database, Metric, SimilarityIndexConfig, SystemConfig, Value};
use serde_json::Value as Json;
use tempfile::TempDir;

fn setup_db(name: &str, checkpoint_on_close: bool) -> (TempDir, PathBuf) {
    let dir = TempDir::new().expect("tempdir");
    let path = dir.path().join(format!("{name}.penumbra"));
    seed_demo(&path, checkpoint_on_close).expect("seed demo data");
    (dir, path)
}

fn seed_demo(path: &Path, checkpoint_on_close: bool) -> penumbra::Result<()> {
    let db = Database::open(
        path,
        SystemConfig {
            background_index_load: false,
            force_checkpoint_on_close: checkpoint_on_close,
            ..SystemConfig::default()
        },
    )?;
    let mut txn = db.begin_write()?;
    txn.create_table(
        "tracks",
        vec![
            Column::new("id", ColumnType::Int64),
            Column::new("title", ColumnType::String),
            Column::new("embedding", ColumnType::FloatVector(2)),
        ],
    )?;
    txn.create_index(
        "tracks_embedding",
        "tracks",
        SimilarityIndexConfig::new("embedding", Metric::L2, 4),
    )?;
    txn.insert(
        "tracks",
        (0..12)
            .map(|i| {
                vec![
                    Value::Int(i),
                    Value::Str(format!("track {i}")),
                    Value::Vector(vec![i as f32, 0.5]),
                ]
            })
            .collect(),
    )?;
    txn.commit()?;
    db.close()?;
    Ok(())
}

fn json_stdout(args: &[&str], db_path: &Path) -> Json {
    let output = cargo_bin_cmd!("penumbra")
        .args(["--format", "json"])
        .args(args)
        .arg(db_path)
        .assert()
        .success()
        .get_output()
        .stdout
        .clone();
    serde_json::from_slice(&output).expect("json output")
}

#[test]
fn info_reports_tables_and_indexes() {
    let (_tmp, db_path) = setup_db("info", true);
    let json = json_stdout(&["info"], &db_path);

    assert_eq!(json["header"]["page_size"], 4096);
    assert_eq!(json["header"]["logically_empty"], false);
    assert!(json["header"]["catalog_range"]["start"].is_u64());
    assert_eq!(json["tables"][0]["name"], "tracks");
    assert_eq!(json["tables"][0]["rows"], 12);
    assert_eq!(json["tables"][0]["persisted_rows"], 12);
    assert_eq!(json["indexes"][0]["name"], "tracks_embedding");
    assert_eq!(json["indexes"][0]["table"], "tracks");
    assert_eq!(json["files"]["wal_bytes"], FILE_HEADER_LEN as u64);
}

#[test]
fn info_text_lists_sections() {
    let (_tmp, db_path) = setup_db("info-text", true);
    let output = cargo_bin_cmd!("penumbra")
        .arg("info")
        .arg(&db_path)
        .assert()
        .success()
        .get_output()
        .stdout
        .clone();
    let text = String::from_utf8(output).expect("utf8");
    assert!(text.contains("Header:"), "{text}");
    assert!(text.contains("Tables:"), "{text}");
    assert!(text.contains("tracks_embedding"), "{text}");
}

#[test]
fn info_does_not_touch_a_pending_wal() {
    let (_tmp, db_path) = setup_db("info-pending", false);
    let wal_before = fs::read(wal_path(&db_path)).expect("wal");
    assert!(wal_before.len() > FILE_HEADER_LEN);

    let json = json_stdout(&["info"], &db_path);
    assert_eq!(json["tables"][0]["rows"], 12);
    assert_eq!(fs::read(wal_path(&db_path)).expect("wal"), wal_before);
}

#[test]
fn checkpoint_drains_a_pending_wal() {
    let (_tmp, db_path) = setup_db("checkpoint", false);
    let json = json_stdout(&["checkpoint"], &db_path);

    let outcome = json["outcome"].as_str().expect("outcome");
    assert!(matches!(outcome, "completed" | "no_changes"), "{outcome}");
    assert_eq!(json["wal_bytes_after"], FILE_HEADER_LEN as u64);
    assert!(json["catalog_range"]["start"].is_u64());
    assert_eq!(
        fs::metadata(wal_path(&db_path)).expect("wal").len(),
        FILE_HEADER_LEN as u64
    );

    let db = Database::open(&db_path, SystemConfig::read_only()).expect("reopen");
    assert_eq!(db.table_rows("tracks").expect("rows").len(), 12);
}

#[test]
fn checkpoint_refuses_read_only() {
    let (_tmp, db_path) = setup_db("checkpoint-ro", false);
    let wal_before = fs::read(wal_path(&db_path)).expect("wal");
    cargo_bin_cmd!("penumbra")
        .args(["--read-only", "checkpoint"])
        .arg(&db_path)
        .assert()
        .failure()
        .code(1);
    assert_eq!(fs::read(wal_path(&db_path)).expect("wal"), wal_before);
}

#[test]
fn read_only_from_config_file_applies() {
    let (tmp, db_path) = setup_db("config", false);
    let config_path = tmp.path().join("penumbra.toml");
    fs::write(&config_path, "read_only = true\nbuffer_pool_pages = 64\n").expect("config");

    let output = cargo_bin_cmd!("penumbra")
        .arg("--config")
        .arg(&config_path)
        .arg("checkpoint")
        .arg(&db_path)
        .assert()
        .failure()
        .get_output()
        .stderr
        .clone();
    let stderr = String::from_utf8(output).expect("utf8");
    assert!(stderr.contains("read-only"), "{stderr}");
}

#[test]
fn malformed_config_file_is_reported() {
    let (tmp, db_path) = setup_db("bad-config", true);
    let config_path = tmp.path().join("broken.toml");
    fs::write(&config_path, "page_size = \"large\"\n").expect("config");

    let output = cargo_bin_cmd!("penumbra")
        .arg("--config")
        .arg(&config_path)
        .arg("info")
        .arg(&db_path)
        .assert()
        .failure()
        .code(1)
        .get_output()
        .stderr
        .clone();
    let stderr = String::from_utf8(output).expect("utf8");
    assert!(stderr.contains("failed to parse config file"), "{stderr}");
}

#[test]
fn verify_full_rebuilds_indexes() {
    let (_tmp, db_path) = setup_db("verify", true);
    let json = json_stdout(&["verify", "--level", "full"], &db_path);

    assert_eq!(json["success"], true);
    assert_eq!(json["level"], "full");
    assert_eq!(json["counts"]["tables"], 1);
    assert_eq!(json["counts"]["indexes"], 1);
    assert_eq!(json["counts"]["rows_read"], 12);
    assert_eq!(json["counts"]["indexes_built"], 1);
    assert!(json["findings"]
        .as_array()
        .expect("findings")
        .iter()
        .all(|finding| finding["severity"] != "error"));
}

#[test]
fn load_indexes_reports_ready() {
    let (_tmp, db_path) = setup_db("load", true);
    let json = json_stdout(&["load-indexes", "--timeout-ms", "30000"], &db_path);

    assert_eq!(json["indexes"], 1);
    assert_eq!(json["status"]["status"], "ready");
    assert!(json["duration_ms"].as_f64().expect("duration") >= 0.0);
}

#[test]
fn missing_database_fails() {
    let dir = TempDir::new().expect("tempdir");
    let missing = dir.path().join("absent.penumbra");
    let output = cargo_bin_cmd!("penumbra")
        .arg("info")
        .arg(&missing)
        .assert()
        .failure()
        .code(1)
        .get_output()
        .stderr
        .clone();
    let stderr = String::from_utf8(output).expect("utf8");
    assert!(stderr.contains("database not found"), "{stderr}");
    assert!(!missing.exists());
}
