use std::path::Path;
use std::time::Instant;

use serde::Serialize;

use crate::admin::info::RangeReport;
use crate::admin::options::AdminOpenOptions;
use crate::admin::util::open_database;
use crate::admin::Result;
use crate::storage::{CheckpointOutcome, SkipReason};

/// Report generated after executing a checkpoint operation.
#[derive(Debug, Clone, Serialize)]
pub struct CheckpointReport {
    /// "completed", "no_changes" or "in_memory".
    pub outcome: String,
    /// Duration of the checkpoint operation in milliseconds.
    pub duration_ms: f64,
    /// Whether the catalog was rewritten.
    pub catalog_written: bool,
    /// Whether storage metadata and the page manager were rewritten.
    pub metadata_written: bool,
    /// Whether any table wrote pages.
    pub storage_written: bool,
    /// Shadow pages applied to the main file.
    pub pages_applied: usize,
    /// Pages released for reuse.
    pub pages_freed: usize,
    /// Catalog range after the checkpoint.
    pub catalog_range: RangeReport,
    /// Metadata range after the checkpoint.
    pub metadata_range: RangeReport,
    /// WAL size before the checkpoint.
    pub wal_bytes_before: u64,
    /// WAL size after the checkpoint.
    pub wal_bytes_after: u64,
}

/// Executes a checkpoint operation on a database.
///
/// Opening the database already replays its WAL; the explicit checkpoint
/// then writes whatever is still dirty.
///
/// # Errors
///
/// Returns an error if the database cannot be opened or the checkpoint fails.
pub fn checkpoint(path: impl AsRef<Path>, opts: &AdminOpenOptions) -> Result<CheckpointReport> {
    let path = path.as_ref();
    let db = open_database(path, opts)?;
    let wal_bytes_before = db.wal_size()?;
    let start = Instant::now();
    let outcome = db.checkpoint()?;
    let elapsed = start.elapsed();
    let header = db.header();
    let wal_bytes_after = db.wal_size()?;
    db.close()?;
    let mut report = CheckpointReport {
        outcome: outcome_string(&outcome).to_string(),
        duration_ms: elapsed.as_secs_f64() * 1_000.0,
        catalog_written: false,
        metadata_written: false,
        storage_written: false,
        pages_applied: 0,
        pages_freed: 0,
        catalog_range: header.catalog_page_range.into(),
        metadata_range: header.metadata_page_range.into(),
        wal_bytes_before,
        wal_bytes_after,
    };
    if let CheckpointOutcome::Completed(summary) = outcome {
        report.catalog_written = summary.catalog_written;
        report.metadata_written = summary.metadata_written;
        report.storage_written = summary.storage_written;
        report.pages_applied = summary.pages_applied;
        report.pages_freed = summary.pages_freed;
    }
    Ok(report)
}

fn outcome_string(outcome: &CheckpointOutcome) -> &'static str {
    match outcome {
        CheckpointOutcome::Completed(_) => "completed",
        CheckpointOutcome::Skipped(SkipReason::NoChanges) => "no_changes",
        CheckpointOutcome::Skipped(SkipReason::InMemory) => "in_memory",
    }
}
