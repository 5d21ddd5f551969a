use std::path::Path;

use serde::Serialize;

use crate::admin::options::AdminOpenOptions;
use crate::admin::util::open_database;
use crate::admin::Result;
use crate::db::{Database, DatabaseLayout};
use crate::types::{page, PageRange};

const MAX_FINDINGS: usize = 32;

/// Specifies the depth of verification checks to perform.
#[derive(Clone, Copy, Debug, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum VerifyLevel {
    /// Header, allocator and storage info checks only.
    Fast,
    /// Also reads every row and rebuilds every similarity index.
    Full,
}

/// Indicates the severity level of a verification finding.
#[derive(Clone, Copy, Debug, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum VerifySeverity {
    /// Informational message about the verification process.
    Info,
    /// Non-critical issue that may indicate a problem.
    Warning,
    /// Critical issue indicating data corruption or integrity failure.
    Error,
}

/// Represents a single issue discovered during verification.
#[derive(Clone, Debug, Serialize)]
pub struct VerifyFinding {
    /// The severity level of this finding.
    pub severity: VerifySeverity,
    /// Human-readable description of the issue.
    pub message: String,
}

impl VerifyFinding {
    fn error(message: impl Into<String>) -> Self {
        Self {
            severity: VerifySeverity::Error,
            message: message.into(),
        }
    }

    fn warning(message: impl Into<String>) -> Self {
        Self {
            severity: VerifySeverity::Warning,
            message: message.into(),
        }
    }
}

/// Statistics collected during the verification process.
#[derive(Clone, Debug, Default, Serialize)]
pub struct VerifyCounts {
    /// Tables examined.
    pub tables: u64,
    /// Indexes examined.
    pub indexes: u64,
    /// Page ranges owned by some structure.
    pub owned_ranges: u64,
    /// Rows read back (full level only).
    pub rows_read: u64,
    /// Indexes rebuilt (full level only).
    pub indexes_built: u64,
}

/// Complete report of a verification operation.
#[derive(Clone, Debug, Serialize)]
pub struct VerifyReport {
    /// The verification level that was performed.
    pub level: VerifyLevel,
    /// Whether verification passed without finding any errors.
    pub success: bool,
    /// List of issues discovered during verification.
    pub findings: Vec<VerifyFinding>,
    /// Statistics about the data structures examined.
    pub counts: VerifyCounts,
}

/// Verifies the structural integrity of a database.
///
/// Opening the database already validates every framed section and
/// checksum; a failure there is returned as an error. The checks here cover
/// what a well-formed file can still get wrong:
///
/// - every owned range lies inside the allocator and off the free list;
/// - no two owned ranges overlap, and free ranges do not overlap each other;
/// - every table and overflow store obeys the sentinel pairing.
///
/// `VerifyLevel::Full` additionally reads every row and rebuilds every
/// similarity index. The database is opened read-only.
///
/// # Errors
///
/// Returns an error if the database cannot be opened.
pub fn verify(
    path: impl AsRef<Path>,
    opts: &AdminOpenOptions,
    level: VerifyLevel,
) -> Result<VerifyReport> {
    let db = open_database(path.as_ref(), &opts.clone().read_only(true))?;
    let layout = db.layout();
    let mut findings = Vec::new();
    let mut counts = VerifyCounts::default();

    let owned = owned_ranges(&layout, &mut findings, &mut counts);
    check_ranges(&layout, &owned, &mut findings);
    check_free_list(&layout, &mut findings);
    check_indexes(&db, &mut findings, &mut counts);
    if matches!(level, VerifyLevel::Full) {
        read_everything(&db, &layout, &mut findings, &mut counts);
    }
    db.close()?;

    let success = !findings
        .iter()
        .any(|f| matches!(f.severity, VerifySeverity::Error));
    Ok(VerifyReport {
        level,
        success,
        findings,
        counts,
    })
}

fn owned_ranges(
    layout: &DatabaseLayout,
    findings: &mut Vec<VerifyFinding>,
    counts: &mut VerifyCounts,
) -> Vec<(String, PageRange)> {
    let header = &layout.header;
    let mut owned = Vec::new();
    if header.catalog_page_range.is_valid() != header.metadata_page_range.is_valid() {
        push(
            findings,
            VerifyFinding::error("header has a catalog range without a metadata range"),
        );
    }
    owned.push(("header".to_string(), PageRange::new(page::DB_HEADER_PAGE_IDX, 1)));
    if header.catalog_page_range.is_valid() {
        owned.push(("catalog".to_string(), header.catalog_page_range));
    }
    if header.metadata_page_range.is_valid() {
        owned.push(("metadata".to_string(), header.metadata_page_range));
    }
    for (_, name, info) in &layout.tables {
        counts.tables += 1;
        if let Err(err) = info.check_pairing() {
            push(findings, VerifyFinding::error(format!("table {name}: {err}")));
        }
        if info.rows_range.is_valid() {
            owned.push((format!("table {name} rows"), info.rows_range));
        }
        if info.overflow.header_page.is_valid() {
            owned.push((
                format!("table {name} overflow header"),
                PageRange::new(info.overflow.header_page, 1),
            ));
        }
        if info.overflow.data_range.is_valid() && info.overflow.data_range.num_pages > 0 {
            owned.push((format!("table {name} overflow data"), info.overflow.data_range));
        }
    }
    counts.owned_ranges = owned.len() as u64;
    owned
}

fn check_ranges(
    layout: &DatabaseLayout,
    owned: &[(String, PageRange)],
    findings: &mut Vec<VerifyFinding>,
) {
    for (i, (name, range)) in owned.iter().enumerate() {
        if range.end() > layout.num_pages {
            push(
                findings,
                VerifyFinding::error(format!(
                    "{name} range {range} extends past the allocator's {} pages",
                    layout.num_pages
                )),
            );
        }
        if let Some(free) = layout.free_ranges.iter().find(|f| f.overlaps(range)) {
            push(
                findings,
                VerifyFinding::error(format!("{name} range {range} overlaps free range {free}")),
            );
        }
        if layout.pending_free.iter().any(|f| f.overlaps(range)) {
            push(
                findings,
                VerifyFinding::warning(format!(
                    "{name} range {range} was freed since the last checkpoint"
                )),
            );
        }
        for (other_name, other) in &owned[i + 1..] {
            if range.overlaps(other) {
                push(
                    findings,
                    VerifyFinding::error(format!(
                        "{name} range {range} overlaps {other_name} range {other}"
                    )),
                );
            }
        }
    }
}

fn check_free_list(layout: &DatabaseLayout, findings: &mut Vec<VerifyFinding>) {
    for (i, range) in layout.free_ranges.iter().enumerate() {
        if range.end() > layout.num_pages {
            push(
                findings,
                VerifyFinding::error(format!(
                    "free range {range} extends past the allocator's {} pages",
                    layout.num_pages
                )),
            );
        }
        if layout.free_ranges[i + 1..].iter().any(|other| other.overlaps(range)) {
            push(
                findings,
                VerifyFinding::error(format!("free range {range} overlaps another free range")),
            );
        }
    }
}

fn check_indexes(db: &Database, findings: &mut Vec<VerifyFinding>, counts: &mut VerifyCounts) {
    let catalog = db.catalog();
    for entry in catalog.indexes() {
        counts.indexes += 1;
        if catalog.table(entry.table).is_none() {
            push(
                findings,
                VerifyFinding::error(format!("index {} names a missing table", entry.name)),
            );
        }
        if let Err(err) = entry.aux_info() {
            push(
                findings,
                VerifyFinding::error(format!("index {}: {err}", entry.name)),
            );
        }
    }
}

fn read_everything(
    db: &Database,
    layout: &DatabaseLayout,
    findings: &mut Vec<VerifyFinding>,
    counts: &mut VerifyCounts,
) {
    for (_, name, _) in &layout.tables {
        match db.table_rows(name) {
            Ok(rows) => counts.rows_read += rows.len() as u64,
            Err(err) => push(findings, VerifyFinding::error(format!("table {name}: {err}"))),
        }
    }
    for entry in db.catalog().indexes() {
        match db.load_index(&entry.name) {
            Ok(_) => counts.indexes_built += 1,
            Err(err) => push(
                findings,
                VerifyFinding::error(format!("index {}: {err}", entry.name)),
            ),
        }
    }
}

fn push(findings: &mut Vec<VerifyFinding>, finding: VerifyFinding) {
    if findings.len() < MAX_FINDINGS {
        findings.push(finding);
    }
}
