use std::fs;
use std::path::Path;

use serde::Serialize;

use crate::admin::options::AdminOpenOptions;
use crate::admin::util::open_database;
use crate::admin::Result;
use crate::db::{shadow_path, wal_path};
use crate::types::PageRange;

/// A page range in reports; `start` is `None` for the sentinel.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct RangeReport {
    /// First page.
    pub start: Option<u32>,
    /// Page count.
    pub num_pages: u32,
}

impl From<PageRange> for RangeReport {
    fn from(range: PageRange) -> Self {
        Self {
            start: range.is_valid().then_some(range.start.0),
            num_pages: if range.is_valid() { range.num_pages } else { 0 },
        }
    }
}

/// Header section of [`InfoReport`].
#[derive(Clone, Debug, Serialize)]
pub struct HeaderSection {
    /// Database id, hex encoded.
    pub database_id: String,
    /// Page size in bytes.
    pub page_size: u32,
    /// Catalog pages.
    pub catalog_range: RangeReport,
    /// Storage metadata and page manager pages.
    pub metadata_range: RangeReport,
    /// True when nothing was ever checkpointed.
    pub logically_empty: bool,
}

/// Allocator section of [`InfoReport`].
#[derive(Clone, Debug, Serialize)]
pub struct PagesSection {
    /// Pages tracked by the allocator.
    pub num_pages: u32,
    /// Reusable pages.
    pub free_pages: u64,
    /// Free ranges.
    pub free_ranges: Vec<RangeReport>,
}

/// Files section of [`InfoReport`].
#[derive(Clone, Debug, Serialize)]
pub struct FilesSection {
    /// Main file size in bytes.
    pub main_bytes: u64,
    /// WAL size in bytes.
    pub wal_bytes: u64,
    /// Shadow file size in bytes.
    pub shadow_bytes: u64,
}

/// One table in [`InfoReport`].
#[derive(Clone, Debug, Serialize)]
pub struct TableSection {
    /// Table id.
    pub id: u32,
    /// Table name.
    pub name: String,
    /// Column definitions as `name: type`.
    pub columns: Vec<String>,
    /// Committed rows, checkpointed or not.
    pub rows: u64,
    /// Rows persisted at the last checkpoint.
    pub persisted_rows: u64,
    /// Row pages.
    pub rows_range: RangeReport,
    /// Overflow store header page.
    pub overflow_header_page: Option<u32>,
    /// Overflow data pages.
    pub overflow_range: RangeReport,
}

/// One index in [`InfoReport`].
#[derive(Clone, Debug, Serialize)]
pub struct IndexSection {
    /// Index id.
    pub id: u32,
    /// Index name.
    pub name: String,
    /// Indexed table.
    pub table: String,
    /// Indexed column, metric and degree, or the decode error.
    pub definition: String,
}

/// Summary of a database file.
#[derive(Clone, Debug, Serialize)]
pub struct InfoReport {
    /// Header in effect.
    pub header: HeaderSection,
    /// Allocator state.
    pub pages: PagesSection,
    /// File sizes.
    pub files: FilesSection,
    /// Tables.
    pub tables: Vec<TableSection>,
    /// Indexes.
    pub indexes: Vec<IndexSection>,
}

/// Reports the header, allocator, files, tables and indexes of a database.
/// The database is opened read-only.
///
/// # Errors
///
/// Returns an error if the database cannot be opened.
pub fn info(path: impl AsRef<Path>, opts: &AdminOpenOptions) -> Result<InfoReport> {
    let path = path.as_ref();
    let db = open_database(path, &opts.clone().read_only(true))?;
    let layout = db.layout();
    let catalog = db.catalog();
    let header = layout.header;

    let mut tables = Vec::new();
    for (id, name, storage) in &layout.tables {
        let columns = catalog
            .table(*id)
            .map(|entry| {
                entry
                    .columns
                    .iter()
                    .map(|c| format!("{}: {}", c.name, c.ty))
                    .collect()
            })
            .unwrap_or_default();
        tables.push(TableSection {
            id: id.0,
            name: name.clone(),
            columns,
            rows: db.table_rows(name)?.len() as u64,
            persisted_rows: storage.num_rows,
            rows_range: storage.rows_range.into(),
            overflow_header_page: storage
                .overflow
                .header_page
                .is_valid()
                .then_some(storage.overflow.header_page.0),
            overflow_range: storage.overflow.data_range.into(),
        });
    }
    let indexes = catalog
        .indexes()
        .map(|entry| IndexSection {
            id: entry.id.0,
            name: entry.name.clone(),
            table: catalog
                .table(entry.table)
                .map(|t| t.name.clone())
                .unwrap_or_default(),
            definition: match entry.aux_info() {
                Ok(config) => format!(
                    "{} metric={} degree={}",
                    config.column, config.metric, config.degree
                ),
                Err(err) => format!("undecodable: {err}"),
            },
        })
        .collect();
    let file_len = |p: &Path| fs::metadata(p).map(|m| m.len()).unwrap_or(0);
    let report = InfoReport {
        header: HeaderSection {
            database_id: hex::encode(header.database_id.to_be_bytes()),
            page_size: header.page_size,
            catalog_range: header.catalog_page_range.into(),
            metadata_range: header.metadata_page_range.into(),
            logically_empty: header.is_logically_empty(),
        },
        pages: PagesSection {
            num_pages: layout.num_pages,
            free_pages: layout
                .free_ranges
                .iter()
                .map(|r| u64::from(r.num_pages))
                .sum(),
            free_ranges: layout.free_ranges.iter().map(|r| (*r).into()).collect(),
        },
        files: FilesSection {
            main_bytes: file_len(path),
            wal_bytes: file_len(&wal_path(path)),
            shadow_bytes: file_len(&shadow_path(path)),
        },
        tables,
        indexes,
    };
    db.close()?;
    Ok(report)
}
