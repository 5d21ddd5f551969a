#![forbid(unsafe_code)]

//! Shared identifiers, page constants and the core error type.

use std::fmt;

mod checksum;

pub use checksum::{blob_crc32, page_crc32, Checksum, Crc32Fast};

/// Index of a fixed-size page in the main database file.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug)]
pub struct PageIdx(pub u32);

impl PageIdx {
    /// Canonical "absent/unallocated" page index.
    pub const INVALID: PageIdx = PageIdx(u32::MAX);

    /// Returns true unless this is the [`PageIdx::INVALID`] sentinel.
    pub const fn is_valid(self) -> bool {
        self.0 != u32::MAX
    }

    /// Byte offset of this page for the given page size.
    pub fn byte_offset(self, page_size: u32) -> u64 {
        u64::from(self.0) * u64::from(page_size)
    }
}

/// Shorthand for [`PageIdx::INVALID`].
pub const INVALID_PAGE_IDX: PageIdx = PageIdx::INVALID;

impl fmt::Display for PageIdx {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_valid() {
            write!(f, "{}", self.0)
        } else {
            f.write_str("invalid")
        }
    }
}

/// A contiguous span of pages: `{start, num_pages}`.
#[derive(Copy, Clone, Eq, PartialEq, Hash, Debug)]
pub struct PageRange {
    /// First page of the range, or [`INVALID_PAGE_IDX`] when absent.
    pub start: PageIdx,
    /// Number of pages covered.
    pub num_pages: u32,
}

impl PageRange {
    /// The absent range.
    pub const INVALID: PageRange = PageRange {
        start: PageIdx::INVALID,
        num_pages: 0,
    };

    /// Creates a range starting at `start` covering `num_pages` pages.
    pub const fn new(start: PageIdx, num_pages: u32) -> Self {
        Self { start, num_pages }
    }

    /// Returns true when the range names allocated pages.
    pub const fn is_valid(&self) -> bool {
        self.start.is_valid()
    }

    /// One past the last page of the range.
    pub fn end(&self) -> u32 {
        self.start.0.saturating_add(self.num_pages)
    }

    /// Returns true when both ranges are valid and share at least one page.
    pub fn overlaps(&self, other: &PageRange) -> bool {
        self.is_valid()
            && other.is_valid()
            && self.num_pages > 0
            && other.num_pages > 0
            && self.start.0 < other.end()
            && other.start.0 < self.end()
    }

    /// Iterates the page indices covered by the range.
    pub fn iter_pages(&self) -> impl Iterator<Item = PageIdx> + '_ {
        let start = if self.is_valid() { self.start.0 } else { 0 };
        let len = if self.is_valid() { self.num_pages } else { 0 };
        (0..len).map(move |off| PageIdx(start + off))
    }
}

impl Default for PageRange {
    fn default() -> Self {
        PageRange::INVALID
    }
}

impl fmt::Display for PageRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_valid() {
            write!(f, "[{}, +{})", self.start.0, self.num_pages)
        } else {
            f.write_str("(none)")
        }
    }
}

/// Stable arena id of a table catalog entry.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug)]
pub struct TableId(pub u32);

/// Stable arena id of an index catalog entry.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug)]
pub struct IndexId(pub u32);

/// Transaction identifier.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug)]
pub struct TxnId(pub u64);

impl fmt::Display for TableId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for IndexId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for TxnId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Points inside the checkpoint protocol where a test can force a stop.
#[doc(hidden)]
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum FailPoint {
    /// Before the shadow file is flushed.
    BeforeShadowFlush,
    /// After the shadow flush, before the WAL marker is logged.
    AfterShadowFlush,
    /// After the WAL marker is durable, before any shadow page is applied.
    AfterWalMarker,
    /// After shadow pages are applied, before WAL and shadow are cleared.
    AfterApply,
}

impl FailPoint {
    /// Returns true when a stop here leaves the WAL checkpoint marker durable.
    pub fn past_wal_marker(self) -> bool {
        matches!(self, FailPoint::AfterWalMarker | FailPoint::AfterApply)
    }
}

/// Core error type.
#[derive(thiserror::Error, Debug)]
pub enum PenumbraError {
    /// Underlying file system failure.
    #[error("IO: {0}")]
    Io(#[from] std::io::Error),
    /// On-disk structure failed validation.
    #[error("corruption: {0}")]
    Corruption(&'static str),
    /// On-disk structure failed validation (owned message).
    #[error("corruption: {0}")]
    CorruptionOwned(String),
    /// A serialized blob could not be encoded or decoded.
    #[error("serialization: {0}")]
    Serialization(String),
    /// Invalid caller input.
    #[error("invalid argument: {0}")]
    Invalid(&'static str),
    /// Invalid caller input (owned message).
    #[error("invalid argument: {0}")]
    InvalidOwned(String),
    /// Lookup missed.
    #[error("not found")]
    NotFound,
    /// A write was attempted on a read-only database.
    #[error("database is opened read-only")]
    ReadOnly,
    /// The database has been closed or is closing.
    #[error("database is closed")]
    Closed,
    /// A checkpoint was interrupted after its WAL marker became durable; the
    /// database must be reopened so recovery can redo it.
    #[error("database requires recovery; reopen it to redo the interrupted checkpoint")]
    RecoveryRequired,
    /// A fail point stopped the operation.
    #[doc(hidden)]
    #[error("injected failure at {0:?}")]
    Injected(FailPoint),
}

/// Result alias for core operations.
pub type Result<T> = std::result::Result<T, PenumbraError>;

impl PenumbraError {
    /// Returns true when the failure stems from the file system.
    pub fn is_io(&self) -> bool {
        matches!(self, PenumbraError::Io(_))
    }
}

pub mod page {
    //! Page size limits and fixed page indices.

    use super::PageIdx;

    /// Default page size in bytes.
    pub const DEFAULT_PAGE_SIZE: u32 = 4096;
    /// Smallest accepted page size.
    pub const MIN_PAGE_SIZE: u32 = 1024;
    /// Largest accepted page size.
    pub const MAX_PAGE_SIZE: u32 = 65536;
    /// Page holding the database header.
    pub const DB_HEADER_PAGE_IDX: PageIdx = PageIdx(0);

    /// Returns true for a power of two inside the accepted bounds.
    pub fn is_valid_page_size(page_size: u32) -> bool {
        page_size.is_power_of_two() && (MIN_PAGE_SIZE..=MAX_PAGE_SIZE).contains(&page_size)
    }

    /// Pages needed to hold `bytes` bytes; zero bytes need zero pages.
    pub fn pages_for(bytes: usize, page_size: u32) -> u32 {
        let ps = page_size as usize;
        bytes.div_ceil(ps) as u32
    }
}
