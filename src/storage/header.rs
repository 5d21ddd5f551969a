use std::fmt;
use std::ops::Range;

use rand::{rngs::OsRng, RngCore};

use crate::primitives::io::FileIo;
use crate::storage::page_manager::PageManager;
use crate::types::{PageIdx, PageRange, PenumbraError, Result};

const HEADER_MAGIC: [u8; 4] = *b"PNMB";
const HEADER_FORMAT_VERSION: u16 = 1;

const H_MAGIC: Range<usize> = 0..4;
const H_FORMAT_VERSION: Range<usize> = 4..6;
const H_RESERVED: Range<usize> = 6..8;
const H_PAGE_SIZE: Range<usize> = 8..12;
const H_DATABASE_ID: Range<usize> = 12..20;
const H_CATALOG_START: Range<usize> = 20..24;
const H_CATALOG_PAGES: Range<usize> = 24..28;
const H_METADATA_START: Range<usize> = 28..32;
const H_METADATA_PAGES: Range<usize> = 32..36;
const H_CRC32: Range<usize> = 36..40;

/// Encoded size of a [`DatabaseHeader`]; the rest of page 0 is zero.
pub const DATABASE_HEADER_LEN: usize = 40;

/// Fixed-location record naming where the serialized catalog and storage
/// metadata live. Replaced wholesale by each checkpoint that changed anything.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct DatabaseHeader {
    /// Random id binding the WAL and shadow file to this database.
    pub database_id: u64,
    /// Page size the file was created with.
    pub page_size: u32,
    /// Pages holding the serialized catalog, or the sentinel.
    pub catalog_page_range: PageRange,
    /// Pages holding storage metadata and the page manager, or the sentinel.
    pub metadata_page_range: PageRange,
}

impl DatabaseHeader {
    /// Header of a freshly created, logically empty database.
    pub fn new_empty(page_size: u32, database_id: u64) -> Self {
        Self {
            database_id,
            page_size,
            catalog_page_range: PageRange::INVALID,
            metadata_page_range: PageRange::INVALID,
        }
    }

    /// Empty header with a random database id.
    pub fn generate(page_size: u32) -> Self {
        Self::new_empty(page_size, OsRng.next_u64())
    }

    /// True when no catalog has ever been checkpointed.
    pub fn is_logically_empty(&self) -> bool {
        !self.catalog_page_range.is_valid()
    }

    /// Points the catalog field at `range`, freeing the range it replaces.
    pub fn update_catalog_page_range(
        &mut self,
        page_manager: &mut PageManager,
        range: PageRange,
    ) -> Result<()> {
        page_manager.free(self.catalog_page_range)?;
        self.catalog_page_range = range;
        Ok(())
    }

    /// Frees the current metadata range and clears the field.
    pub fn free_metadata_page_range(&mut self, page_manager: &mut PageManager) -> Result<()> {
        page_manager.free(self.metadata_page_range)?;
        self.metadata_page_range = PageRange::INVALID;
        Ok(())
    }

    /// Encodes the header into its fixed layout.
    pub fn serialize(&self) -> [u8; DATABASE_HEADER_LEN] {
        let mut buf = [0u8; DATABASE_HEADER_LEN];
        buf[H_MAGIC].copy_from_slice(&HEADER_MAGIC);
        buf[H_FORMAT_VERSION].copy_from_slice(&HEADER_FORMAT_VERSION.to_be_bytes());
        buf[H_PAGE_SIZE].copy_from_slice(&self.page_size.to_be_bytes());
        buf[H_DATABASE_ID].copy_from_slice(&self.database_id.to_be_bytes());
        buf[H_CATALOG_START].copy_from_slice(&self.catalog_page_range.start.0.to_be_bytes());
        buf[H_CATALOG_PAGES].copy_from_slice(&self.catalog_page_range.num_pages.to_be_bytes());
        buf[H_METADATA_START].copy_from_slice(&self.metadata_page_range.start.0.to_be_bytes());
        buf[H_METADATA_PAGES].copy_from_slice(&self.metadata_page_range.num_pages.to_be_bytes());
        let crc = crc32fast::hash(&buf[..H_CRC32.start]);
        buf[H_CRC32].copy_from_slice(&crc.to_be_bytes());
        buf
    }

    /// Decodes and validates a header.
    pub fn deserialize(src: &[u8], verify_checksum: bool) -> Result<Self> {
        if src.len() < DATABASE_HEADER_LEN {
            return Err(PenumbraError::Corruption("database header truncated"));
        }
        if src[H_MAGIC] != HEADER_MAGIC {
            return Err(PenumbraError::Corruption("database header magic mismatch"));
        }
        if be_u16(&src[H_FORMAT_VERSION]) != HEADER_FORMAT_VERSION {
            return Err(PenumbraError::Corruption(
                "unsupported database header version",
            ));
        }
        if src[H_RESERVED] != [0, 0] {
            return Err(PenumbraError::Corruption(
                "database header reserved bytes non-zero",
            ));
        }
        if verify_checksum && crc32fast::hash(&src[..H_CRC32.start]) != be_u32(&src[H_CRC32]) {
            return Err(PenumbraError::Corruption("database header crc mismatch"));
        }
        let range = |start: Range<usize>, pages: Range<usize>| {
            PageRange::new(PageIdx(be_u32(&src[start])), be_u32(&src[pages]))
        };
        let mut id = [0u8; 8];
        id.copy_from_slice(&src[H_DATABASE_ID]);
        let header = Self {
            database_id: u64::from_be_bytes(id),
            page_size: be_u32(&src[H_PAGE_SIZE]),
            catalog_page_range: range(H_CATALOG_START, H_CATALOG_PAGES),
            metadata_page_range: range(H_METADATA_START, H_METADATA_PAGES),
        };
        if header.catalog_page_range.is_valid() != header.metadata_page_range.is_valid() {
            return Err(PenumbraError::Corruption(
                "database header has catalog without metadata",
            ));
        }
        Ok(header)
    }

    /// Reads the header at the start of `io`.
    pub fn read_from(io: &dyn FileIo, verify_checksum: bool) -> Result<Self> {
        let mut buf = [0u8; DATABASE_HEADER_LEN];
        io.read_at(0, &mut buf).map_err(|err| match err {
            PenumbraError::Io(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                PenumbraError::Corruption("database header truncated")
            }
            other => other,
        })?;
        Self::deserialize(&buf, verify_checksum)
    }

    /// Writes the header as a full page 0 and syncs. Only used when a file is
    /// created; later headers go through the shadow file.
    pub fn write_initial(&self, io: &dyn FileIo) -> Result<()> {
        let mut page = vec![0u8; self.page_size as usize];
        page[..DATABASE_HEADER_LEN].copy_from_slice(&self.serialize());
        io.write_at(0, &page)?;
        io.sync_all()
    }
}

impl fmt::Display for DatabaseHeader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "DatabaseHeader {{")?;
        writeln!(f, "  database_id: {:016x},", self.database_id)?;
        writeln!(f, "  page_size: {},", self.page_size)?;
        writeln!(f, "  catalog_page_range: {},", self.catalog_page_range)?;
        writeln!(f, "  metadata_page_range: {},", self.metadata_page_range)?;
        write!(f, "}}")
    }
}

fn be_u16(src: &[u8]) -> u16 {
    u16::from_be_bytes([src[0], src[1]])
}

fn be_u32(src: &[u8]) -> u32 {
    u32::from_be_bytes([src[0], src[1], src[2], src[3]])
}
