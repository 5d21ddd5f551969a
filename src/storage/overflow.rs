use tracing::debug;

use crate::primitives::bytes::{tag, ByteReader, ByteWriter};
use crate::primitives::io::FileIo;
use crate::storage::buffer::BufferManager;
use crate::storage::file_writer::{BufferedFileReader, InMemFileWriter};
use crate::storage::page_manager::PageManager;
use crate::storage::shadow::ShadowFile;
use crate::types::{blob_crc32, page, PageIdx, PageRange, PenumbraError, Result};

const OVERFLOW_HEADER_TAG: u32 = tag(*b"OVFH");

/// Where an overflow store keeps its content. Both fields are valid or both
/// are the sentinel.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct OverflowStorageInfo {
    /// Page holding the store's header
    pub header_page: PageIdx,
    /// Pages holding spilled bytes
    pub data_range: PageRange,
}

impl Default for OverflowStorageInfo {
    fn default() -> Self {
        Self::ABSENT
    }
}

impl OverflowStorageInfo {
    /// Info of a store that never received data.
    pub const ABSENT: OverflowStorageInfo = OverflowStorageInfo {
        header_page: PageIdx::INVALID,
        data_range: PageRange::INVALID,
    };

    /// True when no page was ever allocated for the store.
    pub fn is_absent(&self) -> bool {
        !self.header_page.is_valid()
    }

    /// Checks that the header page and data range agree on presence.
    pub fn check_pairing(&self) -> Result<()> {
        if self.header_page.is_valid() != self.data_range.is_valid() {
            return Err(PenumbraError::Corruption(
                "overflow header page and data range disagree on presence",
            ));
        }
        Ok(())
    }

    pub(crate) fn encode(&self, out: &mut ByteWriter) {
        out.put_page_idx(self.header_page);
        out.put_page_range(&self.data_range);
    }

    pub(crate) fn decode(r: &mut ByteReader<'_>) -> Result<Self> {
        let info = Self {
            header_page: r.get_page_idx()?,
            data_range: r.get_page_range()?,
        };
        info.check_pairing()?;
        Ok(info)
    }
}

/// Location of a spilled string inside an overflow store.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct OverflowRef {
    /// Byte offset into the store
    pub offset: u64,
    /// Length in bytes
    pub len: u32,
}

/// Append-only spill area for strings longer than the inline limit.
///
/// The change flag is raised only by [`OverflowStore::spill`]; a store that
/// never spilled takes no part in checkpoints and owns no pages.
#[derive(Clone, Debug, Default)]
pub struct OverflowStore {
    data: Vec<u8>,
    info: OverflowStorageInfo,
    changed: bool,
}

impl OverflowStore {
    /// Empty store that owns no pages.
    pub fn new() -> Self {
        Self {
            data: Vec::new(),
            info: OverflowStorageInfo::ABSENT,
            changed: false,
        }
    }

    /// Current on-disk location.
    pub fn info(&self) -> OverflowStorageInfo {
        self.info
    }

    /// True when content arrived since the last checkpoint.
    pub fn has_changes(&self) -> bool {
        self.changed
    }

    /// Spilled bytes held by the store.
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// Returns true when nothing was ever spilled.
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Appends `value` and returns where it landed.
    pub fn spill(&mut self, value: &str) -> Result<OverflowRef> {
        let len = u32::try_from(value.len())
            .map_err(|_| PenumbraError::Invalid("string too large for overflow store"))?;
        let offset = self.data.len() as u64;
        self.data.extend_from_slice(value.as_bytes());
        self.changed = true;
        Ok(OverflowRef { offset, len })
    }

    /// Reads a spilled string back.
    pub fn read(&self, r: OverflowRef) -> Result<String> {
        let start = usize::try_from(r.offset)
            .map_err(|_| PenumbraError::Corruption("overflow offset out of range"))?;
        let end = start
            .checked_add(r.len as usize)
            .filter(|end| *end <= self.data.len())
            .ok_or(PenumbraError::Corruption("overflow reference past end of store"))?;
        String::from_utf8(self.data[start..end].to_vec())
            .map_err(|_| PenumbraError::Corruption("overflow string is not utf-8"))
    }

    /// Writes the store if it changed. Returns whether anything was written.
    ///
    /// The header page is allocated the first time content is checkpointed
    /// and kept afterwards; the data range is replaced on every write.
    pub fn checkpoint(
        &mut self,
        page_manager: &mut PageManager,
        shadow: &mut ShadowFile,
        main: &dyn FileIo,
        page_size: u32,
    ) -> Result<bool> {
        if !self.changed {
            return Ok(false);
        }
        let mut info = self.info;
        if !info.header_page.is_valid() {
            info.header_page = page_manager.allocate_range(1)?.start;
        }
        page_manager.free(info.data_range)?;
        let mut data = InMemFileWriter::new(page_size);
        data.writer().put_raw(&self.data);
        info.data_range = data.flush(page_manager, shadow, main)?;

        let mut body = ByteWriter::new();
        body.put_u64(self.data.len() as u64);
        body.put_page_range(&info.data_range);
        body.put_u32(blob_crc32(OVERFLOW_HEADER_TAG, &self.data));
        let mut header = ByteWriter::new();
        header.put_section(OVERFLOW_HEADER_TAG, body.as_slice());
        shadow.write_page(info.header_page, header.as_slice(), main)?;

        debug!(
            header_page = info.header_page.0,
            data_pages = info.data_range.num_pages,
            bytes = self.data.len(),
            "overflow.checkpoint"
        );
        self.info = info;
        self.changed = false;
        Ok(true)
    }

    /// Loads a store persisted at `info`.
    pub fn load(
        info: OverflowStorageInfo,
        main: &dyn FileIo,
        buffer: &BufferManager,
        verify_checksums: bool,
    ) -> Result<Self> {
        info.check_pairing()?;
        if info.is_absent() {
            return Ok(Self::new());
        }
        let mut reader = BufferedFileReader::new(main, buffer);
        reader.reset_read_offset(info.header_page.byte_offset(buffer.page_size()));
        let section = reader.read_section()?;
        let mut r = ByteReader::new(&section);
        let body = r.get_section(OVERFLOW_HEADER_TAG, verify_checksums)?;
        let mut r = ByteReader::new(body);
        let len = r.get_u64()?;
        let range = r.get_page_range()?;
        let crc = r.get_u32()?;
        r.expect_end()?;
        if range != info.data_range {
            return Err(PenumbraError::Corruption(
                "overflow header disagrees with storage metadata",
            ));
        }
        let capacity = u64::from(range.num_pages) * u64::from(buffer.page_size());
        if len > capacity || page::pages_for(len as usize, buffer.page_size()) > range.num_pages {
            return Err(PenumbraError::Corruption("overflow length exceeds its pages"));
        }
        let mut data = vec![0u8; len as usize];
        reader.seek_to_range(range)?;
        reader.read_exact(&mut data)?;
        if verify_checksums && blob_crc32(OVERFLOW_HEADER_TAG, &data) != crc {
            return Err(PenumbraError::Corruption("overflow data checksum mismatch"));
        }
        Ok(Self {
            data,
            info,
            changed: false,
        })
    }

    /// Releases every page the store owns.
    pub fn free_pages(&mut self, page_manager: &mut PageManager) -> Result<()> {
        if self.info.header_page.is_valid() {
            page_manager.free(PageRange::new(self.info.header_page, 1))?;
        }
        page_manager.free(self.info.data_range)?;
        self.info = OverflowStorageInfo::ABSENT;
        Ok(())
    }

    pub(crate) fn restore(&mut self, info: OverflowStorageInfo, changed: bool) {
        self.info = info;
        self.changed = changed;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::primitives::io::MemFileIo;
    use std::sync::Arc;

    const PS: u32 = 1024;

    fn fixture() -> (MemFileIo, ShadowFile, PageManager) {
        let main = MemFileIo::new();
        main.write_at(0, &vec![0u8; PS as usize]).unwrap();
        (main, ShadowFile::new(Arc::new(MemFileIo::new()), PS, 7), PageManager::new())
    }

    #[test]
    fn untouched_store_allocates_nothing() -> Result<()> {
        let (main, mut shadow, mut pm) = fixture();
        let mut store = OverflowStore::new();
        assert!(!store.checkpoint(&mut pm, &mut shadow, &main, PS)?);
        assert!(store.info().is_absent());
        assert_eq!(pm.num_pages(), 1);
        assert!(shadow.is_empty());
        Ok(())
    }

    #[test]
    fn spilled_data_survives_checkpoint_and_load() -> Result<()> {
        let (main, mut shadow, mut pm) = fixture();
        let mut store = OverflowStore::new();
        let long = "x".repeat(1500);
        let r = store.spill(&long)?;
        assert!(store.checkpoint(&mut pm, &mut shadow, &main, PS)?);
        assert!(!store.has_changes());
        let info = store.info();
        assert!(info.header_page.is_valid() && info.data_range.is_valid());
        shadow.flush_all()?;
        shadow.apply_shadow_pages(&main)?;

        let buffer = BufferManager::new(16, PS);
        let loaded = OverflowStore::load(info, &main, &buffer, true)?;
        assert_eq!(loaded.read(r)?, long);
        Ok(())
    }

    #[test]
    fn rewrite_keeps_header_and_frees_old_data() -> Result<()> {
        let (main, mut shadow, mut pm) = fixture();
        let mut store = OverflowStore::new();
        store.spill(&"a".repeat(100))?;
        store.checkpoint(&mut pm, &mut shadow, &main, PS)?;
        let first = store.info();
        store.spill(&"b".repeat(100))?;
        store.checkpoint(&mut pm, &mut shadow, &main, PS)?;
        let second = store.info();
        assert_eq!(first.header_page, second.header_page);
        assert_ne!(first.data_range, second.data_range);
        assert_eq!(pm.uncheckpointed_free(), &[first.data_range]);
        Ok(())
    }

    #[test]
    fn mismatched_pairing_is_corruption() {
        let info = OverflowStorageInfo {
            header_page: PageIdx(3),
            data_range: PageRange::INVALID,
        };
        assert!(matches!(
            info.check_pairing(),
            Err(PenumbraError::Corruption(_))
        ));
    }
}
