use std::collections::BTreeMap;
use std::sync::Arc;

use tracing::{debug, warn};

use crate::primitives::io::FileIo;
use crate::types::{page_crc32, PageIdx, PenumbraError, Result};

const SHADOW_MAGIC: [u8; 4] = *b"PNMS";
const SHADOW_FORMAT_VERSION: u16 = 1;
const SHADOW_HEADER_LEN: usize = 32;
const RECORD_HEADER_LEN: usize = 8;

/// Staged copy-on-write images of main-file pages.
///
/// Pages are collected in memory, made durable in the shadow file by
/// [`ShadowFile::flush_all`], and only then copied over their targets by
/// [`ShadowFile::apply_shadow_pages`].
pub struct ShadowFile {
    io: Arc<dyn FileIo>,
    page_size: u32,
    database_id: u64,
    pages: BTreeMap<PageIdx, Vec<u8>>,
    flushed: bool,
}

impl ShadowFile {
    /// Wraps the shadow file's storage; nothing is read or written yet.
    pub fn new(io: Arc<dyn FileIo>, page_size: u32, database_id: u64) -> Self {
        Self {
            io,
            page_size,
            database_id,
            pages: BTreeMap::new(),
            flushed: false,
        }
    }

    /// Number of staged pages.
    pub fn num_pages(&self) -> usize {
        self.pages.len()
    }

    /// Returns true when nothing is staged.
    pub fn is_empty(&self) -> bool {
        self.pages.is_empty()
    }

    /// Returns true when `page_idx` has a staged image.
    pub fn contains(&self, page_idx: PageIdx) -> bool {
        self.pages.contains_key(&page_idx)
    }

    /// Staged page indices in apply order.
    pub fn staged_pages(&self) -> Vec<PageIdx> {
        self.pages.keys().copied().collect()
    }

    /// Returns the writable shadow image of `page_idx`, creating it on first
    /// use. Unless `skip_reading_original`, a new image starts as a copy of the
    /// current main-file page (zeros past the end of the file).
    pub fn create_or_get_shadow_page(
        &mut self,
        page_idx: PageIdx,
        skip_reading_original: bool,
        main: &dyn FileIo,
    ) -> Result<&mut [u8]> {
        if !page_idx.is_valid() {
            return Err(PenumbraError::Invalid("shadow page for invalid page index"));
        }
        self.flushed = false;
        if !self.pages.contains_key(&page_idx) {
            let mut image = vec![0u8; self.page_size as usize];
            if !skip_reading_original {
                let off = page_idx.byte_offset(self.page_size);
                if off + u64::from(self.page_size) <= main.len()? {
                    main.read_at(off, &mut image)?;
                }
            }
            self.pages.insert(page_idx, image);
        }
        self.pages
            .get_mut(&page_idx)
            .map(|image| image.as_mut_slice())
            .ok_or(PenumbraError::NotFound)
    }

    /// Replaces the full image of `page_idx`; `data` shorter than a page is
    /// zero padded.
    pub fn write_page(&mut self, page_idx: PageIdx, data: &[u8], main: &dyn FileIo) -> Result<()> {
        if data.len() > self.page_size as usize {
            return Err(PenumbraError::Invalid("shadow page data larger than a page"));
        }
        let image = self.create_or_get_shadow_page(page_idx, true, main)?;
        image[..data.len()].copy_from_slice(data);
        image[data.len()..].fill(0);
        Ok(())
    }

    /// Durably writes every staged page to the shadow file.
    pub fn flush_all(&mut self) -> Result<()> {
        let record_len = RECORD_HEADER_LEN + self.page_size as usize;
        let mut buf = Vec::with_capacity(SHADOW_HEADER_LEN + self.pages.len() * record_len);
        buf.extend_from_slice(&self.encode_header(self.pages.len() as u32));
        for (page_idx, image) in &self.pages {
            buf.extend_from_slice(&page_idx.0.to_be_bytes());
            buf.extend_from_slice(&page_crc32(page_idx.0, self.database_id, image).to_be_bytes());
            buf.extend_from_slice(image);
        }
        self.io.write_at(0, &buf)?;
        self.io.truncate(buf.len() as u64)?;
        self.io.sync_all()?;
        self.flushed = true;
        debug!(pages = self.pages.len(), bytes = buf.len(), "shadow.flush_all");
        Ok(())
    }

    /// Copies every staged page over its target in `main`, then syncs `main`.
    /// Returns the overwritten page indices.
    pub fn apply_shadow_pages(&self, main: &dyn FileIo) -> Result<Vec<PageIdx>> {
        if !self.flushed {
            return Err(PenumbraError::Invalid(
                "shadow pages must be flushed before they are applied",
            ));
        }
        for (page_idx, image) in &self.pages {
            main.write_at(page_idx.byte_offset(self.page_size), image)?;
        }
        main.sync_all()?;
        Ok(self.staged_pages())
    }

    /// Discards staged pages and empties the shadow file.
    pub fn clear(&mut self) -> Result<()> {
        self.reset();
        if self.io.len()? > 0 {
            self.io.truncate(0)?;
            self.io.sync_all()?;
        }
        Ok(())
    }

    /// Discards staged pages without touching the file.
    pub fn reset(&mut self) {
        self.pages.clear();
        self.flushed = false;
    }

    /// Returns true when the backing file holds anything.
    pub fn has_durable_content(&self) -> Result<bool> {
        Ok(self.io.len()? > 0)
    }

    /// Loads a previously flushed shadow file back into memory for redo.
    ///
    /// Every record must validate; a torn shadow file cannot be redone.
    pub fn load_flushed(&mut self) -> Result<usize> {
        let len = self.io.len()? as usize;
        if len < SHADOW_HEADER_LEN {
            return Err(PenumbraError::Corruption("shadow file header truncated"));
        }
        let mut header = [0u8; SHADOW_HEADER_LEN];
        self.io.read_at(0, &mut header)?;
        let count = self.decode_header(&header)? as usize;
        let record_len = RECORD_HEADER_LEN + self.page_size as usize;
        if len != SHADOW_HEADER_LEN + count * record_len {
            return Err(PenumbraError::Corruption("shadow file length mismatch"));
        }
        let mut pages = BTreeMap::new();
        let mut record = vec![0u8; record_len];
        for i in 0..count {
            let off = (SHADOW_HEADER_LEN + i * record_len) as u64;
            self.io.read_at(off, &mut record)?;
            let page_idx = PageIdx(u32::from_be_bytes([record[0], record[1], record[2], record[3]]));
            let crc = u32::from_be_bytes([record[4], record[5], record[6], record[7]]);
            let image = record[RECORD_HEADER_LEN..].to_vec();
            if !page_idx.is_valid() || page_crc32(page_idx.0, self.database_id, &image) != crc {
                warn!(record = i, page = page_idx.0, "shadow.load.bad_record");
                return Err(PenumbraError::Corruption("shadow page checksum mismatch"));
            }
            pages.insert(page_idx, image);
        }
        self.pages = pages;
        self.flushed = true;
        Ok(count)
    }

    fn encode_header(&self, count: u32) -> [u8; SHADOW_HEADER_LEN] {
        let mut buf = [0u8; SHADOW_HEADER_LEN];
        buf[0..4].copy_from_slice(&SHADOW_MAGIC);
        buf[4..6].copy_from_slice(&SHADOW_FORMAT_VERSION.to_be_bytes());
        buf[8..12].copy_from_slice(&self.page_size.to_be_bytes());
        buf[12..20].copy_from_slice(&self.database_id.to_be_bytes());
        buf[20..24].copy_from_slice(&count.to_be_bytes());
        let crc = crc32fast::hash(&buf[..28]);
        buf[28..32].copy_from_slice(&crc.to_be_bytes());
        buf
    }

    fn decode_header(&self, buf: &[u8; SHADOW_HEADER_LEN]) -> Result<u32> {
        if buf[0..4] != SHADOW_MAGIC {
            return Err(PenumbraError::Corruption("shadow file magic mismatch"));
        }
        if u16::from_be_bytes([buf[4], buf[5]]) != SHADOW_FORMAT_VERSION {
            return Err(PenumbraError::Corruption("shadow file version mismatch"));
        }
        let crc = u32::from_be_bytes([buf[28], buf[29], buf[30], buf[31]]);
        if crc32fast::hash(&buf[..28]) != crc {
            return Err(PenumbraError::Corruption("shadow file header crc mismatch"));
        }
        if u32::from_be_bytes([buf[8], buf[9], buf[10], buf[11]]) != self.page_size {
            return Err(PenumbraError::Corruption("shadow file page size mismatch"));
        }
        let mut id = [0u8; 8];
        id.copy_from_slice(&buf[12..20]);
        if u64::from_be_bytes(id) != self.database_id {
            return Err(PenumbraError::Corruption(
                "shadow file belongs to a different database",
            ));
        }
        Ok(u32::from_be_bytes([buf[20], buf[21], buf[22], buf[23]]))
    }
}
