use crate::primitives::bytes::{decode_section_header, ByteWriter, SECTION_HEADER_LEN};
use crate::primitives::io::FileIo;
use crate::storage::buffer::BufferManager;
use crate::storage::page_manager::PageManager;
use crate::storage::shadow::ShadowFile;
use crate::types::{page, PageIdx, PageRange, PenumbraError, Result};

/// Accumulates a serialized blob in memory and writes it into page-aligned
/// ranges through the shadow file.
pub struct InMemFileWriter {
    page_size: u32,
    buf: ByteWriter,
}

impl InMemFileWriter {
    /// Empty writer for pages of `page_size` bytes.
    pub fn new(page_size: u32) -> Self {
        Self {
            page_size,
            buf: ByteWriter::new(),
        }
    }

    /// Encoder the blob is built with.
    pub fn writer(&mut self) -> &mut ByteWriter {
        &mut self.buf
    }

    /// Bytes written so far.
    pub fn len(&self) -> usize {
        self.buf.len()
    }

    /// Returns true when nothing was written.
    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    /// Pages a flush of the current content occupies.
    pub fn num_pages_to_flush(&self) -> u32 {
        page::pages_for(self.buf.len(), self.page_size)
    }

    /// Allocates a fresh range sized to the content and writes into it.
    pub fn flush(
        &self,
        page_manager: &mut PageManager,
        shadow: &mut ShadowFile,
        main: &dyn FileIo,
    ) -> Result<PageRange> {
        let range = page_manager.allocate_range(self.num_pages_to_flush())?;
        self.flush_into(range, shadow, main)?;
        Ok(range)
    }

    /// Writes the content into the preallocated `range`. Pages of the range
    /// past the content are zero filled; content larger than the range is
    /// an error.
    pub fn flush_into(&self, range: PageRange, shadow: &mut ShadowFile, main: &dyn FileIo) -> Result<()> {
        if self.buf.is_empty() {
            return Ok(());
        }
        if !range.is_valid() {
            return Err(PenumbraError::Invalid("flush into invalid page range"));
        }
        let capacity = u64::from(range.num_pages) * u64::from(self.page_size);
        if self.buf.len() as u64 > capacity {
            return Err(PenumbraError::InvalidOwned(format!(
                "serialized blob of {} bytes does not fit {} preallocated pages",
                self.buf.len(),
                range.num_pages
            )));
        }
        let mut chunks = self.buf.as_slice().chunks(self.page_size as usize);
        for page_idx in range.iter_pages() {
            let chunk = chunks.next().unwrap_or(&[]);
            shadow.write_page(page_idx, chunk, main)?;
        }
        Ok(())
    }
}

/// Sequential reader over main-file pages served by the buffer manager.
pub struct BufferedFileReader<'a> {
    io: &'a dyn FileIo,
    buffer: &'a BufferManager,
    offset: u64,
}

impl<'a> BufferedFileReader<'a> {
    /// Reader positioned at the start of the file.
    pub fn new(io: &'a dyn FileIo, buffer: &'a BufferManager) -> Self {
        Self {
            io,
            buffer,
            offset: 0,
        }
    }

    /// Moves the read cursor to `offset`.
    pub fn reset_read_offset(&mut self, offset: u64) {
        self.offset = offset;
    }

    /// Moves the read cursor to the first byte of `range`.
    pub fn seek_to_range(&mut self, range: PageRange) -> Result<()> {
        if !range.is_valid() {
            return Err(PenumbraError::Corruption("read of invalid page range"));
        }
        self.offset = range.start.byte_offset(self.buffer.page_size());
        Ok(())
    }

    /// Current cursor position.
    pub fn offset(&self) -> u64 {
        self.offset
    }

    /// Fills `dst`, crossing page boundaries as needed.
    pub fn read_exact(&mut self, dst: &mut [u8]) -> Result<()> {
        let ps = u64::from(self.buffer.page_size());
        let mut filled = 0;
        while filled < dst.len() {
            let page_no = self.offset / ps;
            if page_no >= u64::from(PageIdx::INVALID.0) {
                return Err(PenumbraError::Corruption("read beyond addressable pages"));
            }
            let frame = self.buffer.read_page(self.io, PageIdx(page_no as u32))?;
            let in_page = (self.offset % ps) as usize;
            let n = (frame.len() - in_page).min(dst.len() - filled);
            dst[filled..filled + n].copy_from_slice(&frame[in_page..in_page + n]);
            filled += n;
            self.offset += n as u64;
        }
        Ok(())
    }

    /// Reads one framed section, header included, so the caller can decode
    /// and verify it with a `ByteReader`.
    pub fn read_section(&mut self) -> Result<Vec<u8>> {
        let mut header = [0u8; SECTION_HEADER_LEN];
        self.read_exact(&mut header)?;
        let (_, len, _) = decode_section_header(&header)?;
        let file_len = self.io.len()?;
        if self.offset.saturating_add(u64::from(len)) > file_len {
            return Err(PenumbraError::Corruption("section extends past end of file"));
        }
        let mut out = Vec::with_capacity(SECTION_HEADER_LEN + len as usize);
        out.extend_from_slice(&header);
        out.resize(SECTION_HEADER_LEN + len as usize, 0);
        self.read_exact(&mut out[SECTION_HEADER_LEN..])?;
        Ok(out)
    }
}
