#![forbid(unsafe_code)]

/// Incremental 32-bit checksum.
pub trait Checksum {
    /// Clears accumulated state.
    fn reset(&mut self);
    /// Feeds more bytes.
    fn update(&mut self, bytes: &[u8]);
    /// Returns the checksum of everything fed so far.
    fn finalize(&self) -> u32;
}

/// [`Checksum`] backed by `crc32fast`.
pub struct Crc32Fast {
    inner: crc32fast::Hasher,
}

impl Default for Crc32Fast {
    fn default() -> Self {
        Self {
            inner: crc32fast::Hasher::new(),
        }
    }
}

impl Checksum for Crc32Fast {
    fn reset(&mut self) {
        self.inner.reset();
    }

    fn update(&mut self, bytes: &[u8]) {
        self.inner.update(bytes);
    }

    fn finalize(&self) -> u32 {
        self.inner.clone().finalize()
    }
}

/// CRC of a page image bound to its target index and database id.
pub fn page_crc32(page_idx: u32, database_id: u64, payload: &[u8]) -> u32 {
    let mut hasher = crc32fast::Hasher::new();
    hasher.update(&page_idx.to_be_bytes());
    hasher.update(&database_id.to_be_bytes());
    hasher.update(payload);
    hasher.finalize()
}

/// CRC of a tagged serialized blob.
pub fn blob_crc32(tag: u32, payload: &[u8]) -> u32 {
    let mut hasher = crc32fast::Hasher::new();
    hasher.update(&tag.to_be_bytes());
    hasher.update(&(payload.len() as u32).to_be_bytes());
    hasher.update(payload);
    hasher.finalize()
}
