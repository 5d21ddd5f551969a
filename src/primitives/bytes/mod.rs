#![forbid(unsafe_code)]
//! Big-endian encoders, cursor decoders and checksummed blob sections.

use crate::types::{blob_crc32, PageIdx, PageRange, PenumbraError, Result};

/// Length of a section frame header: tag, length, crc32.
pub const SECTION_HEADER_LEN: usize = 12;

/// Growable big-endian encoder.
#[derive(Default, Debug, Clone)]
pub struct ByteWriter {
    buf: Vec<u8>,
}

impl ByteWriter {
    /// Creates an empty writer.
    pub fn new() -> Self {
        Self::default()
    }

    /// Bytes written so far.
    pub fn len(&self) -> usize {
        self.buf.len()
    }

    /// Returns true when nothing has been written.
    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    /// Borrows the encoded bytes.
    pub fn as_slice(&self) -> &[u8] {
        &self.buf
    }

    /// Consumes the writer.
    pub fn into_inner(self) -> Vec<u8> {
        self.buf
    }

    pub fn put_u8(&mut self, v: u8) {
        self.buf.push(v);
    }

    pub fn put_bool(&mut self, v: bool) {
        self.buf.push(u8::from(v));
    }

    pub fn put_u16(&mut self, v: u16) {
        self.buf.extend_from_slice(&v.to_be_bytes());
    }

    pub fn put_u32(&mut self, v: u32) {
        self.buf.extend_from_slice(&v.to_be_bytes());
    }

    pub fn put_u64(&mut self, v: u64) {
        self.buf.extend_from_slice(&v.to_be_bytes());
    }

    pub fn put_i64(&mut self, v: i64) {
        self.buf.extend_from_slice(&v.to_be_bytes());
    }

    pub fn put_f32(&mut self, v: f32) {
        self.buf.extend_from_slice(&v.to_bits().to_be_bytes());
    }

    pub fn put_f64(&mut self, v: f64) {
        self.buf.extend_from_slice(&v.to_bits().to_be_bytes());
    }

    /// Writes a `u32` length prefix followed by the bytes.
    pub fn put_bytes(&mut self, v: &[u8]) {
        self.put_u32(v.len() as u32);
        self.buf.extend_from_slice(v);
    }

    pub fn put_str(&mut self, v: &str) {
        self.put_bytes(v.as_bytes());
    }

    /// Appends bytes without a length prefix.
    pub fn put_raw(&mut self, v: &[u8]) {
        self.buf.extend_from_slice(v);
    }

    pub fn put_page_idx(&mut self, v: PageIdx) {
        self.put_u32(v.0);
    }

    pub fn put_page_range(&mut self, v: &PageRange) {
        self.put_u32(v.start.0);
        self.put_u32(v.num_pages);
    }

    /// Appends a framed section: `[tag][len][crc32][payload]`.
    pub fn put_section(&mut self, tag: u32, payload: &[u8]) {
        self.put_u32(tag);
        self.put_u32(payload.len() as u32);
        self.put_u32(blob_crc32(tag, payload));
        self.buf.extend_from_slice(payload);
    }
}

/// Cursor over a borrowed slice; every read reports truncation as an error.
#[derive(Debug, Clone)]
pub struct ByteReader<'a> {
    src: &'a [u8],
    off: usize,
}

macro_rules! read_be {
    ($name:ident, $ty:ty) => {
        pub fn $name(&mut self) -> Result<$ty> {
            const N: usize = core::mem::size_of::<$ty>();
            let bytes = self.take(N)?;
            let mut arr = [0u8; N];
            arr.copy_from_slice(bytes);
            Ok(<$ty>::from_be_bytes(arr))
        }
    };
}

impl<'a> ByteReader<'a> {
    /// Creates a reader positioned at the start of `src`.
    pub fn new(src: &'a [u8]) -> Self {
        Self { src, off: 0 }
    }

    /// Current offset.
    pub fn position(&self) -> usize {
        self.off
    }

    /// Bytes left.
    pub fn remaining(&self) -> usize {
        self.src.len() - self.off
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8]> {
        let end = self
            .off
            .checked_add(n)
            .filter(|end| *end <= self.src.len())
            .ok_or_else(|| {
                PenumbraError::Serialization(format!(
                    "truncated read: need {n} bytes at offset {}, have {}",
                    self.off,
                    self.remaining()
                ))
            })?;
        let out = &self.src[self.off..end];
        self.off = end;
        Ok(out)
    }

    read_be!(get_u16, u16);
    read_be!(get_u32, u32);
    read_be!(get_u64, u64);
    read_be!(get_i64, i64);

    pub fn get_u8(&mut self) -> Result<u8> {
        Ok(self.take(1)?[0])
    }

    /// Returns the next byte without consuming it.
    pub fn peek_u8(&self) -> Result<u8> {
        self.src
            .get(self.off)
            .copied()
            .ok_or_else(|| PenumbraError::Serialization("truncated read: need 1 byte".into()))
    }

    pub fn get_bool(&mut self) -> Result<bool> {
        match self.get_u8()? {
            0 => Ok(false),
            1 => Ok(true),
            other => Err(PenumbraError::Serialization(format!(
                "invalid bool byte {other}"
            ))),
        }
    }

    pub fn get_f32(&mut self) -> Result<f32> {
        Ok(f32::from_bits(self.get_u32()?))
    }

    pub fn get_f64(&mut self) -> Result<f64> {
        Ok(f64::from_bits(self.get_u64()?))
    }

    /// Reads a `u32` length-prefixed byte string.
    pub fn get_bytes(&mut self) -> Result<&'a [u8]> {
        let len = self.get_u32()? as usize;
        self.take(len)
    }

    pub fn get_str(&mut self) -> Result<String> {
        let bytes = self.get_bytes()?;
        String::from_utf8(bytes.to_vec())
            .map_err(|_| PenumbraError::Serialization("string is not valid UTF-8".into()))
    }

    /// Reads exactly `n` bytes without a length prefix.
    pub fn get_raw(&mut self, n: usize) -> Result<&'a [u8]> {
        self.take(n)
    }

    pub fn get_page_idx(&mut self) -> Result<PageIdx> {
        Ok(PageIdx(self.get_u32()?))
    }

    pub fn get_page_range(&mut self) -> Result<PageRange> {
        let start = PageIdx(self.get_u32()?);
        let num_pages = self.get_u32()?;
        Ok(PageRange::new(start, num_pages))
    }

    /// Reads a framed section and checks its tag and (optionally) its crc.
    pub fn get_section(&mut self, tag: u32, verify: bool) -> Result<&'a [u8]> {
        let (found, len, crc) = decode_section_header(self.get_raw(SECTION_HEADER_LEN)?)?;
        if found != tag {
            return Err(PenumbraError::Serialization(format!(
                "section tag mismatch: expected {}, found {}",
                tag_name(tag),
                tag_name(found)
            )));
        }
        let payload = self.take(len as usize)?;
        if verify && blob_crc32(tag, payload) != crc {
            return Err(PenumbraError::CorruptionOwned(format!(
                "{} section checksum mismatch",
                tag_name(tag)
            )));
        }
        Ok(payload)
    }

    /// Fails unless every byte was consumed.
    pub fn expect_end(&self) -> Result<()> {
        if self.remaining() == 0 {
            Ok(())
        } else {
            Err(PenumbraError::Serialization(format!(
                "{} trailing bytes",
                self.remaining()
            )))
        }
    }
}

/// Splits a section header into `(tag, len, crc32)`.
pub fn decode_section_header(src: &[u8]) -> Result<(u32, u32, u32)> {
    if src.len() < SECTION_HEADER_LEN {
        return Err(PenumbraError::Serialization(
            "section header truncated".into(),
        ));
    }
    let field = |range: std::ops::Range<usize>| {
        let mut arr = [0u8; 4];
        arr.copy_from_slice(&src[range]);
        u32::from_be_bytes(arr)
    };
    Ok((field(0..4), field(4..8), field(8..12)))
}

/// Builds a section tag from four ASCII bytes.
pub const fn tag(bytes: [u8; 4]) -> u32 {
    u32::from_be_bytes(bytes)
}

fn tag_name(tag: u32) -> String {
    let bytes = tag.to_be_bytes();
    if bytes.iter().all(|b| b.is_ascii_graphic()) {
        String::from_utf8_lossy(&bytes).into_owned()
    } else {
        format!("{tag:#010x}")
    }
}
