#![forbid(unsafe_code)]

use std::{
    fs::{File, OpenOptions},
    io,
    path::Path,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
};

use parking_lot::RwLock;
use serde::Serialize;

use crate::types::{PenumbraError, Result};

#[cfg(test)]
macro_rules! io_test_log {
    ($($arg:tt)*) => {
        eprintln!($($arg)*);
    };
}

#[cfg(not(test))]
macro_rules! io_test_log {
    ($($arg:tt)*) => {
        if false {
            let _ = format_args!($($arg)*);
        }
    };
}

/// Trait for performing positioned file I/O operations.
pub trait FileIo: Send + Sync + 'static {
    /// Reads bytes from the file at the specified offset into the buffer.
    fn read_at(&self, off: u64, dst: &mut [u8]) -> Result<()>;
    /// Writes bytes to the file at the specified offset from the buffer.
    fn write_at(&self, off: u64, src: &[u8]) -> Result<()>;
    /// Synchronizes all file data and metadata to disk.
    fn sync_all(&self) -> Result<()>;
    /// Returns the current length of the file in bytes.
    fn len(&self) -> Result<u64>;
    /// Returns true if the file is empty.
    fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }
    /// Truncates or extends the file to the specified length.
    fn truncate(&self, len: u64) -> Result<()>;
}

/// How a [`StdFileIo`] opens its file.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum OpenMode {
    /// Read-write, creating the file when missing.
    ReadWriteCreate,
    /// Read-only; the file must exist.
    ReadOnly,
}

#[cfg(unix)]
mod stdio_unix {
    use std::{
        fs::File,
        io::{self, ErrorKind},
        os::unix::fs::FileExt,
    };

    pub fn read_exact(file: &File, mut off: u64, mut dst: &mut [u8]) -> io::Result<()> {
        while !dst.is_empty() {
            let read = file.read_at(dst, off)?;
            if read == 0 {
                io_test_log!(
                    "[io.read_exact] zero bytes read off={} remaining={}",
                    off,
                    dst.len()
                );
                return Err(io::Error::new(
                    ErrorKind::UnexpectedEof,
                    "read_at reached EOF",
                ));
            }
            let (_, tail) = dst.split_at_mut(read);
            dst = tail;
            off += read as u64;
        }
        Ok(())
    }

    pub fn write_all(file: &File, mut off: u64, mut src: &[u8]) -> io::Result<()> {
        while !src.is_empty() {
            let written = file.write_at(src, off)?;
            if written == 0 {
                return Err(io::Error::new(
                    ErrorKind::WriteZero,
                    "write_at wrote zero bytes",
                ));
            }
            src = &src[written..];
            off += written as u64;
        }
        Ok(())
    }
}

#[cfg(windows)]
mod stdio_win {
    use std::{
        fs::File,
        io::{self, ErrorKind},
        os::windows::fs::FileExt,
    };

    pub fn read_exact(file: &File, mut off: u64, mut dst: &mut [u8]) -> io::Result<()> {
        while !dst.is_empty() {
            let read = file.seek_read(dst, off)?;
            if read == 0 {
                return Err(io::Error::new(
                    ErrorKind::UnexpectedEof,
                    "seek_read reached EOF",
                ));
            }
            let (_, tail) = dst.split_at_mut(read);
            dst = tail;
            off += read as u64;
        }
        Ok(())
    }

    pub fn write_all(file: &File, mut off: u64, mut src: &[u8]) -> io::Result<()> {
        while !src.is_empty() {
            let written = file.seek_write(src, off)?;
            if written == 0 {
                return Err(io::Error::new(
                    ErrorKind::WriteZero,
                    "seek_write wrote zero bytes",
                ));
            }
            src = &src[written..];
            off += written as u64;
        }
        Ok(())
    }
}

/// Standard file I/O implementation using `Arc<File>`.
#[derive(Clone)]
pub struct StdFileIo {
    inner: Arc<File>,
    read_only: bool,
}

impl StdFileIo {
    /// Opens a file with the given mode.
    pub fn open(path: impl AsRef<Path>, mode: OpenMode) -> Result<Self> {
        let mut options = OpenOptions::new();
        options.read(true);
        match mode {
            OpenMode::ReadWriteCreate => {
                options.write(true).create(true).truncate(false);
            }
            OpenMode::ReadOnly => {}
        }
        let file = options.open(path).map_err(PenumbraError::from)?;
        Ok(Self {
            inner: Arc::new(file),
            read_only: mode == OpenMode::ReadOnly,
        })
    }

    fn file(&self) -> &File {
        &self.inner
    }

    #[cfg(unix)]
    fn read_exact(&self, off: u64, dst: &mut [u8]) -> io::Result<()> {
        stdio_unix::read_exact(self.file(), off, dst)
    }

    #[cfg(windows)]
    fn read_exact(&self, off: u64, dst: &mut [u8]) -> io::Result<()> {
        stdio_win::read_exact(self.file(), off, dst)
    }

    #[cfg(unix)]
    fn write_all(&self, off: u64, src: &[u8]) -> io::Result<()> {
        stdio_unix::write_all(self.file(), off, src)
    }

    #[cfg(windows)]
    fn write_all(&self, off: u64, src: &[u8]) -> io::Result<()> {
        stdio_win::write_all(self.file(), off, src)
    }

    #[cfg(not(any(unix, windows)))]
    fn read_exact(&self, _off: u64, _dst: &mut [u8]) -> io::Result<()> {
        Err(io::Error::new(
            io::ErrorKind::Unsupported,
            "StdFileIo unsupported on this platform",
        ))
    }

    #[cfg(not(any(unix, windows)))]
    fn write_all(&self, _off: u64, _src: &[u8]) -> io::Result<()> {
        Err(io::Error::new(
            io::ErrorKind::Unsupported,
            "StdFileIo unsupported on this platform",
        ))
    }
}

impl FileIo for StdFileIo {
    fn read_at(&self, off: u64, dst: &mut [u8]) -> Result<()> {
        self.read_exact(off, dst).map_err(PenumbraError::from)
    }

    fn write_at(&self, off: u64, src: &[u8]) -> Result<()> {
        if self.read_only {
            return Err(PenumbraError::ReadOnly);
        }
        self.write_all(off, src).map_err(PenumbraError::from)
    }

    fn sync_all(&self) -> Result<()> {
        if self.read_only {
            return Ok(());
        }
        io_test_log!("[io.sync_all] start");
        self.file().sync_all().map_err(PenumbraError::from)
    }

    fn len(&self) -> Result<u64> {
        Ok(self.file().metadata().map_err(PenumbraError::from)?.len())
    }

    fn truncate(&self, len: u64) -> Result<()> {
        if self.read_only {
            return Err(PenumbraError::ReadOnly);
        }
        self.file().set_len(len).map_err(PenumbraError::from)
    }
}

/// Heap-backed [`FileIo`] used by in-memory databases and tests.
#[derive(Clone, Default)]
pub struct MemFileIo {
    bytes: Arc<RwLock<Vec<u8>>>,
}

impl MemFileIo {
    /// Creates an empty in-memory file.
    pub fn new() -> Self {
        Self::default()
    }

    /// Copies out the current contents.
    pub fn snapshot(&self) -> Vec<u8> {
        self.bytes.read().clone()
    }
}

impl FileIo for MemFileIo {
    fn read_at(&self, off: u64, dst: &mut [u8]) -> Result<()> {
        let bytes = self.bytes.read();
        let start = off as usize;
        let end = start
            .checked_add(dst.len())
            .ok_or(PenumbraError::Invalid("read offset overflow"))?;
        if end > bytes.len() {
            return Err(PenumbraError::Io(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "read past end of in-memory file",
            )));
        }
        dst.copy_from_slice(&bytes[start..end]);
        Ok(())
    }

    fn write_at(&self, off: u64, src: &[u8]) -> Result<()> {
        let mut bytes = self.bytes.write();
        let start = off as usize;
        let end = start
            .checked_add(src.len())
            .ok_or(PenumbraError::Invalid("write offset overflow"))?;
        if end > bytes.len() {
            bytes.resize(end, 0);
        }
        bytes[start..end].copy_from_slice(src);
        Ok(())
    }

    fn sync_all(&self) -> Result<()> {
        Ok(())
    }

    fn len(&self) -> Result<u64> {
        Ok(self.bytes.read().len() as u64)
    }

    fn truncate(&self, len: u64) -> Result<()> {
        self.bytes.write().resize(len as usize, 0);
        Ok(())
    }
}

/// Write-side I/O counters shared by every file of one database.
#[derive(Default, Debug)]
pub struct IoCounters {
    writes: AtomicU64,
    bytes_written: AtomicU64,
    syncs: AtomicU64,
    truncates: AtomicU64,
}

/// Point-in-time copy of [`IoCounters`].
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Serialize)]
pub struct IoStats {
    /// Positioned writes issued.
    pub writes: u64,
    /// Bytes passed to positioned writes.
    pub bytes_written: u64,
    /// `sync_all` calls.
    pub syncs: u64,
    /// `truncate` calls.
    pub truncates: u64,
}

impl IoStats {
    /// Returns true when no write-side call was made.
    pub fn is_quiet(&self) -> bool {
        self.writes == 0 && self.syncs == 0 && self.truncates == 0
    }

    /// Difference between two snapshots.
    pub fn since(&self, earlier: &IoStats) -> IoStats {
        IoStats {
            writes: self.writes - earlier.writes,
            bytes_written: self.bytes_written - earlier.bytes_written,
            syncs: self.syncs - earlier.syncs,
            truncates: self.truncates - earlier.truncates,
        }
    }
}

impl IoCounters {
    /// Copies the counters.
    pub fn snapshot(&self) -> IoStats {
        IoStats {
            writes: self.writes.load(Ordering::Relaxed),
            bytes_written: self.bytes_written.load(Ordering::Relaxed),
            syncs: self.syncs.load(Ordering::Relaxed),
            truncates: self.truncates.load(Ordering::Relaxed),
        }
    }
}

/// [`FileIo`] wrapper that records write-side calls into shared counters.
pub struct MeteredIo {
    inner: Arc<dyn FileIo>,
    counters: Arc<IoCounters>,
}

impl MeteredIo {
    /// Wraps `inner`, reporting into `counters`.
    pub fn new(inner: Arc<dyn FileIo>, counters: Arc<IoCounters>) -> Self {
        Self { inner, counters }
    }
}

impl FileIo for MeteredIo {
    fn read_at(&self, off: u64, dst: &mut [u8]) -> Result<()> {
        self.inner.read_at(off, dst)
    }

    fn write_at(&self, off: u64, src: &[u8]) -> Result<()> {
        self.counters.writes.fetch_add(1, Ordering::Relaxed);
        self.counters
            .bytes_written
            .fetch_add(src.len() as u64, Ordering::Relaxed);
        self.inner.write_at(off, src)
    }

    fn sync_all(&self) -> Result<()> {
        self.counters.syncs.fetch_add(1, Ordering::Relaxed);
        self.inner.sync_all()
    }

    fn len(&self) -> Result<u64> {
        self.inner.len()
    }

    fn truncate(&self, len: u64) -> Result<()> {
        self.counters.truncates.fetch_add(1, Ordering::Relaxed);
        self.inner.truncate(len)
    }
}
