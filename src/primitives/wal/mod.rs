#![forbid(unsafe_code)]

use std::fmt;
use std::sync::Arc;
use tracing::{debug, warn};

use crate::primitives::io::FileIo;
use crate::types::{Checksum, Crc32Fast, PenumbraError, Result};
use parking_lot::Mutex;

const WAL_MAGIC: [u8; 4] = *b"PNMW";
const WAL_FORMAT_VERSION: u16 = 1;
/// Length of the WAL file header.
pub const FILE_HEADER_LEN: usize = 32;
const RECORD_HEADER_LEN: usize = 24;
const MAX_RECORD_PAYLOAD: u32 = 1 << 30;

/// Configuration options for opening a write-ahead log.
#[derive(Clone, Debug)]
pub struct WalOptions {
    /// Page size of the owning database
    pub page_size: u32,
    /// Id of the owning database; a WAL from another database is rejected
    pub database_id: u64,
    /// Verify record checksums while iterating
    pub verify_checksums: bool,
}

impl WalOptions {
    /// Creates a new WalOptions with the specified configuration.
    pub fn new(page_size: u32, database_id: u64) -> Self {
        Self {
            page_size,
            database_id,
            verify_checksums: true,
        }
    }
}

/// Statistics tracking WAL operations.
#[derive(Clone, Debug, Default)]
pub struct WalStats {
    /// Number of records appended since the last reset
    pub records_appended: u64,
    /// Total bytes written since the last reset
    pub bytes_appended: u64,
    /// Number of sync operations performed
    pub syncs: u64,
    /// Number of checkpoint markers logged
    pub checkpoints_logged: u64,
}

/// Kind of a WAL record.
#[repr(u8)]
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum WalRecordKind {
    /// A committed transaction's logical operations.
    Commit = 1,
    /// Shadow pages are durable and validated; only their application remains.
    Checkpoint = 2,
}

impl TryFrom<u8> for WalRecordKind {
    type Error = PenumbraError;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            1 => Ok(WalRecordKind::Commit),
            2 => Ok(WalRecordKind::Checkpoint),
            _ => Err(PenumbraError::Corruption("unknown wal record kind")),
        }
    }
}

#[derive(Clone, Debug)]
struct FileHeader {
    page_size: u32,
    database_id: u64,
}

impl FileHeader {
    fn encode(&self) -> [u8; FILE_HEADER_LEN] {
        let mut buf = [0u8; FILE_HEADER_LEN];
        buf[0..4].copy_from_slice(&WAL_MAGIC);
        buf[4..6].copy_from_slice(&WAL_FORMAT_VERSION.to_be_bytes());
        buf[8..12].copy_from_slice(&self.page_size.to_be_bytes());
        buf[12..20].copy_from_slice(&self.database_id.to_be_bytes());
        let crc = compute_crc32(&[&buf[..28]]);
        buf[28..32].copy_from_slice(&crc.to_be_bytes());
        buf
    }

    fn decode(src: &[u8]) -> Result<Self> {
        if src.len() < FILE_HEADER_LEN {
            return Err(PenumbraError::Corruption("wal header truncated"));
        }
        if src[0..4] != WAL_MAGIC {
            return Err(PenumbraError::Corruption("wal magic mismatch"));
        }
        if be_u16(&src[4..6]) != WAL_FORMAT_VERSION {
            return Err(PenumbraError::Corruption("wal format version mismatch"));
        }
        if src[6..8] != [0, 0] || src[20..28] != [0; 8] {
            return Err(PenumbraError::Corruption(
                "wal reserved header bytes non-zero",
            ));
        }
        if compute_crc32(&[&src[..28]]) != be_u32(&src[28..32]) {
            return Err(PenumbraError::Corruption("wal header crc mismatch"));
        }
        Ok(Self {
            page_size: be_u32(&src[8..12]),
            database_id: be_u64(&src[12..20]),
        })
    }
}

#[derive(Clone, Debug)]
struct RecordHeader {
    kind: u8,
    payload_len: u32,
    prev_chain: u64,
    payload_crc32: u32,
}

impl RecordHeader {
    fn encode(&self) -> [u8; RECORD_HEADER_LEN] {
        let mut buf = [0u8; RECORD_HEADER_LEN];
        buf[0] = self.kind;
        buf[4..8].copy_from_slice(&self.payload_len.to_be_bytes());
        buf[8..16].copy_from_slice(&self.prev_chain.to_be_bytes());
        buf[16..20].copy_from_slice(&self.payload_crc32.to_be_bytes());
        let crc = compute_crc32(&[&buf[..20]]);
        buf[20..24].copy_from_slice(&crc.to_be_bytes());
        buf
    }

    fn decode(src: &[u8]) -> Option<Self> {
        if src.len() < RECORD_HEADER_LEN || src[1..4] != [0, 0, 0] {
            return None;
        }
        if compute_crc32(&[&src[..20]]) != be_u32(&src[20..24]) {
            return None;
        }
        Some(Self {
            kind: src[0],
            payload_len: be_u32(&src[4..8]),
            prev_chain: be_u64(&src[8..16]),
            payload_crc32: be_u32(&src[16..20]),
        })
    }
}

fn next_chain(prev_chain: u64, header: &[u8], payload: &[u8]) -> u64 {
    let mut hasher = Crc32Fast::default();
    hasher.update(&prev_chain.to_be_bytes());
    hasher.update(header);
    hasher.update(payload);
    let record_size = (header.len() + payload.len()) as u64;
    (record_size << 32) | u64::from(hasher.finalize())
}

struct WalState {
    append_offset: u64,
    prev_chain: u64,
    stats: WalStats,
}

/// Write-ahead log of committed transactions and checkpoint markers.
///
/// Records are checksummed and chained; iteration stops at the first record
/// that is torn or fails validation.
pub struct Wal {
    io: Arc<dyn FileIo>,
    verify_checksums: bool,
    state: Mutex<WalState>,
}

impl Wal {
    /// Opens or creates a write-ahead log with the given options.
    ///
    /// An existing log must carry the same page size and database id.
    pub fn open(io: Arc<dyn FileIo>, options: WalOptions) -> Result<Self> {
        if options.page_size == 0 {
            return Err(PenumbraError::Invalid("wal page size must be non-zero"));
        }
        let len = io.len()?;
        if len < FILE_HEADER_LEN as u64 {
            let header = FileHeader {
                page_size: options.page_size,
                database_id: options.database_id,
            };
            io.write_at(0, &header.encode())?;
            io.truncate(FILE_HEADER_LEN as u64)?;
            io.sync_all()?;
        } else {
            let mut buf = [0u8; FILE_HEADER_LEN];
            io.read_at(0, &mut buf)?;
            let header = FileHeader::decode(&buf)?;
            if header.page_size != options.page_size {
                return Err(PenumbraError::Corruption("wal page size mismatch"));
            }
            if header.database_id != options.database_id {
                return Err(PenumbraError::Corruption(
                    "wal belongs to a different database",
                ));
            }
        }
        let wal = Self {
            io,
            verify_checksums: options.verify_checksums,
            state: Mutex::new(WalState {
                append_offset: FILE_HEADER_LEN as u64,
                prev_chain: 0,
                stats: WalStats::default(),
            }),
        };
        let scan = wal.scan()?;
        {
            let mut state = wal.state.lock();
            state.append_offset = scan.valid_up_to;
            state.prev_chain = scan.chain;
        }
        Ok(wal)
    }

    /// Appends a commit record and syncs it.
    pub fn log_commit(&self, payload: &[u8]) -> Result<()> {
        self.append(WalRecordKind::Commit, payload)?;
        self.sync()
    }

    /// Appends a durable "checkpoint in progress, shadow pages validated"
    /// record and syncs it.
    pub fn log_and_flush_checkpoint(&self) -> Result<()> {
        self.append(WalRecordKind::Checkpoint, &[])?;
        self.sync()?;
        let mut state = self.state.lock();
        state.stats.checkpoints_logged += 1;
        debug!(offset = state.append_offset, "wal.checkpoint_marker");
        Ok(())
    }

    fn append(&self, kind: WalRecordKind, payload: &[u8]) -> Result<()> {
        if payload.len() as u64 > u64::from(MAX_RECORD_PAYLOAD) {
            return Err(PenumbraError::Invalid("wal record payload too large"));
        }
        let mut state = self.state.lock();
        let header = RecordHeader {
            kind: kind as u8,
            payload_len: payload.len() as u32,
            prev_chain: state.prev_chain,
            payload_crc32: compute_crc32(&[payload]),
        }
        .encode();
        let mut record = Vec::with_capacity(RECORD_HEADER_LEN + payload.len());
        record.extend_from_slice(&header);
        record.extend_from_slice(payload);
        self.io.write_at(state.append_offset, &record)?;
        state.prev_chain = next_chain(state.prev_chain, &header, payload);
        state.append_offset += record.len() as u64;
        state.stats.records_appended += 1;
        state.stats.bytes_appended += record.len() as u64;
        Ok(())
    }

    /// Syncs all pending writes to persistent storage.
    pub fn sync(&self) -> Result<()> {
        self.io.sync_all()?;
        self.state.lock().stats.syncs += 1;
        Ok(())
    }

    /// Truncates the log back to its header and syncs.
    pub fn clear(&self) -> Result<()> {
        let mut state = self.state.lock();
        self.io.truncate(FILE_HEADER_LEN as u64)?;
        self.io.sync_all()?;
        state.append_offset = FILE_HEADER_LEN as u64;
        state.prev_chain = 0;
        Ok(())
    }

    /// Drops trailing bytes past `offset` (a torn tail found by [`Wal::scan`]).
    pub fn truncate_to(&self, offset: u64) -> Result<()> {
        let offset = offset.max(FILE_HEADER_LEN as u64);
        if self.io.len()? <= offset {
            return Ok(());
        }
        self.io.truncate(offset)?;
        self.io.sync_all()?;
        // Appends must chain from the last record that survived.
        let scan = self.scan()?;
        let mut state = self.state.lock();
        state.append_offset = scan.valid_up_to;
        state.prev_chain = scan.chain;
        Ok(())
    }

    /// Resets the in-memory counters; the file itself is left untouched.
    pub fn reset(&self) {
        self.state.lock().stats = WalStats::default();
    }

    /// Creates an iterator over the intact records.
    pub fn iter(&self) -> Result<WalIterator> {
        let len = self.io.len()?;
        if len < FILE_HEADER_LEN as u64 {
            return Err(PenumbraError::Corruption("wal truncated header"));
        }
        Ok(WalIterator {
            io: Arc::clone(&self.io),
            verify_checksums: self.verify_checksums,
            offset: FILE_HEADER_LEN as u64,
            end: len,
            prev_chain: 0,
            valid_up_to: FILE_HEADER_LEN as u64,
        })
    }

    /// Reads every intact record.
    pub fn scan(&self) -> Result<WalScan> {
        let mut iter = self.iter()?;
        let mut records = Vec::new();
        while let Some(record) = iter.next_record()? {
            records.push(record);
        }
        let file_len = self.io.len()?;
        let torn_bytes = file_len.saturating_sub(iter.valid_up_to);
        if torn_bytes > 0 {
            warn!(
                valid_up_to = iter.valid_up_to,
                torn_bytes, "wal.scan.torn_tail"
            );
        }
        Ok(WalScan {
            records,
            valid_up_to: iter.valid_up_to,
            torn_bytes,
            chain: iter.prev_chain,
        })
    }

    /// Returns current statistics for this WAL instance.
    pub fn stats(&self) -> WalStats {
        self.state.lock().stats.clone()
    }

    /// Returns the total size of the WAL file in bytes.
    pub fn file_size(&self) -> Result<u64> {
        self.io.len()
    }

    /// Returns true if the WAL contains no records.
    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.file_size()? <= FILE_HEADER_LEN as u64)
    }
}

/// A record read back from the log.
pub struct WalRecord {
    /// Record kind
    pub kind: WalRecordKind,
    /// File offset of the record header
    pub offset: u64,
    /// Record payload
    pub payload: Vec<u8>,
}

impl fmt::Debug for WalRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WalRecord")
            .field("kind", &self.kind)
            .field("offset", &self.offset)
            .field("payload_len", &self.payload.len())
            .finish()
    }
}

/// Result of [`Wal::scan`].
#[derive(Debug)]
pub struct WalScan {
    /// Intact records in log order
    pub records: Vec<WalRecord>,
    /// Offset just past the last intact record
    pub valid_up_to: u64,
    /// Bytes after `valid_up_to`
    pub torn_bytes: u64,
    chain: u64,
}

impl WalScan {
    /// Position of the last checkpoint marker, if any.
    pub fn last_checkpoint_marker(&self) -> Option<usize> {
        self.records
            .iter()
            .rposition(|record| record.kind == WalRecordKind::Checkpoint)
    }
}

/// Iterator for reading records from a WAL file.
///
/// Stops iteration when corruption is detected or end of valid records is reached.
pub struct WalIterator {
    io: Arc<dyn FileIo>,
    verify_checksums: bool,
    offset: u64,
    end: u64,
    prev_chain: u64,
    valid_up_to: u64,
}

impl WalIterator {
    /// Reads the next record.
    ///
    /// Returns None when reaching the end of valid records or detecting corruption.
    pub fn next_record(&mut self) -> Result<Option<WalRecord>> {
        if self.offset + RECORD_HEADER_LEN as u64 > self.end {
            return Ok(self.stop());
        }
        let mut header_buf = [0u8; RECORD_HEADER_LEN];
        if let Err(err) = self.io.read_at(self.offset, &mut header_buf) {
            return if is_eof(&err) { Ok(self.stop()) } else { Err(err) };
        }
        let Some(header) = RecordHeader::decode(&header_buf) else {
            return Ok(self.stop());
        };
        let Ok(kind) = WalRecordKind::try_from(header.kind) else {
            return Ok(self.stop());
        };
        if header.prev_chain != self.prev_chain || header.payload_len > MAX_RECORD_PAYLOAD {
            return Ok(self.stop());
        }
        let payload_off = self.offset + RECORD_HEADER_LEN as u64;
        if payload_off + u64::from(header.payload_len) > self.end {
            return Ok(self.stop());
        }
        let mut payload = vec![0u8; header.payload_len as usize];
        if let Err(err) = self.io.read_at(payload_off, &mut payload) {
            return if is_eof(&err) { Ok(self.stop()) } else { Err(err) };
        }
        if self.verify_checksums && compute_crc32(&[&payload]) != header.payload_crc32 {
            return Ok(self.stop());
        }
        let record = WalRecord {
            kind,
            offset: self.offset,
            payload,
        };
        self.prev_chain = next_chain(self.prev_chain, &header_buf, &record.payload);
        self.offset = payload_off + u64::from(header.payload_len);
        self.valid_up_to = self.offset;
        Ok(Some(record))
    }

    fn stop(&mut self) -> Option<WalRecord> {
        self.offset = self.end;
        None
    }

    /// Returns the file offset up to which records have been validated.
    pub fn valid_up_to(&self) -> u64 {
        self.valid_up_to
    }
}

fn is_eof(err: &PenumbraError) -> bool {
    matches!(err, PenumbraError::Io(io_err) if io_err.kind() == std::io::ErrorKind::UnexpectedEof)
}

fn compute_crc32(chunks: &[&[u8]]) -> u32 {
    let mut hasher = Crc32Fast::default();
    for chunk in chunks {
        hasher.update(chunk);
    }
    hasher.finalize()
}

fn be_u16(src: &[u8]) -> u16 {
    u16::from_be_bytes([src[0], src[1]])
}

fn be_u32(src: &[u8]) -> u32 {
    u32::from_be_bytes([src[0], src[1], src[2], src[3]])
}

fn be_u64(src: &[u8]) -> u64 {
    let mut arr = [0u8; 8];
    arr.copy_from_slice(&src[..8]);
    u64::from_be_bytes(arr)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::primitives::io::{MemFileIo, OpenMode, StdFileIo};
    use tempfile::tempdir;

    #[test]
    fn wal_append_and_iterate_roundtrip() -> Result<()> {
        let dir = tempdir().unwrap();
        let path = dir.path().join("wal_roundtrip");
        let io = StdFileIo::open(&path, OpenMode::ReadWriteCreate)?;
        let wal = Wal::open(Arc::new(io), WalOptions::new(4096, 42))?;
        wal.log_commit(b"first")?;
        wal.log_commit(b"second")?;
        wal.log_and_flush_checkpoint()?;

        let scan = wal.scan()?;
        assert_eq!(scan.records.len(), 3);
        assert_eq!(scan.records[0].kind, WalRecordKind::Commit);
        assert_eq!(scan.records[0].payload, b"first");
        assert_eq!(scan.records[1].payload, b"second");
        assert_eq!(scan.records[2].kind, WalRecordKind::Checkpoint);
        assert_eq!(scan.last_checkpoint_marker(), Some(2));
        assert_eq!(scan.torn_bytes, 0);
        Ok(())
    }

    #[test]
    fn wal_reopen_continues_chain() -> Result<()> {
        let io = Arc::new(MemFileIo::new());
        {
            let wal = Wal::open(io.clone(), WalOptions::new(4096, 7))?;
            wal.log_commit(b"a")?;
        }
        let wal = Wal::open(io, WalOptions::new(4096, 7))?;
        wal.log_commit(b"b")?;
        let scan = wal.scan()?;
        let payloads: Vec<&[u8]> = scan.records.iter().map(|r| r.payload.as_slice()).collect();
        assert_eq!(payloads, vec![b"a".as_slice(), b"b".as_slice()]);
        Ok(())
    }

    #[test]
    fn wal_detects_corruption() -> Result<()> {
        let io = Arc::new(MemFileIo::new());
        let wal = Wal::open(io.clone(), WalOptions::new(4096, 777))?;
        wal.log_commit(&[3u8; 64])?;
        wal.log_commit(&[4u8; 64])?;

        // Flip a payload byte of the second record.
        let second = FILE_HEADER_LEN as u64 + (RECORD_HEADER_LEN + 64) as u64;
        let mut byte = [0u8; 1];
        io.read_at(second + RECORD_HEADER_LEN as u64 + 5, &mut byte)?;
        byte[0] ^= 0xFF;
        io.write_at(second + RECORD_HEADER_LEN as u64 + 5, &byte)?;

        let scan = wal.scan()?;
        assert_eq!(scan.records.len(), 1);
        assert_eq!(scan.valid_up_to, second);
        assert!(scan.torn_bytes > 0);
        Ok(())
    }

    #[test]
    fn wal_torn_tail_is_ignored_and_truncated() -> Result<()> {
        let io = Arc::new(MemFileIo::new());
        let wal = Wal::open(io.clone(), WalOptions::new(4096, 1))?;
        wal.log_commit(b"intact")?;
        let intact_len = io.len()?;
        io.write_at(intact_len, &[0xAB; 10])?;

        let reopened = Wal::open(io.clone(), WalOptions::new(4096, 1))?;
        let scan = reopened.scan()?;
        assert_eq!(scan.records.len(), 1);
        reopened.truncate_to(scan.valid_up_to)?;
        assert_eq!(io.len()?, intact_len);
        reopened.log_commit(b"next")?;
        assert_eq!(reopened.scan()?.records.len(), 2);
        Ok(())
    }

    #[test]
    fn wal_truncate_between_records_keeps_chain() -> Result<()> {
        let io = Arc::new(MemFileIo::new());
        let wal = Wal::open(io.clone(), WalOptions::new(4096, 5))?;
        wal.log_commit(b"keep")?;
        wal.log_commit(b"drop")?;
        let second = wal.scan()?.records[1].offset;
        wal.truncate_to(second)?;
        wal.log_commit(b"after")?;
        let reopened = Wal::open(io, WalOptions::new(4096, 5))?;
        let payloads: Vec<Vec<u8>> = reopened
            .scan()?
            .records
            .into_iter()
            .map(|r| r.payload)
            .collect();
        assert_eq!(payloads, vec![b"keep".to_vec(), b"after".to_vec()]);
        Ok(())
    }

    #[test]
    fn wal_clear_leaves_header_only() -> Result<()> {
        let io = Arc::new(MemFileIo::new());
        let wal = Wal::open(io, WalOptions::new(4096, 9))?;
        wal.log_commit(b"x")?;
        assert!(!wal.is_empty()?);
        wal.clear()?;
        assert!(wal.is_empty()?);
        assert_eq!(wal.file_size()?, FILE_HEADER_LEN as u64);
        wal.log_commit(b"y")?;
        assert_eq!(wal.scan()?.records.len(), 1);
        Ok(())
    }

    #[test]
    fn wal_rejects_foreign_database() -> Result<()> {
        let io = Arc::new(MemFileIo::new());
        Wal::open(io.clone(), WalOptions::new(4096, 1))?;
        match Wal::open(io, WalOptions::new(4096, 2)) {
            Err(PenumbraError::Corruption(msg)) => assert!(msg.contains("different database")),
            Err(other) => panic!("unexpected error: {other:?}"),
            Ok(_) => panic!("foreign wal accepted"),
        }
        Ok(())
    }
}
