//! Low-level primitives for building the storage engine.
//!
//! Includes byte encoding, file I/O and the write-ahead log.

/// Byte-level utilities and encoding/decoding.
///
/// Big-endian writers and readers plus CRC-framed sections.
pub mod bytes;

/// I/O abstractions and utilities.
///
/// Positioned file access, an in-memory file and write-side I/O accounting.
pub mod io;

/// Write-ahead logging (WAL) for crash recovery.
///
/// Ensures durability through sequential logging of committed transactions
/// and checkpoint markers.
pub mod wal;
