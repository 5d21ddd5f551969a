#![forbid(unsafe_code)]

//! Database administration and maintenance utilities.
//!
//! This module provides administrative functions for managing Penumbra
//! databases: explicit checkpoints, file summaries and verification.

mod checkpoint;
mod error;
mod info;
mod options;
mod util;
mod verify;

/// Runs a checkpoint of the database at a path.
///
/// Opening the database replays its WAL; the checkpoint then writes any
/// remaining changes into the main file and empties the WAL.
pub use checkpoint::{checkpoint, CheckpointReport};

/// Error types for administrative operations.
///
/// Defines error conditions that can occur during administrative tasks.
pub use error::{AdminError, Result};

/// Summary of the header, allocator, files, tables and indexes.
pub use info::{
    info, FilesSection, HeaderSection, IndexSection, InfoReport, PagesSection, RangeReport,
    TableSection,
};

/// Configuration options for opening a database in admin mode.
///
/// Controls how the database is opened for administrative operations.
pub use options::AdminOpenOptions;

/// Database integrity verification.
///
/// Verifies the structural integrity of the database and reports any issues found.
pub use verify::{verify, VerifyCounts, VerifyFinding, VerifyLevel, VerifyReport, VerifySeverity};

/// Utility functions for opening databases.
pub use util::open_database;
