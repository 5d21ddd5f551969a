//! Paged storage: allocation, the shadow file, tables and checkpoints.
//!
//! Every page a checkpoint writes is staged in the [`shadow::ShadowFile`]
//! first; the main file changes only when the shadow pages are applied.

/// Page cache over the main file.
pub mod buffer;

/// Checkpoint protocol and the open-time read of checkpointed state.
pub mod checkpointer;

/// Paged serialization buffers and readers.
pub mod file_writer;

/// The database header on page 0.
pub mod header;

/// Storage of every table.
pub mod manager;

/// Out-of-line storage for long strings.
pub mod overflow;

/// Free-list page allocator.
pub mod page_manager;

/// Staged page images for copy-on-write checkpoints.
pub mod shadow;

/// Table schemas, values and row storage.
pub mod table;

pub use checkpointer::{CheckpointOutcome, CheckpointState, CheckpointSummary, SkipReason};
pub use header::DatabaseHeader;
