//! Checkpoint orchestration and the open-time read of checkpointed state.
//!
//! A checkpoint stages every page it writes in the shadow file. Nothing in
//! the main file changes until the shadow file is durable and the WAL holds a
//! checkpoint marker; from then on the checkpoint can only be completed,
//! either here or by recovery redoing the shadow apply.

use std::fmt;

use tracing::{debug, info, warn};

use crate::catalog::Catalog;
use crate::db::config::SystemConfig;
use crate::primitives::bytes::ByteReader;
use crate::primitives::io::FileIo;
use crate::primitives::wal::Wal;
use crate::storage::buffer::BufferManager;
use crate::storage::file_writer::{BufferedFileReader, InMemFileWriter};
use crate::storage::header::DatabaseHeader;
use crate::storage::manager::StorageManager;
use crate::storage::page_manager::PageManager;
use crate::storage::shadow::ShadowFile;
use crate::transaction::Transaction;
use crate::types::{page, FailPoint, PageRange, PenumbraError, Result};

/// Phase of a running checkpoint.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum CheckpointState {
    /// No checkpoint running
    Idle,
    /// Asking components whether they changed; tables write their pages here
    CollectingChanges,
    /// Writing the catalog and the storage metadata blobs
    SerializingCatalogMetadata,
    /// Staging the new header page
    WritingHeader,
    /// Flushing the shadow file, logging the marker and applying pages
    LoggingAndApplying,
    /// Releasing freed pages and resetting change flags
    Finalizing,
    /// Undoing allocator and storage bookkeeping after a failure
    RollingBack,
}

impl fmt::Display for CheckpointState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            CheckpointState::Idle => "idle",
            CheckpointState::CollectingChanges => "collecting_changes",
            CheckpointState::SerializingCatalogMetadata => "serializing_catalog_metadata",
            CheckpointState::WritingHeader => "writing_header",
            CheckpointState::LoggingAndApplying => "logging_and_applying",
            CheckpointState::Finalizing => "finalizing",
            CheckpointState::RollingBack => "rolling_back",
        };
        f.write_str(name)
    }
}

/// Why a checkpoint wrote nothing.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum SkipReason {
    /// No component changed since the last checkpoint
    NoChanges,
    /// In-memory databases never checkpoint
    InMemory,
}

/// What a completed checkpoint wrote.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct CheckpointSummary {
    /// Tables or overflow stores wrote pages
    pub storage_written: bool,
    /// The catalog was reserialized
    pub catalog_written: bool,
    /// Storage metadata and the page manager were reserialized
    pub metadata_written: bool,
    /// Pages copied from the shadow file into the main file
    pub pages_applied: usize,
    /// Pages that became reusable
    pub pages_freed: usize,
    /// The header now in effect
    pub header: DatabaseHeader,
}

/// Result of [`Checkpointer::write_checkpoint`].
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum CheckpointOutcome {
    /// Nothing was written
    Skipped(SkipReason),
    /// A new header is durable
    Completed(CheckpointSummary),
}

impl CheckpointOutcome {
    /// True when the checkpoint wrote a new header.
    pub fn is_completed(&self) -> bool {
        matches!(self, CheckpointOutcome::Completed(_))
    }
}

/// Everything a checkpoint reads or mutates.
pub struct CheckpointParts<'a> {
    /// Header in effect; replaced only after the shadow apply succeeds
    pub header: &'a mut DatabaseHeader,
    /// Catalog
    pub catalog: &'a mut Catalog,
    /// Table storage
    pub storage: &'a mut StorageManager,
    /// Page allocator
    pub page_manager: &'a mut PageManager,
    /// Shadow file staging every page write
    pub shadow: &'a mut ShadowFile,
    /// Write-ahead log receiving the checkpoint marker
    pub wal: &'a Wal,
    /// Main database file
    pub main: &'a dyn FileIo,
    /// Page cache over the main file
    pub buffer: &'a BufferManager,
}

/// Runs one checkpoint over a set of [`CheckpointParts`].
pub struct Checkpointer<'a> {
    parts: CheckpointParts<'a>,
    page_size: u32,
    in_memory: bool,
    fail_point: Option<FailPoint>,
    state: CheckpointState,
    marker_durable: bool,
}

impl<'a> Checkpointer<'a> {
    /// Creates a checkpointer; nothing happens until
    /// [`Checkpointer::write_checkpoint`].
    pub fn new(parts: CheckpointParts<'a>, page_size: u32, in_memory: bool) -> Self {
        Self {
            parts,
            page_size,
            in_memory,
            fail_point: None,
            state: CheckpointState::Idle,
            marker_durable: false,
        }
    }

    /// Stops the checkpoint at `fail_point` with [`PenumbraError::Injected`].
    #[doc(hidden)]
    pub fn with_fail_point(mut self, fail_point: Option<FailPoint>) -> Self {
        self.fail_point = fail_point;
        self
    }

    /// Current phase.
    pub fn state(&self) -> CheckpointState {
        self.state
    }

    fn transition(&mut self, state: CheckpointState) {
        debug!(from = %self.state, to = %state, "checkpoint.state");
        self.state = state;
    }

    fn fail(&self, at: FailPoint) -> Result<()> {
        if self.fail_point == Some(at) {
            warn!(fail_point = ?at, "checkpoint.fail_point");
            return Err(PenumbraError::Injected(at));
        }
        Ok(())
    }

    /// Writes a checkpoint if any component changed.
    ///
    /// A failure before the WAL marker is durable rolls back allocator and
    /// storage bookkeeping and returns the error; the old header stays in
    /// effect. A failure after that point returns
    /// [`PenumbraError::RecoveryRequired`].
    pub fn write_checkpoint(&mut self) -> Result<CheckpointOutcome> {
        if self.in_memory {
            return Ok(CheckpointOutcome::Skipped(SkipReason::InMemory));
        }
        self.parts.page_manager.begin_checkpoint();
        self.parts.storage.begin_checkpoint();
        match self.run() {
            Ok(outcome) => Ok(outcome),
            Err(err) if self.marker_durable => {
                warn!(error = %err, state = %self.state, "checkpoint.failed_after_marker");
                self.state = CheckpointState::Idle;
                Err(PenumbraError::RecoveryRequired)
            }
            Err(err) => {
                warn!(error = %err, state = %self.state, "checkpoint.failed");
                self.rollback();
                Err(err)
            }
        }
    }

    fn run(&mut self) -> Result<CheckpointOutcome> {
        self.transition(CheckpointState::CollectingChanges);
        let p = &mut self.parts;
        let has_storage_changes = p.storage.checkpoint(p.page_manager, p.shadow, p.main)?;
        let catalog_changed = p.catalog.changed_since_last_checkpoint();
        let has_catalog_changes = catalog_changed || !p.header.catalog_page_range.is_valid();
        let has_metadata_changes = !p.header.metadata_page_range.is_valid()
            || has_storage_changes
            || catalog_changed
            || p.page_manager.changed_since_last_checkpoint();
        if !has_storage_changes && !has_catalog_changes && !has_metadata_changes {
            p.page_manager.discard_checkpoint();
            p.storage.finalize_checkpoint();
            debug!("checkpoint.skip");
            self.transition(CheckpointState::Idle);
            return Ok(CheckpointOutcome::Skipped(SkipReason::NoChanges));
        }

        self.transition(CheckpointState::SerializingCatalogMetadata);
        let mut header = *self.parts.header;
        if has_catalog_changes {
            let range = self.serialize_catalog()?;
            header.update_catalog_page_range(self.parts.page_manager, range)?;
        }
        if has_metadata_changes {
            // Freed before serializing so the page manager blob records it.
            header.free_metadata_page_range(self.parts.page_manager)?;
            header.metadata_page_range = self.serialize_metadata()?;
        }

        self.transition(CheckpointState::WritingHeader);
        self.write_database_header(&header)?;

        self.transition(CheckpointState::LoggingAndApplying);
        let pages_applied = self.log_checkpoint_and_apply_shadow_pages()?;
        *self.parts.header = header;

        self.transition(CheckpointState::Finalizing);
        let p = &mut self.parts;
        let freed = p.page_manager.finalize_checkpoint();
        for page_idx in &freed {
            p.buffer.evict_page(*page_idx);
        }
        p.storage.finalize_checkpoint();
        // Freed pages must be evicted before the queue is deduplicated.
        p.buffer.remove_evicted_candidates();
        p.catalog.reset_version();
        p.page_manager.reset_version();
        p.wal.reset();
        p.shadow.reset();
        self.marker_durable = false;
        self.transition(CheckpointState::Idle);

        let summary = CheckpointSummary {
            storage_written: has_storage_changes,
            catalog_written: has_catalog_changes,
            metadata_written: has_metadata_changes,
            pages_applied,
            pages_freed: freed.len(),
            header,
        };
        info!(
            catalog = summary.catalog_written,
            metadata = summary.metadata_written,
            storage = summary.storage_written,
            pages_applied,
            pages_freed = summary.pages_freed,
            catalog_range = %header.catalog_page_range,
            metadata_range = %header.metadata_page_range,
            "checkpoint.complete"
        );
        Ok(CheckpointOutcome::Completed(summary))
    }

    fn serialize_catalog(&mut self) -> Result<PageRange> {
        let p = &mut self.parts;
        let mut writer = InMemFileWriter::new(self.page_size);
        p.catalog.serialize(writer.writer());
        writer.flush(p.page_manager, p.shadow, p.main)
    }

    fn serialize_metadata(&mut self) -> Result<PageRange> {
        let p = &mut self.parts;
        let mut writer = InMemFileWriter::new(self.page_size);
        p.storage.serialize(writer.writer());
        // The page manager describes its own allocation, so its pages are
        // reserved before it is serialized. The estimate may leave one
        // trailing page unwritten.
        let pages_for_page_manager = p
            .page_manager
            .estimate_pages_needed_for_serialize(self.page_size);
        let range = p
            .page_manager
            .allocate_range(writer.num_pages_to_flush() + pages_for_page_manager)?;
        p.page_manager.serialize(writer.writer());
        writer.flush_into(range, p.shadow, p.main)?;
        Ok(range)
    }

    fn write_database_header(&mut self, header: &DatabaseHeader) -> Result<()> {
        let p = &mut self.parts;
        p.shadow
            .write_page(page::DB_HEADER_PAGE_IDX, &header.serialize(), p.main)
    }

    fn log_checkpoint_and_apply_shadow_pages(&mut self) -> Result<usize> {
        self.fail(FailPoint::BeforeShadowFlush)?;
        self.parts.shadow.flush_all()?;
        self.fail(FailPoint::AfterShadowFlush)?;
        self.parts.wal.log_and_flush_checkpoint()?;
        self.marker_durable = true;
        self.fail(FailPoint::AfterWalMarker)?;
        let applied = self.parts.shadow.apply_shadow_pages(self.parts.main)?;
        for page_idx in &applied {
            self.parts.buffer.evict_page(*page_idx);
        }
        self.fail(FailPoint::AfterApply)?;
        self.parts.wal.clear()?;
        self.parts.shadow.clear()?;
        Ok(applied.len())
    }

    /// Undoes the bookkeeping of a checkpoint that failed before its WAL
    /// marker: pages freed are un-freed, pages allocated are forgotten and
    /// staged shadow pages are dropped.
    pub fn rollback(&mut self) {
        if self.in_memory {
            return;
        }
        self.transition(CheckpointState::RollingBack);
        self.parts.page_manager.rollback_checkpoint();
        self.parts.storage.rollback_checkpoint();
        if let Err(err) = self.parts.shadow.clear() {
            // Leftover shadow content without a marker is discarded at open.
            warn!(error = %err, "checkpoint.rollback.shadow_clear_failed");
            self.parts.shadow.reset();
        }
        self.transition(CheckpointState::Idle);
    }
}

/// Decides before a commit whether the commit should be followed by a
/// checkpoint.
pub fn can_auto_checkpoint(
    config: &SystemConfig,
    in_memory: bool,
    txn: &Transaction<'_>,
    wal: &Wal,
) -> Result<bool> {
    if in_memory || !config.auto_checkpoint || txn.is_recovery() {
        return Ok(false);
    }
    let expected = txn.local_wal().size() + wal.file_size()?;
    Ok(expected > config.checkpoint_threshold)
}

/// State rebuilt from the main file at open.
#[derive(Debug)]
pub struct RecoveredState {
    /// Header read from page 0
    pub header: DatabaseHeader,
    /// Catalog, empty for a logically empty file
    pub catalog: Catalog,
    /// Table storage
    pub storage: StorageManager,
    /// Page allocator
    pub page_manager: PageManager,
}

/// Reads the header and everything it points to. Any mismatch, truncation
/// or checksum failure is returned as an error.
pub fn read_checkpoint(
    main: &dyn FileIo,
    buffer: &BufferManager,
    inline_limit: usize,
    verify_checksums: bool,
) -> Result<RecoveredState> {
    let page_size = buffer.page_size();
    let header = DatabaseHeader::read_from(main, verify_checksums)?;
    if header.page_size != page_size {
        return Err(PenumbraError::InvalidOwned(format!(
            "database was created with page size {}, configured page size is {page_size}",
            header.page_size
        )));
    }
    if header.is_logically_empty() {
        debug!("checkpoint.read.empty");
        return Ok(RecoveredState {
            header,
            catalog: Catalog::new(),
            storage: StorageManager::new(page_size, inline_limit),
            page_manager: PageManager::new(),
        });
    }

    let mut reader = BufferedFileReader::new(main, buffer);
    reader.seek_to_range(header.catalog_page_range)?;
    let catalog_section = reader.read_section()?;
    let catalog = Catalog::deserialize(&mut ByteReader::new(&catalog_section), verify_checksums)?;

    reader.seek_to_range(header.metadata_page_range)?;
    let storage_section = reader.read_section()?;
    let page_manager_section = reader.read_section()?;
    let page_manager =
        PageManager::deserialize(&mut ByteReader::new(&page_manager_section), verify_checksums)?;
    for range in [header.catalog_page_range, header.metadata_page_range] {
        if range.end() > page_manager.num_pages() || page_manager.free_list().overlaps(&range) {
            return Err(PenumbraError::Corruption(
                "header range is not allocated by the page manager",
            ));
        }
    }
    let storage = StorageManager::deserialize(
        &mut ByteReader::new(&storage_section),
        &catalog,
        page_size,
        inline_limit,
        main,
        buffer,
        verify_checksums,
    )?;
    info!(
        tables = catalog.tables().count(),
        indexes = catalog.indexes().count(),
        pages = page_manager.num_pages(),
        "checkpoint.read"
    );
    Ok(RecoveredState {
        header,
        catalog,
        storage,
        page_manager,
    })
}
