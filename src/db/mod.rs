//! The database handle: open and recovery, commit, checkpoint and close.

pub mod config;
mod lifecycle;

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, MutexGuard, RwLock};
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::catalog::Catalog;
use crate::index::{IndexRegistry, Neighbor, SimilarityIndex};
use crate::loader::{self, LoadStatus, LoadTracker};
use crate::primitives::io::{FileIo, IoCounters, IoStats, MemFileIo, MeteredIo, OpenMode, StdFileIo};
use crate::primitives::wal::{self, Wal, WalOptions, WalRecord, WalRecordKind};
use crate::storage::buffer::{BufferManager, BufferStats};
use crate::storage::checkpointer::{
    can_auto_checkpoint, read_checkpoint, CheckpointOutcome, CheckpointParts, Checkpointer,
};
use crate::storage::header::DatabaseHeader;
use crate::storage::manager::StorageManager;
use crate::storage::page_manager::PageManager;
use crate::storage::shadow::ShadowFile;
use crate::storage::table::{TableStorageInfo, Value};
use crate::transaction::{CommitRecord, Op, Transaction, TransactionKind};
use crate::types::{FailPoint, IndexId, PageRange, PenumbraError, Result, TableId, TxnId};

pub use config::{is_in_memory_path, ConfigError, SystemConfig};
pub use lifecycle::LifecycleState;
use lifecycle::Lifecycle;

const MATERIALIZE_ATTEMPTS: usize = 3;

/// Path of the WAL next to the main file.
pub fn wal_path(path: &Path) -> PathBuf {
    sidecar_path(path, "wal")
}

/// Path of the shadow file next to the main file.
pub fn shadow_path(path: &Path) -> PathBuf {
    sidecar_path(path, "shadow")
}

fn sidecar_path(path: &Path, ext: &str) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(".");
    name.push(ext);
    PathBuf::from(name)
}

/// Write-side I/O per file since open.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Serialize)]
pub struct DbIoStats {
    /// Main database file
    pub main: IoStats,
    /// Write-ahead log
    pub wal: IoStats,
    /// Shadow file
    pub shadow: IoStats,
}

impl DbIoStats {
    /// Returns true when no file saw a write, sync or truncate.
    pub fn is_quiet(&self) -> bool {
        self.main.is_quiet() && self.wal.is_quiet() && self.shadow.is_quiet()
    }

    /// Difference between two snapshots.
    pub fn since(&self, earlier: &DbIoStats) -> DbIoStats {
        DbIoStats {
            main: self.main.since(&earlier.main),
            wal: self.wal.since(&earlier.wal),
            shadow: self.shadow.since(&earlier.shadow),
        }
    }
}

/// Where every persisted structure lives, as of the header in effect.
#[derive(Clone, Debug)]
pub struct DatabaseLayout {
    /// Header in effect
    pub header: DatabaseHeader,
    /// Pages tracked by the allocator
    pub num_pages: u32,
    /// Reusable page ranges
    pub free_ranges: Vec<PageRange>,
    /// Ranges freed since the last checkpoint
    pub pending_free: Vec<PageRange>,
    /// Per-table storage infos keyed by table id and name
    pub tables: Vec<(TableId, String, TableStorageInfo)>,
}

#[derive(Default)]
struct DbIoCounters {
    main: Arc<IoCounters>,
    wal: Arc<IoCounters>,
    shadow: Arc<IoCounters>,
}

/// Checkpointed and committed state, guarded together.
pub(crate) struct DbState {
    pub(crate) header: DatabaseHeader,
    pub(crate) catalog: Catalog,
    pub(crate) storage: StorageManager,
    pub(crate) page_manager: PageManager,
    pub(crate) shadow: ShadowFile,
}

/// State shared between the handle, its transactions and the index loader.
pub(crate) struct DbInner {
    config: SystemConfig,
    path: PathBuf,
    in_memory: bool,
    main: Arc<dyn FileIo>,
    wal: Wal,
    buffer: BufferManager,
    state: RwLock<DbState>,
    writer: Mutex<()>,
    registry: IndexRegistry,
    loader: LoadTracker,
    lifecycle: Lifecycle,
    counters: DbIoCounters,
    recovery_required: AtomicBool,
    fail_point: Mutex<Option<FailPoint>>,
    next_txn_id: AtomicU64,
}

impl DbInner {
    pub(crate) fn config(&self) -> &SystemConfig {
        &self.config
    }

    pub(crate) fn loader(&self) -> &LoadTracker {
        &self.loader
    }

    pub(crate) fn registry(&self) -> &IndexRegistry {
        &self.registry
    }

    pub(crate) fn with_state<R>(&self, f: impl FnOnce(&DbState) -> R) -> R {
        f(&self.state.read())
    }

    pub(crate) fn with_state_mut<R>(&self, f: impl FnOnce(&mut DbState) -> R) -> R {
        f(&mut self.state.write())
    }

    pub(crate) fn catalog_snapshot(&self) -> Catalog {
        self.state.read().catalog.clone()
    }

    pub(crate) fn unloaded_indexes(&self) -> Vec<(IndexId, String)> {
        let state = self.state.read();
        state
            .catalog
            .unloaded_indexes()
            .into_iter()
            .filter_map(|id| state.catalog.index(id).map(|e| (id, e.name.clone())))
            .collect()
    }

    pub(crate) fn committed_rows(&self, table: TableId) -> Result<Vec<Vec<Value>>> {
        match self.state.read().storage.table(table) {
            Ok(table) => table.scan(),
            Err(PenumbraError::NotFound) => Ok(Vec::new()),
            Err(err) => Err(err),
        }
    }

    pub(crate) fn committed_rows_by_name(&self, name: &str) -> Result<Vec<Vec<Value>>> {
        let state = self.state.read();
        let entry = state
            .catalog
            .table_by_name(name)
            .ok_or(PenumbraError::NotFound)?;
        state.storage.table(entry.id)?.scan()
    }

    pub(crate) fn transaction<'a>(
        &'a self,
        kind: TransactionKind,
        writer: Option<MutexGuard<'a, ()>>,
    ) -> Transaction<'a> {
        let id = TxnId(self.next_txn_id.fetch_add(1, Ordering::SeqCst));
        Transaction::new(self, id, kind, writer)
    }

    fn ensure_writable(&self) -> Result<()> {
        self.lifecycle.ensure_open()?;
        if self.config.read_only {
            return Err(PenumbraError::ReadOnly);
        }
        if self.recovery_required.load(Ordering::SeqCst) {
            return Err(PenumbraError::RecoveryRequired);
        }
        Ok(())
    }

    /// Logs, applies and (past the threshold) checkpoints a transaction. The
    /// caller holds the writer lock, except during open-time replay.
    pub(crate) fn commit(&self, txn: &Transaction<'_>) -> Result<()> {
        let local_wal = txn.local_wal();
        if local_wal.is_empty() {
            return Ok(());
        }
        if !txn.is_recovery() {
            self.ensure_writable()?;
        }
        let auto_checkpoint = can_auto_checkpoint(&self.config, self.in_memory, txn, &self.wal)?;
        if !self.in_memory && !txn.is_recovery() {
            self.wal.log_commit(&local_wal.payload(txn.id()))?;
        }
        {
            let mut state = self.state.write();
            for op in local_wal.ops() {
                self.apply(&mut state, op)?;
            }
        }
        if auto_checkpoint {
            debug!(txn = %txn.id(), "txn.auto_checkpoint");
            match self.checkpoint_locked() {
                Ok(_) => {}
                Err(PenumbraError::RecoveryRequired) => return Err(PenumbraError::RecoveryRequired),
                // The commit itself is durable in the WAL.
                Err(err) => warn!(txn = %txn.id(), error = %err, "txn.auto_checkpoint_failed"),
            }
        }
        Ok(())
    }

    fn apply(&self, state: &mut DbState, op: &Op) -> Result<()> {
        match op {
            Op::CreateTable { name, columns } => {
                let id = state.catalog.create_table(name, columns.clone())?;
                state.storage.create_table(id, columns.clone());
            }
            Op::DropTable { name } => {
                let (id, indexes) = state.catalog.drop_table(name)?;
                state.storage.drop_table(id, &mut state.page_manager)?;
                for index in indexes {
                    self.registry.remove(index);
                }
            }
            Op::CreateIndex {
                name,
                table,
                config,
            } => {
                state.catalog.create_index(name, table, config.clone())?;
            }
            Op::DropIndex { name } => {
                let id = state.catalog.drop_index(name)?;
                self.registry.remove(id);
            }
            Op::Insert { table, rows } => {
                let id = state
                    .catalog
                    .table_by_name(table)
                    .map(|entry| entry.id)
                    .ok_or(PenumbraError::NotFound)?;
                state.storage.insert(id, rows.clone())?;
                let stale: Vec<IndexId> = state.catalog.indexes_on(id).map(|e| e.id).collect();
                for index in stale {
                    if self.registry.remove(index) {
                        debug!(index = %index, "index.invalidated");
                    }
                    state.catalog.set_index_loaded(index, false)?;
                }
            }
        }
        Ok(())
    }

    /// Runs a checkpoint; the caller holds the writer lock.
    fn checkpoint_locked(&self) -> Result<CheckpointOutcome> {
        if self.config.read_only {
            return Err(PenumbraError::ReadOnly);
        }
        if self.recovery_required.load(Ordering::SeqCst) {
            return Err(PenumbraError::RecoveryRequired);
        }
        let fail_point = *self.fail_point.lock();
        let mut guard = self.state.write();
        let state = &mut *guard;
        let parts = CheckpointParts {
            header: &mut state.header,
            catalog: &mut state.catalog,
            storage: &mut state.storage,
            page_manager: &mut state.page_manager,
            shadow: &mut state.shadow,
            wal: &self.wal,
            main: self.main.as_ref(),
            buffer: &self.buffer,
        };
        let result = Checkpointer::new(parts, self.config.page_size, self.in_memory)
            .with_fail_point(fail_point)
            .write_checkpoint();
        if matches!(result, Err(PenumbraError::RecoveryRequired)) {
            self.recovery_required.store(true, Ordering::SeqCst);
        }
        result
    }

    fn replay(&self, records: &[WalRecord]) -> Result<usize> {
        let mut replayed = 0;
        let mut max_txn = 0;
        for record in records {
            let result = CommitRecord::decode(&record.payload).and_then(|commit| {
                max_txn = max_txn.max(commit.txn_id.0);
                let mut txn = self.transaction(TransactionKind::Recovery, None);
                for op in commit.ops {
                    txn.apply_replayed(op)?;
                }
                txn.commit()
            });
            match result {
                Ok(()) => replayed += 1,
                Err(err) if self.config.throw_on_wal_replay_failure => {
                    warn!(offset = record.offset, error = %err, "recovery.replay_failed");
                    return Err(err);
                }
                Err(err) => {
                    warn!(offset = record.offset, error = %err, "recovery.replay_stopped");
                    if !self.config.read_only {
                        self.wal.truncate_to(record.offset)?;
                    }
                    break;
                }
            }
        }
        self.next_txn_id.fetch_max(max_txn + 1, Ordering::SeqCst);
        if replayed > 0 {
            info!(records = replayed, "recovery.replayed");
        }
        Ok(replayed)
    }

    fn close(&self) -> Result<Option<CheckpointOutcome>> {
        let Some(background) = self.lifecycle.begin_close() else {
            return Ok(None);
        };
        self.loader.cancel();
        if let Some(handle) = background {
            if handle.join().is_err() {
                warn!("db.close.loader_panicked");
            }
        }
        let result = if !self.config.read_only
            && self.config.force_checkpoint_on_close
            && !self.recovery_required.load(Ordering::SeqCst)
        {
            let _writer = self.writer.lock();
            self.checkpoint_locked().map(Some)
        } else {
            Ok(None)
        };
        self.lifecycle.finish_close();
        info!(path = %self.path.display(), "db.close");
        result
    }
}

/// An open database.
///
/// # Example
///
/// ```rust,no_run
/// use penumbra::{Database, SystemConfig};
///
/// let db = Database::open("store.penumbra", SystemConfig::default())?;
/// db.checkpoint()?;
/// db.close()?;
/// # Ok::<(), penumbra::PenumbraError>(())
/// ```
pub struct Database {
    inner: Arc<DbInner>,
}

impl Database {
    /// Opens or creates the database at `path`, redoing an interrupted
    /// checkpoint and replaying committed WAL records.
    pub fn open(path: impl AsRef<Path>, config: SystemConfig) -> Result<Self> {
        config.validate()?;
        let path = path.as_ref();
        if is_in_memory_path(path) {
            if config.read_only {
                return Err(PenumbraError::Invalid(
                    "cannot open an in-memory database under read-only mode",
                ));
            }
            return Self::open_in_memory_with(config);
        }
        if path.is_dir() {
            return Err(PenumbraError::Invalid("database path cannot be a directory"));
        }
        let read_only = config.read_only;
        let exists = fs::metadata(path).map(|m| m.len() > 0).unwrap_or(false);
        if read_only && !exists {
            return Err(PenumbraError::Invalid(
                "cannot create an empty database under read-only mode",
            ));
        }
        let page_size = config.page_size;
        let counters = DbIoCounters::default();
        let mode = if read_only {
            OpenMode::ReadOnly
        } else {
            OpenMode::ReadWriteCreate
        };
        let wal_path = wal_path(path);
        let shadow_path = shadow_path(path);

        let main: Arc<dyn FileIo> = Arc::new(MeteredIo::new(
            Arc::new(StdFileIo::open(path, mode)?),
            Arc::clone(&counters.main),
        ));
        if main.is_empty()? {
            for stale in [&wal_path, &shadow_path] {
                if stale.exists() {
                    warn!(path = %stale.display(), "db.open.stale_sidecar_removed");
                    fs::remove_file(stale)?;
                }
            }
            let header = DatabaseHeader::generate(page_size);
            header.write_initial(main.as_ref())?;
            info!(path = %path.display(), database_id = header.database_id, "db.create");
        }
        let header = DatabaseHeader::read_from(main.as_ref(), config.enable_checksums)?;

        let wal_io = open_sidecar(&wal_path, read_only, wal::FILE_HEADER_LEN as u64)?;
        let wal = Wal::open(
            Arc::new(MeteredIo::new(wal_io, Arc::clone(&counters.wal))),
            WalOptions {
                page_size,
                database_id: header.database_id,
                verify_checksums: config.enable_checksums,
            },
        )?;
        let shadow_io = open_sidecar(&shadow_path, read_only, 1)?;
        let mut shadow = ShadowFile::new(
            Arc::new(MeteredIo::new(shadow_io, Arc::clone(&counters.shadow))),
            page_size,
            header.database_id,
        );
        let buffer = BufferManager::new(config.buffer_pool_pages, page_size);

        let to_replay = recover_files(&wal, &mut shadow, main.as_ref(), &buffer, read_only)?;
        let recovered = read_checkpoint(
            main.as_ref(),
            &buffer,
            config.overflow_inline_limit,
            config.enable_checksums,
        )?;

        let db = Self::from_parts(
            config,
            path.to_path_buf(),
            false,
            main,
            wal,
            buffer,
            DbState {
                header: recovered.header,
                catalog: recovered.catalog,
                storage: recovered.storage,
                page_manager: recovered.page_manager,
                shadow,
            },
            counters,
        );
        let replayed = db.inner.replay(&to_replay)?;
        if replayed > 0 && !read_only {
            let _writer = db.inner.writer.lock();
            db.inner.checkpoint_locked()?;
        }
        {
            let state = db.inner.state.read();
            info!(
                path = %path.display(),
                read_only,
                tables = state.catalog.tables().count(),
                indexes = state.catalog.indexes().count(),
                "db.open"
            );
        }
        if db.inner.config.background_index_load {
            db.start_index_load()?;
        }
        Ok(db)
    }

    /// Opens a fresh in-memory database with default settings.
    pub fn open_in_memory() -> Result<Self> {
        Self::open_in_memory_with(SystemConfig::default())
    }

    /// Opens a fresh in-memory database. Checkpoints are skipped and nothing
    /// reaches a file.
    pub fn open_in_memory_with(config: SystemConfig) -> Result<Self> {
        config.validate()?;
        if config.read_only {
            return Err(PenumbraError::Invalid(
                "cannot open an in-memory database under read-only mode",
            ));
        }
        let page_size = config.page_size;
        let counters = DbIoCounters::default();
        let main: Arc<dyn FileIo> = Arc::new(MemFileIo::new());
        let header = DatabaseHeader::generate(page_size);
        header.write_initial(main.as_ref())?;
        let wal = Wal::open(
            Arc::new(MemFileIo::new()),
            WalOptions::new(page_size, header.database_id),
        )?;
        let shadow = ShadowFile::new(Arc::new(MemFileIo::new()), page_size, header.database_id);
        let buffer = BufferManager::new(config.buffer_pool_pages, page_size);
        let inline_limit = config.overflow_inline_limit;
        let background = config.background_index_load;
        let db = Self::from_parts(
            config,
            PathBuf::from(":memory:"),
            true,
            main,
            wal,
            buffer,
            DbState {
                header,
                catalog: Catalog::new(),
                storage: StorageManager::new(page_size, inline_limit),
                page_manager: PageManager::new(),
                shadow,
            },
            counters,
        );
        if background {
            db.start_index_load()?;
        }
        Ok(db)
    }

    #[allow(clippy::too_many_arguments)]
    fn from_parts(
        config: SystemConfig,
        path: PathBuf,
        in_memory: bool,
        main: Arc<dyn FileIo>,
        wal: Wal,
        buffer: BufferManager,
        state: DbState,
        counters: DbIoCounters,
    ) -> Self {
        Self {
            inner: Arc::new(DbInner {
                config,
                path,
                in_memory,
                main,
                wal,
                buffer,
                state: RwLock::new(state),
                writer: Mutex::new(()),
                registry: IndexRegistry::new(),
                loader: LoadTracker::default(),
                lifecycle: Lifecycle::new(),
                counters,
                recovery_required: AtomicBool::new(false),
                fail_point: Mutex::new(None),
                next_txn_id: AtomicU64::new(1),
            }),
        }
    }

    /// Starts a read-only transaction.
    pub fn begin_read(&self) -> Result<Transaction<'_>> {
        self.inner.lifecycle.ensure_open()?;
        Ok(self.inner.transaction(TransactionKind::ReadOnly, None))
    }

    /// Starts a write transaction, blocking while another one is open.
    pub fn begin_write(&self) -> Result<Transaction<'_>> {
        self.inner.ensure_writable()?;
        let writer = self.inner.writer.lock();
        self.inner.ensure_writable()?;
        Ok(self.inner.transaction(TransactionKind::Write, Some(writer)))
    }

    /// Checkpoints now. Blocks while a write transaction is open, so it must
    /// not be called from a thread holding one.
    pub fn checkpoint(&self) -> Result<CheckpointOutcome> {
        self.inner.lifecycle.ensure_open()?;
        let _writer = self.inner.writer.lock();
        self.inner.checkpoint_locked()
    }

    /// Closes the database: cancels and joins the index loader, then
    /// checkpoints unless read-only, disabled by
    /// [`SystemConfig::force_checkpoint_on_close`] or recovery is required.
    pub fn close(self) -> Result<Option<CheckpointOutcome>> {
        self.inner.close()
    }

    /// Returns true after a checkpoint failed inside the crash window. The
    /// database then refuses writes until it is reopened.
    pub fn needs_recovery(&self) -> bool {
        self.inner.recovery_required.load(Ordering::SeqCst)
    }

    /// Settings in effect.
    pub fn config(&self) -> &SystemConfig {
        &self.inner.config
    }

    /// Path of the main file (`:memory:` for in-memory databases).
    pub fn path(&self) -> &Path {
        &self.inner.path
    }

    /// Returns true for in-memory databases.
    pub fn is_in_memory(&self) -> bool {
        self.inner.in_memory
    }

    /// Returns true when opened read-only.
    pub fn is_read_only(&self) -> bool {
        self.inner.config.read_only
    }

    /// Current lifecycle state.
    pub fn lifecycle_state(&self) -> LifecycleState {
        self.inner.lifecycle.state()
    }

    /// Copy of the committed catalog.
    pub fn catalog(&self) -> Catalog {
        self.inner.catalog_snapshot()
    }

    /// Header currently in effect.
    pub fn header(&self) -> DatabaseHeader {
        self.inner.state.read().header
    }

    /// Snapshot of the allocator and every table's storage info.
    pub fn layout(&self) -> DatabaseLayout {
        let state = self.inner.state.read();
        let tables = state
            .storage
            .tables()
            .map(|table| {
                let name = state
                    .catalog
                    .table(table.id())
                    .map(|entry| entry.name.clone())
                    .unwrap_or_default();
                (table.id(), name, table.storage_info())
            })
            .collect();
        DatabaseLayout {
            header: state.header,
            num_pages: state.page_manager.num_pages(),
            free_ranges: state.page_manager.free_list().ranges().to_vec(),
            pending_free: state.page_manager.uncheckpointed_free().to_vec(),
            tables,
        }
    }

    /// Committed rows of `table`.
    pub fn table_rows(&self, table: &str) -> Result<Vec<Vec<Value>>> {
        self.inner.committed_rows_by_name(table)
    }

    /// Write-side I/O since open.
    pub fn io_stats(&self) -> DbIoStats {
        let counters = &self.inner.counters;
        DbIoStats {
            main: counters.main.snapshot(),
            wal: counters.wal.snapshot(),
            shadow: counters.shadow.snapshot(),
        }
    }

    /// Page cache counters.
    pub fn buffer_stats(&self) -> BufferStats {
        self.inner.buffer.stats()
    }

    /// Current WAL file size in bytes.
    pub fn wal_size(&self) -> Result<u64> {
        self.inner.wal.file_size()
    }

    /// Stops the next checkpoints at `fail_point`.
    #[doc(hidden)]
    pub fn set_fail_point(&self, fail_point: Option<FailPoint>) {
        *self.inner.fail_point.lock() = fail_point;
    }

    /// The `k` rows closest to `query` under index `index`. Materializes the
    /// index first if no background pass has done so.
    pub fn similarity_search(&self, index: &str, query: &[f32], k: usize) -> Result<Vec<Neighbor>> {
        self.materialized(index)?.search(query, k)
    }

    /// Materializes index `name` now if needed; returns the number of
    /// indexed vectors.
    pub fn load_index(&self, name: &str) -> Result<usize> {
        Ok(self.materialized(name)?.len())
    }

    fn materialized(&self, index: &str) -> Result<Arc<SimilarityIndex>> {
        self.inner.lifecycle.ensure_open()?;
        let id = self
            .inner
            .state
            .read()
            .catalog
            .index_by_name(index)
            .map(|entry| entry.id)
            .ok_or_else(|| PenumbraError::InvalidOwned(format!("index {index} does not exist")))?;
        for _ in 0..MATERIALIZE_ATTEMPTS {
            if let Some(materialized) = self.inner.registry.get(id) {
                return Ok(materialized);
            }
            if let Some(materialized) = loader::materialize(&self.inner, id)? {
                return Ok(materialized);
            }
        }
        Err(PenumbraError::InvalidOwned(format!(
            "index {index} kept changing while it was built"
        )))
    }

    /// Starts a background pass over unloaded indexes. Returns false when
    /// the database is closing or a pass is already running.
    pub fn start_index_load(&self) -> Result<bool> {
        let inner = Arc::clone(&self.inner);
        self.inner.lifecycle.spawn_background(
            "penumbra-index-loader",
            || self.inner.loader.begin(),
            move || loader::run(inner),
        )
    }

    /// Status of the background index load.
    pub fn index_load_status(&self) -> LoadStatus {
        self.inner.loader.status()
    }

    /// Returns true once a load finished, ready or failed.
    pub fn is_indexes_loaded(&self) -> bool {
        self.inner.loader.status().is_finished()
    }

    /// Returns true once a load finished without failures.
    pub fn is_indexes_ready(&self) -> bool {
        self.inner.loader.status() == LoadStatus::Ready
    }

    /// Blocks while a load is running, up to `timeout`.
    pub fn wait_for_index_load(&self, timeout: Duration) -> LoadStatus {
        self.inner.loader.wait(timeout)
    }

    /// Registers a one-shot completion callback `(success, error)`. It fires
    /// immediately when a load already finished and never for a cancelled
    /// load.
    pub fn set_index_load_callback<F>(&self, callback: F)
    where
        F: FnOnce(bool, Option<&str>) + Send + 'static,
    {
        self.inner.loader.set_callback(Box::new(callback));
    }

    /// Returns true when index `name` is materialized in memory.
    pub fn is_index_materialized(&self, name: &str) -> bool {
        self.inner
            .state
            .read()
            .catalog
            .index_by_name(name)
            .is_some_and(|entry| entry.is_loaded())
    }
}

impl Drop for Database {
    fn drop(&mut self) {
        // Best effort: close errors are logged and swallowed.
        if let Err(err) = self.inner.close() {
            warn!(error = %err, path = %self.inner.path.display(), "db.close.best_effort_failed");
        }
    }
}

/// Opens a WAL or shadow file. A read-only open never creates or rewrites
/// one: a missing or shorter-than-`min_len` file is replaced by an empty
/// in-memory file.
fn open_sidecar(path: &Path, read_only: bool, min_len: u64) -> Result<Arc<dyn FileIo>> {
    if read_only {
        let usable = fs::metadata(path).map(|m| m.len() >= min_len).unwrap_or(false);
        if !usable {
            return Ok(Arc::new(MemFileIo::new()));
        }
        return Ok(Arc::new(StdFileIo::open(path, OpenMode::ReadOnly)?));
    }
    Ok(Arc::new(StdFileIo::open(path, OpenMode::ReadWriteCreate)?))
}

/// Brings the main file, WAL and shadow file into agreement and returns the
/// commit records that still need replay.
///
/// A checkpoint marker means the shadow file was durable and validated, so
/// its pages are applied again. An empty shadow file next to a marker means
/// the apply already finished. Without a marker any shadow content is a
/// torn checkpoint and is discarded.
///
/// The WAL is cleared before the shadow file, as in a checkpoint, so a crash
/// anywhere in here is redone by the next open.
fn recover_files(
    wal: &Wal,
    shadow: &mut ShadowFile,
    main: &dyn FileIo,
    buffer: &BufferManager,
    read_only: bool,
) -> Result<Vec<WalRecord>> {
    let scan = wal.scan()?;
    let is_commit = |record: &WalRecord| record.kind == WalRecordKind::Commit;
    match scan.last_checkpoint_marker() {
        Some(marker) => {
            if read_only {
                return Err(PenumbraError::RecoveryRequired);
            }
            // A checkpoint holds the writer lock until the WAL is cleared, so
            // nothing can be committed behind its marker.
            let late_commits = scan.records[marker + 1..]
                .iter()
                .filter(|record| is_commit(record))
                .count();
            if late_commits > 0 {
                return Err(PenumbraError::CorruptionOwned(format!(
                    "{late_commits} commit records follow the checkpoint marker"
                )));
            }
            if shadow.has_durable_content()? {
                let pages = shadow.load_flushed()?;
                for page_idx in shadow.apply_shadow_pages(main)? {
                    buffer.evict_page(page_idx);
                }
                buffer.remove_evicted_candidates();
                info!(pages, "recovery.redo_shadow");
            } else {
                info!("recovery.shadow_already_applied");
            }
            wal.clear()?;
            shadow.clear()?;
            Ok(Vec::new())
        }
        None => {
            if !read_only {
                if shadow.has_durable_content()? {
                    warn!("recovery.discard_shadow");
                    shadow.clear()?;
                }
                if scan.torn_bytes > 0 {
                    wal.truncate_to(scan.valid_up_to)?;
                }
            }
            Ok(scan.records.into_iter().filter(is_commit).collect())
        }
    }
}
