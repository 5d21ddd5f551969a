//! Background materialization of similarity indexes.
//!
//! One load task runs at a time. It claims indexes through an atomic counter
//! shared by a bounded set of scoped workers; each worker sends one result
//! per claimed index over a channel. A claimed index is never retried.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{mpsc, Arc};
use std::thread;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::db::DbInner;
use crate::index::SimilarityIndex;
use crate::storage::table::ColumnType;
use crate::transaction::TransactionKind;
use crate::types::{IndexId, PenumbraError, Result};

/// Progress of the background index load.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", content = "error", rename_all = "snake_case")]
pub enum LoadStatus {
    /// No load has started
    Idle,
    /// A load is running
    Loading,
    /// Every unloaded index was materialized
    Ready,
    /// The load finished but at least one index failed
    Failed(String),
    /// The load was cancelled by close
    Cancelled,
}

impl LoadStatus {
    /// True once a load has finished, successfully or not.
    pub fn is_finished(&self) -> bool {
        matches!(self, LoadStatus::Ready | LoadStatus::Failed(_))
    }
}

/// Completion callback: `(success, error message)`.
pub type LoadCallback = Box<dyn FnOnce(bool, Option<&str>) + Send + 'static>;

struct TrackerState {
    status: LoadStatus,
    callback: Option<LoadCallback>,
}

/// Shared status, completion callback and cancellation flag of the loader.
pub(crate) struct LoadTracker {
    state: Mutex<TrackerState>,
    done: Condvar,
    cancel: AtomicBool,
}

impl Default for LoadTracker {
    fn default() -> Self {
        Self {
            state: Mutex::new(TrackerState {
                status: LoadStatus::Idle,
                callback: None,
            }),
            done: Condvar::new(),
            cancel: AtomicBool::new(false),
        }
    }
}

impl LoadTracker {
    pub(crate) fn status(&self) -> LoadStatus {
        self.state.lock().status.clone()
    }

    pub(crate) fn begin(&self) {
        self.cancel.store(false, Ordering::SeqCst);
        self.state.lock().status = LoadStatus::Loading;
    }

    pub(crate) fn cancel(&self) {
        self.cancel.store(true, Ordering::SeqCst);
    }

    pub(crate) fn is_cancelled(&self) -> bool {
        self.cancel.load(Ordering::SeqCst)
    }

    /// Records the final status and fires the callback outside the lock.
    pub(crate) fn finish(&self, status: LoadStatus) {
        let callback = {
            let mut state = self.state.lock();
            state.status = status.clone();
            if status.is_finished() {
                state.callback.take()
            } else {
                None
            }
        };
        self.done.notify_all();
        if let Some(callback) = callback {
            fire(callback, &status);
        }
    }

    /// Registers the one-shot callback; fires it at once when a load already
    /// finished.
    pub(crate) fn set_callback(&self, callback: LoadCallback) {
        let mut state = self.state.lock();
        if state.status.is_finished() {
            let status = state.status.clone();
            drop(state);
            fire(callback, &status);
        } else {
            state.callback = Some(callback);
        }
    }

    /// Blocks while a load is running, up to `timeout`.
    pub(crate) fn wait(&self, timeout: Duration) -> LoadStatus {
        let deadline = Instant::now() + timeout;
        let mut state = self.state.lock();
        while state.status == LoadStatus::Loading {
            if self.done.wait_until(&mut state, deadline).timed_out() {
                break;
            }
        }
        state.status.clone()
    }
}

fn fire(callback: LoadCallback, status: &LoadStatus) {
    match status {
        LoadStatus::Failed(reason) => callback(false, Some(reason)),
        _ => callback(true, None),
    }
}

/// Body of the background task.
pub(crate) fn run(db: Arc<DbInner>) {
    let status = load_all(&db);
    match &status {
        LoadStatus::Ready => info!("loader.ready"),
        LoadStatus::Failed(reason) => warn!(%reason, "loader.failed"),
        LoadStatus::Cancelled => info!("loader.cancelled"),
        _ => {}
    }
    db.loader().finish(status);
}

fn load_all(db: &DbInner) -> LoadStatus {
    let tracker = db.loader();
    if tracker.is_cancelled() {
        return LoadStatus::Cancelled;
    }
    let txn = db.transaction(TransactionKind::ReadOnly, None);
    let pending = db.unloaded_indexes();
    if pending.is_empty() {
        txn.rollback();
        return LoadStatus::Ready;
    }
    let workers = db.config().loader_threads().min(pending.len()).max(1);
    info!(indexes = pending.len(), workers, "loader.start");

    let next = AtomicUsize::new(0);
    let (tx, rx) = mpsc::channel::<(String, Result<()>)>();
    thread::scope(|scope| {
        for worker in 0..workers {
            let tx = tx.clone();
            let next = &next;
            let pending = &pending;
            scope.spawn(move || loop {
                if tracker.is_cancelled() {
                    break;
                }
                let claimed = next.fetch_add(1, Ordering::SeqCst);
                let Some((id, name)) = pending.get(claimed) else {
                    break;
                };
                if tracker.is_cancelled() {
                    break;
                }
                debug!(worker, index = %name, "loader.materialize");
                let result = materialize(db, *id).map(|_| ());
                if tx.send((name.clone(), result)).is_err() {
                    break;
                }
            });
        }
    });
    drop(tx);

    let failures: Vec<String> = rx
        .into_iter()
        .filter_map(|(name, result)| result.err().map(|err| format!("  - {name}: {err}")))
        .collect();
    if tracker.is_cancelled() {
        txn.rollback();
        return LoadStatus::Cancelled;
    }
    if let Err(err) = txn.commit() {
        return LoadStatus::Failed(err.to_string());
    }
    if failures.is_empty() {
        LoadStatus::Ready
    } else {
        LoadStatus::Failed(format!(
            "similarity index loading failed:\n{}",
            failures.join("\n")
        ))
    }
}

/// Builds index `id` from committed rows and registers it. Returns `None`
/// when the table or the index changed while the graph was being built; the
/// stale build is discarded.
pub(crate) fn materialize(db: &DbInner, id: IndexId) -> Result<Option<Arc<SimilarityIndex>>> {
    let (config, dimension, table, rows_at_start, input) = db.with_state(|state| -> Result<_> {
        let entry = state.catalog.index(id).ok_or(PenumbraError::NotFound)?;
        let config = entry.aux_info()?.clone();
        let table = state.storage.table(entry.table)?;
        let col = table.column_index(&config.column).ok_or_else(|| {
            PenumbraError::CorruptionOwned(format!(
                "index {} names missing column {}",
                entry.name, config.column
            ))
        })?;
        let ColumnType::FloatVector(dimension) = table.columns()[col].ty else {
            return Err(PenumbraError::CorruptionOwned(format!(
                "index {} is over non-vector column {}",
                entry.name, config.column
            )));
        };
        let input: Vec<(u64, Vec<f32>)> = table
            .vector_column(col)?
            .into_iter()
            .enumerate()
            .filter_map(|(row, v)| v.map(|v| (row as u64, v)))
            .collect();
        Ok((config, dimension as usize, entry.table, table.num_rows(), input))
    })?;

    let index = SimilarityIndex::build(config, dimension, input)?;

    db.with_state_mut(|state| -> Result<_> {
        let unchanged = state.catalog.index(id).is_some_and(|e| e.table == table)
            && state
                .storage
                .table(table)
                .is_ok_and(|t| t.num_rows() == rows_at_start);
        if !unchanged {
            debug!(index = %id, "loader.stale_build");
            return Ok(None);
        }
        let index = db.registry().insert(id, index);
        state.catalog.set_index_loaded(id, true)?;
        Ok(Some(index))
    })
}
