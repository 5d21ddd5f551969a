use std::thread::{self, JoinHandle};

use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::types::{PenumbraError, Result};

/// Open → Closing → Closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleState {
    /// Accepting work
    Open,
    /// Close has begun; no new background work may start
    Closing,
    /// Closed
    Closed,
}

struct Inner {
    state: LifecycleState,
    background: Option<JoinHandle<()>>,
}

/// Guards the lifecycle flag together with the background task handle, so
/// starting a task and beginning a close can never interleave.
pub(crate) struct Lifecycle {
    inner: Mutex<Inner>,
}

impl Lifecycle {
    pub(crate) fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                state: LifecycleState::Open,
                background: None,
            }),
        }
    }

    pub(crate) fn state(&self) -> LifecycleState {
        self.inner.lock().state
    }

    pub(crate) fn ensure_open(&self) -> Result<()> {
        match self.state() {
            LifecycleState::Open => Ok(()),
            LifecycleState::Closing | LifecycleState::Closed => Err(PenumbraError::Closed),
        }
    }

    /// Spawns `task` if the database is open and no task is running.
    /// `before_spawn` runs under the same lock, right before the thread
    /// starts. Returns whether a task was started.
    pub(crate) fn spawn_background<P, F>(&self, name: &str, before_spawn: P, task: F) -> Result<bool>
    where
        P: FnOnce(),
        F: FnOnce() + Send + 'static,
    {
        let mut inner = self.inner.lock();
        if inner.state != LifecycleState::Open {
            debug!(task = name, state = ?inner.state, "lifecycle.spawn_refused");
            return Ok(false);
        }
        if let Some(handle) = inner.background.take() {
            if !handle.is_finished() {
                inner.background = Some(handle);
                return Ok(false);
            }
            if handle.join().is_err() {
                warn!(task = name, "lifecycle.background_panicked");
            }
        }
        before_spawn();
        let handle = thread::Builder::new()
            .name(name.to_string())
            .spawn(task)?;
        inner.background = Some(handle);
        Ok(true)
    }

    /// Moves Open to Closing and hands back the background task to join.
    /// Returns `None` when a close already began.
    pub(crate) fn begin_close(&self) -> Option<Option<JoinHandle<()>>> {
        let mut inner = self.inner.lock();
        if inner.state != LifecycleState::Open {
            return None;
        }
        inner.state = LifecycleState::Closing;
        Some(inner.background.take())
    }

    pub(crate) fn finish_close(&self) {
        self.inner.lock().state = LifecycleState::Closed;
    }
}
