use std::collections::VecDeque;
use std::sync::Arc;

use parking_lot::Mutex;
use rustc_hash::{FxHashMap, FxHashSet};
use serde::Serialize;
use tracing::trace;

use crate::primitives::io::FileIo;
use crate::types::{PageIdx, PenumbraError, Result};

/// Counters reported by [`BufferManager::stats`].
#[derive(Clone, Copy, Debug, Default, Serialize)]
pub struct BufferStats {
    /// Reads served from the cache
    pub hits: u64,
    /// Reads that went to the file
    pub misses: u64,
    /// Frames dropped to stay under capacity
    pub evictions: u64,
    /// Frames dropped because their page was freed or overwritten
    pub invalidations: u64,
}

struct Inner {
    frames: FxHashMap<PageIdx, Arc<[u8]>>,
    candidates: VecDeque<PageIdx>,
    stats: BufferStats,
}

/// Bounded cache of main-file pages with a FIFO eviction-candidate queue.
///
/// Invalidating a page drops its frame but leaves its queue entry behind; if
/// the page is cached again the queue holds it twice until
/// [`BufferManager::remove_evicted_candidates`] runs.
pub struct BufferManager {
    capacity: usize,
    page_size: u32,
    inner: Mutex<Inner>,
}

impl BufferManager {
    /// Creates a cache holding at most `capacity` pages.
    pub fn new(capacity: usize, page_size: u32) -> Self {
        Self {
            capacity: capacity.max(1),
            page_size,
            inner: Mutex::new(Inner {
                frames: FxHashMap::default(),
                candidates: VecDeque::new(),
                stats: BufferStats::default(),
            }),
        }
    }

    /// Page size of cached frames.
    pub fn page_size(&self) -> u32 {
        self.page_size
    }

    /// Returns page `idx`, reading it from `io` on a miss.
    pub fn read_page(&self, io: &dyn FileIo, idx: PageIdx) -> Result<Arc<[u8]>> {
        if !idx.is_valid() {
            return Err(PenumbraError::Invalid("read of invalid page index"));
        }
        {
            let mut inner = self.inner.lock();
            if let Some(frame) = inner.frames.get(&idx).cloned() {
                inner.stats.hits += 1;
                return Ok(frame);
            }
        }
        let mut buf = vec![0u8; self.page_size as usize];
        io.read_at(idx.byte_offset(self.page_size), &mut buf)
            .map_err(|err| match err {
                PenumbraError::Io(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                    PenumbraError::CorruptionOwned(format!("page {} is past the end of the file", idx.0))
                }
                other => other,
            })?;
        let frame: Arc<[u8]> = Arc::from(buf);
        let mut inner = self.inner.lock();
        inner.stats.misses += 1;
        inner.frames.insert(idx, Arc::clone(&frame));
        inner.candidates.push_back(idx);
        while inner.frames.len() > self.capacity {
            let Some(victim) = inner.candidates.pop_front() else {
                break;
            };
            if victim != idx && inner.frames.remove(&victim).is_some() {
                inner.stats.evictions += 1;
                trace!(page = victim.0, "buffer.evict");
            } else if victim == idx {
                inner.candidates.push_back(victim);
            }
        }
        Ok(frame)
    }

    /// Drops the cached frame of `idx`; its queue entry stays as a stale
    /// candidate.
    pub fn evict_page(&self, idx: PageIdx) -> bool {
        let mut inner = self.inner.lock();
        let removed = inner.frames.remove(&idx).is_some();
        if removed {
            inner.stats.invalidations += 1;
        }
        removed
    }

    /// Removes queue entries whose frame is gone and duplicate entries of the
    /// same page. Returns the number of entries dropped.
    pub fn remove_evicted_candidates(&self) -> usize {
        let mut inner = self.inner.lock();
        let before = inner.candidates.len();
        let mut seen = FxHashSet::default();
        let frames = std::mem::take(&mut inner.frames);
        let mut kept: VecDeque<PageIdx> = VecDeque::with_capacity(before);
        // Keep the newest entry of each page so FIFO order reflects the last read.
        for idx in inner.candidates.iter().rev() {
            if frames.contains_key(idx) && seen.insert(*idx) {
                kept.push_front(*idx);
            }
        }
        inner.frames = frames;
        inner.candidates = kept;
        before - inner.candidates.len()
    }

    /// Returns true when `idx` has a cached frame.
    pub fn contains(&self, idx: PageIdx) -> bool {
        self.inner.lock().frames.contains_key(&idx)
    }

    /// Cached frames.
    pub fn cached_pages(&self) -> usize {
        self.inner.lock().frames.len()
    }

    /// Entries in the eviction-candidate queue, stale ones included.
    pub fn candidate_queue_len(&self) -> usize {
        self.inner.lock().candidates.len()
    }

    /// Copy of the counters.
    pub fn stats(&self) -> BufferStats {
        self.inner.lock().stats
    }
}
