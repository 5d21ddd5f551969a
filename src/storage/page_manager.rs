use tracing::trace;

use crate::primitives::bytes::{tag, ByteReader, ByteWriter, SECTION_HEADER_LEN};
use crate::types::{page, PageIdx, PageRange, PenumbraError, Result};

const PAGE_MANAGER_TAG: u32 = tag(*b"PGMG");

/// Sorted, coalesced set of free page ranges.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct FreeList {
    ranges: Vec<PageRange>,
}

impl FreeList {
    /// Builds a list from arbitrary ranges, merging neighbours.
    pub fn from_ranges(ranges: Vec<PageRange>) -> Self {
        let mut list = Self { ranges };
        list.rebuild();
        list
    }

    /// Free ranges in page order.
    pub fn ranges(&self) -> &[PageRange] {
        &self.ranges
    }

    /// Total free pages.
    pub fn total_pages(&self) -> u64 {
        self.ranges.iter().map(|r| u64::from(r.num_pages)).sum()
    }

    /// Returns true when `range` shares a page with any free range.
    pub fn overlaps(&self, range: &PageRange) -> bool {
        self.ranges.iter().any(|r| r.overlaps(range))
    }

    fn insert(&mut self, range: PageRange) {
        self.ranges.push(range);
        self.rebuild();
    }

    /// Takes `n` pages from the lowest free range large enough.
    fn take(&mut self, n: u32) -> Option<PageRange> {
        let pos = self.ranges.iter().position(|r| r.num_pages >= n)?;
        let range = &mut self.ranges[pos];
        let out = PageRange::new(range.start, n);
        if range.num_pages == n {
            self.ranges.remove(pos);
        } else {
            range.start = PageIdx(range.start.0 + n);
            range.num_pages -= n;
        }
        Some(out)
    }

    fn rebuild(&mut self) {
        self.ranges.retain(|r| r.is_valid() && r.num_pages > 0);
        self.ranges.sort_by_key(|r| r.start.0);
        let mut merged: Vec<PageRange> = Vec::with_capacity(self.ranges.len());
        for range in self.ranges.drain(..) {
            if let Some(last) = merged.last_mut() {
                if last.end() == range.start.0 {
                    last.num_pages += range.num_pages;
                    continue;
                }
            }
            merged.push(range);
        }
        self.ranges = merged;
    }
}

/// What the page manager persists: the file high-water mark and the free list.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct PageManagerImage {
    /// Pages tracked by the allocator, page 0 included
    pub num_pages: u32,
    /// Pages reusable by later allocations
    pub free: FreeList,
}

#[derive(Clone, Debug)]
struct Snapshot {
    num_pages: u32,
    free: FreeList,
    uncheckpointed_free: Vec<PageRange>,
    changed: bool,
}

/// Tracks used and free pages of the main file.
///
/// Freed pages are parked until the next successful checkpoint so a page is
/// never reused before the checkpoint that released it is durable.
#[derive(Debug)]
pub struct PageManager {
    num_pages: u32,
    free: FreeList,
    uncheckpointed_free: Vec<PageRange>,
    changed: bool,
    version: u64,
    snapshot: Option<Snapshot>,
}

impl Default for PageManager {
    fn default() -> Self {
        Self::new()
    }
}

impl PageManager {
    /// Allocator for a fresh file; page 0 is reserved for the database header.
    pub fn new() -> Self {
        Self {
            num_pages: 1,
            free: FreeList::default(),
            uncheckpointed_free: Vec::new(),
            changed: false,
            version: 0,
            snapshot: None,
        }
    }

    /// Pages tracked by the allocator.
    pub fn num_pages(&self) -> u32 {
        self.num_pages
    }

    /// Reusable free pages.
    pub fn free_list(&self) -> &FreeList {
        &self.free
    }

    /// Ranges freed since the last checkpoint, not yet reusable.
    pub fn uncheckpointed_free(&self) -> &[PageRange] {
        &self.uncheckpointed_free
    }

    /// Number of successful checkpoints observed.
    pub fn version(&self) -> u64 {
        self.version
    }

    /// Allocates `n` contiguous pages, reusing free space first and growing
    /// the file otherwise. Zero pages yields [`PageRange::INVALID`].
    pub fn allocate_range(&mut self, n: u32) -> Result<PageRange> {
        if n == 0 {
            return Ok(PageRange::INVALID);
        }
        let range = match self.free.take(n) {
            Some(range) => range,
            None => {
                let end = self
                    .num_pages
                    .checked_add(n)
                    .filter(|end| *end < PageIdx::INVALID.0)
                    .ok_or(PenumbraError::Invalid("page index space exhausted"))?;
                let range = PageRange::new(PageIdx(self.num_pages), n);
                self.num_pages = end;
                range
            }
        };
        self.changed = true;
        trace!(start = range.start.0, pages = n, "page_manager.allocate");
        Ok(range)
    }

    /// Marks `range` reclaimable once the next checkpoint succeeds.
    pub fn free(&mut self, range: PageRange) -> Result<()> {
        if !range.is_valid() || range.num_pages == 0 {
            return Ok(());
        }
        if range.start == page::DB_HEADER_PAGE_IDX || range.end() > self.num_pages {
            return Err(PenumbraError::Corruption(
                "freed range outside allocated pages",
            ));
        }
        if self.free.overlaps(&range) || self.uncheckpointed_free.iter().any(|r| r.overlaps(&range))
        {
            return Err(PenumbraError::Corruption("page range freed twice"));
        }
        self.uncheckpointed_free.push(range);
        self.changed = true;
        trace!(start = range.start.0, pages = range.num_pages, "page_manager.free");
        Ok(())
    }

    /// Records the state a failed checkpoint must return to.
    pub fn begin_checkpoint(&mut self) {
        self.snapshot = Some(Snapshot {
            num_pages: self.num_pages,
            free: self.free.clone(),
            uncheckpointed_free: self.uncheckpointed_free.clone(),
            changed: self.changed,
        });
    }

    /// Un-frees pages freed and forgets pages allocated since
    /// [`PageManager::begin_checkpoint`].
    pub fn rollback_checkpoint(&mut self) {
        if let Some(snapshot) = self.snapshot.take() {
            self.num_pages = snapshot.num_pages;
            self.free = snapshot.free;
            self.uncheckpointed_free = snapshot.uncheckpointed_free;
            self.changed = snapshot.changed;
        }
    }

    /// Drops the snapshot of a checkpoint that turned out to have nothing to
    /// write.
    pub fn discard_checkpoint(&mut self) {
        self.snapshot = None;
    }

    /// Makes pages freed before this checkpoint reusable and returns them so
    /// cached copies can be evicted.
    pub fn finalize_checkpoint(&mut self) -> Vec<PageIdx> {
        self.snapshot = None;
        let freed: Vec<PageIdx> = self
            .uncheckpointed_free
            .iter()
            .flat_map(|r| r.iter_pages().collect::<Vec<_>>())
            .collect();
        if !self.uncheckpointed_free.is_empty() {
            let parked = std::mem::take(&mut self.uncheckpointed_free);
            let mut ranges = self.free.ranges().to_vec();
            ranges.extend(parked);
            self.free = FreeList::from_ranges(ranges);
        }
        freed
    }

    /// True when pages were allocated or freed since the last checkpoint.
    pub fn changed_since_last_checkpoint(&self) -> bool {
        self.changed
    }

    /// Clears the change flag after a successful checkpoint.
    pub fn reset_version(&mut self) {
        self.changed = false;
        self.version += 1;
    }

    /// The state [`PageManager::serialize`] persists.
    pub fn image(&self) -> PageManagerImage {
        let mut ranges = self.free.ranges().to_vec();
        ranges.extend(self.uncheckpointed_free.iter().copied());
        PageManagerImage {
            num_pages: self.num_pages,
            free: FreeList::from_ranges(ranges),
        }
    }

    /// Pages the serialized form needs right now. Later allocations can only
    /// shrink or keep the free-range count, so this never underestimates.
    pub fn estimate_pages_needed_for_serialize(&self, page_size: u32) -> u32 {
        let ranges = self.free.ranges().len() + self.uncheckpointed_free.len();
        let bytes = SECTION_HEADER_LEN + 8 + ranges * 8;
        page::pages_for(bytes, page_size)
    }

    /// Appends the allocator state. Parked frees are written as free: they
    /// become reusable exactly when the checkpoint carrying this blob lands.
    pub fn serialize(&self, out: &mut ByteWriter) {
        let image = self.image();
        let mut body = ByteWriter::new();
        body.put_u32(image.num_pages);
        body.put_u32(image.free.ranges().len() as u32);
        for range in image.free.ranges() {
            body.put_page_range(range);
        }
        out.put_section(PAGE_MANAGER_TAG, body.as_slice());
    }

    /// Reads state written by [`PageManager::serialize`].
    pub fn deserialize(reader: &mut ByteReader<'_>, verify_checksums: bool) -> Result<Self> {
        let body = reader.get_section(PAGE_MANAGER_TAG, verify_checksums)?;
        let mut r = ByteReader::new(body);
        let num_pages = r.get_u32()?;
        if num_pages == 0 {
            return Err(PenumbraError::Corruption("page manager tracks no pages"));
        }
        let count = r.get_u32()? as usize;
        if count > r.remaining() / 8 {
            return Err(PenumbraError::Corruption("page manager range count too large"));
        }
        let mut ranges = Vec::with_capacity(count);
        for _ in 0..count {
            let range = r.get_page_range()?;
            if !range.is_valid()
                || range.num_pages == 0
                || range.start == page::DB_HEADER_PAGE_IDX
                || range.end() > num_pages
            {
                return Err(PenumbraError::Corruption("page manager free range out of bounds"));
            }
            ranges.push(range);
        }
        r.expect_end()?;
        let free = FreeList::from_ranges(ranges.clone());
        if free.total_pages() != ranges.iter().map(|r| u64::from(r.num_pages)).sum::<u64>() {
            return Err(PenumbraError::Corruption("page manager free ranges overlap"));
        }
        Ok(Self {
            num_pages,
            free,
            uncheckpointed_free: Vec::new(),
            changed: false,
            version: 0,
            snapshot: None,
        })
    }
}
