//! Generic bounded concurrent cache of decrypted sector payloads (spec §4.4).
//!
//! Grounded on `pddb`'s page-cache-ish bookkeeping (clean/dirty page state)
//! and on spec §4.4's page lifecycle. The literal spectral-bloom-filter
//! frequency sketch is approximated here by a bounded counting map plus a
//! doorkeeper set — see DESIGN.md for the deviation note; the externally
//! visible contract (try_pin/access/mark_dirty/mark_clean/purge/for_each_dirty,
//! TinyLFU-style admission) is preserved.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};

use crate::device::SectorId;
use crate::error::{Error, ErrorKind, Result};
use crate::file::FileId;

pub const DEFAULT_CAPACITY: usize = 512;
const SAMPLE_BUDGET: u32 = 8192;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CacheKey {
    pub file_id: FileId,
    pub sector_id: SectorId,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PageState {
    Dead,
    Initializing,
    Clean,
    Dirty,
}

struct Page {
    state: PageState,
    generation: u32,
    pin: u32,
    referenced: bool,
    key: Option<CacheKey>,
    data: Vec<u8>,
}

impl Page {
    fn dead(payload_size: usize) -> Self {
        Page { state: PageState::Dead, generation: 0, pin: 0, referenced: false, key: None, data: vec![0u8; payload_size] }
    }
}

/// TinyLFU-style admission: a bounded counting sketch plus a doorkeeper.
/// Not a literal spectral bloom filter (see module docs); preserves the
/// "age via halving after a sample budget" behavior.
struct FrequencySketch {
    counts: HashMap<CacheKey, u8>,
    doorkeeper: std::collections::HashSet<CacheKey>,
    samples: u32,
}

impl FrequencySketch {
    fn new() -> Self {
        FrequencySketch { counts: HashMap::new(), doorkeeper: std::collections::HashSet::new(), samples: 0 }
    }

    fn record(&mut self, key: CacheKey) {
        if self.doorkeeper.insert(key) {
            // first sighting: doorkeeper admits it, no frequency credit yet
        } else {
            let counter = self.counts.entry(key).or_insert(0);
            *counter = counter.saturating_add(1);
        }
        self.samples += 1;
        if self.samples >= SAMPLE_BUDGET {
            self.samples = 0;
            self.doorkeeper.clear();
            for v in self.counts.values_mut() {
                *v /= 2;
            }
        }
    }

    fn estimate(&self, key: &CacheKey) -> u8 {
        self.counts.get(key).copied().unwrap_or(0)
    }
}

/// A counted reference to a pinned page. Releasing the last handle allows
/// the page to become a replacement candidate again.
pub struct CacheHandle {
    cache: Arc<SectorCache>,
    slot: usize,
    generation: u32,
}

impl CacheHandle {
    pub fn with<R>(&self, f: impl FnOnce(&[u8]) -> R) -> R {
        let page = self.cache.pages[self.slot].lock();
        f(&page.data)
    }

    pub fn with_mut<R>(&self, f: impl FnOnce(&mut [u8]) -> R) -> R {
        let mut page = self.cache.pages[self.slot].lock();
        f(&mut page.data)
    }

    pub fn key(&self) -> CacheKey {
        self.cache.pages[self.slot].lock().key.expect("pinned handle always has a key")
    }
}

impl Clone for CacheHandle {
    fn clone(&self) -> Self {
        self.cache.pages[self.slot].lock().pin += 1;
        CacheHandle { cache: self.cache.clone(), slot: self.slot, generation: self.generation }
    }
}

impl Drop for CacheHandle {
    fn drop(&mut self) {
        let mut page = self.cache.pages[self.slot].lock();
        if page.generation == self.generation && page.pin > 0 {
            page.pin -= 1;
        }
    }
}

pub struct SectorCache {
    pages: Vec<Mutex<Page>>,
    index: RwLock<HashMap<CacheKey, usize>>,
    freq: Mutex<FrequencySketch>,
    clock_hand: AtomicUsize,
}

impl SectorCache {
    pub fn new(capacity: usize, payload_size: usize) -> Arc<Self> {
        let mut pages = Vec::with_capacity(capacity);
        for _ in 0..capacity {
            pages.push(Mutex::new(Page::dead(payload_size)));
        }
        Arc::new(SectorCache {
            pages,
            index: RwLock::new(HashMap::new()),
            freq: Mutex::new(FrequencySketch::new()),
            clock_hand: AtomicUsize::new(0),
        })
    }

    pub fn capacity(&self) -> usize {
        self.pages.len()
    }

    /// Returns a handle to `key` if present, without admitting a new entry.
    pub fn try_pin(self: &Arc<Self>, key: CacheKey) -> Option<CacheHandle> {
        let slot = *self.index.read().get(&key)?;
        let mut page = self.pages[slot].lock();
        if page.key != Some(key) || page.state == PageState::Dead {
            return None;
        }
        page.pin += 1;
        page.referenced = true;
        let generation = page.generation;
        drop(page);
        self.freq.lock().record(key);
        Some(CacheHandle { cache: self.clone(), slot, generation })
    }

    /// Returns the existing handle for `key`, or replaces a victim and runs
    /// `init_fn` to populate it. On `init_fn` failure the page reverts to dead.
    pub fn access(
        self: &Arc<Self>,
        key: CacheKey,
        init_fn: impl FnOnce(&mut [u8]) -> Result<()>,
    ) -> Result<CacheHandle> {
        if let Some(handle) = self.try_pin(key) {
            return Ok(handle);
        }

        let slot = self.select_victim(key);
        {
            let mut page = self.pages[slot].lock();
            page.state = PageState::Initializing;
            page.key = Some(key);
            page.pin += 1;
            let result = init_fn(&mut page.data);
            match result {
                Ok(()) => {
                    page.state = PageState::Clean;
                    page.generation = page.generation.wrapping_add(1);
                    page.referenced = true;
                }
                Err(e) => {
                    page.state = PageState::Dead;
                    page.key = None;
                    page.pin -= 1;
                    return Err(e);
                }
            }
        }
        self.index.write().insert(key, slot);
        self.freq.lock().record(key);
        let generation = self.pages[slot].lock().generation;
        Ok(CacheHandle { cache: self.clone(), slot, generation })
    }

    /// Inserts an already-known-clean payload directly (used after a sector
    /// tree commit seals a node and wants it available for subsequent reads
    /// without re-deriving its key material).
    pub fn insert_clean(self: &Arc<Self>, key: CacheKey, data: &[u8]) {
        let slot = self.select_victim(key);
        {
            let mut page = self.pages[slot].lock();
            page.data.copy_from_slice(data);
            page.key = Some(key);
            page.state = PageState::Clean;
            page.generation = page.generation.wrapping_add(1);
            page.referenced = false;
            page.pin = 0;
        }
        self.index.write().insert(key, slot);
    }

    pub fn mark_dirty(&self, handle: &CacheHandle) {
        self.pages[handle.slot].lock().state = PageState::Dirty;
    }

    pub fn mark_clean(&self, handle: &CacheHandle) {
        self.pages[handle.slot].lock().state = PageState::Clean;
    }

    /// Evicts and destroys a specific entry, regardless of pin state — callers
    /// are expected to hold no outstanding handles to `key` when calling this.
    pub fn purge(&self, key: CacheKey) {
        if let Some(slot) = self.index.write().remove(&key) {
            let mut page = self.pages[slot].lock();
            page.state = PageState::Dead;
            page.key = None;
            page.pin = 0;
            page.generation = page.generation.wrapping_add(1);
        }
    }

    pub fn for_each_dirty(&self, mut f: impl FnMut(CacheKey, &[u8])) {
        for page in &self.pages {
            let page = page.lock();
            if page.state == PageState::Dirty {
                if let Some(key) = page.key {
                    f(key, &page.data);
                }
            }
        }
    }

    /// Removes `page`'s current occupant (if any) from the key index. Must be
    /// called before a slot is handed back for reuse, or the old key's index
    /// entry goes stale and later `purge`/lookups hit the wrong page.
    fn evict_index_entry(&self, page: &mut Page, slot: usize) {
        if let Some(old_key) = page.key.take() {
            let mut index = self.index.write();
            if index.get(&old_key) == Some(&slot) {
                index.remove(&old_key);
            }
        }
    }

    /// Clock-sweep victim selection with TinyLFU admission (spec §4.4).
    fn select_victim(&self, candidate: CacheKey) -> usize {
        let n = self.pages.len();
        let candidate_freq = self.freq.lock().estimate(&candidate);
        let start = self.clock_hand.load(Ordering::Relaxed);
        let mut best: Option<(usize, bool)> = None; // (slot, is_clean)

        for step in 0..n * 2 {
            let i = (start + step) % n;
            let mut page = self.pages[i].lock();
            if page.pin > 0 {
                continue;
            }
            if page.state == PageState::Dead {
                self.clock_hand.store((i + 1) % n, Ordering::Relaxed);
                return i;
            }
            if page.referenced {
                page.referenced = false;
                continue;
            }
            let victim_freq = page.key.map(|k| self.freq.lock().estimate(&k)).unwrap_or(0);
            if victim_freq > candidate_freq && best.is_some() {
                continue;
            }
            let is_clean = page.state == PageState::Clean;
            match best {
                None => best = Some((i, is_clean)),
                Some((_, best_clean)) if is_clean && !best_clean => best = Some((i, is_clean)),
                _ => {}
            }
            if is_clean {
                self.clock_hand.store((i + 1) % n, Ordering::Relaxed);
                self.evict_index_entry(&mut page, i);
                return i;
            }
        }

        if let Some((slot, _)) = best {
            self.clock_hand.store((slot + 1) % n, Ordering::Relaxed);
            let mut page = self.pages[slot].lock();
            self.evict_index_entry(&mut page, slot);
            return slot;
        }
        // every page pinned: degrade to the page the clock hand currently sits on.
        start % n
    }
}

/// Remaps an allocator/IO failure that surfaces while servicing `access`.
pub fn init_failed() -> Error {
    Error::new(ErrorKind::ResourceExhausted)
}
