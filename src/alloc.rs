//! Sector allocator and free-sector tracking (spec §4.3).
//!
//! Grounded on spec §4.3's free-list-backed-by-pseudo-file design; the
//! "deep inheritance for allocators" pattern flagged in spec §9 is flattened
//! here to a single free-list allocator, per the suggested re-architecture.

use std::collections::BTreeSet;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::device::{SectorDevice, SectorId};
use crate::error::Result;

/// Durable free-sector tracking plus on-demand archive growth.
pub struct SectorAllocator {
    device: Arc<SectorDevice>,
    free: Mutex<BTreeSet<u64>>,
    leaked: Mutex<BTreeSet<u64>>,
}

impl SectorAllocator {
    pub fn new(device: Arc<SectorDevice>) -> Self {
        SectorAllocator { device, free: Mutex::new(BTreeSet::new()), leaked: Mutex::new(BTreeSet::new()) }
    }

    /// Rebuilds allocator state from the free-sector pseudo-file's serialized
    /// contents (spec §4.3): a flat sequence of little-endian `u64` sector ids.
    pub fn load(device: Arc<SectorDevice>, serialized: &[u8]) -> Self {
        let mut free = BTreeSet::new();
        for chunk in serialized.chunks_exact(8) {
            free.insert(u64::from_le_bytes(chunk.try_into().unwrap()));
        }
        SectorAllocator { device, free: Mutex::new(free), leaked: Mutex::new(BTreeSet::new()) }
    }

    /// If `current_id` already denotes a live physical sector, returns it
    /// unchanged; otherwise pops a free sector or grows the archive.
    pub fn reallocate(&self, current_id: SectorId) -> Result<SectorId> {
        if current_id != SectorId::MASTER {
            return Ok(current_id);
        }
        let popped = {
            let mut free = self.free.lock();
            let first = free.iter().next().copied();
            if let Some(id) = first {
                free.remove(&id);
            }
            first
        };
        if let Some(id) = popped {
            return Ok(SectorId(id));
        }
        let next = self.device.size();
        self.device.resize(next + 1)?;
        Ok(SectorId(next))
    }

    pub fn dealloc_one(&self, id: SectorId) {
        self.free.lock().insert(id.0);
    }

    pub fn dealloc_one_leak(&self, id: SectorId) {
        self.leaked.lock().insert(id.0);
    }

    /// Reserves exactly `n` sectors up front so a tree mutation cannot fail
    /// partway through for lack of allocation (spec §4.3 preallocation handle).
    pub fn preallocate(&self, n: usize) -> Result<Preallocation> {
        let mut reserved = Vec::with_capacity(n);
        for _ in 0..n {
            reserved.push(self.reallocate(SectorId::MASTER)?);
        }
        Ok(Preallocation { reserved })
    }

    pub fn free_count(&self) -> usize {
        self.free.lock().len()
    }

    pub fn leaked_count(&self) -> usize {
        self.leaked.lock().len()
    }

    /// Serializes the free list for persistence in the free-sector pseudo-file.
    /// Must be written before the dual-header commit (spec §4.3 ordering policy).
    pub fn serialize(&self) -> Vec<u8> {
        let free = self.free.lock();
        let mut out = Vec::with_capacity(free.len() * 8);
        for id in free.iter() {
            out.extend_from_slice(&id.to_le_bytes());
        }
        out
    }
}

/// A reservation of sectors for a single tree mutation. Unused entries are
/// returned to the allocator's free list on drop rather than leaked.
pub struct Preallocation {
    reserved: Vec<SectorId>,
}

impl Preallocation {
    pub fn take(&mut self) -> Option<SectorId> {
        self.reserved.pop()
    }

    pub fn release_unused(mut self, allocator: &SectorAllocator) {
        for id in self.reserved.drain(..) {
            allocator.dealloc_one(id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::Aes256GcmProvider;
    use crate::device::OpenMode;
    use std::sync::Arc as StdArc;

    fn allocator() -> (tempfile::TempDir, SectorAllocator) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a.vefs");
        let device = StdArc::new(
            SectorDevice::open(&path, &[1u8; 32], OpenMode::Create, StdArc::new(Aes256GcmProvider)).unwrap(),
        );
        (dir, SectorAllocator::new(device))
    }

    #[test]
    fn reallocate_extends_archive_when_free_list_empty() {
        let (_dir, alloc) = allocator();
        let a = alloc.reallocate(SectorId::MASTER).unwrap();
        let b = alloc.reallocate(SectorId::MASTER).unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn reallocate_is_noop_for_live_sector() {
        let (_dir, alloc) = allocator();
        let id = SectorId(5);
        assert_eq!(alloc.reallocate(id).unwrap(), id);
    }

    #[test]
    fn dealloc_then_reallocate_reuses_sector() {
        let (_dir, alloc) = allocator();
        let a = alloc.reallocate(SectorId::MASTER).unwrap();
        alloc.dealloc_one(a);
        let b = alloc.reallocate(SectorId::MASTER).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn serialize_round_trips_free_list() {
        let (_dir, alloc) = allocator();
        alloc.dealloc_one(SectorId(3));
        alloc.dealloc_one(SectorId(9));
        let bytes = alloc.serialize();
        let device = alloc.device.clone();
        let reloaded = SectorAllocator::load(device, &bytes);
        assert_eq!(reloaded.free_count(), 2);
    }
}
