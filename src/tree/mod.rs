//! Sector tree (spec §4.5): per-file B-tree-like index of encrypted sectors.
//!
//! Grounded on `vefs::detail::sector_tree_seq`/`root_sector_info` from the
//! original source and spec §3/§4.5's addressing and commit rules.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::alloc::SectorAllocator;
use crate::cache::{CacheKey, SectorCache};
use crate::crypto::MAC_SIZE;
use crate::device::{SectorDevice, SectorId, PAYLOAD_SIZE};
use crate::error::{Error, ErrorKind, Result};
use crate::file::{FileCryptoContext, FileId};

/// Reference-sector fan-out (spec §6: 1016 entries of 32 bytes each). The
/// naive `payload_size / 32` computes 1023; the remaining 224 bytes per
/// reference sector are reserved/padding, matching the literal value spec §3
/// and §6 both give. See DESIGN.md.
pub const REFERENCES_PER_SECTOR: usize = 1016;
pub const MAX_TREE_DEPTH: i8 = 4;
/// `sector_id[8] | mac[16] | write_counter_lo[8]`. The low 64 bits of the
/// 128-bit write counter are enough in practice (see DESIGN.md); storing them
/// in the spec's "reserved" field lets a reader re-derive a child's key
/// without an out-of-band table.
const REFERENCE_ENCODED_LEN: usize = 8 + MAC_SIZE + 8;

fn max_addressable_size() -> u64 {
    let mut leaves: u64 = 1;
    for _ in 0..MAX_TREE_DEPTH {
        leaves = leaves.saturating_mul(REFERENCES_PER_SECTOR as u64);
    }
    leaves.saturating_mul(PAYLOAD_SIZE as u64)
}

fn leaves_at_depth(depth: i8) -> u64 {
    let mut leaves: u64 = 1;
    for _ in 0..depth.max(0) {
        leaves = leaves.saturating_mul(REFERENCES_PER_SECTOR as u64);
    }
    leaves
}

fn depth_for_size(size: u64) -> i8 {
    if size == 0 {
        return -1;
    }
    let mut depth: i8 = 0;
    while (PAYLOAD_SIZE as u64).saturating_mul(leaves_at_depth(depth)) < size {
        depth += 1;
    }
    depth
}

fn offsets_for(leaf_index: u64, depth: i8) -> Vec<usize> {
    let mut offsets = Vec::with_capacity(depth.max(0) as usize);
    for i in (0..depth.max(0)).rev() {
        let mut divisor: u64 = 1;
        for _ in 0..i {
            divisor = divisor.saturating_mul(REFERENCES_PER_SECTOR as u64);
        }
        offsets.push(((leaf_index / divisor) % REFERENCES_PER_SECTOR as u64) as usize);
    }
    offsets
}

fn read_entry(payload: &[u8], index: usize) -> (SectorId, [u8; MAC_SIZE], u64) {
    let off = index * REFERENCE_ENCODED_LEN;
    let sector_id = u64::from_le_bytes(payload[off..off + 8].try_into().unwrap());
    let mut mac = [0u8; MAC_SIZE];
    mac.copy_from_slice(&payload[off + 8..off + 8 + MAC_SIZE]);
    let write_counter_lo = u64::from_le_bytes(payload[off + 8 + MAC_SIZE..off + REFERENCE_ENCODED_LEN].try_into().unwrap());
    (SectorId(sector_id), mac, write_counter_lo)
}

fn write_entry(payload: &mut [u8], index: usize, sector_id: SectorId, mac: [u8; MAC_SIZE], write_counter_lo: u64) {
    let off = index * REFERENCE_ENCODED_LEN;
    payload[off..off + 8].copy_from_slice(&sector_id.0.to_le_bytes());
    payload[off + 8..off + 8 + MAC_SIZE].copy_from_slice(&mac);
    payload[off + 8 + MAC_SIZE..off + REFERENCE_ENCODED_LEN].copy_from_slice(&write_counter_lo.to_le_bytes());
}

/// Snapshot of a file's tree root, as carried by the file descriptor / the
/// archive header's `TreeRootRef`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RootRef {
    pub sector_id: SectorId,
    pub mac: [u8; MAC_SIZE],
    pub depth: i8,
    pub write_counter: u128,
}

impl RootRef {
    pub fn empty() -> Self {
        RootRef { sector_id: SectorId::MASTER, mac: [0u8; MAC_SIZE], depth: -1, write_counter: 0 }
    }
}

struct DirtyNode {
    payload: Vec<u8>,
    parent: Option<(SectorId, usize)>,
    level: i8,
}

/// Pre-image of a dirty node captured before a `write`, keyed by sector id.
type DirtySnapshot = HashMap<SectorId, (Vec<u8>, Option<(SectorId, usize)>, i8)>;

/// Per-file sector tree: sparse random-access read/write/truncate over a
/// file's encrypted sector graph, with bottom-up commit.
pub struct Tree {
    device: Arc<SectorDevice>,
    allocator: Arc<SectorAllocator>,
    cache: Arc<SectorCache>,
    crypto_ctx: Arc<FileCryptoContext>,
    root: Mutex<RootRef>,
    size: AtomicU64,
    dirty: Mutex<HashMap<SectorId, DirtyNode>>,
    commit_lock: Mutex<()>,
}

impl Tree {
    pub fn create(
        device: Arc<SectorDevice>,
        allocator: Arc<SectorAllocator>,
        cache: Arc<SectorCache>,
        crypto_ctx: Arc<FileCryptoContext>,
    ) -> Self {
        Tree {
            device,
            allocator,
            cache,
            crypto_ctx,
            root: Mutex::new(RootRef::empty()),
            size: AtomicU64::new(0),
            dirty: Mutex::new(HashMap::new()),
            commit_lock: Mutex::new(()),
        }
    }

    pub fn open(
        device: Arc<SectorDevice>,
        allocator: Arc<SectorAllocator>,
        cache: Arc<SectorCache>,
        crypto_ctx: Arc<FileCryptoContext>,
        root: RootRef,
        size: u64,
    ) -> Self {
        Tree {
            device,
            allocator,
            cache,
            crypto_ctx,
            root: Mutex::new(root),
            size: AtomicU64::new(size),
            dirty: Mutex::new(HashMap::new()),
            commit_lock: Mutex::new(()),
        }
    }

    pub fn extent(&self) -> u64 {
        self.size.load(Ordering::Acquire)
    }

    pub fn root_ref(&self) -> RootRef {
        *self.root.lock()
    }

    pub fn file_id(&self) -> FileId {
        self.crypto_ctx.id()
    }

    fn cache_key(&self, sector_id: SectorId) -> CacheKey {
        CacheKey { file_id: self.file_id(), sector_id }
    }

    fn load_clean(&self, sector_id: SectorId, mac: [u8; MAC_SIZE], write_counter: u128) -> Result<Vec<u8>> {
        let key = self.cache_key(sector_id);
        let device = self.device.clone();
        let file_id = self.file_id();
        let handle = self.cache.access(key, |buf| {
            device.read_sector(buf, file_id, write_counter, sector_id, &mac)
        })?;
        Ok(handle.with(|data| data.to_vec()))
    }

    /// Returns the payload for `sector_id`, preferring an in-flight dirty
    /// version so readers observe a write before it has been committed.
    fn fetch_payload(&self, sector_id: SectorId, mac: [u8; MAC_SIZE], write_counter: u128) -> Result<Vec<u8>> {
        if let Some(node) = self.dirty.lock().get(&sector_id) {
            return Ok(node.payload.clone());
        }
        self.load_clean(sector_id, mac, write_counter)
    }

    /// Ensures `sector_id` has a dirty, mutable in-memory copy, loading and
    /// copy-on-writing it if necessary. `sector_id == MASTER` allocates fresh,
    /// in which case the new id is recorded in `fresh` so a caller that must
    /// unwind a partial mutation knows which sectors to return to the
    /// allocator (copy-on-write reuses of an already-live sector are not
    /// fresh and must not be deallocated on rollback).
    fn dirty_or_load(
        &self,
        sector_id: SectorId,
        mac: [u8; MAC_SIZE],
        write_counter: u128,
        parent: Option<(SectorId, usize)>,
        level: i8,
        fresh: &mut Vec<SectorId>,
    ) -> Result<SectorId> {
        {
            let dirty = self.dirty.lock();
            if sector_id != SectorId::MASTER && dirty.contains_key(&sector_id) {
                return Ok(sector_id);
            }
        }
        if sector_id == SectorId::MASTER {
            let new_id = self.allocator.reallocate(SectorId::MASTER)?;
            self.dirty.lock().insert(new_id, DirtyNode { payload: vec![0u8; PAYLOAD_SIZE], parent, level });
            fresh.push(new_id);
            return Ok(new_id);
        }
        let payload = self.load_clean(sector_id, mac, write_counter)?;
        self.dirty.lock().entry(sector_id).or_insert(DirtyNode { payload, parent, level });
        Ok(sector_id)
    }

    /// Walks from the root to the leaf holding `leaf_index`, dirtying every
    /// node on the path, allocating holes as needed. Returns the leaf's
    /// current (possibly just-allocated) sector id. Freshly allocated
    /// sectors are appended to `fresh` (see [`Tree::dirty_or_load`]).
    fn ensure_leaf_dirty(&self, leaf_index: u64, fresh: &mut Vec<SectorId>) -> Result<SectorId> {
        let mut root = self.root.lock();
        if root.depth < 0 {
            root.depth = 0;
        }
        let required_depth = depth_for_size((leaf_index + 1).saturating_mul(PAYLOAD_SIZE as u64)).max(0);
        while root.depth < required_depth {
            // depth expansion: new root holds the old root at offset 0.
            let old = *root;
            let new_id = self.allocator.reallocate(SectorId::MASTER)?;
            fresh.push(new_id);
            let mut payload = vec![0u8; PAYLOAD_SIZE];
            if old.sector_id != SectorId::MASTER {
                write_entry(&mut payload, 0, old.sector_id, old.mac, old.write_counter as u64);
            }
            self.dirty.lock().insert(new_id, DirtyNode { payload, parent: None, level: old.depth + 1 });
            // re-parent the old root's dirty node, if it has one in flight.
            if let Some(node) = self.dirty.lock().get_mut(&old.sector_id) {
                node.parent = Some((new_id, 0));
            }
            root.sector_id = new_id;
            root.depth = old.depth + 1;
        }

        let depth = root.depth;
        let mut current_id = self.dirty_or_load(root.sector_id, root.mac, root.write_counter, None, depth, fresh)?;
        root.sector_id = current_id;
        drop(root);

        let offsets = offsets_for(leaf_index, depth);
        let mut current_level = depth;
        for off in offsets {
            let (child_id, child_mac, child_wc_lo) = {
                let dirty = self.dirty.lock();
                let node = dirty.get(&current_id).expect("current node must be dirty by construction");
                read_entry(&node.payload, off)
            };
            let child_level = current_level - 1;
            let new_child_id = self.dirty_or_load(
                child_id,
                child_mac,
                child_wc_lo as u128,
                Some((current_id, off)),
                child_level,
                fresh,
            )?;
            if new_child_id != child_id {
                let mut dirty = self.dirty.lock();
                let node = dirty.get_mut(&current_id).unwrap();
                write_entry(&mut node.payload, off, new_child_id, [0u8; MAC_SIZE], 0);
            }
            current_id = new_child_id;
            current_level = child_level;
        }
        Ok(current_id)
    }

    pub fn read(&self, buf: &mut [u8], file_pos: u64) -> Result<()> {
        let size = self.extent();
        let mut produced = 0usize;
        while produced < buf.len() {
            let pos = file_pos + produced as u64;
            if pos >= size {
                buf[produced..].fill(0);
                break;
            }
            let leaf_index = pos / PAYLOAD_SIZE as u64;
            let in_leaf_offset = (pos % PAYLOAD_SIZE as u64) as usize;
            let take = (PAYLOAD_SIZE - in_leaf_offset).min(buf.len() - produced);

            let root = *self.root.lock();
            if root.depth < 0 {
                buf[produced..produced + take].fill(0);
                produced += take;
                continue;
            }
            let leaf = self.resolve_leaf_readonly(root, leaf_index)?;
            match leaf {
                Some(payload) => {
                    buf[produced..produced + take].copy_from_slice(&payload[in_leaf_offset..in_leaf_offset + take]);
                }
                None => buf[produced..produced + take].fill(0),
            }
            produced += take;
        }
        Ok(())
    }

    /// Read-only descent: returns `None` for holes (sparse, unallocated leaves).
    fn resolve_leaf_readonly(&self, root: RootRef, leaf_index: u64) -> Result<Option<Vec<u8>>> {
        if root.sector_id == SectorId::MASTER {
            return Ok(None);
        }
        let mut current_id = root.sector_id;
        let mut current_mac = root.mac;
        let mut current_wc = root.write_counter;
        let offsets = offsets_for(leaf_index, root.depth);
        for off in offsets {
            if current_id == SectorId::MASTER {
                return Ok(None);
            }
            let payload = self.fetch_payload(current_id, current_mac, current_wc)?;
            let (child_id, child_mac, child_wc_lo) = read_entry(&payload, off);
            if child_id == SectorId::MASTER {
                return Ok(None);
            }
            current_id = child_id;
            current_mac = child_mac;
            current_wc = child_wc_lo as u128;
        }
        Ok(Some(self.fetch_payload(current_id, current_mac, current_wc)?))
    }

    pub fn write(&self, data: &[u8], file_pos: u64) -> Result<()> {
        if data.is_empty() {
            return Ok(());
        }
        let end = file_pos.checked_add(data.len() as u64).ok_or_else(|| Error::new(ErrorKind::ResultOutOfRange))?;
        if end > max_addressable_size() {
            return Err(Error::new(ErrorKind::ResultOutOfRange));
        }

        // Snapshot pre-image state so a mid-write failure (allocator or
        // device error) can be unwound cleanly: the tree must look exactly
        // as it did before this call, with any freshly allocated sectors
        // returned to the allocator.
        let root_snapshot = *self.root.lock();
        let dirty_snapshot: DirtySnapshot = self
            .dirty
            .lock()
            .iter()
            .map(|(id, node)| (*id, (node.payload.clone(), node.parent, node.level)))
            .collect();
        let mut fresh = Vec::new();

        match self.write_locked(data, file_pos, end, &mut fresh) {
            Ok(()) => Ok(()),
            Err(e) => {
                self.rollback_write(root_snapshot, &dirty_snapshot, &fresh);
                Err(e)
            }
        }
    }

    fn write_locked(&self, data: &[u8], file_pos: u64, end: u64, fresh: &mut Vec<SectorId>) -> Result<()> {
        let mut written = 0usize;
        while written < data.len() {
            let pos = file_pos + written as u64;
            let leaf_index = pos / PAYLOAD_SIZE as u64;
            let in_leaf_offset = (pos % PAYLOAD_SIZE as u64) as usize;
            let take = (PAYLOAD_SIZE - in_leaf_offset).min(data.len() - written);

            let leaf_id = self.ensure_leaf_dirty(leaf_index, fresh)?;
            let mut dirty = self.dirty.lock();
            let node = dirty.get_mut(&leaf_id).expect("leaf must be dirty after ensure_leaf_dirty");
            node.payload[in_leaf_offset..in_leaf_offset + take].copy_from_slice(&data[written..written + take]);
            drop(dirty);

            written += take;
        }

        let new_size = end.max(self.extent());
        self.size.store(new_size, Ordering::Release);
        Ok(())
    }

    /// Reverts a failed `write`: restores every node that was already dirty
    /// before the call to its prior payload, drops every node the call
    /// dirtied for the first time, and returns freshly allocated sectors to
    /// the allocator. Copy-on-write reuses of a live sector are left alone,
    /// since only `fresh` entries were actually new allocations.
    fn rollback_write(&self, root_snapshot: RootRef, dirty_snapshot: &DirtySnapshot, fresh: &[SectorId]) {
        {
            let mut dirty = self.dirty.lock();
            dirty.retain(|id, node| match dirty_snapshot.get(id) {
                Some((payload, parent, level)) => {
                    node.payload.copy_from_slice(payload);
                    node.parent = *parent;
                    node.level = *level;
                    true
                }
                None => false,
            });
        }
        for id in fresh {
            self.cache.purge(self.cache_key(*id));
            self.allocator.dealloc_one(*id);
        }
        *self.root.lock() = root_snapshot;
    }

    /// Shrinks the file, releasing fully-freed leaves and contracting depth.
    pub fn truncate(&self, new_size: u64) -> Result<()> {
        let old_size = self.extent();
        if new_size >= old_size {
            self.size.store(new_size, Ordering::Release);
            return Ok(());
        }

        let old_leaf_count = if old_size == 0 { 0 } else { (old_size - 1) / PAYLOAD_SIZE as u64 + 1 };
        let new_leaf_count = if new_size == 0 { 0 } else { (new_size - 1) / PAYLOAD_SIZE as u64 + 1 };

        let root = *self.root.lock();
        if root.depth >= 0 {
            for leaf_index in new_leaf_count..old_leaf_count {
                self.free_leaf(root, leaf_index)?;
            }
        }

        if new_size == 0 {
            let mut root = self.root.lock();
            if root.sector_id != SectorId::MASTER {
                self.allocator.dealloc_one(root.sector_id);
            }
            *root = RootRef::empty();
            self.dirty.lock().clear();
        } else {
            // zero-fill the partial final leaf, if any.
            let tail_start = new_size;
            let leaf_index = tail_start / PAYLOAD_SIZE as u64;
            let in_leaf_offset = (tail_start % PAYLOAD_SIZE as u64) as usize;
            if in_leaf_offset != 0 {
                if let Some(leaf_id) = self.try_dirty_existing_leaf(leaf_index)? {
                    let mut dirty = self.dirty.lock();
                    let node = dirty.get_mut(&leaf_id).unwrap();
                    node.payload[in_leaf_offset..].fill(0);
                }
            }
            self.contract_depth(new_leaf_count)?;
        }

        self.size.store(new_size, Ordering::Release);
        Ok(())
    }

    fn try_dirty_existing_leaf(&self, leaf_index: u64) -> Result<Option<SectorId>> {
        let root = *self.root.lock();
        if root.depth < 0 {
            return Ok(None);
        }
        let mut fresh = Vec::new();
        Ok(Some(self.ensure_leaf_dirty(leaf_index, &mut fresh)?))
    }

    /// Erases the leaf at `leaf_index` and returns its sector to the
    /// allocator, clearing the reference entry on every dirtied ancestor so
    /// the freed sector is no longer reachable once those ancestors commit.
    fn free_leaf(&self, root: RootRef, leaf_index: u64) -> Result<()> {
        if root.sector_id == SectorId::MASTER || root.depth <= 0 {
            return Ok(());
        }
        let mut fresh = Vec::new();
        let offsets = offsets_for(leaf_index, root.depth);
        let mut current_id = self.dirty_or_load(root.sector_id, root.mac, root.write_counter, None, root.depth, &mut fresh)?;
        let mut current_level = root.depth;
        for (i, off) in offsets.iter().enumerate() {
            let (child_id, child_mac, child_wc_lo) = {
                let dirty = self.dirty.lock();
                let node = dirty.get(&current_id).expect("node must be dirty by construction");
                read_entry(&node.payload, *off)
            };
            if child_id == SectorId::MASTER {
                return Ok(()); // sparse hole: nothing to free
            }
            if i + 1 == offsets.len() {
                let mut dirty = self.dirty.lock();
                let node = dirty.get_mut(&current_id).unwrap();
                write_entry(&mut node.payload, *off, SectorId::MASTER, [0u8; MAC_SIZE], 0);
                drop(dirty);
                self.allocator.dealloc_one(child_id);
                self.cache.purge(self.cache_key(child_id));
                self.dirty.lock().remove(&child_id);
            } else {
                let child_level = current_level - 1;
                current_id = self.dirty_or_load(
                    child_id,
                    child_mac,
                    child_wc_lo as u128,
                    Some((current_id, *off)),
                    child_level,
                    &mut fresh,
                )?;
                current_level = child_level;
            }
        }
        Ok(())
    }

    /// While the root has exactly one live child at offset 0 and the new
    /// leaf count fits within that child's subtree, replace the root with it.
    fn contract_depth(&self, leaf_count: u64) -> Result<()> {
        loop {
            let root = *self.root.lock();
            if root.depth <= 0 || root.sector_id == SectorId::MASTER {
                return Ok(());
            }
            if leaves_at_depth(root.depth - 1) < leaf_count {
                return Ok(());
            }
            let payload = self.fetch_payload(root.sector_id, root.mac, root.write_counter)?;
            let (child_id, child_mac, child_wc_lo) = read_entry(&payload, 0);
            let mut only_child = true;
            for i in 1..REFERENCES_PER_SECTOR {
                let (id, _, _) = read_entry(&payload, i);
                if id != SectorId::MASTER {
                    only_child = false;
                    break;
                }
            }
            if !only_child || child_id == SectorId::MASTER {
                return Ok(());
            }
            self.allocator.dealloc_one(root.sector_id);
            self.dirty.lock().remove(&root.sector_id);
            let mut root = self.root.lock();
            root.sector_id = child_id;
            root.mac = child_mac;
            root.write_counter = child_wc_lo as u128;
            root.depth -= 1;
            if let Some(node) = self.dirty.lock().get_mut(&child_id) {
                node.parent = None;
                node.level = root.depth;
            }
        }
    }

    /// Bottom-up commit: seals every dirty node in leaf-to-root order,
    /// patching parent reference entries with each freshly sealed MAC.
    pub fn commit(&self) -> Result<()> {
        let _guard = self.commit_lock.lock();
        let file_id = self.file_id();

        let mut by_level: Vec<Vec<SectorId>> = vec![Vec::new(); (MAX_TREE_DEPTH as usize) + 1];
        for (id, node) in self.dirty.lock().iter() {
            let level = node.level.max(0) as usize;
            by_level[level].push(*id);
        }

        let mut root_update: Option<([u8; MAC_SIZE], u128)> = None;
        for level_nodes in by_level {
            for sector_id in level_nodes {
                let node = match self.dirty.lock().remove(&sector_id) {
                    Some(n) => n,
                    None => continue,
                };
                let write_counter = self.crypto_ctx.next_counter();
                let mac = self.device.write_sector(file_id, write_counter, sector_id, &node.payload)?;
                self.cache.insert_clean(self.cache_key(sector_id), &node.payload);
                match node.parent {
                    Some((parent_id, offset)) => {
                        let mut dirty = self.dirty.lock();
                        if let Some(parent) = dirty.get_mut(&parent_id) {
                            write_entry(&mut parent.payload, offset, sector_id, mac, write_counter as u64);
                        }
                    }
                    None => root_update = Some((mac, write_counter)),
                }
            }
        }

        if let Some((mac, write_counter)) = root_update {
            let mut root = self.root.lock();
            root.mac = mac;
            root.write_counter = write_counter;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::Aes256GcmProvider;
    use crate::device::OpenMode;
    use crate::util::Uuid;

    fn harness() -> (tempfile::TempDir, Arc<SectorDevice>, Arc<SectorAllocator>, Arc<SectorCache>) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("t.vefs");
        let device = Arc::new(
            SectorDevice::open(&path, &[1u8; 32], OpenMode::Create, Arc::new(Aes256GcmProvider)).unwrap(),
        );
        let allocator = Arc::new(SectorAllocator::new(device.clone()));
        let cache = SectorCache::new(64, PAYLOAD_SIZE);
        (dir, device, allocator, cache)
    }

    fn new_tree(device: Arc<SectorDevice>, allocator: Arc<SectorAllocator>, cache: Arc<SectorCache>) -> Tree {
        let ctx = Arc::new(FileCryptoContext::new(FileId::from_uuid(Uuid::from_bytes([3; 16])), 0));
        Tree::create(device, allocator, cache, ctx)
    }

    #[test]
    fn write_then_read_small_round_trips() {
        let (_dir, device, allocator, cache) = harness();
        let tree = new_tree(device, allocator, cache);
        let data = b"hello, vefs";
        tree.write(data, 0).unwrap();
        let mut out = vec![0u8; data.len()];
        tree.read(&mut out, 0).unwrap();
        assert_eq!(&out, data);
        assert_eq!(tree.extent(), data.len() as u64);
    }

    #[test]
    fn write_spanning_two_leaves_expands_depth() {
        let (_dir, device, allocator, cache) = harness();
        let tree = new_tree(device, allocator, cache);
        let data = vec![b'B'; PAYLOAD_SIZE + 1];
        tree.write(&data, 0).unwrap();
        assert_eq!(tree.root_ref().depth, 1);
        let mut out = vec![0u8; data.len()];
        tree.read(&mut out, 0).unwrap();
        assert_eq!(out, data);
    }

    #[test]
    fn reads_past_extent_are_zero_filled() {
        let (_dir, device, allocator, cache) = harness();
        let tree = new_tree(device, allocator, cache);
        tree.write(b"abc", 0).unwrap();
        let mut out = vec![0xFFu8; 10];
        tree.read(&mut out, 0).unwrap();
        assert_eq!(&out[0..3], b"abc");
        assert_eq!(&out[3..], &[0u8; 7]);
    }

    #[test]
    fn commit_then_reopen_like_read_survives() {
        let (_dir, device, allocator, cache) = harness();
        let tree = new_tree(device.clone(), allocator.clone(), cache.clone());
        tree.write(b"persisted", 0).unwrap();
        tree.commit().unwrap();
        let root = tree.root_ref();

        let ctx2 = Arc::new(FileCryptoContext::new(FileId::from_uuid(Uuid::from_bytes([3; 16])), tree.crypto_ctx.current_counter()));
        let tree2 = Tree::open(device.clone(), allocator.clone(), cache.clone(), ctx2, root, 9);
        let mut out = vec![0u8; 9];
        tree2.read(&mut out, 0).unwrap();
        assert_eq!(&out, b"persisted");
    }

    #[test]
    fn truncate_shrinks_and_frees_sectors() {
        let (_dir, device, allocator, cache) = harness();
        let tree = new_tree(device, allocator.clone(), cache);
        let data = vec![b'Z'; PAYLOAD_SIZE * 2];
        tree.write(&data, 0).unwrap();
        tree.commit().unwrap();
        let before_free = allocator.free_count();

        tree.truncate(5).unwrap();
        tree.commit().unwrap();
        assert_eq!(tree.extent(), 5);
        assert!(allocator.free_count() > before_free);

        let mut out = vec![0u8; 5];
        tree.read(&mut out, 0).unwrap();
        assert_eq!(&out, &data[..5]);
    }

    #[test]
    fn failed_write_restores_dirty_state_and_extent() {
        let (dir, device, allocator, cache) = harness();
        let tree = new_tree(device.clone(), allocator.clone(), cache.clone());
        tree.write(b"first leaf", 0).unwrap();
        tree.commit().unwrap();

        // corrupt the committed leaf on disk so a later copy-on-write load
        // of it fails partway through a write.
        let leaf_id = tree.root_ref().sector_id;
        drop(device);
        {
            use std::io::{Seek, SeekFrom, Write};
            let path = dir.path().join("t.vefs");
            let mut file = std::fs::OpenOptions::new().write(true).open(&path).unwrap();
            file.seek(SeekFrom::Start(leaf_id.0 * crate::device::SECTOR_SIZE as u64)).unwrap();
            file.write_all(&[0xFFu8; 64]).unwrap();
        }
        // the commit above cached the clean payload; purge it so the next
        // load actually hits the corrupted bytes on disk.
        tree.cache.purge(tree.cache_key(leaf_id));

        let before_root = tree.root_ref();
        let before_extent = tree.extent();
        let before_dirty = tree.dirty.lock().len();

        let err = tree.write(b"more data", 0).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::TagMismatch);

        assert_eq!(tree.root_ref(), before_root);
        assert_eq!(tree.extent(), before_extent);
        assert_eq!(tree.dirty.lock().len(), before_dirty);
    }

    #[test]
    fn rollback_write_returns_fresh_allocations_to_the_allocator() {
        let (_dir, device, allocator, cache) = harness();
        let tree = new_tree(device, allocator.clone(), cache);
        let before_free = allocator.free_count();

        let fresh_id = allocator.reallocate(SectorId::MASTER).unwrap();
        tree.dirty.lock().insert(fresh_id, DirtyNode { payload: vec![0u8; PAYLOAD_SIZE], parent: None, level: 0 });

        let root_snapshot = tree.root_ref();
        tree.rollback_write(root_snapshot, &HashMap::new(), &[fresh_id]);

        assert!(tree.dirty.lock().is_empty());
        assert_eq!(allocator.free_count(), before_free + 1);
    }

    #[test]
    fn writing_on_leaf_boundary_does_not_touch_neighbor() {
        let (_dir, device, allocator, cache) = harness();
        let tree = new_tree(device, allocator, cache);
        tree.write(&vec![1u8; PAYLOAD_SIZE], 0).unwrap();
        tree.write(&[2u8; 4], PAYLOAD_SIZE as u64).unwrap();
        let mut first_leaf_tail = vec![0u8; 4];
        tree.read(&mut first_leaf_tail, PAYLOAD_SIZE as u64 - 4).unwrap();
        assert_eq!(first_leaf_tail, vec![1u8; 4]);
    }

    #[test]
    fn exceeding_max_addressable_size_is_rejected() {
        let (_dir, device, allocator, cache) = harness();
        let tree = new_tree(device, allocator, cache);
        let err = tree.write(b"x", max_addressable_size()).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ResultOutOfRange);
    }
}
