//! vfilesystem index (spec §4.7): persistent `path -> file descriptor` map,
//! backed by a dedicated sector tree, safe for concurrent access.
//!
//! Grounded on spec §4.7 and, for the concurrency shape, on the sharded-lock
//! approximation of a lock-free map described in DESIGN.md (spec §5 calls
//! for "a lock-free concurrent hash map (bucketed cuckoo)"; this uses
//! `parking_lot::RwLock<HashMap<..>>` striped by path fingerprint instead).

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;

use crate::cache::SectorCache;
use crate::crypto::MAC_SIZE;
use crate::device::{SectorDevice, SectorId};
use crate::error::{Error, ErrorKind, Result};
use crate::file::{FileCryptoContext, FileDescriptor, FileId};
use crate::tree::{RootRef, Tree};
use crate::util::fingerprint64;

const SHARD_COUNT: usize = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpenMode {
    Open,
    Create,
    CreateOrOpen,
}

fn shard_of(path: &str) -> usize {
    (fingerprint64(path.as_bytes()) % SHARD_COUNT as u64) as usize
}

fn write_u16(buf: &mut Vec<u8>, v: u16) {
    buf.extend_from_slice(&v.to_le_bytes());
}
fn write_u64(buf: &mut Vec<u8>, v: u64) {
    buf.extend_from_slice(&v.to_le_bytes());
}
fn write_u128(buf: &mut Vec<u8>, v: u128) {
    buf.extend_from_slice(&v.to_le_bytes());
}

fn read_u16(buf: &[u8], off: &mut usize) -> Result<u16> {
    let v = u16::from_le_bytes(buf.get(*off..*off + 2).ok_or_else(corrupt)?.try_into().unwrap());
    *off += 2;
    Ok(v)
}
fn read_u32(buf: &[u8], off: &mut usize) -> Result<u32> {
    let v = u32::from_le_bytes(buf.get(*off..*off + 4).ok_or_else(corrupt)?.try_into().unwrap());
    *off += 4;
    Ok(v)
}
fn read_u64(buf: &[u8], off: &mut usize) -> Result<u64> {
    let v = u64::from_le_bytes(buf.get(*off..*off + 8).ok_or_else(corrupt)?.try_into().unwrap());
    *off += 8;
    Ok(v)
}
fn read_u128(buf: &[u8], off: &mut usize) -> Result<u128> {
    let v = u128::from_le_bytes(buf.get(*off..*off + 16).ok_or_else(corrupt)?.try_into().unwrap());
    *off += 16;
    Ok(v)
}

fn corrupt() -> Error {
    Error::new(ErrorKind::CorruptIndexEntry)
}

/// Serializes one `(path, descriptor)` entry (spec §4.7: "a self-describing
/// binary encoding").
fn serialize_entry(out: &mut Vec<u8>, path: &str, desc: &FileDescriptor) {
    write_u16(out, path.len() as u16);
    out.extend_from_slice(path.as_bytes());
    out.extend_from_slice(desc.id.as_uuid().as_bytes());
    write_u64(out, desc.size);
    out.push(desc.tree_depth as u8);
    write_u64(out, desc.root_sector.0);
    out.extend_from_slice(&desc.root_mac);
    write_u128(out, desc.write_counter);
}

fn deserialize_entry(buf: &[u8], off: &mut usize) -> Result<(String, FileDescriptor)> {
    let path_len = read_u16(buf, off)? as usize;
    let path_bytes = buf.get(*off..*off + path_len).ok_or_else(corrupt)?;
    let path = String::from_utf8(path_bytes.to_vec()).map_err(|_| corrupt())?;
    *off += path_len;

    let id_bytes = buf.get(*off..*off + 16).ok_or_else(corrupt)?;
    let mut id = [0u8; 16];
    id.copy_from_slice(id_bytes);
    *off += 16;

    let size = read_u64(buf, off)?;
    let tree_depth = *buf.get(*off).ok_or_else(corrupt)? as i8;
    *off += 1;
    let root_sector = SectorId(read_u64(buf, off)?);
    let mac_bytes = buf.get(*off..*off + MAC_SIZE).ok_or_else(corrupt)?;
    let mut root_mac = [0u8; MAC_SIZE];
    root_mac.copy_from_slice(mac_bytes);
    *off += MAC_SIZE;
    let write_counter = read_u128(buf, off)?;

    let desc = FileDescriptor {
        id: FileId::from_uuid(crate::util::Uuid::from_bytes(id)),
        size,
        tree_depth,
        root_sector,
        root_mac,
        write_counter,
    };
    Ok((path, desc))
}

pub struct VfsIndex {
    shards: Vec<RwLock<HashMap<String, FileDescriptor>>>,
    open_counts: RwLock<HashMap<String, u32>>,
    tree: Tree,
}

impl VfsIndex {
    fn new_empty(tree: Tree) -> Self {
        let mut shards = Vec::with_capacity(SHARD_COUNT);
        for _ in 0..SHARD_COUNT {
            shards.push(RwLock::new(HashMap::new()));
        }
        VfsIndex { shards, open_counts: RwLock::new(HashMap::new()), tree }
    }

    pub fn create(
        device: Arc<SectorDevice>,
        allocator: Arc<crate::alloc::SectorAllocator>,
        cache: Arc<SectorCache>,
    ) -> Self {
        let ctx = Arc::new(FileCryptoContext::new(FileId::VFILESYSTEM_INDEX, 0));
        let tree = Tree::create(device, allocator, cache, ctx);
        Self::new_empty(tree)
    }

    pub fn open(
        device: Arc<SectorDevice>,
        allocator: Arc<crate::alloc::SectorAllocator>,
        cache: Arc<SectorCache>,
        root: RootRef,
        size: u64,
        write_counter: u128,
    ) -> Result<Self> {
        let ctx = Arc::new(FileCryptoContext::new(FileId::VFILESYSTEM_INDEX, write_counter));
        let tree = Tree::open(device, allocator, cache, ctx, root, size);
        let mut buf = vec![0u8; size as usize];
        tree.read(&mut buf, 0)?;
        let index = Self::new_empty(tree);
        if !buf.is_empty() {
            let mut off = 0usize;
            let count = read_u32(&buf, &mut off)?;
            for _ in 0..count {
                let (path, desc) = deserialize_entry(&buf, &mut off)?;
                index.shards[shard_of(&path)].write().insert(path, desc);
            }
        }
        Ok(index)
    }

    pub fn root_ref(&self) -> RootRef {
        self.tree.root_ref()
    }

    pub fn extent(&self) -> u64 {
        self.tree.extent()
    }

    /// Returns the descriptor for `path`, creating it if `mode` allows and it
    /// is absent.
    pub fn open_path(&self, path: &str, mode: OpenMode) -> Result<FileDescriptor> {
        let shard = &self.shards[shard_of(path)];
        {
            let table = shard.read();
            if let Some(desc) = table.get(path) {
                if mode == OpenMode::Create {
                    return Err(Error::new(ErrorKind::InvalidProto));
                }
                *self.open_counts.write().entry(path.to_string()).or_insert(0) += 1;
                return Ok(*desc);
            }
        }
        if mode == OpenMode::Open {
            return Err(Error::new(ErrorKind::NoSuchFile));
        }
        let fresh_id = crate::util::Uuid::random(&mut rand::rngs::OsRng);
        let descriptor = FileDescriptor::empty(FileId::from_uuid(fresh_id));
        shard.write().insert(path.to_string(), descriptor);
        *self.open_counts.write().entry(path.to_string()).or_insert(0) += 1;
        Ok(descriptor)
    }

    pub fn close_path(&self, path: &str) {
        let mut counts = self.open_counts.write();
        if let Some(count) = counts.get_mut(path) {
            *count = count.saturating_sub(1);
            if *count == 0 {
                counts.remove(path);
            }
        }
    }

    pub fn update_descriptor(&self, path: &str, descriptor: FileDescriptor) {
        if let Some(slot) = self.shards[shard_of(path)].write().get_mut(path) {
            *slot = descriptor;
        }
    }

    pub fn query(&self, path: &str) -> Result<FileDescriptor> {
        self.shards[shard_of(path)].read().get(path).copied().ok_or_else(|| Error::new(ErrorKind::NoSuchFile))
    }

    /// Removes `path`'s descriptor, returning it so the caller can release
    /// its sector tree. Fails if any handle is still open on it.
    pub fn erase(&self, path: &str) -> Result<FileDescriptor> {
        if self.open_counts.read().get(path).copied().unwrap_or(0) > 0 {
            return Err(Error::new(ErrorKind::StillInUse));
        }
        let shard = &self.shards[shard_of(path)];
        let mut table = shard.write();
        table.remove(path).ok_or_else(|| Error::new(ErrorKind::NoSuchFile))
    }

    pub fn list(&self) -> Vec<String> {
        let mut paths = Vec::new();
        for shard in &self.shards {
            paths.extend(shard.read().keys().cloned());
        }
        paths
    }

    fn serialize_all(&self) -> Vec<u8> {
        let mut entries: Vec<(String, FileDescriptor)> = Vec::new();
        for shard in &self.shards {
            for (path, desc) in shard.read().iter() {
                entries.push((path.clone(), *desc));
            }
        }
        let mut out = Vec::new();
        out.extend_from_slice(&(entries.len() as u32).to_le_bytes());
        for (path, desc) in &entries {
            serialize_entry(&mut out, path, desc);
        }
        out
    }

    /// Persists the index into its backing sector tree (spec §4.7: "the
    /// file's length is kept a multiple of payload_size, end-padded").
    pub fn commit(&self) -> Result<()> {
        let mut bytes = self.serialize_all();
        let payload_size = crate::device::PAYLOAD_SIZE;
        let padded_len = bytes.len().div_ceil(payload_size) * payload_size;
        bytes.resize(padded_len.max(payload_size), 0);

        self.tree.truncate(0)?;
        self.tree.write(&bytes, 0)?;
        self.tree.commit()
    }
}
