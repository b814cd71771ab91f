//! Archive handle (spec §4.8): top-level composition of the sector device,
//! allocator, cache, vfilesystem, and per-file trees.
//!
//! Grounded on spec §4.8's commit ordering and on `vefs::archive_handle` from
//! the original source for the overall shape of the public surface.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};

use crate::alloc::SectorAllocator;
use crate::cache::SectorCache;
use crate::crypto::{Aes256GcmProvider, CryptoProvider};
use crate::device::{OpenMode as DeviceOpenMode, SectorDevice, SectorId};
use crate::error::Result;
use crate::file::{FileCryptoContext, FileDescriptor, FileId};
use crate::pool::{InlineWorkTracker, WorkTracker};
use crate::tree::{RootRef, Tree};
use crate::vfs::{OpenMode, VfsIndex};

pub use crate::device::OpenMode as ArchiveOpenMode;

/// A live handle onto a single open file within the archive. Reads and
/// writes are routed through this handle's own sector tree, shared with the
/// archive's open-file registry so [`Archive::commit`] can flush it.
pub struct FileHandle {
    path: String,
    id: FileId,
    tree: Arc<Tree>,
}

impl FileHandle {
    pub fn id(&self) -> FileId {
        self.id
    }

    pub fn read(&self, buf: &mut [u8], pos: u64) -> Result<()> {
        self.tree.read(buf, pos)
    }

    pub fn write(&self, data: &[u8], pos: u64) -> Result<()> {
        self.tree.write(data, pos)
    }

    pub fn truncate(&self, new_size: u64) -> Result<()> {
        self.tree.truncate(new_size)
    }

    pub fn size(&self) -> u64 {
        self.tree.extent()
    }
}

fn root_ref_of(r: &crate::device::TreeRootRef) -> RootRef {
    RootRef { sector_id: SectorId(r.sector_id), mac: r.mac, depth: r.depth, write_counter: r.write_counter }
}

struct ArchiveState {
    vfs: VfsIndex,
    allocator: Arc<SectorAllocator>,
}

/// Top-level encrypted virtual filesystem handle: open, read, write,
/// truncate, commit, erase. Composes every other component.
pub struct Archive {
    device: Arc<SectorDevice>,
    cache: Arc<SectorCache>,
    #[allow(dead_code)]
    crypto: Arc<dyn CryptoProvider>,
    #[allow(dead_code)]
    work_tracker: Arc<dyn WorkTracker>,
    state: RwLock<ArchiveState>,
    open_trees: Mutex<HashMap<String, Arc<Tree>>>,
    commit_mutex: Mutex<()>,
}

impl Archive {
    pub fn open(path: impl AsRef<Path>, user_prk: &[u8], mode: DeviceOpenMode) -> Result<Self> {
        Self::open_with(path, user_prk, mode, Arc::new(Aes256GcmProvider), Arc::new(InlineWorkTracker))
    }

    pub fn open_with(
        path: impl AsRef<Path>,
        user_prk: &[u8],
        mode: DeviceOpenMode,
        crypto: Arc<dyn CryptoProvider>,
        work_tracker: Arc<dyn WorkTracker>,
    ) -> Result<Self> {
        let creating = matches!(mode, DeviceOpenMode::Create);
        let device = Arc::new(SectorDevice::open(path, user_prk, mode, crypto.clone())?);
        let cache = SectorCache::new(crate::cache::DEFAULT_CAPACITY, crate::device::PAYLOAD_SIZE);
        let bootstrap_allocator = Arc::new(SectorAllocator::new(device.clone()));

        let header = device.header_state();

        // Load the persisted free set first, using the bootstrap (empty)
        // allocator only to drive the read-only tree walk — it never
        // allocates. Every other component below shares this one loaded
        // instance, so the vfs index and the archive's own commit path never
        // diverge into separate free-sector views.
        let allocator = if !creating && header.free_root.size > 0 {
            let free_root = root_ref_of(&header.free_root);
            let ctx = Arc::new(FileCryptoContext::new(FileId::FREE_SECTOR_INDEX, free_root.write_counter));
            let free_tree =
                Tree::open(device.clone(), bootstrap_allocator.clone(), cache.clone(), ctx, free_root, header.free_root.size);
            let mut free_buf = vec![0u8; header.free_root.size as usize];
            free_tree.read(&mut free_buf, 0)?;
            Arc::new(SectorAllocator::load(device.clone(), &free_buf))
        } else {
            bootstrap_allocator
        };

        let vfs = if creating {
            VfsIndex::create(device.clone(), allocator.clone(), cache.clone())
        } else {
            let root = root_ref_of(&header.vfs_root);
            VfsIndex::open(device.clone(), allocator.clone(), cache.clone(), root, header.vfs_root.size, root.write_counter)?
        };

        Ok(Archive {
            device,
            cache,
            crypto,
            work_tracker,
            state: RwLock::new(ArchiveState { vfs, allocator }),
            open_trees: Mutex::new(HashMap::new()),
            commit_mutex: Mutex::new(()),
        })
    }

    /// Drops any file whose tree no longer authenticates, so the archive
    /// parses cleanly again (spec §4.2 `purge_corruption`). A dropped file's
    /// sectors are simply abandoned, not reclaimed: a tree that fails to
    /// authenticate cannot be walked to find them.
    pub fn purge_corruption(path: impl AsRef<Path>, user_prk: &[u8], crypto: Arc<dyn CryptoProvider>) -> Result<()> {
        let archive = Self::open_with(path, user_prk, DeviceOpenMode::Open, crypto, Arc::new(InlineWorkTracker))?;
        let allocator = archive.state.read().allocator.clone();

        let unreadable: Vec<String> = archive
            .list()
            .into_iter()
            .filter(|p| {
                let descriptor = archive.query(p).expect("path just listed must still resolve");
                !archive.descriptor_is_readable(&descriptor, &allocator)
            })
            .collect();

        if unreadable.is_empty() {
            log::debug!("purge_corruption: archive already parses cleanly");
            return Ok(());
        }
        log::error!("purge_corruption: dropping {} file(s) that fail authentication: {:?}", unreadable.len(), unreadable);
        {
            let state = archive.state.read();
            for path in &unreadable {
                let _ = state.vfs.erase(path);
            }
        }
        archive.commit()
    }

    fn descriptor_is_readable(&self, descriptor: &FileDescriptor, allocator: &Arc<SectorAllocator>) -> bool {
        if descriptor.size == 0 {
            return true;
        }
        let ctx = Arc::new(FileCryptoContext::new(descriptor.id, descriptor.write_counter));
        let root = RootRef {
            sector_id: descriptor.root_sector,
            mac: descriptor.root_mac,
            depth: descriptor.tree_depth,
            write_counter: descriptor.write_counter,
        };
        let tree = Tree::open(self.device.clone(), allocator.clone(), self.cache.clone(), ctx, root, descriptor.size);
        let mut buf = vec![0u8; descriptor.size as usize];
        tree.read(&mut buf, 0).is_ok()
    }

    pub fn open_file(&self, path: &str, mode: OpenMode) -> Result<FileHandle> {
        let state = self.state.read();
        let descriptor = state.vfs.open_path(path, mode)?;
        let allocator = state.allocator.clone();
        drop(state);

        let ctx = Arc::new(FileCryptoContext::new(descriptor.id, descriptor.write_counter));
        let root = RootRef {
            sector_id: descriptor.root_sector,
            mac: descriptor.root_mac,
            depth: descriptor.tree_depth,
            write_counter: descriptor.write_counter,
        };
        let tree = Arc::new(Tree::open(self.device.clone(), allocator, self.cache.clone(), ctx, root, descriptor.size));
        self.open_trees.lock().insert(path.to_string(), tree.clone());
        Ok(FileHandle { path: path.to_string(), id: descriptor.id, tree })
    }

    pub fn close_file(&self, handle: FileHandle) -> Result<()> {
        handle.tree.commit()?;
        self.flush_tree(&handle.path, &handle.tree);
        self.state.read().vfs.close_path(&handle.path);
        self.open_trees.lock().remove(&handle.path);
        Ok(())
    }

    fn flush_tree(&self, path: &str, tree: &Tree) {
        let root = tree.root_ref();
        let descriptor = FileDescriptor {
            id: tree.file_id(),
            size: tree.extent(),
            tree_depth: root.depth,
            root_sector: root.sector_id,
            root_mac: root.mac,
            write_counter: root.write_counter,
        };
        self.state.read().vfs.update_descriptor(path, descriptor);
    }

    pub fn query(&self, path: &str) -> Result<FileDescriptor> {
        self.state.read().vfs.query(path)
    }

    pub fn list(&self) -> Vec<String> {
        self.state.read().vfs.list()
    }

    /// Removes `path`, releasing every sector its tree holds.
    pub fn erase(&self, path: &str) -> Result<()> {
        let state = self.state.read();
        let descriptor = state.vfs.erase(path)?;
        let allocator = state.allocator.clone();
        drop(state);

        let ctx = Arc::new(FileCryptoContext::new(descriptor.id, descriptor.write_counter));
        let root = RootRef {
            sector_id: descriptor.root_sector,
            mac: descriptor.root_mac,
            depth: descriptor.tree_depth,
            write_counter: descriptor.write_counter,
        };
        let tree = Tree::open(self.device.clone(), allocator, self.cache.clone(), ctx, root, descriptor.size);
        tree.truncate(0)?;
        tree.commit()
    }

    /// Orchestrates the commit order (spec §4.8): flush all open file trees,
    /// then the vfilesystem index, then the allocator, then the dual-header
    /// commit on the sector device.
    pub fn commit(&self) -> Result<()> {
        let _guard = self.commit_mutex.lock();
        log::debug!("archive commit starting");

        let trees: Vec<(String, Arc<Tree>)> =
            self.open_trees.lock().iter().map(|(p, t)| (p.clone(), t.clone())).collect();
        for (path, tree) in &trees {
            tree.commit()?;
            self.flush_tree(path, tree);
        }

        let state = self.state.read();
        state.vfs.commit()?;

        let header = self.device.header_state();
        let free_root = root_ref_of(&header.free_root);
        let free_ctx = Arc::new(FileCryptoContext::new(FileId::FREE_SECTOR_INDEX, free_root.write_counter));
        let free_tree =
            Tree::open(self.device.clone(), state.allocator.clone(), self.cache.clone(), free_ctx, free_root, header.free_root.size);

        // Writing the free set can itself pop sectors from (or return sectors
        // to) that very set, since the free pseudo-file's own storage comes
        // from the same allocator. Re-serialize and rewrite until the
        // content we commit matches the allocator state it leaves behind, or
        // give up after a bounded number of rounds rather than spin forever.
        let payload_size = crate::device::PAYLOAD_SIZE;
        let pad = |mut bytes: Vec<u8>| -> Vec<u8> {
            if !bytes.is_empty() {
                let padded_len = bytes.len().div_ceil(payload_size) * payload_size;
                bytes.resize(padded_len, 0);
            }
            bytes
        };
        const MAX_ROUNDS: u32 = 8;
        let mut written = pad(state.allocator.serialize());
        let mut converged = false;
        for round in 1..=MAX_ROUNDS {
            free_tree.truncate(0)?;
            if !written.is_empty() {
                free_tree.write(&written, 0)?;
            }
            let next = pad(state.allocator.serialize());
            if next == written {
                converged = true;
                break;
            }
            if round == MAX_ROUNDS {
                log::warn!("free-sector list did not converge after {} rounds; committing last snapshot", round);
            }
            written = next;
        }
        if !converged {
            free_tree.truncate(0)?;
            if !written.is_empty() {
                free_tree.write(&written, 0)?;
            }
        }
        free_tree.commit()?;

        let vfs_root = state.vfs.root_ref();
        let vfs_size = state.vfs.extent();
        let free_root_final = free_tree.root_ref();
        let free_size = free_tree.extent();
        drop(state);

        self.device.update_header(|s| {
            s.vfs_root.sector_id = vfs_root.sector_id.0;
            s.vfs_root.mac = vfs_root.mac;
            s.vfs_root.depth = vfs_root.depth;
            s.vfs_root.write_counter = vfs_root.write_counter;
            s.vfs_root.size = vfs_size;

            s.free_root.sector_id = free_root_final.sector_id.0;
            s.free_root.mac = free_root_final.mac;
            s.free_root.depth = free_root_final.depth;
            s.free_root.write_counter = free_root_final.write_counter;
            s.free_root.size = free_size;
        })?;
        log::debug!("archive commit finished: vfs_size={} free_list_size={}", vfs_size, free_size);
        Ok(())
    }

    pub fn device(&self) -> &SectorDevice {
        &self.device
    }
}
