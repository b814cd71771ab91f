//! Sector device (spec §4.2): file-backed sector I/O, static + dual dynamic
//! header, per-sector AEAD, resize. Grounded on `vefs/detail/raw_archive.hpp`.

mod header;

pub use header::{ArchiveHeaderState, TreeRootRef, STATIC_HEADER_LEN};
use header::{recover_dynamic_header, seal_dynamic_header, HeaderSlot, StaticHeader, DYNAMIC_HALF_LEN};

use std::fmt;
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use zeroize::Zeroizing;

use crate::crypto::{derive_sector_key, CryptoProvider, MAC_SIZE};
use crate::error::{Error, ErrorKind, Result};
use crate::file::FileId;

/// Canonical sector size (spec §3, §6): 2^15 bytes.
pub const SECTOR_SIZE: usize = 1 << 15;
/// MAC trailer: 32 bytes on disk, only the first 16 used (spec §3).
pub const MAC_TRAILER_SIZE: usize = 32;
/// Ciphertext region / payload (spec §3).
pub const PAYLOAD_SIZE: usize = SECTOR_SIZE - MAC_TRAILER_SIZE;

/// Physical sector identifier (spec §3). Sector 0 is the master sector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SectorId(pub u64);

impl SectorId {
    pub const MASTER: SectorId = SectorId(0);

    pub fn next(self) -> SectorId {
        SectorId(self.0 + 1)
    }
}

impl fmt::Display for SectorId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:016x}", self.0)
    }
}

/// What the caller wants when opening an archive path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpenMode {
    Open,
    Create,
    CreateOrOpen,
}

struct HeaderCommitState {
    active_slot: HeaderSlot,
    state: ArchiveHeaderState,
}

pub struct SectorDevice {
    file: Mutex<File>,
    crypto: Arc<dyn CryptoProvider>,
    master_secret: Zeroizing<[u8; header::MASTER_SECRET_LEN]>,
    header: RwLock<HeaderCommitState>,
    personalization: RwLock<[u8; header::PERSONALIZATION_LEN]>,
}

fn master_sector_offset() -> u64 {
    0
}

fn sector_offset(id: SectorId) -> u64 {
    id.0 * SECTOR_SIZE as u64
}

impl SectorDevice {
    pub fn open(
        path: impl AsRef<Path>,
        user_prk: &[u8],
        mode: OpenMode,
        crypto: Arc<dyn CryptoProvider>,
    ) -> Result<Self> {
        let path = path.as_ref();
        let exists = path.exists();
        match (mode, exists) {
            (OpenMode::Open, false) => return Err(Error::new(ErrorKind::NoArchiveHeader)),
            (OpenMode::Create, true) => return Err(Error::new(ErrorKind::InvalidProto)),
            _ => {}
        }

        let create_new = matches!(mode, OpenMode::Create) || (matches!(mode, OpenMode::CreateOrOpen) && !exists);

        let mut file = OpenOptions::new().read(true).write(true).create(create_new).open(path)?;

        if create_new {
            let mut master_secret = [0u8; header::MASTER_SECRET_LEN];
            crypto.random(&mut master_secret)?;
            let (static_header, static_bytes) = StaticHeader::create(&*crypto, user_prk, &master_secret)?;

            let state = ArchiveHeaderState::genesis();
            let half_a = seal_dynamic_header(&*crypto, &master_secret, HeaderSlot::A, &state)?;
            let half_b = vec![0u8; DYNAMIC_HALF_LEN];

            file.seek(SeekFrom::Start(master_sector_offset()))?;
            file.write_all(&static_bytes)?;
            file.write_all(&half_a)?;
            file.write_all(&half_b)?;
            // pad sector 0 out to SECTOR_SIZE if the header areas don't exactly fill it
            let written = static_bytes.len() + half_a.len() + half_b.len();
            if written < SECTOR_SIZE {
                file.write_all(&vec![0u8; SECTOR_SIZE - written])?;
            }
            file.sync_all()?;

            Ok(SectorDevice {
                file: Mutex::new(file),
                crypto,
                master_secret: Zeroizing::new(master_secret),
                header: RwLock::new(HeaderCommitState { active_slot: HeaderSlot::A, state }),
                personalization: RwLock::new(static_header.personalization),
            })
        } else {
            let mut sector0 = vec![0u8; SECTOR_SIZE];
            file.seek(SeekFrom::Start(master_sector_offset()))?;
            file.read_exact(&mut sector0)?;

            let mut static_bytes = [0u8; STATIC_HEADER_LEN];
            static_bytes.copy_from_slice(&sector0[..STATIC_HEADER_LEN]);
            let (static_header, master_secret) = StaticHeader::open(&*crypto, user_prk, &static_bytes)?;

            let half_a = &sector0[STATIC_HEADER_LEN..STATIC_HEADER_LEN + DYNAMIC_HALF_LEN];
            let half_b = &sector0[STATIC_HEADER_LEN + DYNAMIC_HALF_LEN..STATIC_HEADER_LEN + 2 * DYNAMIC_HALF_LEN];
            let (active_slot, state) = recover_dynamic_header(&*crypto, &master_secret, half_a, half_b)?;

            Ok(SectorDevice {
                file: Mutex::new(file),
                crypto,
                master_secret: Zeroizing::new(master_secret),
                header: RwLock::new(HeaderCommitState { active_slot, state }),
                personalization: RwLock::new(static_header.personalization),
            })
        }
    }

    pub fn master_secret(&self) -> &[u8] {
        &self.master_secret[..]
    }

    pub fn header_state(&self) -> ArchiveHeaderState {
        self.header.read().state
    }

    pub fn size(&self) -> u64 {
        self.header.read().state.n_sectors
    }

    /// Grows the archive to hold at least `n_sectors` sectors, appending zero pages.
    pub fn resize(&self, n_sectors: u64) -> Result<()> {
        let mut header = self.header.write();
        if n_sectors <= header.state.n_sectors {
            return Ok(());
        }
        let file = self.file.lock();
        let new_len = n_sectors * SECTOR_SIZE as u64;
        file.set_len(new_len)?;
        header.state.n_sectors = n_sectors;
        Ok(())
    }

    fn check_bounds(&self, id: SectorId) -> Result<()> {
        if id == SectorId::MASTER || id.0 >= self.header.read().state.n_sectors {
            return Err(Error::new(ErrorKind::SectorReferenceOutOfRange).at_sector(id));
        }
        Ok(())
    }

    /// Reads and authenticates `sector_id`'s payload into `buf` (exactly [`PAYLOAD_SIZE`] bytes).
    pub fn read_sector(
        &self,
        buf: &mut [u8],
        file_id: FileId,
        write_counter: u128,
        sector_id: SectorId,
        expected_mac: &[u8; MAC_SIZE],
    ) -> Result<()> {
        assert_eq!(buf.len(), PAYLOAD_SIZE);
        self.check_bounds(sector_id)?;
        let mut raw = vec![0u8; SECTOR_SIZE];
        {
            let mut file = self.file.lock();
            file.seek(SeekFrom::Start(sector_offset(sector_id)))?;
            file.read_exact(&mut raw)?;
        }
        let ciphertext = &raw[..PAYLOAD_SIZE];
        let mut key_material = vec![0u8; self.crypto.key_material_size()];
        derive_sector_key(&self.master_secret[..], file_id, sector_id, write_counter, &mut key_material)?;
        self.crypto.open(buf, &key_material, ciphertext, expected_mac).map_err(|_| {
            log::warn!("tag mismatch reading sector {} of file {}", sector_id, file_id);
            Error::new(ErrorKind::TagMismatch).at_sector(sector_id).at_file(file_id)
        })
    }

    /// Seals `plaintext` for `sector_id` and persists it; returns the resulting MAC
    /// for the caller to store in the parent reference (spec §4.2).
    pub fn write_sector(
        &self,
        file_id: FileId,
        write_counter: u128,
        sector_id: SectorId,
        plaintext: &[u8],
    ) -> Result<[u8; MAC_SIZE]> {
        assert_eq!(plaintext.len(), PAYLOAD_SIZE);
        self.check_bounds(sector_id)?;
        let mut key_material = vec![0u8; self.crypto.key_material_size()];
        derive_sector_key(&self.master_secret[..], file_id, sector_id, write_counter, &mut key_material)?;

        let mut ciphertext = vec![0u8; PAYLOAD_SIZE];
        let mut mac16 = [0u8; MAC_SIZE];
        self.crypto.seal(&mut ciphertext, &mut mac16, &key_material, plaintext)?;

        let mut trailer = [0u8; MAC_TRAILER_SIZE];
        trailer[..MAC_SIZE].copy_from_slice(&mac16);

        let mut file = self.file.lock();
        file.seek(SeekFrom::Start(sector_offset(sector_id)))?;
        file.write_all(&ciphertext)?;
        file.write_all(&trailer)?;
        Ok(mac16)
    }

    /// Zero-wipes the payload region of `sector_id`. No cryptography involved;
    /// the sector is simply no longer readable as anything meaningful.
    pub fn erase_sector(&self, sector_id: SectorId) -> Result<()> {
        self.check_bounds(sector_id)?;
        let blank = vec![0u8; SECTOR_SIZE];
        let mut file = self.file.lock();
        file.seek(SeekFrom::Start(sector_offset(sector_id)))?;
        file.write_all(&blank)?;
        Ok(())
    }

    /// Performs the dual-header commit protocol (spec §4.2): write the new
    /// state into the inactive half with `version = active.version + 1`,
    /// flush, then flip the active role.
    pub fn update_header(&self, mutate: impl FnOnce(&mut ArchiveHeaderState)) -> Result<()> {
        let mut header = self.header.write();
        let mut next_state = header.state;
        mutate(&mut next_state);
        next_state.version = header.state.version + 1;

        let next_slot = header::inactive_slot(header.active_slot);
        let sealed = seal_dynamic_header(&*self.crypto, &self.master_secret[..], next_slot, &next_state)?;

        let offset = STATIC_HEADER_LEN as u64
            + match next_slot {
                HeaderSlot::A => 0,
                HeaderSlot::B => DYNAMIC_HALF_LEN as u64,
            };
        {
            let mut file = self.file.lock();
            file.seek(SeekFrom::Start(offset))?;
            file.write_all(&sealed)?;
            file.sync_all()?;
        }

        header.active_slot = next_slot;
        header.state = next_state;
        log::debug!(
            "committed dynamic header into slot {:?}, version {}, n_sectors {}",
            header.active_slot,
            header.state.version,
            header.state.n_sectors
        );
        Ok(())
    }

    /// Re-seals the master secret under a new user PRK (CLI `set-key`).
    pub fn update_static_header(&self, new_user_prk: &[u8]) -> Result<()> {
        let personalization = *self.personalization.read();
        let mut header = StaticHeader {
            kdf_salt: [0u8; header::KDF_SALT_LEN],
            personalization,
        };
        self.crypto.random(&mut header.kdf_salt)?;
        let bytes = {
            // re-derive and re-seal using the helper on StaticHeader via create(),
            // reusing the existing master secret rather than generating a new one.
            let (_, bytes) = StaticHeader::create(&*self.crypto, new_user_prk, &self.master_secret)?;
            bytes
        };
        let mut file = self.file.lock();
        file.seek(SeekFrom::Start(master_sector_offset()))?;
        file.write_all(&bytes)?;
        file.sync_all()?;
        log::debug!("re-sealed master secret under a new user PRK");
        Ok(())
    }

    pub fn sync(&self) -> Result<()> {
        self.file.lock().sync_all()?;
        Ok(())
    }

    pub fn personalization_area(&self) -> [u8; header::PERSONALIZATION_LEN] {
        *self.personalization.read()
    }

    pub fn set_personalization_area(&self, data: &[u8; header::PERSONALIZATION_LEN]) {
        *self.personalization.write() = *data;
    }

    /// Trims trailing physical sectors that fail authentication until the
    /// archive parses cleanly again (spec §4.2 `purge_corruption`). Here this
    /// is exposed as an instance method operating on the live device size,
    /// since the archive handle already holds the device open; the caller
    /// is expected to re-derive reachability (vfs / free list) afterward.
    pub fn truncate_trailing_unreadable(&self, is_readable: impl Fn(SectorId) -> bool) -> Result<u64> {
        let mut header = self.header.write();
        let mut n = header.state.n_sectors;
        while n > 1 && !is_readable(SectorId(n - 1)) {
            n -= 1;
        }
        if n != header.state.n_sectors {
            let file = self.file.lock();
            file.set_len(n * SECTOR_SIZE as u64)?;
            header.state.n_sectors = n;
        }
        Ok(n)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::Aes256GcmProvider;
    use crate::file::FileId;
    use crate::util::Uuid;

    fn device(path: &Path) -> SectorDevice {
        SectorDevice::open(path, &[0xA5u8; 32], OpenMode::Create, Arc::new(Aes256GcmProvider)).unwrap()
    }

    #[test]
    fn write_then_read_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("archive.vefs");
        let dev = device(&path);
        dev.resize(2).unwrap();
        let file_id = FileId::from_uuid(Uuid::from_bytes([9; 16]));
        let plaintext = vec![0x7Bu8; PAYLOAD_SIZE];
        let mac = dev.write_sector(file_id, 0, SectorId(1), &plaintext).unwrap();

        let mut out = vec![0u8; PAYLOAD_SIZE];
        dev.read_sector(&mut out, file_id, 0, SectorId(1), &mac).unwrap();
        assert_eq!(out, plaintext);
    }

    #[test]
    fn corrupted_sector_fails_tag_check() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("archive.vefs");
        let dev = device(&path);
        dev.resize(2).unwrap();
        let file_id = FileId::from_uuid(Uuid::from_bytes([9; 16]));
        let plaintext = vec![0x7Bu8; PAYLOAD_SIZE];
        let mac = dev.write_sector(file_id, 0, SectorId(1), &plaintext).unwrap();

        // flip a byte directly on disk
        {
            let mut file = dev.file.lock();
            file.seek(SeekFrom::Start(sector_offset(SectorId(1)))).unwrap();
            file.write_all(&[0xFFu8]).unwrap();
        }

        let mut out = vec![0u8; PAYLOAD_SIZE];
        let err = dev.read_sector(&mut out, file_id, 0, SectorId(1), &mac).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::TagMismatch);
    }

    #[test]
    fn reopen_after_commit_recovers_state() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("archive.vefs");
        {
            let dev = device(&path);
            dev.resize(4).unwrap();
            dev.update_header(|state| {
                state.vfs_root.size = 42;
            })
            .unwrap();
        }
        let dev2 =
            SectorDevice::open(&path, &[0xA5u8; 32], OpenMode::Open, Arc::new(Aes256GcmProvider)).unwrap();
        assert_eq!(dev2.header_state().vfs_root.size, 42);
        assert_eq!(dev2.size(), 4);
    }

    #[test]
    fn wrong_prk_is_rejected_on_open() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("archive.vefs");
        {
            let _dev = device(&path);
        }
        let err = match SectorDevice::open(&path, &[0x00u8; 32], OpenMode::Open, Arc::new(Aes256GcmProvider)) {
            Err(e) => e,
            Ok(_) => panic!("expected WrongUserPrk"),
        };
        assert_eq!(err.kind(), ErrorKind::WrongUserPrk);
    }
}
