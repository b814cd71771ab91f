//! On-disk static header and dual dynamic header layout (spec §3, §4.2, §6).
//!
//! Grounded on `vefs/detail/raw_archive.hpp` (static header parse/sealed
//! master secret) and the dual-header commit protocol described in spec
//! §4.2. Serialization uses a small hand-rolled little-endian codec, in the
//! spirit of `vefs/utils/binary_codec.hpp`.

use crate::crypto::{CryptoProvider, Kdf, KEY_MATERIAL_SIZE, MAC_SIZE};
use crate::error::{Error, ErrorKind, Result};

pub const MAGIC: [u8; 4] = *b"VEFS";
pub const FORMAT_VERSION: u16 = 1;
pub const KDF_SALT_LEN: usize = 16;
pub const MASTER_SECRET_LEN: usize = 64;
pub const PERSONALIZATION_LEN: usize = 4096;

/// magic[4] | format_version[2] | static_header_length[2] | kdf_salt | sealed_master_secret
/// | sealed_master_secret_mac[16] | personalization_area[4096] | static_header_mac[16]
pub const STATIC_HEADER_LEN: usize =
    4 + 2 + 2 + KDF_SALT_LEN + MASTER_SECRET_LEN + MAC_SIZE + PERSONALIZATION_LEN + MAC_SIZE;

/// The remainder of sector 0 after the static header, split into two equal halves.
pub const DYNAMIC_AREA_LEN: usize = crate::device::SECTOR_SIZE - STATIC_HEADER_LEN;
pub const DYNAMIC_HALF_LEN: usize = DYNAMIC_AREA_LEN / 2;
/// version hint (unauthenticated, used only to pick the key-derivation input) + ciphertext + mac
const DYNAMIC_PLAINTEXT_LEN: usize = DYNAMIC_HALF_LEN - 8 - MAC_SIZE;

fn read_u16(buf: &[u8], off: usize) -> u16 {
    u16::from_le_bytes(buf[off..off + 2].try_into().unwrap())
}
fn write_u16(buf: &mut [u8], off: usize, v: u16) {
    buf[off..off + 2].copy_from_slice(&v.to_le_bytes());
}
fn read_u64(buf: &[u8], off: usize) -> u64 {
    u64::from_le_bytes(buf[off..off + 8].try_into().unwrap())
}
fn write_u64(buf: &mut [u8], off: usize, v: u64) {
    buf[off..off + 8].copy_from_slice(&v.to_le_bytes());
}
fn read_u128(buf: &[u8], off: usize) -> u128 {
    u128::from_le_bytes(buf[off..off + 16].try_into().unwrap())
}
fn write_u128(buf: &mut [u8], off: usize, v: u128) {
    buf[off..off + 16].copy_from_slice(&v.to_le_bytes());
}

/// Box-key derivation for sealing the master secret under the user PRK.
fn box_key(user_prk: &[u8], salt: &[u8]) -> Result<[u8; KEY_MATERIAL_SIZE]> {
    let mut out = [0u8; KEY_MATERIAL_SIZE];
    Kdf::derive(user_prk, &[salt, b"vefs/master-box"], &mut out)?;
    Ok(out)
}

pub struct StaticHeader {
    pub kdf_salt: [u8; KDF_SALT_LEN],
    pub personalization: [u8; PERSONALIZATION_LEN],
}

impl StaticHeader {
    /// Seals a fresh master secret under `user_prk` and serializes the static header.
    pub fn create(
        crypto: &dyn CryptoProvider,
        user_prk: &[u8],
        master_secret: &[u8; MASTER_SECRET_LEN],
    ) -> Result<(StaticHeader, [u8; STATIC_HEADER_LEN])> {
        let mut kdf_salt = [0u8; KDF_SALT_LEN];
        crypto.random(&mut kdf_salt)?;
        let personalization = [0u8; PERSONALIZATION_LEN];
        let header = StaticHeader { kdf_salt, personalization };
        let bytes = header.serialize(crypto, user_prk, master_secret)?;
        Ok((header, bytes))
    }

    fn serialize(
        &self,
        crypto: &dyn CryptoProvider,
        user_prk: &[u8],
        master_secret: &[u8; MASTER_SECRET_LEN],
    ) -> Result<[u8; STATIC_HEADER_LEN]> {
        let mut buf = [0u8; STATIC_HEADER_LEN];
        let mut off = 0;
        buf[off..off + 4].copy_from_slice(&MAGIC);
        off += 4;
        write_u16(&mut buf, off, FORMAT_VERSION);
        off += 2;
        write_u16(&mut buf, off, STATIC_HEADER_LEN as u16);
        off += 2;
        buf[off..off + KDF_SALT_LEN].copy_from_slice(&self.kdf_salt);
        off += KDF_SALT_LEN;

        let key_material = box_key(user_prk, &self.kdf_salt)?;
        let mut sealed = [0u8; MASTER_SECRET_LEN];
        let mut mac = [0u8; MAC_SIZE];
        crypto.seal(&mut sealed, &mut mac, &key_material, master_secret)?;
        buf[off..off + MASTER_SECRET_LEN].copy_from_slice(&sealed);
        off += MASTER_SECRET_LEN;
        buf[off..off + MAC_SIZE].copy_from_slice(&mac);
        off += MAC_SIZE;

        buf[off..off + PERSONALIZATION_LEN].copy_from_slice(&self.personalization);
        off += PERSONALIZATION_LEN;

        // static header MAC covers everything written so far, sealed with a
        // detached call whose "ciphertext" we discard (we only want the tag
        // over this already-plaintext region).
        let mut discard = vec![0u8; off];
        let mut header_mac = [0u8; MAC_SIZE];
        crypto.seal(&mut discard, &mut header_mac, &key_material, &buf[..off])?;
        buf[off..off + MAC_SIZE].copy_from_slice(&header_mac);

        Ok(buf)
    }

    /// Parses and authenticates the static header, recovering the master secret.
    pub fn open(
        crypto: &dyn CryptoProvider,
        user_prk: &[u8],
        raw: &[u8; STATIC_HEADER_LEN],
    ) -> Result<(StaticHeader, [u8; MASTER_SECRET_LEN])> {
        if raw[0..4] != MAGIC {
            return Err(Error::new(ErrorKind::InvalidPrefix));
        }
        let format_version = read_u16(raw, 4);
        if format_version != FORMAT_VERSION {
            return Err(Error::new(ErrorKind::UnknownFormatVersion));
        }
        let static_header_length = read_u16(raw, 6) as usize;
        if static_header_length != STATIC_HEADER_LEN {
            return Err(Error::new(ErrorKind::OversizedStaticHeader));
        }
        let mut off = 8;
        let mut kdf_salt = [0u8; KDF_SALT_LEN];
        kdf_salt.copy_from_slice(&raw[off..off + KDF_SALT_LEN]);
        off += KDF_SALT_LEN;

        let key_material = box_key(user_prk, &kdf_salt)?;

        let sealed_master_secret = &raw[off..off + MASTER_SECRET_LEN];
        off += MASTER_SECRET_LEN;
        let sealed_mac = &raw[off..off + MAC_SIZE];
        off += MAC_SIZE;

        let personalization_start = off;
        off += PERSONALIZATION_LEN;

        let header_mac = &raw[off..off + MAC_SIZE];
        let mut discard = vec![0u8; off];
        let mut recomputed_mac = [0u8; MAC_SIZE];
        crypto.seal(&mut discard, &mut recomputed_mac, &key_material, &raw[..off])?;
        if crypto.ct_compare(&recomputed_mac, header_mac) != std::cmp::Ordering::Equal {
            log::warn!("static header authentication failed: wrong user PRK");
            return Err(Error::new(ErrorKind::WrongUserPrk));
        }

        let mut master_secret = [0u8; MASTER_SECRET_LEN];
        crypto.open(&mut master_secret, &key_material, sealed_master_secret, sealed_mac).map_err(|_| {
            log::warn!("master secret unsealing failed: wrong user PRK");
            Error::new(ErrorKind::WrongUserPrk)
        })?;

        let mut personalization = [0u8; PERSONALIZATION_LEN];
        personalization.copy_from_slice(&raw[personalization_start..personalization_start + PERSONALIZATION_LEN]);

        Ok((StaticHeader { kdf_salt, personalization }, master_secret))
    }
}

/// The authenticated, versioned state carried by a dynamic header half
/// (spec §3 "dynamic header"): pointers to the vfilesystem root, the
/// free-sector list root, and the archive's current sector count.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TreeRootRef {
    pub sector_id: u64,
    pub mac: [u8; MAC_SIZE],
    pub depth: i8,
    pub size: u64,
    pub write_counter: u128,
}

impl TreeRootRef {
    pub fn empty() -> Self {
        TreeRootRef { sector_id: 0, mac: [0u8; MAC_SIZE], depth: -1, size: 0, write_counter: 0 }
    }

    const ENCODED_LEN: usize = 8 + MAC_SIZE + 1 + 8 + 16;

    fn write(&self, buf: &mut [u8], off: &mut usize) {
        write_u64(buf, *off, self.sector_id);
        *off += 8;
        buf[*off..*off + MAC_SIZE].copy_from_slice(&self.mac);
        *off += MAC_SIZE;
        buf[*off] = self.depth as u8;
        *off += 1;
        write_u64(buf, *off, self.size);
        *off += 8;
        write_u128(buf, *off, self.write_counter);
        *off += 16;
    }

    fn read(buf: &[u8], off: &mut usize) -> Self {
        let sector_id = read_u64(buf, *off);
        *off += 8;
        let mut mac = [0u8; MAC_SIZE];
        mac.copy_from_slice(&buf[*off..*off + MAC_SIZE]);
        *off += MAC_SIZE;
        let depth = buf[*off] as i8;
        *off += 1;
        let size = read_u64(buf, *off);
        *off += 8;
        let write_counter = read_u128(buf, *off);
        *off += 16;
        TreeRootRef { sector_id, mac, depth, size, write_counter }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ArchiveHeaderState {
    pub version: u64,
    pub n_sectors: u64,
    pub vfs_root: TreeRootRef,
    pub free_root: TreeRootRef,
}

impl ArchiveHeaderState {
    pub fn genesis() -> Self {
        ArchiveHeaderState {
            version: 0,
            n_sectors: 1,
            vfs_root: TreeRootRef::empty(),
            free_root: TreeRootRef::empty(),
        }
    }

    const ENCODED_LEN: usize = 8 + 8 + TreeRootRef::ENCODED_LEN * 2;

    fn serialize(&self) -> Vec<u8> {
        let mut buf = vec![0u8; DYNAMIC_PLAINTEXT_LEN];
        let mut off = 0;
        write_u64(&mut buf, off, self.version);
        off += 8;
        write_u64(&mut buf, off, self.n_sectors);
        off += 8;
        self.vfs_root.write(&mut buf, &mut off);
        self.free_root.write(&mut buf, &mut off);
        debug_assert!(off <= DYNAMIC_PLAINTEXT_LEN);
        buf
    }

    fn deserialize(buf: &[u8]) -> Result<Self> {
        if buf.len() < Self::ENCODED_LEN {
            return Err(Error::new(ErrorKind::InvalidProto));
        }
        let mut off = 0;
        let version = read_u64(buf, off);
        off += 8;
        let n_sectors = read_u64(buf, off);
        off += 8;
        let vfs_root = TreeRootRef::read(buf, &mut off);
        let free_root = TreeRootRef::read(buf, &mut off);
        Ok(ArchiveHeaderState { version, n_sectors, vfs_root, free_root })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeaderSlot {
    A,
    B,
}

impl HeaderSlot {
    fn domain(self) -> &'static [u8] {
        match self {
            HeaderSlot::A => b"header-A",
            HeaderSlot::B => b"header-B",
        }
    }

    fn other(self) -> Self {
        match self {
            HeaderSlot::A => HeaderSlot::B,
            HeaderSlot::B => HeaderSlot::A,
        }
    }
}

fn derive_header_key(master_secret: &[u8], slot: HeaderSlot, version: u64) -> Result<[u8; KEY_MATERIAL_SIZE]> {
    let mut out = [0u8; KEY_MATERIAL_SIZE];
    Kdf::derive(master_secret, &[slot.domain(), &version.to_le_bytes()], &mut out)?;
    Ok(out)
}

/// Serializes and seals `state` into a `DYNAMIC_HALF_LEN`-byte buffer for `slot`.
pub fn seal_dynamic_header(
    crypto: &dyn CryptoProvider,
    master_secret: &[u8],
    slot: HeaderSlot,
    state: &ArchiveHeaderState,
) -> Result<Vec<u8>> {
    let key_material = derive_header_key(master_secret, slot, state.version)?;
    let plaintext = state.serialize();
    let mut ciphertext = vec![0u8; DYNAMIC_PLAINTEXT_LEN];
    let mut mac = [0u8; MAC_SIZE];
    crypto.seal(&mut ciphertext, &mut mac, &key_material, &plaintext)?;

    let mut buf = vec![0u8; DYNAMIC_HALF_LEN];
    write_u64(&mut buf, 0, state.version);
    buf[8..8 + DYNAMIC_PLAINTEXT_LEN].copy_from_slice(&ciphertext);
    buf[8 + DYNAMIC_PLAINTEXT_LEN..].copy_from_slice(&mac);
    Ok(buf)
}

/// Attempts to authenticate and parse a dynamic header half. Returns `None`
/// if the half does not authenticate (blank, corrupt, or in-flight write).
pub fn try_open_dynamic_header(
    crypto: &dyn CryptoProvider,
    master_secret: &[u8],
    slot: HeaderSlot,
    raw: &[u8],
) -> Option<ArchiveHeaderState> {
    if raw.len() != DYNAMIC_HALF_LEN {
        return None;
    }
    let version_hint = read_u64(raw, 0);
    let key_material = derive_header_key(master_secret, slot, version_hint).ok()?;
    let ciphertext = &raw[8..8 + DYNAMIC_PLAINTEXT_LEN];
    let mac = &raw[8 + DYNAMIC_PLAINTEXT_LEN..];
    let mut plaintext = vec![0u8; DYNAMIC_PLAINTEXT_LEN];
    crypto.open(&mut plaintext, &key_material, ciphertext, mac).ok()?;
    let state = ArchiveHeaderState::deserialize(&plaintext).ok()?;
    if state.version != version_hint {
        return None;
    }
    Some(state)
}

/// Picks the winning half on open, per spec §4.2 crash semantics.
pub fn recover_dynamic_header(
    crypto: &dyn CryptoProvider,
    master_secret: &[u8],
    half_a: &[u8],
    half_b: &[u8],
) -> Result<(HeaderSlot, ArchiveHeaderState)> {
    let a = try_open_dynamic_header(crypto, master_secret, HeaderSlot::A, half_a);
    let b = try_open_dynamic_header(crypto, master_secret, HeaderSlot::B, half_b);
    match (a, b) {
        (Some(sa), Some(sb)) => {
            if sa.version == sb.version {
                Err(Error::new(ErrorKind::IdenticalHeaderVersion))
            } else if sa.version > sb.version {
                Ok((HeaderSlot::A, sa))
            } else {
                Ok((HeaderSlot::B, sb))
            }
        }
        (Some(sa), None) => Ok((HeaderSlot::A, sa)),
        (None, Some(sb)) => Ok((HeaderSlot::B, sb)),
        (None, None) => Err(Error::new(ErrorKind::NoArchiveHeader)),
    }
}

/// The half to write to next: always the one NOT currently active (spec §4.2 step 1/4).
pub fn inactive_slot(active: HeaderSlot) -> HeaderSlot {
    active.other()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::Aes256GcmProvider;

    #[test]
    fn static_header_round_trips_with_correct_prk() {
        let crypto = Aes256GcmProvider;
        let user_prk = [0xA5u8; 32];
        let master_secret = [0x11u8; MASTER_SECRET_LEN];
        let (_, bytes) = StaticHeader::create(&crypto, &user_prk, &master_secret).unwrap();
        let (_, recovered) = StaticHeader::open(&crypto, &user_prk, &bytes).unwrap();
        assert_eq!(recovered, master_secret);
    }

    #[test]
    fn static_header_rejects_wrong_prk() {
        let crypto = Aes256GcmProvider;
        let user_prk = [0xA5u8; 32];
        let master_secret = [0x11u8; MASTER_SECRET_LEN];
        let (_, bytes) = StaticHeader::create(&crypto, &user_prk, &master_secret).unwrap();
        let wrong_prk = [0x00u8; 32];
        let err = match StaticHeader::open(&crypto, &wrong_prk, &bytes) {
            Err(e) => e,
            Ok(_) => panic!("expected WrongUserPrk"),
        };
        assert_eq!(err.kind(), ErrorKind::WrongUserPrk);
    }

    #[test]
    fn dynamic_header_picks_higher_version() {
        let crypto = Aes256GcmProvider;
        let master_secret = [0x22u8; 64];
        let mut state = ArchiveHeaderState::genesis();
        let half_a = seal_dynamic_header(&crypto, &master_secret, HeaderSlot::A, &state).unwrap();
        state.version += 1;
        state.n_sectors = 5;
        let half_b = seal_dynamic_header(&crypto, &master_secret, HeaderSlot::B, &state).unwrap();

        let (slot, recovered) = recover_dynamic_header(&crypto, &master_secret, &half_a, &half_b).unwrap();
        assert_eq!(slot, HeaderSlot::B);
        assert_eq!(recovered.n_sectors, 5);
    }

    #[test]
    fn dynamic_header_blank_half_is_ignored() {
        let crypto = Aes256GcmProvider;
        let master_secret = [0x22u8; 64];
        let state = ArchiveHeaderState::genesis();
        let half_a = seal_dynamic_header(&crypto, &master_secret, HeaderSlot::A, &state).unwrap();
        let half_b = vec![0u8; DYNAMIC_HALF_LEN];

        let (slot, recovered) = recover_dynamic_header(&crypto, &master_secret, &half_a, &half_b).unwrap();
        assert_eq!(slot, HeaderSlot::A);
        assert_eq!(recovered.version, 0);
    }

    #[test]
    fn identical_versions_report_corruption() {
        let crypto = Aes256GcmProvider;
        let master_secret = [0x22u8; 64];
        let state = ArchiveHeaderState::genesis();
        let half_a = seal_dynamic_header(&crypto, &master_secret, HeaderSlot::A, &state).unwrap();
        let half_b = seal_dynamic_header(&crypto, &master_secret, HeaderSlot::B, &state).unwrap();
        let err = recover_dynamic_header(&crypto, &master_secret, &half_a, &half_b).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::IdenticalHeaderVersion);
    }
}
