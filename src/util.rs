//! Small utilities: UUID generation, fingerprints, secure zeroization.
//!
//! Grounded on `vefs::utils::uuid` and `vefs::utils::secure_array` from the
//! original source; `zeroize` plays the role the source's `secure_array`
//! destructor plays (wipe-on-drop secret material).

use rand::RngCore;
use sha2::{Digest, Sha256};
use zeroize::Zeroize;

/// A 128-bit UUID, used for `file_id` and session salts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Uuid(pub [u8; 16]);

impl Uuid {
    pub fn nil() -> Self {
        Uuid([0u8; 16])
    }

    pub fn random<R: RngCore>(rng: &mut R) -> Self {
        let mut bytes = [0u8; 16];
        rng.fill_bytes(&mut bytes);
        Uuid(bytes)
    }

    /// A fixed sentinel UUID, reserved at compile time (spec §3, §9 open question:
    /// the source's `archive_index`/`free_block_index` constants must be pinned and
    /// never change for on-disk compatibility).
    pub const fn from_bytes(bytes: [u8; 16]) -> Self {
        Uuid(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 16] {
        &self.0
    }
}

impl std::fmt::Display for Uuid {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        for b in &self.0 {
            write!(f, "{:02x}", b)?;
        }
        Ok(())
    }
}

/// 64-bit fingerprint of a byte slice, used for cheap equality pre-checks and
/// sharding the vfilesystem's path map (see DESIGN.md on the sharded-lock map).
pub fn fingerprint64(data: &[u8]) -> u64 {
    let digest = Sha256::digest(data);
    u64::from_le_bytes(digest[..8].try_into().unwrap())
}

/// Overwrites `buf` with zeroes in a way the optimizer cannot elide.
pub fn secure_zero(buf: &mut [u8]) {
    buf.zeroize();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fingerprint_is_deterministic() {
        assert_eq!(fingerprint64(b"a/b"), fingerprint64(b"a/b"));
        assert_ne!(fingerprint64(b"a/b"), fingerprint64(b"a/c"));
    }

    #[test]
    fn uuid_display_is_hex() {
        let id = Uuid::from_bytes([0xAB; 16]);
        assert_eq!(id.to_string(), "ab".repeat(16));
    }
}
