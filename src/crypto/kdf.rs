//! Domain-separated key derivation, grounded on `vefs/crypto/kdf.hpp`'s
//! `kdf(key, domain_blobs...) -> PRK` contract: HKDF-SHA512, with an
//! ordered list of domain-separation blobs concatenated into the HKDF
//! `info` parameter.

use hkdf::Hkdf;
use sha2::Sha512;

use crate::device::SectorId;
use crate::error::{Error, ErrorKind, Result};
use crate::file::FileId;

/// Derives `out.len()` bytes of key material from `key` and an ordered list
/// of domain blobs. Deterministic: same inputs always produce the same output.
pub struct Kdf;

impl Kdf {
    pub fn derive(key: &[u8], domain: &[&[u8]], out: &mut [u8]) -> Result<()> {
        let hk = Hkdf::<Sha512>::new(None, key);
        let mut info = Vec::new();
        for blob in domain {
            info.extend_from_slice(blob);
        }
        hk.expand(&info, out).map_err(|_| Error::new(ErrorKind::ResourceExhausted))
    }
}

/// Per-sector key material derivation (spec §4.1): deterministic over
/// `(file_id, sector_id, write_counter)`, distinct for any distinct triple.
pub fn derive_sector_key(
    master_secret: &[u8],
    file_id: FileId,
    sector_id: SectorId,
    write_counter: u128,
    out: &mut [u8],
) -> Result<()> {
    let uuid = file_id.as_uuid();
    let domain: &[&[u8]] = &[
        uuid.as_bytes(),
        &write_counter.to_le_bytes(),
        &sector_id.0.to_le_bytes(),
        b"vefs/sector",
    ];
    Kdf::derive(master_secret, domain, out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::util::Uuid;

    #[test]
    fn derivation_is_deterministic() {
        let master = [0x42u8; 64];
        let file_id = FileId::from_uuid(Uuid::from_bytes([1; 16]));
        let sector = SectorId(7);
        let mut out1 = [0u8; 44];
        let mut out2 = [0u8; 44];
        derive_sector_key(&master, file_id, sector, 3, &mut out1).unwrap();
        derive_sector_key(&master, file_id, sector, 3, &mut out2).unwrap();
        assert_eq!(out1, out2);
    }

    #[test]
    fn distinct_triples_yield_distinct_outputs() {
        let master = [0x42u8; 64];
        let file_id = FileId::from_uuid(Uuid::from_bytes([1; 16]));
        let mut base = [0u8; 44];
        derive_sector_key(&master, file_id, SectorId(1), 0, &mut base).unwrap();

        let mut by_sector = [0u8; 44];
        derive_sector_key(&master, file_id, SectorId(2), 0, &mut by_sector).unwrap();
        assert_ne!(base, by_sector);

        let mut by_counter = [0u8; 44];
        derive_sector_key(&master, file_id, SectorId(1), 1, &mut by_counter).unwrap();
        assert_ne!(base, by_counter);

        let other_file = FileId::from_uuid(Uuid::from_bytes([2; 16]));
        let mut by_file = [0u8; 44];
        derive_sector_key(&master, other_file, SectorId(1), 0, &mut by_file).unwrap();
        assert_ne!(base, by_file);
    }
}
