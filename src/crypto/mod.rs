//! Crypto provider (interface) — spec §4.1.
//!
//! The core only consumes this trait; the default implementation is
//! AES-256-GCM via the `aes-gcm` crate, with HKDF-SHA512 key derivation.
//! Grounded on `vefs/crypto/provider.hpp` (the `crypto_provider` abstract
//! interface) and `vefs/crypto/kdf.hpp` (domain-separated KDF).

mod kdf;

pub use kdf::{derive_sector_key, Kdf};

use aes_gcm::aead::{AeadInPlace, KeyInit};
use aes_gcm::{Aes256Gcm, Key, Nonce, Tag};
use rand::rngs::OsRng;
use rand::RngCore;
use subtle::ConstantTimeEq;

use crate::error::{Error, ErrorKind, Result};

/// Length of the composite `nonce ‖ key` key material the provider consumes
/// (spec §4.1: 12-byte nonce + 32-byte key = 44 bytes for AES-256-GCM).
pub const KEY_MATERIAL_SIZE: usize = 12 + 32;
/// Authentication tag length produced by `seal`/consumed by `open`.
pub const MAC_SIZE: usize = 16;

/// Contract the core consumes from an injected provider (spec §4.1).
pub trait CryptoProvider: Send + Sync {
    /// Seals `plaintext` in place, writing ciphertext into `ciphertext_out` (same
    /// length as `plaintext`) and the tag into `mac_out` (exactly [`MAC_SIZE`] bytes).
    fn seal(
        &self,
        ciphertext_out: &mut [u8],
        mac_out: &mut [u8; MAC_SIZE],
        key_material: &[u8],
        plaintext: &[u8],
    ) -> Result<()>;

    /// Opens `ciphertext` into `plaintext_out`, authenticating against `mac`.
    /// Returns `ErrorKind::TagMismatch` if authentication fails.
    fn open(
        &self,
        plaintext_out: &mut [u8],
        key_material: &[u8],
        ciphertext: &[u8],
        mac: &[u8],
    ) -> Result<()>;

    fn random(&self, out: &mut [u8]) -> Result<()>;

    /// Constant-time three-way compare, as `subtle::ConstantTimeEq` provides.
    fn ct_compare(&self, a: &[u8], b: &[u8]) -> std::cmp::Ordering {
        if a.len() != b.len() || a.ct_eq(b).unwrap_u8() == 0 {
            // length/content mismatch: fall back to a non-short-circuiting
            // byte compare so the result is still deterministic, though the
            // *timing* safety only matters for the equality branch above.
            a.cmp(b)
        } else {
            std::cmp::Ordering::Equal
        }
    }

    fn generate_session_salt(&self) -> [u8; 16] {
        let mut salt = [0u8; 16];
        self.random(&mut salt).expect("salt generation must not fail");
        salt
    }

    fn key_material_size(&self) -> usize {
        KEY_MATERIAL_SIZE
    }
}

/// Default provider: AES-256-GCM with a 12-byte nonce, system RNG.
#[derive(Debug, Default, Clone, Copy)]
pub struct Aes256GcmProvider;

impl CryptoProvider for Aes256GcmProvider {
    fn seal(
        &self,
        ciphertext_out: &mut [u8],
        mac_out: &mut [u8; MAC_SIZE],
        key_material: &[u8],
        plaintext: &[u8],
    ) -> Result<()> {
        assert_eq!(key_material.len(), KEY_MATERIAL_SIZE, "key material must be nonce||key");
        assert_eq!(ciphertext_out.len(), plaintext.len());
        let (nonce_bytes, key_bytes) = key_material.split_at(12);
        let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(key_bytes));
        let nonce = Nonce::from_slice(nonce_bytes);
        ciphertext_out.copy_from_slice(plaintext);
        let tag = cipher
            .encrypt_in_place_detached(nonce, b"", ciphertext_out)
            .map_err(|_| Error::new(ErrorKind::TagMismatch))?;
        mac_out.copy_from_slice(tag.as_slice());
        Ok(())
    }

    fn open(
        &self,
        plaintext_out: &mut [u8],
        key_material: &[u8],
        ciphertext: &[u8],
        mac: &[u8],
    ) -> Result<()> {
        assert_eq!(key_material.len(), KEY_MATERIAL_SIZE, "key material must be nonce||key");
        assert_eq!(plaintext_out.len(), ciphertext.len());
        let (nonce_bytes, key_bytes) = key_material.split_at(12);
        let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(key_bytes));
        let nonce = Nonce::from_slice(nonce_bytes);
        let tag = Tag::from_slice(&mac[..MAC_SIZE]);
        plaintext_out.copy_from_slice(ciphertext);
        cipher
            .decrypt_in_place_detached(nonce, b"", plaintext_out, tag)
            .map_err(|_| Error::new(ErrorKind::TagMismatch))?;
        Ok(())
    }

    fn random(&self, out: &mut [u8]) -> Result<()> {
        OsRng.fill_bytes(out);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn seal_open_round_trip() {
        let provider = Aes256GcmProvider;
        let mut key_material = [0u8; KEY_MATERIAL_SIZE];
        provider.random(&mut key_material).unwrap();
        let plaintext = b"sector payload data, arbitrary length here";
        let mut ciphertext = vec![0u8; plaintext.len()];
        let mut mac = [0u8; MAC_SIZE];
        provider.seal(&mut ciphertext, &mut mac, &key_material, plaintext).unwrap();
        assert_ne!(&ciphertext[..], &plaintext[..]);

        let mut recovered = vec![0u8; plaintext.len()];
        provider.open(&mut recovered, &key_material, &ciphertext, &mac).unwrap();
        assert_eq!(&recovered[..], &plaintext[..]);
    }

    #[test]
    fn tampered_ciphertext_fails_authentication() {
        let provider = Aes256GcmProvider;
        let mut key_material = [0u8; KEY_MATERIAL_SIZE];
        provider.random(&mut key_material).unwrap();
        let plaintext = b"some data";
        let mut ciphertext = vec![0u8; plaintext.len()];
        let mut mac = [0u8; MAC_SIZE];
        provider.seal(&mut ciphertext, &mut mac, &key_material, plaintext).unwrap();
        ciphertext[0] ^= 0xFF;

        let mut recovered = vec![0u8; plaintext.len()];
        let err = provider.open(&mut recovered, &key_material, &ciphertext, &mac).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::TagMismatch);
    }

    #[test]
    fn distinct_key_material_yields_distinct_ciphertext() {
        let provider = Aes256GcmProvider;
        let mut km1 = [0u8; KEY_MATERIAL_SIZE];
        let mut km2 = [0u8; KEY_MATERIAL_SIZE];
        provider.random(&mut km1).unwrap();
        provider.random(&mut km2).unwrap();
        let plaintext = b"identical plaintext block..........";
        let mut ct1 = vec![0u8; plaintext.len()];
        let mut ct2 = vec![0u8; plaintext.len()];
        let mut mac1 = [0u8; MAC_SIZE];
        let mut mac2 = [0u8; MAC_SIZE];
        provider.seal(&mut ct1, &mut mac1, &km1, plaintext).unwrap();
        provider.seal(&mut ct2, &mut mac2, &km2, plaintext).unwrap();
        assert_ne!(ct1, ct2);
    }
}
