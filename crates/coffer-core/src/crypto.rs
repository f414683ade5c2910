//! AEAD primitives for the security barrier.
//!
//! One newtype, [`EncryptionKey`], owns 256 bits of AES-GCM key material
//! and seals/opens the wire format the barrier stores:
//! `nonce (12 bytes) || ciphertext || tag (16 bytes)`. A fresh nonce is
//! drawn from the OS CSPRNG on every seal, so equal plaintexts never
//! collide on the wire. Key bytes are wiped on drop and never surface in
//! `Debug` output.
//!
//! AEAD failure reasons are deliberately not distinguished: a wrong key,
//! a truncated body, and a tampered tag all surface as
//! [`CryptoError::Unauthentic`].

use std::fmt;

use aes_gcm::{AeadInPlace, Aes256Gcm, Key, KeyInit, Nonce};
use rand::rngs::OsRng;
use rand::RngCore;
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::error::CryptoError;

/// Raw length of an AES-256 key.
pub const KEY_LEN: usize = 32;

/// AES-GCM nonce width.
const NONCE_LEN: usize = 12;

/// AES-GCM authentication tag width.
const TAG_LEN: usize = 16;

/// Smallest valid wire value: a nonce and a tag around an empty
/// plaintext.
const MIN_WIRE_LEN: usize = NONCE_LEN + TAG_LEN;

/// A 256-bit data-encryption key, zeroized on drop.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct EncryptionKey([u8; KEY_LEN]);

impl EncryptionKey {
    /// Adopt raw key bytes.
    #[must_use]
    pub fn from_bytes(bytes: [u8; KEY_LEN]) -> Self {
        Self(bytes)
    }

    /// Adopt a key from a slice, enforcing the length.
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::InvalidKeyLength`] unless the slice is
    /// exactly [`KEY_LEN`] bytes.
    pub fn from_slice(bytes: &[u8]) -> Result<Self, CryptoError> {
        let raw: [u8; KEY_LEN] =
            bytes
                .try_into()
                .map_err(|_| CryptoError::InvalidKeyLength {
                    expected: KEY_LEN,
                    actual: bytes.len(),
                })?;
        Ok(Self(raw))
    }

    /// Draw a fresh key from the OS CSPRNG.
    #[must_use]
    pub fn generate() -> Self {
        let mut raw = [0u8; KEY_LEN];
        OsRng.fill_bytes(&mut raw);
        Self(raw)
    }

    /// Borrow the raw key bytes.
    ///
    /// The caller must not log or persist them.
    #[must_use]
    pub fn as_bytes(&self) -> &[u8; KEY_LEN] {
        &self.0
    }

    /// Seal a plaintext into the wire format under a fresh nonce.
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::SealFailure`] if the AEAD refuses the
    /// input; unreachable for any plaintext the barrier produces.
    pub fn seal(&self, plaintext: &[u8]) -> Result<Vec<u8>, CryptoError> {
        let mut nonce = [0u8; NONCE_LEN];
        OsRng.fill_bytes(&mut nonce);

        // In-place sealing: the body buffer grows by the tag.
        let mut body = plaintext.to_vec();
        self.cipher()
            .encrypt_in_place(Nonce::from_slice(&nonce), b"", &mut body)
            .map_err(|_| CryptoError::SealFailure)?;

        let mut wire = Vec::with_capacity(NONCE_LEN + body.len());
        wire.extend_from_slice(&nonce);
        wire.append(&mut body);
        Ok(wire)
    }

    /// Open a wire value produced by [`seal`](Self::seal).
    ///
    /// # Errors
    ///
    /// - [`CryptoError::Truncated`] if the value cannot even hold a
    ///   nonce and tag.
    /// - [`CryptoError::Unauthentic`] if authentication fails.
    pub fn open(&self, wire: &[u8]) -> Result<Vec<u8>, CryptoError> {
        if wire.len() < MIN_WIRE_LEN {
            return Err(CryptoError::Truncated {
                min: MIN_WIRE_LEN,
                actual: wire.len(),
            });
        }

        let (nonce, body) = wire.split_at(NONCE_LEN);
        let mut plaintext = body.to_vec();
        self.cipher()
            .decrypt_in_place(Nonce::from_slice(nonce), b"", &mut plaintext)
            .map_err(|_| CryptoError::Unauthentic)?;
        Ok(plaintext)
    }

    fn cipher(&self) -> Aes256Gcm {
        Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&self.0))
    }
}

impl fmt::Debug for EncryptionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EncryptionKey")
            .field("bytes", &"[REDACTED]")
            .finish()
    }
}
