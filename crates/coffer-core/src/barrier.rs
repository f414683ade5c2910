//! Security barrier over the physical store.
//!
//! Every byte of user data passes through the barrier's encrypt/decrypt;
//! the physical backend only ever sees ciphertext. The barrier is binary:
//! sealed (no data operations) or unsealed (transparent crypto).
//!
//! # Key hierarchy
//!
//! The master key never touches storage. At initialization the barrier
//! generates a keyring holding the actual data-encryption key, seals the
//! keyring record under the master key, and persists it at `core/keyring`.
//! Unsealing decrypts that record and caches the data key in memory;
//! sealing zeroizes it.
//!
//! Every ciphertext is prefixed with the one-byte key term that produced
//! it, leaving room for future key rotation without a format change. Each
//! write uses a fresh nonce, so identical plaintexts yield distinct
//! ciphertexts.

use std::fmt;
use std::sync::Arc;

use coffer_storage::StorageBackend;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::info;
use zeroize::{Zeroize, ZeroizeOnDrop, Zeroizing};

use crate::crypto::{EncryptionKey, KEY_LEN};
use crate::error::{BarrierError, CryptoError};

/// Physical path of the sealed keyring record.
pub const KEYRING_PATH: &str = "core/keyring";

/// The single key term in use until rotation exists.
const ACTIVE_TERM: u8 = 1;

/// Persisted keyring record, sealed under the master key.
#[derive(Serialize, Deserialize, Zeroize, ZeroizeOnDrop)]
struct KeyringRecord {
    term: u8,
    key: Vec<u8>,
}

/// The in-memory unsealed state: the active data key.
struct ActiveKey {
    term: u8,
    key: EncryptionKey,
}

/// The security barrier wrapping a physical backend.
pub struct Barrier {
    physical: Arc<dyn StorageBackend>,
    active: RwLock<Option<ActiveKey>>,
}

impl Barrier {
    /// Create a new sealed barrier over the given physical backend.
    #[must_use]
    pub fn new(physical: Arc<dyn StorageBackend>) -> Self {
        Self {
            physical,
            active: RwLock::new(None),
        }
    }

    /// Check whether a keyring exists in the physical store.
    ///
    /// # Errors
    ///
    /// Returns [`BarrierError::Storage`] if the physical backend fails.
    pub async fn initialized(&self) -> Result<bool, BarrierError> {
        Ok(self.physical.get(KEYRING_PATH).await?.is_some())
    }

    /// Generate a fresh master key of the barrier's declared length.
    #[must_use]
    pub fn generate_key() -> Zeroizing<Vec<u8>> {
        Zeroizing::new(EncryptionKey::generate().as_bytes().to_vec())
    }

    /// The accepted raw master-key size range, in bytes.
    #[must_use]
    pub fn key_length() -> (usize, usize) {
        (KEY_LEN, KEY_LEN)
    }

    /// Generate and persist a keyring sealed under `master_key`.
    ///
    /// Does not leave the barrier unsealed.
    ///
    /// # Errors
    ///
    /// - [`BarrierError::AlreadyInitialized`] if a keyring already exists.
    /// - [`BarrierError::InvalidKey`] if the master key has the wrong length.
    /// - [`BarrierError::Storage`] if persisting the keyring fails.
    pub async fn initialize(&self, master_key: &[u8]) -> Result<(), BarrierError> {
        let master = Self::check_key(master_key)?;

        if self.initialized().await? {
            return Err(BarrierError::AlreadyInitialized);
        }

        let data_key = EncryptionKey::generate();
        let record = KeyringRecord {
            term: ACTIVE_TERM,
            key: data_key.as_bytes().to_vec(),
        };
        let plaintext =
            Zeroizing::new(serde_json::to_vec(&record).map_err(|e| BarrierError::Keyring {
                reason: e.to_string(),
            })?);

        let sealed = seal_value(&master, ACTIVE_TERM, &plaintext)?;
        self.physical.put(KEYRING_PATH, &sealed).await?;

        info!("security barrier initialized");
        Ok(())
    }

    /// Unseal the barrier with the master key.
    ///
    /// Idempotent while unsealed. On success the decrypted keyring is
    /// cached in memory and data operations become available.
    ///
    /// # Errors
    ///
    /// - [`BarrierError::NotInitialized`] if no keyring exists.
    /// - [`BarrierError::InvalidKey`] on a wrong-length or wrong key.
    pub async fn unseal(&self, master_key: &[u8]) -> Result<(), BarrierError> {
        let mut active = self.active.write().await;
        if active.is_some() {
            return Ok(());
        }

        let master = Self::check_key(master_key)?;

        let sealed = self
            .physical
            .get(KEYRING_PATH)
            .await?
            .ok_or(BarrierError::NotInitialized)?;

        let plaintext = match open_value(&master, ACTIVE_TERM, &sealed) {
            Ok(p) => p,
            Err(BarrierError::Crypto(CryptoError::Unauthentic)) => {
                return Err(BarrierError::InvalidKey {
                    reason: "unable to decrypt keyring".to_owned(),
                });
            }
            Err(e) => return Err(e),
        };

        let record: KeyringRecord =
            serde_json::from_slice(&plaintext).map_err(|e| BarrierError::Keyring {
                reason: e.to_string(),
            })?;
        drop(plaintext);

        let key = EncryptionKey::from_slice(&record.key)?;
        *active = Some(ActiveKey {
            term: record.term,
            key,
        });

        info!("security barrier unsealed");
        Ok(())
    }

    /// Seal the barrier, zeroizing the in-memory keyring. Idempotent.
    pub async fn seal(&self) {
        let mut active = self.active.write().await;
        if active.take().is_some() {
            info!("security barrier sealed");
        }
    }

    /// Check whether the barrier is currently sealed.
    pub async fn sealed(&self) -> bool {
        self.active.read().await.is_none()
    }

    /// Read and decrypt a value.
    ///
    /// Returns `Ok(None)` if the key does not exist.
    ///
    /// # Errors
    ///
    /// - [`BarrierError::Sealed`] while sealed.
    /// - [`BarrierError::UnknownTerm`] if the ciphertext was written under
    ///   a key term this barrier does not hold.
    /// - [`BarrierError::Crypto`] / [`BarrierError::Storage`] on failure.
    pub async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, BarrierError> {
        let active = self.active.read().await;
        let active = active.as_ref().ok_or(BarrierError::Sealed)?;

        match self.physical.get(key).await? {
            None => Ok(None),
            Some(sealed) => {
                let plaintext = open_value(&active.key, active.term, &sealed)?;
                Ok(Some(plaintext.to_vec()))
            }
        }
    }

    /// Encrypt and write a value.
    ///
    /// # Errors
    ///
    /// - [`BarrierError::Sealed`] while sealed.
    /// - [`BarrierError::Crypto`] / [`BarrierError::Storage`] on failure.
    pub async fn put(&self, key: &str, value: &[u8]) -> Result<(), BarrierError> {
        let sealed = {
            let active = self.active.read().await;
            let active = active.as_ref().ok_or(BarrierError::Sealed)?;
            seal_value(&active.key, active.term, value)?
        };
        self.physical.put(key, &sealed).await?;
        Ok(())
    }

    /// Delete a key.
    ///
    /// # Errors
    ///
    /// - [`BarrierError::Sealed`] while sealed.
    /// - [`BarrierError::Storage`] on failure.
    pub async fn delete(&self, key: &str) -> Result<(), BarrierError> {
        if self.sealed().await {
            return Err(BarrierError::Sealed);
        }
        self.physical.delete(key).await?;
        Ok(())
    }

    /// List keys under a prefix. Keys are plaintext; only values are
    /// encrypted.
    ///
    /// # Errors
    ///
    /// - [`BarrierError::Sealed`] while sealed.
    /// - [`BarrierError::Storage`] on failure.
    pub async fn list(&self, prefix: &str) -> Result<Vec<String>, BarrierError> {
        if self.sealed().await {
            return Err(BarrierError::Sealed);
        }
        let keys = self.physical.list(prefix).await?;
        Ok(keys)
    }

    fn check_key(key: &[u8]) -> Result<EncryptionKey, BarrierError> {
        let (min, max) = Self::key_length();
        if key.len() < min {
            return Err(BarrierError::InvalidKey {
                reason: format!("key is shorter than minimum {min} bytes"),
            });
        }
        if key.len() > max {
            return Err(BarrierError::InvalidKey {
                reason: format!("key is longer than maximum {max} bytes"),
            });
        }
        Ok(EncryptionKey::from_slice(key)?)
    }
}

/// Seal a plaintext: `term || nonce || ciphertext || tag`.
fn seal_value(key: &EncryptionKey, term: u8, plaintext: &[u8]) -> Result<Vec<u8>, BarrierError> {
    let wire = key.seal(plaintext)?;
    let mut out = Vec::with_capacity(1 + wire.len());
    out.push(term);
    out.extend_from_slice(&wire);
    Ok(out)
}

/// Open a sealed value, checking the key-term prefix.
fn open_value(
    key: &EncryptionKey,
    term: u8,
    sealed: &[u8],
) -> Result<Zeroizing<Vec<u8>>, BarrierError> {
    let (&found_term, wire) = sealed.split_first().ok_or(BarrierError::Crypto(
        CryptoError::Truncated { min: 1, actual: 0 },
    ))?;
    if found_term != term {
        return Err(BarrierError::UnknownTerm { term: found_term });
    }
    Ok(Zeroizing::new(key.open(wire)?))
}

impl fmt::Debug for Barrier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Barrier").finish_non_exhaustive()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use coffer_storage::MemoryBackend;

    use super::*;

    fn make_barrier() -> (Arc<MemoryBackend>, Barrier) {
        let physical = Arc::new(MemoryBackend::new());
        let barrier = Barrier::new(Arc::clone(&physical) as Arc<dyn StorageBackend>);
        (physical, barrier)
    }

    // ── initialization ───────────────────────────────────────────────

    #[tokio::test]
    async fn fresh_barrier_is_uninitialized_and_sealed() {
        let (_physical, barrier) = make_barrier();
        assert!(!barrier.initialized().await.unwrap());
        assert!(barrier.sealed().await);
    }

    #[tokio::test]
    async fn initialize_persists_keyring() {
        let (physical, barrier) = make_barrier();
        let master = Barrier::generate_key();
        barrier.initialize(&master).await.unwrap();

        assert!(barrier.initialized().await.unwrap());
        assert!(physical.get(KEYRING_PATH).await.unwrap().is_some());
        // Initialize must not unseal.
        assert!(barrier.sealed().await);
    }

    #[tokio::test]
    async fn initialize_twice_fails() {
        let (_physical, barrier) = make_barrier();
        let master = Barrier::generate_key();
        barrier.initialize(&master).await.unwrap();
        let err = barrier.initialize(&master).await.unwrap_err();
        assert!(matches!(err, BarrierError::AlreadyInitialized));
    }

    #[tokio::test]
    async fn initialize_rejects_short_key() {
        let (_physical, barrier) = make_barrier();
        let err = barrier.initialize(&[0u8; 15]).await.unwrap_err();
        assert!(matches!(err, BarrierError::InvalidKey { .. }));
    }

    // ── unseal / seal ────────────────────────────────────────────────

    #[tokio::test]
    async fn unseal_uninitialized_fails() {
        let (_physical, barrier) = make_barrier();
        let master = Barrier::generate_key();
        let err = barrier.unseal(&master).await.unwrap_err();
        assert!(matches!(err, BarrierError::NotInitialized));
    }

    #[tokio::test]
    async fn unseal_with_wrong_key_fails() {
        let (_physical, barrier) = make_barrier();
        let master = Barrier::generate_key();
        barrier.initialize(&master).await.unwrap();

        let wrong = Barrier::generate_key();
        let err = barrier.unseal(&wrong).await.unwrap_err();
        assert!(matches!(err, BarrierError::InvalidKey { .. }));
        assert!(barrier.sealed().await);
    }

    #[tokio::test]
    async fn unseal_with_wrong_length_fails() {
        let (_physical, barrier) = make_barrier();
        let master = Barrier::generate_key();
        barrier.initialize(&master).await.unwrap();

        let err = barrier.unseal(&[1u8; 15]).await.unwrap_err();
        match err {
            BarrierError::InvalidKey { reason } => {
                assert_eq!(reason, "key is shorter than minimum 32 bytes");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn unseal_is_idempotent_while_unsealed() {
        let (_physical, barrier) = make_barrier();
        let master = Barrier::generate_key();
        barrier.initialize(&master).await.unwrap();
        barrier.unseal(&master).await.unwrap();
        barrier.unseal(&master).await.unwrap();
        assert!(!barrier.sealed().await);
    }

    #[tokio::test]
    async fn seal_is_idempotent() {
        let (_physical, barrier) = make_barrier();
        barrier.seal().await;
        barrier.seal().await;
        assert!(barrier.sealed().await);
    }

    // ── data operations ──────────────────────────────────────────────

    #[tokio::test]
    async fn sealed_barrier_rejects_data_operations() {
        let (_physical, barrier) = make_barrier();
        assert!(matches!(
            barrier.get("k").await,
            Err(BarrierError::Sealed)
        ));
        assert!(matches!(
            barrier.put("k", b"v").await,
            Err(BarrierError::Sealed)
        ));
        assert!(matches!(
            barrier.delete("k").await,
            Err(BarrierError::Sealed)
        ));
        assert!(matches!(
            barrier.list("p/").await,
            Err(BarrierError::Sealed)
        ));
    }

    #[tokio::test]
    async fn put_get_roundtrip() {
        let (_physical, barrier) = make_barrier();
        let master = Barrier::generate_key();
        barrier.initialize(&master).await.unwrap();
        barrier.unseal(&master).await.unwrap();

        barrier.put("sys/policy/dev", b"rules").await.unwrap();
        let val = barrier.get("sys/policy/dev").await.unwrap();
        assert_eq!(val, Some(b"rules".to_vec()));
    }

    #[tokio::test]
    async fn plaintext_never_reaches_physical_storage() {
        let (physical, barrier) = make_barrier();
        let master = Barrier::generate_key();
        barrier.initialize(&master).await.unwrap();
        barrier.unseal(&master).await.unwrap();

        let plaintext = b"super-secret-db-password";
        barrier.put("secret/db", plaintext).await.unwrap();

        let raw = physical.get("secret/db").await.unwrap().unwrap();
        assert!(!raw
            .windows(plaintext.len())
            .any(|window| window == plaintext));
    }

    #[tokio::test]
    async fn ciphertext_carries_term_prefix() {
        let (physical, barrier) = make_barrier();
        let master = Barrier::generate_key();
        barrier.initialize(&master).await.unwrap();
        barrier.unseal(&master).await.unwrap();

        barrier.put("k", b"v").await.unwrap();
        let raw = physical.get("k").await.unwrap().unwrap();
        assert_eq!(raw[0], ACTIVE_TERM);
    }

    #[tokio::test]
    async fn same_plaintext_produces_distinct_ciphertexts() {
        let (physical, barrier) = make_barrier();
        let master = Barrier::generate_key();
        barrier.initialize(&master).await.unwrap();
        barrier.unseal(&master).await.unwrap();

        barrier.put("a", b"same").await.unwrap();
        barrier.put("b", b"same").await.unwrap();
        let raw_a = physical.get("a").await.unwrap().unwrap();
        let raw_b = physical.get("b").await.unwrap().unwrap();
        assert_ne!(raw_a, raw_b);
    }

    #[tokio::test]
    async fn data_survives_seal_unseal_cycle() {
        let (_physical, barrier) = make_barrier();
        let master = Barrier::generate_key();
        barrier.initialize(&master).await.unwrap();
        barrier.unseal(&master).await.unwrap();

        barrier.put("core/mounts", b"table").await.unwrap();
        barrier.seal().await;
        assert!(matches!(
            barrier.get("core/mounts").await,
            Err(BarrierError::Sealed)
        ));

        barrier.unseal(&master).await.unwrap();
        let val = barrier.get("core/mounts").await.unwrap();
        assert_eq!(val, Some(b"table".to_vec()));
    }

    #[tokio::test]
    async fn unknown_term_rejected() {
        let (physical, barrier) = make_barrier();
        let master = Barrier::generate_key();
        barrier.initialize(&master).await.unwrap();
        barrier.unseal(&master).await.unwrap();

        barrier.put("k", b"v").await.unwrap();
        let mut raw = physical.get("k").await.unwrap().unwrap();
        raw[0] = 9;
        physical.put("k", &raw).await.unwrap();

        let err = barrier.get("k").await.unwrap_err();
        assert!(matches!(err, BarrierError::UnknownTerm { term: 9 }));
    }

    #[tokio::test]
    async fn list_returns_matching_keys() {
        let (_physical, barrier) = make_barrier();
        let master = Barrier::generate_key();
        barrier.initialize(&master).await.unwrap();
        barrier.unseal(&master).await.unwrap();

        barrier.put("sys/expire/a", b"1").await.unwrap();
        barrier.put("sys/expire/b", b"2").await.unwrap();
        barrier.put("core/mounts", b"3").await.unwrap();

        let keys = barrier.list("sys/expire/").await.unwrap();
        assert_eq!(keys, vec!["sys/expire/a", "sys/expire/b"]);
    }

    #[tokio::test]
    async fn generated_keys_are_in_range_and_distinct() {
        let (min, max) = Barrier::key_length();
        let k1 = Barrier::generate_key();
        let k2 = Barrier::generate_key();
        assert!(k1.len() >= min && k1.len() <= max);
        assert_ne!(k1, k2);
    }
}
