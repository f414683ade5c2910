//! Error types for `coffer-core`.
//!
//! Each subsystem has its own error enum; conversions happen at the seams
//! via `#[from]`. [`CoreError`] is the only type that crosses the public
//! request API. Diagnostic detail from storage and audit failures is logged
//! with `tracing` and collapsed to [`CoreError::Internal`] so that nothing
//! about the failure leaks to clients. Crypto errors never include key
//! material.

use coffer_storage::StorageError;

/// Errors from the AEAD layer.
#[derive(Debug, thiserror::Error)]
pub enum CryptoError {
    /// Sealing failed inside the AEAD. Practically unreachable for
    /// AES-256-GCM over inputs the barrier produces.
    #[error("sealing failed")]
    SealFailure,

    /// The wire value did not authenticate: wrong key, corruption, or a
    /// tampered tag. The cases are deliberately indistinguishable.
    #[error("ciphertext authentication failed")]
    Unauthentic,

    /// The wire value is shorter than a nonce and tag.
    #[error("wire value too short: {actual} bytes, need at least {min}")]
    Truncated { min: usize, actual: usize },

    /// A raw key had the wrong length.
    #[error("invalid key length: expected {expected} bytes, got {actual}")]
    InvalidKeyLength { expected: usize, actual: usize },
}

/// Errors from the Shamir split/combine primitive.
#[derive(Debug, thiserror::Error)]
pub enum ShamirError {
    /// Splitting the secret failed.
    #[error("secret split failed: {reason}")]
    Split { reason: String },

    /// Combining the provided shares failed.
    #[error("secret recovery failed: {reason}")]
    Combine { reason: String },
}

/// Errors from the security barrier.
#[derive(Debug, thiserror::Error)]
pub enum BarrierError {
    /// The barrier is sealed — no data operations are possible.
    #[error("barrier is sealed")]
    Sealed,

    /// The barrier already holds a keyring.
    #[error("barrier is already initialized")]
    AlreadyInitialized,

    /// No keyring exists in the physical store.
    #[error("barrier is not initialized")]
    NotInitialized,

    /// The provided master key is unusable.
    #[error("invalid key: {reason}")]
    InvalidKey { reason: String },

    /// A ciphertext carried a key term this barrier does not know.
    #[error("ciphertext has unknown key term {term}")]
    UnknownTerm { term: u8 },

    /// The persisted keyring record could not be decoded.
    #[error("keyring record invalid: {reason}")]
    Keyring { reason: String },

    /// A cryptographic operation within the barrier failed.
    #[error("barrier crypto error: {0}")]
    Crypto(#[from] CryptoError),

    /// The physical backend returned an error.
    #[error("barrier storage error: {0}")]
    Storage(#[from] StorageError),
}

/// Errors returned by logical and credential backends.
#[derive(Debug, thiserror::Error)]
pub enum BackendError {
    /// The request was malformed for this backend.
    #[error("{0}")]
    InvalidRequest(String),

    /// The backend does not serve this operation on this path.
    #[error("unsupported operation on '{path}'")]
    Unsupported { path: String },

    /// The barrier returned an error.
    #[error("backend barrier error: {0}")]
    Barrier(#[from] BarrierError),

    /// Internal backend failure.
    #[error("backend internal error: {reason}")]
    Internal { reason: String },
}

/// Errors from the router.
#[derive(Debug, thiserror::Error)]
pub enum RouteError {
    /// No mount serves the given path.
    #[error("no handler for path '{path}'")]
    NoMount { path: String },

    /// A mount would overlap an existing mount prefix.
    #[error("mount conflict at '{path}'")]
    MountConflict { path: String },

    /// The prefix is not mounted.
    #[error("no mount at '{path}'")]
    NotMounted { path: String },

    /// The routed backend failed.
    #[error(transparent)]
    Backend(#[from] BackendError),
}

/// Errors from mount-table handling.
#[derive(Debug, thiserror::Error)]
pub enum MountError {
    /// A persisted mount table failed to encode or decode.
    #[error("mount table at '{path}' is invalid: {reason}")]
    Invalid { path: String, reason: String },

    /// The barrier returned an error.
    #[error("mount table barrier error: {0}")]
    Barrier(#[from] BarrierError),
}

/// Errors from the token store.
#[derive(Debug, thiserror::Error)]
pub enum TokenError {
    /// The token does not exist (or was revoked).
    #[error("token not found")]
    NotFound,

    /// A token entry failed to encode or decode.
    #[error("token entry invalid: {reason}")]
    Serialization { reason: String },

    /// The barrier returned an error.
    #[error("token barrier error: {0}")]
    Barrier(#[from] BarrierError),
}

/// Errors from the policy store.
#[derive(Debug, thiserror::Error)]
pub enum PolicyError {
    /// The named policy does not exist.
    #[error("policy not found: {name}")]
    NotFound { name: String },

    /// The policy document is invalid.
    #[error("invalid policy: {reason}")]
    Invalid { reason: String },

    /// The built-in `root` policy cannot be changed.
    #[error("cannot modify built-in policy: {name}")]
    Protected { name: String },

    /// The barrier returned an error.
    #[error("policy barrier error: {0}")]
    Barrier(#[from] BarrierError),
}

/// Errors from the expiration manager.
#[derive(Debug, thiserror::Error)]
pub enum LeaseError {
    /// The lease does not exist.
    #[error("lease not found: {lease_id}")]
    NotFound { lease_id: String },

    /// The lease cannot be renewed.
    #[error("lease is not renewable: {lease_id}")]
    NotRenewable { lease_id: String },

    /// A lease record failed to encode or decode.
    #[error("lease entry invalid: {reason}")]
    Serialization { reason: String },

    /// The issuing backend's revoke hook failed.
    #[error("lease revocation failed for '{lease_id}': {reason}")]
    Revocation { lease_id: String, reason: String },

    /// The barrier returned an error.
    #[error("lease barrier error: {0}")]
    Barrier(#[from] BarrierError),
}

/// Errors from the audit broker.
#[derive(Debug, thiserror::Error)]
pub enum AuditError {
    /// An audit sink failed to record an event. Unaudited operations must
    /// not proceed, so this fails the request.
    #[error("audit sink '{name}' failed: {reason}")]
    SinkFailure { name: String, reason: String },

    /// An audit event failed to serialize.
    #[error("audit serialization failed: {reason}")]
    Serialization { reason: String },
}

/// Errors surfaced by the Core's public API.
#[derive(Debug, thiserror::Error)]
pub enum CoreError {
    /// The store is sealed; unseal before any operation.
    #[error("coffer is sealed")]
    Sealed,

    /// This node is a standby; redirect to the active node.
    #[error("coffer is in standby mode")]
    Standby,

    /// Unseal was attempted before initialization.
    #[error("coffer is not initialized")]
    NotInitialized,

    /// Initialize was attempted on an initialized store.
    #[error("coffer is already initialized")]
    AlreadyInitialized,

    /// An unseal key was the wrong length or unrecoverable.
    #[error("invalid key: {reason}")]
    InvalidKey { reason: String },

    /// The token or ACL check failed.
    #[error("permission denied")]
    PermissionDenied,

    /// The request was malformed; the message is safe to show the client.
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// Leader queried without an HA-capable physical backend.
    #[error("coffer is not configured for highly-available mode")]
    HaNotEnabled,

    /// Opaque internal failure; full detail is in the logs.
    #[error("internal error")]
    Internal,
}
