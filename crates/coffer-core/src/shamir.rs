//! Shamir secret-sharing wrapper.
//!
//! Thin layer over the `sharks` crate: splits the master key into N shares
//! of which any T reconstruct it, and any T-1 reveal nothing. Callers hand
//! in and receive `Zeroizing` buffers so key material is wiped on every
//! exit path.
//!
//! Each share carries a 1-byte x-coordinate in front of the secret bytes,
//! which is why unseal accepts keys one byte longer than the barrier's
//! maximum raw key length.

use sharks::{Share, Sharks};
use zeroize::Zeroizing;

use crate::error::ShamirError;

/// Bytes a share adds on top of the secret length.
pub const SHARE_OVERHEAD: usize = 1;

/// Split `secret` into `shares` parts with reconstruction threshold
/// `threshold`.
///
/// # Errors
///
/// Returns [`ShamirError::Split`] if the parameters are out of range
/// (`1 ≤ threshold ≤ shares`).
pub fn split(
    secret: &[u8],
    shares: u8,
    threshold: u8,
) -> Result<Vec<Zeroizing<Vec<u8>>>, ShamirError> {
    if shares == 0 || threshold == 0 || threshold > shares {
        return Err(ShamirError::Split {
            reason: format!("invalid share parameters: {threshold} of {shares}"),
        });
    }

    let dealer = Sharks(threshold);
    let parts: Vec<Zeroizing<Vec<u8>>> = dealer
        .dealer(secret)
        .take(usize::from(shares))
        .map(|share| Zeroizing::new(Vec::from(&share)))
        .collect();
    Ok(parts)
}

/// Reconstruct the secret from at least `threshold` distinct shares.
///
/// # Errors
///
/// Returns [`ShamirError::Combine`] if a share is malformed or the set is
/// insufficient.
pub fn combine(
    parts: &[Zeroizing<Vec<u8>>],
    threshold: u8,
) -> Result<Zeroizing<Vec<u8>>, ShamirError> {
    let shares: Result<Vec<Share>, ShamirError> = parts
        .iter()
        .map(|bytes| {
            Share::try_from(bytes.as_slice()).map_err(|e| ShamirError::Combine {
                reason: format!("malformed share: {e}"),
            })
        })
        .collect();
    let shares = shares?;

    let secret = Sharks(threshold)
        .recover(&shares)
        .map_err(|e| ShamirError::Combine {
            reason: e.to_string(),
        })?;
    Ok(Zeroizing::new(secret))
}
