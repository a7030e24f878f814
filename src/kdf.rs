//! Passphrase key derivation.
//!
//! `derive` turns a passphrase, a stored salt and a stored iteration count
//! into a 256-bit master key using PBKDF2-HMAC-SHA256. It is deterministic
//! and deliberately expensive. It cannot tell a wrong passphrase from a right
//! one; that only surfaces when an unwrap fails authentication downstream.

use std::num::NonZeroU32;

use ring::pbkdf2;
use serde::{Deserialize, Serialize};

use crate::error::{Result, VaultError};
use crate::keys::MasterKey;

/// Default PBKDF2 work factor for new master key versions.
pub const DEFAULT_ITERATIONS: u32 = 480_000;

/// Below this the vault still works but logs a warning.
pub const RECOMMENDED_MIN_ITERATIONS: u32 = 100_000;

/// Minimum (and default) salt length in bytes.
pub const MIN_SALT_LEN: usize = 16;

/// Algorithm suite recorded on every master key version.
///
/// There is exactly one suite today. Recording it per version means a future
/// suite can be added without losing the ability to unwrap older entries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum KeyAlgorithm {
    /// PBKDF2-HMAC-SHA256 key stretching, AES-256-GCM wrapping.
    #[default]
    #[serde(rename = "pbkdf2-sha256/aes-256-gcm")]
    Pbkdf2Sha256Aes256Gcm,
}

/// Derive a master key from `passphrase` with the default algorithm suite.
pub fn derive(passphrase: &[u8], salt: &[u8], iteration_count: u32) -> Result<MasterKey> {
    derive_with(KeyAlgorithm::default(), passphrase, salt, iteration_count)
}

/// Derive a master key using the suite recorded on a key version.
///
/// The output is never logged or persisted. It is zeroized when the returned
/// `MasterKey` is dropped.
pub fn derive_with(
    algorithm: KeyAlgorithm,
    passphrase: &[u8],
    salt: &[u8],
    iteration_count: u32,
) -> Result<MasterKey> {
    let iterations = NonZeroU32::new(iteration_count)
        .ok_or_else(|| VaultError::InvalidParameters("iteration count must be non-zero".into()))?;
    if salt.len() < MIN_SALT_LEN {
        return Err(VaultError::InvalidParameters(format!(
            "salt must be at least {MIN_SALT_LEN} bytes"
        )));
    }

    let mut key = MasterKey::zeroed();
    match algorithm {
        KeyAlgorithm::Pbkdf2Sha256Aes256Gcm => pbkdf2::derive(
            pbkdf2::PBKDF2_HMAC_SHA256,
            iterations,
            salt,
            passphrase,
            key.as_bytes_mut(),
        ),
    }
    Ok(key)
}
