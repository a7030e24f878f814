//! Key material and key wrapping.
//!
//! This module owns two responsibilities:
//! 1. Holding raw key material in types that are opaque, non-cloneable and
//!    zeroised on drop.
//! 2. Wrapping (authenticated-encrypting) one key under a master key, with
//!    associated data that binds the wrap to its purpose.
//!
//! ## Wrap binding
//!
//! ```text
//! data key:      AES-256-GCM(master, aad = "envault:data-key:{version}:{file_id}")
//! integrity key: AES-256-GCM(master, aad = "envault:integrity-key:{version}")
//! ```
//!
//! A wrapped data key copied onto another entry, or relabelled with another
//! version, fails authentication on unwrap.

use serde::{Deserialize, Serialize};
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::crypto::{self, KEY_LEN};
use crate::encoding;
use crate::error::{Result, VaultError};

macro_rules! secret_key_type {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Zeroize, ZeroizeOnDrop)]
        pub struct $name {
            bytes: [u8; KEY_LEN],
        }

        impl $name {
            pub(crate) fn zeroed() -> Self {
                Self { bytes: [0u8; KEY_LEN] }
            }

            /// Borrow the raw key bytes. `pub(crate)`: raw bytes never leave the crate.
            pub(crate) fn as_bytes(&self) -> &[u8; KEY_LEN] {
                &self.bytes
            }

            pub(crate) fn as_bytes_mut(&mut self) -> &mut [u8; KEY_LEN] {
                &mut self.bytes
            }
        }

        impl std::fmt::Debug for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.debug_struct(stringify!($name))
                    .field("bytes", &"[REDACTED]")
                    .finish()
            }
        }
    };
}

secret_key_type!(
    /// A master key derived from the passphrase for one key version.
    ///
    /// - Not `Clone`.
    /// - Zeroised on drop.
    MasterKey
);

secret_key_type!(
    /// A random per-file data key. Encrypts exactly one payload.
    DataKey
);

secret_key_type!(
    /// The secret keying the integrity tags. Independent of every master and
    /// data key; stored only in wrapped form.
    IntegrityKey
);

impl DataKey {
    /// Generate a full-entropy data key in place.
    pub(crate) fn generate() -> Result<Self> {
        let mut key = Self::zeroed();
        crypto::fill_random(key.as_bytes_mut())?;
        Ok(key)
    }
}

impl IntegrityKey {
    pub(crate) fn generate() -> Result<Self> {
        let mut key = Self::zeroed();
        crypto::fill_random(key.as_bytes_mut())?;
        Ok(key)
    }
}

/// A key wrapped under a specific master key version.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WrappedKey {
    pub master_key_version: u32,
    #[serde(with = "encoding::base64_bytes")]
    pub wrapped: Vec<u8>,
}

fn data_key_aad(file_id: &str, version: u32) -> Vec<u8> {
    format!("envault:data-key:{version}:{file_id}").into_bytes()
}

fn integrity_key_aad(version: u32) -> Vec<u8> {
    format!("envault:integrity-key:{version}").into_bytes()
}

fn unwrap_into(
    master: &MasterKey,
    aad: &[u8],
    wrapped: &[u8],
    out: &mut [u8; KEY_LEN],
) -> Result<()> {
    let mut plain = crypto::open_prefixed(master.as_bytes(), aad, wrapped)
        .map_err(|_| VaultError::AuthenticationError)?;
    if plain.len() != KEY_LEN {
        plain.zeroize();
        return Err(VaultError::AuthenticationError);
    }
    out.copy_from_slice(&plain);
    plain.zeroize();
    Ok(())
}

/// Wrap a data key for `file_id` under the master key of `version`.
///
/// Output layout: `[12-byte nonce][ciphertext + 16-byte tag]`.
pub(crate) fn wrap_data_key(
    master: &MasterKey,
    data_key: &DataKey,
    file_id: &str,
    version: u32,
) -> Result<Vec<u8>> {
    crypto::seal_prefixed(
        master.as_bytes(),
        &data_key_aad(file_id, version),
        data_key.as_bytes(),
    )
}

/// Unwrap a data key. A wrong master key (wrong passphrase) or a corrupted or
/// transplanted wrap fails with [`VaultError::AuthenticationError`].
pub(crate) fn unwrap_data_key(
    master: &MasterKey,
    wrapped: &[u8],
    file_id: &str,
    version: u32,
) -> Result<DataKey> {
    let mut key = DataKey::zeroed();
    unwrap_into(master, &data_key_aad(file_id, version), wrapped, key.as_bytes_mut())?;
    Ok(key)
}

pub(crate) fn wrap_integrity_key(
    master: &MasterKey,
    key: &IntegrityKey,
    version: u32,
) -> Result<WrappedKey> {
    let wrapped =
        crypto::seal_prefixed(master.as_bytes(), &integrity_key_aad(version), key.as_bytes())?;
    Ok(WrappedKey {
        master_key_version: version,
        wrapped,
    })
}

pub(crate) fn unwrap_integrity_key(
    master: &MasterKey,
    wrapped: &WrappedKey,
) -> Result<IntegrityKey> {
    let mut key = IntegrityKey::zeroed();
    unwrap_into(
        master,
        &integrity_key_aad(wrapped.master_key_version),
        &wrapped.wrapped,
        key.as_bytes_mut(),
    )?;
    Ok(key)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::{NONCE_LEN, TAG_LEN};

    fn master(byte: u8) -> MasterKey {
        let mut key = MasterKey::zeroed();
        key.as_bytes_mut().fill(byte);
        key
    }

    #[test]
    fn test_data_key_generation() {
        let a = DataKey::generate().unwrap();
        let b = DataKey::generate().unwrap();
        assert_ne!(a.as_bytes(), b.as_bytes(), "random keys must differ");
    }

    #[test]
    fn test_wrap_unwrap_roundtrip() {
        let mk = master(42);
        let dk = DataKey::generate().unwrap();
        let wrapped = wrap_data_key(&mk, &dk, "notes.txt", 0).unwrap();
        assert_eq!(wrapped.len(), NONCE_LEN + KEY_LEN + TAG_LEN);

        let back = unwrap_data_key(&mk, &wrapped, "notes.txt", 0).unwrap();
        assert_eq!(dk.as_bytes(), back.as_bytes());
    }

    #[test]
    fn test_unwrap_wrong_master_is_authentication_error() {
        let dk = DataKey::generate().unwrap();
        let wrapped = wrap_data_key(&master(1), &dk, "notes.txt", 0).unwrap();
        assert!(matches!(
            unwrap_data_key(&master(2), &wrapped, "notes.txt", 0),
            Err(VaultError::AuthenticationError)
        ));
    }

    #[test]
    fn test_wrap_is_bound_to_file_and_version() {
        let mk = master(9);
        let dk = DataKey::generate().unwrap();
        let wrapped = wrap_data_key(&mk, &dk, "a.txt", 3).unwrap();

        assert!(unwrap_data_key(&mk, &wrapped, "b.txt", 3).is_err());
        assert!(unwrap_data_key(&mk, &wrapped, "a.txt", 4).is_err());
    }

    #[test]
    fn test_integrity_key_wrap_roundtrip() {
        let mk = master(5);
        let ik = IntegrityKey::generate().unwrap();
        let wrapped = wrap_integrity_key(&mk, &ik, 7).unwrap();
        assert_eq!(wrapped.master_key_version, 7);

        let back = unwrap_integrity_key(&mk, &wrapped).unwrap();
        assert_eq!(ik.as_bytes(), back.as_bytes());
        assert!(unwrap_integrity_key(&master(6), &wrapped).is_err());
    }

    #[test]
    fn test_debug_is_redacted() {
        let rendered = format!("{:?}", master(0xAB));
        assert!(rendered.contains("REDACTED"));
        assert!(!rendered.contains("171"));
    }
}
