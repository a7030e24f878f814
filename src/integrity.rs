//! Tamper-evident integrity tags.
//!
//! Each entry carries an HMAC-SHA256 tag over its ciphertext and the metadata
//! that decides how it is decrypted:
//!
//! ```text
//! HMAC-SHA256(integrity_key,
//!     "envault-integrity-v1"
//!     || u64be(len(file_id)) || file_id
//!     || nonce (12 bytes)
//!     || u32be(master_key_version)
//!     || u64be(len(ciphertext)) || ciphertext)
//! ```
//!
//! The integrity key is an independent random secret, so holding a data key
//! is not enough to forge a tag. Checking a tag needs no plaintext and no
//! per-entry key derivation, which makes batch verification cheap.

use ring::hmac;
use serde::{Deserialize, Serialize};

use crate::crypto::NONCE_LEN;
use crate::index::VaultEntry;
use crate::keys::IntegrityKey;

const DOMAIN: &[u8] = b"envault-integrity-v1";

/// Computes and checks integrity tags under one integrity key.
pub struct IntegrityVerifier {
    key: hmac::Key,
}

impl IntegrityVerifier {
    pub(crate) fn new(key: &IntegrityKey) -> Self {
        Self {
            key: hmac::Key::new(hmac::HMAC_SHA256, key.as_bytes()),
        }
    }

    fn message(
        ciphertext: &[u8],
        file_id: &str,
        nonce: &[u8; NONCE_LEN],
        master_key_version: u32,
    ) -> Vec<u8> {
        let mut msg = Vec::with_capacity(
            DOMAIN.len() + file_id.len() + NONCE_LEN + ciphertext.len() + 20,
        );
        msg.extend_from_slice(DOMAIN);
        msg.extend_from_slice(&(file_id.len() as u64).to_be_bytes());
        msg.extend_from_slice(file_id.as_bytes());
        msg.extend_from_slice(nonce);
        msg.extend_from_slice(&master_key_version.to_be_bytes());
        msg.extend_from_slice(&(ciphertext.len() as u64).to_be_bytes());
        msg.extend_from_slice(ciphertext);
        msg
    }

    pub fn compute_tag(
        &self,
        ciphertext: &[u8],
        file_id: &str,
        nonce: &[u8; NONCE_LEN],
        master_key_version: u32,
    ) -> Vec<u8> {
        let msg = Self::message(ciphertext, file_id, nonce, master_key_version);
        hmac::sign(&self.key, &msg).as_ref().to_vec()
    }

    /// Recompute the tag for `entry` over `ciphertext` and compare it with
    /// the stored one in constant time.
    pub fn verify(&self, entry: &VaultEntry, ciphertext: &[u8]) -> bool {
        let msg = Self::message(
            ciphertext,
            &entry.file_id,
            &entry.nonce,
            entry.master_key_version,
        );
        hmac::verify(&self.key, &msg, &entry.integrity_tag).is_ok()
    }
}

/// Outcome of checking one entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VerifyStatus {
    /// Tag matches ciphertext and metadata.
    Verified,
    /// Tag mismatch: ciphertext or metadata changed since it was tagged.
    Tampered,
    /// The index references a blob the ciphertext store does not have.
    MissingCiphertext,
    /// The ciphertext store failed to read the blob.
    Unreadable,
}

/// Per-entry result of a batch verification.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VerifyReport {
    pub file_id: String,
    pub master_key_version: u32,
    pub status: VerifyStatus,
}

impl VerifyReport {
    pub fn is_verified(&self) -> bool {
        self.status == VerifyStatus::Verified
    }
}
