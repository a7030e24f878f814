//! Error types for envault.
//!
//! Every variant is a distinct failure mode of the vault. Messages are
//! intentionally minimal: they signal *what* failed without revealing
//! anything about key material or plaintext.

use thiserror::Error;

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, VaultError>;

/// The single error type for all envault operations.
#[derive(Debug, Error)]
pub enum VaultError {
    /// No metadata is recorded for this master key version. Every entry still
    /// wrapped under it is unrecoverable.
    #[error("unknown master key version: {0}")]
    UnknownKeyVersion(u32),

    /// A wrapped key failed authentication: wrong passphrase or a corrupted
    /// wrapped key. Retrying with the correct passphrase can succeed.
    #[error("authentication failed: wrong passphrase or corrupted wrapped key")]
    AuthenticationError,

    /// The integrity tag of an entry does not match its ciphertext and
    /// metadata. Raised before any decryption is attempted.
    #[error("integrity violation: {0}")]
    IntegrityViolation(String),

    /// The AEAD open of the payload failed independently of the integrity tag.
    #[error("decryption failed")]
    DecryptionError,

    /// No vault entry is recorded for this file id.
    #[error("entry not found: {0}")]
    EntryNotFound(String),

    /// A master key version cannot be retired while entries reference it.
    #[error("master key version {version} is still referenced by {entries} entries")]
    VersionInUse { version: u32, entries: usize },

    /// The active master key version cannot be retired.
    #[error("master key version {0} is active")]
    ActiveVersion(u32),

    /// The key store holds no master key metadata yet.
    #[error("vault is not initialized")]
    NotInitialized,

    /// `initialize` was called on a key store that already has metadata.
    #[error("vault is already initialized")]
    AlreadyInitialized,

    #[error("passphrase must not be empty")]
    EmptyPassphrase,

    /// The index references a blob the ciphertext store does not have.
    #[error("ciphertext missing for entry: {0}")]
    CiphertextMissing(String),

    /// A cryptographic parameter was out of range (zero iterations, bad key
    /// length, malformed wrapped key).
    #[error("invalid parameters: {0}")]
    InvalidParameters(String),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// The underlying `ring` seal operation returned an error.
    #[error("encryption failed")]
    EncryptionFailure,

    /// The system's random number generator failed to produce bytes.
    #[error("randomness source failed")]
    RandomnessFailure,

    /// A persisted document carries a format version this build cannot read.
    #[error("unsupported format version: {0}")]
    UnsupportedFormat(u32),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl VaultError {
    /// Process exit code a command-line front end should use for this error.
    ///
    /// Authentication, integrity and lookup failures get distinct codes so
    /// scripts can tell them apart from unexpected internal failures.
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::AuthenticationError => 2,
            Self::IntegrityViolation(_) => 3,
            Self::EntryNotFound(_) => 4,
            Self::DecryptionError => 5,
            _ => 1,
        }
    }
}
