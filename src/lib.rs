//! # envault
//!
//! Envelope-encryption file vault.
//!
//! Every file is encrypted with its own random data key (AES-256-GCM). Data
//! keys are wrapped under a versioned master key derived from a passphrase
//! (PBKDF2-HMAC-SHA256). Rotating the master key re-wraps data keys without
//! touching payloads, and an independent HMAC integrity tag lets callers
//! detect tampering before any decryption is attempted.
//!
//! ```no_run
//! use envault::{Vault, VaultConfig};
//!
//! # fn main() -> envault::Result<()> {
//! let vault = Vault::open(&VaultConfig::with_root("vault_data"))?;
//! vault.initialize("correct-horse")?;
//! vault.encrypt("notes.txt", b"hello vault", "correct-horse")?;
//! assert_eq!(vault.decrypt("notes.txt", "correct-horse")?, b"hello vault");
//!
//! vault.rotate("correct-horse")?;
//! let report = vault.rotate_all("correct-horse")?;
//! assert!(report.is_complete());
//! # Ok(())
//! # }
//! ```
//!
//! ## Public API
//!
//! [`Vault`] is the entry point. The storage traits in [`storage`] let callers
//! bring their own persistence. Raw key bytes never leave the crate.

pub(crate) mod crypto;
pub(crate) mod encoding;
pub mod audit;
pub mod config;
pub mod error;
pub mod index;
pub mod integrity;
pub mod kdf;
pub mod key_manager;
pub mod keys;
pub mod storage;
pub mod vault;

pub use config::VaultConfig;
pub use error::{Result, VaultError};
pub use index::VaultEntry;
pub use integrity::{VerifyReport, VerifyStatus};
pub use key_manager::MasterKeyVersion;
pub use vault::{RotationReport, Vault};
