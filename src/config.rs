//! Vault configuration.
//!
//! ```toml
//! root = "/var/lib/envault"
//! kdf_iterations = 480000
//! salt_len = 16
//! audit_log = "/var/log/envault/audit.jsonl"
//! ```
//!
//! Every field is optional; missing fields take the defaults below.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{Result, VaultError};
use crate::kdf;
use crate::key_manager::KdfSettings;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct VaultConfig {
    /// Directory holding `keys.json`, `index/` and `blobs/`.
    pub root: PathBuf,
    /// PBKDF2 iterations for newly created master key versions.
    pub kdf_iterations: u32,
    /// Salt length in bytes for new versions. At least 16.
    pub salt_len: usize,
    /// Append audit records as JSON lines to this file.
    pub audit_log: Option<PathBuf>,
}

impl Default for VaultConfig {
    fn default() -> Self {
        Self {
            root: PathBuf::from("vault_data"),
            kdf_iterations: kdf::DEFAULT_ITERATIONS,
            salt_len: kdf::MIN_SALT_LEN,
            audit_log: None,
        }
    }
}

impl VaultConfig {
    /// Default configuration rooted at `root`.
    pub fn with_root(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            ..Self::default()
        }
    }

    pub fn from_toml_str(s: &str) -> Result<Self> {
        let config: Self =
            toml::from_str(s).map_err(|e| VaultError::InvalidConfig(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_toml_str(&text)
    }

    pub fn validate(&self) -> Result<()> {
        if self.kdf_iterations == 0 {
            return Err(VaultError::InvalidConfig(
                "kdf_iterations must be at least 1".into(),
            ));
        }
        if self.salt_len < kdf::MIN_SALT_LEN {
            return Err(VaultError::InvalidConfig(format!(
                "salt_len must be at least {}",
                kdf::MIN_SALT_LEN
            )));
        }
        Ok(())
    }

    pub fn kdf_settings(&self) -> KdfSettings {
        KdfSettings {
            iterations: self.kdf_iterations,
            salt_len: self.salt_len,
        }
    }

    pub fn key_store_path(&self) -> PathBuf {
        self.root.join("keys.json")
    }

    pub fn index_dir(&self) -> PathBuf {
        self.root.join("index")
    }

    pub fn blob_dir(&self) -> PathBuf {
        self.root.join("blobs")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_from_empty_toml() {
        let config = VaultConfig::from_toml_str("").unwrap();
        assert_eq!(config, VaultConfig::default());
        assert_eq!(config.kdf_iterations, 480_000);
    }

    #[test]
    fn test_partial_toml() {
        let config = VaultConfig::from_toml_str(
            r#"
            root = "/tmp/v"
            kdf_iterations = 1000
            "#,
        )
        .unwrap();
        assert_eq!(config.root, PathBuf::from("/tmp/v"));
        assert_eq!(config.kdf_iterations, 1000);
        assert_eq!(config.salt_len, 16);
        assert_eq!(config.key_store_path(), PathBuf::from("/tmp/v/keys.json"));
    }

    #[test]
    fn test_rejects_weak_salt_and_unknown_fields() {
        assert!(matches!(
            VaultConfig::from_toml_str("salt_len = 8"),
            Err(VaultError::InvalidConfig(_))
        ));
        assert!(matches!(
            VaultConfig::from_toml_str("kdf_iterations = 0"),
            Err(VaultError::InvalidConfig(_))
        ));
        assert!(matches!(
            VaultConfig::from_toml_str("cipher = \"des\""),
            Err(VaultError::InvalidConfig(_))
        ));
    }
}
