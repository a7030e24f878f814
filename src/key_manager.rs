//! Master key versions: creation, rotation, retirement and derivation.
//!
//! The key manager persists only metadata: per version a salt, an iteration
//! count and an algorithm identifier, plus the integrity key in wrapped form.
//! Raw master keys are derived on demand from the passphrase and live only
//! inside a [`KeySession`] or a returned [`MasterKey`], both zeroized on drop.
//!
//! It never checks a passphrase itself. A wrong passphrase derives a wrong
//! key, which surfaces as [`VaultError::AuthenticationError`] the first time
//! that key unwraps something.
//!
//! # Data loss
//!
//! The salt and iteration count of a version are the only way to re-derive
//! its master key. If that metadata is lost or corrupted, every entry still
//! wrapped under the version is permanently unrecoverable, passphrase or not.
//! Back up the key store together with the index.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};
use zeroize::Zeroizing;

use crate::crypto;
use crate::encoding;
use crate::error::{Result, VaultError};
use crate::integrity::IntegrityVerifier;
use crate::kdf::{self, KeyAlgorithm};
use crate::keys::{self, IntegrityKey, MasterKey, WrappedKey};
use crate::storage::KeyStore;

/// Format version of the persisted [`KeyMetadata`] document.
pub const FORMAT_VERSION: u32 = 1;

/// Metadata of one master key version. Never contains key bytes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MasterKeyVersion {
    pub version_id: u32,
    #[serde(with = "encoding::base64_bytes")]
    pub salt: Vec<u8>,
    pub iteration_count: u32,
    #[serde(default)]
    pub algorithm: KeyAlgorithm,
    /// Public random identifier, handy for display and logs.
    pub key_id: String,
    pub created_at: DateTime<Utc>,
    pub active: bool,
}

/// The whole key metadata document, persisted atomically as one unit.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KeyMetadata {
    pub format_version: u32,
    pub versions: Vec<MasterKeyVersion>,
    /// The integrity key, always wrapped under the active version.
    pub integrity_key: WrappedKey,
}

impl KeyMetadata {
    fn validate(&self) -> Result<()> {
        if self.format_version != FORMAT_VERSION {
            return Err(VaultError::UnsupportedFormat(self.format_version));
        }
        let active = self.versions.iter().filter(|v| v.active).count();
        if active != 1 {
            return Err(VaultError::InvalidParameters(format!(
                "key metadata has {active} active versions, expected exactly 1"
            )));
        }
        Ok(())
    }

    fn active(&self) -> &MasterKeyVersion {
        // `validate` guarantees exactly one active version.
        self.versions
            .iter()
            .find(|v| v.active)
            .unwrap_or(&self.versions[0])
    }

    fn version(&self, version_id: u32) -> Result<&MasterKeyVersion> {
        self.versions
            .iter()
            .find(|v| v.version_id == version_id)
            .ok_or(VaultError::UnknownKeyVersion(version_id))
    }
}

/// Derivation parameters applied to newly created versions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KdfSettings {
    pub iterations: u32,
    pub salt_len: usize,
}

impl Default for KdfSettings {
    fn default() -> Self {
        Self {
            iterations: kdf::DEFAULT_ITERATIONS,
            salt_len: kdf::MIN_SALT_LEN,
        }
    }
}

pub struct KeyManager {
    store: Arc<dyn KeyStore>,
    settings: KdfSettings,
    state: RwLock<Option<KeyMetadata>>,
}

impl std::fmt::Debug for KeyManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyManager")
            .field("settings", &self.settings)
            .field("versions", &self.state.read().as_ref().map(|m| m.versions.len()))
            .finish()
    }
}

fn new_version(
    version_id: u32,
    settings: &KdfSettings,
    iteration_count: u32,
) -> Result<MasterKeyVersion> {
    let mut salt = vec![0u8; settings.salt_len.max(kdf::MIN_SALT_LEN)];
    crypto::fill_random(&mut salt)?;
    let mut key_id = [0u8; 8];
    crypto::fill_random(&mut key_id)?;

    Ok(MasterKeyVersion {
        version_id,
        salt,
        iteration_count,
        algorithm: KeyAlgorithm::default(),
        key_id: hex::encode(key_id),
        created_at: Utc::now(),
        active: true,
    })
}

fn derive_version(passphrase: &[u8], version: &MasterKeyVersion) -> Result<MasterKey> {
    kdf::derive_with(
        version.algorithm,
        passphrase,
        &version.salt,
        version.iteration_count,
    )
}

impl KeyManager {
    /// Open the key manager over `store`, loading any existing metadata.
    pub fn load(store: Arc<dyn KeyStore>, settings: KdfSettings) -> Result<Self> {
        let state = store.load()?;
        if let Some(metadata) = &state {
            metadata.validate()?;
        }
        if settings.iterations < kdf::RECOMMENDED_MIN_ITERATIONS {
            warn!(
                iterations = settings.iterations,
                "configured KDF iteration count is below the recommended minimum"
            );
        }
        Ok(Self {
            store,
            settings,
            state: RwLock::new(state),
        })
    }

    pub fn is_initialized(&self) -> bool {
        self.state.read().is_some()
    }

    /// Create version 0 and the integrity key.
    ///
    /// The version-0 master key is derived once to wrap the integrity key,
    /// which also proves the passphrase and parameters are usable. Only
    /// metadata is persisted.
    pub fn initialize(&self, passphrase: &str) -> Result<MasterKeyVersion> {
        if passphrase.is_empty() {
            return Err(VaultError::EmptyPassphrase);
        }

        let mut state = self.state.write();
        if state.is_some() || self.store.load()?.is_some() {
            return Err(VaultError::AlreadyInitialized);
        }

        let version = new_version(0, &self.settings, self.settings.iterations)?;
        let master = derive_version(passphrase.as_bytes(), &version)?;
        let integrity = IntegrityKey::generate()?;
        let integrity_key = keys::wrap_integrity_key(&master, &integrity, version.version_id)?;

        let metadata = KeyMetadata {
            format_version: FORMAT_VERSION,
            versions: vec![version.clone()],
            integrity_key,
        };
        self.store.save(&metadata)?;
        *state = Some(metadata);

        info!(
            version = version.version_id,
            key_id = %version.key_id,
            "vault key store initialized"
        );
        Ok(version)
    }

    pub fn get_active_version(&self) -> Result<MasterKeyVersion> {
        let state = self.state.read();
        let metadata = state.as_ref().ok_or(VaultError::NotInitialized)?;
        Ok(metadata.active().clone())
    }

    pub fn list_versions(&self) -> Vec<MasterKeyVersion> {
        self.state
            .read()
            .as_ref()
            .map(|m| m.versions.clone())
            .unwrap_or_default()
    }

    /// Derive the master key of `version_id` from `passphrase`.
    pub fn derive_for_version(&self, passphrase: &str, version_id: u32) -> Result<MasterKey> {
        let version = {
            let state = self.state.read();
            let metadata = state.as_ref().ok_or(VaultError::NotInitialized)?;
            metadata.version(version_id)?.clone()
        };
        derive_version(passphrase.as_bytes(), &version)
    }

    /// Create a new active version and demote the current one.
    ///
    /// The integrity key is unwrapped under the current version first, so a
    /// wrong passphrase fails with `AuthenticationError` instead of activating
    /// a version nobody can unlock. The new version never lowers the work
    /// factor. Old versions are kept until retired explicitly.
    pub fn rotate(&self, passphrase: &str) -> Result<MasterKeyVersion> {
        self.rotate_with_passphrase(passphrase, passphrase)
    }

    /// Rotate and change the passphrase in one step.
    ///
    /// `old_passphrase` must unlock the current active version; the new
    /// version is derived from `new_passphrase`. Older versions keep their
    /// old passphrase until their entries are re-wrapped with
    /// [`KeyManager::session_changing_passphrase`].
    pub fn rotate_with_passphrase(
        &self,
        old_passphrase: &str,
        new_passphrase: &str,
    ) -> Result<MasterKeyVersion> {
        if old_passphrase.is_empty() || new_passphrase.is_empty() {
            return Err(VaultError::EmptyPassphrase);
        }

        let mut state = self.state.write();
        let metadata = state.as_ref().ok_or(VaultError::NotInitialized)?;
        let previous = metadata.active().clone();

        let wrapped_under = metadata.version(metadata.integrity_key.master_key_version)?;
        let old_master = derive_version(old_passphrase.as_bytes(), wrapped_under)?;
        let integrity = keys::unwrap_integrity_key(&old_master, &metadata.integrity_key)?;
        drop(old_master);

        let next_id = metadata
            .versions
            .iter()
            .map(|v| v.version_id)
            .max()
            .unwrap_or(previous.version_id)
            + 1;
        let iterations = self.settings.iterations.max(previous.iteration_count);
        let version = new_version(next_id, &self.settings, iterations)?;
        let new_master = derive_version(new_passphrase.as_bytes(), &version)?;
        let integrity_key = keys::wrap_integrity_key(&new_master, &integrity, version.version_id)?;

        let mut updated = metadata.clone();
        for v in &mut updated.versions {
            v.active = false;
        }
        updated.versions.push(version.clone());
        updated.integrity_key = integrity_key;

        // One document write flips both flags, so there is never zero or two
        // active versions on disk.
        self.store.save(&updated)?;
        *state = Some(updated);

        info!(
            from = previous.version_id,
            to = version.version_id,
            iterations,
            passphrase_changed = old_passphrase != new_passphrase,
            "master key rotated"
        );
        Ok(version)
    }

    /// Delete the metadata of an inactive version.
    ///
    /// `references` is called with the version id while the key state is
    /// write-locked and must return how many entries still use it.
    pub fn retire_version(
        &self,
        version_id: u32,
        references: impl FnOnce(u32) -> usize,
    ) -> Result<MasterKeyVersion> {
        let mut state = self.state.write();
        let metadata = state.as_ref().ok_or(VaultError::NotInitialized)?;
        let version = metadata.version(version_id)?.clone();
        if version.active {
            return Err(VaultError::ActiveVersion(version_id));
        }

        let entries = references(version_id);
        if entries > 0 {
            return Err(VaultError::VersionInUse {
                version: version_id,
                entries,
            });
        }

        let mut updated = metadata.clone();
        updated.versions.retain(|v| v.version_id != version_id);
        self.store.save(&updated)?;
        *state = Some(updated);

        info!(version = version_id, "master key version retired");
        Ok(version)
    }

    /// Open a session that derives and caches master keys for one operation.
    pub fn session(&self, passphrase: &str) -> Result<KeySession> {
        self.open_session(passphrase, None)
    }

    /// Open a session for finishing a passphrase change.
    ///
    /// Versions older than the current active one are derived from
    /// `old_passphrase`, the active version and anything newer from
    /// `new_passphrase`.
    pub fn session_changing_passphrase(
        &self,
        old_passphrase: &str,
        new_passphrase: &str,
    ) -> Result<KeySession> {
        let since = self.get_active_version()?.version_id;
        self.open_session(
            new_passphrase,
            Some((since, Zeroizing::new(old_passphrase.as_bytes().to_vec()))),
        )
    }

    fn open_session(
        &self,
        passphrase: &str,
        previous: Option<(u32, Zeroizing<Vec<u8>>)>,
    ) -> Result<KeySession> {
        let mut session = KeySession {
            passphrase: Zeroizing::new(passphrase.as_bytes().to_vec()),
            previous,
            versions: Vec::new(),
            active_version: 0,
            integrity_key: WrappedKey {
                master_key_version: 0,
                wrapped: Vec::new(),
            },
            cache: HashMap::new(),
        };
        self.refresh_snapshot(&mut session)?;
        Ok(session)
    }

    fn refresh_snapshot(&self, session: &mut KeySession) -> Result<()> {
        let state = self.state.read();
        let metadata = state.as_ref().ok_or(VaultError::NotInitialized)?;
        session.versions = metadata.versions.clone();
        session.active_version = metadata.active().version_id;
        session.integrity_key = metadata.integrity_key.clone();
        Ok(())
    }

    /// Bring `session` up to the current active version after a concurrent
    /// rotation.
    ///
    /// Cached master keys of surviving versions are kept. The new active
    /// version is checked against the session's passphrase by unwrapping the
    /// integrity key, so nothing is ever wrapped under a key derived from the
    /// wrong passphrase.
    pub(crate) fn refresh_session(&self, session: &mut KeySession) -> Result<()> {
        self.refresh_snapshot(session)?;
        session.integrity_verifier()?;
        Ok(())
    }

    /// Run `commit` only while `version` is the active version.
    ///
    /// Returns `Ok(None)` without running `commit` when a rotation has moved
    /// the active version on; the caller re-wraps under the new one and
    /// retries. Rotation and retirement are held off until `commit` returns.
    pub(crate) fn commit_if_active<T>(
        &self,
        version: u32,
        commit: impl FnOnce() -> Result<T>,
    ) -> Result<Option<T>> {
        let state = self.state.read();
        let metadata = state.as_ref().ok_or(VaultError::NotInitialized)?;
        if metadata.active().version_id != version {
            return Ok(None);
        }
        commit().map(Some)
    }
}

/// Key material for one vault operation or batch.
///
/// Holds a snapshot of the version metadata and caches each derived master
/// key so a batch derives every version at most once. Everything secret is
/// zeroized when the session drops.
pub struct KeySession {
    passphrase: Zeroizing<Vec<u8>>,
    /// Passphrase for versions below the given id, while a passphrase change
    /// is being rolled out.
    previous: Option<(u32, Zeroizing<Vec<u8>>)>,
    versions: Vec<MasterKeyVersion>,
    active_version: u32,
    integrity_key: WrappedKey,
    cache: HashMap<u32, MasterKey>,
}

impl std::fmt::Debug for KeySession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeySession")
            .field("active_version", &self.active_version)
            .field("cached", &self.cache.len())
            .finish()
    }
}

impl KeySession {
    /// The version new wraps go to, as of when the session opened.
    pub fn active_version(&self) -> u32 {
        self.active_version
    }

    pub(crate) fn master(&mut self, version_id: u32) -> Result<&MasterKey> {
        if !self.cache.contains_key(&version_id) {
            let version = self
                .versions
                .iter()
                .find(|v| v.version_id == version_id)
                .ok_or(VaultError::UnknownKeyVersion(version_id))?;
            let passphrase = match &self.previous {
                Some((since, old)) if version_id < *since => old,
                _ => &self.passphrase,
            };
            let key = derive_version(passphrase, version)?;
            self.cache.insert(version_id, key);
        }
        self.cache
            .get(&version_id)
            .ok_or(VaultError::UnknownKeyVersion(version_id))
    }

    /// Unwrap the integrity key. Fails with `AuthenticationError` on a wrong
    /// passphrase.
    pub(crate) fn integrity_verifier(&mut self) -> Result<IntegrityVerifier> {
        let wrapped = self.integrity_key.clone();
        let master = self.master(wrapped.master_key_version)?;
        let key = keys::unwrap_integrity_key(master, &wrapped)?;
        Ok(IntegrityVerifier::new(&key))
    }
}
