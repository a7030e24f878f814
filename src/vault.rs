//! The vault engine: per-file envelope encryption.
//!
//! ```text
//! passphrase ──PBKDF2──▶ master key (per version)
//!                            │ wraps
//!                            ├──▶ integrity key ──HMAC──▶ integrity tag
//!                            └──▶ data key (per file) ──AES-256-GCM──▶ ciphertext
//! ```
//!
//! Every file gets a fresh random data key and nonce on every encryption.
//! Rotating the master key only re-wraps data keys; payloads are never
//! re-encrypted. The integrity tag is checked before any decryption.

use std::sync::Arc;

use chrono::Utc;
use parking_lot::Mutex;
use rayon::prelude::*;
use tracing::{debug, info, warn};
use zeroize::Zeroizing;

use crate::audit::{AuditLog, AuditOperation, AuditRecord, AuditSink, FileAuditSink};
use crate::config::VaultConfig;
use crate::crypto;
use crate::error::{Result, VaultError};
use crate::index::{EntryLock, VaultEntry, VaultIndex};
use crate::integrity::{IntegrityVerifier, VerifyReport, VerifyStatus};
use crate::key_manager::{KeyManager, KeySession, MasterKeyVersion};
use crate::keys::{self, DataKey};
use crate::storage::{
    BlobStore, FileKeyStore, FsBlobStore, IndexStore, JsonDirIndexStore, KeyStore,
    MemoryBlobStore, MemoryIndexStore, MemoryKeyStore,
};

/// Outcome of [`Vault::rotate_all`].
#[derive(Debug, Default)]
pub struct RotationReport {
    /// The version entries were moved to.
    pub active_version: u32,
    pub rewrapped: Vec<String>,
    /// Deleted or already moved by a concurrent writer before their turn.
    pub skipped: Vec<String>,
    pub failed: Vec<(String, VaultError)>,
}

impl RotationReport {
    pub fn is_complete(&self) -> bool {
        self.failed.is_empty()
    }
}

/// An envelope-encryption vault over injected key, index and blob stores.
///
/// `Vault` is `Send + Sync`. Operations on different files run in parallel;
/// writers on the same file are serialized by the index's entry locks.
pub struct Vault {
    keys: KeyManager,
    index: VaultIndex,
    blobs: Arc<dyn BlobStore>,
    audit: Mutex<AuditLog>,
}

impl std::fmt::Debug for Vault {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Vault")
            .field("keys", &self.keys)
            .field("index", &self.index)
            .finish()
    }
}

fn new_ciphertext_ref() -> Result<String> {
    let mut raw = [0u8; 16];
    crypto::fill_random(&mut raw)?;
    Ok(hex::encode(raw))
}

fn validate_file_id(file_id: &str) -> Result<()> {
    if file_id.is_empty() {
        return Err(VaultError::InvalidParameters("file id must not be empty".into()));
    }
    Ok(())
}

impl Vault {
    /// Open (or prepare) an on-disk vault under `config.root`.
    pub fn open(config: &VaultConfig) -> Result<Self> {
        config.validate()?;
        let vault = Self::with_stores(
            config,
            Arc::new(FileKeyStore::new(config.key_store_path())),
            Arc::new(JsonDirIndexStore::new(config.index_dir())),
            Arc::new(FsBlobStore::new(config.blob_dir())),
        )?;
        if let Some(path) = &config.audit_log {
            vault.add_audit_sink(Box::new(FileAuditSink::new(path)?));
        }
        info!(root = %config.root.display(), entries = vault.index.len(), "vault opened");
        Ok(vault)
    }

    /// A vault that lives only in memory.
    pub fn in_memory(config: &VaultConfig) -> Result<Self> {
        config.validate()?;
        Self::with_stores(
            config,
            Arc::new(MemoryKeyStore::new()),
            Arc::new(MemoryIndexStore::new()),
            Arc::new(MemoryBlobStore::new()),
        )
    }

    pub fn with_stores(
        config: &VaultConfig,
        key_store: Arc<dyn KeyStore>,
        index_store: Arc<dyn IndexStore>,
        blobs: Arc<dyn BlobStore>,
    ) -> Result<Self> {
        Ok(Self {
            keys: KeyManager::load(key_store, config.kdf_settings())?,
            index: VaultIndex::load(index_store)?,
            blobs,
            audit: Mutex::new(AuditLog::new()),
        })
    }

    // -----------------------------------------------------------------------
    // Key management
    // -----------------------------------------------------------------------

    pub fn initialize(&self, passphrase: &str) -> Result<MasterKeyVersion> {
        self.keys.initialize(passphrase)
    }

    pub fn is_initialized(&self) -> bool {
        self.keys.is_initialized()
    }

    pub fn key_manager(&self) -> &KeyManager {
        &self.keys
    }

    pub fn active_version(&self) -> Result<MasterKeyVersion> {
        self.keys.get_active_version()
    }

    pub fn key_versions(&self) -> Vec<MasterKeyVersion> {
        self.keys.list_versions()
    }

    /// Activate a new master key version. Existing entries stay readable
    /// under their old version until re-wrapped.
    pub fn rotate(&self, passphrase: &str) -> Result<MasterKeyVersion> {
        let version = self.keys.rotate(passphrase)?;
        self.record(AuditRecord::key(AuditOperation::Rotate, version.version_id));
        Ok(version)
    }

    /// Rotate and switch to `new_passphrase` for the new version.
    ///
    /// Entries stay on their old version, readable only with the old
    /// passphrase, until [`Vault::rotate_all_with_passphrase`] moves them.
    pub fn rotate_with_passphrase(
        &self,
        old_passphrase: &str,
        new_passphrase: &str,
    ) -> Result<MasterKeyVersion> {
        let version = self
            .keys
            .rotate_with_passphrase(old_passphrase, new_passphrase)?;
        self.record(AuditRecord::key(AuditOperation::Rotate, version.version_id));
        Ok(version)
    }

    /// Delete an inactive version no entry references any more.
    pub fn retire_version(&self, version_id: u32) -> Result<MasterKeyVersion> {
        let retired = self
            .keys
            .retire_version(version_id, |v| self.index.count_referencing(v))?;
        self.record(AuditRecord::key(AuditOperation::RetireVersion, version_id));
        Ok(retired)
    }

    // -----------------------------------------------------------------------
    // Entries
    // -----------------------------------------------------------------------

    pub fn entry(&self, file_id: &str) -> Option<VaultEntry> {
        self.index.get(file_id)
    }

    /// All entries, ordered by file id.
    pub fn list(&self) -> Vec<VaultEntry> {
        self.index.list()
    }

    fn require_entry(&self, file_id: &str) -> Result<VaultEntry> {
        self.index
            .get(file_id)
            .ok_or_else(|| VaultError::EntryNotFound(file_id.to_string()))
    }

    /// Open a key session and unlock the integrity key.
    fn unlock(&self, passphrase: &str) -> Result<(KeySession, IntegrityVerifier)> {
        let mut session = self.keys.session(passphrase)?;
        let verifier = session.integrity_verifier()?;
        Ok((session, verifier))
    }

    /// Encrypt `plaintext` as `file_id`, replacing any previous version.
    pub fn encrypt(&self, file_id: &str, plaintext: &[u8], passphrase: &str) -> Result<VaultEntry> {
        validate_file_id(file_id)?;
        let (mut session, verifier) = self.unlock(passphrase)?;

        let lock = self.index.lock_entry(file_id);
        let previous = self.index.get(file_id);
        let entry = self.seal_locked(&lock, &mut session, &verifier, plaintext, previous.as_ref())?;

        debug!(file_id, version = entry.master_key_version, "encrypted");
        self.record(AuditRecord::file(AuditOperation::Encrypt, file_id, entry.master_key_version));
        Ok(entry)
    }

    /// Decrypt `file_id`.
    ///
    /// Checks run in order: entry lookup, passphrase (integrity key unwrap),
    /// integrity tag, data key unwrap, AEAD open.
    pub fn decrypt(&self, file_id: &str, passphrase: &str) -> Result<Vec<u8>> {
        self.require_entry(file_id)?;
        let (mut session, verifier) = self.unlock(passphrase)?;

        let _lock = self.index.lock_entry(file_id);
        let entry = self.require_entry(file_id)?;
        let plaintext = self.open_locked(&entry, &mut session, &verifier)?;

        debug!(file_id, version = entry.master_key_version, "decrypted");
        self.record(AuditRecord::file(AuditOperation::Decrypt, file_id, entry.master_key_version));
        Ok(plaintext)
    }

    /// Replace the content of an existing entry.
    ///
    /// The current content is fully decrypted first, so a wrong passphrase
    /// or tampered entry is reported rather than silently overwritten. The
    /// new content gets a fresh data key and nonce.
    pub fn reencrypt(
        &self,
        file_id: &str,
        new_plaintext: &[u8],
        passphrase: &str,
    ) -> Result<VaultEntry> {
        self.require_entry(file_id)?;
        let (mut session, verifier) = self.unlock(passphrase)?;

        let lock = self.index.lock_entry(file_id);
        let current = self.require_entry(file_id)?;
        drop(Zeroizing::new(self.open_locked(&current, &mut session, &verifier)?));
        let entry =
            self.seal_locked(&lock, &mut session, &verifier, new_plaintext, Some(&current))?;

        debug!(file_id, version = entry.master_key_version, "re-encrypted");
        self.record(AuditRecord::file(
            AuditOperation::Reencrypt,
            file_id,
            entry.master_key_version,
        ));
        Ok(entry)
    }

    /// Remove an entry and its ciphertext.
    ///
    /// The index record goes first: a failure in between leaves an orphaned
    /// blob, never an entry pointing at nothing.
    pub fn delete(&self, file_id: &str) -> Result<VaultEntry> {
        let lock = self.index.lock_entry(file_id);
        let removed = self
            .index
            .remove(&lock)?
            .ok_or_else(|| VaultError::EntryNotFound(file_id.to_string()))?;

        if let Err(e) = self.blobs.delete(&removed.ciphertext_ref) {
            warn!(
                file_id,
                ciphertext_ref = %removed.ciphertext_ref,
                "entry removed but blob delete failed: {e}"
            );
            return Err(e);
        }

        info!(file_id, "entry deleted");
        self.record(AuditRecord::file(AuditOperation::Delete, file_id, removed.master_key_version));
        Ok(removed)
    }

    // -----------------------------------------------------------------------
    // Rotation
    // -----------------------------------------------------------------------

    /// Re-wrap the data key of `file_id` under the active master key version.
    ///
    /// Ciphertext and nonce are untouched. The integrity tag is checked
    /// before and recomputed after, since it covers the version.
    pub fn rewrap(&self, file_id: &str, passphrase: &str) -> Result<VaultEntry> {
        self.require_entry(file_id)?;
        let (mut session, verifier) = self.unlock(passphrase)?;

        let lock = self.index.lock_entry(file_id);
        let entry = self.require_entry(file_id)?;
        self.rewrap_locked(&lock, entry, &mut session, &verifier)
    }

    /// Re-wrap every entry still on a non-active version.
    ///
    /// Each entry is re-read under its lock right before the re-wrap and
    /// skipped if a concurrent writer already moved or deleted it. Failures
    /// are collected per entry; re-running finishes whatever is left.
    pub fn rotate_all(&self, passphrase: &str) -> Result<RotationReport> {
        let (session, verifier) = self.unlock(passphrase)?;
        self.rotate_all_in(session, verifier)
    }

    /// Finish a passphrase change started by [`Vault::rotate_with_passphrase`].
    ///
    /// Entries on older versions are unwrapped with `old_passphrase` and
    /// re-wrapped under the active version, which `new_passphrase` unlocks.
    pub fn rotate_all_with_passphrase(
        &self,
        old_passphrase: &str,
        new_passphrase: &str,
    ) -> Result<RotationReport> {
        let mut session = self
            .keys
            .session_changing_passphrase(old_passphrase, new_passphrase)?;
        let verifier = session.integrity_verifier()?;
        self.rotate_all_in(session, verifier)
    }

    fn rotate_all_in(
        &self,
        mut session: KeySession,
        verifier: IntegrityVerifier,
    ) -> Result<RotationReport> {
        let mut report = RotationReport::default();

        for file_id in self.index.stale_file_ids(session.active_version()) {
            let lock = self.index.lock_entry(&file_id);
            // The session follows concurrent rotations, so compare against
            // its current view of the active version.
            let current = match self.index.get(&file_id) {
                Some(entry) if entry.master_key_version != session.active_version() => entry,
                _ => {
                    report.skipped.push(file_id);
                    continue;
                }
            };
            match self.rewrap_locked(&lock, current, &mut session, &verifier) {
                Ok(_) => report.rewrapped.push(file_id),
                Err(e) => {
                    warn!(file_id = %file_id, "re-wrap failed: {e}");
                    report.failed.push((file_id, e));
                }
            }
        }

        report.active_version = session.active_version();
        info!(
            active_version = report.active_version,
            rewrapped = report.rewrapped.len(),
            skipped = report.skipped.len(),
            failed = report.failed.len(),
            "rotate_all finished"
        );
        Ok(report)
    }

    // -----------------------------------------------------------------------
    // Verification
    // -----------------------------------------------------------------------

    /// Check the integrity tag of one entry without decrypting it.
    pub fn check(&self, file_id: &str, passphrase: &str) -> Result<VerifyStatus> {
        let entry = self.require_entry(file_id)?;
        let (_session, verifier) = self.unlock(passphrase)?;
        Ok(self.check_entry(&entry, &verifier).status)
    }

    /// `true` if the stored ciphertext and metadata of `file_id` are intact.
    pub fn verify(&self, file_id: &str, passphrase: &str) -> Result<bool> {
        Ok(self.check(file_id, passphrase)? == VerifyStatus::Verified)
    }

    /// Check every entry. The integrity key is unlocked once; entries are
    /// checked in parallel and no plaintext is produced.
    pub fn verify_all(&self, passphrase: &str) -> Result<Vec<VerifyReport>> {
        let (_session, verifier) = self.unlock(passphrase)?;
        let entries = self.index.list();
        Ok(entries
            .par_iter()
            .map(|entry| self.check_entry(entry, &verifier))
            .collect())
    }

    fn check_entry(&self, entry: &VaultEntry, verifier: &IntegrityVerifier) -> VerifyReport {
        let status = match self.blobs.get(&entry.ciphertext_ref) {
            Ok(Some(ciphertext)) if verifier.verify(entry, &ciphertext) => VerifyStatus::Verified,
            Ok(Some(_)) => {
                self.integrity_failure(entry);
                VerifyStatus::Tampered
            }
            Ok(None) => VerifyStatus::MissingCiphertext,
            Err(e) => {
                warn!(file_id = %entry.file_id, "failed to read ciphertext: {e}");
                VerifyStatus::Unreadable
            }
        };
        VerifyReport {
            file_id: entry.file_id.clone(),
            master_key_version: entry.master_key_version,
            status,
        }
    }

    // -----------------------------------------------------------------------
    // Audit
    // -----------------------------------------------------------------------

    pub fn add_audit_sink(&self, sink: Box<dyn AuditSink>) {
        self.audit.lock().add_forward_sink(sink);
    }

    pub fn audit_records(&self) -> Vec<AuditRecord> {
        self.audit.lock().records()
    }

    fn record(&self, record: AuditRecord) {
        self.audit.lock().append(record);
    }

    fn integrity_failure(&self, entry: &VaultEntry) {
        warn!(
            file_id = %entry.file_id,
            version = entry.master_key_version,
            "integrity tag mismatch"
        );
        self.record(AuditRecord::file(
            AuditOperation::IntegrityFailure,
            &entry.file_id,
            entry.master_key_version,
        ));
    }

    // -----------------------------------------------------------------------
    // Locked internals. Callers hold the entry lock for the file.
    // -----------------------------------------------------------------------

    fn load_ciphertext(&self, entry: &VaultEntry) -> Result<Vec<u8>> {
        self.blobs
            .get(&entry.ciphertext_ref)?
            .ok_or_else(|| VaultError::CiphertextMissing(entry.file_id.clone()))
    }

    fn load_verified_ciphertext(
        &self,
        entry: &VaultEntry,
        verifier: &IntegrityVerifier,
    ) -> Result<Vec<u8>> {
        let ciphertext = self.load_ciphertext(entry)?;
        if !verifier.verify(entry, &ciphertext) {
            self.integrity_failure(entry);
            return Err(VaultError::IntegrityViolation(entry.file_id.clone()));
        }
        Ok(ciphertext)
    }

    fn discard_blob(&self, ciphertext_ref: &str) {
        if let Err(e) = self.blobs.delete(ciphertext_ref) {
            warn!(ciphertext_ref, "failed to remove unreferenced blob: {e}");
        }
    }

    fn open_locked(
        &self,
        entry: &VaultEntry,
        session: &mut KeySession,
        verifier: &IntegrityVerifier,
    ) -> Result<Vec<u8>> {
        let ciphertext = self.load_verified_ciphertext(entry, verifier)?;

        let master = session.master(entry.master_key_version)?;
        let data_key = keys::unwrap_data_key(
            master,
            &entry.wrapped_data_key,
            &entry.file_id,
            entry.master_key_version,
        )?;

        crypto::open(
            data_key.as_bytes(),
            &entry.nonce,
            entry.file_id.as_bytes(),
            &ciphertext,
        )
    }

    fn seal_locked(
        &self,
        lock: &EntryLock,
        session: &mut KeySession,
        verifier: &IntegrityVerifier,
        plaintext: &[u8],
        previous: Option<&VaultEntry>,
    ) -> Result<VaultEntry> {
        let file_id = lock.file_id();
        let version = session.active_version();

        let data_key = DataKey::generate()?;
        let nonce = crypto::generate_nonce()?;
        let ciphertext = crypto::seal(data_key.as_bytes(), &nonce, file_id.as_bytes(), plaintext)?;
        let wrapped_data_key =
            keys::wrap_data_key(session.master(version)?, &data_key, file_id, version)?;

        let now = Utc::now();
        let entry = VaultEntry {
            file_id: file_id.to_string(),
            nonce,
            wrapped_data_key,
            master_key_version: version,
            ciphertext_ref: new_ciphertext_ref()?,
            integrity_tag: verifier.compute_tag(&ciphertext, file_id, &nonce, version),
            plaintext_len: plaintext.len() as u64,
            created_at: previous.map_or(now, |p| p.created_at),
            updated_at: now,
        };

        self.blobs.put(&entry.ciphertext_ref, &ciphertext)?;

        // Read back through the store so a lossy backend is caught before the
        // index points at it.
        let stored_ok = match self.load_ciphertext(&entry) {
            Ok(stored) => verifier.verify(&entry, &stored),
            Err(_) => false,
        };
        if !stored_ok {
            self.discard_blob(&entry.ciphertext_ref);
            return Err(VaultError::IntegrityViolation(format!(
                "{file_id}: ciphertext store did not return the written blob"
            )));
        }

        let ciphertext_ref = entry.ciphertext_ref.clone();
        let committed = self.commit_active(lock, session, verifier, &data_key, &ciphertext, entry);
        let entry = match committed {
            Ok(entry) => entry,
            Err(e) => {
                self.discard_blob(&ciphertext_ref);
                return Err(e);
            }
        };

        if let Some(previous) = previous {
            self.discard_blob(&previous.ciphertext_ref);
        }
        Ok(entry)
    }

    /// Upsert `entry` under whatever version is active at commit time.
    ///
    /// If a rotation moved the active version since `session` was opened,
    /// the data key is re-wrapped and the tag recomputed for the new version
    /// before trying again. Ciphertext and nonce do not depend on the
    /// version and are kept.
    fn commit_active(
        &self,
        lock: &EntryLock,
        session: &mut KeySession,
        verifier: &IntegrityVerifier,
        data_key: &DataKey,
        ciphertext: &[u8],
        mut entry: VaultEntry,
    ) -> Result<VaultEntry> {
        loop {
            let committed = self
                .keys
                .commit_if_active(entry.master_key_version, || {
                    self.index.upsert(lock, entry.clone())
                })?;
            if committed.is_some() {
                return Ok(entry);
            }

            self.keys.refresh_session(session)?;
            let target = session.active_version();
            debug!(
                file_id = %entry.file_id,
                from = entry.master_key_version,
                to = target,
                "active version moved before commit, re-wrapping"
            );
            entry.wrapped_data_key =
                keys::wrap_data_key(session.master(target)?, data_key, &entry.file_id, target)?;
            entry.integrity_tag =
                verifier.compute_tag(ciphertext, &entry.file_id, &entry.nonce, target);
            entry.master_key_version = target;
        }
    }

    fn rewrap_locked(
        &self,
        lock: &EntryLock,
        entry: VaultEntry,
        session: &mut KeySession,
        verifier: &IntegrityVerifier,
    ) -> Result<VaultEntry> {
        let target = session.active_version();
        if entry.master_key_version == target {
            return Ok(entry);
        }

        let ciphertext = self.load_verified_ciphertext(&entry, verifier)?;

        let data_key = keys::unwrap_data_key(
            session.master(entry.master_key_version)?,
            &entry.wrapped_data_key,
            &entry.file_id,
            entry.master_key_version,
        )?;
        let wrapped_data_key =
            keys::wrap_data_key(session.master(target)?, &data_key, &entry.file_id, target)?;

        let from = entry.master_key_version;
        let integrity_tag = verifier.compute_tag(&ciphertext, &entry.file_id, &entry.nonce, target);
        let updated = VaultEntry {
            wrapped_data_key,
            master_key_version: target,
            integrity_tag,
            updated_at: Utc::now(),
            ..entry
        };
        let updated =
            self.commit_active(lock, session, verifier, &data_key, &ciphertext, updated)?;
        drop(data_key);

        debug!(file_id = %updated.file_id, from, to = updated.master_key_version, "re-wrapped");
        self.record(AuditRecord::file(
            AuditOperation::Rewrap,
            &updated.file_id,
            updated.master_key_version,
        ));
        Ok(updated)
    }
}
