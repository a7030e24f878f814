//! The vault index: `file_id -> VaultEntry`.
//!
//! The index is the single source of truth for what is encrypted and under
//! which master key version. An in-memory copy serves reads; every mutation
//! is written through to the [`IndexStore`] first, one entry at a time.
//!
//! Writers on a single file id are serialized by an entry-level lock. Mutating
//! methods take the [`EntryLock`] as proof that the caller holds it.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::{ArcMutexGuard, Mutex, RawMutex, RwLock};
use serde::{Deserialize, Serialize};

use crate::crypto::NONCE_LEN;
use crate::encoding;
use crate::error::{Result, VaultError};
use crate::storage::IndexStore;

/// Metadata for one protected file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VaultEntry {
    /// Stable identifier supplied by the caller (e.g. a relative path).
    pub file_id: String,
    /// Payload nonce. Fresh on every (re-)encryption.
    #[serde(with = "encoding::base64_array")]
    pub nonce: [u8; NONCE_LEN],
    /// Data key wrapped under `master_key_version`.
    #[serde(with = "encoding::base64_bytes")]
    pub wrapped_data_key: Vec<u8>,
    pub master_key_version: u32,
    /// Blob-store handle of the ciphertext. Opaque to the vault.
    pub ciphertext_ref: String,
    /// HMAC over ciphertext, file id, nonce and master key version.
    #[serde(with = "encoding::base64_bytes")]
    pub integrity_tag: Vec<u8>,
    pub plaintext_len: u64,
    pub created_at: DateTime<Utc>,
    /// Last time the key material or ciphertext changed.
    pub updated_at: DateTime<Utc>,
}

/// Proof that the holder is the single writer for `file_id`.
pub struct EntryLock {
    file_id: String,
    _guard: ArcMutexGuard<RawMutex, ()>,
}

impl EntryLock {
    pub fn file_id(&self) -> &str {
        &self.file_id
    }
}

pub struct VaultIndex {
    store: Arc<dyn IndexStore>,
    entries: RwLock<BTreeMap<String, VaultEntry>>,
    locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl std::fmt::Debug for VaultIndex {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VaultIndex")
            .field("entries", &self.entries.read().len())
            .finish()
    }
}

impl VaultIndex {
    /// Load every persisted entry from `store`.
    pub fn load(store: Arc<dyn IndexStore>) -> Result<Self> {
        let entries = store
            .load_all()?
            .into_iter()
            .map(|entry| (entry.file_id.clone(), entry))
            .collect();
        Ok(Self {
            store,
            entries: RwLock::new(entries),
            locks: Mutex::new(HashMap::new()),
        })
    }

    /// Block until the caller is the only writer for `file_id`.
    pub fn lock_entry(&self, file_id: &str) -> EntryLock {
        let mutex = {
            let mut locks = self.locks.lock();
            Arc::clone(locks.entry(file_id.to_string()).or_default())
        };
        EntryLock {
            file_id: file_id.to_string(),
            _guard: mutex.lock_arc(),
        }
    }

    pub fn get(&self, file_id: &str) -> Option<VaultEntry> {
        self.entries.read().get(file_id).cloned()
    }

    /// All entries, ordered by file id.
    pub fn list(&self) -> Vec<VaultEntry> {
        self.entries.read().values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    /// Insert or replace the entry guarded by `lock`.
    ///
    /// The record is persisted before the in-memory copy changes, so a failed
    /// write leaves both views on the previous entry.
    pub fn upsert(&self, lock: &EntryLock, entry: VaultEntry) -> Result<()> {
        if lock.file_id != entry.file_id {
            return Err(VaultError::InvalidParameters(format!(
                "entry lock for {} used to write {}",
                lock.file_id, entry.file_id
            )));
        }
        self.store.upsert(&entry)?;
        self.entries.write().insert(entry.file_id.clone(), entry);
        Ok(())
    }

    /// Remove the entry guarded by `lock`, returning it if it existed.
    pub fn remove(&self, lock: &EntryLock) -> Result<Option<VaultEntry>> {
        if !self.entries.read().contains_key(&lock.file_id) {
            return Ok(None);
        }
        self.store.remove(&lock.file_id)?;
        Ok(self.entries.write().remove(&lock.file_id))
    }

    /// Number of entries whose data key is wrapped under `version`.
    pub fn count_referencing(&self, version: u32) -> usize {
        self.entries
            .read()
            .values()
            .filter(|e| e.master_key_version == version)
            .count()
    }

    /// File ids of entries not yet wrapped under `active_version`.
    pub fn stale_file_ids(&self, active_version: u32) -> Vec<String> {
        self.entries
            .read()
            .values()
            .filter(|e| e.master_key_version != active_version)
            .map(|e| e.file_id.clone())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryIndexStore;

    fn entry(file_id: &str, version: u32) -> VaultEntry {
        let now = Utc::now();
        VaultEntry {
            file_id: file_id.to_string(),
            nonce: [0u8; NONCE_LEN],
            wrapped_data_key: vec![1, 2, 3],
            master_key_version: version,
            ciphertext_ref: format!("ref-{file_id}"),
            integrity_tag: vec![9; 32],
            plaintext_len: 0,
            created_at: now,
            updated_at: now,
        }
    }

    #[test]
    fn test_upsert_persists_and_reloads() {
        let store: Arc<dyn IndexStore> = Arc::new(MemoryIndexStore::new());
        let index = VaultIndex::load(Arc::clone(&store)).unwrap();

        let lock = index.lock_entry("b.txt");
        index.upsert(&lock, entry("b.txt", 0)).unwrap();
        drop(lock);
        let lock = index.lock_entry("a.txt");
        index.upsert(&lock, entry("a.txt", 1)).unwrap();
        drop(lock);

        let reloaded = VaultIndex::load(store).unwrap();
        let ids: Vec<_> = reloaded.list().into_iter().map(|e| e.file_id).collect();
        assert_eq!(ids, vec!["a.txt", "b.txt"]);
        assert_eq!(reloaded.count_referencing(0), 1);
        assert_eq!(reloaded.stale_file_ids(1), vec!["b.txt".to_string()]);
    }

    #[test]
    fn test_upsert_rejects_mismatched_lock() {
        let index = VaultIndex::load(Arc::new(MemoryIndexStore::new())).unwrap();
        let lock = index.lock_entry("a.txt");
        assert!(index.upsert(&lock, entry("b.txt", 0)).is_err());
        assert!(index.get("b.txt").is_none());
    }

    #[test]
    fn test_remove_returns_previous() {
        let index = VaultIndex::load(Arc::new(MemoryIndexStore::new())).unwrap();
        let lock = index.lock_entry("a.txt");
        assert!(index.remove(&lock).unwrap().is_none());
        index.upsert(&lock, entry("a.txt", 0)).unwrap();
        assert_eq!(index.remove(&lock).unwrap().unwrap().file_id, "a.txt");
        assert!(index.is_empty());
    }

    #[test]
    fn test_entry_json_uses_base64() {
        let json = serde_json::to_value(entry("a.txt", 2)).unwrap();
        assert_eq!(json["wrapped_data_key"], "AQID");
        assert_eq!(json["master_key_version"], 2);
        let back: VaultEntry = serde_json::from_value(json).unwrap();
        assert_eq!(back.nonce, [0u8; NONCE_LEN]);
    }
}
