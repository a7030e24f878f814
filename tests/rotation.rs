//! Master key rotation and version retirement.

use std::sync::Arc;

use envault::storage::{BlobStore, MemoryBlobStore, MemoryIndexStore, MemoryKeyStore};
use envault::{Vault, VaultConfig, VaultError};

const PASS: &str = "correct-horse";

fn vault_with_blobs() -> (Vault, Arc<MemoryBlobStore>) {
    let config = VaultConfig {
        kdf_iterations: 1_000,
        ..VaultConfig::default()
    };
    let blobs = Arc::new(MemoryBlobStore::new());
    let vault = Vault::with_stores(
        &config,
        Arc::new(MemoryKeyStore::new()),
        Arc::new(MemoryIndexStore::new()),
        blobs.clone(),
    )
    .unwrap();
    vault.initialize(PASS).unwrap();
    (vault, blobs)
}

#[test]
fn test_rotate_keeps_old_entries_readable() {
    let (vault, _) = vault_with_blobs();
    vault.encrypt("old", b"written under v0", PASS).unwrap();

    let v1 = vault.rotate(PASS).unwrap();
    assert_eq!(v1.version_id, 1);
    assert!(v1.active);
    assert_eq!(vault.active_version().unwrap().version_id, 1);

    let versions = vault.key_versions();
    assert_eq!(versions.len(), 2);
    assert_eq!(versions.iter().filter(|v| v.active).count(), 1);

    // Old entry untouched, new entry goes to v1.
    assert_eq!(vault.entry("old").unwrap().master_key_version, 0);
    assert_eq!(vault.decrypt("old", PASS).unwrap(), b"written under v0");
    let fresh = vault.encrypt("new", b"written under v1", PASS).unwrap();
    assert_eq!(fresh.master_key_version, 1);
}

#[test]
fn test_rotate_all_moves_every_entry() {
    let (vault, _) = vault_with_blobs();
    for i in 0..5 {
        vault
            .encrypt(&format!("file-{i}"), format!("payload {i}").as_bytes(), PASS)
            .unwrap();
    }
    vault.rotate(PASS).unwrap();
    vault.rotate(PASS).unwrap();

    let report = vault.rotate_all(PASS).unwrap();
    assert!(report.is_complete());
    assert_eq!(report.active_version, 2);
    assert_eq!(report.rewrapped.len(), 5);

    for i in 0..5 {
        let id = format!("file-{i}");
        assert_eq!(vault.entry(&id).unwrap().master_key_version, 2);
        assert_eq!(vault.decrypt(&id, PASS).unwrap(), format!("payload {i}").as_bytes());
    }

    // A second run has nothing left to do.
    let again = vault.rotate_all(PASS).unwrap();
    assert!(again.rewrapped.is_empty());
    assert!(again.failed.is_empty());
}

#[test]
fn test_rewrap_leaves_payload_untouched() {
    let (vault, blobs) = vault_with_blobs();
    let before = vault.encrypt("doc", b"unchanged payload", PASS).unwrap();
    let blob_before = blobs.get(&before.ciphertext_ref).unwrap().unwrap();

    vault.rotate(PASS).unwrap();
    let after = vault.rewrap("doc", PASS).unwrap();

    assert_eq!(after.master_key_version, 1);
    assert_eq!(after.nonce, before.nonce);
    assert_eq!(after.ciphertext_ref, before.ciphertext_ref);
    assert_eq!(after.created_at, before.created_at);
    assert_ne!(after.wrapped_data_key, before.wrapped_data_key);
    assert_ne!(after.integrity_tag, before.integrity_tag);
    assert_eq!(blobs.get(&after.ciphertext_ref).unwrap().unwrap(), blob_before);
    assert!(vault.verify("doc", PASS).unwrap());
}

#[test]
fn test_retire_version_lifecycle() {
    let (vault, _) = vault_with_blobs();
    vault.encrypt("a", b"1", PASS).unwrap();
    vault.encrypt("b", b"2", PASS).unwrap();

    assert!(matches!(
        vault.retire_version(0),
        Err(VaultError::ActiveVersion(0))
    ));

    vault.rotate(PASS).unwrap();
    assert!(matches!(
        vault.retire_version(0),
        Err(VaultError::VersionInUse { version: 0, entries: 2 })
    ));

    vault.rotate_all(PASS).unwrap();
    let retired = vault.retire_version(0).unwrap();
    assert_eq!(retired.version_id, 0);
    assert_eq!(vault.key_versions().len(), 1);
    assert!(matches!(
        vault.retire_version(0),
        Err(VaultError::UnknownKeyVersion(0))
    ));

    // Version ids are never reused.
    assert_eq!(vault.rotate(PASS).unwrap().version_id, 2);
    assert_eq!(vault.decrypt("a", PASS).unwrap(), b"1");
}

#[test]
fn test_rotate_all_reports_partial_failure() {
    let (vault, blobs) = vault_with_blobs();
    vault.encrypt("good-1", b"a", PASS).unwrap();
    let bad = vault.encrypt("bad", b"b", PASS).unwrap();
    vault.encrypt("good-2", b"c", PASS).unwrap();

    let mut blob = blobs.get(&bad.ciphertext_ref).unwrap().unwrap();
    blob[0] ^= 0x80;
    blobs.put(&bad.ciphertext_ref, &blob).unwrap();

    vault.rotate(PASS).unwrap();
    let report = vault.rotate_all(PASS).unwrap();

    assert!(!report.is_complete());
    assert_eq!(report.rewrapped, vec!["good-1".to_string(), "good-2".to_string()]);
    assert_eq!(report.failed.len(), 1);
    assert_eq!(report.failed[0].0, "bad");
    assert!(matches!(report.failed[0].1, VaultError::IntegrityViolation(_)));

    // The failed entry keeps its old version, which therefore cannot retire.
    assert_eq!(vault.entry("bad").unwrap().master_key_version, 0);
    assert!(matches!(
        vault.retire_version(0),
        Err(VaultError::VersionInUse { version: 0, entries: 1 })
    ));
}

#[test]
fn test_rotation_with_wrong_passphrase() {
    let (vault, _) = vault_with_blobs();
    vault.encrypt("a", b"1", PASS).unwrap();

    assert!(matches!(vault.rotate("nope"), Err(VaultError::AuthenticationError)));
    assert_eq!(vault.key_versions().len(), 1);

    vault.rotate(PASS).unwrap();
    assert!(matches!(
        vault.rotate_all("nope"),
        Err(VaultError::AuthenticationError)
    ));
    assert!(matches!(vault.rewrap("a", "nope"), Err(VaultError::AuthenticationError)));
    assert_eq!(vault.entry("a").unwrap().master_key_version, 0);
}

#[test]
fn test_iterations_never_drop_on_rotate() {
    let store = Arc::new(MemoryKeyStore::new());
    let strong = VaultConfig {
        kdf_iterations: 2_000,
        ..VaultConfig::default()
    };
    let vault = Vault::with_stores(
        &strong,
        store.clone(),
        Arc::new(MemoryIndexStore::new()),
        Arc::new(MemoryBlobStore::new()),
    )
    .unwrap();
    vault.initialize(PASS).unwrap();
    drop(vault);

    // Reopen with a weaker setting: the new version keeps the stronger count.
    let weak = VaultConfig {
        kdf_iterations: 1_000,
        ..VaultConfig::default()
    };
    let vault = Vault::with_stores(
        &weak,
        store,
        Arc::new(MemoryIndexStore::new()),
        Arc::new(MemoryBlobStore::new()),
    )
    .unwrap();
    assert_eq!(vault.rotate(PASS).unwrap().iteration_count, 2_000);
}

#[test]
fn test_passphrase_change_through_rotation() {
    let (vault, _) = vault_with_blobs();
    vault.encrypt("notes.txt", b"hello vault", PASS).unwrap();
    vault.encrypt("todo.md", b"- rotate keys", PASS).unwrap();

    assert!(matches!(
        vault.rotate_with_passphrase("guess", "battery-staple"),
        Err(VaultError::AuthenticationError)
    ));
    assert!(matches!(
        vault.rotate_with_passphrase(PASS, ""),
        Err(VaultError::EmptyPassphrase)
    ));

    let v1 = vault.rotate_with_passphrase(PASS, "battery-staple").unwrap();
    assert_eq!(v1.version_id, 1);

    // Halfway: entries are still wrapped under the old passphrase's version.
    assert!(matches!(
        vault.decrypt("notes.txt", "battery-staple"),
        Err(VaultError::AuthenticationError)
    ));

    let report = vault
        .rotate_all_with_passphrase(PASS, "battery-staple")
        .unwrap();
    assert!(report.is_complete());
    assert_eq!(report.rewrapped.len(), 2);

    assert_eq!(vault.decrypt("notes.txt", "battery-staple").unwrap(), b"hello vault");
    assert_eq!(vault.decrypt("todo.md", "battery-staple").unwrap(), b"- rotate keys");
    assert!(matches!(
        vault.decrypt("notes.txt", PASS),
        Err(VaultError::AuthenticationError)
    ));

    // New writes and plain rotation use the new passphrase from here on.
    vault.encrypt("fresh", b"v1", "battery-staple").unwrap();
    vault.retire_version(0).unwrap();
    assert_eq!(vault.rotate("battery-staple").unwrap().version_id, 2);
}

#[test]
fn test_rotate_all_with_wrong_old_passphrase_reports_failures() {
    let (vault, _) = vault_with_blobs();
    vault.encrypt("a", b"1", PASS).unwrap();
    vault.rotate_with_passphrase(PASS, "battery-staple").unwrap();

    let report = vault
        .rotate_all_with_passphrase("not-the-old-one", "battery-staple")
        .unwrap();
    assert_eq!(report.failed.len(), 1);
    assert!(matches!(report.failed[0].1, VaultError::AuthenticationError));
    assert_eq!(vault.entry("a").unwrap().master_key_version, 0);

    // Re-running with the right old passphrase finishes the job.
    assert!(vault
        .rotate_all_with_passphrase(PASS, "battery-staple")
        .unwrap()
        .is_complete());
    assert_eq!(vault.decrypt("a", "battery-staple").unwrap(), b"1");
}
