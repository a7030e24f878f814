//! Walk through the life of a vault on disk.
//!
//! Initialize, encrypt, rotate, re-wrap, retire the old version, then show
//! what a tampered blob looks like. Run with:
//!
//! ```sh
//! RUST_LOG=envault=debug cargo run --example vault_lifecycle
//! ```

use std::fs;

use envault::{Vault, VaultConfig, VaultError};
use tracing_subscriber::EnvFilter;

const PASS: &str = "correct-horse";

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let root = std::env::temp_dir().join("envault_demo");
    if root.exists() {
        fs::remove_dir_all(&root)?;
    }
    let config = VaultConfig {
        kdf_iterations: 100_000,
        audit_log: Some(root.join("audit.jsonl")),
        ..VaultConfig::with_root(&root)
    };

    // 1. Setup
    let vault = Vault::open(&config)?;
    let v0 = vault.initialize(PASS)?;
    println!("initialized version {} ({})", v0.version_id, v0.key_id);

    // 2. Store a couple of files
    vault.encrypt("notes.txt", b"hello vault", PASS)?;
    vault.encrypt("payroll.csv", b"name,amount\nalice,100\n", PASS)?;
    println!("stored {} entries", vault.list().len());

    // 3. Wrong passphrase
    match vault.decrypt("notes.txt", "battery-staple") {
        Err(VaultError::AuthenticationError) => println!("wrong passphrase rejected"),
        other => println!("unexpected: {other:?}"),
    }

    // 4. Rotate and move everything to the new version
    let v1 = vault.rotate(PASS)?;
    let report = vault.rotate_all(PASS)?;
    println!(
        "rotated to version {}: {} re-wrapped, {} failed",
        v1.version_id,
        report.rewrapped.len(),
        report.failed.len()
    );
    let retired = vault.retire_version(v0.version_id)?;
    println!("retired version {}", retired.version_id);

    // 5. Tamper with a blob behind the vault's back
    let entry = vault.entry("notes.txt").ok_or("notes.txt missing")?;
    let blob_path = config.blob_dir().join(&entry.ciphertext_ref);
    let mut blob = fs::read(&blob_path)?;
    blob[0] ^= 0xFF;
    fs::write(&blob_path, blob)?;

    let reports = vault.verify_all(PASS)?;
    for report in &reports {
        println!("{:<12} v{} {:?}", report.file_id, report.master_key_version, report.status);
    }
    let intact = reports.iter().filter(|r| r.is_verified()).count();
    println!("{intact} of {} entries intact", reports.len());
    if let Err(e) = vault.decrypt("notes.txt", PASS) {
        println!("decrypt refused: {e} (exit code {})", e.exit_code());
    }

    println!("audit log: {}", root.join("audit.jsonl").display());
    Ok(())
}
