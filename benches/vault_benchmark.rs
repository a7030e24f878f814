//! Encrypt, decrypt and verify throughput at a few payload sizes.
//!
//! Run with: `cargo bench --bench vault_benchmark`
//!
//! Every operation derives master keys from the passphrase, so the KDF
//! iteration count dominates small payloads. The vault here uses a low count
//! to make the AEAD and HMAC costs visible.

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use envault::{Vault, VaultConfig};

const PASS: &str = "bench-passphrase";

fn bench_vault() -> Vault {
    let config = VaultConfig {
        kdf_iterations: 1_000,
        ..VaultConfig::default()
    };
    let vault = Vault::in_memory(&config).unwrap();
    vault.initialize(PASS).unwrap();
    vault
}

fn benchmark_roundtrip(c: &mut Criterion) {
    let mut group = c.benchmark_group("vault");
    let vault = bench_vault();

    let sizes = [("100B", 100), ("10KB", 10 * 1024), ("1MB", 1024 * 1024)];

    for (name, size) in sizes {
        let payload = vec![0xA5u8; size];
        let file_id = format!("bench-{name}");
        vault.encrypt(&file_id, &payload, PASS).unwrap();

        group.throughput(Throughput::Bytes(size as u64));
        group.bench_with_input(BenchmarkId::new("encrypt", name), &payload, |b, payload| {
            b.iter(|| {
                vault
                    .encrypt(black_box(&file_id), black_box(payload), PASS)
                    .unwrap();
            });
        });
        group.bench_with_input(BenchmarkId::new("decrypt", name), &file_id, |b, file_id| {
            b.iter(|| vault.decrypt(black_box(file_id), PASS).unwrap());
        });
        group.bench_with_input(BenchmarkId::new("verify", name), &file_id, |b, file_id| {
            b.iter(|| vault.verify(black_box(file_id), PASS).unwrap());
        });
    }
    group.finish();
}

fn benchmark_kdf(c: &mut Criterion) {
    let mut group = c.benchmark_group("kdf");
    group.sample_size(10);

    // Production default: what one cold unlock costs.
    let config = VaultConfig::default();
    let vault = Vault::in_memory(&config).unwrap();
    vault.initialize(PASS).unwrap();
    vault.encrypt("sample", b"x", PASS).unwrap();

    group.bench_function("decrypt_default_iterations", |b| {
        b.iter(|| vault.decrypt(black_box("sample"), PASS).unwrap());
    });
    group.finish();
}

criterion_group!(benches, benchmark_roundtrip, benchmark_kdf);
criterion_main!(benches);
