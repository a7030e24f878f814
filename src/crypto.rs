//! Low-level AEAD and randomness.
//!
//! This module, `kdf` and `integrity` are the only places in the crate that
//! import `ring` directly. Everything else encrypts and decrypts through the
//! functions exposed here.
//!
//! Primitive choices:
//! - **Cipher**: AES-256-GCM (authenticated encryption with associated data)
//! - **Nonce**: 96-bit (12 bytes), generated fresh per operation via `SystemRandom`
//! - **Key size**: 256 bits (32 bytes)

use ring::aead::{self, Aad, LessSafeKey, Nonce, UnboundKey, AES_256_GCM};
use ring::rand::{SecureRandom, SystemRandom};
use zeroize::Zeroize;

use crate::error::{Result, VaultError};

/// The AEAD algorithm used throughout envault.
const ALGORITHM: &aead::Algorithm = &AES_256_GCM;

/// Size of the nonce in bytes (96 bits).
pub const NONCE_LEN: usize = 12;

/// Size of a master, data or integrity key in bytes (256 bits).
pub const KEY_LEN: usize = 32;

/// Size of the GCM authentication tag appended to every ciphertext.
pub const TAG_LEN: usize = 16;

/// Fill `buf` from the operating system CSPRNG.
///
/// `ring::rand::SystemRandom` is the only source of randomness in the crate.
pub fn fill_random(buf: &mut [u8]) -> Result<()> {
    SystemRandom::new()
        .fill(buf)
        .map_err(|_| VaultError::RandomnessFailure)
}

/// Generate a fresh random nonce. There is no nonce caching or
/// counter-based generation.
pub fn generate_nonce() -> Result<[u8; NONCE_LEN]> {
    let mut buf = [0u8; NONCE_LEN];
    fill_random(&mut buf)?;
    Ok(buf)
}

fn less_safe_key(key_bytes: &[u8; KEY_LEN]) -> Result<LessSafeKey> {
    let unbound = UnboundKey::new(ALGORITHM, key_bytes)
        .map_err(|_| VaultError::InvalidParameters("AEAD key length".into()))?;
    Ok(LessSafeKey::new(unbound))
}

/// Encrypt `plaintext` under `key_bytes` with an explicit nonce.
///
/// The caller owns the nonce and must never pass the same nonce twice for the
/// same key. `aad` is authenticated but not encrypted.
///
/// # Layout of returned bytes
/// ```text
/// [ ciphertext ][ GCM tag (16 bytes) ]
/// ```
pub fn seal(
    key_bytes: &[u8; KEY_LEN],
    nonce: &[u8; NONCE_LEN],
    aad: &[u8],
    plaintext: &[u8],
) -> Result<Vec<u8>> {
    let key = less_safe_key(key_bytes)?;

    let mut output = Vec::with_capacity(plaintext.len() + TAG_LEN);
    output.extend_from_slice(plaintext);

    key.seal_in_place_append_tag(
        Nonce::assume_unique_for_key(*nonce),
        Aad::from(aad),
        &mut output,
    )
    .map_err(|_| VaultError::EncryptionFailure)?;

    Ok(output)
}

/// Decrypt and authenticate a ciphertext produced by [`seal`].
///
/// A wrong key, wrong nonce, wrong `aad` or any tampering fails the GCM tag
/// check and yields [`VaultError::DecryptionError`]. The caller receives no
/// partial plaintext; the working buffer is wiped on failure.
pub fn open(
    key_bytes: &[u8; KEY_LEN],
    nonce: &[u8; NONCE_LEN],
    aad: &[u8],
    ciphertext: &[u8],
) -> Result<Vec<u8>> {
    if ciphertext.len() < TAG_LEN {
        return Err(VaultError::DecryptionError);
    }

    let key = less_safe_key(key_bytes)?;
    let mut buffer = ciphertext.to_vec();

    let plaintext_len = match key.open_in_place(
        Nonce::assume_unique_for_key(*nonce),
        Aad::from(aad),
        &mut buffer,
    ) {
        Ok(plaintext) => plaintext.len(),
        Err(_) => {
            buffer.zeroize();
            return Err(VaultError::DecryptionError);
        }
    };

    buffer.truncate(plaintext_len);
    Ok(buffer)
}

/// Encrypt with a freshly generated nonce bundled in front of the output.
///
/// Used for key wrapping, where the nonce travels with the wrapped key.
///
/// # Layout of returned bytes
/// ```text
/// [ nonce (12 bytes) ][ ciphertext + GCM tag ]
/// ```
pub fn seal_prefixed(key_bytes: &[u8; KEY_LEN], aad: &[u8], plaintext: &[u8]) -> Result<Vec<u8>> {
    let nonce = generate_nonce()?;
    let sealed = seal(key_bytes, &nonce, aad, plaintext)?;

    let mut output = Vec::with_capacity(NONCE_LEN + sealed.len());
    output.extend_from_slice(&nonce);
    output.extend_from_slice(&sealed);
    Ok(output)
}

/// Decrypt the layout produced by [`seal_prefixed`].
pub fn open_prefixed(key_bytes: &[u8; KEY_LEN], aad: &[u8], data: &[u8]) -> Result<Vec<u8>> {
    if data.len() < NONCE_LEN + TAG_LEN {
        return Err(VaultError::DecryptionError);
    }
    let (nonce_bytes, ciphertext) = data.split_at(NONCE_LEN);
    let nonce: [u8; NONCE_LEN] = nonce_bytes
        .try_into()
        .map_err(|_| VaultError::DecryptionError)?;
    open(key_bytes, &nonce, aad, ciphertext)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_seal_open_with_aad() {
        let key = [7u8; KEY_LEN];
        let nonce = generate_nonce().unwrap();
        let sealed = seal(&key, &nonce, b"notes.txt", b"payload").unwrap();
        assert_eq!(sealed.len(), b"payload".len() + TAG_LEN);

        let opened = open(&key, &nonce, b"notes.txt", &sealed).unwrap();
        assert_eq!(opened, b"payload");
    }

    #[test]
    fn test_open_rejects_wrong_aad_and_key() {
        let key = [7u8; KEY_LEN];
        let nonce = generate_nonce().unwrap();
        let sealed = seal(&key, &nonce, b"a.txt", b"payload").unwrap();

        assert!(matches!(
            open(&key, &nonce, b"b.txt", &sealed),
            Err(VaultError::DecryptionError)
        ));
        assert!(matches!(
            open(&[8u8; KEY_LEN], &nonce, b"a.txt", &sealed),
            Err(VaultError::DecryptionError)
        ));
    }

    #[test]
    fn test_open_rejects_short_input() {
        let key = [1u8; KEY_LEN];
        assert!(open(&key, &[0u8; NONCE_LEN], b"", &[0u8; 3]).is_err());
        assert!(open_prefixed(&key, b"", &[0u8; NONCE_LEN]).is_err());
    }

    #[test]
    fn test_prefixed_nonces_differ() {
        let key = [3u8; KEY_LEN];
        let a = seal_prefixed(&key, b"", b"same").unwrap();
        let b = seal_prefixed(&key, b"", b"same").unwrap();
        assert_ne!(a[..NONCE_LEN], b[..NONCE_LEN]);
        assert_eq!(open_prefixed(&key, b"", &a).unwrap(), b"same");
    }
}
