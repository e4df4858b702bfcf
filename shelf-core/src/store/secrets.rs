//! Encrypted-secret persistence (spec.md §4.1 "Encrypted secrets").
//!
//! A process-wide symmetric key, derived from a local key-file created on
//! first run, encrypts `Setting` values with `is_secret = true`. A short
//! fingerprint travels alongside each ciphertext so a wrong or missing key
//! is detected without attempting decryption, mirroring the teacher's
//! `encryption_key_fingerprint` hint in `bae-core/src/config.rs`.
//!
//! Decryption failure is a non-fatal per-key event (spec.md §4.1): callers
//! drop the setting from the in-memory view and log a warning; the settings
//! layer's YAML fallback (§4.2) is the recovery path.

use chacha20poly1305::aead::{Aead, KeyInit, OsRng};
use chacha20poly1305::{ChaCha20Poly1305, Key, Nonce};
use rand::RngCore;
use sha2::{Digest, Sha256};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum SecretError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("encryption key is malformed")]
    MalformedKey,
    #[error("decryption failed (wrong key or corrupted ciphertext)")]
    DecryptionFailed,
    #[error("ciphertext is malformed")]
    MalformedCiphertext,
}

const KEY_LEN: usize = 32;
const NONCE_LEN: usize = 12;

/// A process-wide symmetric key plus its fingerprint.
pub struct SecretKey {
    key: [u8; KEY_LEN],
    pub fingerprint: String,
}

impl SecretKey {
    fn from_bytes(key: [u8; KEY_LEN]) -> Self {
        let fingerprint = hex::encode(&Sha256::digest(key)[..4]);
        SecretKey { key, fingerprint }
    }

    /// Loads the key from `path`, creating a fresh random one (mode 0600) if
    /// absent, matching the teacher's "created on first run" key-file
    /// lifecycle.
    pub fn load_or_create(path: &std::path::Path) -> Result<Self, SecretError> {
        if let Ok(raw) = std::fs::read(path) {
            let key: [u8; KEY_LEN] = raw
                .get(..KEY_LEN)
                .and_then(|s| s.try_into().ok())
                .ok_or(SecretError::MalformedKey)?;
            return Ok(Self::from_bytes(key));
        }

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let mut key = [0u8; KEY_LEN];
        OsRng.fill_bytes(&mut key);
        std::fs::write(path, key)?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))?;
        }
        Ok(Self::from_bytes(key))
    }

    /// Encrypts `plaintext`, returning `fingerprint:nonce:ciphertext` all
    /// hex-encoded and colon-joined so it round-trips through a plain
    /// `String` setting value.
    pub fn encrypt(&self, plaintext: &str) -> Result<String, SecretError> {
        let cipher = ChaCha20Poly1305::new(Key::from_slice(&self.key));
        let mut nonce_bytes = [0u8; NONCE_LEN];
        OsRng.fill_bytes(&mut nonce_bytes);
        let nonce = Nonce::from_slice(&nonce_bytes);
        let ciphertext = cipher
            .encrypt(nonce, plaintext.as_bytes())
            .map_err(|_| SecretError::DecryptionFailed)?;
        Ok(format!(
            "{}:{}:{}",
            self.fingerprint,
            hex::encode(nonce_bytes),
            hex::encode(ciphertext)
        ))
    }

    /// Decrypts a value produced by [`SecretKey::encrypt`]. Returns
    /// `DecryptionFailed` both for a fingerprint mismatch and for an actual
    /// AEAD failure -- both mean "this key cannot read this secret" and
    /// should be handled identically by callers (spec.md §4.1).
    pub fn decrypt(&self, encoded: &str) -> Result<String, SecretError> {
        let mut parts = encoded.splitn(3, ':');
        let (fp, nonce_hex, ct_hex) = match (parts.next(), parts.next(), parts.next()) {
            (Some(a), Some(b), Some(c)) => (a, b, c),
            _ => return Err(SecretError::MalformedCiphertext),
        };
        if fp != self.fingerprint {
            return Err(SecretError::DecryptionFailed);
        }
        let nonce_bytes = hex::decode(nonce_hex).map_err(|_| SecretError::MalformedCiphertext)?;
        let ct = hex::decode(ct_hex).map_err(|_| SecretError::MalformedCiphertext)?;
        if nonce_bytes.len() != NONCE_LEN {
            return Err(SecretError::MalformedCiphertext);
        }
        let cipher = ChaCha20Poly1305::new(Key::from_slice(&self.key));
        let nonce = Nonce::from_slice(&nonce_bytes);
        let plaintext = cipher
            .decrypt(nonce, ct.as_slice())
            .map_err(|_| SecretError::DecryptionFailed)?;
        String::from_utf8(plaintext).map_err(|_| SecretError::DecryptionFailed)
    }

    /// Reads the fingerprint prefix off an encoded secret without
    /// attempting decryption, for diagnostics.
    pub fn fingerprint_of(encoded: &str) -> Option<&str> {
        encoded.split(':').next()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key() -> SecretKey {
        SecretKey::from_bytes([7u8; KEY_LEN])
    }

    #[test]
    fn encrypt_then_decrypt_roundtrips() {
        let k = key();
        let encoded = k.encrypt("sk-test-12345").unwrap();
        assert_eq!(k.decrypt(&encoded).unwrap(), "sk-test-12345");
    }

    #[test]
    fn wrong_key_fails_decryption_without_panicking() {
        let k1 = key();
        let k2 = SecretKey::from_bytes([9u8; KEY_LEN]);
        let encoded = k1.encrypt("secret").unwrap();
        assert!(matches!(
            k2.decrypt(&encoded),
            Err(SecretError::DecryptionFailed)
        ));
    }

    #[test]
    fn load_or_create_persists_across_reloads() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("secret.key");
        let k1 = SecretKey::load_or_create(&path).unwrap();
        let k2 = SecretKey::load_or_create(&path).unwrap();
        assert_eq!(k1.fingerprint, k2.fingerprint);
        let encoded = k1.encrypt("hello").unwrap();
        assert_eq!(k2.decrypt(&encoded).unwrap(), "hello");
    }

    #[test]
    fn fingerprint_mismatch_is_detected_without_decrypting() {
        let k1 = key();
        let encoded = k1.encrypt("value").unwrap();
        assert_eq!(SecretKey::fingerprint_of(&encoded), Some(k1.fingerprint.as_str()));
    }
}
