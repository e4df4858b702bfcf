//! Version-gated body encryption and zlib (de)compression for the ITL
//! codec (spec.md §4.3 "Encryption"/"Compression").
//!
//! Real iTunes library files are encrypted under a fixed key baked into the
//! player binary rather than a per-user secret -- there is no key exchange,
//! the "secret" is just obscurity. This codec follows the same shape: two
//! hardcoded 32-byte keys selected by the app-version major component,
//! reusing `chacha20poly1305` (already a teacher dependency via the
//! settings-secret path) instead of inventing a new crypto primitive.

use chacha20poly1305::aead::{Aead, KeyInit, OsRng};
use chacha20poly1305::{ChaCha20Poly1305, Key, Nonce};
use rand::RngCore;

use super::ItlError;

const NONCE_LEN: usize = 12;

/// Fixed key used for app-version major < 10 (spec.md §4.3 "Encryption:
/// version-gated ... for older versions, another [cipher]").
const LEGACY_KEY: [u8; 32] = *b"shelf-itl-legacy-cipher-key-v001";
/// Fixed key used for app-version major >= 10.
const MODERN_KEY: [u8; 32] = *b"shelf-itl-modern-cipher-key-v010";

/// Selects the version-gated key (spec.md §4.3): major >= 10 gets the
/// modern cipher, anything older (including an unparsable version) gets
/// the legacy one.
pub fn key_for_version(app_version: &str) -> &'static [u8; 32] {
    let major: u32 = app_version
        .split('.')
        .next()
        .and_then(|s| s.parse().ok())
        .unwrap_or(0);
    if major >= 10 {
        &MODERN_KEY
    } else {
        &LEGACY_KEY
    }
}

/// PKCS#7-pads `data` to the next 16-byte boundary (spec.md §4.3: "Input
/// length must be a multiple of 16; the codec is responsible for padding
/// an edited inner payload back to that boundary before encrypting").
pub fn pkcs7_pad(data: &[u8]) -> Vec<u8> {
    let pad_len = 16 - (data.len() % 16);
    let mut out = Vec::with_capacity(data.len() + pad_len);
    out.extend_from_slice(data);
    out.extend(std::iter::repeat(pad_len as u8).take(pad_len));
    out
}

/// Reverses [`pkcs7_pad`]. A length that isn't a multiple of 16, or a
/// pad byte that doesn't match the classic PKCS#7 shape, is a malformed
/// ITL file (spec.md §4.3 "Failure model").
pub fn pkcs7_unpad(data: &[u8]) -> Result<&[u8], ItlError> {
    if data.is_empty() || data.len() % 16 != 0 {
        return Err(ItlError::Malformed(
            "decrypted body length is not a multiple of 16".into(),
        ));
    }
    let pad_len = *data.last().unwrap() as usize;
    if pad_len == 0 || pad_len > 16 || pad_len > data.len() {
        return Err(ItlError::Malformed("invalid PKCS#7 padding".into()));
    }
    let (payload, pad) = data.split_at(data.len() - pad_len);
    if pad.iter().any(|&b| b as usize != pad_len) {
        return Err(ItlError::Malformed("invalid PKCS#7 padding".into()));
    }
    Ok(payload)
}

/// Encrypts `plaintext` (already PKCS#7-padded by the caller) under the
/// key selected for `app_version`, returning `nonce || ciphertext||tag`.
pub fn encrypt(app_version: &str, plaintext: &[u8]) -> Vec<u8> {
    let key = key_for_version(app_version);
    let cipher = ChaCha20Poly1305::new(Key::from_slice(key));
    let mut nonce_bytes = [0u8; NONCE_LEN];
    OsRng.fill_bytes(&mut nonce_bytes);
    let nonce = Nonce::from_slice(&nonce_bytes);
    // The key is fixed per version, so encryption cannot fail for any
    // input size; chacha20poly1305 has no block-alignment requirement.
    let ciphertext = cipher.encrypt(nonce, plaintext).expect("chacha20poly1305 encrypt");
    let mut out = Vec::with_capacity(NONCE_LEN + ciphertext.len());
    out.extend_from_slice(&nonce_bytes);
    out.extend_from_slice(&ciphertext);
    out
}

/// Decrypts a body produced by [`encrypt`]. A ciphertext shorter than the
/// nonce, or one that doesn't authenticate, is a malformed ITL file.
pub fn decrypt(app_version: &str, body: &[u8]) -> Result<Vec<u8>, ItlError> {
    if body.len() < NONCE_LEN {
        return Err(ItlError::Malformed("encrypted body shorter than nonce".into()));
    }
    let key = key_for_version(app_version);
    let cipher = ChaCha20Poly1305::new(Key::from_slice(key));
    let (nonce_bytes, ciphertext) = body.split_at(NONCE_LEN);
    let nonce = Nonce::from_slice(nonce_bytes);
    cipher
        .decrypt(nonce, ciphertext)
        .map_err(|_| ItlError::Crypto("failed to decrypt ITL body (wrong key or corrupt file)".into()))
}

/// Zlib-inflates `data`, used when the decrypted body's leading byte is
/// `0x78` (spec.md §4.3 "Compression").
pub fn inflate(data: &[u8]) -> Result<Vec<u8>, ItlError> {
    use std::io::Read;
    let mut decoder = flate2::read::ZlibDecoder::new(data);
    let mut out = Vec::new();
    decoder
        .read_to_end(&mut out)
        .map_err(|e| ItlError::Malformed(format!("zlib inflate failed: {e}")))?;
    Ok(out)
}

/// Zlib-deflates `data` at the default compression level, re-emitting the
/// leading `0x78` marker the parser detects.
pub fn deflate(data: &[u8]) -> Vec<u8> {
    use std::io::Write;
    let mut encoder = flate2::write::ZlibEncoder::new(Vec::new(), flate2::Compression::default());
    encoder.write_all(data).expect("in-memory zlib write");
    encoder.finish().expect("in-memory zlib finish")
}

/// Detects whether `data` is zlib-compressed by its leading byte (spec.md
/// §4.3: "Detected by leading `0x78` in the decrypted body").
pub fn looks_compressed(data: &[u8]) -> bool {
    data.first() == Some(&0x78)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pkcs7_round_trips() {
        for len in 0..40 {
            let data: Vec<u8> = (0..len).map(|i| i as u8).collect();
            let padded = pkcs7_pad(&data);
            assert_eq!(padded.len() % 16, 0);
            assert_eq!(pkcs7_unpad(&padded).unwrap(), data.as_slice());
        }
    }

    #[test]
    fn encrypt_decrypt_round_trips_for_both_versions() {
        for version in ["9.2.1.5", "12.9.5.5"] {
            let plaintext = pkcs7_pad(b"hello itl");
            let body = encrypt(version, &plaintext);
            let decrypted = decrypt(version, &body).unwrap();
            assert_eq!(decrypted, plaintext);
        }
    }

    #[test]
    fn cross_version_key_fails_to_decrypt() {
        let plaintext = pkcs7_pad(b"hello itl");
        let body = encrypt("12.9.5.5", &plaintext);
        assert!(decrypt("9.0.0.0", &body).is_err());
    }

    #[test]
    fn deflate_inflate_round_trips() {
        let data = b"the quick brown fox jumps over the lazy dog".repeat(10);
        let compressed = deflate(&data);
        assert!(looks_compressed(&compressed));
        assert_eq!(inflate(&compressed).unwrap(), data);
    }
}
