//! Encryption primitives for peer credentials.
//!
//! Uses AES-256-GCM with a fresh random 96-bit nonce per call. Sealed values
//! are stored as raw bytes in the layout `nonce || ciphertext || tag`.
//! An empty plaintext is never sealed: callers store the absence of a blob.

use aes_gcm::{
    aead::{Aead, KeyInit},
    Aes256Gcm, Nonce,
};
use rand::RngCore;
use std::fmt;
use thiserror::Error;
use zeroize::{Zeroize, ZeroizeOnDrop};

/// Key length in bytes (256 bits for AES-256)
pub const KEY_LENGTH: usize = 32;

/// Nonce length in bytes (96 bits for AES-GCM)
pub const NONCE_LENGTH: usize = 12;

#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("credential encryption key not initialized")]
    KeyUnavailable,

    #[error("encryption key must be {KEY_LENGTH} bytes, got {0}")]
    InvalidKeyLength(usize),

    #[error("encryption failed")]
    Encrypt,

    #[error("ciphertext too short: {0} bytes")]
    Truncated(usize),

    #[error("decryption failed: invalid key or corrupted data")]
    Decrypt,

    #[error("decrypted value is not valid UTF-8")]
    InvalidUtf8,
}

/// A 256-bit AES key. Zeroized on drop and never printed.
#[derive(Clone, PartialEq, Eq, Zeroize, ZeroizeOnDrop)]
pub struct CredentialKey([u8; KEY_LENGTH]);

impl CredentialKey {
    pub fn from_bytes(bytes: [u8; KEY_LENGTH]) -> Self {
        Self(bytes)
    }

    /// Build a key from a slice, rejecting anything that is not exactly 32 bytes.
    pub fn from_slice(bytes: &[u8]) -> Result<Self, CryptoError> {
        let arr: [u8; KEY_LENGTH] = bytes
            .try_into()
            .map_err(|_| CryptoError::InvalidKeyLength(bytes.len()))?;
        Ok(Self(arr))
    }

    /// Generate a new random key from the operating system RNG.
    pub fn generate() -> Self {
        let mut key = [0u8; KEY_LENGTH];
        rand::rngs::OsRng.fill_bytes(&mut key);
        Self(key)
    }

    pub fn as_bytes(&self) -> &[u8; KEY_LENGTH] {
        &self.0
    }

    fn cipher(&self) -> Result<Aes256Gcm, CryptoError> {
        Aes256Gcm::new_from_slice(&self.0).map_err(|_| CryptoError::InvalidKeyLength(self.0.len()))
    }
}

impl fmt::Debug for CredentialKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("CredentialKey([REDACTED])")
    }
}

/// Encrypt a plaintext value using AES-256-GCM.
///
/// Returns `None` for an empty plaintext, otherwise `nonce || ciphertext || tag`.
pub fn encrypt(plaintext: &str, key: &CredentialKey) -> Result<Option<Vec<u8>>, CryptoError> {
    if plaintext.is_empty() {
        return Ok(None);
    }

    // Generate random nonce
    let mut nonce_bytes = [0u8; NONCE_LENGTH];
    rand::thread_rng().fill_bytes(&mut nonce_bytes);
    let nonce = Nonce::from_slice(&nonce_bytes);

    let ciphertext = key
        .cipher()?
        .encrypt(nonce, plaintext.as_bytes())
        .map_err(|_| CryptoError::Encrypt)?;

    let mut combined = Vec::with_capacity(NONCE_LENGTH + ciphertext.len());
    combined.extend_from_slice(&nonce_bytes);
    combined.extend_from_slice(&ciphertext);
    Ok(Some(combined))
}

/// Decrypt a blob produced by [`encrypt`].
///
/// Fails on truncated input, on authentication failure (wrong key, corruption,
/// tampering) and on non UTF-8 output. Never returns partial plaintext.
pub fn decrypt(sealed: &[u8], key: &CredentialKey) -> Result<String, CryptoError> {
    if sealed.len() < NONCE_LENGTH {
        return Err(CryptoError::Truncated(sealed.len()));
    }

    let (nonce_bytes, ciphertext) = sealed.split_at(NONCE_LENGTH);
    let nonce = Nonce::from_slice(nonce_bytes);

    let plaintext = key
        .cipher()?
        .decrypt(nonce, ciphertext)
        .map_err(|_| CryptoError::Decrypt)?;

    String::from_utf8(plaintext).map_err(|e| {
        let mut bytes = e.into_bytes();
        bytes.zeroize();
        CryptoError::InvalidUtf8
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_key() -> CredentialKey {
        let mut key = [0u8; KEY_LENGTH];
        for (i, byte) in key.iter_mut().enumerate() {
            *byte = i as u8;
        }
        CredentialKey::from_bytes(key)
    }

    #[test]
    fn test_encrypt_decrypt_roundtrip() {
        let key = test_key();
        let sealed = encrypt("my-peer-password", &key).unwrap().unwrap();
        assert_eq!(sealed.len(), NONCE_LENGTH + "my-peer-password".len() + 16);
        assert_eq!(decrypt(&sealed, &key).unwrap(), "my-peer-password");
    }

    #[test]
    fn test_unicode_content() {
        let key = test_key();
        let plaintext = "pässwörd, 世界! 🎉";
        let sealed = encrypt(plaintext, &key).unwrap().unwrap();
        assert_eq!(decrypt(&sealed, &key).unwrap(), plaintext);
    }

    #[test]
    fn test_empty_plaintext_is_not_sealed() {
        assert!(encrypt("", &test_key()).unwrap().is_none());
    }

    #[test]
    fn test_different_encryptions_differ() {
        let key = test_key();
        let first = encrypt("same-data", &key).unwrap().unwrap();
        let second = encrypt("same-data", &key).unwrap().unwrap();

        // Different random nonces should produce different ciphertext
        assert_ne!(first, second);
        assert_ne!(first[..NONCE_LENGTH], second[..NONCE_LENGTH]);
        assert_eq!(decrypt(&first, &key).unwrap(), "same-data");
        assert_eq!(decrypt(&second, &key).unwrap(), "same-data");
    }

    #[test]
    fn test_wrong_key_fails() {
        let key1 = test_key();
        let mut bytes = *test_key().as_bytes();
        bytes[0] = 255;
        let key2 = CredentialKey::from_bytes(bytes);

        let sealed = encrypt("secret", &key1).unwrap().unwrap();
        assert!(matches!(decrypt(&sealed, &key2), Err(CryptoError::Decrypt)));
    }

    #[test]
    fn test_any_bit_flip_is_rejected() {
        let key = test_key();
        let sealed = encrypt("tamper-me", &key).unwrap().unwrap();

        for byte in 0..sealed.len() {
            for bit in 0..8 {
                let mut corrupted = sealed.clone();
                corrupted[byte] ^= 1 << bit;
                assert!(
                    matches!(decrypt(&corrupted, &key), Err(CryptoError::Decrypt)),
                    "flipping bit {} of byte {} must fail authentication",
                    bit,
                    byte
                );
            }
        }
    }

    #[test]
    fn test_truncated_input_fails() {
        let key = test_key();
        assert!(matches!(decrypt(&[], &key), Err(CryptoError::Truncated(0))));
        assert!(matches!(
            decrypt(&[0u8; NONCE_LENGTH - 1], &key),
            Err(CryptoError::Truncated(11))
        ));
        // A bare nonce has no tag to authenticate.
        assert!(matches!(
            decrypt(&[0u8; NONCE_LENGTH], &key),
            Err(CryptoError::Decrypt)
        ));
    }

    #[test]
    fn test_key_from_slice_rejects_wrong_length() {
        assert!(matches!(
            CredentialKey::from_slice(&[0u8; 31]),
            Err(CryptoError::InvalidKeyLength(31))
        ));
        assert!(CredentialKey::from_slice(&[7u8; KEY_LENGTH]).is_ok());
    }

    #[test]
    fn test_generated_keys_differ() {
        assert_ne!(CredentialKey::generate(), CredentialKey::generate());
    }

    #[test]
    fn test_key_debug_is_redacted() {
        let key = CredentialKey::from_bytes([0xAB; KEY_LENGTH]);
        let debug = format!("{:?}", key);
        assert_eq!(debug, "CredentialKey([REDACTED])");
    }
}
