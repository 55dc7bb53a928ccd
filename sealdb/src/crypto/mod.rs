//! Encryption service used by the persistence layer.
//!
//! The store treats encryption as an opaque service: whatever implements
//! [`Cipher`] turns the serialized state into ciphertext and back. The default
//! [`AesGcmCipher`] uses AES-256-GCM with a key derived from the store secret.
//!
//! Ciphertext layout: `salt (16 bytes) || nonce (12 bytes) || ciphertext || tag (16 bytes)`.

use crate::error::{Result, SealDbError};
use aes_gcm::{
    aead::{generic_array::GenericArray, Aead, KeyInit},
    Aes256Gcm, Nonce,
};
use hkdf::Hkdf;
use rand::RngCore;
use sha2::Sha256;
use zeroize::Zeroizing;

/// Size of the AES-256 key in bytes.
pub const KEY_SIZE: usize = 32;
/// Size of the per-file HKDF salt in bytes.
pub const SALT_SIZE: usize = 16;
/// Size of the GCM nonce in bytes.
pub const NONCE_SIZE: usize = 12;
/// Size of the GCM authentication tag in bytes.
pub const TAG_SIZE: usize = 16;

const KEY_INFO: &[u8] = b"sealdb-file-key-v1";

/// Encrypts and decrypts whole database images.
pub trait Cipher: Send + Sync {
    fn encrypt(&self, plaintext: &[u8]) -> Result<Vec<u8>>;
    fn decrypt(&self, ciphertext: &[u8]) -> Result<Vec<u8>>;
}

/// AES-256-GCM keyed from a secret string through HKDF-SHA256.
///
/// A fresh salt and nonce are drawn for every encryption, so encrypting the
/// same state twice never produces the same bytes.
pub struct AesGcmCipher {
    secret: Zeroizing<Vec<u8>>,
}

impl AesGcmCipher {
    pub fn new(secret: &str) -> Result<Self> {
        if secret.is_empty() {
            return Err(SealDbError::Config("Secret key must be a non-empty string".into()));
        }
        Ok(Self {
            secret: Zeroizing::new(secret.as_bytes().to_vec()),
        })
    }

    fn cipher_for(&self, salt: &[u8]) -> Result<Aes256Gcm> {
        let hk = Hkdf::<Sha256>::new(Some(salt), &self.secret);
        let mut key = Zeroizing::new([0u8; KEY_SIZE]);
        hk.expand(KEY_INFO, &mut key[..])
            .map_err(|_| SealDbError::Crypto("key derivation failed".into()))?;
        Ok(Aes256Gcm::new(GenericArray::from_slice(&key[..])))
    }
}

impl Cipher for AesGcmCipher {
    fn encrypt(&self, plaintext: &[u8]) -> Result<Vec<u8>> {
        let mut salt = [0u8; SALT_SIZE];
        let mut nonce_bytes = [0u8; NONCE_SIZE];
        rand::thread_rng().fill_bytes(&mut salt);
        rand::thread_rng().fill_bytes(&mut nonce_bytes);

        let cipher = self.cipher_for(&salt)?;
        let ciphertext = cipher
            .encrypt(Nonce::from_slice(&nonce_bytes), plaintext)
            .map_err(|_| SealDbError::Crypto("encryption failed".into()))?;

        let mut out = Vec::with_capacity(SALT_SIZE + NONCE_SIZE + ciphertext.len());
        out.extend_from_slice(&salt);
        out.extend_from_slice(&nonce_bytes);
        out.extend(ciphertext);
        Ok(out)
    }

    fn decrypt(&self, ciphertext: &[u8]) -> Result<Vec<u8>> {
        if ciphertext.len() < SALT_SIZE + NONCE_SIZE + TAG_SIZE {
            return Err(SealDbError::Crypto("ciphertext too short".into()));
        }
        let (salt, rest) = ciphertext.split_at(SALT_SIZE);
        let (nonce, body) = rest.split_at(NONCE_SIZE);

        self.cipher_for(salt)?
            .decrypt(Nonce::from_slice(nonce), body)
            .map_err(|_| SealDbError::Crypto("decryption failed (wrong key or corrupted data)".into()))
    }
}

impl std::fmt::Debug for AesGcmCipher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AesGcmCipher")
            .field("secret", &"[REDACTED]")
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_roundtrip() {
        let cipher = AesGcmCipher::new("correct horse").unwrap();
        let sealed = cipher.encrypt(b"{\"data\":{}}").unwrap();
        assert_eq!(sealed.len(), SALT_SIZE + NONCE_SIZE + 11 + TAG_SIZE);
        assert_eq!(cipher.decrypt(&sealed).unwrap(), b"{\"data\":{}}");
    }

    #[test]
    fn test_fresh_salt_and_nonce_per_call() {
        let cipher = AesGcmCipher::new("correct horse").unwrap();
        let a = cipher.encrypt(b"same").unwrap();
        let b = cipher.encrypt(b"same").unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn test_wrong_key_fails() {
        let sealed = AesGcmCipher::new("one").unwrap().encrypt(b"secret").unwrap();
        let result = AesGcmCipher::new("two").unwrap().decrypt(&sealed);
        assert!(matches!(result, Err(SealDbError::Crypto(_))));
    }

    #[test]
    fn test_tampered_or_short_input_fails() {
        let cipher = AesGcmCipher::new("k").unwrap();
        let mut sealed = cipher.encrypt(b"payload").unwrap();
        let last = sealed.len() - 1;
        sealed[last] ^= 0xff;
        assert!(cipher.decrypt(&sealed).is_err());
        assert!(cipher.decrypt(b"short").is_err());
    }

    #[test]
    fn test_empty_secret_rejected() {
        assert!(matches!(AesGcmCipher::new(""), Err(SealDbError::Config(_))));
    }
}
