use aes_gcm::{
    aead::{Aead, AeadCore, KeyInit, OsRng, Payload},
    Aes256Gcm, Key, Nonce,
};
use base64ct::{Base64, Encoding};
use sha2::{Digest, Sha256};

use crate::error::{AppError, Result};

pub const NONCE_LEN: usize = 12;

/// AES-256-GCM over raw archive bytes.
///
/// Output layout is `nonce || ciphertext`; the caller may bind extra
/// associated data that must be presented again to decrypt.
#[derive(Clone)]
pub struct ArchiveCipher {
    key: Key<Aes256Gcm>,
    key_ref: String,
}

impl std::fmt::Debug for ArchiveCipher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ArchiveCipher")
            .field("key_ref", &self.key_ref)
            .finish_non_exhaustive()
    }
}

impl ArchiveCipher {
    pub fn new(key_base64: &str) -> Result<Self> {
        let key_bytes = Base64::decode_vec(key_base64.trim())
            .map_err(|e| AppError::EncryptionError(format!("Invalid key format: {}", e)))?;

        if key_bytes.len() != 32 {
            return Err(AppError::EncryptionError(
                "Key must be 32 bytes (256 bits) long".to_string(),
            ));
        }

        let key = *Key::<Aes256Gcm>::from_slice(&key_bytes);
        let digest = Sha256::digest(&key_bytes);
        let key_ref = format!("sha256:{}", &hex::encode(digest)[..16]);

        Ok(Self { key, key_ref })
    }

    /// Non-secret identifier recorded on every artifact sealed with this key.
    pub fn key_ref(&self) -> &str {
        &self.key_ref
    }

    pub fn encrypt(&self, plaintext: &[u8], aad: &[u8]) -> Result<Vec<u8>> {
        let cipher = Aes256Gcm::new(&self.key);
        let nonce = Aes256Gcm::generate_nonce(&mut OsRng);

        let ciphertext = cipher
            .encrypt(&nonce, Payload { msg: plaintext, aad })
            .map_err(|e| AppError::EncryptionError(format!("Encryption failed: {}", e)))?;

        let mut combined = nonce.to_vec();
        combined.extend_from_slice(&ciphertext);
        Ok(combined)
    }

    pub fn decrypt(&self, combined: &[u8], aad: &[u8]) -> Result<Vec<u8>> {
        if combined.len() < NONCE_LEN {
            return Err(AppError::EncryptionError("Ciphertext too short".to_string()));
        }

        let (nonce_bytes, ciphertext) = combined.split_at(NONCE_LEN);
        let nonce = Nonce::from_slice(nonce_bytes);

        let cipher = Aes256Gcm::new(&self.key);
        cipher
            .decrypt(nonce, Payload { msg: ciphertext, aad })
            .map_err(|e| AppError::EncryptionError(format!("Decryption failed: {}", e)))
    }

    pub fn generate_key() -> String {
        let key = Aes256Gcm::generate_key(OsRng);
        Base64::encode_string(key.as_slice())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encrypt_decrypt() {
        let cipher = ArchiveCipher::new(&ArchiveCipher::generate_key()).unwrap();

        let plaintext = b"database dump bytes";
        let sealed = cipher.encrypt(plaintext, b"aad").unwrap();
        assert_eq!(cipher.decrypt(&sealed, b"aad").unwrap(), plaintext);
    }

    #[test]
    fn test_nonce_differs_each_time() {
        let cipher = ArchiveCipher::new(&ArchiveCipher::generate_key()).unwrap();
        let a = cipher.encrypt(b"same", b"").unwrap();
        let b = cipher.encrypt(b"same", b"").unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn test_wrong_associated_data_is_rejected() {
        let cipher = ArchiveCipher::new(&ArchiveCipher::generate_key()).unwrap();
        let sealed = cipher.encrypt(b"payload", b"SWYDARC1").unwrap();
        assert!(matches!(
            cipher.decrypt(&sealed, b"OTHER"),
            Err(AppError::EncryptionError(_))
        ));
    }

    #[test]
    fn test_invalid_key_length() {
        let short_key = Base64::encode_string(b"short");
        assert!(matches!(
            ArchiveCipher::new(&short_key),
            Err(AppError::EncryptionError(_))
        ));
    }

    #[test]
    fn test_key_ref_is_stable_and_not_the_key() {
        let key = ArchiveCipher::generate_key();
        let a = ArchiveCipher::new(&key).unwrap();
        let b = ArchiveCipher::new(&key).unwrap();
        assert_eq!(a.key_ref(), b.key_ref());
        assert!(a.key_ref().starts_with("sha256:"));
        assert_eq!(a.key_ref().len(), "sha256:".len() + 16);
        assert!(!a.key_ref().contains(&key));
    }
}
