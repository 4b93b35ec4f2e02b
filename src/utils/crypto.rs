use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Key, Nonce};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use rand::RngCore;
use sha2::{Digest, Sha256};

use crate::errors::{BotError, Result};

const NONCE_LEN: usize = 12;

/// Encrypts exchange API credentials at rest with AES-256-GCM.
///
/// The key is derived as SHA-256(master_key || salt); payloads are
/// base64(nonce || ciphertext) with a fresh random nonce per value.
#[derive(Clone)]
pub struct CredentialCipher {
    cipher: Aes256Gcm,
}

impl CredentialCipher {
    pub fn new(master_key: &str, salt: &str) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(master_key.as_bytes());
        hasher.update(salt.as_bytes());
        let key_bytes = hasher.finalize();

        let key = Key::<Aes256Gcm>::from_slice(&key_bytes);
        Self {
            cipher: Aes256Gcm::new(key),
        }
    }

    pub fn encrypt(&self, plaintext: &str) -> Result<String> {
        let mut nonce_bytes = [0u8; NONCE_LEN];
        rand::thread_rng().fill_bytes(&mut nonce_bytes);
        let nonce = Nonce::from_slice(&nonce_bytes);

        let ciphertext = self
            .cipher
            .encrypt(nonce, plaintext.as_bytes())
            .map_err(|e| BotError::internal(format!("Credential encryption failed: {}", e)))?;

        let mut payload = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        payload.extend_from_slice(&nonce_bytes);
        payload.extend_from_slice(&ciphertext);

        Ok(BASE64.encode(payload))
    }

    pub fn decrypt(&self, encoded: &str) -> Result<String> {
        let payload = BASE64
            .decode(encoded)
            .map_err(|e| BotError::validation(format!("Invalid encrypted payload: {}", e)))?;

        if payload.len() <= NONCE_LEN {
            return Err(BotError::validation("Encrypted payload too short"));
        }

        let (nonce_bytes, ciphertext) = payload.split_at(NONCE_LEN);
        let nonce = Nonce::from_slice(nonce_bytes);

        let plaintext = self
            .cipher
            .decrypt(nonce, ciphertext)
            .map_err(|e| BotError::internal(format!("Credential decryption failed: {}", e)))?;

        String::from_utf8(plaintext)
            .map_err(|e| BotError::validation(format!("Decrypted payload not UTF-8: {}", e)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encrypt_decrypt_round_trip() {
        let cipher = CredentialCipher::new("a-master-key-of-decent-length", "pepper");
        let secret = "bNc0dE1fG2hI3jK4lM5";

        let encrypted = cipher.encrypt(secret).unwrap();
        assert_ne!(encrypted, secret);
        assert_eq!(cipher.decrypt(&encrypted).unwrap(), secret);
    }

    #[test]
    fn distinct_nonces_per_encryption() {
        let cipher = CredentialCipher::new("a-master-key-of-decent-length", "pepper");
        let a = cipher.encrypt("same-value").unwrap();
        let b = cipher.encrypt("same-value").unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn wrong_key_fails() {
        let cipher = CredentialCipher::new("a-master-key-of-decent-length", "pepper");
        let other = CredentialCipher::new("a-different-master-key-here", "pepper");

        let encrypted = cipher.encrypt("secret").unwrap();
        assert!(other.decrypt(&encrypted).is_err());
    }
}
