//! Billing-key encryption at rest (AES-256-GCM)
//!
//! Stored form is `base64(nonce || ciphertext)` with a fresh 96-bit nonce
//! per encryption.

use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Key, Nonce};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use rand::RngCore;

use crate::error::{BillingError, BillingResult};

const NONCE_LEN: usize = 12;

#[derive(Clone)]
pub struct BillingKeyCipher {
    cipher: Aes256Gcm,
}

impl std::fmt::Debug for BillingKeyCipher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("BillingKeyCipher(..)")
    }
}

impl BillingKeyCipher {
    /// Build from a base64-encoded 32-byte key
    pub fn from_base64(encoded: &str) -> BillingResult<Self> {
        let raw = BASE64
            .decode(encoded.trim())
            .map_err(|e| BillingError::Config(format!("Encryption key is not base64: {}", e)))?;
        Self::from_bytes(&raw)
    }

    pub fn from_bytes(raw: &[u8]) -> BillingResult<Self> {
        if raw.len() != 32 {
            return Err(BillingError::Config(format!(
                "Encryption key must be 32 bytes, got {}",
                raw.len()
            )));
        }
        let key = Key::<Aes256Gcm>::from_slice(raw);
        Ok(Self {
            cipher: Aes256Gcm::new(key),
        })
    }

    pub fn encrypt(&self, plaintext: &str) -> BillingResult<String> {
        let mut nonce_bytes = [0u8; NONCE_LEN];
        rand::rng().fill_bytes(&mut nonce_bytes);
        let nonce = Nonce::from_slice(&nonce_bytes);

        let ciphertext = self
            .cipher
            .encrypt(nonce, plaintext.as_bytes())
            .map_err(|e| BillingError::Encryption(e.to_string()))?;

        let mut out = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        out.extend_from_slice(&nonce_bytes);
        out.extend_from_slice(&ciphertext);
        Ok(BASE64.encode(out))
    }

    pub fn decrypt(&self, encoded: &str) -> BillingResult<String> {
        let raw = BASE64
            .decode(encoded)
            .map_err(|e| BillingError::Encryption(format!("Invalid ciphertext encoding: {}", e)))?;
        if raw.len() <= NONCE_LEN {
            return Err(BillingError::Encryption("Ciphertext too short".to_string()));
        }
        let (nonce_bytes, ciphertext) = raw.split_at(NONCE_LEN);

        let plaintext = self
            .cipher
            .decrypt(Nonce::from_slice(nonce_bytes), ciphertext)
            .map_err(|_| BillingError::Encryption("Decryption failed".to_string()))?;

        String::from_utf8(plaintext)
            .map_err(|_| BillingError::Encryption("Decrypted key is not UTF-8".to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cipher() -> BillingKeyCipher {
        BillingKeyCipher::from_bytes(&[7u8; 32]).unwrap()
    }

    #[test]
    fn test_encrypt_decrypt() {
        let c = cipher();
        let sealed = c.encrypt("bk_live_abc123").unwrap();
        assert_ne!(sealed, "bk_live_abc123");
        assert_eq!(c.decrypt(&sealed).unwrap(), "bk_live_abc123");
    }

    #[test]
    fn test_nonce_is_fresh() {
        let c = cipher();
        assert_ne!(c.encrypt("same").unwrap(), c.encrypt("same").unwrap());
    }

    #[test]
    fn test_wrong_key_fails() {
        let sealed = cipher().encrypt("secret").unwrap();
        let other = BillingKeyCipher::from_bytes(&[8u8; 32]).unwrap();
        assert!(matches!(
            other.decrypt(&sealed),
            Err(BillingError::Encryption(_))
        ));
    }

    #[test]
    fn test_key_length_checked() {
        assert!(BillingKeyCipher::from_bytes(&[0u8; 16]).is_err());
        assert!(BillingKeyCipher::from_base64("not base64!!").is_err());
        let good = BASE64.encode([1u8; 32]);
        assert!(BillingKeyCipher::from_base64(&good).is_ok());
    }
}
