//! Source credential decryption.
//!
//! Key material lives as a JSON blob in the key/value store. `W1`/`W2` are AES-CBC with
//! PKCS#7 padding (the key length picks AES-128/192/256), `W3` is AES-256-GCM keyed by
//! SHA-256 of the key material with a 12-byte nonce prefix. Ciphertexts are hex.

use crate::onboard::traits::KvStore;
use crate::{Error, Result};
use aes::cipher::block_padding::Pkcs7;
use aes::cipher::{BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use aes_gcm::aead::Aead;
use aes_gcm::{Aes256Gcm, KeyInit, Nonce};
use rand::RngCore;
use serde::Deserialize;
use sha2::{Digest, Sha256};

const NONCE_LEN: usize = 12;

#[derive(Clone, Default, Deserialize)]
pub struct CryptoSecrets {
    #[serde(default)]
    pub hashing_secret: String,
    #[serde(default)]
    pub encryption_key_w1: String,
    #[serde(default)]
    pub encryption_iv_w1: String,
    #[serde(default)]
    pub encryption_key_w2: String,
    #[serde(default)]
    pub encryption_iv_w2: String,
    #[serde(default)]
    pub encryption_key_w3: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CipherScheme {
    W1,
    W2,
    W3,
}

#[derive(Clone)]
pub struct CredentialCipher {
    secrets: CryptoSecrets,
}

impl std::fmt::Debug for CredentialCipher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CredentialCipher").finish_non_exhaustive()
    }
}

impl CredentialCipher {
    pub fn new(secrets: CryptoSecrets) -> Self {
        Self { secrets }
    }

    /// Read the key blob from hash `key`, field `field`.
    #[tracing::instrument(level = "debug", skip(kv))]
    pub async fn load(kv: &dyn KvStore, key: &str, field: &str) -> Result<Self> {
        let raw = kv
            .hget(key, field)
            .await?
            .ok_or_else(|| Error::NotFound(format!("crypto secret '{key}/{field}'")))?;
        let secrets: CryptoSecrets = serde_json::from_str(&raw)
            .map_err(|e| Error::Decode(format!("crypto secret blob: {e}")))?;
        Ok(Self::new(secrets))
    }

    pub fn decrypt(&self, ciphertext_hex: &str, scheme: CipherScheme) -> Result<String> {
        let data = hex::decode(ciphertext_hex.trim())
            .map_err(|e| Error::Decode(format!("ciphertext hex: {e}")))?;
        let plain = match scheme {
            CipherScheme::W1 => cbc_decrypt(
                &data,
                &self.secrets.encryption_key_w1,
                &self.secrets.encryption_iv_w1,
            )?,
            CipherScheme::W2 => cbc_decrypt(
                &data,
                &self.secrets.encryption_key_w2,
                &self.secrets.encryption_iv_w2,
            )?,
            CipherScheme::W3 => gcm_decrypt(&data, &self.secrets.encryption_key_w3)?,
        };
        String::from_utf8(plain).map_err(|e| Error::Decode(format!("plaintext utf-8: {e}")))
    }

    pub fn encrypt(&self, plaintext: &str, scheme: CipherScheme) -> Result<String> {
        let data = match scheme {
            CipherScheme::W1 => cbc_encrypt(
                plaintext.as_bytes(),
                &self.secrets.encryption_key_w1,
                &self.secrets.encryption_iv_w1,
            )?,
            CipherScheme::W2 => cbc_encrypt(
                plaintext.as_bytes(),
                &self.secrets.encryption_key_w2,
                &self.secrets.encryption_iv_w2,
            )?,
            CipherScheme::W3 => gcm_encrypt(plaintext.as_bytes(), &self.secrets.encryption_key_w3)?,
        };
        Ok(hex::encode(data))
    }
}

fn bad_key(len: usize) -> Error {
    Error::InvalidInput(format!("AES key must be 16, 24 or 32 bytes, got {len}"))
}

fn cbc_decrypt(data: &[u8], key: &str, iv: &str) -> Result<Vec<u8>> {
    let (key, iv) = (key.as_bytes(), iv.as_bytes());
    let out = match key.len() {
        16 => cbc::Decryptor::<aes::Aes128>::new_from_slices(key, iv)
            .map_err(|e| Error::InvalidInput(format!("cbc init: {e}")))?
            .decrypt_padded_vec_mut::<Pkcs7>(data),
        24 => cbc::Decryptor::<aes::Aes192>::new_from_slices(key, iv)
            .map_err(|e| Error::InvalidInput(format!("cbc init: {e}")))?
            .decrypt_padded_vec_mut::<Pkcs7>(data),
        32 => cbc::Decryptor::<aes::Aes256>::new_from_slices(key, iv)
            .map_err(|e| Error::InvalidInput(format!("cbc init: {e}")))?
            .decrypt_padded_vec_mut::<Pkcs7>(data),
        n => return Err(bad_key(n)),
    };
    out.map_err(|e| Error::Decode(format!("cbc decrypt: {e}")))
}

fn cbc_encrypt(data: &[u8], key: &str, iv: &str) -> Result<Vec<u8>> {
    let (key, iv) = (key.as_bytes(), iv.as_bytes());
    let out = match key.len() {
        16 => cbc::Encryptor::<aes::Aes128>::new_from_slices(key, iv)
            .map_err(|e| Error::InvalidInput(format!("cbc init: {e}")))?
            .encrypt_padded_vec_mut::<Pkcs7>(data),
        24 => cbc::Encryptor::<aes::Aes192>::new_from_slices(key, iv)
            .map_err(|e| Error::InvalidInput(format!("cbc init: {e}")))?
            .encrypt_padded_vec_mut::<Pkcs7>(data),
        32 => cbc::Encryptor::<aes::Aes256>::new_from_slices(key, iv)
            .map_err(|e| Error::InvalidInput(format!("cbc init: {e}")))?
            .encrypt_padded_vec_mut::<Pkcs7>(data),
        n => return Err(bad_key(n)),
    };
    Ok(out)
}

fn gcm_cipher(key: &str) -> Result<Aes256Gcm> {
    let digest = Sha256::digest(key.as_bytes());
    Aes256Gcm::new_from_slice(&digest).map_err(|e| Error::InvalidInput(format!("gcm init: {e}")))
}

fn gcm_decrypt(data: &[u8], key: &str) -> Result<Vec<u8>> {
    if data.len() < NONCE_LEN {
        return Err(Error::Decode(
            "ciphertext too short (missing nonce)".to_string(),
        ));
    }
    let (nonce, ciphertext) = data.split_at(NONCE_LEN);
    gcm_cipher(key)?
        .decrypt(Nonce::from_slice(nonce), ciphertext)
        .map_err(|e| Error::Decode(format!("gcm decrypt: {e}")))
}

fn gcm_encrypt(data: &[u8], key: &str) -> Result<Vec<u8>> {
    let mut nonce = [0u8; NONCE_LEN];
    rand::thread_rng().fill_bytes(&mut nonce);
    let ciphertext = gcm_cipher(key)?
        .encrypt(Nonce::from_slice(&nonce), data)
        .map_err(|e| Error::BackendMessage(format!("gcm encrypt: {e}")))?;
    let mut out = Vec::with_capacity(NONCE_LEN + ciphertext.len());
    out.extend_from_slice(&nonce);
    out.extend_from_slice(&ciphertext);
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::onboard::memory::MemoryKvStore;

    fn secrets() -> CryptoSecrets {
        CryptoSecrets {
            hashing_secret: "h".to_string(),
            encryption_key_w1: "0123456789abcdef".to_string(),
            encryption_iv_w1: "fedcba9876543210".to_string(),
            encryption_key_w2: "0123456789abcdef0123456789abcdef".to_string(),
            encryption_iv_w2: "1111222233334444".to_string(),
            encryption_key_w3: "any length key material".to_string(),
        }
    }

    #[test]
    fn cbc_matches_known_vector() {
        // NIST SP 800-38A F.2.1 (AES-128-CBC), first block, with a PKCS#7 padding block appended.
        let key = hex::decode("2b7e151628aed2a6abf7158809cf4f3c").unwrap();
        let iv = hex::decode("000102030405060708090a0b0c0d0e0f").unwrap();
        let plain = hex::decode("6bc1bee22e409f96e93d7e117393172a").unwrap();
        let out = cbc::Encryptor::<aes::Aes128>::new_from_slices(&key, &iv)
            .unwrap()
            .encrypt_padded_vec_mut::<Pkcs7>(&plain);
        assert_eq!(
            hex::encode(&out[..16]),
            "7649abac8119b246cee98e9b12e9197d"
        );
        assert_eq!(out.len(), 32);
    }

    #[test]
    fn each_scheme_decrypts_what_it_encrypts() {
        let cipher = CredentialCipher::new(secrets());
        for scheme in [CipherScheme::W1, CipherScheme::W2, CipherScheme::W3] {
            let sealed = cipher.encrypt("7b2268223a2231227d", scheme).unwrap();
            assert_eq!(cipher.decrypt(&sealed, scheme).unwrap(), "7b2268223a2231227d");
        }
    }

    #[test]
    fn wrong_scheme_or_garbage_fails() {
        let cipher = CredentialCipher::new(secrets());
        let sealed = cipher.encrypt("payload", CipherScheme::W3).unwrap();
        assert!(cipher.decrypt(&sealed[..10], CipherScheme::W3).is_err());
        assert!(cipher.decrypt("zz", CipherScheme::W1).is_err());
    }

    #[test]
    fn bad_key_length_is_rejected() {
        let cipher = CredentialCipher::new(CryptoSecrets {
            encryption_key_w1: "short".to_string(),
            encryption_iv_w1: "fedcba9876543210".to_string(),
            ..CryptoSecrets::default()
        });
        assert!(matches!(
            cipher.encrypt("x", CipherScheme::W1),
            Err(Error::InvalidInput(_))
        ));
    }

    #[tokio::test]
    async fn load_reads_blob_from_hash() {
        let kv = MemoryKvStore::new();
        assert!(matches!(
            CredentialCipher::load(&kv, "crypto", "secret").await,
            Err(Error::NotFound(_))
        ));

        kv.hset(
            "crypto",
            "secret",
            r#"{"encryption_key_w1":"0123456789abcdef","encryption_iv_w1":"fedcba9876543210"}"#,
        )
        .await;
        let cipher = CredentialCipher::load(&kv, "crypto", "secret").await.unwrap();
        let sealed = cipher.encrypt("abc", CipherScheme::W1).unwrap();
        assert_eq!(cipher.decrypt(&sealed, CipherScheme::W1).unwrap(), "abc");
    }
}
