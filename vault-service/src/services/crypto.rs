//! AES-256-GCM encryption of individual secret values.
//!
//! Records are stored as `nonce:tag:ciphertext`, each part lowercase hex.

use aes_gcm::{
    aead::{generic_array::GenericArray, AeadInPlace, KeyInit},
    Aes256Gcm,
};
use rand::{rngs::OsRng, RngCore};
use secrecy::{ExposeSecret, SecretString};
use sha2::{Digest, Sha256};

use super::error::ServiceError;

pub const KEY_LEN: usize = 32;
pub const NONCE_LEN: usize = 12;
pub const TAG_LEN: usize = 16;

/// Derive the 256-bit data key from the operator-supplied master secret.
pub fn derive_key(master_secret: &SecretString) -> [u8; KEY_LEN] {
    let digest = Sha256::digest(master_secret.expose_secret().as_bytes());
    let mut key = [0u8; KEY_LEN];
    key.copy_from_slice(&digest);
    key
}

#[derive(Clone)]
pub struct CryptoEngine {
    cipher: Aes256Gcm,
}

impl CryptoEngine {
    pub fn new(master_secret: &SecretString) -> Result<Self, ServiceError> {
        if master_secret.expose_secret().trim().is_empty() {
            return Err(ServiceError::Internal(anyhow::anyhow!(
                "encryption master secret is empty"
            )));
        }

        let key = derive_key(master_secret);
        let cipher = Aes256Gcm::new_from_slice(&key)
            .map_err(|e| ServiceError::Internal(anyhow::anyhow!("invalid key length: {}", e)))?;

        Ok(Self { cipher })
    }

    pub fn encrypt(&self, plaintext: &str) -> Result<String, ServiceError> {
        let mut nonce = [0u8; NONCE_LEN];
        OsRng.fill_bytes(&mut nonce);

        let mut buffer = plaintext.as_bytes().to_vec();
        let tag = self
            .cipher
            .encrypt_in_place_detached(GenericArray::from_slice(&nonce), b"", &mut buffer)
            .map_err(|_| ServiceError::Internal(anyhow::anyhow!("encryption failed")))?;

        Ok(format!(
            "{}:{}:{}",
            hex::encode(nonce),
            hex::encode(tag),
            hex::encode(buffer)
        ))
    }

    pub fn decrypt(&self, record: &str) -> Result<String, ServiceError> {
        // Only the canonical lowercase form is accepted, so any altered byte
        // of the record is detected rather than normalized away.
        if !record
            .bytes()
            .all(|b| b == b':' || b.is_ascii_digit() || (b'a'..=b'f').contains(&b))
        {
            return Err(ServiceError::Integrity);
        }

        let mut parts = record.split(':');
        let (Some(nonce), Some(tag), Some(ciphertext), None) =
            (parts.next(), parts.next(), parts.next(), parts.next())
        else {
            return Err(ServiceError::Integrity);
        };

        let nonce = hex::decode(nonce).map_err(|_| ServiceError::Integrity)?;
        let tag = hex::decode(tag).map_err(|_| ServiceError::Integrity)?;
        let mut buffer = hex::decode(ciphertext).map_err(|_| ServiceError::Integrity)?;

        if nonce.len() != NONCE_LEN || tag.len() != TAG_LEN {
            return Err(ServiceError::Integrity);
        }

        self.cipher
            .decrypt_in_place_detached(
                GenericArray::from_slice(&nonce),
                b"",
                &mut buffer,
                GenericArray::from_slice(&tag),
            )
            .map_err(|_| ServiceError::Integrity)?;

        String::from_utf8(buffer).map_err(|_| ServiceError::Integrity)
    }
}
