//! Per-connection tunnel cipher: AES-256-GCM with a SHA-256 integrity hash
//! over the plaintext.
//!
//! Key and IV come from the connection configuration as base64. The
//! per-message nonce is the configured IV with a message counter folded into
//! its tail, so a session never reuses a nonce; the nonce travels in the
//! frame's `additional_data` field.

use std::sync::atomic::{AtomicU64, Ordering};

use aes_gcm::{
    aead::{Aead, KeyInit},
    Aes256Gcm, Nonce,
};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use sha2::{Digest, Sha256};

use crate::{config::EncryptionConfig, frame::EncryptedFrame};

pub const VERSION_AES_256_GCM: &str = "aes-256-gcm";
pub const NONCE_LEN: usize = 12;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum CryptoError {
    #[error("no encryption key configured")]
    MissingKey,
    #[error("aes key is not a valid base64 256-bit key")]
    InvalidKey,
    #[error("iv is not a valid base64 {NONCE_LEN}-byte nonce")]
    InvalidIv,
    #[error("unsupported frame version {0}")]
    UnsupportedVersion(String),
    #[error("nonce has wrong length {0}")]
    InvalidNonce(usize),
    #[error("encryption failed")]
    Encrypt,
    #[error("decryption failed")]
    Decrypt,
    #[error("message hash mismatch")]
    HashMismatch,
}

pub struct TunnelCipher {
    cipher: Aes256Gcm,
    iv: [u8; NONCE_LEN],
    counter: AtomicU64,
}

impl TunnelCipher {
    pub fn new(config: &EncryptionConfig) -> Result<Self, CryptoError> {
        let key = BASE64.decode(&config.aes_key).map_err(|_| CryptoError::InvalidKey)?;
        let cipher = Aes256Gcm::new_from_slice(&key).map_err(|_| CryptoError::InvalidKey)?;
        let iv: [u8; NONCE_LEN] = BASE64
            .decode(&config.iv)
            .map_err(|_| CryptoError::InvalidIv)?
            .try_into()
            .map_err(|_| CryptoError::InvalidIv)?;

        Ok(Self {
            cipher,
            iv,
            counter: AtomicU64::new(0),
        })
    }

    fn next_nonce(&self) -> [u8; NONCE_LEN] {
        let seq = self.counter.fetch_add(1, Ordering::Relaxed);
        let mut nonce = self.iv;
        for (slot, byte) in nonce[NONCE_LEN - 8..].iter_mut().zip(seq.to_be_bytes()) {
            *slot ^= byte;
        }
        nonce
    }

    pub fn encrypt(&self, chunk: &[u8]) -> Result<EncryptedFrame, CryptoError> {
        let nonce = self.next_nonce();
        let encrypted_data = self.cipher.encrypt(Nonce::from_slice(&nonce), chunk).map_err(|_| CryptoError::Encrypt)?;

        Ok(EncryptedFrame {
            encrypted_data,
            additional_data: nonce.to_vec(),
            message_hash: hex::encode(Sha256::digest(chunk)),
            version: VERSION_AES_256_GCM.to_string(),
        })
    }

    pub fn decrypt(&self, frame: &EncryptedFrame) -> Result<Vec<u8>, CryptoError> {
        if frame.version != VERSION_AES_256_GCM {
            return Err(CryptoError::UnsupportedVersion(frame.version.clone()));
        }
        if frame.additional_data.len() != NONCE_LEN {
            return Err(CryptoError::InvalidNonce(frame.additional_data.len()));
        }

        let plain = self
            .cipher
            .decrypt(Nonce::from_slice(&frame.additional_data), frame.encrypted_data.as_slice())
            .map_err(|_| CryptoError::Decrypt)?;

        if hex::encode(Sha256::digest(&plain)) != frame.message_hash {
            return Err(CryptoError::HashMismatch);
        }
        Ok(plain)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame;

    fn cipher_with(key_byte: u8) -> TunnelCipher {
        let config = EncryptionConfig {
            aes_key: BASE64.encode([key_byte; 32]),
            iv: BASE64.encode([7u8; NONCE_LEN]),
        };
        TunnelCipher::new(&config).expect("should build cipher")
    }

    #[test]
    fn roundtrip_through_wire_frame() {
        let cipher = cipher_with(42);
        let sealed = cipher.encrypt(b"ping").expect("should encrypt");
        let wire = frame::encode(&sealed).expect("should encode");
        let parsed = frame::decode(&wire).expect("should decode");
        assert_eq!(cipher.decrypt(&parsed).expect("should decrypt"), b"ping");
    }

    #[test]
    fn nonces_never_repeat() {
        let cipher = cipher_with(42);
        let a = cipher.encrypt(b"x").expect("should encrypt");
        let b = cipher.encrypt(b"x").expect("should encrypt");
        assert_ne!(a.additional_data, b.additional_data);
        assert_ne!(a.encrypted_data, b.encrypted_data);
    }

    #[test]
    fn wrong_key_fails() {
        let sealed = cipher_with(1).encrypt(b"secret").expect("should encrypt");
        assert_eq!(cipher_with(2).decrypt(&sealed), Err(CryptoError::Decrypt));
    }

    #[test]
    fn tampered_hash_fails() {
        let cipher = cipher_with(1);
        let mut sealed = cipher.encrypt(b"secret").expect("should encrypt");
        sealed.message_hash = hex::encode(Sha256::digest(b"other"));
        assert_eq!(cipher.decrypt(&sealed), Err(CryptoError::HashMismatch));
    }

    #[test]
    fn unknown_version_fails() {
        let cipher = cipher_with(1);
        let mut sealed = cipher.encrypt(b"secret").expect("should encrypt");
        sealed.version = "aes-128-cbc".to_string();
        assert!(matches!(cipher.decrypt(&sealed), Err(CryptoError::UnsupportedVersion(_))));
    }

    #[test]
    fn rejects_bad_key_material() {
        let config = EncryptionConfig {
            aes_key: BASE64.encode([1u8; 16]),
            iv: BASE64.encode([7u8; NONCE_LEN]),
        };
        assert_eq!(TunnelCipher::new(&config).err(), Some(CryptoError::InvalidKey));

        let config = EncryptionConfig {
            aes_key: BASE64.encode([1u8; 32]),
            iv: "not base64!!".to_string(),
        };
        assert_eq!(TunnelCipher::new(&config).err(), Some(CryptoError::InvalidIv));
    }
}
