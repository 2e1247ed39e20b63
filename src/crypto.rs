//! Credential encryption using AES-256-GCM
//!
//! Cluster ops configs carry cloud access keys and the ECS login password
//! encrypted at rest. Ciphertexts are base64 text of
//! `version || nonce || ciphertext+tag`, bound to the owning cluster through
//! the additional authenticated data.

#![allow(deprecated)]

use std::fmt;

use aes_gcm::{
    Aes256Gcm, Key, Nonce,
    aead::{Aead, AeadCore, KeyInit, OsRng, Payload},
};
use base64::{Engine as _, engine::general_purpose};
use thiserror::Error;
use zeroize::{Zeroize, ZeroizeOnDrop};

const VERSION_ENCRYPTED: u8 = 0x01;
const VERSION_FIELD_LEN: usize = 1;
const NONCE_LEN: usize = 12;
const TAG_LEN: usize = 16;
const MIN_ENCRYPTED_LEN: usize = VERSION_FIELD_LEN + NONCE_LEN + TAG_LEN;

/// Crypto error types
#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("encryption failed: {0}")]
    EncryptionFailed(String),
    #[error("decryption failed: {0}")]
    DecryptionFailed(String),
    #[error("invalid ciphertext format")]
    InvalidFormat,
    #[error("empty ciphertext")]
    EmptyCiphertext,
}

/// Secure wrapper for encryption keys with zeroization
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct CryptoKey(Vec<u8>);

impl CryptoKey {
    pub fn new(bytes: Vec<u8>) -> Result<Self, CryptoError> {
        if bytes.len() != 32 {
            return Err(CryptoError::EncryptionFailed(
                "Invalid key length: expected 32 bytes".to_string(),
            ));
        }
        Ok(CryptoKey(bytes))
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl fmt::Debug for CryptoKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("CryptoKey([REDACTED])")
    }
}

/// Decrypted secret value. `Debug` never prints the content and the buffer
/// is wiped on drop.
#[derive(Clone, Default, PartialEq, Eq, Zeroize, ZeroizeOnDrop)]
pub struct Secret(String);

impl Secret {
    pub fn new(value: impl Into<String>) -> Self {
        Secret(value.into())
    }

    pub fn expose(&self) -> &str {
        &self.0
    }

    /// True when the secret is empty once spaces are removed.
    pub fn is_blank(&self) -> bool {
        self.0.chars().all(|c| c == ' ')
    }
}

impl fmt::Debug for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("[REDACTED]")
    }
}

impl From<&str> for Secret {
    fn from(value: &str) -> Self {
        Secret::new(value)
    }
}

/// Symmetric decryption of the credential fields stored in ops configs.
pub trait CredentialCipher: Send + Sync {
    /// Decrypt `ciphertext` that was encrypted for `cluster`.
    fn decrypt(&self, cluster: &str, ciphertext: &str) -> Result<Secret, CryptoError>;

    /// Encrypt `plaintext` for `cluster`, producing the stored text form.
    fn encrypt(&self, cluster: &str, plaintext: &Secret) -> Result<String, CryptoError>;
}

/// [`CredentialCipher`] backed by AES-256-GCM with the cluster name as AAD.
pub struct AesGcmCredentialCipher {
    key: CryptoKey,
}

impl AesGcmCredentialCipher {
    pub fn new(key: CryptoKey) -> Self {
        Self { key }
    }

    /// Build from raw configured key bytes.
    pub fn from_key_bytes(bytes: &[u8]) -> Result<Self, CryptoError> {
        Ok(Self::new(CryptoKey::new(bytes.to_vec())?))
    }
}

impl CredentialCipher for AesGcmCredentialCipher {
    fn decrypt(&self, cluster: &str, ciphertext: &str) -> Result<Secret, CryptoError> {
        let raw = general_purpose::STANDARD
            .decode(ciphertext.trim())
            .map_err(|_| CryptoError::InvalidFormat)?;
        let plaintext = decrypt_bytes(&self.key, cluster.as_bytes(), &raw)?;
        String::from_utf8(plaintext)
            .map(Secret)
            .map_err(|e| CryptoError::DecryptionFailed(format!("Invalid UTF-8: {}", e)))
    }

    fn encrypt(&self, cluster: &str, plaintext: &Secret) -> Result<String, CryptoError> {
        let raw = encrypt_bytes(&self.key, cluster.as_bytes(), plaintext.expose().as_bytes())?;
        Ok(general_purpose::STANDARD.encode(raw))
    }
}

/// Encrypt bytes using AES-256-GCM
pub fn encrypt_bytes(
    key: &CryptoKey,
    aad: &[u8],
    plaintext: &[u8],
) -> Result<Vec<u8>, CryptoError> {
    let cipher_key = Key::<Aes256Gcm>::from_slice(key.as_bytes());
    let cipher = Aes256Gcm::new(cipher_key);

    let nonce = Aes256Gcm::generate_nonce(&mut OsRng);

    let mut ciphertext = cipher
        .encrypt(
            &nonce,
            Payload {
                msg: plaintext,
                aad,
            },
        )
        .map_err(|e| CryptoError::EncryptionFailed(e.to_string()))?;

    let mut result = Vec::with_capacity(VERSION_FIELD_LEN + NONCE_LEN + ciphertext.len());
    result.push(VERSION_ENCRYPTED);
    result.extend_from_slice(&nonce);
    result.append(&mut ciphertext);

    Ok(result)
}

/// Decrypt bytes using AES-256-GCM
pub fn decrypt_bytes(
    key: &CryptoKey,
    aad: &[u8],
    ciphertext: &[u8],
) -> Result<Vec<u8>, CryptoError> {
    if ciphertext.is_empty() {
        return Err(CryptoError::EmptyCiphertext);
    }

    if ciphertext[0] != VERSION_ENCRYPTED || ciphertext.len() < MIN_ENCRYPTED_LEN {
        return Err(CryptoError::InvalidFormat);
    }

    let nonce = Nonce::from_slice(&ciphertext[VERSION_FIELD_LEN..VERSION_FIELD_LEN + NONCE_LEN]);
    let tag_and_ct = &ciphertext[VERSION_FIELD_LEN + NONCE_LEN..];

    debug_assert!(tag_and_ct.len() >= TAG_LEN);

    let cipher_key = Key::<Aes256Gcm>::from_slice(key.as_bytes());
    let cipher = Aes256Gcm::new(cipher_key);

    cipher
        .decrypt(
            nonce,
            Payload {
                msg: tag_and_ct,
                aad,
            },
        )
        .map_err(|e| CryptoError::DecryptionFailed(e.to_string()))
}
