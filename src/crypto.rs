//! Credential encryption using AES-256-GCM
//!
//! Credential payloads are serialized to JSON and sealed with AES-256-GCM. The
//! connection identity is bound as additional authenticated data (AAD), so a blob
//! moved onto another connection fails verification. Every blob records the id of
//! the key that sealed it, which lets the keyring decrypt under previous keys while
//! always encrypting under the current one.

#![allow(deprecated)]

use aes_gcm::{
    Aes256Gcm, Key, Nonce,
    aead::{Aead, AeadCore, KeyInit, OsRng, Payload},
};
use sha2::{Digest, Sha256};
use thiserror::Error;
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::config::AppConfig;
use crate::models::{ConnectionKey, Credentials};

const ENVELOPE_VERSION: u8 = 0x02;
const VERSION_FIELD_LEN: usize = 1;
const KEY_ID_LEN: usize = 4;
const NONCE_LEN: usize = 12;
const TAG_LEN: usize = 16;
const HEADER_LEN: usize = VERSION_FIELD_LEN + KEY_ID_LEN + NONCE_LEN;
const MIN_ENCRYPTED_LEN: usize = HEADER_LEN + TAG_LEN;

pub const KEY_LEN: usize = 32;

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
    #[error("unsupported envelope version {0:#04x}")]
    UnsupportedVersion(u8),
    #[error("ciphertext sealed under unknown key {0}")]
    UnknownKey(String),
    #[error("no current encryption key configured")]
    MissingKey,
    #[error("invalid key length: expected 32 bytes, got {0}")]
    InvalidKeyLength(usize),
    #[error("credential serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Secure wrapper for encryption keys with zeroization
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct ZeroizingKey(Vec<u8>);

/// Type alias for crypto keys
pub type CryptoKey = ZeroizingKey;

impl CryptoKey {
    /// Create a new crypto key from bytes
    pub fn new(bytes: Vec<u8>) -> Result<Self, CryptoError> {
        if bytes.len() != KEY_LEN {
            return Err(CryptoError::InvalidKeyLength(bytes.len()));
        }
        Ok(ZeroizingKey(bytes))
    }

    /// Get the key as bytes
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    /// First four bytes of the key's SHA-256 digest
    pub fn id(&self) -> [u8; KEY_ID_LEN] {
        let digest = Sha256::digest(&self.0);
        let mut id = [0u8; KEY_ID_LEN];
        id.copy_from_slice(&digest[..KEY_ID_LEN]);
        id
    }
}

impl std::fmt::Debug for ZeroizingKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "CryptoKey({})", hex::encode(self.id()))
    }
}

/// Encrypt bytes under `key`, producing `version | key id | nonce | ciphertext+tag`
pub fn encrypt_bytes(
    key: &CryptoKey,
    aad: &[u8],
    plaintext: &[u8],
) -> Result<Vec<u8>, CryptoError> {
    let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(key.as_bytes()));
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

    let mut result = Vec::with_capacity(HEADER_LEN + ciphertext.len());
    result.push(ENVELOPE_VERSION);
    result.extend_from_slice(&key.id());
    result.extend_from_slice(&nonce);
    result.append(&mut ciphertext);

    Ok(result)
}

/// Decrypt an envelope produced by [`encrypt_bytes`] with the given key
pub fn decrypt_bytes(
    key: &CryptoKey,
    aad: &[u8],
    ciphertext: &[u8],
) -> Result<Vec<u8>, CryptoError> {
    let envelope = Envelope::parse(ciphertext)?;
    if envelope.key_id != key.id() {
        return Err(CryptoError::UnknownKey(hex::encode(envelope.key_id)));
    }
    envelope.open(key, aad)
}

/// Borrowed view over a sealed blob
struct Envelope<'a> {
    key_id: [u8; KEY_ID_LEN],
    nonce: &'a [u8],
    sealed: &'a [u8],
}

impl<'a> Envelope<'a> {
    fn parse(ciphertext: &'a [u8]) -> Result<Self, CryptoError> {
        let Some(&version) = ciphertext.first() else {
            return Err(CryptoError::EmptyCiphertext);
        };
        if version != ENVELOPE_VERSION {
            return Err(CryptoError::UnsupportedVersion(version));
        }
        if ciphertext.len() < MIN_ENCRYPTED_LEN {
            return Err(CryptoError::InvalidFormat);
        }

        let mut key_id = [0u8; KEY_ID_LEN];
        key_id.copy_from_slice(&ciphertext[VERSION_FIELD_LEN..VERSION_FIELD_LEN + KEY_ID_LEN]);

        Ok(Self {
            key_id,
            nonce: &ciphertext[VERSION_FIELD_LEN + KEY_ID_LEN..HEADER_LEN],
            sealed: &ciphertext[HEADER_LEN..],
        })
    }

    fn open(&self, key: &CryptoKey, aad: &[u8]) -> Result<Vec<u8>, CryptoError> {
        let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(key.as_bytes()));
        cipher
            .decrypt(
                Nonce::from_slice(self.nonce),
                Payload {
                    msg: self.sealed,
                    aad,
                },
            )
            .map_err(|e| CryptoError::DecryptionFailed(e.to_string()))
    }
}

/// Keyring that seals credentials under the current key and opens blobs sealed
/// under the current or any previous key.
#[derive(Debug, Clone)]
pub struct EncryptionManager {
    current: CryptoKey,
    previous: Vec<CryptoKey>,
}

impl EncryptionManager {
    pub fn new(current: CryptoKey) -> Self {
        Self {
            current,
            previous: Vec::new(),
        }
    }

    /// Keyring with retired keys that remain valid for decryption
    pub fn with_previous_keys(current: CryptoKey, previous: Vec<CryptoKey>) -> Self {
        let current_id = current.id();
        let previous = previous
            .into_iter()
            .filter(|key| key.id() != current_id)
            .collect();
        Self { current, previous }
    }

    /// Build the keyring from the configured key material
    pub fn from_config(config: &AppConfig) -> Result<Self, CryptoError> {
        let current = config
            .crypto_key
            .clone()
            .ok_or(CryptoError::MissingKey)
            .and_then(CryptoKey::new)?;
        let previous = config
            .crypto_previous_keys
            .iter()
            .cloned()
            .map(CryptoKey::new)
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self::with_previous_keys(current, previous))
    }

    /// Hex id of the key new blobs are sealed under
    pub fn current_key_id(&self) -> String {
        hex::encode(self.current.id())
    }

    /// Serialize and seal credentials for the given connection
    pub fn encrypt_credentials(
        &self,
        key: &ConnectionKey,
        credentials: &Credentials,
    ) -> Result<Vec<u8>, CryptoError> {
        let mut plaintext = serde_json::to_vec(credentials)?;
        let sealed = encrypt_bytes(&self.current, key.aad().as_bytes(), &plaintext);
        plaintext.zeroize();
        sealed
    }

    /// Open and deserialize credentials sealed for the given connection
    pub fn decrypt_credentials(
        &self,
        key: &ConnectionKey,
        ciphertext: &[u8],
    ) -> Result<Credentials, CryptoError> {
        let envelope = Envelope::parse(ciphertext)?;
        let crypto_key = self
            .key_for(&envelope.key_id)
            .ok_or_else(|| CryptoError::UnknownKey(hex::encode(envelope.key_id)))?;

        let mut plaintext = envelope.open(crypto_key, key.aad().as_bytes())?;
        let credentials = serde_json::from_slice(&plaintext);
        plaintext.zeroize();
        Ok(credentials?)
    }

    /// Whether a blob was sealed under a key other than the current one
    pub fn needs_reencryption(&self, ciphertext: &[u8]) -> Result<bool, CryptoError> {
        let envelope = Envelope::parse(ciphertext)?;
        Ok(envelope.key_id != self.current.id())
    }

    fn key_for(&self, key_id: &[u8; KEY_ID_LEN]) -> Option<&CryptoKey> {
        std::iter::once(&self.current)
            .chain(self.previous.iter())
            .find(|key| &key.id() == key_id)
    }
}
