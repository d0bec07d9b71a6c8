//! Credential encryption and session-token hashing for the pairing store.
//!
//! Gateway tokens are sealed with AES-256-GCM under a key derived from the configured
//! pairing secret. The sealed form is a four-part envelope:
//!
//! ```text
//! <keyId>.<nonce>.<tag>.<ciphertext>
//! ```
//!
//! `keyId` is a short fingerprint of the key that sealed the value, so a store written
//! under an older secret stays readable as long as that secret is still registered via
//! [`SecretBox::with_previous`]. Nonce, tag and ciphertext are base64url without padding.

use aes_gcm::aead::{AeadInPlace, KeyInit};
use aes_gcm::{Aes256Gcm, Key, Nonce, Tag};
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use sha2::{Digest, Sha256};

const NONCE_LEN: usize = 12;
const TAG_LEN: usize = 16;
const ENVELOPE_PARTS: usize = 4;

#[derive(Debug, thiserror::Error)]
pub enum CryptoError {
    #[error("pairing secret is not configured")]
    MissingSecret,
    #[error("os randomness unavailable: {0}")]
    Random(String),
    #[error("encryption failed")]
    Encrypt,
}

/// Failure to open a sealed value. Callers treat every variant the same way (as "not found");
/// the variants exist for logging.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum DecryptError {
    #[error("malformed envelope: expected {ENVELOPE_PARTS} parts, got {0}")]
    Malformed(usize),
    #[error("envelope part is not valid base64url")]
    Encoding,
    #[error("invalid nonce or tag length")]
    Length,
    #[error("no key registered for key id {0}")]
    UnknownKey(String),
    #[error("authentication tag mismatch")]
    Authentication,
    #[error("plaintext is not valid utf-8")]
    Utf8,
}

/// Derive the 32-byte symmetric key from the process secret.
pub fn derive_key(secret: &str) -> [u8; 32] {
    let digest = Sha256::digest(secret.as_bytes());
    let mut key = [0u8; 32];
    key.copy_from_slice(&digest);
    key
}

/// One-way, deterministic hash of a bearer token (lowercase hex SHA-256).
pub fn hash_token(token: &str) -> String {
    format!("{:x}", Sha256::digest(token.as_bytes()))
}

/// Fill `buf` from the OS random source.
pub fn fill_random(buf: &mut [u8]) -> Result<(), CryptoError> {
    getrandom::getrandom(buf).map_err(|e| CryptoError::Random(e.to_string()))
}

struct SealingKey {
    id: String,
    cipher: Aes256Gcm,
}

impl SealingKey {
    fn from_secret(secret: &str) -> Self {
        let key = derive_key(secret);
        let mut hasher = Sha256::new();
        hasher.update(b"clawrelay-key-id");
        hasher.update(key);
        let id = format!("{:x}", hasher.finalize())[..8].to_string();
        Self {
            id,
            cipher: Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&key)),
        }
    }
}

/// Authenticated encryption for small secrets (gateway tokens).
pub struct SecretBox {
    primary: SealingKey,
    previous: Vec<SealingKey>,
}

impl std::fmt::Debug for SecretBox {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SecretBox")
            .field("key_id", &self.primary.id)
            .field("previous", &self.previous.len())
            .finish()
    }
}

impl SecretBox {
    /// Build from the configured secret. An empty secret is a configuration error.
    pub fn new(secret: &str) -> Result<Self, CryptoError> {
        let secret = secret.trim();
        if secret.is_empty() {
            return Err(CryptoError::MissingSecret);
        }
        Ok(Self {
            primary: SealingKey::from_secret(secret),
            previous: Vec::new(),
        })
    }

    /// Register retired secrets whose envelopes must still open. New values are always
    /// sealed with the primary secret.
    pub fn with_previous<S: AsRef<str>>(mut self, secrets: &[S]) -> Self {
        for s in secrets {
            let s = s.as_ref().trim();
            if s.is_empty() {
                continue;
            }
            let key = SealingKey::from_secret(s);
            if key.id != self.primary.id && !self.previous.iter().any(|k| k.id == key.id) {
                self.previous.push(key);
            }
        }
        self
    }

    /// Key id of the primary secret (appears as the first envelope part).
    pub fn key_id(&self) -> &str {
        &self.primary.id
    }

    /// Seal `plaintext` under a fresh random nonce.
    pub fn encrypt(&self, plaintext: &[u8]) -> Result<String, CryptoError> {
        let mut nonce = [0u8; NONCE_LEN];
        fill_random(&mut nonce)?;
        let mut buffer = plaintext.to_vec();
        let tag = self
            .primary
            .cipher
            .encrypt_in_place_detached(
                Nonce::from_slice(&nonce),
                self.primary.id.as_bytes(),
                buffer.as_mut_slice(),
            )
            .map_err(|_| CryptoError::Encrypt)?;
        Ok(format!(
            "{}.{}.{}.{}",
            self.primary.id,
            URL_SAFE_NO_PAD.encode(nonce),
            URL_SAFE_NO_PAD.encode(tag.as_slice()),
            URL_SAFE_NO_PAD.encode(&buffer),
        ))
    }

    /// Open an envelope produced by [`SecretBox::encrypt`].
    pub fn decrypt(&self, sealed: &str) -> Result<Vec<u8>, DecryptError> {
        let parts: Vec<&str> = sealed.split('.').collect();
        if parts.len() != ENVELOPE_PARTS {
            return Err(DecryptError::Malformed(parts.len()));
        }
        let (key_id, nonce_b64, tag_b64, ct_b64) = (parts[0], parts[1], parts[2], parts[3]);
        let key = std::iter::once(&self.primary)
            .chain(self.previous.iter())
            .find(|k| k.id == key_id)
            .ok_or_else(|| DecryptError::UnknownKey(key_id.to_string()))?;

        let nonce = URL_SAFE_NO_PAD
            .decode(nonce_b64)
            .map_err(|_| DecryptError::Encoding)?;
        let tag = URL_SAFE_NO_PAD
            .decode(tag_b64)
            .map_err(|_| DecryptError::Encoding)?;
        let mut buffer = URL_SAFE_NO_PAD
            .decode(ct_b64)
            .map_err(|_| DecryptError::Encoding)?;
        if nonce.len() != NONCE_LEN || tag.len() != TAG_LEN {
            return Err(DecryptError::Length);
        }

        key.cipher
            .decrypt_in_place_detached(
                Nonce::from_slice(&nonce),
                key.id.as_bytes(),
                buffer.as_mut_slice(),
                Tag::from_slice(&tag),
            )
            .map_err(|_| DecryptError::Authentication)?;
        Ok(buffer)
    }

    /// Seal a UTF-8 string.
    pub fn encrypt_str(&self, plaintext: &str) -> Result<String, CryptoError> {
        self.encrypt(plaintext.as_bytes())
    }

    /// Open an envelope whose plaintext must be UTF-8.
    pub fn decrypt_str(&self, sealed: &str) -> Result<String, DecryptError> {
        String::from_utf8(self.decrypt(sealed)?).map_err(|_| DecryptError::Utf8)
    }
}
