//! Credential vault
//!
//! Target secrets are stored as self-describing AES-256-GCM blobs:
//!
//! ```json
//! {"v":1,"iv":"<base64 12 bytes>","tag":"<base64 16 bytes>","ct":"<base64>"}
//! ```
//!
//! Only the long-lived key is needed to open a blob. The version tag leaves room
//! for a future key-rotation format.

use aes_gcm::aead::{Aead, KeyInit, Payload};
use aes_gcm::{Aes256Gcm, Nonce};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use rand::rngs::OsRng;
use rand::RngCore;
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::errors::CryptoError;
use crate::utils::hex;

pub const BLOB_VERSION: u64 = 1;
const IV_LEN: usize = 12;
const TAG_LEN: usize = 16;
const KEY_LEN: usize = 32;
const AAD: &[u8] = b"credential";

#[derive(Debug, Serialize, Deserialize)]
struct StoredSecret {
    v: u64,
    iv: String,
    tag: String,
    ct: String,
}

/// Encrypts and decrypts target credentials
#[derive(Clone)]
pub struct Vault {
    cipher: Aes256Gcm,
}

impl std::fmt::Debug for Vault {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Vault").finish_non_exhaustive()
    }
}

impl Vault {
    /// Build a vault from configured key material.
    ///
    /// 64 hex characters or base64 that decodes to 32 bytes are used as the raw
    /// key; any other non-empty string is stretched with SHA-256.
    pub fn from_key_material(material: Option<&str>) -> Result<Self, CryptoError> {
        let material = material.map(str::trim).unwrap_or_default();
        if material.is_empty() {
            return Err(CryptoError::MissingKey);
        }
        let key = derive_key(material);
        let cipher = Aes256Gcm::new_from_slice(&key)
            .map_err(|e| CryptoError::InvalidKey(e.to_string()))?;
        Ok(Self { cipher })
    }

    /// Encrypt a secret into a blob string
    pub fn encrypt(&self, plaintext: &SecretString) -> Result<String, CryptoError> {
        let plaintext = plaintext.expose_secret();
        if plaintext.trim().is_empty() {
            return Err(CryptoError::EmptyPlaintext);
        }

        let mut iv = [0u8; IV_LEN];
        OsRng.fill_bytes(&mut iv);

        let sealed = self
            .cipher
            .encrypt(
                Nonce::from_slice(&iv),
                Payload {
                    msg: plaintext.as_bytes(),
                    aad: AAD,
                },
            )
            .map_err(|_| CryptoError::InvalidFormat("encryption failed".to_string()))?;

        // aes-gcm appends the tag to the ciphertext
        let (ct, tag) = sealed.split_at(sealed.len() - TAG_LEN);
        let blob = StoredSecret {
            v: BLOB_VERSION,
            iv: BASE64.encode(iv),
            tag: BASE64.encode(tag),
            ct: BASE64.encode(ct),
        };
        serde_json::to_string(&blob).map_err(|e| CryptoError::InvalidFormat(e.to_string()))
    }

    /// Open a blob produced by [`Vault::encrypt`]
    pub fn decrypt(&self, blob: &str) -> Result<SecretString, CryptoError> {
        let stored: StoredSecret = serde_json::from_str(blob)
            .map_err(|e| CryptoError::InvalidFormat(e.to_string()))?;
        if stored.v != BLOB_VERSION {
            return Err(CryptoError::UnsupportedVersion(stored.v));
        }

        let iv = decode_field("iv", &stored.iv)?;
        let tag = decode_field("tag", &stored.tag)?;
        let mut sealed = decode_field("ct", &stored.ct)?;
        if iv.len() != IV_LEN {
            return Err(CryptoError::InvalidFormat(format!(
                "iv must be {} bytes, got {}",
                IV_LEN,
                iv.len()
            )));
        }
        if tag.len() != TAG_LEN {
            return Err(CryptoError::InvalidFormat(format!(
                "tag must be {} bytes, got {}",
                TAG_LEN,
                tag.len()
            )));
        }
        sealed.extend_from_slice(&tag);

        let plain = self
            .cipher
            .decrypt(
                Nonce::from_slice(&iv),
                Payload {
                    msg: &sealed,
                    aad: AAD,
                },
            )
            .map_err(|_| CryptoError::AuthenticationFailed)?;

        let text = String::from_utf8(plain)
            .map_err(|_| CryptoError::InvalidFormat("plaintext is not UTF-8".to_string()))?;
        Ok(SecretString::from(text))
    }

    /// Encrypt an optional secret, treating blank input as absent
    pub fn encrypt_optional(
        &self,
        plaintext: Option<&SecretString>,
    ) -> Result<Option<String>, CryptoError> {
        match plaintext {
            Some(secret) if !secret.expose_secret().trim().is_empty() => {
                self.encrypt(secret).map(Some)
            }
            _ => Ok(None),
        }
    }
}

/// Fresh random key as 64 hex characters
pub fn generate_key() -> String {
    let mut key = [0u8; KEY_LEN];
    OsRng.fill_bytes(&mut key);
    hex::encode(key)
}

fn derive_key(material: &str) -> [u8; KEY_LEN] {
    if material.len() == KEY_LEN * 2 {
        if let Some(bytes) = hex::decode(material) {
            if let Ok(key) = <[u8; KEY_LEN]>::try_from(bytes.as_slice()) {
                return key;
            }
        }
    }
    if let Ok(bytes) = BASE64.decode(material) {
        if let Ok(key) = <[u8; KEY_LEN]>::try_from(bytes.as_slice()) {
            return key;
        }
    }
    let digest = Sha256::digest(material.as_bytes());
    let mut key = [0u8; KEY_LEN];
    key.copy_from_slice(&digest);
    key
}

fn decode_field(name: &str, value: &str) -> Result<Vec<u8>, CryptoError> {
    BASE64
        .decode(value)
        .map_err(|e| CryptoError::InvalidFormat(format!("{} is not base64: {}", name, e)))
}
