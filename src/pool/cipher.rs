//! Value encryption.
//!
//! Values are encoded with the portable codec, then sealed with
//! ChaCha20-Poly1305 under `SHA-256(secret)`. The stored form is
//! `Bytes(nonce || ciphertext)` and the entry key is bound as associated data.

use crate::codec::{self, Value};
use crate::core::error::{PoolError, PoolResult};
use chacha20poly1305::aead::{Aead, AeadCore, KeyInit, OsRng, Payload};
use chacha20poly1305::{ChaCha20Poly1305, Key, Nonce};
use sha2::{Digest, Sha256};

/// Nonce length for ChaCha20-Poly1305.
pub const NONCE_LEN: usize = 12;

const KEY_CHECK_DOMAIN: &[u8] = b"mvent/key-check/v1";

/// Symmetric value cipher bound to one pool secret.
#[derive(Clone)]
pub struct ValueCipher {
    aead: ChaCha20Poly1305,
    key_check: [u8; 32],
}

impl ValueCipher {
    /// Derive the cipher from an arbitrary secret.
    pub fn from_secret(secret: &[u8]) -> Self {
        let key: [u8; 32] = Sha256::digest(secret).into();

        let mut hasher = Sha256::new();
        hasher.update(KEY_CHECK_DOMAIN);
        hasher.update(key);
        let key_check: [u8; 32] = hasher.finalize().into();

        Self {
            aead: ChaCha20Poly1305::new(Key::from_slice(&key)),
            key_check,
        }
    }

    /// Key check value stamped into the segment header.
    pub fn key_check(&self) -> [u8; 32] {
        self.key_check
    }

    /// Encode and seal a value stored under `key`.
    pub fn seal(&self, key: &str, value: &Value) -> PoolResult<Value> {
        let plain = codec::encode(value)
            .map_err(|e| PoolError::invalid(format!("value for {:?} not encodable: {}", key, e)))?;
        let nonce = ChaCha20Poly1305::generate_nonce(&mut OsRng);
        let sealed = self
            .aead
            .encrypt(
                &nonce,
                Payload {
                    msg: &plain,
                    aad: key.as_bytes(),
                },
            )
            .map_err(|_| PoolError::decryption(format!("cannot seal value for {:?}", key)))?;

        let mut out = Vec::with_capacity(NONCE_LEN + sealed.len());
        out.extend_from_slice(&nonce);
        out.extend_from_slice(&sealed);
        Ok(Value::Bytes(out))
    }

    /// Open and decode a value stored under `key`.
    ///
    /// Never returns partially decoded plaintext: any failure is a
    /// decryption fault.
    pub fn open(&self, key: &str, stored: &Value) -> PoolResult<Value> {
        let raw = stored.as_bytes().ok_or_else(|| {
            PoolError::decryption(format!(
                "value for {:?} is {} but sealed values are bytes",
                key,
                stored.type_name()
            ))
        })?;
        if raw.len() < NONCE_LEN {
            return Err(PoolError::decryption(format!(
                "sealed value for {:?} is too short",
                key
            )));
        }

        let (nonce, sealed) = raw.split_at(NONCE_LEN);
        let plain = self
            .aead
            .decrypt(
                Nonce::from_slice(nonce),
                Payload {
                    msg: sealed,
                    aad: key.as_bytes(),
                },
            )
            .map_err(|_| {
                PoolError::decryption(format!("authentication failed for {:?}", key))
            })?;

        codec::decode(&plain).map_err(|e| {
            PoolError::decryption(format!("decrypted value for {:?} undecodable: {}", key, e))
        })
    }
}

impl std::fmt::Debug for ValueCipher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ValueCipher")
            .field("key", &"<redacted>")
            .finish()
    }
}
