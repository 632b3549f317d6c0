//! AES-256-GCM binding of a key chain to an [`Entity`].
//!
//! # Wire format
//!
//! ```text
//! [1 byte version][12 bytes nonce][N bytes ciphertext][16 bytes auth tag]
//! ```
//!
//! The associated data is the version byte followed by the entity name, so a value
//! sealed under one entity fails authentication under any other.

use std::{
    fmt,
    sync::{Arc, Mutex},
};

use aes_gcm::{
    aead::{Aead, AeadCore, KeyInit, OsRng, Payload},
    Aes256Gcm, Nonce,
};
use thiserror::Error;

use crate::{
    key_provider::{KeyChain, KeyError, KeyMaterial},
    runtime::CryptoRuntime,
};

/// Current ciphertext format version.
pub const CIPHER_VERSION: u8 = 1;

/// Namespace used as the entity when a store is opened without a password.
pub const DEFAULT_ENTITY: &str = "sealed_prefs";

const NONCE_SIZE: usize = 12;
const TAG_SIZE: usize = 16;
const HEADER_SIZE: usize = 1 + NONCE_SIZE;

#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("cipher backend not initialized")]
    Unavailable,
    #[error("cipher backend failure: {0}")]
    Backend(String),
    #[error("key chain: {0}")]
    KeyChain(#[from] KeyError),
    #[error("encrypt failed: {0}")]
    Encrypt(String),
    #[error("ciphertext failed authentication")]
    Authentication,
    #[error("malformed ciphertext: {0}")]
    Malformed(String),
}

/// Domain-separation tag mixed into every authentication tag.
#[derive(Clone, PartialEq, Eq)]
pub struct Entity {
    name: String,
}

impl Entity {
    pub fn create(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }

    /// The password itself is the tag; an absent or empty one maps to [`DEFAULT_ENTITY`].
    /// No key derivation is applied, so the tag gives no brute-force resistance.
    pub fn from_password(password: Option<&str>) -> Self {
        match password {
            Some(password) if !password.is_empty() => Self::create(password),
            _ => Self::create(DEFAULT_ENTITY),
        }
    }

    pub fn as_bytes(&self) -> &[u8] {
        self.name.as_bytes()
    }
}

// The entity is often the caller's password.
impl fmt::Debug for Entity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Entity").finish_non_exhaustive()
    }
}

/// Encrypt/decrypt capability bound to one key and entity.
pub trait EntityCipher: Send + Sync {
    /// Whether the backend is ready; when false every operation fails with `Unavailable`.
    fn available(&self) -> bool;

    fn encrypt(&self, plaintext: &[u8]) -> Result<Vec<u8>, CryptoError>;

    fn decrypt(&self, ciphertext: &[u8]) -> Result<Vec<u8>, CryptoError>;
}

/// Production [`EntityCipher`]: AES-256-GCM keyed from a [`KeyChain`].
///
/// The key is fetched on first use and cached. All operations go through one mutex.
pub struct CipherBinding {
    key_chain: Box<dyn KeyChain>,
    entity: Entity,
    runtime: Arc<CryptoRuntime>,
    cipher: Mutex<Option<Aes256Gcm>>,
}

impl CipherBinding {
    pub fn new(
        key_chain: impl KeyChain + 'static,
        entity: Entity,
        runtime: Arc<CryptoRuntime>,
    ) -> Self {
        Self {
            key_chain: Box::new(key_chain),
            entity,
            runtime,
            cipher: Mutex::new(None),
        }
    }

    fn associated_data(&self) -> Vec<u8> {
        let entity = self.entity.as_bytes();
        let mut aad = Vec::with_capacity(1 + entity.len());
        aad.push(CIPHER_VERSION);
        aad.extend_from_slice(entity);
        aad
    }

    fn with_cipher<T>(
        &self,
        op: impl FnOnce(&Aes256Gcm) -> Result<T, CryptoError>,
    ) -> Result<T, CryptoError> {
        if !self.available() {
            return Err(CryptoError::Unavailable);
        }

        let mut guard = self
            .cipher
            .lock()
            .map_err(|err| CryptoError::Backend(format!("lock poisoned: {err}")))?;
        if guard.is_none() {
            let material = self.key_chain.cipher_key()?;
            *guard = Some(build_cipher(&material)?);
        }
        let cipher = guard.as_ref().ok_or(CryptoError::Unavailable)?;
        op(cipher)
    }
}

impl EntityCipher for CipherBinding {
    fn available(&self) -> bool {
        self.runtime.is_ready()
    }

    fn encrypt(&self, plaintext: &[u8]) -> Result<Vec<u8>, CryptoError> {
        let aad = self.associated_data();
        self.with_cipher(|cipher| {
            let nonce = Aes256Gcm::generate_nonce(&mut OsRng);
            let sealed = cipher
                .encrypt(
                    &nonce,
                    Payload {
                        msg: plaintext,
                        aad: &aad,
                    },
                )
                .map_err(|e| CryptoError::Encrypt(e.to_string()))?;

            let mut out = Vec::with_capacity(HEADER_SIZE + sealed.len());
            out.push(CIPHER_VERSION);
            out.extend_from_slice(nonce.as_slice());
            out.extend_from_slice(&sealed);
            Ok(out)
        })
    }

    fn decrypt(&self, ciphertext: &[u8]) -> Result<Vec<u8>, CryptoError> {
        if !self.available() {
            return Err(CryptoError::Unavailable);
        }
        if ciphertext.len() < HEADER_SIZE + TAG_SIZE {
            return Err(CryptoError::Malformed(format!(
                "expected at least {} bytes, got {}",
                HEADER_SIZE + TAG_SIZE,
                ciphertext.len()
            )));
        }
        if ciphertext[0] != CIPHER_VERSION {
            return Err(CryptoError::Malformed(format!(
                "unsupported version {}",
                ciphertext[0]
            )));
        }

        let aad = self.associated_data();
        let nonce = Nonce::from_slice(&ciphertext[1..HEADER_SIZE]);
        self.with_cipher(|cipher| {
            cipher
                .decrypt(
                    nonce,
                    Payload {
                        msg: &ciphertext[HEADER_SIZE..],
                        aad: &aad,
                    },
                )
                .map_err(|_| CryptoError::Authentication)
        })
    }
}

fn build_cipher(material: &KeyMaterial) -> Result<Aes256Gcm, CryptoError> {
    Aes256Gcm::new_from_slice(&material.bytes)
        .map_err(|e| CryptoError::Backend(format!("cipher init failed: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::key_provider::InMemoryKeyChain;

    fn ready_runtime() -> Arc<CryptoRuntime> {
        let runtime = Arc::new(CryptoRuntime::new());
        runtime.init().expect("init runtime");
        runtime
    }

    fn binding(key_chain: &InMemoryKeyChain, entity: &str) -> CipherBinding {
        CipherBinding::new(key_chain.clone(), Entity::create(entity), ready_runtime())
    }

    #[test]
    fn round_trip_encrypts_and_decrypts() {
        let cipher = binding(&InMemoryKeyChain::default(), "entity");
        let sealed = cipher.encrypt(b"hello").expect("encrypt");

        assert_eq!(sealed[0], CIPHER_VERSION);
        assert_eq!(sealed.len(), HEADER_SIZE + 5 + TAG_SIZE);
        assert_eq!(cipher.decrypt(&sealed).expect("decrypt"), b"hello");
    }

    #[test]
    fn nonces_differ_between_calls() {
        let cipher = binding(&InMemoryKeyChain::default(), "entity");
        let a = cipher.encrypt(b"same").expect("encrypt");
        let b = cipher.encrypt(b"same").expect("encrypt");
        assert_ne!(a, b);
    }

    #[test]
    fn other_entity_fails_authentication() {
        let key_chain = InMemoryKeyChain::default();
        let sealed = binding(&key_chain, "p1").encrypt(b"secret").expect("encrypt");

        let err = binding(&key_chain, "p2")
            .decrypt(&sealed)
            .expect_err("wrong entity");
        assert!(matches!(err, CryptoError::Authentication));
    }

    #[test]
    fn tampered_ciphertext_is_rejected() {
        let cipher = binding(&InMemoryKeyChain::default(), "entity");
        let mut sealed = cipher.encrypt(b"secret").expect("encrypt");
        let last = sealed.len() - 1;
        sealed[last] ^= 0x01;

        assert!(matches!(
            cipher.decrypt(&sealed),
            Err(CryptoError::Authentication)
        ));
    }

    #[test]
    fn short_or_unknown_version_is_malformed() {
        let cipher = binding(&InMemoryKeyChain::default(), "entity");
        assert!(matches!(
            cipher.decrypt(b"short"),
            Err(CryptoError::Malformed(_))
        ));

        let mut sealed = cipher.encrypt(b"secret").expect("encrypt");
        sealed[0] = 9;
        assert!(matches!(
            cipher.decrypt(&sealed),
            Err(CryptoError::Malformed(_))
        ));
    }

    #[test]
    fn uninitialized_runtime_is_unavailable() {
        let cipher = CipherBinding::new(
            InMemoryKeyChain::default(),
            Entity::create("entity"),
            Arc::new(CryptoRuntime::new()),
        );
        assert!(!cipher.available());
        assert!(matches!(
            cipher.encrypt(b"x"),
            Err(CryptoError::Unavailable)
        ));
        assert!(matches!(
            cipher.decrypt(b"short"),
            Err(CryptoError::Unavailable)
        ));
    }

    #[test]
    fn empty_password_uses_default_entity() {
        assert!(Entity::from_password(None) == Entity::create(DEFAULT_ENTITY));
        assert!(Entity::from_password(Some("")) == Entity::create(DEFAULT_ENTITY));
        assert!(Entity::from_password(Some("pw")) == Entity::create("pw"));
    }
}
