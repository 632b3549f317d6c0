use std::{
    fmt,
    sync::{Arc, Mutex},
};

use base64::{engine::general_purpose, Engine as _};
use rand::{rngs::OsRng, RngCore};
use sealed_prefs_core::prefs::{PreferenceMap, StoredValue};
use thiserror::Error;
use tracing::debug;

/// Size of the symmetric value key (AES-256).
pub const KEY_SIZE_BYTES: usize = 32;

/// Preference file holding the generated key for [`PrefsBackedKeyChain`].
pub const CRYPTO_STORE_NAME: &str = "crypto.KEY_256";

const CIPHER_KEY_ENTRY: &str = "cipher_key";

// Serializes get-or-create across key chains that share one key file.
static KEY_CREATION: Mutex<()> = Mutex::new(());

/// Key material used to encrypt preference values.
#[derive(Clone, PartialEq, Eq)]
pub struct KeyMaterial {
    /// 256-bit symmetric key.
    pub bytes: [u8; KEY_SIZE_BYTES],
}

impl fmt::Debug for KeyMaterial {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyMaterial").finish_non_exhaustive()
    }
}

#[derive(Debug, Error)]
pub enum KeyError {
    #[error("keyring error: {0}")]
    Keyring(String),
    #[error("decode error: {0}")]
    Decode(String),
    #[error("generation error: {0}")]
    Generation(String),
    #[error("key storage error: {0}")]
    Storage(String),
}

/// Source of the value key (OS keychain, a preference file, or memory in tests).
///
/// The first call creates and persists a key; later calls return the same one.
pub trait KeyChain: Send + Sync {
    fn cipher_key(&self) -> Result<KeyMaterial, KeyError>;
}

impl<K: KeyChain + ?Sized> KeyChain for Arc<K> {
    fn cipher_key(&self) -> Result<KeyMaterial, KeyError> {
        (**self).cipher_key()
    }
}

/// OS keyring-backed key chain. Uses the `keyring` crate to store the key.
pub struct KeyringKeyChain {
    service: String,
    account: String,
}

impl KeyringKeyChain {
    pub fn new(service: impl Into<String>, account: impl Into<String>) -> Self {
        Self {
            service: service.into(),
            account: account.into(),
        }
    }
}

impl KeyChain for KeyringKeyChain {
    fn cipher_key(&self) -> Result<KeyMaterial, KeyError> {
        let entry = keyring::Entry::new(&self.service, &self.account)
            .map_err(|e| KeyError::Keyring(e.to_string()))?;

        match entry.get_password() {
            Ok(secret) => decode_key(&secret),
            Err(keyring::Error::NoEntry) => {
                let material = generate_key()?;
                entry
                    .set_password(&encode_key(&material))
                    .map_err(|e| KeyError::Keyring(e.to_string()))?;
                debug!(service = %self.service, "created value key in OS keyring");
                Ok(material)
            }
            Err(err) => Err(KeyError::Keyring(err.to_string())),
        }
    }
}

/// Key chain that keeps the base64 key in its own preference map,
/// next to (but separate from) the encrypted preferences.
pub struct PrefsBackedKeyChain {
    map: Box<dyn PreferenceMap>,
}

impl PrefsBackedKeyChain {
    pub fn new(map: impl PreferenceMap + 'static) -> Self {
        Self { map: Box::new(map) }
    }
}

impl KeyChain for PrefsBackedKeyChain {
    fn cipher_key(&self) -> Result<KeyMaterial, KeyError> {
        let _guard = KEY_CREATION
            .lock()
            .map_err(|err| KeyError::Generation(format!("lock poisoned: {err}")))?;

        match self.map.get(CIPHER_KEY_ENTRY) {
            Some(StoredValue::Text(secret)) => decode_key(&secret),
            Some(StoredValue::TextSet(_)) => {
                Err(KeyError::Decode("key entry holds a string set".to_string()))
            }
            None => {
                let material = generate_key()?;
                let mut editor = self.map.edit();
                editor.put_string(CIPHER_KEY_ENTRY, encode_key(&material));
                if !editor.commit() {
                    return Err(KeyError::Storage("failed to persist value key".to_string()));
                }
                debug!("created value key in preference key chain");
                Ok(material)
            }
        }
    }
}

/// In-memory key chain for tests and ephemeral sessions. Clones share one key.
#[derive(Debug, Default, Clone)]
pub struct InMemoryKeyChain {
    inner: Arc<Mutex<Option<KeyMaterial>>>,
}

impl KeyChain for InMemoryKeyChain {
    fn cipher_key(&self) -> Result<KeyMaterial, KeyError> {
        let mut guard = self
            .inner
            .lock()
            .map_err(|err| KeyError::Generation(format!("lock poisoned: {err}")))?;

        if let Some(existing) = guard.clone() {
            return Ok(existing);
        }

        let material = generate_key()?;
        *guard = Some(material.clone());
        Ok(material)
    }
}

fn generate_key() -> Result<KeyMaterial, KeyError> {
    let mut bytes = [0u8; KEY_SIZE_BYTES];
    OsRng
        .try_fill_bytes(&mut bytes)
        .map_err(|e| KeyError::Generation(e.to_string()))?;
    Ok(KeyMaterial { bytes })
}

fn encode_key(material: &KeyMaterial) -> String {
    general_purpose::STANDARD.encode(material.bytes)
}

fn decode_key(secret: &str) -> Result<KeyMaterial, KeyError> {
    let bytes = general_purpose::STANDARD
        .decode(secret)
        .map_err(|e| KeyError::Decode(e.to_string()))?;

    if bytes.len() != KEY_SIZE_BYTES {
        return Err(KeyError::Decode(format!(
            "expected {KEY_SIZE_BYTES} bytes, got {}",
            bytes.len()
        )));
    }

    let mut out = [0u8; KEY_SIZE_BYTES];
    out.copy_from_slice(&bytes);
    Ok(KeyMaterial { bytes: out })
}
