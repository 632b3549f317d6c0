use std::{
    collections::{BTreeMap, BTreeSet},
    fmt,
    path::Path,
    sync::Arc,
};

use sealed_prefs_core::prefs::{ChangeListener, PreferenceMap, StorageError, StoredValue};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, error, warn};

use crate::{
    cipher::{CipherBinding, CryptoError, Entity, EntityCipher},
    codec::{open_text, FormatError, PrefValue},
    editor::Editor,
    file_prefs::FilePreferences,
    key_hasher::KeyHasher,
    key_provider::{KeyChain, PrefsBackedKeyChain, CRYPTO_STORE_NAME},
    runtime::CryptoRuntime,
};

/// Store opened when no filename is configured.
pub const DEFAULT_STORE_NAME: &str = "default_preferences";

#[derive(Debug, Error)]
pub enum PreferenceError {
    /// The stored value exists but is not of the requested type.
    #[error("value for `{key}` is not a valid {expected}: {reason}")]
    TypeMismatch {
        key: String,
        expected: &'static str,
        reason: String,
    },
    #[error("invalid preference filename: {0:?}")]
    InvalidFilename(String),
    #[error(transparent)]
    Storage(#[from] StorageError),
}

impl PreferenceError {
    fn type_mismatch(key: &str, err: FormatError) -> Self {
        PreferenceError::TypeMismatch {
            key: key.to_string(),
            expected: err.expected,
            reason: err.reason,
        }
    }
}

/// Options for opening a [`SecurePreferences`] store.
#[derive(Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PreferencesConfig {
    /// Becomes the cipher entity; empty or absent means the shared default namespace.
    pub password: Option<String>,
    /// File stem of the store; empty or absent means [`DEFAULT_STORE_NAME`].
    pub filename: Option<String>,
}

impl PreferencesConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn password(mut self, password: impl Into<String>) -> Self {
        self.password = Some(password.into());
        self
    }

    pub fn filename(mut self, filename: impl Into<String>) -> Self {
        self.filename = Some(filename.into());
        self
    }

    fn store_name(&self) -> Result<&str, PreferenceError> {
        match self.filename.as_deref() {
            None | Some("") => Ok(DEFAULT_STORE_NAME),
            Some(name) if is_plain_file_stem(name) => Ok(name),
            Some(name) => Err(PreferenceError::InvalidFilename(name.to_string())),
        }
    }
}

impl fmt::Debug for PreferencesConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PreferencesConfig")
            .field("password", &self.password.as_ref().map(|_| "<redacted>"))
            .field("filename", &self.filename)
            .finish()
    }
}

fn is_plain_file_stem(name: &str) -> bool {
    name != "."
        && name != ".."
        && !name.contains(['/', '\\', '\0'])
        && name != CRYPTO_STORE_NAME
}

/// Preference store that hashes every key and encrypts every value before it
/// reaches the underlying [`PreferenceMap`].
///
/// Reads return `Ok(Some(default))` when the key is absent, `Ok(None)` when the
/// stored value cannot be decrypted (backend not initialized, wrong entity,
/// corrupt data), and `Err(TypeMismatch)` when it decrypts to the wrong type.
pub struct SecurePreferences {
    map: Arc<dyn PreferenceMap>,
    cipher: Arc<dyn EntityCipher>,
    hasher: KeyHasher,
    runtime: Arc<CryptoRuntime>,
}

impl SecurePreferences {
    /// Open a store under `data_dir`, keeping the value key in a sibling key file.
    pub fn open(
        data_dir: impl AsRef<Path>,
        config: &PreferencesConfig,
        runtime: Arc<CryptoRuntime>,
    ) -> Result<Self, PreferenceError> {
        let key_store = FilePreferences::open(data_dir.as_ref(), CRYPTO_STORE_NAME)?;
        Self::open_with_key_chain(
            data_dir,
            config,
            PrefsBackedKeyChain::new(key_store),
            runtime,
        )
    }

    pub fn open_with_key_chain(
        data_dir: impl AsRef<Path>,
        config: &PreferencesConfig,
        key_chain: impl KeyChain + 'static,
        runtime: Arc<CryptoRuntime>,
    ) -> Result<Self, PreferenceError> {
        let name = config.store_name()?;
        let map = FilePreferences::open(data_dir.as_ref(), name)?;
        debug!(store = name, path = %map.path().display(), "opening secure preferences");

        let entity = Entity::from_password(config.password.as_deref());
        let cipher = CipherBinding::new(key_chain, entity, runtime.clone());
        Ok(Self::from_parts(Arc::new(map), Arc::new(cipher), runtime))
    }

    /// Assemble a store from an existing map and cipher.
    pub fn from_parts(
        map: Arc<dyn PreferenceMap>,
        cipher: Arc<dyn EntityCipher>,
        runtime: Arc<CryptoRuntime>,
    ) -> Self {
        if !runtime.is_ready() {
            warn!("cipher runtime not initialized; call sealed_prefs_storage::init() once at startup");
        }
        Self {
            map,
            cipher,
            hasher: KeyHasher::default(),
            runtime,
        }
    }

    pub fn with_key_hasher(mut self, hasher: KeyHasher) -> Self {
        self.hasher = hasher;
        self
    }

    /// Whether values can currently be encrypted and decrypted.
    pub fn is_available(&self) -> bool {
        self.cipher.available()
    }

    pub fn storage_key(&self, key: &str) -> String {
        self.hasher.hash(key)
    }

    pub fn get_string(&self, key: &str, default: &str) -> Result<Option<String>, PreferenceError> {
        self.get(key, default.to_string())
    }

    pub fn get_int(&self, key: &str, default: i32) -> Result<Option<i32>, PreferenceError> {
        self.get(key, default)
    }

    pub fn get_long(&self, key: &str, default: i64) -> Result<Option<i64>, PreferenceError> {
        self.get(key, default)
    }

    pub fn get_float(&self, key: &str, default: f32) -> Result<Option<f32>, PreferenceError> {
        self.get(key, default)
    }

    pub fn get_boolean(&self, key: &str, default: bool) -> Result<Option<bool>, PreferenceError> {
        self.get(key, default)
    }

    pub fn get<T: PrefValue>(&self, key: &str, default: T) -> Result<Option<T>, PreferenceError> {
        let Some(stored) = self.map.get(&self.storage_key(key)) else {
            return Ok(Some(default));
        };
        let Some(sealed) = stored.as_text() else {
            return Err(PreferenceError::TypeMismatch {
                key: key.to_string(),
                expected: T::KIND,
                reason: "stored value is a string set".to_string(),
            });
        };

        match open_text(self.cipher.as_ref(), sealed) {
            Ok(plaintext) => T::decode(&plaintext)
                .map(Some)
                .map_err(|err| PreferenceError::type_mismatch(key, err)),
            Err(err) => {
                report_failure(&self.runtime, "decrypt", &err);
                Ok(None)
            }
        }
    }

    pub fn get_string_set(
        &self,
        key: &str,
        default: BTreeSet<String>,
    ) -> Result<Option<BTreeSet<String>>, PreferenceError> {
        let Some(stored) = self.map.get(&self.storage_key(key)) else {
            return Ok(Some(default));
        };
        let Some(members) = stored.as_text_set() else {
            return Err(PreferenceError::TypeMismatch {
                key: key.to_string(),
                expected: "string set",
                reason: "stored value is a scalar".to_string(),
            });
        };

        match self.open_set(members) {
            Ok(set) => Ok(Some(set)),
            Err(err) => {
                report_failure(&self.runtime, "decrypt", &err);
                Ok(None)
            }
        }
    }

    /// Every entry keyed by storage key, decrypted where possible.
    ///
    /// An entry that fails to decrypt is returned in its stored form; the others are
    /// unaffected. Logical key names cannot be recovered from the result.
    pub fn get_all(&self) -> BTreeMap<String, StoredValue> {
        self.map
            .get_all()
            .into_iter()
            .map(|(storage_key, stored)| {
                let decrypted = match &stored {
                    StoredValue::Text(sealed) => {
                        open_text(self.cipher.as_ref(), sealed).map(StoredValue::Text)
                    }
                    StoredValue::TextSet(members) => {
                        self.open_set(members).map(StoredValue::TextSet)
                    }
                };
                let value = decrypted.unwrap_or_else(|err| {
                    report_failure(&self.runtime, "get_all", &err);
                    stored
                });
                (storage_key, value)
            })
            .collect()
    }

    /// Presence check on the hashed key; nothing is decrypted.
    pub fn contains(&self, key: &str) -> bool {
        self.map.contains(&self.storage_key(key))
    }

    pub fn edit(&self) -> Editor {
        Editor::new(
            self.map.edit(),
            self.cipher.clone(),
            self.hasher,
            self.runtime.clone(),
        )
    }

    /// Listeners see storage keys, not the logical names passed to the editor.
    pub fn register_on_change_listener(&self, listener: Arc<dyn ChangeListener>) {
        self.map.register_listener(listener);
    }

    pub fn unregister_on_change_listener(&self, listener: &Arc<dyn ChangeListener>) {
        self.map.unregister_listener(listener);
    }

    fn open_set(&self, members: &BTreeSet<String>) -> Result<BTreeSet<String>, CryptoError> {
        members
            .iter()
            .map(|member| open_text(self.cipher.as_ref(), member))
            .collect()
    }
}

/// Log a swallowed cipher failure when diagnostics are enabled.
pub(crate) fn report_failure(runtime: &CryptoRuntime, operation: &str, err: &CryptoError) {
    if !runtime.is_debug() {
        return;
    }
    match err {
        CryptoError::Unavailable => warn!(operation, "cipher not available"),
        other => error!(operation, "cipher operation failed: {other}"),
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use sealed_prefs_core::prefs::InMemoryPreferences;

    use super::*;
    use crate::key_provider::InMemoryKeyChain;

    fn ready_runtime() -> Arc<CryptoRuntime> {
        let runtime = Arc::new(CryptoRuntime::new());
        runtime.init().expect("init runtime");
        runtime
    }

    fn memory_store(map: &InMemoryPreferences, password: &str) -> SecurePreferences {
        let runtime = ready_runtime();
        let cipher = CipherBinding::new(
            InMemoryKeyChain::default(),
            Entity::from_password(Some(password)),
            runtime.clone(),
        );
        SecurePreferences::from_parts(Arc::new(map.clone()), Arc::new(cipher), runtime)
    }

    #[test]
    fn absent_key_returns_default() {
        let prefs = memory_store(&InMemoryPreferences::new(), "pw");
        assert_eq!(prefs.get_int("missing", 7).expect("read"), Some(7));
        assert_eq!(
            prefs.get_string("missing", "fallback").expect("read"),
            Some("fallback".to_string())
        );
        assert!(!prefs.contains("missing"));
    }

    #[test]
    fn stores_hashed_keys_and_encrypted_values() {
        let map = InMemoryPreferences::new();
        let prefs = memory_store(&map, "pw");
        let mut editor = prefs.edit();
        editor.put_string("username", "alice");
        assert!(editor.commit());

        let raw = map.get_all();
        let (storage_key, value) = raw.iter().next().expect("one entry");
        assert_eq!(storage_key, &KeyHasher::default().hash("username"));
        assert_ne!(value, &StoredValue::Text("alice".into()));
        assert!(prefs.contains("username"));
    }

    #[test]
    fn set_read_as_scalar_is_type_mismatch() {
        let prefs = memory_store(&InMemoryPreferences::new(), "pw");
        let mut editor = prefs.edit();
        editor.put_string_set("tags", ["a", "b"]);
        editor.commit();

        let err = prefs.get_string("tags", "").expect_err("mismatch");
        assert!(matches!(err, PreferenceError::TypeMismatch { expected: "string", .. }));
        let set = prefs
            .get_string_set("missing-is-fine", BTreeSet::new())
            .expect("default");
        assert_eq!(set, Some(BTreeSet::new()));
    }

    #[test]
    fn get_all_falls_back_to_stored_value_per_entry() {
        let map = InMemoryPreferences::new();
        let prefs = memory_store(&map, "pw");
        let mut editor = prefs.edit();
        editor.put_string("good", "value");
        editor.commit();

        let mut raw_editor = map.edit();
        raw_editor.put_string("corrupt", "bm90IGNpcGhlcnRleHQ=".into());
        raw_editor.commit();

        let all = prefs.get_all();
        assert_eq!(
            all.get(&prefs.storage_key("good")),
            Some(&StoredValue::Text("value".into()))
        );
        assert_eq!(
            all.get("corrupt"),
            Some(&StoredValue::Text("bm90IGNpcGhlcnRleHQ=".into()))
        );
    }

    #[test]
    fn listener_receives_storage_keys() {
        let prefs = memory_store(&InMemoryPreferences::new(), "pw");
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let listener: Arc<dyn ChangeListener> = Arc::new(move |key: Option<&str>| {
            sink.lock().expect("lock").push(key.map(str::to_string));
        });
        prefs.register_on_change_listener(listener.clone());

        let mut editor = prefs.edit();
        editor.put_boolean("flag", true);
        editor.commit();
        prefs.unregister_on_change_listener(&listener);
        let mut editor = prefs.edit();
        editor.remove("flag");
        editor.commit();

        assert_eq!(
            *seen.lock().expect("lock"),
            vec![Some(prefs.storage_key("flag"))]
        );
    }

    #[test]
    fn unhashed_fallback_uses_logical_keys() {
        let map = InMemoryPreferences::new();
        let prefs = memory_store(&map, "pw").with_key_hasher(KeyHasher::with_algorithm("none"));
        let mut editor = prefs.edit();
        editor.put_long("plain", 5);
        editor.commit();

        assert!(map.contains("plain"));
        assert_eq!(prefs.get_long("plain", 0).expect("read"), Some(5));
    }

    #[test]
    fn config_validates_filename() {
        assert_eq!(
            PreferencesConfig::new().store_name().expect("default"),
            DEFAULT_STORE_NAME
        );
        assert_eq!(
            PreferencesConfig::new()
                .filename("settings")
                .store_name()
                .expect("plain"),
            "settings"
        );
        for bad in ["../escape", "a/b", "..", CRYPTO_STORE_NAME] {
            assert!(matches!(
                PreferencesConfig::new().filename(bad).store_name(),
                Err(PreferenceError::InvalidFilename(_))
            ));
        }
    }

    #[test]
    fn config_debug_hides_password() {
        let config = PreferencesConfig::new().password("hunter2");
        assert!(!format!("{config:?}").contains("hunter2"));
    }
}
