//! Encrypted preferences: hashed keys and AES-GCM sealed values over a plain
//! preference map, with keys sourced from the OS keyring, a key file, or memory.

pub mod cipher;
pub mod codec;
pub mod editor;
pub mod file_prefs;
pub mod key_hasher;
pub mod key_provider;
pub mod runtime;
pub mod secure_prefs;

pub use cipher::{CipherBinding, CryptoError, Entity, EntityCipher};
pub use editor::Editor;
pub use runtime::CryptoRuntime;
pub use secure_prefs::{PreferenceError, PreferencesConfig, SecurePreferences};

/// Initialize the process-wide cipher runtime. Call once at startup, before opening stores.
pub fn init() -> Result<(), CryptoError> {
    CryptoRuntime::global().init()
}

pub fn is_debug() -> bool {
    CryptoRuntime::global().is_debug()
}

/// Enable diagnostics for cipher failures that reads and writes otherwise swallow.
pub fn set_debug(debug: bool) {
    CryptoRuntime::global().set_debug(debug);
}
