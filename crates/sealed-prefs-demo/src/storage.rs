use std::path::PathBuf;

use crate::config::{Config, KeyChainKind};
use color_eyre::Result;
use dirs::data_dir;
use sealed_prefs_storage::{key_provider::KeyringKeyChain, CryptoRuntime, SecurePreferences};
use tracing::debug;

const KEYRING_SERVICE: &str = "sealed-prefs";
const KEYRING_ACCOUNT: &str = "value-key";

/// Resolve the default data directory for the demo.
pub fn default_data_dir() -> Result<PathBuf> {
    let base = data_dir().ok_or_else(|| color_eyre::eyre::eyre!("no data dir available"))?;
    Ok(base.join("sealed-prefs"))
}

/// Open the store described by the config against the process-wide runtime.
pub fn store_from_config(config: &Config) -> Result<SecurePreferences> {
    let root = match &config.data_dir {
        Some(root) => root.clone(),
        None => default_data_dir()?,
    };
    debug!(?root, key_chain = ?config.key_chain, "opening secure preferences");

    let runtime = CryptoRuntime::global();
    let prefs = match config.key_chain {
        KeyChainKind::File => SecurePreferences::open(&root, &config.store, runtime)?,
        KeyChainKind::Keyring => SecurePreferences::open_with_key_chain(
            &root,
            &config.store,
            KeyringKeyChain::new(KEYRING_SERVICE, KEYRING_ACCOUNT),
            runtime,
        )?,
    };
    Ok(prefs)
}

/// Helper for tests to open a file-keyed store rooted at a temp dir with its own runtime.
#[cfg(test)]
pub fn test_store(root: impl Into<PathBuf>) -> SecurePreferences {
    let runtime = std::sync::Arc::new(CryptoRuntime::new());
    runtime.init().expect("init runtime");
    let root: PathBuf = root.into();
    SecurePreferences::open(root, &Default::default(), runtime).expect("open test store")
}
