use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc, OnceLock,
};

use aes_gcm::{
    aead::{Aead, AeadCore, KeyInit},
    Aes256Gcm,
};
use rand::{rngs::OsRng, RngCore};
use tracing::debug;

use crate::{cipher::CryptoError, key_provider::KEY_SIZE_BYTES};

const PROBE: &[u8] = b"sealed-prefs-probe";

static GLOBAL: OnceLock<Arc<CryptoRuntime>> = OnceLock::new();

/// Readiness of the cipher backend plus the diagnostics switch.
///
/// Stores hold an `Arc` to the runtime they were opened with. A process normally
/// shares [`CryptoRuntime::global`], initialized once at startup; tests build their own.
#[derive(Debug, Default)]
pub struct CryptoRuntime {
    ready: AtomicBool,
    debug: AtomicBool,
}

impl CryptoRuntime {
    pub fn new() -> Self {
        Self::default()
    }

    /// The process-wide runtime behind [`crate::init`] and [`crate::set_debug`].
    pub fn global() -> Arc<CryptoRuntime> {
        GLOBAL
            .get_or_init(|| Arc::new(CryptoRuntime::new()))
            .clone()
    }

    /// Probe the random source and AES-GCM once and mark the backend ready.
    /// Calling it again after success is a no-op.
    pub fn init(&self) -> Result<(), CryptoError> {
        if self.is_ready() {
            return Ok(());
        }
        probe_backend()?;
        self.ready.store(true, Ordering::Release);
        debug!("cipher backend initialized");
        Ok(())
    }

    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::Acquire)
    }

    pub fn is_debug(&self) -> bool {
        self.debug.load(Ordering::Relaxed)
    }

    pub fn set_debug(&self, debug: bool) {
        self.debug.store(debug, Ordering::Relaxed);
    }
}

fn probe_backend() -> Result<(), CryptoError> {
    let mut key = [0u8; KEY_SIZE_BYTES];
    OsRng
        .try_fill_bytes(&mut key)
        .map_err(|e| CryptoError::Backend(format!("random source: {e}")))?;

    let cipher = Aes256Gcm::new_from_slice(&key)
        .map_err(|e| CryptoError::Backend(format!("cipher init: {e}")))?;
    let nonce = Aes256Gcm::generate_nonce(&mut OsRng);
    let sealed = cipher
        .encrypt(&nonce, PROBE)
        .map_err(|e| CryptoError::Backend(format!("probe encrypt: {e}")))?;
    let opened = cipher
        .decrypt(&nonce, sealed.as_ref())
        .map_err(|e| CryptoError::Backend(format!("probe decrypt: {e}")))?;

    if opened != PROBE {
        return Err(CryptoError::Backend("probe round trip mismatch".to_string()));
    }
    Ok(())
}
