use std::{collections::BTreeSet, sync::Arc};

use sealed_prefs_core::prefs::MapEditor;
use tracing::warn;

use crate::{
    cipher::{CryptoError, EntityCipher},
    codec::{seal_text, PrefValue},
    key_hasher::KeyHasher,
    runtime::CryptoRuntime,
    secure_prefs::report_failure,
};

/// Batched writes against a [`crate::SecurePreferences`] store.
///
/// Each put hashes the key and encrypts the value immediately, then stages the
/// result in the underlying map editor. Nothing is visible to readers until
/// [`Editor::commit`] or [`Editor::apply`], both of which consume the editor.
pub struct Editor {
    inner: Box<dyn MapEditor>,
    cipher: Arc<dyn EntityCipher>,
    hasher: KeyHasher,
    runtime: Arc<CryptoRuntime>,
    dropped: usize,
}

impl Editor {
    pub(crate) fn new(
        inner: Box<dyn MapEditor>,
        cipher: Arc<dyn EntityCipher>,
        hasher: KeyHasher,
        runtime: Arc<CryptoRuntime>,
    ) -> Self {
        Self {
            inner,
            cipher,
            hasher,
            runtime,
            dropped: 0,
        }
    }

    pub fn put_string(&mut self, key: &str, value: &str) -> &mut Self {
        self.put_text(key, value)
    }

    pub fn put_int(&mut self, key: &str, value: i32) -> &mut Self {
        self.put(key, &value)
    }

    pub fn put_long(&mut self, key: &str, value: i64) -> &mut Self {
        self.put(key, &value)
    }

    pub fn put_float(&mut self, key: &str, value: f32) -> &mut Self {
        self.put(key, &value)
    }

    pub fn put_boolean(&mut self, key: &str, value: bool) -> &mut Self {
        self.put(key, &value)
    }

    pub fn put<T: PrefValue>(&mut self, key: &str, value: &T) -> &mut Self {
        self.put_text(key, &value.encode())
    }

    /// Each member is encrypted on its own.
    pub fn put_string_set<I>(&mut self, key: &str, values: I) -> &mut Self
    where
        I: IntoIterator,
        I::Item: AsRef<str>,
    {
        let sealed: Result<BTreeSet<String>, CryptoError> = values
            .into_iter()
            .map(|value| seal_text(self.cipher.as_ref(), value.as_ref()))
            .collect();

        match sealed {
            Ok(members) => self.inner.put_string_set(&self.hasher.hash(key), members),
            Err(err) => self.drop_put(&err),
        }
        self
    }

    pub fn remove(&mut self, key: &str) -> &mut Self {
        self.inner.remove(&self.hasher.hash(key));
        self
    }

    /// Clears the whole store; runs before the other changes in this batch.
    pub fn clear(&mut self) -> &mut Self {
        self.inner.clear();
        self
    }

    /// Flush synchronously. Returns `false` if the map failed to persist or any
    /// put was dropped because its value could not be encrypted.
    pub fn commit(self) -> bool {
        let dropped = self.dropped;
        let flushed = self.inner.commit();
        if dropped > 0 {
            warn!(dropped, "commit skipped values that failed to encrypt");
        }
        flushed && dropped == 0
    }

    /// Flush asynchronously; readers of the same store see the changes at once.
    pub fn apply(self) {
        if self.dropped > 0 {
            warn!(dropped = self.dropped, "apply skipped values that failed to encrypt");
        }
        self.inner.apply();
    }

    fn put_text(&mut self, key: &str, plaintext: &str) -> &mut Self {
        match seal_text(self.cipher.as_ref(), plaintext) {
            Ok(sealed) => self.inner.put_string(&self.hasher.hash(key), sealed),
            Err(err) => self.drop_put(&err),
        }
        self
    }

    // Leaves any previous value for the key untouched.
    fn drop_put(&mut self, err: &CryptoError) {
        report_failure(&self.runtime, "encrypt", err);
        self.dropped += 1;
    }
}
