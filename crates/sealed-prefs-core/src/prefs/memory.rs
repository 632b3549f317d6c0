use std::{
    collections::{BTreeMap, BTreeSet},
    sync::{Arc, Mutex, PoisonError},
};

use super::map::{
    notify_listeners, same_listener, ChangeListener, MapEditor, PendingEdits, PreferenceMap,
    StoredValue,
};

/// In-memory preference map for tests and ephemeral sessions.
/// Nothing is persisted; `commit` and `apply` both take effect immediately.
#[derive(Default, Clone)]
pub struct InMemoryPreferences {
    inner: Arc<Shared>,
}

#[derive(Default)]
struct Shared {
    values: Mutex<BTreeMap<String, StoredValue>>,
    listeners: Mutex<Vec<Arc<dyn ChangeListener>>>,
}

impl InMemoryPreferences {
    pub fn new() -> Self {
        Self::default()
    }

    fn values(&self) -> std::sync::MutexGuard<'_, BTreeMap<String, StoredValue>> {
        self.inner
            .values
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

impl PreferenceMap for InMemoryPreferences {
    fn get(&self, key: &str) -> Option<StoredValue> {
        self.values().get(key).cloned()
    }

    fn get_all(&self) -> BTreeMap<String, StoredValue> {
        self.values().clone()
    }

    fn contains(&self, key: &str) -> bool {
        self.values().contains_key(key)
    }

    fn edit(&self) -> Box<dyn MapEditor> {
        Box::new(InMemoryEditor {
            target: self.clone(),
            pending: PendingEdits::default(),
        })
    }

    fn register_listener(&self, listener: Arc<dyn ChangeListener>) {
        let mut listeners = self
            .inner
            .listeners
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if !listeners.iter().any(|l| same_listener(l, &listener)) {
            listeners.push(listener);
        }
    }

    fn unregister_listener(&self, listener: &Arc<dyn ChangeListener>) {
        self.inner
            .listeners
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .retain(|l| !same_listener(l, listener));
    }
}

struct InMemoryEditor {
    target: InMemoryPreferences,
    pending: PendingEdits,
}

impl InMemoryEditor {
    fn flush(self) {
        let notifications = {
            let mut values = self.target.values();
            self.pending.apply_to(&mut values)
        };
        let listeners = self
            .target
            .inner
            .listeners
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        notify_listeners(&listeners, &notifications);
    }
}

impl MapEditor for InMemoryEditor {
    fn put_string(&mut self, key: &str, value: String) {
        self.pending.put(key, StoredValue::Text(value));
    }

    fn put_string_set(&mut self, key: &str, values: BTreeSet<String>) {
        self.pending.put(key, StoredValue::TextSet(values));
    }

    fn remove(&mut self, key: &str) {
        self.pending.remove(key);
    }

    fn clear(&mut self) {
        self.pending.clear();
    }

    fn commit(self: Box<Self>) -> bool {
        self.flush();
        true
    }

    fn apply(self: Box<Self>) {
        self.flush();
    }
}
