use std::{
    collections::{BTreeMap, BTreeSet},
    sync::Arc,
};

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors produced by durable preference map implementations.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum StorageError {
    /// Backing file could not be read or written.
    #[error("storage io failure: {reason}")]
    Io { reason: String },
    /// Backing file exists but does not hold a valid preference document.
    #[error("corrupt preference file: {reason}")]
    Corrupt { reason: String },
}

/// A single value as held by the underlying map.
///
/// Scalars of every type are stored as text; string sets keep one text per member.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum StoredValue {
    Text(String),
    TextSet(BTreeSet<String>),
}

impl StoredValue {
    pub fn as_text(&self) -> Option<&str> {
        match self {
            StoredValue::Text(text) => Some(text),
            StoredValue::TextSet(_) => None,
        }
    }

    pub fn as_text_set(&self) -> Option<&BTreeSet<String>> {
        match self {
            StoredValue::Text(_) => None,
            StoredValue::TextSet(set) => Some(set),
        }
    }
}

/// Receives the storage key of every entry changed by a commit or apply.
///
/// `None` signals that the map was cleared.
pub trait ChangeListener: Send + Sync {
    fn on_preference_changed(&self, key: Option<&str>);
}

impl<F> ChangeListener for F
where
    F: Fn(Option<&str>) + Send + Sync,
{
    fn on_preference_changed(&self, key: Option<&str>) {
        self(key)
    }
}

/// Identity comparison for registered listeners (data pointer only).
pub fn same_listener(a: &Arc<dyn ChangeListener>, b: &Arc<dyn ChangeListener>) -> bool {
    std::ptr::eq(
        Arc::as_ptr(a) as *const (),
        Arc::as_ptr(b) as *const (),
    )
}

/// Persistent string-keyed map the secure layer is built on.
///
/// Reads are served from memory and never fail; writes go through a [`MapEditor`].
pub trait PreferenceMap: Send + Sync {
    fn get(&self, key: &str) -> Option<StoredValue>;

    fn get_all(&self) -> BTreeMap<String, StoredValue>;

    fn contains(&self, key: &str) -> bool;

    /// Start a new batch of changes. Nothing is visible until commit or apply.
    fn edit(&self) -> Box<dyn MapEditor>;

    fn register_listener(&self, listener: Arc<dyn ChangeListener>);

    fn unregister_listener(&self, listener: &Arc<dyn ChangeListener>);
}

/// Batched, transactional writer over a [`PreferenceMap`].
///
/// `commit` and `apply` consume the editor.
pub trait MapEditor: Send {
    fn put_string(&mut self, key: &str, value: String);

    fn put_string_set(&mut self, key: &str, values: BTreeSet<String>);

    fn remove(&mut self, key: &str);

    fn clear(&mut self);

    /// Flush synchronously. Returns `false` if the changes could not be persisted.
    fn commit(self: Box<Self>) -> bool;

    /// Flush asynchronously; changes are visible in memory on return.
    fn apply(self: Box<Self>);
}

/// Changes staged by an editor before they are applied to a map.
///
/// A clear always runs before the individual puts and removes of the same batch.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct PendingEdits {
    clear: bool,
    changes: BTreeMap<String, Option<StoredValue>>,
}

impl PendingEdits {
    pub fn put(&mut self, key: &str, value: StoredValue) {
        self.changes.insert(key.to_string(), Some(value));
    }

    pub fn remove(&mut self, key: &str) {
        self.changes.insert(key.to_string(), None);
    }

    pub fn clear(&mut self) {
        self.clear = true;
    }

    pub fn is_empty(&self) -> bool {
        !self.clear && self.changes.is_empty()
    }

    /// Apply the staged changes to `values`, returning the notifications to deliver
    /// (`None` for the clear, then each storage key whose value actually changed).
    pub fn apply_to(self, values: &mut BTreeMap<String, StoredValue>) -> Vec<Option<String>> {
        let mut notifications = Vec::new();
        if self.clear {
            values.clear();
            notifications.push(None);
        }

        for (key, change) in self.changes {
            let changed = match change {
                Some(value) => {
                    if values.get(&key) == Some(&value) {
                        false
                    } else {
                        values.insert(key.clone(), value);
                        true
                    }
                }
                None => values.remove(&key).is_some(),
            };
            if changed {
                notifications.push(Some(key));
            }
        }
        notifications
    }
}

/// Deliver change notifications to a snapshot of listeners.
pub fn notify_listeners(listeners: &[Arc<dyn ChangeListener>], notifications: &[Option<String>]) {
    for key in notifications {
        for listener in listeners {
            listener.on_preference_changed(key.as_deref());
        }
    }
}
