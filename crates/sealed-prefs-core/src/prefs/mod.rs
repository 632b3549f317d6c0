//! Contracts of the durable key-value map that encrypted preferences are layered on.

mod map;
mod memory;

pub use map::{
    notify_listeners, same_listener, ChangeListener, MapEditor, PendingEdits, PreferenceMap,
    StorageError, StoredValue,
};
pub use memory::InMemoryPreferences;
