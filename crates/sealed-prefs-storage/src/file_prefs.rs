use std::{
    collections::{BTreeMap, BTreeSet, HashMap},
    fs,
    io::Write,
    path::{self, Path, PathBuf},
    sync::{Arc, Mutex, MutexGuard, OnceLock, PoisonError, Weak},
    thread,
};

use sealed_prefs_core::prefs::{
    notify_listeners, same_listener, ChangeListener, MapEditor, PendingEdits, PreferenceMap,
    StorageError, StoredValue,
};
use tempfile::NamedTempFile;
use tracing::{debug, error, instrument};

pub const FILE_EXTENSION: &str = "json";

// Files currently open in this process, keyed by absolute path.
static OPEN_FILES: OnceLock<Mutex<HashMap<PathBuf, Weak<Shared>>>> = OnceLock::new();

fn open_files() -> MutexGuard<'static, HashMap<PathBuf, Weak<Shared>>> {
    OPEN_FILES
        .get_or_init(Default::default)
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
}

/// JSON-file-backed preference map with an in-memory cache.
///
/// Every `open` of the same file within a process returns a handle to the same
/// cache. Reads hit the cache. `commit` writes the file before returning; `apply`
/// updates the cache immediately and hands the write to a single background
/// writer per file. Dropping the last handle flushes whatever is still pending.
/// Each flush carries a generation number so an older snapshot never replaces a
/// newer one on disk.
#[derive(Clone)]
pub struct FilePreferences {
    inner: Arc<Shared>,
}

struct Shared {
    store: Arc<Store>,
    listeners: Mutex<Vec<Arc<dyn ChangeListener>>>,
}

/// The part of an open file the background writer holds on to.
struct Store {
    path: PathBuf,
    state: Mutex<State>,
    // generation of the snapshot currently on disk
    written: Mutex<u64>,
    writer_running: Mutex<bool>,
}

struct State {
    values: BTreeMap<String, StoredValue>,
    generation: u64,
}

struct Snapshot {
    generation: u64,
    values: BTreeMap<String, StoredValue>,
}

impl FilePreferences {
    /// Open `<dir>/<name>.json`, creating nothing until the first write.
    #[instrument(skip_all, fields(name = %name))]
    pub fn open(dir: impl AsRef<Path>, name: &str) -> Result<Self, StorageError> {
        let path = path::absolute(dir.as_ref())
            .map_err(storage_err)?
            .join(format!("{name}.{FILE_EXTENSION}"));

        let mut open = open_files();
        if let Some(inner) = open.get(&path).and_then(Weak::upgrade) {
            debug!("sharing already open preference file");
            return Ok(Self { inner });
        }

        let values = read_document(&path)?;
        debug!(entries = values.len(), "loaded preference file");

        let inner = Arc::new(Shared {
            store: Arc::new(Store {
                path: path.clone(),
                state: Mutex::new(State {
                    values,
                    generation: 0,
                }),
                written: Mutex::new(0),
                writer_running: Mutex::new(false),
            }),
            listeners: Mutex::new(Vec::new()),
        });
        open.retain(|_, shared| shared.strong_count() > 0);
        open.insert(path, Arc::downgrade(&inner));
        Ok(Self { inner })
    }

    pub fn path(&self) -> &Path {
        &self.inner.store.path
    }

    /// Block until everything applied so far is on disk.
    pub fn sync(&self) -> Result<(), StorageError> {
        self.inner.store.flush()
    }

    fn store(&self) -> &Arc<Store> {
        &self.inner.store
    }

    fn listeners(&self) -> Vec<Arc<dyn ChangeListener>> {
        self.inner
            .listeners
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Apply edits to the cache and notify listeners. Returns the snapshot to write,
    /// or `None` when nothing changed.
    fn stage(&self, pending: PendingEdits) -> Option<Snapshot> {
        let (notifications, snapshot) = {
            let mut state = self.store().state();
            let notifications = pending.apply_to(&mut state.values);
            if notifications.is_empty() {
                return None;
            }
            state.generation += 1;
            let snapshot = Snapshot {
                generation: state.generation,
                values: state.values.clone(),
            };
            (notifications, snapshot)
        };

        notify_listeners(&self.listeners(), &notifications);
        Some(snapshot)
    }

    /// Make sure a writer will pick up the latest generation.
    fn schedule_write(&self) {
        let store = self.store();
        let mut running = store.writer_running();
        if *running {
            return;
        }

        let writer = Arc::clone(store);
        let spawned = thread::Builder::new()
            .name("prefs-writer".to_string())
            .spawn(move || writer.write_behind());
        match spawned {
            Ok(_) => *running = true,
            Err(err) => {
                drop(running);
                debug!("no writer thread ({err}), writing inline");
                if let Err(err) = store.flush() {
                    error!(path = %store.path.display(), "apply failed: {err}");
                }
            }
        }
    }
}

impl Store {
    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn written(&self) -> MutexGuard<'_, u64> {
        self.written.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn writer_running(&self) -> MutexGuard<'_, bool> {
        self.writer_running
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn snapshot(&self) -> Snapshot {
        let state = self.state();
        Snapshot {
            generation: state.generation,
            values: state.values.clone(),
        }
    }

    fn is_flushed(&self) -> bool {
        let generation = self.state().generation;
        *self.written() >= generation
    }

    fn flush(&self) -> Result<(), StorageError> {
        self.persist(self.snapshot())
    }

    fn persist(&self, snapshot: Snapshot) -> Result<(), StorageError> {
        let mut written = self.written();
        if *written >= snapshot.generation {
            return Ok(());
        }
        write_document(&self.path, &snapshot.values)?;
        *written = snapshot.generation;
        Ok(())
    }

    /// Body of the background writer: keep writing the newest snapshot until
    /// nothing newer has been applied.
    fn write_behind(&self) {
        loop {
            let result = self.flush();
            // Staging bumps the generation before looking at this flag, so a
            // write applied after the check below always finds it cleared.
            let mut running = self.writer_running();
            if let Err(err) = result {
                error!(path = %self.path.display(), "apply failed: {err}");
                *running = false;
                return;
            }
            if self.is_flushed() {
                *running = false;
                return;
            }
        }
    }
}

impl Drop for Shared {
    fn drop(&mut self) {
        // Held so a concurrent open reads the file only after this flush.
        let _open = open_files();
        if let Err(err) = self.store.flush() {
            error!(path = %self.store.path.display(), "flush on close failed: {err}");
        }
    }
}

impl PreferenceMap for FilePreferences {
    fn get(&self, key: &str) -> Option<StoredValue> {
        self.store().state().values.get(key).cloned()
    }

    fn get_all(&self) -> BTreeMap<String, StoredValue> {
        self.store().state().values.clone()
    }

    fn contains(&self, key: &str) -> bool {
        self.store().state().values.contains_key(key)
    }

    fn edit(&self) -> Box<dyn MapEditor> {
        Box::new(FileEditor {
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

/// Staged changes against a [`FilePreferences`].
pub struct FileEditor {
    target: FilePreferences,
    pending: PendingEdits,
}

impl MapEditor for FileEditor {
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

    #[instrument(skip_all)]
    fn commit(self: Box<Self>) -> bool {
        let FileEditor { target, pending } = *self;
        let Some(snapshot) = target.stage(pending) else {
            return true;
        };
        match target.store().persist(snapshot) {
            Ok(()) => true,
            Err(err) => {
                error!(path = %target.path().display(), "commit failed: {err}");
                false
            }
        }
    }

    #[instrument(skip_all)]
    fn apply(self: Box<Self>) {
        let FileEditor { target, pending } = *self;
        if target.stage(pending).is_some() {
            target.schedule_write();
        }
    }
}

fn read_document(path: &Path) -> Result<BTreeMap<String, StoredValue>, StorageError> {
    let contents = match fs::read_to_string(path) {
        Ok(contents) => contents,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(BTreeMap::new()),
        Err(err) => return Err(storage_err(err)),
    };
    if contents.trim().is_empty() {
        return Ok(BTreeMap::new());
    }
    serde_json::from_str(&contents).map_err(|e| StorageError::Corrupt {
        reason: e.to_string(),
    })
}

fn write_document(
    path: &Path,
    values: &BTreeMap<String, StoredValue>,
) -> Result<(), StorageError> {
    let parent = path.parent().ok_or_else(|| StorageError::Io {
        reason: "invalid storage path".to_string(),
    })?;
    fs::create_dir_all(parent).map_err(storage_err)?;

    let mut tmp = NamedTempFile::new_in(parent).map_err(storage_err)?;
    let json = serde_json::to_vec_pretty(values).map_err(storage_err)?;
    tmp.write_all(&json).map_err(storage_err)?;
    tmp.flush().map_err(storage_err)?;
    tmp.persist(path).map_err(|e| storage_err(e.error))?;
    Ok(())
}

fn storage_err<E: ToString>(err: E) -> StorageError {
    StorageError::Io {
        reason: err.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    #[test]
    fn commit_persists_across_reopen() {
        let dir = tempfile::tempdir().expect("tempdir");
        let prefs = FilePreferences::open(dir.path(), "settings").expect("open");

        let mut editor = prefs.edit();
        editor.put_string("k", "v".into());
        editor.put_string_set("s", BTreeSet::from(["a".to_string(), "b".to_string()]));
        assert!(editor.commit());
        let on_disk = fs::read_to_string(prefs.path()).expect("written by commit");
        assert!(on_disk.contains("\"k\""));
        drop(prefs);

        let reopened = FilePreferences::open(dir.path(), "settings").expect("reopen");
        assert_eq!(reopened.get("k"), Some(StoredValue::Text("v".into())));
        assert_eq!(reopened.get_all().len(), 2);
    }

    #[test]
    fn apply_is_visible_immediately_and_reaches_disk() {
        let dir = tempfile::tempdir().expect("tempdir");
        let prefs = FilePreferences::open(dir.path(), "settings").expect("open");

        let mut editor = prefs.edit();
        editor.put_string("k", "v".into());
        editor.apply();
        assert!(prefs.contains("k"));

        prefs.sync().expect("sync");
        assert!(fs::read_to_string(prefs.path())
            .expect("written by sync")
            .contains("\"k\""));
    }

    #[test]
    fn pending_apply_is_flushed_when_last_handle_drops() {
        let dir = tempfile::tempdir().expect("tempdir");
        let prefs = FilePreferences::open(dir.path(), "settings").expect("open");
        let path = prefs.path().to_path_buf();

        let mut editor = prefs.edit();
        editor.put_string("k", "v".into());
        editor.apply();
        drop(prefs);

        assert!(read_document(&path).expect("read").contains_key("k"));
        let reopened = FilePreferences::open(dir.path(), "settings").expect("reopen");
        assert_eq!(reopened.get("k"), Some(StoredValue::Text("v".into())));
    }

    #[test]
    fn burst_of_applies_lands_in_order() {
        let dir = tempfile::tempdir().expect("tempdir");
        let prefs = FilePreferences::open(dir.path(), "settings").expect("open");

        for i in 0..200 {
            let mut editor = prefs.edit();
            editor.put_string(&format!("k{i}"), i.to_string());
            editor.put_string("last", i.to_string());
            editor.apply();
        }
        prefs.sync().expect("sync");

        let on_disk = read_document(prefs.path()).expect("read");
        assert_eq!(on_disk.len(), 201);
        assert_eq!(on_disk.get("last"), Some(&StoredValue::Text("199".into())));
    }

    #[test]
    fn handles_on_one_file_share_a_cache() {
        let dir = tempfile::tempdir().expect("tempdir");
        let first = FilePreferences::open(dir.path(), "shared").expect("open first");
        let second = FilePreferences::open(dir.path(), "shared").expect("open second");

        let mut editor = first.edit();
        editor.put_string("x", "1".into());
        assert!(editor.commit());
        let mut editor = second.edit();
        editor.put_string("y", "2".into());
        assert!(editor.commit());

        assert!(second.contains("x"));
        drop(first);
        drop(second);

        let reopened = FilePreferences::open(dir.path(), "shared").expect("reopen");
        assert!(reopened.contains("x"));
        assert!(reopened.contains("y"));
    }

    #[test]
    fn listeners_are_shared_between_handles() {
        let dir = tempfile::tempdir().expect("tempdir");
        let first = FilePreferences::open(dir.path(), "shared").expect("open first");
        let second = FilePreferences::open(dir.path(), "shared").expect("open second");
        let seen = Arc::new(AtomicUsize::new(0));
        let counter = seen.clone();
        first.register_listener(Arc::new(move |_: Option<&str>| {
            counter.fetch_add(1, Ordering::SeqCst);
        }));

        let mut editor = second.edit();
        editor.put_string("k", "v".into());
        assert!(editor.commit());
        assert_eq!(seen.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn missing_or_empty_file_is_empty_map() {
        let dir = tempfile::tempdir().expect("tempdir");
        fs::write(dir.path().join("blank.json"), "  \n").expect("write");

        assert!(FilePreferences::open(dir.path(), "blank")
            .expect("open blank")
            .get_all()
            .is_empty());
        assert!(FilePreferences::open(dir.path(), "absent")
            .expect("open absent")
            .get_all()
            .is_empty());
    }

    #[test]
    fn corrupt_file_is_reported() {
        let dir = tempfile::tempdir().expect("tempdir");
        fs::write(dir.path().join("bad.json"), "{not json").expect("write");

        let err = FilePreferences::open(dir.path(), "bad")
            .err()
            .expect("corrupt file");
        assert!(matches!(err, StorageError::Corrupt { .. }));
    }

    #[test]
    fn clear_removes_file_contents_and_notifies() {
        let dir = tempfile::tempdir().expect("tempdir");
        let prefs = FilePreferences::open(dir.path(), "settings").expect("open");
        let cleared = Arc::new(AtomicUsize::new(0));
        let counter = cleared.clone();
        prefs.register_listener(Arc::new(move |key: Option<&str>| {
            if key.is_none() {
                counter.fetch_add(1, Ordering::SeqCst);
            }
        }));

        let mut editor = prefs.edit();
        editor.put_string("k", "v".into());
        editor.commit();
        let mut editor = prefs.edit();
        editor.clear();
        assert!(editor.commit());

        assert_eq!(cleared.load(Ordering::SeqCst), 1);
        assert!(read_document(prefs.path()).expect("read").is_empty());
    }

    #[test]
    fn empty_commit_does_not_create_file() {
        let dir = tempfile::tempdir().expect("tempdir");
        let prefs = FilePreferences::open(dir.path(), "settings").expect("open");
        assert!(prefs.edit().commit());
        let path = prefs.path().to_path_buf();
        drop(prefs);
        assert!(!path.exists());
    }
}
