//! File-backed model storage.
//!
//! Layout under the storage root:
//!
//! ```text
//! <root>/chains/<escaped key>.model   learned per-participant and aggregate models
//! <root>/texts/<escaped key>.model    reference texts added by an operator
//! ```
//!
//! Missing or unreadable records load as an empty model. Writes replace the
//! record atomically, and read-modify-write cycles on the same key are
//! serialized through a per-key lock.

use std::fmt;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};

use rustc_hash::FxHashMap;
use tracing::{debug, warn};

use crate::error::{ModelError, StoreError};
use crate::model::TextModel;

/// Key of the aggregate model every ingested message is merged into.
pub const EVERYONE: &str = "everyone";

const RECORD_EXTENSION: &str = "model";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Namespace {
    /// Models learned from chat, keyed by participant id or [`EVERYONE`].
    Chains,
    /// Reference texts, keyed by their normalized name.
    Texts,
}

impl Namespace {
    pub const ALL: [Namespace; 2] = [Namespace::Chains, Namespace::Texts];

    pub fn dir_name(self) -> &'static str {
        match self {
            Namespace::Chains => "chains",
            Namespace::Texts => "texts",
        }
    }
}

impl fmt::Display for Namespace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.dir_name())
    }
}

pub struct ModelStore {
    root: PathBuf,
    state_size: usize,
    locks: Mutex<FxHashMap<(Namespace, String), Arc<Mutex<()>>>>,
}

impl ModelStore {
    /// Open (creating if needed) a store rooted at `root`. `state_size` is the
    /// order of the empty model handed out for absent keys.
    pub fn open(root: impl Into<PathBuf>, state_size: usize) -> Result<Self, StoreError> {
        let root = root.into();
        for ns in Namespace::ALL {
            let dir = root.join(ns.dir_name());
            fs::create_dir_all(&dir).map_err(|source| StoreError::CreateDir { path: dir, source })?;
        }
        Ok(Self {
            root,
            state_size,
            locks: Mutex::new(FxHashMap::default()),
        })
    }

    pub fn path_for(&self, key: &str, namespace: Namespace) -> PathBuf {
        self.root
            .join(namespace.dir_name())
            .join(format!("{}.{RECORD_EXTENSION}", escape_key(key)))
    }

    pub fn contains(&self, key: &str, namespace: Namespace) -> bool {
        self.path_for(key, namespace).is_file()
    }

    /// Load the model stored under `key`, or an empty model when the record
    /// is absent, unreadable or corrupt.
    pub fn load(&self, key: &str, namespace: Namespace) -> TextModel {
        let path = self.path_for(key, namespace);
        let bytes = match fs::read(&path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(key, %namespace, "no stored model, starting empty");
                return TextModel::empty(self.state_size);
            }
            Err(e) => {
                warn!(key, %namespace, path = %path.display(), "unreadable model record: {e}");
                return TextModel::empty(self.state_size);
            }
        };

        match TextModel::deserialize(&bytes) {
            Ok(model) => model,
            Err(e) => {
                warn!(key, %namespace, path = %path.display(), "ignoring model record: {e}");
                TextModel::empty(self.state_size)
            }
        }
    }

    /// Replace the record for `key`. The new bytes land in a temporary file in
    /// the same directory and are renamed over the old record.
    pub fn save(&self, key: &str, namespace: Namespace, model: &TextModel) -> Result<(), StoreError> {
        let path = self.path_for(key, namespace);
        let bytes = model.serialize()?;
        atomic_write(&path, &bytes)?;
        debug!(key, %namespace, bytes = bytes.len(), sentences = model.corpus_size(), "model saved");
        Ok(())
    }

    /// Load, transform and save `key` while holding its write lock, so that
    /// concurrent updates of the same key never lose each other's changes.
    pub fn update<F>(&self, key: &str, namespace: Namespace, f: F) -> Result<TextModel, StoreError>
    where
        F: FnOnce(TextModel) -> Result<TextModel, ModelError>,
    {
        let lock = self.key_lock(namespace, key);
        let _guard = lock.lock().unwrap_or_else(PoisonError::into_inner);

        let updated = f(self.load(key, namespace))?;
        self.save(key, namespace, &updated)?;
        Ok(updated)
    }

    /// Keys stored in `namespace`, sorted.
    pub fn keys(&self, namespace: Namespace) -> Result<Vec<String>, StoreError> {
        let dir = self.root.join(namespace.dir_name());
        let entries = fs::read_dir(&dir).map_err(|source| StoreError::List {
            path: dir.clone(),
            source,
        })?;

        let mut keys: Vec<String> = entries
            .filter_map(|entry| {
                let path = entry.ok()?.path();
                if path.extension().and_then(|s| s.to_str()) != Some(RECORD_EXTENSION) {
                    return None;
                }
                unescape_key(path.file_stem()?.to_str()?)
            })
            .collect();
        keys.sort();
        Ok(keys)
    }

    /// Lock entries are kept for the life of the store: one per participant
    /// and reference text seen, the same keys that already have a file on disk.
    fn key_lock(&self, namespace: Namespace, key: &str) -> Arc<Mutex<()>> {
        let mut locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
        Arc::clone(locks.entry((namespace, key.to_string())).or_default())
    }
}

fn atomic_write(path: &Path, data: &[u8]) -> Result<(), StoreError> {
    let write_error = |source| StoreError::Write {
        path: path.to_path_buf(),
        source,
    };
    let dir = path.parent().unwrap_or_else(|| Path::new("."));

    let mut temp = tempfile::NamedTempFile::new_in(dir).map_err(write_error)?;
    temp.write_all(data).map_err(write_error)?;
    temp.as_file().sync_all().map_err(write_error)?;
    temp.persist(path).map_err(|e| write_error(e.error))?;
    Ok(())
}

/// Filesystem-safe file stem for a key: bytes outside `[A-Za-z0-9_-]` become `%XX`.
pub fn escape_key(key: &str) -> String {
    let mut out = String::with_capacity(key.len());
    for byte in key.bytes() {
        if byte.is_ascii_alphanumeric() || byte == b'_' || byte == b'-' {
            out.push(byte as char);
        } else {
            out.push_str(&format!("%{byte:02X}"));
        }
    }
    out
}

pub fn unescape_key(stem: &str) -> Option<String> {
    let bytes = stem.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' {
            let hex = stem.get(i + 1..i + 3)?;
            out.push(u8::from_str_radix(hex, 16).ok()?);
            i += 3;
        } else {
            out.push(bytes[i]);
            i += 1;
        }
    }
    String::from_utf8(out).ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{BuildOptions, DEFAULT_STATE_SIZE};
    use tempfile::TempDir;

    fn store() -> (TempDir, ModelStore) {
        let dir = TempDir::new().unwrap();
        let store = ModelStore::open(dir.path(), DEFAULT_STATE_SIZE).unwrap();
        (dir, store)
    }

    #[test]
    fn open_creates_both_namespaces() {
        let (dir, _store) = store();
        assert!(dir.path().join("chains").is_dir());
        assert!(dir.path().join("texts").is_dir());
    }

    #[test]
    fn absent_key_loads_empty_model() {
        let (_dir, store) = store();
        let model = store.load("U404", Namespace::Chains);
        assert_eq!(model, TextModel::build("", &BuildOptions::default()));
        assert_eq!(model.generate_sentence(10), None);
    }

    #[test]
    fn save_then_load_round_trips() {
        let (_dir, store) = store();
        let model = TextModel::build("one two three\none two four", &BuildOptions::default());
        store.save("U1", Namespace::Chains, &model).unwrap();
        assert_eq!(store.load("U1", Namespace::Chains), model);
        assert!(store.contains("U1", Namespace::Chains));
    }

    #[test]
    fn namespaces_do_not_share_keys() {
        let (_dir, store) = store();
        let model = TextModel::from_sentence("call me ishmael", DEFAULT_STATE_SIZE);
        store.save("moby_dick", Namespace::Texts, &model).unwrap();
        assert!(store.load("moby_dick", Namespace::Chains).is_empty());
        assert!(!store.contains("moby_dick", Namespace::Chains));
    }

    #[test]
    fn corrupt_record_loads_empty_model() {
        let (_dir, store) = store();
        fs::write(store.path_for("U1", Namespace::Chains), b"garbage").unwrap();
        assert!(store.load("U1", Namespace::Chains).is_empty());
    }

    #[test]
    fn save_replaces_and_leaves_no_temp_files() {
        let (dir, store) = store();
        let first = TextModel::from_sentence("first", DEFAULT_STATE_SIZE);
        let second = TextModel::from_sentence("second", DEFAULT_STATE_SIZE);
        store.save("U1", Namespace::Chains, &first).unwrap();
        store.save("U1", Namespace::Chains, &second).unwrap();

        assert_eq!(store.load("U1", Namespace::Chains), second);
        let files = fs::read_dir(dir.path().join("chains")).unwrap().count();
        assert_eq!(files, 1);
    }

    #[test]
    fn keys_are_escaped_on_disk_and_listed_unescaped() {
        let (_dir, store) = store();
        let model = TextModel::from_sentence("x", DEFAULT_STATE_SIZE);
        for key in ["../etc/passwd", "U1", "everyone", "ünïcode key"] {
            store.save(key, Namespace::Chains, &model).unwrap();
        }

        let path = store.path_for("../etc/passwd", Namespace::Chains);
        assert_eq!(path.file_name().unwrap(), "%2E%2E%2Fetc%2Fpasswd.model");
        assert_eq!(
            store.keys(Namespace::Chains).unwrap(),
            vec!["../etc/passwd", "U1", "everyone", "ünïcode key"]
        );
        assert!(store.keys(Namespace::Texts).unwrap().is_empty());
    }

    #[test]
    fn escape_round_trips() {
        for key in ["", "plain", "with space", "%25", "<@U123>"] {
            assert_eq!(unescape_key(&escape_key(key)).as_deref(), Some(key));
        }
        assert_eq!(unescape_key("%G1"), None);
        assert_eq!(unescape_key("%4"), None);
    }

    #[test]
    fn concurrent_updates_of_one_key_are_serialized() {
        let (_dir, store) = store();
        let message = TextModel::from_sentence("hi there", DEFAULT_STATE_SIZE);

        std::thread::scope(|scope| {
            for _ in 0..8 {
                scope.spawn(|| {
                    for _ in 0..10 {
                        store
                            .update("U1", Namespace::Chains, |old| old.merge(&message))
                            .unwrap();
                    }
                });
            }
        });

        let model = store.load("U1", Namespace::Chains);
        assert_eq!(model.corpus_size(), 80);
        assert_eq!(model.count(&["hi", "there"], crate::text::END), 80);
    }

    #[test]
    fn lock_entries_track_distinct_keys() {
        let (_dir, store) = store();
        let message = TextModel::from_sentence("hi", DEFAULT_STATE_SIZE);
        for key in ["U1", "U2", "U1", EVERYONE, "U2"] {
            store.update(key, Namespace::Chains, |old| old.merge(&message)).unwrap();
        }
        store.update("U1", Namespace::Texts, |old| old.merge(&message)).unwrap();

        assert_eq!(store.locks.lock().unwrap().len(), 4);
        assert_eq!(store.keys(Namespace::Chains).unwrap().len(), 3);
    }

    #[test]
    fn failed_update_keeps_previous_record() {
        let (_dir, store) = store();
        let original = TextModel::from_sentence("keep me", DEFAULT_STATE_SIZE);
        store.save("U1", Namespace::Chains, &original).unwrap();

        let other_order = TextModel::from_sentence("keep me", 3);
        let result = store.update("U1", Namespace::Chains, |old| old.merge(&other_order));
        assert!(matches!(
            result,
            Err(StoreError::Model(ModelError::IncompatibleModel { .. }))
        ));
        assert_eq!(store.load("U1", Namespace::Chains), original);
    }
}
