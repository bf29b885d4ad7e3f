use std::collections::HashMap;
use std::fs;
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use tempfile::NamedTempFile;

use crate::error::PersistenceError;

#[cfg(test)]
use std::sync::OnceLock;

#[cfg(test)]
pub fn test_env_lock() -> &'static Mutex<()> {
    static LOCK: OnceLock<Mutex<()>> = OnceLock::new();
    LOCK.get_or_init(|| Mutex::new(()))
}

/// Text-valued key/value medium the record stores persist into.
pub trait KeyValueStore: Send + Sync {
    /// `Ok(None)` when the key has never been written.
    fn read(&self, key: &str) -> Result<Option<String>, PersistenceError>;

    /// Replaces the whole value. Must not leave a half-written value behind.
    fn write(&self, key: &str, value: &str) -> Result<(), PersistenceError>;
}

/// One JSON file per key inside a directory.
#[derive(Debug, Clone)]
pub struct FileStore {
    root: PathBuf,
}

impl FileStore {
    pub fn open(root: impl AsRef<Path>) -> Result<Self, PersistenceError> {
        let root = root.as_ref().to_path_buf();
        fs::create_dir_all(&root).map_err(|source| PersistenceError::Io {
            key: root.display().to_string(),
            source,
        })?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path_for(&self, key: &str) -> PathBuf {
        let file_name: String = key
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '.' || c == '_' || c == '-' { c } else { '_' })
            .collect();
        self.root.join(format!("{file_name}.json"))
    }
}

impl KeyValueStore for FileStore {
    fn read(&self, key: &str) -> Result<Option<String>, PersistenceError> {
        match fs::read_to_string(self.path_for(key)) {
            Ok(text) => Ok(Some(text)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(source) => Err(PersistenceError::Io {
                key: key.to_string(),
                source,
            }),
        }
    }

    fn write(&self, key: &str, value: &str) -> Result<(), PersistenceError> {
        let io_err = |source| PersistenceError::Io {
            key: key.to_string(),
            source,
        };
        // Write beside the target and rename over it.
        let mut tmp = NamedTempFile::new_in(&self.root).map_err(io_err)?;
        tmp.write_all(value.as_bytes()).map_err(io_err)?;
        tmp.as_file().sync_all().map_err(io_err)?;
        tmp.persist(self.path_for(key))
            .map_err(|e| io_err(e.error))?;
        Ok(())
    }
}

#[derive(Debug, Default)]
pub struct MemoryStore {
    values: Mutex<HashMap<String, String>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl KeyValueStore for MemoryStore {
    fn read(&self, key: &str) -> Result<Option<String>, PersistenceError> {
        let values = self.values.lock().map_err(|_| PersistenceError::Rejected {
            key: key.to_string(),
            reason: "memory store poisoned".into(),
        })?;
        Ok(values.get(key).cloned())
    }

    fn write(&self, key: &str, value: &str) -> Result<(), PersistenceError> {
        let mut values = self.values.lock().map_err(|_| PersistenceError::Rejected {
            key: key.to_string(),
            reason: "memory store poisoned".into(),
        })?;
        values.insert(key.to_string(), value.to_string());
        Ok(())
    }
}

pub fn parse_file_uri_path(uri: &str) -> Option<PathBuf> {
    if let Some(rest) = uri.strip_prefix("file://") {
        return Some(PathBuf::from(rest));
    }
    if uri.starts_with('/') {
        return Some(PathBuf::from(uri));
    }
    None
}

fn first_existing_dir(candidates: Vec<PathBuf>) -> Option<PathBuf> {
    candidates
        .into_iter()
        .find(|dir| fs::metadata(dir).map(|meta| meta.is_dir()).unwrap_or(false))
}

/// Directory the record stores live in when none is configured.
pub fn preferred_data_dir() -> PathBuf {
    let mut candidates: Vec<PathBuf> = Vec::new();
    if let Ok(custom) = std::env::var("FIELDSIGN_DATA_DIR") {
        candidates.push(PathBuf::from(custom));
    }
    candidates.push(PathBuf::from("/data/user/0/app.fieldsign/files"));
    candidates.push(PathBuf::from("/data/data/app.fieldsign/files"));
    first_existing_dir(candidates)
        .unwrap_or_else(std::env::temp_dir)
        .join("fieldsign")
}

pub fn downloads_dir() -> Option<PathBuf> {
    let mut candidates = Vec::new();
    if let Ok(root) = std::env::var("EXTERNAL_STORAGE") {
        candidates.push(PathBuf::from(root).join("Download"));
    }
    candidates.push(PathBuf::from("/storage/emulated/0/Download"));
    candidates.push(PathBuf::from("/sdcard/Download"));
    first_existing_dir(candidates)
}

/// Where an exported signed document is written: next to its source when that is a
/// plain file, else the downloads directory, else the temp dir.
pub fn output_dir_for(source_uri: Option<&str>) -> PathBuf {
    if let Some(uri) = source_uri {
        if let Some(path) = parse_file_uri_path(uri) {
            if let Some(parent) = path.parent() {
                return parent.to_path_buf();
            }
        }
        if uri.starts_with("content://") {
            if let Some(dl) = downloads_dir() {
                return dl;
            }
        }
    }
    std::env::temp_dir()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn file_store_round_trips_and_reports_missing() {
        let dir = tempdir().unwrap();
        let store = FileStore::open(dir.path().join("nested")).unwrap();
        assert_eq!(store.read("fieldsign.signatures").unwrap(), None);

        store.write("fieldsign.signatures", "[1,2]").unwrap();
        store.write("fieldsign.signatures", "[3]").unwrap();
        assert_eq!(store.read("fieldsign.signatures").unwrap().as_deref(), Some("[3]"));
        assert!(dir.path().join("nested/fieldsign.signatures.json").exists());
    }

    #[test]
    fn file_store_sanitizes_keys() {
        let dir = tempdir().unwrap();
        let store = FileStore::open(dir.path()).unwrap();
        store.write("../escape/key", "x").unwrap();
        assert!(dir.path().join(".._escape_key.json").exists());
    }

    #[test]
    fn memory_store_overwrites() {
        let store = MemoryStore::new();
        store.write("k", "a").unwrap();
        store.write("k", "b").unwrap();
        assert_eq!(store.read("k").unwrap().as_deref(), Some("b"));
        assert_eq!(store.read("other").unwrap(), None);
    }

    #[test]
    fn output_dir_prefers_source_parent() {
        assert_eq!(
            output_dir_for(Some("file:///sdcard/Docs/invoice.pdf")),
            PathBuf::from("/sdcard/Docs")
        );
        assert_eq!(output_dir_for(None), std::env::temp_dir());
    }

    #[test]
    fn data_dir_honors_override() {
        let _guard = test_env_lock().lock().unwrap();
        let dir = tempdir().unwrap();
        std::env::set_var("FIELDSIGN_DATA_DIR", dir.path());
        assert_eq!(preferred_data_dir(), dir.path().join("fieldsign"));
        std::env::remove_var("FIELDSIGN_DATA_DIR");
    }
}
