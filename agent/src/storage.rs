//! Persistent key-value storage capability.
//!
//! The session record and the device key live in a [`Storage`] scope that
//! may be shared by several agent instances at once (several tabs, several
//! processes). Implementations make no atomicity promises beyond a single
//! `get`/`set`/`remove`; the session manager reconciles on top of that.
//!
//! - [`MemoryStorage`]: in-process scope; clones share the same map.
//! - [`FileStorage`]: a JSON object on disk, re-read on every access so
//!   other processes' writes are observed. A corrupt file reads as empty and
//!   is replaced by the next write.

use std::cell::{Cell, RefCell};
use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::rc::Rc;

use tempfile::NamedTempFile;
use thiserror::Error;
use tracing::{trace, warn};

/// Errors raised by a [`Storage`] backend.
#[derive(Error, Debug)]
pub enum StorageError {
    /// Reading or writing the backing file failed.
    #[error("storage I/O error: {0}")]
    Io(#[from] io::Error),

    /// The backing file is not a JSON object of strings.
    #[error("storage file is corrupt: {0}")]
    Serialization(#[from] serde_json::Error),

    /// The backend refused the operation (quota, private mode, ...).
    #[error("storage unavailable: {0}")]
    Unavailable(String),
}

/// String key-value store.
pub trait Storage {
    fn get(&self, key: &str) -> Result<Option<String>, StorageError>;
    fn set(&self, key: &str, value: &str) -> Result<(), StorageError>;
    fn remove(&self, key: &str) -> Result<(), StorageError>;
}

/// In-memory storage scope.
///
/// Cloning yields a handle to the *same* scope, which is how tests model two
/// tabs of one origin.
#[derive(Debug, Clone)]
pub struct MemoryStorage {
    entries: Rc<RefCell<BTreeMap<String, String>>>,
    available: Rc<Cell<bool>>,
}

impl Default for MemoryStorage {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStorage {
    #[must_use]
    pub fn new() -> Self {
        Self {
            entries: Rc::default(),
            available: Rc::new(Cell::new(true)),
        }
    }

    /// Makes every subsequent operation fail with
    /// [`StorageError::Unavailable`] (or succeed again).
    pub fn set_available(&self, available: bool) {
        self.available.set(available);
    }

    /// Raw snapshot of the scope.
    #[must_use]
    pub fn snapshot(&self) -> BTreeMap<String, String> {
        self.entries.borrow().clone()
    }

    fn check(&self) -> Result<(), StorageError> {
        if self.available.get() {
            Ok(())
        } else {
            Err(StorageError::Unavailable("memory storage disabled".to_string()))
        }
    }
}

impl Storage for MemoryStorage {
    fn get(&self, key: &str) -> Result<Option<String>, StorageError> {
        self.check()?;
        Ok(self.entries.borrow().get(key).cloned())
    }

    fn set(&self, key: &str, value: &str) -> Result<(), StorageError> {
        self.check()?;
        self.entries
            .borrow_mut()
            .insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<(), StorageError> {
        self.check()?;
        self.entries.borrow_mut().remove(key);
        Ok(())
    }
}

/// Storage backed by a single JSON object file.
///
/// Every write goes to its own uniquely named temp file in the same
/// directory, which is then renamed over the target. Readers never observe a
/// half-written file, and concurrent writers never share a temp file.
#[derive(Debug, Clone)]
pub struct FileStorage {
    path: PathBuf,
}

impl FileStorage {
    /// Opens (without creating) the storage file at `path`.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn load(&self) -> Result<BTreeMap<String, String>, StorageError> {
        let contents = match fs::read_to_string(&self.path) {
            Ok(contents) => contents,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(BTreeMap::new()),
            Err(e) => return Err(e.into()),
        };
        if contents.trim().is_empty() {
            return Ok(BTreeMap::new());
        }
        match serde_json::from_str(&contents) {
            Ok(entries) => Ok(entries),
            Err(e) => {
                warn!(path = %self.path.display(), error = %e, "Storage file is corrupt; treating as empty");
                Ok(BTreeMap::new())
            }
        }
    }

    fn store(&self, entries: &BTreeMap<String, String>) -> Result<(), StorageError> {
        let dir = match self.path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent,
            _ => Path::new("."),
        };
        fs::create_dir_all(dir)?;

        let mut tmp = NamedTempFile::new_in(dir)?;
        tmp.write_all(&serde_json::to_vec_pretty(entries)?)?;
        tmp.as_file().sync_all()?;
        tmp.persist(&self.path).map_err(|e| e.error)?;
        trace!(path = %self.path.display(), entries = entries.len(), "Wrote storage file");
        Ok(())
    }
}

impl Storage for FileStorage {
    fn get(&self, key: &str) -> Result<Option<String>, StorageError> {
        Ok(self.load()?.remove(key))
    }

    fn set(&self, key: &str, value: &str) -> Result<(), StorageError> {
        let mut entries = self.load()?;
        entries.insert(key.to_string(), value.to_string());
        self.store(&entries)
    }

    fn remove(&self, key: &str) -> Result<(), StorageError> {
        let mut entries = self.load()?;
        if entries.remove(key).is_some() {
            self.store(&entries)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn memory_clones_share_scope() {
        let tab_a = MemoryStorage::new();
        let tab_b = tab_a.clone();

        tab_a.set("k", "v").unwrap();
        assert_eq!(tab_b.get("k").unwrap().as_deref(), Some("v"));

        tab_b.remove("k").unwrap();
        assert!(tab_a.get("k").unwrap().is_none());
    }

    #[test]
    fn memory_unavailable_fails_every_operation() {
        let storage = MemoryStorage::new();
        storage.set_available(false);

        assert!(matches!(storage.get("k"), Err(StorageError::Unavailable(_))));
        assert!(matches!(storage.set("k", "v"), Err(StorageError::Unavailable(_))));
        assert!(matches!(storage.remove("k"), Err(StorageError::Unavailable(_))));

        storage.set_available(true);
        tokio_test::assert_ok!(storage.set("k", "v"));
    }

    #[test]
    fn file_missing_reads_as_empty() {
        let dir = TempDir::new().unwrap();
        let storage = FileStorage::new(dir.path().join("nested").join("storage.json"));

        assert!(storage.get("anything").unwrap().is_none());
        tokio_test::assert_ok!(storage.remove("anything"));
    }

    #[test]
    fn file_set_get_remove() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nested").join("storage.json");
        let storage = FileStorage::new(&path);

        storage.set("a", "1").unwrap();
        storage.set("b", "2").unwrap();
        assert_eq!(storage.get("a").unwrap().as_deref(), Some("1"));

        // A second handle on the same file sees the writes.
        let other = FileStorage::new(&path);
        assert_eq!(other.get("b").unwrap().as_deref(), Some("2"));

        other.remove("a").unwrap();
        assert!(storage.get("a").unwrap().is_none());

        // Only the storage file itself is left behind.
        let files: Vec<_> = fs::read_dir(path.parent().unwrap())
            .unwrap()
            .map(|entry| entry.unwrap().file_name())
            .collect();
        assert_eq!(files, vec![std::ffi::OsString::from("storage.json")]);
    }

    #[test]
    fn file_corrupt_contents_read_as_empty_and_are_repaired() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("storage.json");
        fs::write(&path, "[not an object").unwrap();

        let storage = FileStorage::new(&path);
        assert!(storage.get("a").unwrap().is_none());

        storage.set("a", "1").unwrap();
        assert_eq!(storage.get("a").unwrap().as_deref(), Some("1"));
        let on_disk: BTreeMap<String, String> =
            serde_json::from_str(&fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(on_disk.len(), 1);
    }

    #[test]
    fn file_writes_ignore_stray_temp_path() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("storage.json");
        // A crashed writer's leftovers must not block the next one.
        fs::create_dir(path.with_extension("json.tmp")).unwrap();

        let writers = [FileStorage::new(&path), FileStorage::new(&path)];
        for round in 0..3 {
            for (i, writer) in writers.iter().enumerate() {
                writer.set(&format!("w{i}"), &round.to_string()).unwrap();
            }
        }

        let reader = FileStorage::new(&path);
        assert_eq!(reader.get("w0").unwrap().as_deref(), Some("2"));
        assert_eq!(reader.get("w1").unwrap().as_deref(), Some("2"));
    }

    #[test]
    fn storage_error_display() {
        let err = StorageError::Unavailable("quota".to_string());
        assert_eq!(err.to_string(), "storage unavailable: quota");
    }
}
