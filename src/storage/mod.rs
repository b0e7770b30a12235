//! Key-value persistence for identity keys, session components and the
//! failed-message queue.
//!
//! Each record is written as a whole; a reader sees either the previous
//! value or the new one, never a partial write.

use crate::utils::{Result, SpruceError, StorageError};
use log::{debug, warn};
use serde::{de::DeserializeOwned, Serialize};
use std::collections::HashMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

/// Record holding the identity key pairs
pub const IDENTITY_RECORD: &str = "spruce_private_keys";

/// Record holding the current session's key components
pub const SESSION_RECORD: &str = "spruce_session_components";

/// Record holding the failed-message queue
pub const FAILED_MESSAGES_RECORD: &str = "spruce_failed_messages";

/// Synchronous key-value persistence
pub trait KeyValueStore: Send + Sync {
    /// Read a record, `None` if absent
    ///
    /// # Errors
    ///
    /// Returns `StorageError::Read` if the backend fails
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>>;

    /// Replace a record
    ///
    /// # Errors
    ///
    /// Returns `StorageError::Write` if the backend fails
    fn set(&self, key: &str, value: &[u8]) -> Result<()>;

    /// Remove a record; removing an absent record succeeds
    ///
    /// # Errors
    ///
    /// Returns `StorageError::Write` if the backend fails
    fn remove(&self, key: &str) -> Result<()>;
}

/// Read and decode a JSON record
///
/// # Errors
///
/// Returns `StorageError::Corrupt` if the record exists but does not decode
pub fn load_json<T: DeserializeOwned>(store: &dyn KeyValueStore, key: &str) -> Result<Option<T>> {
    match store.get(key)? {
        Some(bytes) => serde_json::from_slice(&bytes).map(Some).map_err(|e| {
            StorageError::Corrupt {
                key: key.to_string(),
                reason: e.to_string(),
            }
            .into()
        }),
        None => Ok(None),
    }
}

/// Encode and write a JSON record
///
/// # Errors
///
/// Returns a serialization or write error
pub fn save_json<T: Serialize>(store: &dyn KeyValueStore, key: &str, value: &T) -> Result<()> {
    let bytes = serde_json::to_vec(value)?;
    store.set(key, &bytes)
}

/// In-process store, lost on exit
#[derive(Debug, Default)]
pub struct MemoryStore {
    records: Mutex<HashMap<String, Vec<u8>>>,
}

impl MemoryStore {
    /// Create an empty store
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether a record exists
    pub fn contains(&self, key: &str) -> bool {
        self.lock_records()
            .map(|records| records.contains_key(key))
            .unwrap_or(false)
    }

    fn lock_records(&self) -> Result<MutexGuard<'_, HashMap<String, Vec<u8>>>> {
        self.records.lock().map_err(|e| {
            StorageError::Write {
                key: "*".to_string(),
                reason: format!("memory store lock poisoned: {e}"),
            }
            .into()
        })
    }
}

impl KeyValueStore for MemoryStore {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        Ok(self.lock_records()?.get(key).cloned())
    }

    fn set(&self, key: &str, value: &[u8]) -> Result<()> {
        self.lock_records()?.insert(key.to_string(), value.to_vec());
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<()> {
        self.lock_records()?.remove(key);
        Ok(())
    }
}

/// One file per record under a data directory
///
/// Writes go to a temporary sibling, are synced, then renamed into place.
#[derive(Debug, Clone)]
pub struct FileStore {
    root: PathBuf,
}

impl FileStore {
    /// Open a store rooted at `root`, creating the directory if needed
    ///
    /// # Errors
    ///
    /// Returns `StorageError::Write` if the directory cannot be created
    pub fn open<P: AsRef<Path>>(root: P) -> Result<Self> {
        let root = root.as_ref().to_path_buf();
        fs::create_dir_all(&root).map_err(|e| StorageError::Write {
            key: root.display().to_string(),
            reason: format!("failed to create data directory: {e}"),
        })?;
        debug!("Opened file store at {}", root.display());
        Ok(Self { root })
    }

    /// Directory holding the records
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn record_path(&self, key: &str) -> Result<PathBuf> {
        let valid = !key.is_empty()
            && key
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-');
        if !valid {
            return Err(StorageError::Write {
                key: key.to_string(),
                reason: "record keys must be alphanumeric, '_' or '-'".to_string(),
            }
            .into());
        }
        Ok(self.root.join(format!("{key}.json")))
    }
}

impl KeyValueStore for FileStore {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let path = self.record_path(key)?;
        match fs::read(&path) {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(StorageError::Read {
                key: key.to_string(),
                reason: e.to_string(),
            }
            .into()),
        }
    }

    fn set(&self, key: &str, value: &[u8]) -> Result<()> {
        let path = self.record_path(key)?;
        let tmp_path = path.with_extension("json.tmp");
        let write_err = |reason: String| -> SpruceError {
            StorageError::Write {
                key: key.to_string(),
                reason,
            }
            .into()
        };

        {
            let mut file = fs::File::create(&tmp_path)
                .map_err(|e| write_err(format!("failed to create temp file: {e}")))?;
            file.write_all(value)
                .map_err(|e| write_err(format!("failed to write temp file: {e}")))?;
            file.sync_all()
                .map_err(|e| write_err(format!("failed to fsync temp file: {e}")))?;
        }

        fs::rename(&tmp_path, &path).map_err(|e| {
            if let Err(cleanup) = fs::remove_file(&tmp_path) {
                warn!("Failed to remove {}: {}", tmp_path.display(), cleanup);
            }
            write_err(format!("failed to rename temp file: {e}"))
        })
    }

    fn remove(&self, key: &str) -> Result<()> {
        let path = self.record_path(key)?;
        match fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(StorageError::Write {
                key: key.to_string(),
                reason: e.to_string(),
            }
            .into()),
        }
    }
}
