//! File-backed record storage with per-record advisory locks.
//!
//! Each record lives at `<dir>/<name>.json` inside a versioned envelope.
//! Locks are taken on a sibling `<dir>/.<name>.lock` file because the data
//! file's inode is replaced on every write.
//!
//! ## Write protocol
//!
//! 1. Exclusive lock on the record's lock file
//! 2. Serialize to `<name>.json.tmp` in the same directory
//! 3. `fsync` the temp file
//! 4. Rename over the target, then `fsync` the directory
//!
//! A reader therefore sees either the previous or the new envelope, never a
//! partial one.

use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::trace;

/// Errors from the file store.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("I/O error on {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("Record '{record}' is corrupt: {source}")]
    Corrupt {
        record: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("Failed to serialize record '{record}': {source}")]
    Serialize {
        record: String,
        #[source]
        source: serde_json::Error,
    },
}

impl StoreError {
    fn io(path: &Path, source: io::Error) -> Self {
        StoreError::Io {
            path: path.to_path_buf(),
            source,
        }
    }
}

/// On-disk envelope around every record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Versioned<T> {
    /// Monotonic per-record write counter.
    pub version: u64,
    pub updated_at: DateTime<Utc>,
    pub data: T,
}

/// Only the version is needed to stamp the next write.
#[derive(Deserialize)]
struct EnvelopeHeader {
    version: u64,
}

/// Held advisory lock. Released when the file handle is dropped.
struct LockGuard {
    _file: File,
}

/// Directory of JSON records.
#[derive(Debug, Clone)]
pub struct FileStore {
    dir: PathBuf,
}

impl FileStore {
    /// Open (creating if needed) a store rooted at `dir`.
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let dir = dir.into();
        fs::create_dir_all(&dir).map_err(|e| StoreError::io(&dir, e))?;
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Path of a record's data file.
    pub fn data_path(&self, name: &str) -> PathBuf {
        self.dir.join(format!("{name}.json"))
    }

    fn lock_path(&self, name: &str) -> PathBuf {
        self.dir.join(format!(".{name}.lock"))
    }

    fn temp_path(&self, name: &str) -> PathBuf {
        self.dir.join(format!("{name}.json.tmp"))
    }

    fn lock(&self, name: &str, exclusive: bool) -> Result<LockGuard, StoreError> {
        let path = self.lock_path(name);
        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .read(true)
            .write(true)
            .open(&path)
            .map_err(|e| StoreError::io(&path, e))?;
        let locked = if exclusive {
            file.lock()
        } else {
            file.lock_shared()
        };
        locked.map_err(|e| StoreError::io(&path, e))?;
        Ok(LockGuard { _file: file })
    }

    /// Read a record under a shared lock. `Ok(None)` when it does not exist.
    pub fn read<T: DeserializeOwned>(&self, name: &str) -> Result<Option<Versioned<T>>, StoreError> {
        let _guard = self.lock(name, false)?;
        self.read_unlocked(name)
    }

    /// Replace a record. Returns the new version.
    ///
    /// A corrupt prior record is overwritten rather than rejected.
    pub fn write<T: Serialize>(&self, name: &str, value: &T) -> Result<u64, StoreError> {
        let _guard = self.lock(name, true)?;
        let prior = self.read_version_unlocked(name);
        self.write_unlocked(name, value, prior + 1)
    }

    /// Read-modify-write under one exclusive lock.
    ///
    /// `f` receives the current value (or `T::default()` when absent) and may
    /// return anything; its result is passed back to the caller. A corrupt
    /// prior record is an error; nothing is written.
    pub fn update<T, R, F>(&self, name: &str, f: F) -> Result<R, StoreError>
    where
        T: Serialize + DeserializeOwned + Default,
        F: FnOnce(&mut T) -> R,
    {
        let _guard = self.lock(name, true)?;
        let (mut value, version) = match self.read_unlocked::<T>(name)? {
            Some(v) => (v.data, v.version),
            None => (T::default(), 0),
        };
        let out = f(&mut value);
        self.write_unlocked(name, &value, version + 1)?;
        Ok(out)
    }

    fn read_unlocked<T: DeserializeOwned>(
        &self,
        name: &str,
    ) -> Result<Option<Versioned<T>>, StoreError> {
        let path = self.data_path(name);
        let bytes = match fs::read(&path) {
            Ok(b) => b,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(StoreError::io(&path, e)),
        };
        serde_json::from_slice(&bytes)
            .map(Some)
            .map_err(|source| StoreError::Corrupt {
                record: name.to_string(),
                source,
            })
    }

    fn read_version_unlocked(&self, name: &str) -> u64 {
        fs::read(self.data_path(name))
            .ok()
            .and_then(|b| serde_json::from_slice::<EnvelopeHeader>(&b).ok())
            .map(|h| h.version)
            .unwrap_or(0)
    }

    fn write_unlocked<T: Serialize>(
        &self,
        name: &str,
        value: &T,
        version: u64,
    ) -> Result<u64, StoreError> {
        let envelope = Versioned {
            version,
            updated_at: Utc::now(),
            data: value,
        };
        let bytes =
            serde_json::to_vec_pretty(&envelope).map_err(|source| StoreError::Serialize {
                record: name.to_string(),
                source,
            })?;

        let tmp = self.temp_path(name);
        {
            let mut file = File::create(&tmp).map_err(|e| StoreError::io(&tmp, e))?;
            file.write_all(&bytes).map_err(|e| StoreError::io(&tmp, e))?;
            file.sync_all().map_err(|e| StoreError::io(&tmp, e))?;
        }

        let target = self.data_path(name);
        fs::rename(&tmp, &target).map_err(|e| StoreError::io(&target, e))?;

        // Persist the rename itself. Not supported everywhere.
        if let Ok(dir) = File::open(&self.dir) {
            let _ = dir.sync_all();
        }

        trace!(record = name, version, "Record written");
        Ok(version)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_read_missing_is_none() {
        let dir = TempDir::new().unwrap();
        let store = FileStore::open(dir.path()).unwrap();
        let v: Option<Versioned<Vec<u32>>> = store.read("nothing").unwrap();
        assert!(v.is_none());
    }

    #[test]
    fn test_write_increments_version() {
        let dir = TempDir::new().unwrap();
        let store = FileStore::open(dir.path()).unwrap();

        assert_eq!(store.write("n", &1u32).unwrap(), 1);
        assert_eq!(store.write("n", &2u32).unwrap(), 2);

        let v: Versioned<u32> = store.read("n").unwrap().unwrap();
        assert_eq!(v.version, 2);
        assert_eq!(v.data, 2);
        assert!(!store.temp_path("n").exists());
    }

    #[test]
    fn test_corrupt_record_is_error() {
        let dir = TempDir::new().unwrap();
        let store = FileStore::open(dir.path()).unwrap();
        fs::write(store.data_path("bad"), b"{not json").unwrap();

        let err = store.read::<u32>("bad").unwrap_err();
        assert!(matches!(err, StoreError::Corrupt { .. }));

        let err = store.update::<u32, _, _>("bad", |v| *v += 1).unwrap_err();
        assert!(matches!(err, StoreError::Corrupt { .. }));
    }

    #[test]
    fn test_write_replaces_corrupt_record() {
        let dir = TempDir::new().unwrap();
        let store = FileStore::open(dir.path()).unwrap();
        fs::write(store.data_path("bad"), b"garbage").unwrap();

        assert_eq!(store.write("bad", &7u32).unwrap(), 1);
        assert_eq!(store.read::<u32>("bad").unwrap().unwrap().data, 7);
    }

    #[test]
    fn test_update_returns_closure_result() {
        let dir = TempDir::new().unwrap();
        let store = FileStore::open(dir.path()).unwrap();

        let len = store
            .update::<Vec<u32>, _, _>("list", |v| {
                v.push(3);
                v.len()
            })
            .unwrap();
        assert_eq!(len, 1);
    }
}
