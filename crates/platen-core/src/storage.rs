//! Storage backends for orchestrator control state.
//!
//! Platen persists exactly one kind of artifact: the JSON snapshot of a
//! batch's control state. The [`StorageBackend`] trait is the seam between
//! the orchestrator and whatever durable medium the deployment provides.
//! [`MemoryBackend`] backs tests and local development; [`FsBackend`]
//! persists to a local directory and survives process restarts.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::{PoisonError, RwLock};

use async_trait::async_trait;

use crate::error::{Error, Result};

/// Converts a lock poison error to a storage error.
fn poison_err<T>(_: PoisonError<T>) -> Error {
    Error::storage("lock poisoned")
}

/// Durable key-value storage for small JSON documents.
///
/// Keys are slash-separated paths (`batches/B1.json`). Values are opaque
/// bytes; the orchestrator always writes serialized JSON. Implementations
/// must make a completed `put` visible to subsequent `get`/`list` calls,
/// including from a different process after a restart.
#[async_trait]
pub trait StorageBackend: Send + Sync {
    /// Writes a document, replacing any existing value.
    async fn put(&self, key: &str, value: Vec<u8>) -> Result<()>;

    /// Reads a document. Returns `None` if the key does not exist.
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>>;

    /// Returns true if the key exists.
    async fn head(&self, key: &str) -> Result<bool>;

    /// Lists keys under a prefix, lexicographically ordered.
    async fn list(&self, prefix: &str) -> Result<Vec<String>>;

    /// Deletes a document. Deleting a missing key is not an error.
    async fn delete(&self, key: &str) -> Result<()>;
}

/// In-memory storage backend.
///
/// Not durable: state is lost when the process exits. Suitable for tests
/// and for local development with `PLATEN_DEBUG=true`.
#[derive(Debug, Default)]
pub struct MemoryBackend {
    objects: RwLock<BTreeMap<String, Vec<u8>>>,
}

impl MemoryBackend {
    /// Creates an empty in-memory backend.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the number of stored documents.
    ///
    /// # Errors
    ///
    /// Returns an error if the lock is poisoned.
    pub fn len(&self) -> Result<usize> {
        let objects = self.objects.read().map_err(poison_err)?;
        Ok(objects.len())
    }

    /// Returns true if no documents are stored.
    ///
    /// # Errors
    ///
    /// Returns an error if the lock is poisoned.
    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }
}

#[async_trait]
impl StorageBackend for MemoryBackend {
    async fn put(&self, key: &str, value: Vec<u8>) -> Result<()> {
        let mut objects = self.objects.write().map_err(poison_err)?;
        objects.insert(key.to_string(), value);
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let objects = self.objects.read().map_err(poison_err)?;
        Ok(objects.get(key).cloned())
    }

    async fn head(&self, key: &str) -> Result<bool> {
        let objects = self.objects.read().map_err(poison_err)?;
        Ok(objects.contains_key(key))
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>> {
        let objects = self.objects.read().map_err(poison_err)?;
        Ok(objects
            .range(prefix.to_string()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, _)| k.clone())
            .collect())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let mut objects = self.objects.write().map_err(poison_err)?;
        objects.remove(key);
        Ok(())
    }
}

/// Filesystem storage backend.
///
/// Stores each document as a file under a root directory, mirroring the
/// key's slash-separated layout. Writes go through a temporary file and a
/// rename so a crash mid-write never leaves a truncated document behind.
#[derive(Debug)]
pub struct FsBackend {
    root: PathBuf,
}

impl FsBackend {
    /// Creates a backend rooted at `root`, creating the directory if
    /// needed.
    ///
    /// # Errors
    ///
    /// Returns an error if the directory cannot be created.
    pub fn new(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        std::fs::create_dir_all(&root).map_err(|e| {
            Error::storage_with_source(format!("failed to create {}", root.display()), e)
        })?;
        Ok(Self { root })
    }

    fn path_for(&self, key: &str) -> Result<PathBuf> {
        if key.is_empty()
            || key.starts_with('/')
            || key.split('/').any(|seg| seg.is_empty() || seg == "." || seg == "..")
        {
            return Err(Error::storage(format!("invalid storage key '{key}'")));
        }
        Ok(self.root.join(key))
    }

    fn collect_keys(root: &Path, dir: &Path, out: &mut Vec<String>) -> std::io::Result<()> {
        for entry in std::fs::read_dir(dir)? {
            let entry = entry?;
            let path = entry.path();
            if entry.file_type()?.is_dir() {
                Self::collect_keys(root, &path, out)?;
            } else if let Ok(relative) = path.strip_prefix(root) {
                out.push(relative.to_string_lossy().replace('\\', "/"));
            }
        }
        Ok(())
    }
}

#[async_trait]
impl StorageBackend for FsBackend {
    async fn put(&self, key: &str, value: Vec<u8>) -> Result<()> {
        let path = self.path_for(key)?;
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await.map_err(|e| {
                Error::storage_with_source(format!("failed to create {}", parent.display()), e)
            })?;
        }

        let tmp = path.with_extension("tmp");
        tokio::fs::write(&tmp, value).await.map_err(|e| {
            Error::storage_with_source(format!("failed to write {}", tmp.display()), e)
        })?;
        tokio::fs::rename(&tmp, &path).await.map_err(|e| {
            Error::storage_with_source(format!("failed to rename into {}", path.display()), e)
        })?;
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let path = self.path_for(key)?;
        match tokio::fs::read(&path).await {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(Error::storage_with_source(
                format!("failed to read {}", path.display()),
                e,
            )),
        }
    }

    async fn head(&self, key: &str) -> Result<bool> {
        let path = self.path_for(key)?;
        Ok(tokio::fs::try_exists(&path).await.unwrap_or(false))
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>> {
        let root = self.root.clone();
        let prefix = prefix.to_string();
        let keys = tokio::task::spawn_blocking(move || {
            let mut out = Vec::new();
            match Self::collect_keys(&root, &root, &mut out) {
                Ok(()) => Ok(out),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Vec::new()),
                Err(e) => Err(Error::storage_with_source("failed to list documents", e)),
            }
        })
        .await
        .map_err(|e| Error::storage(format!("list task failed: {e}")))??;

        let mut keys: Vec<String> = keys
            .into_iter()
            .filter(|k| k.starts_with(&prefix) && !k.ends_with(".tmp"))
            .collect();
        keys.sort();
        Ok(keys)
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let path = self.path_for(key)?;
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(Error::storage_with_source(
                format!("failed to delete {}", path.display()),
                e,
            )),
        }
    }
}
