//! Durable key-value string storage behind the Local Cache.
//!
//! Values are whole JSON documents; a `put` replaces the value in one step so a
//! reader never observes a half written sequence. [`Storage::update`] is the
//! read-modify-write used by every writer that shares a key with another
//! process, so two writers never lose each other's update.
use std::{
    collections::HashMap,
    io,
    path::{Path, PathBuf},
    sync::atomic::{AtomicBool, Ordering},
    time::{Duration, SystemTime},
};

use async_trait::async_trait;
use thiserror::Error;
use tokio::{fs, sync::Mutex, time::sleep};
use tracing::{debug, warn};

const LOCK_RETRY: Duration = Duration::from_millis(10);
const LOCK_WAIT: Duration = Duration::from_secs(5);
const LOCK_STALE: Duration = Duration::from_secs(30);

/// Maps the current value (if any) to its replacement.
///
/// May run more than once when a backend retries after contention.
pub type Update<'a> = &'a (dyn Fn(Option<&str>) -> Result<String, StorageError> + Send + Sync);

#[derive(Error, Debug)]
pub enum StorageError {
    #[error("Storage I/O failed: {0}")]
    Io(#[from] io::Error),

    #[error("Malformed stored value under {key}: {source}")]
    Malformed {
        key: String,
        source: serde_json::Error,
    },

    #[error("Storage backend unavailable: {0}")]
    Unavailable(String),
}

#[async_trait]
pub trait Storage: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>, StorageError>;

    async fn put(&self, key: &str, value: String) -> Result<(), StorageError>;

    /// Atomically replaces the value under `key` with `apply(current)` and
    /// returns what was written.
    async fn update(&self, key: &str, apply: Update<'_>) -> Result<String, StorageError>;
}

/// One file per key under a directory, replaced through a rename.
pub struct FileStorage {
    root: PathBuf,
}

impl FileStorage {
    pub async fn open(root: impl AsRef<Path>) -> Result<Self, StorageError> {
        let root = root.as_ref().to_path_buf();
        fs::create_dir_all(&root).await?;

        Ok(Self { root })
    }

    fn path(&self, key: &str) -> PathBuf {
        self.root.join(format!("{key}.json"))
    }

    async fn write(&self, key: &str, value: &str) -> Result<(), StorageError> {
        let path = self.path(key);
        let staging = self.root.join(format!(".{key}.json.tmp"));

        fs::write(&staging, value).await?;
        fs::rename(&staging, &path).await?;

        debug!("Wrote {}", path.display());
        Ok(())
    }

    /// Exclusive per-key lock file, shared by every process on this directory.
    async fn lock(&self, key: &str) -> Result<KeyLock, StorageError> {
        let path = self.root.join(format!(".{key}.lock"));
        let started = SystemTime::now();

        loop {
            match fs::OpenOptions::new()
                .write(true)
                .create_new(true)
                .open(&path)
                .await
            {
                Ok(_) => return Ok(KeyLock { path }),
                Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {}
                Err(e) => return Err(e.into()),
            }

            let stale = fs::metadata(&path)
                .await
                .and_then(|meta| meta.modified())
                .ok()
                .and_then(|modified| modified.elapsed().ok())
                .is_some_and(|age| age > LOCK_STALE);
            if stale {
                warn!("Removing stale lock {}", path.display());
                let _ = fs::remove_file(&path).await;
                continue;
            }

            if started.elapsed().unwrap_or_default() > LOCK_WAIT {
                return Err(StorageError::Unavailable(format!(
                    "timed out waiting for {}",
                    path.display()
                )));
            }
            sleep(LOCK_RETRY).await;
        }
    }
}

struct KeyLock {
    path: PathBuf,
}

impl Drop for KeyLock {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.path);
    }
}

#[async_trait]
impl Storage for FileStorage {
    async fn get(&self, key: &str) -> Result<Option<String>, StorageError> {
        match fs::read_to_string(self.path(key)).await {
            Ok(value) => Ok(Some(value)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn put(&self, key: &str, value: String) -> Result<(), StorageError> {
        let _lock = self.lock(key).await?;
        self.write(key, &value).await
    }

    async fn update(&self, key: &str, apply: Update<'_>) -> Result<String, StorageError> {
        let _lock = self.lock(key).await?;
        let current = self.get(key).await?;
        let next = apply(current.as_deref())?;
        self.write(key, &next).await?;

        Ok(next)
    }
}

#[derive(Default)]
pub struct MemoryStorage {
    values: Mutex<HashMap<String, String>>,
    offline: AtomicBool,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// While offline every call fails with [`StorageError::Unavailable`].
    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    fn check(&self) -> Result<(), StorageError> {
        if self.offline.load(Ordering::SeqCst) {
            return Err(StorageError::Unavailable("memory storage offline".into()));
        }

        Ok(())
    }
}

#[async_trait]
impl Storage for MemoryStorage {
    async fn get(&self, key: &str) -> Result<Option<String>, StorageError> {
        self.check()?;

        Ok(self.values.lock().await.get(key).cloned())
    }

    async fn put(&self, key: &str, value: String) -> Result<(), StorageError> {
        self.check()?;
        self.values.lock().await.insert(key.to_string(), value);

        Ok(())
    }

    async fn update(&self, key: &str, apply: Update<'_>) -> Result<String, StorageError> {
        self.check()?;
        let mut values = self.values.lock().await;
        let next = apply(values.get(key).map(String::as_str))?;
        values.insert(key.to_string(), next.clone());

        Ok(next)
    }
}
