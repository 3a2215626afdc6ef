use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::future::Future;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, Weak};
use std::time::{Duration, Instant};

use fs2::FileExt;
use tokio::sync::OwnedMutexGuard;

use super::{CacheError, CacheKey};

type LocalLocks = Arc<Mutex<HashMap<String, Weak<tokio::sync::Mutex<()>>>>>;

/// Serializes work on individual keys, across tasks of this process and across processes.
///
/// Locking happens in two layers: tasks of the same `LockManager` first queue on an in-process
/// async mutex per key, so they never have to poll. The winner then takes an exclusive OS-level
/// lock on a dedicated lock file, which it polls for every `poll_interval` as long as another
/// process (or another `LockManager`) holds it.
///
/// Lock files live in their own directory and are never deleted, as removing a lock file that
/// somebody is about to lock would break mutual exclusion.
///
/// Acquiring the lock of a key that the current task already holds never completes.
#[derive(Debug, Clone)]
pub struct LockManager {
    locks_dir: PathBuf,
    timeout: Option<Duration>,
    poll_interval: Duration,
    local: LocalLocks,
}

/// Exclusive ownership of a key, released on drop.
#[derive(Debug)]
pub struct KeyLock {
    file: File,
    path: PathBuf,
    _local: Option<OwnedMutexGuard<()>>,
}

impl KeyLock {
    /// The path of the lock file.
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for KeyLock {
    fn drop(&mut self) {
        // closing the file releases the lock as well, this just makes it explicit
        if let Err(e) = FileExt::unlock(&self.file) {
            tracing::error!(
                error = &e as &dyn std::error::Error,
                path = %self.path.display(),
                "Failed to release lock",
            );
        }
    }
}

impl LockManager {
    pub fn new(
        locks_dir: impl Into<PathBuf>,
        timeout: Option<Duration>,
        poll_interval: Duration,
    ) -> Self {
        Self {
            locks_dir: locks_dir.into(),
            timeout,
            poll_interval,
            local: Default::default(),
        }
    }

    /// Acquires the lock of `key`, waiting at most the configured timeout.
    pub async fn acquire(&self, key: &CacheKey) -> Result<KeyLock, CacheError> {
        let producer = key.producer().name();
        let started = Instant::now();

        let cache_path = key.cache_path();
        let lock = self.acquire_path(&cache_path);
        let result = match self.timeout {
            Some(timeout) => match tokio::time::timeout(timeout, lock).await {
                Ok(result) => result,
                Err(_) => {
                    metric!(counter("memo.lock.timeout") += 1, "producer" => producer);
                    Err(CacheError::LockTimeout(timeout))
                }
            },
            None => lock.await,
        };

        let waited = started.elapsed();
        metric!(timer("memo.lock.wait") = waited, "producer" => producer);
        if let Ok(ref lock) = result {
            tracing::debug!("Acquired {} after {:?}", lock.path.display(), waited);
        }

        result
    }

    /// Acquires the lock of the relative entry path `cache_path`, without any timeout.
    pub async fn acquire_path(&self, cache_path: &str) -> Result<KeyLock, CacheError> {
        let local = self.local_lock(cache_path).lock_owned().await;

        let path = self.lock_path(cache_path);
        let file = open_lock_file(&path).map_err(|e| CacheError::io(&path, e))?;

        loop {
            match FileExt::try_lock_exclusive(&file) {
                Ok(()) => {
                    return Ok(KeyLock {
                        file,
                        path,
                        _local: Some(local),
                    });
                }
                Err(e) if is_contended(&e) => {
                    tracing::trace!("Waiting for {} held by another process", path.display());
                    tokio::time::sleep(self.poll_interval).await;
                }
                Err(e) => return Err(CacheError::io(&path, e)),
            }
        }
    }

    /// Acquires the lock of the relative entry path `cache_path`, blocking the current thread.
    ///
    /// This bypasses the in-process queue, so it contends with tasks of this process through the
    /// lock file only. The configured timeout applies.
    pub fn acquire_blocking(&self, cache_path: &str) -> Result<KeyLock, CacheError> {
        let path = self.lock_path(cache_path);
        let file = open_lock_file(&path).map_err(|e| CacheError::io(&path, e))?;
        let started = Instant::now();

        loop {
            match FileExt::try_lock_exclusive(&file) {
                Ok(()) => {
                    return Ok(KeyLock {
                        file,
                        path,
                        _local: None,
                    });
                }
                Err(e) if is_contended(&e) => {
                    if let Some(timeout) = self.timeout {
                        if started.elapsed() >= timeout {
                            return Err(CacheError::LockTimeout(timeout));
                        }
                    }
                    std::thread::sleep(self.poll_interval);
                }
                Err(e) => return Err(CacheError::io(&path, e)),
            }
        }
    }

    fn lock_path(&self, cache_path: &str) -> PathBuf {
        self.locks_dir.join(format!("{cache_path}.lock"))
    }

    /// Runs `body` while holding the lock of `key`.
    pub async fn with_exclusive<F, Fut, T>(&self, key: &CacheKey, body: F) -> Result<T, CacheError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = T>,
    {
        let _lock = self.acquire(key).await?;
        Ok(body().await)
    }

    fn local_lock(&self, cache_path: &str) -> Arc<tokio::sync::Mutex<()>> {
        let mut local = self.local.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(lock) = local.get(cache_path).and_then(Weak::upgrade) {
            return lock;
        }

        local.retain(|_, lock| lock.strong_count() > 0);
        let lock = Arc::new(tokio::sync::Mutex::new(()));
        local.insert(cache_path.to_owned(), Arc::downgrade(&lock));
        lock
    }
}

fn open_lock_file(path: &Path) -> io::Result<File> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(false)
        .open(path)
}

fn is_contended(e: &io::Error) -> bool {
    e.kind() == io::ErrorKind::WouldBlock
        || e.raw_os_error() == fs2::lock_contended_error().raw_os_error()
}
