use std::fs;
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use serde::Serialize;
use tempfile::NamedTempFile;
use walkdir::WalkDir;

use super::entry::{EntryHeader, read_header};
use super::{CacheEntry, CacheError, CacheKey, LockManager, ProducerIdentity};

const ENTRIES_DIR: &str = "entries";
const LOCKS_DIR: &str = "locks";
const TMP_DIR: &str = "tmp";

/// The durable mapping of [`CacheKey`]s to [`CacheEntry`]s below a store root.
///
/// The root is laid out as follows:
///
/// - `entries/<producer>/<aa>/<bbcc...>`: the entries, one file per key.
/// - `locks/<producer>/<aa>/<bbcc...>.lock`: lock files, see [`LockManager`](super::LockManager).
/// - `tmp/`: entries are written here first and then atomically moved into place, so readers
///   never observe partially written entries.
#[derive(Debug, Clone)]
pub struct EntryStore {
    root: PathBuf,
    entries_dir: PathBuf,
    locks_dir: PathBuf,
    tmp_dir: PathBuf,
}

/// An entry found while scanning the store.
#[derive(Debug, Clone, Serialize)]
pub struct StoredEntry {
    pub path: PathBuf,
    pub header: EntryHeader,
    pub payload_len: u64,
}

impl EntryStore {
    /// Opens the store at `root`, creating its directories as needed.
    pub fn open(root: impl Into<PathBuf>) -> Result<Self, CacheError> {
        let root = root.into();
        let store = EntryStore {
            entries_dir: root.join(ENTRIES_DIR),
            locks_dir: root.join(LOCKS_DIR),
            tmp_dir: root.join(TMP_DIR),
            root,
        };
        store.ensure_namespace()?;
        Ok(store)
    }

    /// Makes sure the directories of the store exist and are writable.
    pub fn ensure_namespace(&self) -> Result<(), CacheError> {
        let unavailable = |source| CacheError::NamespaceUnavailable {
            path: self.root.clone(),
            source,
        };

        for dir in [&self.entries_dir, &self.locks_dir, &self.tmp_dir] {
            fs::create_dir_all(dir).map_err(unavailable)?;
        }

        // directories can exist without being writable
        let check_file = tempfile::Builder::new()
            .prefix(".write-check")
            .tempfile_in(&self.tmp_dir)
            .map_err(unavailable)?;
        check_file.close().map_err(unavailable)?;

        Ok(())
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn locks_dir(&self) -> &Path {
        &self.locks_dir
    }

    pub fn tmp_dir(&self) -> &Path {
        &self.tmp_dir
    }

    /// Returns the path the entry for `key` is stored at.
    pub fn entry_path(&self, key: &CacheKey) -> PathBuf {
        self.entries_dir.join(key.cache_path())
    }

    /// Loads the entry stored for `key`.
    ///
    /// A missing entry is `Ok(None)`. An existing file that does not hold a valid entry for
    /// `key` is a [`CacheError::StoreCorruption`], and never silently treated as a miss.
    pub fn lookup(&self, key: &CacheKey) -> Result<Option<CacheEntry>, CacheError> {
        let path = self.entry_path(key);
        tracing::trace!("Trying entry at path {}", path.display());

        let read = || -> io::Result<(Vec<u8>, Option<SystemTime>)> {
            let mut file = fs::File::open(&path)?;
            // taken before reading, which may update it
            let accessed = file.metadata()?.accessed().ok();
            let mut bytes = Vec::new();
            file.read_to_end(&mut bytes)?;
            Ok((bytes, accessed))
        };
        let read = catch_not_found(read).map_err(|e| CacheError::io(&path, e))?;
        let Some((bytes, accessed)) = read else {
            return Ok(None);
        };

        let entry = CacheEntry::from_bytes(bytes)
            .map_err(|reason| CacheError::corrupt(&path, reason))?
            .with_last_accessed(accessed);
        if entry.header().key != key.to_hex() {
            return Err(CacheError::corrupt(
                &path,
                format!("entry belongs to key {}", entry.header().key),
            ));
        }

        metric!(
            time_raw("memo.file.size") = entry.payload().len() as u64,
            "hit" => "true",
            "producer" => key.producer().name(),
        );

        Ok(Some(entry))
    }

    /// Atomically writes `entry` as the entry of `key`, replacing any previous one.
    pub fn write(&self, key: &CacheKey, entry: &CacheEntry) -> Result<(), CacheError> {
        let path = self.entry_path(key);
        let bytes = entry.to_bytes().map_err(CacheError::PayloadEncoding)?;

        let mut temp_file = self.tempfile().map_err(|e| CacheError::io(&self.tmp_dir, e))?;
        temp_file
            .write_all(&bytes)
            .and_then(|_| temp_file.as_file().sync_all())
            .map_err(|e| CacheError::io(temp_file.path(), e))?;

        metric!(counter("memo.file.write") += 1, "producer" => key.producer().name());
        metric!(
            time_raw("memo.file.size") = entry.payload().len() as u64,
            "hit" => "false",
            "producer" => key.producer().name(),
        );

        tracing::debug!("Writing entry for {} to {}", key.producer(), path.display());
        persist_tempfile(temp_file, &path).map_err(|e| CacheError::io(&path, e))?;

        Ok(())
    }

    /// Deletes the entry of `key`, returning whether there was one.
    pub fn remove(&self, key: &CacheKey) -> Result<bool, CacheError> {
        let path = self.entry_path(key);
        let removed =
            catch_not_found(|| fs::remove_file(&path)).map_err(|e| CacheError::io(&path, e))?;
        Ok(removed.is_some())
    }

    /// Deletes all entries of `producer`, returning how many were removed.
    ///
    /// Each entry is removed while holding its key lock from `locks`, so computations that are
    /// in flight finish writing first. This blocks the current thread while waiting.
    pub fn remove_producer(
        &self,
        producer: &ProducerIdentity,
        locks: &LockManager,
    ) -> Result<usize, CacheError> {
        let dir = self.entries_dir.join(producer.cache_dir());

        let mut removed = 0;
        for entry in WalkDir::new(&dir).contents_first(true) {
            let entry = match entry {
                Ok(entry) => entry,
                Err(e) => {
                    if let Some(err) = e.io_error() {
                        if err.kind() == io::ErrorKind::NotFound {
                            continue;
                        }
                    }
                    let path = e.path().unwrap_or(&dir).to_path_buf();
                    return Err(CacheError::io(path, e.into()));
                }
            };

            let path = entry.path();
            let result = if entry.file_type().is_dir() {
                catch_not_found(|| fs::remove_dir(path))
            } else {
                let _lock = locks.acquire_blocking(&self.cache_path_of(path))?;
                catch_not_found(|| fs::remove_file(path))
                    .map(|r| r.inspect(|_| removed += 1))
            };
            match result {
                Ok(_) => {}
                // a concurrent writer just created a new entry in this directory
                Err(e) if entry.file_type().is_dir() && is_dir_not_empty(&e) => {}
                Err(e) => return Err(CacheError::io(path, e)),
            }
        }

        tracing::debug!("Removed {removed} entries of {producer}");
        Ok(removed)
    }

    /// The cache path of the entry file at `path`, which is the key of its lock.
    fn cache_path_of(&self, path: &Path) -> String {
        let relative = path.strip_prefix(&self.entries_dir).unwrap_or(path);
        let components: Vec<_> = relative
            .components()
            .map(|c| c.as_os_str().to_string_lossy())
            .collect();
        components.join("/")
    }

    /// Lists all valid entries in the store.
    ///
    /// Files that cannot be read as entries are skipped with a warning.
    pub fn entries(&self) -> Result<Vec<StoredEntry>, CacheError> {
        let mut entries = Vec::new();

        for entry in WalkDir::new(&self.entries_dir).min_depth(3).sort_by_file_name() {
            let entry = entry.map_err(|e| {
                let path = e.path().unwrap_or(&self.entries_dir).to_path_buf();
                CacheError::io(path, e.into())
            })?;
            if !entry.file_type().is_file() {
                continue;
            }

            let path = entry.path();
            let read = || -> io::Result<StoredEntry> {
                let file = fs::File::open(path)?;
                let len = file.metadata()?.len();
                let (header, payload_offset) = read_header(io::BufReader::new(file))?;
                Ok(StoredEntry {
                    path: path.to_path_buf(),
                    header,
                    payload_len: len.saturating_sub(payload_offset as u64),
                })
            };

            match catch_not_found(read) {
                Ok(Some(stored)) => entries.push(stored),
                Ok(None) => {}
                Err(e) if is_corruption(&e) => {
                    tracing::warn!(
                        error = &e as &dyn std::error::Error,
                        path = %path.display(),
                        "Skipping corrupt entry",
                    );
                }
                Err(e) => return Err(CacheError::io(path, e)),
            }
        }

        Ok(entries)
    }

    /// Removes temporary files older than `older_than`.
    ///
    /// Writers that crashed between creating and persisting a temporary file leave it behind.
    /// Younger files may still be in use by running writers.
    pub fn clear_tmp(&self, older_than: Duration) -> Result<usize, CacheError> {
        let read_dir = fs::read_dir(&self.tmp_dir).map_err(|e| CacheError::io(&self.tmp_dir, e))?;
        let now = SystemTime::now();

        let mut removed = 0;
        for entry in read_dir {
            let entry = entry.map_err(|e| CacheError::io(&self.tmp_dir, e))?;
            let path = entry.path();

            let expired = catch_not_found(|| {
                let modified = entry.metadata()?.modified()?;
                Ok(now.duration_since(modified).unwrap_or_default() >= older_than)
            })
            .map_err(|e| CacheError::io(&path, e))?;

            if expired == Some(true) {
                tracing::trace!("Removing temporary file {}", path.display());
                if catch_not_found(|| fs::remove_file(&path))
                    .map_err(|e| CacheError::io(&path, e))?
                    .is_some()
                {
                    removed += 1;
                }
            }
        }

        Ok(removed)
    }

    /// Create a new temporary file to use in the store.
    pub fn tempfile(&self) -> io::Result<NamedTempFile> {
        // operators may wipe `tmp/` at any time, retry after recreating it
        const MAX_RETRIES: usize = 2;
        let mut retries = 0;
        loop {
            retries += 1;

            if let Err(e) = fs::create_dir_all(&self.tmp_dir) {
                tracing::error!(
                    path = %self.tmp_dir.display(),
                    "Failed to create temp directory: {:?}",
                    e
                );
                if retries > MAX_RETRIES {
                    return Err(e);
                }
                continue;
            }

            match tempfile::Builder::new().prefix("tmp").tempfile_in(&self.tmp_dir) {
                Ok(temp_file) => return Ok(temp_file),
                Err(e) => {
                    tracing::error!(
                        path = %self.tmp_dir.display(),
                        "Failed to create temp file: {:?}",
                        e
                    );
                    if retries > MAX_RETRIES {
                        return Err(e);
                    }
                    continue;
                }
            }
        }
    }
}

/// Moves `temp_file` to `path`, creating the parent directories.
fn persist_tempfile(mut temp_file: NamedTempFile, path: &Path) -> io::Result<fs::File> {
    let parent = path
        .parent()
        .ok_or_else(|| io::Error::other("no parent directory to persist entry"))?;

    // `remove_producer` may delete the parent between creating and persisting
    const MAX_RETRIES: usize = 2;
    let mut retries = 0;
    let file = loop {
        retries += 1;

        if let Err(e) = fs::create_dir_all(parent) {
            tracing::error!(path = %parent.display(), "Failed to create entry directory: {:?}", e);
            if retries > MAX_RETRIES {
                return Err(e);
            }
            continue;
        }

        match temp_file.persist(path) {
            Ok(file) => break file,
            Err(e) => {
                temp_file = e.file;
                let err = e.error;
                tracing::error!(path = %path.display(), "Failed to persist entry: {:?}", err);
                if retries > MAX_RETRIES {
                    return Err(err);
                }
                continue;
            }
        }
    };

    Ok(file)
}

fn is_corruption(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::InvalidData | io::ErrorKind::UnexpectedEof
    )
}

fn is_dir_not_empty(e: &io::Error) -> bool {
    e.kind() == io::ErrorKind::DirectoryNotEmpty
}

pub(super) fn catch_not_found<F, R>(f: F) -> io::Result<Option<R>>
where
    F: FnOnce() -> io::Result<R>,
{
    match f() {
        Ok(x) => Ok(Some(x)),
        Err(e) => match e.kind() {
            io::ErrorKind::NotFound => Ok(None),
            _ => Err(e),
        },
    }
}
