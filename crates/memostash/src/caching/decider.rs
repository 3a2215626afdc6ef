use std::fmt;
use std::fs;
use std::io;
use std::path::PathBuf;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use sha2::{Digest, Sha256};

use super::{ArgumentSnapshot, CacheEntry, CacheError};

/// Opaque metadata a [`StalenessDecider`] persists alongside each entry.
///
/// The state is created when a result is computed, handed back unchanged on every later lookup
/// of the same entry, and replaced wholesale when the entry is recomputed.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DeciderState(Value);

impl DeciderState {
    /// The state of deciders that do not need to remember anything.
    pub fn empty() -> Self {
        Self(Value::Null)
    }

    pub fn new(value: Value) -> Self {
        Self(value)
    }

    /// Interprets the state as a `T`, returning `None` if it has a different shape.
    pub fn parse<T: DeserializeOwned>(&self) -> Option<T> {
        T::deserialize(&self.0).ok()
    }

    pub fn as_value(&self) -> &Value {
        &self.0
    }
}

/// Decides whether an existing entry must be recomputed even though its key still matches.
///
/// Deciders are consulted on every hit, which allows cached results to depend on inputs that are
/// not part of the key, like the contents of a file that an argument refers to.
///
/// [`is_stale`](Self::is_stale) must not have side effects. A stored state the decider cannot
/// interpret should be reported as stale.
pub trait StalenessDecider: fmt::Debug + Send + Sync {
    /// Captures the state that a result computed right now depends on.
    fn capture_state(&self, arguments: &ArgumentSnapshot) -> Result<DeciderState, CacheError>;

    /// Compares the current state with the one stored alongside an entry.
    fn is_stale(
        &self,
        arguments: &ArgumentSnapshot,
        stored: &DeciderState,
    ) -> Result<bool, CacheError>;

    /// Like [`is_stale`](Self::is_stale), with access to the whole stored entry.
    ///
    /// This is what the [`Memoizer`](super::Memoizer) calls. Deciders depending on metadata of
    /// the entry itself override it.
    fn is_entry_stale(
        &self,
        arguments: &ArgumentSnapshot,
        entry: &CacheEntry,
    ) -> Result<bool, CacheError> {
        self.is_stale(arguments, entry.decider_state())
    }
}

/// Entries never go stale.
#[derive(Debug, Clone, Copy, Default)]
pub struct AlwaysFresh;

impl StalenessDecider for AlwaysFresh {
    fn capture_state(&self, _arguments: &ArgumentSnapshot) -> Result<DeciderState, CacheError> {
        Ok(DeciderState::empty())
    }

    fn is_stale(
        &self,
        _arguments: &ArgumentSnapshot,
        _stored: &DeciderState,
    ) -> Result<bool, CacheError> {
        Ok(false)
    }
}

/// What a [`FileComparisonDecider`] compares.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ComparisonToken {
    /// The modification time of the file, with nanosecond precision where available.
    #[default]
    ModifiedTime,
    /// The SHA-256 digest of the file contents.
    ///
    /// This reads the whole file on every lookup, but survives `touch` and copies that do not
    /// preserve timestamps.
    ContentDigest,
}

/// Recomputes entries whenever the file named by one of the arguments changes.
#[derive(Debug, Clone)]
pub struct FileComparisonDecider {
    argument: String,
    token: ComparisonToken,
}

impl FileComparisonDecider {
    /// Watches the file whose path is passed as `argument`, comparing modification times.
    pub fn new(argument: impl Into<String>) -> Self {
        Self {
            argument: argument.into(),
            token: ComparisonToken::ModifiedTime,
        }
    }

    pub fn with_token(mut self, token: ComparisonToken) -> Self {
        self.token = token;
        self
    }

    fn unavailable(&self, reason: impl ToString) -> CacheError {
        CacheError::DeciderResourceUnavailable {
            argument: self.argument.clone(),
            reason: reason.to_string(),
        }
    }

    fn resource_path(&self, arguments: &ArgumentSnapshot) -> Result<PathBuf, CacheError> {
        match arguments.value(&self.argument) {
            Some(Value::String(path)) => Ok(PathBuf::from(path)),
            Some(other) => Err(self.unavailable(format!("expected a path, got {other}"))),
            None => Err(self.unavailable("argument not passed")),
        }
    }

    fn current_token(&self, arguments: &ArgumentSnapshot) -> Result<Value, CacheError> {
        let path = self.resource_path(arguments)?;
        let read = || -> io::Result<Value> {
            Ok(match self.token {
                ComparisonToken::ModifiedTime => {
                    let modified = fs::metadata(&path)?.modified()?;
                    json!({ "modified": modified_nanos(modified) })
                }
                ComparisonToken::ContentDigest => {
                    let mut file = fs::File::open(&path)?;
                    let mut hasher = Sha256::new();
                    io::copy(&mut file, &mut hasher)?;
                    json!({ "sha256": hex::encode(hasher.finalize()) })
                }
            })
        };
        read().map_err(|e| self.unavailable(format!("`{}`: {e}", path.display())))
    }
}

/// Renders a timestamp as a decimal number of nanoseconds relative to the unix epoch.
///
/// A string is used as JSON numbers cannot hold the full range.
fn modified_nanos(time: SystemTime) -> String {
    match time.duration_since(UNIX_EPOCH) {
        Ok(since) => since.as_nanos().to_string(),
        Err(e) => format!("-{}", e.duration().as_nanos()),
    }
}

impl StalenessDecider for FileComparisonDecider {
    fn capture_state(&self, arguments: &ArgumentSnapshot) -> Result<DeciderState, CacheError> {
        self.current_token(arguments).map(DeciderState::new)
    }

    fn is_stale(
        &self,
        arguments: &ArgumentSnapshot,
        stored: &DeciderState,
    ) -> Result<bool, CacheError> {
        let current = self.current_token(arguments)?;
        Ok(&current != stored.as_value())
    }
}

#[derive(Debug, Deserialize)]
struct CaptureTime {
    captured_at_ms: u64,
}

fn captured_at(stored: &DeciderState) -> Option<SystemTime> {
    let CaptureTime { captured_at_ms } = stored.parse()?;
    Some(UNIX_EPOCH + Duration::from_millis(captured_at_ms))
}

/// What a [`MaxAgeDecider`] measures the age of an entry from.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum AgeReference {
    /// The time the result was computed.
    #[default]
    Computed,
    /// The last time the entry was loaded, or when it was computed if that is later.
    ///
    /// This relies on file access times. Mounts with `relatime` advance them at most once a day,
    /// and `noatime` mounts never do, in which case this behaves like [`Computed`](Self::Computed).
    LastAccess,
}

/// Recomputes entries once they are older than a fixed age.
///
/// Entries that should never expire need no age limit at all, see [`AlwaysFresh`].
#[derive(Debug, Clone, Copy)]
pub struct MaxAgeDecider {
    max_age: Duration,
    reference: AgeReference,
}

impl MaxAgeDecider {
    pub fn new(max_age: Duration) -> Self {
        Self {
            max_age,
            reference: AgeReference::Computed,
        }
    }

    /// Recomputes entries that were not used for `max_idle`.
    pub fn since_last_access(max_idle: Duration) -> Self {
        Self {
            max_age: max_idle,
            reference: AgeReference::LastAccess,
        }
    }

    fn is_expired(&self, since: SystemTime) -> bool {
        match SystemTime::now().duration_since(since) {
            Ok(age) => age >= self.max_age,
            // an entry from the future has a clock problem, rather recompute it
            Err(_) => true,
        }
    }
}

impl StalenessDecider for MaxAgeDecider {
    fn capture_state(&self, _arguments: &ArgumentSnapshot) -> Result<DeciderState, CacheError> {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default();
        let captured_at_ms = now.as_millis() as u64;
        Ok(DeciderState::new(json!({ "captured_at_ms": captured_at_ms })))
    }

    fn is_stale(
        &self,
        _arguments: &ArgumentSnapshot,
        stored: &DeciderState,
    ) -> Result<bool, CacheError> {
        Ok(captured_at(stored).is_none_or(|captured_at| self.is_expired(captured_at)))
    }

    fn is_entry_stale(
        &self,
        arguments: &ArgumentSnapshot,
        entry: &CacheEntry,
    ) -> Result<bool, CacheError> {
        let stored = entry.decider_state();
        match (self.reference, entry.last_accessed()) {
            (AgeReference::LastAccess, Some(accessed)) => Ok(captured_at(stored)
                .is_none_or(|captured_at| self.is_expired(accessed.max(captured_at)))),
            _ => self.is_stale(arguments, stored),
        }
    }
}
