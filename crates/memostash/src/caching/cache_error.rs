use std::io;
use std::path::PathBuf;
use std::time::Duration;

use humantime_serde::re::humantime::format_duration;
use thiserror::Error;

use super::{ArgumentSnapshot, CacheKey, ProducerIdentity};

/// An error raised by the caching machinery itself.
///
/// Errors raised by producers are never converted into this type, see [`MemoError`].
#[derive(Debug, Error)]
pub enum CacheError {
    /// The producer identity has no stable textual form.
    #[error("producer `{identity}` has no canonical identity: {reason}")]
    UnrepresentableProducer {
        identity: String,
        reason: &'static str,
    },
    /// An argument value has no canonical structural representation.
    #[error("argument `{name}` has no canonical representation: {reason}")]
    UnrepresentableArgument { name: String, reason: String },
    /// The call does not bind to the producer's parameters.
    #[error("invalid call: {0}")]
    InvalidCall(String),
    /// The external resource a staleness decider depends on could not be inspected.
    #[error("resource named by argument `{argument}` is unavailable: {reason}")]
    DeciderResourceUnavailable { argument: String, reason: String },
    /// A file exists at an entry location, but does not hold a valid entry.
    #[error("corrupt cache entry at `{}`: {reason}", path.display())]
    StoreCorruption { path: PathBuf, reason: String },
    /// The store root cannot be created or written to.
    #[error("cache namespace `{}` is unavailable", path.display())]
    NamespaceUnavailable {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    /// Waiting for the lock of a key took longer than the configured maximum.
    #[error("timed out after {} waiting for the cache lock", format_duration(*.0))]
    LockTimeout(Duration),
    /// A freshly computed result could not be serialized.
    #[error("failed to encode payload: {0}")]
    PayloadEncoding(#[source] FormatError),
    /// A blocking store operation did not run to completion.
    #[error("store task failed")]
    TaskFailed(#[from] tokio::task::JoinError),
    /// An unexpected file system error.
    #[error("i/o error at `{}`", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

impl CacheError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    pub(crate) fn corrupt(path: impl Into<PathBuf>, reason: impl Into<String>) -> Self {
        Self::StoreCorruption {
            path: path.into(),
            reason: reason.into(),
        }
    }
}

/// A payload could not be converted from or to bytes.
#[derive(Debug, Error)]
#[error("{format}: {reason}")]
pub struct FormatError {
    pub format: &'static str,
    pub reason: String,
}

impl FormatError {
    pub fn new(format: &'static str, reason: impl ToString) -> Self {
        Self {
            format,
            reason: reason.to_string(),
        }
    }
}

/// A [`CacheError`] together with the call it happened on.
///
/// Unexpected cache misses and failures are much easier to debug when the producer and its
/// arguments are known, so every error leaving the [`Memoizer`](super::Memoizer) carries both.
#[derive(Debug, Error)]
#[error("memoizing `{producer}` with {arguments} failed: {error}")]
pub struct MemoError {
    producer: String,
    arguments: String,
    #[source]
    error: CacheError,
}

impl MemoError {
    pub(crate) fn new(key: &CacheKey, arguments: &ArgumentSnapshot, error: CacheError) -> Self {
        Self {
            producer: key.producer().to_string(),
            arguments: arguments.render_bounded(),
            error,
        }
    }

    /// Creates an error for a call that never made it to a complete [`CacheKey`].
    pub(crate) fn unkeyed(
        producer: &ProducerIdentity,
        arguments: impl Into<String>,
        error: CacheError,
    ) -> Self {
        Self {
            producer: producer.to_string(),
            arguments: arguments.into(),
            error,
        }
    }

    /// The producer identity, formatted as `name@version`.
    pub fn producer(&self) -> &str {
        &self.producer
    }

    /// The rendered arguments of the failed call, cut off if they are long.
    pub fn arguments(&self) -> &str {
        &self.arguments
    }

    /// The underlying cache error.
    pub fn kind(&self) -> &CacheError {
        &self.error
    }

    pub fn into_inner(self) -> CacheError {
        self.error
    }
}
