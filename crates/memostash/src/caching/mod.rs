//! # Memoization infrastructure
//!
//! This module contains everything that is needed to persist the results of expensive
//! computations, and to serve them again for equivalent calls. It also contains an explanation of
//! how the parts fit together.
//!
//! ## Overview
//!
//! A call to a [`Memoizer`] goes through the following steps:
//!
//! - The call is bound to the parameters of its [`Producer`], yielding a canonical
//!   [`ArgumentSnapshot`]. Positional and keyword calls binding the same values are equivalent.
//! - The producer identity and the snapshot are fingerprinted into a [`CacheKey`].
//! - The [`EntryStore`] is consulted. A found entry is validated by the [`StalenessDecider`], and
//!   returned if it is still valid.
//! - Otherwise, the [`LockManager`] lock of the key is taken, and the store is checked again, as
//!   another caller might have computed the result in the meantime.
//! - Only then the producer is invoked, and its result is encoded and written to the store.
//!
//! This guarantees that at most one computation per key is in flight, across all tasks and
//! processes that share a store root.
//!
//! ### Metrics
//!
//! Each metric is tagged with the `producer` name. Here is a list of metrics that are collected:
//!
//! - `memo.access`: All calls.
//! - `memo.hit`: Calls served by a valid entry without taking the lock.
//! - `memo.stale`: Entries that were found, but rejected by the decider.
//! - `memo.miss`: Calls without any entry.
//! - `memo.recheck.hit`: Calls served by an entry that appeared while waiting for the lock.
//! - `memo.computation`: Actual producer invocations.
//! - `memo.file.write`: The number of entries being written.
//!   This should match `memo.computation`, unless decider state could not be captured.
//! - `memo.file.size`: A histogram for the payload size (in bytes) of loaded / written entries.
//! - `memo.lock.wait`: The time spent acquiring key locks.
//! - `memo.lock.timeout`: Lock acquisitions that exceeded the configured timeout.
//!
//! ## [`CacheKey`]
//!
//! The [`CacheKey`] is derived from human-readable metadata that contains the producer identity
//! and one line per argument. This metadata is SHA-256 hashed to form the path of the entry, and
//! stored alongside it to help debugging.
//!
//! **NOTE**: The [`ProducerIdentity`] version must change whenever the behavior of the producer
//! changes. Otherwise, results of the old version will be served for the new one.
//!
//! ## [`StalenessDecider`]
//!
//! A key only captures the arguments of a call. Results often depend on more than that, for
//! example on the contents of a file whose path is an argument. Deciders capture such state at
//! computation time, and compare it with the current state on every hit.
//! [`FileComparisonDecider`] and [`MaxAgeDecider`] cover the common cases.
//!
//! ## [`CacheError`]
//!
//! Errors of the producers themselves are never cached and are returned verbatim. [`CacheError`]
//! covers failures of the memoization itself, and is wrapped into a [`MemoError`] that names the
//! failing call. Notably, an entry that exists but cannot be read is reported as
//! [`CacheError::StoreCorruption`] instead of being silently recomputed.

mod binding;
mod cache_error;
mod cache_key;
mod decider;
mod entry;
mod format;
mod fs;
mod lock;
mod memoizer;
#[cfg(test)]
mod tests;

pub use binding::{ArgumentSnapshot, CallArgs, Producer};
pub use cache_error::{CacheError, FormatError, MemoError};
pub use cache_key::{CacheKey, CacheKeyBuilder, ProducerIdentity};
pub use decider::{
    AgeReference, AlwaysFresh, ComparisonToken, DeciderState, FileComparisonDecider,
    MaxAgeDecider, StalenessDecider,
};
pub use entry::{CacheEntry, EntryHeader};
pub use format::{Json, PayloadFormat, RawBytes, Yaml, Zstd};
pub use fs::{EntryStore, StoredEntry};
pub use lock::{KeyLock, LockManager};
pub use memoizer::Memoizer;
