//! Durable memoization of expensive computations.
//!
//! `memostash` caches the result of a *producer* on the file system, keyed by a fingerprint of
//! the producer's identity and the arguments of a call. Every hit is re-validated by a pluggable
//! [`StalenessDecider`], and recomputation of a single key is serialized across threads and
//! processes sharing the same store root.
//!
//! See the [`caching`] module for a walkthrough of the moving parts.

#[macro_use]
pub mod metrics;

pub mod caching;
pub mod config;
pub mod logging;

pub use caching::{
    AgeReference, AlwaysFresh, ArgumentSnapshot, CacheEntry, CacheError, CacheKey,
    CacheKeyBuilder, CallArgs, ComparisonToken, DeciderState, EntryStore, FileComparisonDecider,
    Json, LockManager, MaxAgeDecider, MemoError, Memoizer, PayloadFormat, Producer,
    ProducerIdentity, RawBytes, StalenessDecider, Yaml, Zstd,
};
pub use config::Config;
