use std::fmt::{self, Write};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use super::{ArgumentSnapshot, CacheError};

/// The version of the key derivation.
///
/// Bumping this invalidates every existing entry, as all keys change.
const KEY_FORMAT: &str = "memostash-key: v1";

/// The stable identity of a producer.
///
/// The identity must change whenever the behavior of the producer changes, otherwise results
/// computed by an older version will be served for the new one. The usual way of doing this is
/// to bump the `version` along with the code, or to derive it from a description of the
/// computation via [`ProducerIdentity::from_source`].
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ProducerIdentity {
    name: Arc<str>,
    version: Arc<str>,
}

impl ProducerIdentity {
    /// Creates a new identity from an explicit name and version tag.
    pub fn new(name: impl Into<String>, version: impl Into<String>) -> Result<Self, CacheError> {
        let name = name.into();
        let version = version.into();

        let invalid = |reason| CacheError::UnrepresentableProducer {
            identity: format!("{}@{}", name.escape_debug(), version.escape_debug()),
            reason,
        };

        if name.trim().is_empty() {
            return Err(invalid("the name is empty"));
        }
        if version.trim().is_empty() {
            return Err(invalid("the version is empty"));
        }
        if name.chars().chain(version.chars()).any(char::is_control) {
            return Err(invalid("contains control characters"));
        }

        Ok(Self {
            name: name.into(),
            version: version.into(),
        })
    }

    /// Creates an identity whose version is derived from a textual description of the computation.
    ///
    /// Any edit to `source` yields a new version, and thus invalidates all previous entries.
    pub fn from_source(name: impl Into<String>, source: &str) -> Result<Self, CacheError> {
        let digest = Sha256::digest(source.as_bytes());
        Self::new(name, format!("src-{}", hex::encode(&digest[..8])))
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn version(&self) -> &str {
        &self.version
    }

    /// Returns the human-readable text that the producer part of each key is derived from.
    fn metadata(&self) -> String {
        format!("producer: {}\nversion: {}\n", self.name, self.version)
    }

    /// Returns the directory all entries of this producer are grouped in.
    pub fn cache_dir(&self) -> String {
        let digest = Sha256::digest(self.metadata().as_bytes());
        hex::encode(&digest[..8])
    }
}

impl fmt::Display for ProducerIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.name, self.version)
    }
}

/// The fingerprint of a single producer call.
#[derive(Debug, Clone, Eq)]
pub struct CacheKey {
    producer: ProducerIdentity,
    metadata: Arc<str>,
    hash: [u8; 32],
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.cache_path())
    }
}

impl PartialEq for CacheKey {
    fn eq(&self, other: &Self) -> bool {
        self.hash == other.hash
    }
}

impl std::hash::Hash for CacheKey {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.hash.hash(state);
    }
}

impl CacheKey {
    /// Derives the [`CacheKey`] of calling `producer` with `arguments`.
    ///
    /// Both inputs are validated on construction, so deriving the key itself cannot fail.
    pub fn fingerprint(producer: &ProducerIdentity, arguments: &ArgumentSnapshot) -> Self {
        Self::builder(producer, arguments).build()
    }

    /// Create a [`CacheKeyBuilder`] that can be used to mix additional stable context into the key.
    pub fn builder(producer: &ProducerIdentity, arguments: &ArgumentSnapshot) -> CacheKeyBuilder {
        let mut metadata = format!("{KEY_FORMAT}\n{}\narguments:\n", producer.metadata());
        for (name, value) in arguments.iter() {
            // `serde_json` escapes control characters, so every argument occupies a single line
            let _ = writeln!(metadata, "{name}: {value}");
        }

        CacheKeyBuilder {
            producer: producer.clone(),
            metadata,
        }
    }

    /// Returns the human-readable metadata that forms the basis of the [`CacheKey`].
    pub fn metadata(&self) -> &str {
        &self.metadata
    }

    pub fn producer(&self) -> &ProducerIdentity {
        &self.producer
    }

    /// Returns the full hex-encoded digest.
    pub fn to_hex(&self) -> String {
        hex::encode(self.hash)
    }

    /// Returns the relative path for this cache key.
    ///
    /// The path is grouped by producer, followed by the sha-256 hash of the key, hex-formatted
    /// like so: `$producer/aa/bbccddeeff...`
    pub fn cache_path(&self) -> String {
        let mut path = format!("{}/{:02x}/", self.producer.cache_dir(), self.hash[0]);
        for b in &self.hash[1..] {
            let _ = write!(path, "{b:02x}");
        }
        path
    }
}

/// A builder for [`CacheKey`]s.
///
/// This builder implements the [`Write`](std::fmt::Write) trait, and the intention of it is to
/// accept human readable, but most importantly **stable**, input.
/// This input in then being hashed to form the [`CacheKey`], and is serialized alongside
/// the cache entries to help debugging.
pub struct CacheKeyBuilder {
    producer: ProducerIdentity,
    metadata: String,
}

impl CacheKeyBuilder {
    /// Finalize the [`CacheKey`].
    pub fn build(self) -> CacheKey {
        let hash = Sha256::digest(&self.metadata).into();

        CacheKey {
            producer: self.producer,
            metadata: self.metadata.into(),
            hash,
        }
    }
}

impl fmt::Write for CacheKeyBuilder {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        self.metadata.write_str(s)
    }
}
