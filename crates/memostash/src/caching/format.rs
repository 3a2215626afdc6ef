//! Conversion of computed results to and from the bytes stored in an entry.

use std::fmt;
use std::marker::PhantomData;

use serde::Serialize;
use serde::de::DeserializeOwned;

use super::FormatError;

/// Serializes the results of a producer.
///
/// Formats have to round-trip: decoding the output of `encode` must yield an equivalent item.
pub trait PayloadFormat: Send + Sync {
    type Item: Send;

    /// A short name used in logs and error messages.
    fn name(&self) -> &'static str;

    fn encode(&self, item: &Self::Item) -> Result<Vec<u8>, FormatError>;

    fn decode(&self, bytes: &[u8]) -> Result<Self::Item, FormatError>;
}

/// Stores `T` as JSON.
pub struct Json<T>(PhantomData<fn() -> T>);

impl<T> Json<T> {
    pub fn new() -> Self {
        Self(PhantomData)
    }
}

impl<T> Default for Json<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Clone for Json<T> {
    fn clone(&self) -> Self {
        Self::new()
    }
}

impl<T> fmt::Debug for Json<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Json")
    }
}

impl<T> PayloadFormat for Json<T>
where
    T: Serialize + DeserializeOwned + Send,
{
    type Item = T;

    fn name(&self) -> &'static str {
        "json"
    }

    fn encode(&self, item: &T) -> Result<Vec<u8>, FormatError> {
        serde_json::to_vec(item).map_err(|e| FormatError::new(self.name(), e))
    }

    fn decode(&self, bytes: &[u8]) -> Result<T, FormatError> {
        serde_json::from_slice(bytes).map_err(|e| FormatError::new(self.name(), e))
    }
}

/// Stores `T` as YAML.
///
/// Unlike JSON, YAML can represent non-finite floats.
pub struct Yaml<T>(PhantomData<fn() -> T>);

impl<T> Yaml<T> {
    pub fn new() -> Self {
        Self(PhantomData)
    }
}

impl<T> Default for Yaml<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Clone for Yaml<T> {
    fn clone(&self) -> Self {
        Self::new()
    }
}

impl<T> fmt::Debug for Yaml<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Yaml")
    }
}

impl<T> PayloadFormat for Yaml<T>
where
    T: Serialize + DeserializeOwned + Send,
{
    type Item = T;

    fn name(&self) -> &'static str {
        "yaml"
    }

    fn encode(&self, item: &T) -> Result<Vec<u8>, FormatError> {
        serde_yaml::to_string(item)
            .map(String::into_bytes)
            .map_err(|e| FormatError::new(self.name(), e))
    }

    fn decode(&self, bytes: &[u8]) -> Result<T, FormatError> {
        serde_yaml::from_slice(bytes).map_err(|e| FormatError::new(self.name(), e))
    }
}

/// Stores producer output that already is a byte buffer as is.
#[derive(Debug, Clone, Copy, Default)]
pub struct RawBytes;

impl PayloadFormat for RawBytes {
    type Item = Vec<u8>;

    fn name(&self) -> &'static str {
        "raw"
    }

    fn encode(&self, item: &Vec<u8>) -> Result<Vec<u8>, FormatError> {
        Ok(item.clone())
    }

    fn decode(&self, bytes: &[u8]) -> Result<Vec<u8>, FormatError> {
        Ok(bytes.to_vec())
    }
}

/// Compresses the output of another format with zstd.
#[derive(Debug, Clone)]
pub struct Zstd<F> {
    inner: F,
    level: i32,
}

impl<F> Zstd<F> {
    pub fn new(inner: F) -> Self {
        Self {
            inner,
            level: zstd::DEFAULT_COMPRESSION_LEVEL,
        }
    }

    pub fn with_level(mut self, level: i32) -> Self {
        self.level = level;
        self
    }
}

impl<F: PayloadFormat> PayloadFormat for Zstd<F> {
    type Item = F::Item;

    fn name(&self) -> &'static str {
        "zstd"
    }

    fn encode(&self, item: &F::Item) -> Result<Vec<u8>, FormatError> {
        let bytes = self.inner.encode(item)?;
        zstd::bulk::compress(&bytes, self.level).map_err(|e| FormatError::new(self.name(), e))
    }

    fn decode(&self, bytes: &[u8]) -> Result<F::Item, FormatError> {
        let bytes = zstd::stream::decode_all(bytes).map_err(|e| FormatError::new(self.name(), e))?;
        self.inner.decode(&bytes)
    }
}
