use std::io::{self, Read};
use std::time::SystemTime;

use serde::{Deserialize, Serialize};

use super::{ArgumentSnapshot, CacheKey, DeciderState, FormatError, ProducerIdentity};

/// The magic bytes every entry file starts with.
const MAGIC: &[u8; 10] = b"MEMOSTASH\0";

/// The version of the entry envelope.
const FORMAT_VERSION: u32 = 1;

/// Upper bound for the header size, enforced when writing and when reading entries.
pub(crate) const MAX_HEADER_LEN: u32 = 64 * 1024 * 1024;

const PREAMBLE_LEN: usize = MAGIC.len() + 4 + 4;

/// Everything stored about an entry besides its payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntryHeader {
    /// The hex-encoded digest of the [`CacheKey`].
    pub key: String,
    pub producer: ProducerIdentity,
    pub arguments: ArgumentSnapshot,
    pub decider_state: DeciderState,
    pub created_at: SystemTime,
}

/// A computed result as it is persisted by the [`EntryStore`](super::EntryStore).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheEntry {
    header: EntryHeader,
    payload: Vec<u8>,
    last_accessed: Option<SystemTime>,
}

impl CacheEntry {
    /// Creates an entry for a freshly computed payload.
    pub fn new(
        key: &CacheKey,
        arguments: &ArgumentSnapshot,
        decider_state: DeciderState,
        payload: Vec<u8>,
    ) -> Self {
        Self {
            header: EntryHeader {
                key: key.to_hex(),
                producer: key.producer().clone(),
                arguments: arguments.clone(),
                decider_state,
                created_at: SystemTime::now(),
            },
            payload,
            last_accessed: None,
        }
    }

    pub fn header(&self) -> &EntryHeader {
        &self.header
    }

    pub fn decider_state(&self) -> &DeciderState {
        &self.header.decider_state
    }

    pub fn created_at(&self) -> SystemTime {
        self.header.created_at
    }

    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    pub fn into_payload(self) -> Vec<u8> {
        self.payload
    }

    /// When the entry file was accessed before it was loaded, if the file system tracks this.
    ///
    /// Entries that were not loaded from an [`EntryStore`](super::EntryStore) have no access time.
    pub fn last_accessed(&self) -> Option<SystemTime> {
        self.last_accessed
    }

    pub(crate) fn with_last_accessed(mut self, last_accessed: Option<SystemTime>) -> Self {
        self.last_accessed = last_accessed;
        self
    }

    /// Serializes the entry into its on-disk envelope.
    ///
    /// Headers larger than [`MAX_HEADER_LEN`] are rejected, as they could never be read back.
    pub(crate) fn to_bytes(&self) -> Result<Vec<u8>, FormatError> {
        let header =
            serde_json::to_vec(&self.header).map_err(|e| FormatError::new("envelope", e))?;
        if header.len() > MAX_HEADER_LEN as usize {
            return Err(FormatError::new(
                "envelope",
                format!(
                    "header of {} bytes exceeds the limit of {MAX_HEADER_LEN} bytes",
                    header.len()
                ),
            ));
        }

        let mut bytes = Vec::with_capacity(PREAMBLE_LEN + header.len() + self.payload.len());
        bytes.extend_from_slice(MAGIC);
        bytes.extend_from_slice(&FORMAT_VERSION.to_le_bytes());
        bytes.extend_from_slice(&(header.len() as u32).to_le_bytes());
        bytes.extend_from_slice(&header);
        bytes.extend_from_slice(&self.payload);
        Ok(bytes)
    }

    /// Parses an envelope, returning a description of the problem if it is invalid.
    pub(crate) fn from_bytes(mut bytes: Vec<u8>) -> Result<Self, String> {
        let (header, header_end) = parse_header(&bytes)?;
        let payload = bytes.split_off(header_end);
        Ok(Self {
            header,
            payload,
            last_accessed: None,
        })
    }
}

/// Parses the header of an envelope, returning it along with the offset of the payload.
pub(crate) fn parse_header(bytes: &[u8]) -> Result<(EntryHeader, usize), String> {
    if bytes.len() < PREAMBLE_LEN {
        return Err(format!("truncated envelope ({} bytes)", bytes.len()));
    }
    let (magic, rest) = bytes.split_at(MAGIC.len());
    if magic != MAGIC {
        return Err("invalid magic".into());
    }

    let (version, rest) = rest.split_at(4);
    let version = u32::from_le_bytes([version[0], version[1], version[2], version[3]]);
    if version != FORMAT_VERSION {
        return Err(format!("unsupported envelope version {version}"));
    }

    let (header_len, rest) = rest.split_at(4);
    let header_len = u32::from_le_bytes([header_len[0], header_len[1], header_len[2], header_len[3]]);
    if header_len > MAX_HEADER_LEN || header_len as usize > rest.len() {
        return Err(format!("invalid header length {header_len}"));
    }

    let header = serde_json::from_slice(&rest[..header_len as usize])
        .map_err(|e| format!("invalid header: {e}"))?;
    Ok((header, PREAMBLE_LEN + header_len as usize))
}

/// Reads just the header of an envelope from `reader`.
///
/// Invalid envelopes are reported as [`io::ErrorKind::InvalidData`].
pub(crate) fn read_header(mut reader: impl Read) -> io::Result<(EntryHeader, usize)> {
    let mut buf = vec![0; PREAMBLE_LEN];
    reader.read_exact(&mut buf)?;

    let header_len = u32::from_le_bytes([buf[14], buf[15], buf[16], buf[17]]);
    if buf.starts_with(MAGIC) && header_len <= MAX_HEADER_LEN {
        buf.resize(PREAMBLE_LEN + header_len as usize, 0);
        reader.read_exact(&mut buf[PREAMBLE_LEN..])?;
    }

    parse_header(&buf).map_err(|reason| io::Error::new(io::ErrorKind::InvalidData, reason))
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn entry() -> (CacheKey, CacheEntry) {
        let producer = ProducerIdentity::new("load_table", "3").unwrap();
        let args = ArgumentSnapshot::new().with("path", "a.csv").unwrap();
        let key = CacheKey::fingerprint(&producer, &args);
        let entry = CacheEntry::new(
            &key,
            &args,
            DeciderState::new(json!({ "modified": "1" })),
            b"payload".to_vec(),
        );
        (key, entry)
    }

    #[test]
    fn test_envelope() {
        let (key, entry) = entry();
        let bytes = entry.to_bytes().unwrap();
        assert!(bytes.starts_with(b"MEMOSTASH\0\x01\0\0\0"));
        assert!(bytes.ends_with(b"payload"));

        let parsed = CacheEntry::from_bytes(bytes).unwrap();
        assert_eq!(parsed, entry);
        assert_eq!(parsed.header().key, key.to_hex());
        assert_eq!(parsed.payload(), b"payload");
    }

    #[test]
    fn test_empty_payload() {
        let producer = ProducerIdentity::new("noop", "1").unwrap();
        let args = ArgumentSnapshot::new();
        let key = CacheKey::fingerprint(&producer, &args);
        let entry = CacheEntry::new(&key, &args, DeciderState::empty(), Vec::new());

        let parsed = CacheEntry::from_bytes(entry.to_bytes().unwrap()).unwrap();
        assert!(parsed.payload().is_empty());
    }

    #[test]
    fn test_invalid_envelopes() {
        let (_, entry) = entry();
        let valid = entry.to_bytes().unwrap();

        let err = CacheEntry::from_bytes(Vec::new()).unwrap_err();
        assert!(err.contains("truncated"), "{err}");

        let mut wrong_magic = valid.clone();
        wrong_magic[0] = b'X';
        assert_eq!(CacheEntry::from_bytes(wrong_magic).unwrap_err(), "invalid magic");

        let mut wrong_version = valid.clone();
        wrong_version[10] = 2;
        assert_eq!(
            CacheEntry::from_bytes(wrong_version).unwrap_err(),
            "unsupported envelope version 2"
        );

        let mut huge_header = valid.clone();
        huge_header[14..18].copy_from_slice(&u32::MAX.to_le_bytes());
        assert!(CacheEntry::from_bytes(huge_header).is_err());

        let truncated = valid[..PREAMBLE_LEN + 5].to_vec();
        assert!(CacheEntry::from_bytes(truncated).is_err());

        let mut garbled = valid.clone();
        garbled[PREAMBLE_LEN] = b'[';
        let err = CacheEntry::from_bytes(garbled).unwrap_err();
        assert!(err.starts_with("invalid header"), "{err}");

        let err = read_header(&valid[..PREAMBLE_LEN + 5]).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::UnexpectedEof);
    }

    #[test]
    fn test_oversized_header() {
        let producer = ProducerIdentity::new("load_table", "3").unwrap();
        let path = "x".repeat(MAX_HEADER_LEN as usize);
        let args = ArgumentSnapshot::new().with("path", &path).unwrap();
        let key = CacheKey::fingerprint(&producer, &args);
        let entry = CacheEntry::new(&key, &args, DeciderState::empty(), b"payload".to_vec());

        let err = entry.to_bytes().unwrap_err();
        assert_eq!(err.format, "envelope");
        assert!(err.reason.contains("exceeds the limit"), "{err}");
    }

    #[test]
    fn test_read_header() {
        let (key, entry) = entry();
        let bytes = entry.to_bytes().unwrap();

        let (header, payload_offset) = read_header(&bytes[..]).unwrap();
        assert_eq!(&header, entry.header());
        assert_eq!(header.key, key.to_hex());
        assert_eq!(&bytes[payload_offset..], b"payload");
    }
}
