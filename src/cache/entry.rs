//! Cache entries and their on-disk record format
//!
//! Each entry is one file:
//!
//! ```text
//! ┌───────┬──────────────┬──────────────────────┬───────────┐
//! │ FRC1  │ header len   │ header (JSON)        │ payload   │
//! │ 4 B   │ u32 LE       │ key, ns, size, ...   │ size B    │
//! └───────┴──────────────┴──────────────────────┴───────────┘
//! ```
//!
//! `last_accessed_at` is not part of the header; it lives in the file's
//! modification time so a read hit never rewrites the record.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::error::{CacheError, Result};
use super::key::digest_bytes;

/// Record magic bytes
pub const RECORD_MAGIC: [u8; 4] = *b"FRC1";
/// Fixed prefix: magic + header length
pub const RECORD_PREFIX_LEN: usize = 8;
/// Upper bound on a record header; anything larger is corruption
pub const MAX_HEADER_LEN: usize = 64 * 1024;

/// Logical cache partition, each with its own size accounting
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Namespace {
    /// Parsed documents (PDF, Office, text)
    ParsedDocument,
    /// Images and their recognised text
    ExtractedImage,
    /// Archives and their extracted entries
    ArchiveEntry,
}

impl Namespace {
    pub const ALL: [Namespace; 3] = [
        Namespace::ParsedDocument,
        Namespace::ExtractedImage,
        Namespace::ArchiveEntry,
    ];

    /// Directory name under the cache root
    pub fn dir_name(&self) -> &'static str {
        match self {
            Self::ParsedDocument => "parsed",
            Self::ExtractedImage => "image",
            Self::ArchiveEntry => "archive",
        }
    }

    pub(crate) fn index(&self) -> usize {
        match self {
            Self::ParsedDocument => 0,
            Self::ExtractedImage => 1,
            Self::ArchiveEntry => 2,
        }
    }
}

impl fmt::Display for Namespace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.dir_name())
    }
}

impl FromStr for Namespace {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "parsed" | "parsed_document" | "document" => Ok(Self::ParsedDocument),
            "image" | "extracted_image" => Ok(Self::ExtractedImage),
            "archive" | "archive_entry" => Ok(Self::ArchiveEntry),
            _ => Err(format!(
                "Unknown cache namespace '{s}'. Expected: parsed, image, archive"
            )),
        }
    }
}

/// Metadata for one cached artifact
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntryMeta {
    pub key: String,
    pub namespace: Namespace,
    pub size_bytes: u64,
    pub created_at: DateTime<Utc>,
    pub last_accessed_at: DateTime<Utc>,
    /// SHA-256 of the payload
    pub checksum: String,
}

/// A cached artifact with its payload
#[derive(Debug, Clone)]
pub struct CacheEntry {
    pub meta: EntryMeta,
    pub payload: Vec<u8>,
}

/// Serialized record header
#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct RecordHeader {
    pub key: String,
    pub namespace: Namespace,
    pub size_bytes: u64,
    pub created_at: DateTime<Utc>,
    pub checksum: String,
}

impl RecordHeader {
    pub fn into_meta(self, last_accessed_at: DateTime<Utc>) -> EntryMeta {
        EntryMeta {
            key: self.key,
            namespace: self.namespace,
            size_bytes: self.size_bytes,
            created_at: self.created_at,
            last_accessed_at,
            checksum: self.checksum,
        }
    }
}

impl From<&EntryMeta> for RecordHeader {
    fn from(meta: &EntryMeta) -> Self {
        Self {
            key: meta.key.clone(),
            namespace: meta.namespace,
            size_bytes: meta.size_bytes,
            created_at: meta.created_at,
            checksum: meta.checksum.clone(),
        }
    }
}

impl EntryMeta {
    /// Metadata for a payload about to be written
    pub fn for_payload(key: &str, namespace: Namespace, payload: &[u8]) -> Self {
        let now = Utc::now();
        Self {
            key: key.to_string(),
            namespace,
            size_bytes: payload.len() as u64,
            created_at: now,
            last_accessed_at: now,
            checksum: digest_bytes(payload).into_hex(),
        }
    }
}

/// Encode a full record
pub(crate) fn encode_record(meta: &EntryMeta, payload: &[u8]) -> Result<Vec<u8>> {
    let header = serde_json::to_vec(&RecordHeader::from(meta))?;
    let mut out = Vec::with_capacity(RECORD_PREFIX_LEN + header.len() + payload.len());
    out.extend_from_slice(&RECORD_MAGIC);
    out.extend_from_slice(&(header.len() as u32).to_le_bytes());
    out.extend_from_slice(&header);
    out.extend_from_slice(payload);
    Ok(out)
}

/// Validate the fixed prefix and return the header length
pub(crate) fn decode_prefix(prefix: &[u8]) -> Result<usize> {
    if prefix.len() < RECORD_PREFIX_LEN || prefix[..4] != RECORD_MAGIC {
        return Err(CacheError::Corrupted("bad record magic".to_string()));
    }
    let len = u32::from_le_bytes([prefix[4], prefix[5], prefix[6], prefix[7]]) as usize;
    if len == 0 || len > MAX_HEADER_LEN {
        return Err(CacheError::Corrupted(format!("bad header length {len}")));
    }
    Ok(len)
}

/// Decode and verify a full record
pub(crate) fn decode_record(
    bytes: &[u8],
    last_accessed_at: DateTime<Utc>,
) -> Result<CacheEntry> {
    let header_len = decode_prefix(bytes)?;
    let body_start = RECORD_PREFIX_LEN + header_len;
    if bytes.len() < body_start {
        return Err(CacheError::Corrupted("truncated header".to_string()));
    }

    let header: RecordHeader = serde_json::from_slice(&bytes[RECORD_PREFIX_LEN..body_start])?;
    let payload = &bytes[body_start..];

    if payload.len() as u64 != header.size_bytes {
        return Err(CacheError::Corrupted(format!(
            "payload is {} bytes, header says {}",
            payload.len(),
            header.size_bytes
        )));
    }
    if digest_bytes(payload).into_hex() != header.checksum {
        return Err(CacheError::Corrupted("payload checksum mismatch".to_string()));
    }

    Ok(CacheEntry {
        meta: header.into_meta(last_accessed_at),
        payload: payload.to_vec(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_roundtrip_verifies_checksum() {
        let meta = EntryMeta::for_payload("abc", Namespace::ParsedDocument, b"hello world");
        let mut record = encode_record(&meta, b"hello world").unwrap();

        let entry = decode_record(&record, meta.last_accessed_at).unwrap();
        assert_eq!(entry.payload, b"hello world");
        assert_eq!(entry.meta.size_bytes, 11);

        // Flip one payload byte
        let last = record.len() - 1;
        record[last] ^= 0xff;
        assert!(matches!(
            decode_record(&record, meta.last_accessed_at),
            Err(CacheError::Corrupted(_))
        ));
    }

    #[test]
    fn test_truncated_record_is_corrupt() {
        let meta = EntryMeta::for_payload("abc", Namespace::ExtractedImage, b"0123456789");
        let record = encode_record(&meta, b"0123456789").unwrap();
        let truncated = &record[..record.len() - 3];
        assert!(decode_record(truncated, meta.last_accessed_at).is_err());
        assert!(decode_prefix(b"NOPE\x01\x00\x00\x00").is_err());
    }

    #[test]
    fn test_namespace_names() {
        assert_eq!("image".parse::<Namespace>().unwrap(), Namespace::ExtractedImage);
        assert_eq!(Namespace::ArchiveEntry.to_string(), "archive");
        assert!("videos".parse::<Namespace>().is_err());
    }
}
