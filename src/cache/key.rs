//! Content addressing
//!
//! A cache key depends only on what a parse produces: the file's bytes,
//! the parser that handles it, that parser's version and the options that
//! change its output. Path and modification time are never part of it, so a
//! moved or renamed file hits the same entry.

use std::fmt;
use std::io::Read;
use std::path::Path;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::io::{AsyncRead, AsyncReadExt};

/// Read size used when streaming file content into the hasher
const DIGEST_CHUNK_SIZE: usize = 64 * 1024;

/// Domain tag mixed into every key; bump to invalidate all keys at once
const KEY_DOMAIN: &[u8] = b"file-reader/key/v1";

/// Options that influence parser output
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProcessingOptions {
    /// Run OCR on images
    pub ocr: bool,
    /// OCR language hint (Tesseract code such as `eng`)
    pub ocr_language: Option<String>,
}

impl Default for ProcessingOptions {
    fn default() -> Self {
        Self {
            ocr: true,
            ocr_language: None,
        }
    }
}

impl ProcessingOptions {
    /// Sorted `name=value` lines; equal option sets render identically
    pub fn canonical(&self) -> String {
        let mut fields = vec![
            format!("ocr={}", self.ocr),
            format!(
                "ocr_language={}",
                self.ocr_language.as_deref().unwrap_or("")
            ),
        ];
        fields.sort();
        fields.join("\n")
    }
}

/// Hex SHA-256 of a file's raw bytes
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ContentDigest(String);

impl ContentDigest {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn into_hex(self) -> String {
        self.0
    }
}

impl fmt::Display for ContentDigest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Digest an in-memory buffer
pub fn digest_bytes(data: &[u8]) -> ContentDigest {
    let mut hasher = Sha256::new();
    hasher.update(data);
    ContentDigest(hex::encode(hasher.finalize()))
}

/// Digest a blocking reader in fixed-size chunks
pub fn digest_reader<R: Read>(mut reader: R) -> std::io::Result<ContentDigest> {
    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; DIGEST_CHUNK_SIZE];
    loop {
        let n = reader.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(ContentDigest(hex::encode(hasher.finalize())))
}

/// Digest an async reader in fixed-size chunks
pub async fn digest_async_reader<R>(mut reader: R) -> std::io::Result<ContentDigest>
where
    R: AsyncRead + Unpin,
{
    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; DIGEST_CHUNK_SIZE];
    loop {
        let n = reader.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(ContentDigest(hex::encode(hasher.finalize())))
}

/// Digest a file on disk without loading it whole
pub async fn digest_file(path: impl AsRef<Path>) -> std::io::Result<ContentDigest> {
    let file = tokio::fs::File::open(path).await?;
    digest_async_reader(file).await
}

/// Cache key: 64 lowercase hex characters
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CacheKey(String);

impl CacheKey {
    /// Derive the key for a parse of `digest` by `parser_id`@`parser_version`.
    ///
    /// `fingerprint` describes server-side settings that change the parser's
    /// output (OCR engine, archive limits); empty when none do.
    pub fn derive(
        digest: &ContentDigest,
        parser_id: &str,
        parser_version: &str,
        fingerprint: &str,
        options: &ProcessingOptions,
    ) -> Self {
        let mut hasher = Sha256::new();
        for part in [
            KEY_DOMAIN,
            digest.as_str().as_bytes(),
            parser_id.as_bytes(),
            parser_version.as_bytes(),
            fingerprint.as_bytes(),
            options.canonical().as_bytes(),
        ] {
            // Length prefix keeps field boundaries unambiguous
            hasher.update((part.len() as u64).to_le_bytes());
            hasher.update(part);
        }
        Self(hex::encode(hasher.finalize()))
    }

    /// Parse a key read back from disk
    pub fn from_hex(s: &str) -> Option<Self> {
        let valid = s.len() == 64 && s.bytes().all(|b| matches!(b, b'0'..=b'9' | b'a'..=b'f'));
        valid.then(|| Self(s.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Two-character shard prefix used for the record directory
    pub fn shard(&self) -> &str {
        &self.0[..2]
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for CacheKey {
    fn as_ref(&self) -> &str {
        &self.0
    }
}
