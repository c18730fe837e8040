//! Batch request and result types

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::cache::ProcessingOptions;
use crate::parsers::DocumentMetadata;

/// One batch of files to read
#[derive(Debug, Clone, Default, Deserialize)]
pub struct BatchRequest {
    /// Files in the order results should come back
    pub paths: Vec<String>,
    /// Per-file size limit in bytes; the configured limit when unset
    #[serde(default)]
    pub max_file_size: Option<u64>,
    /// Worker count, clamped to the configured maximum
    #[serde(default)]
    pub max_workers: Option<usize>,
    #[serde(default)]
    pub options: ProcessingOptions,
    /// Options for individual paths, replacing `options`
    #[serde(default)]
    pub overrides: HashMap<String, ProcessingOptions>,
}

impl BatchRequest {
    pub fn new<I, S>(paths: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            paths: paths.into_iter().map(Into::into).collect(),
            ..Default::default()
        }
    }

    pub fn with_max_file_size(mut self, bytes: u64) -> Self {
        self.max_file_size = Some(bytes);
        self
    }

    pub fn with_max_workers(mut self, workers: usize) -> Self {
        self.max_workers = Some(workers);
        self
    }

    pub fn with_options(mut self, options: ProcessingOptions) -> Self {
        self.options = options;
        self
    }

    pub fn with_override(mut self, path: impl Into<String>, options: ProcessingOptions) -> Self {
        self.overrides.insert(path.into(), options);
        self
    }

    pub fn options_for(&self, path: &str) -> &ProcessingOptions {
        self.overrides.get(path).unwrap_or(&self.options)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FileStatus {
    Success,
    CacheHit,
    Failed,
}

/// Failure classification, stable across releases
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    BatchTooLarge,
    FileTooLarge,
    FileNotReadable,
    UnsupportedFormat,
    DependencyUnavailable,
    ProcessingError,
    Timeout,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileError {
    pub kind: ErrorKind,
    /// Human-readable summary; `kind` is the programmatic channel
    pub message: String,
}

/// Result for one requested path
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileOutcome {
    pub path: String,
    pub status: FileStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub doc_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<DocumentMetadata>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<FileError>,
}

impl FileOutcome {
    pub fn failed(path: impl Into<String>, kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            status: FileStatus::Failed,
            content: None,
            doc_type: None,
            metadata: None,
            error: Some(FileError {
                kind,
                message: message.into(),
            }),
        }
    }

    pub fn error_kind(&self) -> Option<ErrorKind> {
        self.error.as_ref().map(|e| e.kind)
    }
}

/// Outcomes in request order
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BatchResult {
    pub results: Vec<FileOutcome>,
}

impl BatchResult {
    pub fn count(&self, status: FileStatus) -> usize {
        self.results.iter().filter(|r| r.status == status).count()
    }
}

/// Batch-level rejection; no file was touched
#[derive(Debug, Clone, Error)]
pub enum BatchError {
    #[error("too many files: {count} requested, at most {max} per request")]
    TooManyFiles { count: usize, max: usize },
}

impl BatchError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::TooManyFiles { .. } => ErrorKind::BatchTooLarge,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_outcome_shape() {
        let outcome = FileOutcome::failed("/x.xyz", ErrorKind::UnsupportedFormat, "no parser for .xyz");
        let json = serde_json::to_value(&outcome).unwrap();
        assert_eq!(json["status"], "failed");
        assert_eq!(json["error"]["kind"], "unsupported_format");
        assert!(json.get("content").is_none());
    }

    #[test]
    fn test_overrides() {
        let no_ocr = ProcessingOptions {
            ocr: false,
            ocr_language: None,
        };
        let request = BatchRequest::new(["/a.png", "/b.png"]).with_override("/b.png", no_ocr.clone());
        assert!(request.options_for("/a.png").ocr);
        assert_eq!(request.options_for("/b.png"), &no_ocr);
    }
}
