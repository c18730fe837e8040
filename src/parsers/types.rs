//! Parser input and output types

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::cache::ProcessingOptions;

/// Stable identifier of a parser implementation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct ParserId(&'static str);

impl ParserId {
    pub const PDF: ParserId = ParserId("pdf");
    pub const OFFICE: ParserId = ParserId("office");
    pub const LEGACY_OFFICE: ParserId = ParserId("legacy_office");
    pub const TEXT: ParserId = ParserId("text");
    pub const IMAGE: ParserId = ParserId("image");
    pub const ARCHIVE: ParserId = ParserId("archive");

    pub const fn new(id: &'static str) -> Self {
        Self(id)
    }

    pub fn as_str(&self) -> &'static str {
        self.0
    }
}

impl fmt::Display for ParserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.0)
    }
}

/// Raw file handed to a parser
#[derive(Debug, Clone)]
pub struct ParseInput {
    /// File name, used for titles and nested entry paths
    pub name: String,
    /// Normalised extension with leading dot (`.tar.gz`, `.pdf`)
    pub extension: String,
    pub bytes: Arc<Vec<u8>>,
    pub options: ProcessingOptions,
}

/// Metadata gathered while parsing
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DocumentMetadata {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub page_count: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub encoding: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub width: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub height: Option<u32>,
    /// Embedded media referenced by the document
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub image_refs: Vec<String>,
    /// Embedded pictures stored in the extracted-image cache
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub images: Vec<ImageResource>,
    /// Archive member paths
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub entries: Vec<String>,
    /// Non-fatal remarks (skipped entries, missing OCR, ...)
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub notes: Vec<String>,
}

/// A picture pulled out of a document
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageResource {
    /// Path inside the document package
    pub name: String,
    /// Key of the raw bytes in the extracted-image namespace
    pub key: String,
    pub size_bytes: u64,
    pub mime_type: String,
}

/// Successful parse output; this is what gets cached
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParsedContent {
    pub markdown: String,
    /// Short document type label (`pdf`, `docx`, `image`, ...)
    pub doc_type: String,
    #[serde(default)]
    pub metadata: DocumentMetadata,
}

impl ParsedContent {
    pub fn new(markdown: impl Into<String>, doc_type: impl Into<String>) -> Self {
        Self {
            markdown: markdown.into(),
            doc_type: doc_type.into(),
            metadata: DocumentMetadata::default(),
        }
    }

    pub fn with_metadata(mut self, metadata: DocumentMetadata) -> Self {
        self.metadata = metadata;
        self
    }
}

/// Document type label derived from an extension
pub fn doc_type_of(extension: &str) -> String {
    extension.trim_start_matches('.').replace('.', "_")
}
