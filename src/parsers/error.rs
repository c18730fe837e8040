//! Parser error types

use thiserror::Error;

/// Errors produced by format adapters
#[derive(Debug, Error)]
pub enum ParseError {
    /// Bytes do not form a valid file of the claimed format
    #[error("Invalid content: {0}")]
    InvalidContent(String),

    /// File parsed but produced no text
    #[error("No text content could be extracted")]
    Empty,

    /// Format variant the adapter does not handle
    #[error("Unsupported format: {0}")]
    Unsupported(String),

    /// OCR provider failed
    #[error("OCR failed: {0}")]
    Ocr(String),

    /// External conversion failed
    #[error("Conversion failed: {0}")]
    Conversion(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl From<zip::result::ZipError> for ParseError {
    fn from(e: zip::result::ZipError) -> Self {
        Self::InvalidContent(format!("bad zip package: {e}"))
    }
}

impl From<quick_xml::Error> for ParseError {
    fn from(e: quick_xml::Error) -> Self {
        Self::InvalidContent(format!("malformed XML: {e}"))
    }
}

impl From<image::ImageError> for ParseError {
    fn from(e: image::ImageError) -> Self {
        Self::InvalidContent(format!("bad image: {e}"))
    }
}

#[cfg(feature = "pdf")]
impl From<mupdf::Error> for ParseError {
    fn from(e: mupdf::Error) -> Self {
        Self::InvalidContent(format!("pdf: {e}"))
    }
}

impl From<tokio::task::JoinError> for ParseError {
    fn from(e: tokio::task::JoinError) -> Self {
        Self::Internal(format!("parser task failed: {e}"))
    }
}

/// Result type alias for parser operations
pub type ParseResult<T> = std::result::Result<T, ParseError>;
