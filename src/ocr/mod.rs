//! OCR Module
//!
//! Recognises text in images for the image parser.
//!
//! Supports three backends, one active at a time:
//! - OpenAI-compatible vision models (remote)
//! - Ollama vision models (local LLM)
//! - Tesseract (local, requires installation)

mod provider;
mod service;
mod types;

pub use provider::{OcrProvider, OllamaProvider, OpenAiProvider, TesseractProvider};
pub use service::{prepare_image, OcrService};
pub use types::{OcrConfig, OcrError, OcrProviderKind, OcrResult};
