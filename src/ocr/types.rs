//! OCR Types

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Which OCR backend recognises image text
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OcrProviderKind {
    /// OCR disabled
    #[default]
    None,
    /// OpenAI-compatible vision chat completions
    OpenAi,
    /// Ollama vision model (local LLM)
    Ollama,
    /// Tesseract CLI (local)
    Tesseract,
}

impl fmt::Display for OcrProviderKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::None => "none",
            Self::OpenAi => "openai",
            Self::Ollama => "ollama",
            Self::Tesseract => "tesseract",
        })
    }
}

impl FromStr for OcrProviderKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "" | "none" | "off" => Ok(Self::None),
            "openai" => Ok(Self::OpenAi),
            "ollama" => Ok(Self::Ollama),
            "tesseract" => Ok(Self::Tesseract),
            other => Err(format!("unknown OCR provider: {other}")),
        }
    }
}

/// OCR settings
#[derive(Clone)]
pub struct OcrConfig {
    pub provider: OcrProviderKind,
    pub openai_api_key: Option<String>,
    pub openai_base_url: String,
    pub openai_model: String,
    pub ollama_url: String,
    pub ollama_model: String,
    /// Default language hint (Tesseract code, e.g. `eng`)
    pub language: String,
}

impl Default for OcrConfig {
    fn default() -> Self {
        Self {
            provider: OcrProviderKind::None,
            openai_api_key: None,
            openai_base_url: "https://api.openai.com/v1".to_string(),
            openai_model: "gpt-4o".to_string(),
            ollama_url: "http://localhost:11434".to_string(),
            ollama_model: "llava".to_string(),
            language: "eng".to_string(),
        }
    }
}

impl OcrConfig {
    /// Engine, model and default language: everything here that changes
    /// recognised text. The API key is left out.
    pub fn fingerprint(&self) -> String {
        match self.provider {
            OcrProviderKind::None => "ocr=none".to_string(),
            OcrProviderKind::OpenAi => format!(
                "ocr=openai;endpoint={};model={};lang={}",
                self.openai_base_url, self.openai_model, self.language
            ),
            OcrProviderKind::Ollama => format!(
                "ocr=ollama;endpoint={};model={};lang={}",
                self.ollama_url, self.ollama_model, self.language
            ),
            OcrProviderKind::Tesseract => format!("ocr=tesseract;lang={}", self.language),
        }
    }
}

impl fmt::Debug for OcrConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OcrConfig")
            .field("provider", &self.provider)
            .field("openai_api_key", &self.openai_api_key.as_ref().map(|_| "<redacted>"))
            .field("openai_base_url", &self.openai_base_url)
            .field("openai_model", &self.openai_model)
            .field("ollama_url", &self.ollama_url)
            .field("ollama_model", &self.ollama_model)
            .field("language", &self.language)
            .finish()
    }
}

/// OCR result
#[derive(Debug, Clone, Serialize)]
pub struct OcrResult {
    /// Recognized text
    pub text: String,
    /// Provider used
    pub provider: OcrProviderKind,
}

/// OCR error types
#[derive(Debug, thiserror::Error)]
pub enum OcrError {
    #[error("OCR provider not available: {0}")]
    ProviderNotAvailable(String),

    #[error("Failed to prepare image: {0}")]
    ImagePreparation(String),

    #[error("OCR processing failed: {0}")]
    ProcessingError(String),

    #[error("API error: {0}")]
    ApiError(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_provider_kind_parsing() {
        assert_eq!("OpenAI".parse::<OcrProviderKind>().unwrap(), OcrProviderKind::OpenAi);
        assert_eq!("".parse::<OcrProviderKind>().unwrap(), OcrProviderKind::None);
        assert!("paddle".parse::<OcrProviderKind>().is_err());
        assert_eq!(OcrProviderKind::Tesseract.to_string(), "tesseract");
    }

    #[test]
    fn test_fingerprint_tracks_engine_and_language() {
        let none = OcrConfig::default();
        let tesseract = OcrConfig {
            provider: OcrProviderKind::Tesseract,
            ..Default::default()
        };
        let german = OcrConfig {
            language: "deu".to_string(),
            ..tesseract.clone()
        };
        let ollama = OcrConfig {
            provider: OcrProviderKind::Ollama,
            ..Default::default()
        };
        let other_model = OcrConfig {
            ollama_model: "llama3.2-vision".to_string(),
            ..ollama.clone()
        };

        assert_eq!(none.fingerprint(), "ocr=none");
        assert_eq!(tesseract.fingerprint(), "ocr=tesseract;lang=eng");
        assert_ne!(tesseract.fingerprint(), german.fingerprint());
        assert_ne!(ollama.fingerprint(), other_model.fingerprint());

        let keyed = OcrConfig {
            provider: OcrProviderKind::OpenAi,
            openai_api_key: Some("sk-secret".to_string()),
            ..Default::default()
        };
        assert!(!keyed.fingerprint().contains("sk-secret"));
    }

    #[test]
    fn test_debug_redacts_key() {
        let config = OcrConfig {
            openai_api_key: Some("sk-secret".to_string()),
            ..Default::default()
        };
        let printed = format!("{config:?}");
        assert!(!printed.contains("sk-secret"));
        assert!(printed.contains("<redacted>"));
    }
}
