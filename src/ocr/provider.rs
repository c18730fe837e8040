//! OCR Providers
//!
//! The provider trait and the three backends: an OpenAI-compatible vision
//! endpoint, an Ollama vision model and the Tesseract CLI.

use std::process::Stdio;

use async_trait::async_trait;
use base64::Engine;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;

use super::types::{OcrError, OcrProviderKind, OcrResult};
use crate::parsers::probe::find_executable;

/// Instruction sent to vision models
const VISION_PROMPT: &str = "Transcribe all text in this image as Markdown. \
Keep the layout: use # headings for titles, - for list items, | tables | for tabular data \
and blank lines between paragraphs. Output only the Markdown, with no commentary. \
If the image contains no text, output nothing.";

/// OCR provider trait
#[async_trait]
pub trait OcrProvider: Send + Sync {
    fn kind(&self) -> OcrProviderKind;

    /// Check if the provider can be called right now
    async fn is_available(&self) -> bool;

    /// Recognise text in a PNG image
    async fn recognize(&self, png: &[u8], language: Option<&str>) -> Result<OcrResult, OcrError>;
}

fn language_hint(language: Option<&str>) -> String {
    language
        .map(|l| format!(" The text language is {l}."))
        .unwrap_or_default()
}

/// OpenAI-compatible vision chat completions
pub struct OpenAiProvider {
    client: reqwest::Client,
    base_url: String,
    api_key: Option<String>,
    model: String,
}

impl OpenAiProvider {
    pub fn new(client: reqwest::Client, base_url: &str, api_key: Option<String>, model: &str) -> Self {
        Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key,
            model: model.to_string(),
        }
    }
}

#[async_trait]
impl OcrProvider for OpenAiProvider {
    fn kind(&self) -> OcrProviderKind {
        OcrProviderKind::OpenAi
    }

    async fn is_available(&self) -> bool {
        self.api_key.as_deref().is_some_and(|k| !k.is_empty())
    }

    async fn recognize(&self, png: &[u8], language: Option<&str>) -> Result<OcrResult, OcrError> {
        let api_key = self
            .api_key
            .as_deref()
            .ok_or_else(|| OcrError::ProviderNotAvailable("OPENAI_API_KEY is not set".to_string()))?;

        let image_base64 = base64::engine::general_purpose::STANDARD.encode(png);
        let request = serde_json::json!({
            "model": self.model,
            "temperature": 0.1,
            "messages": [{
                "role": "user",
                "content": [
                    { "type": "text", "text": format!("{VISION_PROMPT}{}", language_hint(language)) },
                    {
                        "type": "image_url",
                        "image_url": {
                            "url": format!("data:image/png;base64,{image_base64}"),
                            "detail": "high"
                        }
                    }
                ]
            }]
        });

        let response = self
            .client
            .post(format!("{}/chat/completions", self.base_url))
            .bearer_auth(api_key)
            .json(&request)
            .send()
            .await
            .map_err(|e| OcrError::ApiError(format!("Failed to call vision endpoint: {}", e)))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(OcrError::ApiError(format!(
                "Vision endpoint returned {}: {}",
                status,
                body.chars().take(200).collect::<String>()
            )));
        }

        let result: serde_json::Value = response
            .json()
            .await
            .map_err(|e| OcrError::ApiError(format!("Failed to parse response: {}", e)))?;

        let text = result["choices"][0]["message"]["content"]
            .as_str()
            .unwrap_or("")
            .trim()
            .to_string();

        Ok(OcrResult {
            text,
            provider: OcrProviderKind::OpenAi,
        })
    }
}

/// Ollama vision model provider
pub struct OllamaProvider {
    client: reqwest::Client,
    /// Ollama API URL
    base_url: String,
    /// Model name (e.g., "llava", "bakllava")
    model: String,
}

impl OllamaProvider {
    pub fn new(client: reqwest::Client, base_url: &str, model: &str) -> Self {
        Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            model: model.to_string(),
        }
    }
}

#[async_trait]
impl OcrProvider for OllamaProvider {
    fn kind(&self) -> OcrProviderKind {
        OcrProviderKind::Ollama
    }

    async fn is_available(&self) -> bool {
        let url = format!("{}/api/tags", self.base_url);
        match self.client.get(&url).send().await {
            Ok(response) => response.status().is_success(),
            Err(_) => false,
        }
    }

    async fn recognize(&self, png: &[u8], language: Option<&str>) -> Result<OcrResult, OcrError> {
        let image_base64 = base64::engine::general_purpose::STANDARD.encode(png);
        let request = serde_json::json!({
            "model": self.model,
            "prompt": format!("{VISION_PROMPT}{}", language_hint(language)),
            "images": [image_base64],
            "stream": false
        });

        let response = self
            .client
            .post(format!("{}/api/generate", self.base_url))
            .json(&request)
            .send()
            .await
            .map_err(|e| OcrError::ApiError(format!("Failed to call Ollama: {}", e)))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(OcrError::ApiError(format!("Ollama returned {}: {}", status, body)));
        }

        let result: serde_json::Value = response
            .json()
            .await
            .map_err(|e| OcrError::ApiError(format!("Failed to parse response: {}", e)))?;

        Ok(OcrResult {
            text: result["response"].as_str().unwrap_or("").trim().to_string(),
            provider: OcrProviderKind::Ollama,
        })
    }
}

/// Tesseract CLI provider; the image goes in on stdin, text comes out on stdout
pub struct TesseractProvider {
    default_language: String,
}

impl TesseractProvider {
    pub fn new(default_language: &str) -> Self {
        Self {
            default_language: default_language.to_string(),
        }
    }
}

#[async_trait]
impl OcrProvider for TesseractProvider {
    fn kind(&self) -> OcrProviderKind {
        OcrProviderKind::Tesseract
    }

    async fn is_available(&self) -> bool {
        tokio::task::spawn_blocking(|| find_executable(&["tesseract"]).is_some())
            .await
            .unwrap_or(false)
    }

    async fn recognize(&self, png: &[u8], language: Option<&str>) -> Result<OcrResult, OcrError> {
        let lang = language.unwrap_or(&self.default_language);

        let mut child = Command::new("tesseract")
            .args(["stdin", "stdout", "-l", lang, "--psm", "3"])
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| OcrError::ProcessingError(format!("Failed to run tesseract: {}", e)))?;

        if let Some(mut stdin) = child.stdin.take() {
            stdin
                .write_all(png)
                .await
                .map_err(|e| OcrError::ProcessingError(format!("Failed to feed tesseract: {}", e)))?;
        }

        let output = child
            .wait_with_output()
            .await
            .map_err(|e| OcrError::ProcessingError(format!("Tesseract did not finish: {}", e)))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(OcrError::ProcessingError(format!("Tesseract failed: {}", stderr.trim())));
        }

        Ok(OcrResult {
            text: String::from_utf8_lossy(&output.stdout).trim().to_string(),
            provider: OcrProviderKind::Tesseract,
        })
    }
}

/// Mock provider for testing
#[cfg(test)]
pub struct MockProvider {
    pub text: String,
    pub available: bool,
    pub calls: std::sync::atomic::AtomicUsize,
}

#[cfg(test)]
impl MockProvider {
    pub fn new(text: &str, available: bool) -> Self {
        Self {
            text: text.to_string(),
            available,
            calls: std::sync::atomic::AtomicUsize::new(0),
        }
    }
}

#[cfg(test)]
#[async_trait]
impl OcrProvider for MockProvider {
    fn kind(&self) -> OcrProviderKind {
        OcrProviderKind::Ollama
    }

    async fn is_available(&self) -> bool {
        self.available
    }

    async fn recognize(&self, _png: &[u8], _language: Option<&str>) -> Result<OcrResult, OcrError> {
        self.calls.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        Ok(OcrResult {
            text: self.text.clone(),
            provider: self.kind(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_openai_requires_key() {
        let provider = OpenAiProvider::new(reqwest::Client::new(), "http://localhost:1/v1/", None, "gpt-4o");
        assert!(!provider.is_available().await);
        assert!(matches!(
            provider.recognize(b"png", None).await,
            Err(OcrError::ProviderNotAvailable(_))
        ));
        assert_eq!(provider.base_url, "http://localhost:1/v1");
    }

    #[test]
    fn test_language_hint() {
        assert_eq!(language_hint(None), "");
        assert!(language_hint(Some("deu")).contains("deu"));
    }
}
