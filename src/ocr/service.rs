//! OCR Service
//!
//! Owns the configured provider and prepares images before upload.

use std::io::Cursor;
use std::sync::Arc;
use std::time::Duration;

use image::imageops::FilterType;
use image::ImageFormat;

use super::provider::{OcrProvider, OllamaProvider, OpenAiProvider, TesseractProvider};
use super::types::{OcrConfig, OcrError, OcrProviderKind, OcrResult};

/// Longest image side sent to a provider
const MAX_IMAGE_SIDE: u32 = 2048;
/// Vision requests can be slow on large images
const REQUEST_TIMEOUT: Duration = Duration::from_secs(120);

/// OCR service backed by one provider
pub struct OcrService {
    provider: Arc<dyn OcrProvider>,
    language: String,
}

impl OcrService {
    /// Build the configured provider; `None` when OCR is disabled
    pub fn from_config(config: &OcrConfig) -> Option<Self> {
        let client = || {
            reqwest::Client::builder()
                .timeout(REQUEST_TIMEOUT)
                .build()
                .unwrap_or_default()
        };

        let provider: Arc<dyn OcrProvider> = match config.provider {
            OcrProviderKind::None => return None,
            OcrProviderKind::OpenAi => Arc::new(OpenAiProvider::new(
                client(),
                &config.openai_base_url,
                config.openai_api_key.clone(),
                &config.openai_model,
            )),
            OcrProviderKind::Ollama => Arc::new(OllamaProvider::new(
                client(),
                &config.ollama_url,
                &config.ollama_model,
            )),
            OcrProviderKind::Tesseract => Arc::new(TesseractProvider::new(&config.language)),
        };

        Some(Self::with_provider(provider, &config.language))
    }

    pub fn with_provider(provider: Arc<dyn OcrProvider>, language: &str) -> Self {
        Self {
            provider,
            language: language.to_string(),
        }
    }

    pub fn provider_kind(&self) -> OcrProviderKind {
        self.provider.kind()
    }

    /// Recognise text in an encoded image of any supported format
    pub async fn recognize(&self, image_data: &[u8], language: Option<&str>) -> Result<OcrResult, OcrError> {
        if !self.provider.is_available().await {
            return Err(OcrError::ProviderNotAvailable(format!(
                "{} provider is not available",
                self.provider.kind()
            )));
        }

        let data = image_data.to_vec();
        let png = tokio::task::spawn_blocking(move || prepare_image(&data))
            .await
            .map_err(|e| OcrError::ImagePreparation(format!("Task join error: {}", e)))??;

        let lang = language.unwrap_or(&self.language);
        let result = self.provider.recognize(&png, Some(lang)).await?;
        tracing::debug!(
            provider = %result.provider,
            chars = result.text.len(),
            "OCR finished"
        );
        Ok(result)
    }
}

/// Decode, downscale so the longest side fits, and re-encode as PNG
pub fn prepare_image(image_data: &[u8]) -> Result<Vec<u8>, OcrError> {
    let img = image::load_from_memory(image_data)
        .map_err(|e| OcrError::ImagePreparation(format!("Failed to decode image: {}", e)))?;

    let img = if img.width() > MAX_IMAGE_SIDE || img.height() > MAX_IMAGE_SIDE {
        img.resize(MAX_IMAGE_SIDE, MAX_IMAGE_SIDE, FilterType::Triangle)
    } else {
        img
    };

    let mut buffer = Vec::new();
    img.write_to(&mut Cursor::new(&mut buffer), ImageFormat::Png)
        .map_err(|e| OcrError::ImagePreparation(format!("Failed to encode image: {}", e)))?;
    Ok(buffer)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ocr::provider::MockProvider;
    use image::{DynamicImage, RgbImage};
    use std::sync::atomic::Ordering;

    fn png(width: u32, height: u32) -> Vec<u8> {
        let img = DynamicImage::ImageRgb8(RgbImage::new(width, height));
        let mut buffer = Vec::new();
        img.write_to(&mut Cursor::new(&mut buffer), ImageFormat::Png).unwrap();
        buffer
    }

    #[test]
    fn test_disabled_config_builds_nothing() {
        assert!(OcrService::from_config(&OcrConfig::default()).is_none());
        let config = OcrConfig {
            provider: OcrProviderKind::Tesseract,
            ..Default::default()
        };
        let service = OcrService::from_config(&config).unwrap();
        assert_eq!(service.provider_kind(), OcrProviderKind::Tesseract);
    }

    #[test]
    fn test_prepare_image_downscales() {
        let prepared = prepare_image(&png(4096, 1024)).unwrap();
        let img = image::load_from_memory(&prepared).unwrap();
        assert_eq!((img.width(), img.height()), (2048, 512));

        let small = prepare_image(&png(20, 10)).unwrap();
        let img = image::load_from_memory(&small).unwrap();
        assert_eq!((img.width(), img.height()), (20, 10));
    }

    #[tokio::test]
    async fn test_unavailable_provider_is_not_called() {
        let mock = Arc::new(MockProvider::new("text", false));
        let service = OcrService::with_provider(mock.clone(), "eng");
        let err = service.recognize(&png(4, 4), None).await.unwrap_err();
        assert!(matches!(err, OcrError::ProviderNotAvailable(_)));
        assert_eq!(mock.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_recognize_through_provider() {
        let mock = Arc::new(MockProvider::new("# Heading", true));
        let service = OcrService::with_provider(mock.clone(), "eng");
        let result = service.recognize(&png(8, 8), Some("deu")).await.unwrap();
        assert_eq!(result.text, "# Heading");
        assert_eq!(mock.calls.load(Ordering::SeqCst), 1);
    }
}
