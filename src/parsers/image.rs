//! Raster images: dimensions always, text through OCR when configured

use std::sync::{Arc, OnceLock};

use async_trait::async_trait;
use tracing::{debug, warn};

use super::error::{ParseError, ParseResult};
use super::traits::{ParseContext, Parser};
use super::types::{DocumentMetadata, ParseInput, ParsedContent, ParserId};
use crate::ocr::{OcrConfig, OcrService};

pub struct ImageParser {
    config: OcrConfig,
    /// Built on first OCR request and shared afterwards
    service: OnceLock<Option<Arc<OcrService>>>,
}

impl ImageParser {
    pub fn new(config: OcrConfig) -> Self {
        Self {
            config,
            service: OnceLock::new(),
        }
    }

    /// Parser with a ready-made OCR service
    pub fn with_service(service: OcrService) -> Self {
        let parser = Self::new(OcrConfig::default());
        let _ = parser.service.set(Some(Arc::new(service)));
        parser
    }

    fn service(&self) -> Option<&Arc<OcrService>> {
        self.service
            .get_or_init(|| OcrService::from_config(&self.config).map(Arc::new))
            .as_ref()
    }
}

/// Format name and pixel size, decoded off the async runtime
async fn inspect(bytes: Arc<Vec<u8>>) -> ParseResult<(String, u32, u32)> {
    tokio::task::spawn_blocking(move || -> ParseResult<(String, u32, u32)> {
        let format = image::guess_format(&bytes)?;
        let img = image::load_from_memory_with_format(&bytes, format)?;
        let name = format
            .extensions_str()
            .first()
            .map(|e| e.to_uppercase())
            .unwrap_or_else(|| format!("{format:?}").to_uppercase());
        Ok((name, img.width(), img.height()))
    })
    .await?
}

fn describe(name: &str, format: &str, width: u32, height: u32) -> String {
    format!("## Image: {name}\n\n- Format: {format}\n- Dimensions: {width} × {height} px")
}

#[async_trait]
impl Parser for ImageParser {
    fn id(&self) -> ParserId {
        ParserId::IMAGE
    }

    async fn parse(&self, input: ParseInput, _ctx: ParseContext) -> ParseResult<ParsedContent> {
        let (format, width, height) = inspect(input.bytes.clone()).await?;
        let mut metadata = DocumentMetadata {
            width: Some(width),
            height: Some(height),
            ..Default::default()
        };
        let description = describe(&input.name, &format, width, height);

        if !input.options.ocr {
            return Ok(ParsedContent::new(description, "image").with_metadata(metadata));
        }

        let Some(service) = self.service() else {
            metadata
                .notes
                .push("OCR requested but no OCR provider is configured".to_string());
            return Ok(ParsedContent::new(description, "image").with_metadata(metadata));
        };

        let result = service
            .recognize(&input.bytes, input.options.ocr_language.as_deref())
            .await
            .map_err(|e| {
                warn!(name = %input.name, error = %e, "OCR failed");
                ParseError::Ocr(e.to_string())
            })?;

        debug!(name = %input.name, provider = %result.provider, chars = result.text.len(), "Image OCR done");
        if result.text.trim().is_empty() {
            metadata.notes.push("no text recognised in image".to_string());
            return Ok(ParsedContent::new(description, "image").with_metadata(metadata));
        }

        metadata.notes.push(format!("text recognised by {}", result.provider));
        Ok(ParsedContent::new(result.text, "image").with_metadata(metadata))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::{CacheConfig, CacheManager, ProcessingOptions};
    use crate::ocr::{OcrError, OcrProvider, OcrProviderKind, OcrResult};
    use crate::parsers::{ParserFactories, ParserLoader, ParserRegistry, ParserSettings};
    use crate::reader::dispatch::parse_bytes;
    use image::{DynamicImage, ImageFormat, RgbImage};
    use std::io::Cursor;

    struct FixedText(&'static str);

    #[async_trait]
    impl OcrProvider for FixedText {
        fn kind(&self) -> OcrProviderKind {
            OcrProviderKind::Tesseract
        }

        async fn is_available(&self) -> bool {
            true
        }

        async fn recognize(&self, _png: &[u8], _language: Option<&str>) -> Result<OcrResult, OcrError> {
            Ok(OcrResult {
                text: self.0.to_string(),
                provider: OcrProviderKind::Tesseract,
            })
        }
    }

    fn png_input(ocr: bool) -> ParseInput {
        let img = DynamicImage::ImageRgb8(RgbImage::new(32, 16));
        let mut buffer = Vec::new();
        img.write_to(&mut Cursor::new(&mut buffer), ImageFormat::Png).unwrap();
        ParseInput {
            name: "scan.png".to_string(),
            extension: ".png".to_string(),
            bytes: Arc::new(buffer),
            options: ProcessingOptions {
                ocr,
                ocr_language: None,
            },
        }
    }

    fn ctx() -> ParseContext {
        ParseContext::new(
            CacheManager::new(CacheConfig::default()),
            ParserLoader::builtin(ParserSettings::default()),
        )
    }

    #[tokio::test]
    async fn test_without_provider_adds_note() {
        let parsed = ImageParser::new(OcrConfig::default())
            .parse(png_input(true), ctx())
            .await
            .unwrap();
        assert_eq!(parsed.metadata.width, Some(32));
        assert_eq!(parsed.metadata.height, Some(16));
        assert!(parsed.markdown.contains("32 × 16"));
        assert_eq!(parsed.metadata.notes.len(), 1);
    }

    #[tokio::test]
    async fn test_ocr_text_becomes_markdown() {
        let service = OcrService::with_provider(Arc::new(FixedText("# Invoice\n\nTotal: 12")), "eng");
        let parsed = ImageParser::with_service(service)
            .parse(png_input(true), ctx())
            .await
            .unwrap();
        assert_eq!(parsed.markdown, "# Invoice\n\nTotal: 12");
    }

    #[tokio::test]
    async fn test_ocr_disabled_skips_provider() {
        let service = OcrService::with_provider(Arc::new(FixedText("never")), "eng");
        let parsed = ImageParser::with_service(service)
            .parse(png_input(false), ctx())
            .await
            .unwrap();
        assert!(parsed.markdown.starts_with("## Image: scan.png"));
        assert!(parsed.metadata.notes.is_empty());
    }

    #[tokio::test]
    async fn test_ocr_configuration_change_misses_cache() {
        let dir = tempfile::TempDir::new().unwrap();
        let cache_config = CacheConfig {
            root_dir: dir.path().to_path_buf(),
            ..Default::default()
        };
        let bytes = png_input(true).bytes;
        let options = ProcessingOptions::default();

        // First process: no OCR engine configured
        let plain = ParseContext::new(
            CacheManager::new(cache_config.clone()),
            ParserLoader::builtin(ParserSettings::default()),
        );
        let first = parse_bytes(&plain, "scan.png", ".png", bytes.clone(), &options)
            .await
            .unwrap();
        assert!(!first.cache_hit);
        assert!(first.content.markdown.starts_with("## Image: scan.png"));

        // Restart on the same cache root with an engine configured
        let settings = ParserSettings {
            ocr: OcrConfig {
                provider: OcrProviderKind::Tesseract,
                ..Default::default()
            },
            ..Default::default()
        };
        let factories = ParserFactories::builtin().with(ParserId::IMAGE, |_| {
            let service = OcrService::with_provider(Arc::new(FixedText("Delivery note 4411")), "eng");
            Ok(Arc::new(ImageParser::with_service(service)) as Arc<dyn Parser>)
        });
        let with_ocr = ParseContext::new(
            CacheManager::new(cache_config),
            ParserLoader::new(ParserRegistry::builtin(), factories, settings),
        );
        let second = parse_bytes(&with_ocr, "scan.png", ".png", bytes.clone(), &options)
            .await
            .unwrap();
        assert!(!second.cache_hit);
        assert_eq!(second.content.markdown, "Delivery note 4411");

        let third = parse_bytes(&with_ocr, "scan.png", ".png", bytes, &options)
            .await
            .unwrap();
        assert!(third.cache_hit);
        assert_eq!(third.content.markdown, "Delivery note 4411");
    }

    #[tokio::test]
    async fn test_corrupt_image() {
        let mut input = png_input(false);
        input.bytes = Arc::new(b"\x89PNG\r\n\x1a\nbroken".to_vec());
        let err = ImageParser::new(OcrConfig::default())
            .parse(input, ctx())
            .await
            .unwrap_err();
        assert!(matches!(err, ParseError::InvalidContent(_)));
    }
}
