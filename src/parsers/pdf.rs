//! PDF text extraction through MuPDF

use async_trait::async_trait;
use mupdf::{Document, MetadataName};
use tracing::debug;

use super::error::{ParseError, ParseResult};
use super::text::normalize_text;
use super::traits::{ParseContext, Parser};
use super::types::{DocumentMetadata, ParseInput, ParsedContent, ParserId};

/// Pages beyond this are listed as skipped
const MAX_PAGES: usize = 2000;

pub struct PdfParser;

impl PdfParser {
    pub fn new() -> Self {
        Self
    }
}

impl Default for PdfParser {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Parser for PdfParser {
    fn id(&self) -> ParserId {
        ParserId::PDF
    }

    async fn parse(&self, input: ParseInput, _ctx: ParseContext) -> ParseResult<ParsedContent> {
        let bytes = input.bytes.clone();
        let parsed = tokio::task::spawn_blocking(move || extract(&bytes)).await??;
        debug!(
            name = %input.name,
            pages = parsed.metadata.page_count,
            chars = parsed.markdown.len(),
            "Parsed PDF"
        );
        Ok(parsed)
    }
}

fn extract(bytes: &[u8]) -> ParseResult<ParsedContent> {
    let doc = Document::from_bytes(bytes, "application/pdf")?;
    let page_count = doc.page_count()?.max(0) as usize;

    let mut metadata = DocumentMetadata {
        title: doc
            .metadata(MetadataName::Title)
            .ok()
            .map(|t| t.trim().to_string())
            .filter(|t| !t.is_empty()),
        page_count: Some(page_count),
        ..Default::default()
    };

    let mut sections = Vec::new();
    let mut blank_pages = 0;
    for index in 0..page_count.min(MAX_PAGES) {
        let page = doc.load_page(index as i32)?;
        let text = normalize_text(&page.to_text()?);
        if text.is_empty() {
            blank_pages += 1;
            continue;
        }
        sections.push(format!("## Page {}\n\n{}", index + 1, text));
    }

    if blank_pages > 0 {
        metadata
            .notes
            .push(format!("{blank_pages} page(s) without a text layer"));
    }
    if page_count > MAX_PAGES {
        metadata
            .notes
            .push(format!("only the first {MAX_PAGES} of {page_count} pages were read"));
    }
    if sections.is_empty() {
        return Err(ParseError::Empty);
    }

    Ok(ParsedContent::new(sections.join("\n\n"), "pdf").with_metadata(metadata))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_garbage_is_rejected() {
        assert!(matches!(
            extract(b"definitely not a pdf"),
            Err(ParseError::InvalidContent(_))
        ));
    }
}
