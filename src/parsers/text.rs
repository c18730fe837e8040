//! Plain text, markdown, JSON and CSV

use async_trait::async_trait;
use tracing::debug;

use super::error::{ParseError, ParseResult};
use super::traits::{ParseContext, Parser};
use super::types::{doc_type_of, DocumentMetadata, ParseInput, ParsedContent, ParserId};

pub struct TextParser;

impl TextParser {
    pub fn new() -> Self {
        Self
    }
}

impl Default for TextParser {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Parser for TextParser {
    fn id(&self) -> ParserId {
        ParserId::TEXT
    }

    async fn parse(&self, input: ParseInput, _ctx: ParseContext) -> ParseResult<ParsedContent> {
        let (raw, encoding) = decode_text(&input.bytes);
        let mut metadata = DocumentMetadata {
            encoding: Some(encoding.to_string()),
            ..Default::default()
        };

        let markdown = match input.extension.as_str() {
            ".json" => render_json(&raw, &mut metadata),
            ".csv" => render_csv(&raw),
            ".md" | ".markdown" => {
                let text = normalize_text(&raw);
                metadata.title = first_heading(&text);
                text
            }
            _ => normalize_text(&raw),
        };

        if markdown.trim().is_empty() {
            return Err(ParseError::Empty);
        }

        debug!(name = %input.name, encoding, chars = markdown.len(), "Parsed text file");
        Ok(ParsedContent::new(markdown, doc_type_of(&input.extension)).with_metadata(metadata))
    }
}

/// Decode bytes, honouring a BOM, then UTF-8, then Latin-1
pub(crate) fn decode_text(bytes: &[u8]) -> (String, &'static str) {
    if let Some(rest) = bytes.strip_prefix(&[0xEF, 0xBB, 0xBF]) {
        return (String::from_utf8_lossy(rest).into_owned(), "utf-8-sig");
    }
    if let Some(rest) = bytes.strip_prefix(&[0xFF, 0xFE]) {
        return (decode_utf16(rest, u16::from_le_bytes), "utf-16le");
    }
    if let Some(rest) = bytes.strip_prefix(&[0xFE, 0xFF]) {
        return (decode_utf16(rest, u16::from_be_bytes), "utf-16be");
    }
    match std::str::from_utf8(bytes) {
        Ok(text) => (text.to_string(), "utf-8"),
        // Every byte is a valid Latin-1 code point
        Err(_) => (bytes.iter().map(|&b| b as char).collect(), "latin-1"),
    }
}

fn decode_utf16(bytes: &[u8], unit: fn([u8; 2]) -> u16) -> String {
    let units: Vec<u16> = bytes
        .chunks_exact(2)
        .map(|pair| unit([pair[0], pair[1]]))
        .collect();
    String::from_utf16_lossy(&units)
}

/// Unify line endings, strip trailing spaces, keep at most one blank line
pub(crate) fn normalize_text(text: &str) -> String {
    let unified = text.replace("\r\n", "\n").replace('\r', "\n");
    let mut out = String::with_capacity(unified.len());
    let mut blank_run = 0;

    for line in unified.lines() {
        let line = line.trim_end();
        if line.is_empty() {
            blank_run += 1;
            if blank_run > 1 {
                continue;
            }
        } else {
            blank_run = 0;
        }
        out.push_str(line);
        out.push('\n');
    }

    out.trim().to_string()
}

fn first_heading(markdown: &str) -> Option<String> {
    markdown
        .lines()
        .find_map(|line| line.strip_prefix("# "))
        .map(|title| title.trim().to_string())
        .filter(|title| !title.is_empty())
}

fn render_json(raw: &str, metadata: &mut DocumentMetadata) -> String {
    match serde_json::from_str::<serde_json::Value>(raw.trim()) {
        Ok(value) => {
            let pretty = serde_json::to_string_pretty(&value).unwrap_or_else(|_| raw.to_string());
            format!("```json\n{pretty}\n```")
        }
        Err(e) => {
            metadata.notes.push(format!("invalid JSON, shown as text: {e}"));
            let text = normalize_text(raw);
            if text.is_empty() {
                text
            } else {
                format!("```\n{text}\n```")
            }
        }
    }
}

/// Render CSV as a markdown table; the first row is the header
fn render_csv(raw: &str) -> String {
    markdown_table(&parse_csv(&raw.replace("\r\n", "\n")))
}

/// Markdown table from rows of cells; the first row is the header
pub(crate) fn markdown_table(rows: &[Vec<String>]) -> String {
    let width = rows.iter().map(Vec::len).max().unwrap_or(0);
    if width == 0 {
        return String::new();
    }

    let mut out = String::new();
    for (i, row) in rows.iter().enumerate() {
        out.push('|');
        for col in 0..width {
            let cell = row.get(col).map(String::as_str).unwrap_or("");
            out.push(' ');
            out.push_str(&escape_cell(cell));
            out.push_str(" |");
        }
        out.push('\n');
        if i == 0 {
            out.push('|');
            out.push_str(&" --- |".repeat(width));
            out.push('\n');
        }
    }
    out.trim_end().to_string()
}

pub(crate) fn escape_cell(cell: &str) -> String {
    cell.trim().replace('|', "\\|").replace('\n', "<br>")
}

/// Minimal RFC 4180 reader: quoted fields, doubled quotes, embedded newlines
fn parse_csv(text: &str) -> Vec<Vec<String>> {
    let mut rows = Vec::new();
    let mut row = Vec::new();
    let mut field = String::new();
    let mut in_quotes = false;
    let mut chars = text.chars().peekable();

    while let Some(c) = chars.next() {
        match (c, in_quotes) {
            ('"', true) if chars.peek() == Some(&'"') => {
                field.push('"');
                chars.next();
            }
            ('"', true) => in_quotes = false,
            ('"', false) if field.is_empty() => in_quotes = true,
            (',', false) => row.push(std::mem::take(&mut field)),
            ('\n', false) => {
                row.push(std::mem::take(&mut field));
                if !(row.len() == 1 && row[0].is_empty()) {
                    rows.push(std::mem::take(&mut row));
                } else {
                    row.clear();
                }
            }
            _ => field.push(c),
        }
    }
    if !field.is_empty() || !row.is_empty() {
        row.push(field);
        rows.push(row);
    }
    rows
}
