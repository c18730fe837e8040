//! Zip-packaged documents: OOXML, OpenDocument and EPUB
//!
//! All of these are a zip of XML parts. The walkers below pull paragraphs,
//! headings, list items and tables out of the part streams and emit plain
//! markdown blocks. Styling is dropped.

use std::collections::HashMap;
use std::io::{Cursor, Read};
use std::sync::Arc;

use async_trait::async_trait;
use quick_xml::events::{BytesStart, BytesText, Event};
use quick_xml::Reader;
use tracing::debug;
use zip::result::ZipError;
use zip::ZipArchive;

use super::error::{ParseError, ParseResult};
use super::media::{package_media, store_media};
use super::text::markdown_table;
use super::traits::{ParseContext, Parser};
use super::types::{doc_type_of, DocumentMetadata, ParseInput, ParsedContent, ParserId};

/// Largest single part read out of a package
const MAX_PART_BYTES: u64 = 64 * 1024 * 1024;
/// Spreadsheet guard rails
const MAX_SHEET_ROWS: usize = 2000;
const MAX_SHEET_COLS: usize = 64;
const MAX_REPEATED_CELLS: usize = 32;

pub struct OfficeParser;

impl OfficeParser {
    pub fn new() -> Self {
        Self
    }
}

impl Default for OfficeParser {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Parser for OfficeParser {
    fn id(&self) -> ParserId {
        ParserId::OFFICE
    }

    async fn parse(&self, input: ParseInput, ctx: ParseContext) -> ParseResult<ParsedContent> {
        let parsed = convert_with_media(&ctx, &input.name, &input.extension, input.bytes.clone()).await?;
        debug!(
            name = %input.name,
            chars = parsed.markdown.len(),
            images = parsed.metadata.images.len(),
            "Parsed office package"
        );
        Ok(parsed)
    }
}

/// Convert a package and move its embedded pictures into the image cache
pub(crate) async fn convert_with_media(
    ctx: &ParseContext,
    name: &str,
    extension: &str,
    bytes: Arc<Vec<u8>>,
) -> ParseResult<ParsedContent> {
    let ext = extension.to_string();
    let (mut parsed, media) = tokio::task::spawn_blocking(move || -> ParseResult<_> {
        let parsed = convert_package(&ext, &bytes)?;
        let media = package_media(&ext, &bytes)?;
        Ok((parsed, media))
    })
    .await??;

    if media.skipped > 0 {
        parsed
            .metadata
            .notes
            .push(format!("{} embedded image(s) over the extraction limits", media.skipped));
    }
    if !media.parts.is_empty() {
        let (images, notes) = store_media(ctx, media.parts).await;
        debug!(name, stored = images.len(), "Cached embedded images");
        parsed.metadata.images = images;
        parsed.metadata.notes.extend(notes);
    }
    Ok(parsed)
}

/// Convert a package by extension. Blocking.
pub(crate) fn convert_package(extension: &str, bytes: &[u8]) -> ParseResult<ParsedContent> {
    let mut pkg = ZipArchive::new(Cursor::new(bytes))?;
    let mut metadata = DocumentMetadata::default();

    let markdown = match extension {
        ".docx" => {
            metadata.title = read_part(&mut pkg, "docProps/core.xml")?
                .and_then(|xml| element_text(&xml, b"title"));
            metadata.image_refs = media_names(&pkg, "word/media/");
            let xml = require_part(&mut pkg, "word/document.xml")?;
            walk_docx(&xml)
        }
        ".xlsx" => {
            metadata.title = read_part(&mut pkg, "docProps/core.xml")?
                .and_then(|xml| element_text(&xml, b"title"));
            metadata.image_refs = media_names(&pkg, "xl/media/");
            convert_xlsx(&mut pkg, &mut metadata)?
        }
        ".pptx" => {
            metadata.title = read_part(&mut pkg, "docProps/core.xml")?
                .and_then(|xml| element_text(&xml, b"title"));
            metadata.image_refs = media_names(&pkg, "ppt/media/");
            convert_pptx(&mut pkg, &mut metadata)?
        }
        ".odt" | ".ods" | ".odp" => {
            metadata.title =
                read_part(&mut pkg, "meta.xml")?.and_then(|xml| element_text(&xml, b"title"));
            metadata.image_refs = media_names(&pkg, "Pictures/");
            let xml = require_part(&mut pkg, "content.xml")?;
            walk_odf(&xml, extension == ".ods")
        }
        ".epub" => convert_epub(&mut pkg, &mut metadata)?,
        other => return Err(ParseError::Unsupported(other.to_string())),
    };

    if markdown.trim().is_empty() {
        return Err(ParseError::Empty);
    }
    Ok(ParsedContent::new(markdown, doc_type_of(extension)).with_metadata(metadata))
}

// =============================================================================
// Package helpers
// =============================================================================

type Package<'a> = ZipArchive<Cursor<&'a [u8]>>;

fn read_part(pkg: &mut Package<'_>, name: &str) -> ParseResult<Option<Vec<u8>>> {
    match pkg.by_name(name) {
        Ok(file) => {
            let mut buf = Vec::new();
            file.take(MAX_PART_BYTES).read_to_end(&mut buf)?;
            Ok(Some(buf))
        }
        Err(ZipError::FileNotFound) => Ok(None),
        Err(e) => Err(e.into()),
    }
}

fn require_part(pkg: &mut Package<'_>, name: &str) -> ParseResult<Vec<u8>> {
    read_part(pkg, name)?
        .ok_or_else(|| ParseError::InvalidContent(format!("package has no {name}")))
}

fn media_names(pkg: &Package<'_>, prefix: &str) -> Vec<String> {
    let mut names: Vec<String> = pkg
        .file_names()
        .filter(|n| n.starts_with(prefix) && !n.ends_with('/'))
        .map(str::to_string)
        .collect();
    names.sort();
    names
}

fn xml_reader(xml: &[u8]) -> Reader<&[u8]> {
    let mut reader = Reader::from_reader(xml);
    reader.trim_text(false);
    reader.check_end_names(false);
    reader
}

/// Unescape text, falling back to HTML entity rules for XHTML content
fn text_of(e: &BytesText<'_>) -> String {
    match e.unescape() {
        Ok(text) => text.into_owned(),
        Err(_) => {
            let raw: &[u8] = e;
            let raw = String::from_utf8_lossy(raw);
            html_escape::decode_html_entities(&raw).into_owned()
        }
    }
}

fn attr(e: &BytesStart<'_>, local: &[u8]) -> Option<String> {
    e.attributes()
        .flatten()
        .find(|a| a.key.local_name().as_ref() == local)
        .and_then(|a| a.unescape_value().ok().map(|v| v.into_owned()))
}

/// Text of the first element with the given local name
fn element_text(xml: &[u8], local: &[u8]) -> Option<String> {
    let mut reader = xml_reader(xml);
    let mut buf = Vec::new();
    let mut inside = false;
    let mut text = String::new();

    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(e)) if e.local_name().as_ref() == local => inside = true,
            Ok(Event::Text(e)) if inside => text.push_str(&text_of(&e)),
            Ok(Event::End(e)) if inside && e.local_name().as_ref() == local => break,
            Ok(Event::Eof) | Err(_) => break,
            _ => {}
        }
        buf.clear();
    }

    let text = text.trim().to_string();
    (!text.is_empty()).then_some(text)
}

// =============================================================================
// Block assembly
// =============================================================================

#[derive(Default)]
struct TableState {
    rows: Vec<Vec<String>>,
    row: Vec<String>,
    cell: String,
}

/// Collects paragraphs and tables into markdown blocks
#[derive(Default)]
struct DocBuilder {
    blocks: Vec<String>,
    para: String,
    heading: Option<usize>,
    list_item: bool,
    tables: Vec<TableState>,
}

impl DocBuilder {
    fn start_paragraph(&mut self) {
        self.para.clear();
        self.heading = None;
    }

    fn push_text(&mut self, text: &str) {
        self.para.push_str(text);
    }

    fn end_paragraph(&mut self) {
        let text = self.para.trim().to_string();
        self.para.clear();
        let list_item = std::mem::take(&mut self.list_item);
        let heading = self.heading.take();
        if text.is_empty() {
            return;
        }

        if let Some(table) = self.tables.last_mut() {
            if !table.cell.is_empty() {
                table.cell.push('\n');
            }
            table.cell.push_str(&text);
            return;
        }

        let block = match heading {
            Some(level) => format!("{} {}", "#".repeat(level.clamp(1, 6)), text),
            None if list_item => format!("- {text}"),
            None => text,
        };
        self.push_block(block);
    }

    fn push_block(&mut self, block: String) {
        // Consecutive list items stay in one block
        if block.starts_with("- ") {
            if let Some(last) = self.blocks.last_mut() {
                if last.starts_with("- ") {
                    last.push('\n');
                    last.push_str(&block);
                    return;
                }
            }
        }
        self.blocks.push(block);
    }

    fn start_table(&mut self) {
        self.tables.push(TableState::default());
    }

    fn start_row(&mut self) {
        if let Some(table) = self.tables.last_mut() {
            table.row.clear();
        }
    }

    fn start_cell(&mut self) {
        if let Some(table) = self.tables.last_mut() {
            table.cell.clear();
        }
    }

    fn end_cell(&mut self, repeat: usize) {
        // Loose text directly inside a cell
        if !self.para.trim().is_empty() {
            self.end_paragraph();
        }
        if let Some(table) = self.tables.last_mut() {
            let cell = std::mem::take(&mut table.cell);
            for _ in 1..repeat {
                table.row.push(cell.clone());
            }
            table.row.push(cell);
        }
    }

    fn end_row(&mut self) {
        if let Some(table) = self.tables.last_mut() {
            let mut row = std::mem::take(&mut table.row);
            while row.last().is_some_and(|c| c.is_empty()) {
                row.pop();
            }
            if !row.is_empty() {
                table.rows.push(row);
            }
        }
    }

    fn end_table(&mut self) {
        let Some(table) = self.tables.pop() else {
            return;
        };
        if table.rows.is_empty() {
            return;
        }
        match self.tables.last_mut() {
            // Nested table: flatten into the enclosing cell
            Some(outer) => {
                let flat: Vec<String> = table.rows.iter().map(|r| r.join(" ")).collect();
                if !outer.cell.is_empty() {
                    outer.cell.push('\n');
                }
                outer.cell.push_str(&flat.join("\n"));
            }
            None => {
                let rendered = markdown_table(&table.rows);
                self.blocks.push(rendered);
            }
        }
    }

    fn finish(mut self) -> String {
        if !self.para.trim().is_empty() {
            self.end_paragraph();
        }
        while !self.tables.is_empty() {
            self.end_table();
        }
        self.blocks.join("\n\n")
    }
}

// =============================================================================
// WordprocessingML
// =============================================================================

fn heading_level_from_style(style: &str) -> Option<usize> {
    let lower = style.to_lowercase();
    if lower == "title" {
        return Some(1);
    }
    lower
        .strip_prefix("heading")
        .map(|rest| rest.trim_start_matches(|c: char| !c.is_ascii_digit()))
        .and_then(|digits| digits.parse::<usize>().ok())
}

fn walk_docx(xml: &[u8]) -> String {
    let mut reader = xml_reader(xml);
    let mut buf = Vec::new();
    let mut doc = DocBuilder::default();
    let mut in_text = false;

    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(e)) => match e.local_name().as_ref() {
                b"p" => doc.start_paragraph(),
                b"t" => in_text = true,
                b"tbl" => doc.start_table(),
                b"tr" => doc.start_row(),
                b"tc" => doc.start_cell(),
                b"pStyle" => doc.heading = attr(&e, b"val").and_then(|s| heading_level_from_style(&s)),
                b"numPr" => doc.list_item = true,
                _ => {}
            },
            Ok(Event::Empty(e)) => match e.local_name().as_ref() {
                b"pStyle" => doc.heading = attr(&e, b"val").and_then(|s| heading_level_from_style(&s)),
                b"numPr" | b"numId" => doc.list_item = true,
                b"tab" => doc.push_text("\t"),
                b"br" | b"cr" => doc.push_text("\n"),
                _ => {}
            },
            Ok(Event::Text(e)) if in_text => doc.push_text(&text_of(&e)),
            Ok(Event::End(e)) => match e.local_name().as_ref() {
                b"t" => in_text = false,
                b"p" => doc.end_paragraph(),
                b"tc" => doc.end_cell(1),
                b"tr" => doc.end_row(),
                b"tbl" => doc.end_table(),
                _ => {}
            },
            Ok(Event::Eof) | Err(_) => break,
            _ => {}
        }
        buf.clear();
    }

    doc.finish()
}

// =============================================================================
// SpreadsheetML
// =============================================================================

fn convert_xlsx(pkg: &mut Package<'_>, metadata: &mut DocumentMetadata) -> ParseResult<String> {
    let shared = read_part(pkg, "xl/sharedStrings.xml")?
        .map(|xml| shared_strings(&xml))
        .unwrap_or_default();
    let rels = read_part(pkg, "xl/_rels/workbook.xml.rels")?
        .map(|xml| relationships(&xml))
        .unwrap_or_default();
    let workbook = require_part(pkg, "xl/workbook.xml")?;

    let mut blocks = Vec::new();
    for (index, (name, rel_id)) in workbook_sheets(&workbook).into_iter().enumerate() {
        let target = rels
            .get(&rel_id)
            .map(|t| resolve_part_path("xl/", t))
            .unwrap_or_else(|| format!("xl/worksheets/sheet{}.xml", index + 1));
        let Some(xml) = read_part(pkg, &target)? else {
            metadata.notes.push(format!("sheet {name} missing from package"));
            continue;
        };

        let (rows, truncated) = sheet_rows(&xml, &shared);
        if truncated {
            metadata.notes.push(format!("sheet {name} truncated"));
        }
        if rows.is_empty() {
            continue;
        }
        blocks.push(format!("## {name}\n\n{}", markdown_table(&rows)));
    }
    metadata.page_count = Some(blocks.len());
    Ok(blocks.join("\n\n"))
}

fn shared_strings(xml: &[u8]) -> Vec<String> {
    let mut reader = xml_reader(xml);
    let mut buf = Vec::new();
    let mut strings = Vec::new();
    let mut current = String::new();
    let mut in_text = false;
    // Phonetic runs repeat the base text
    let mut in_phonetic = false;

    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(e)) => match e.local_name().as_ref() {
                b"si" => current.clear(),
                b"t" => in_text = true,
                b"rPh" => in_phonetic = true,
                _ => {}
            },
            Ok(Event::Empty(e)) if e.local_name().as_ref() == b"si" => strings.push(String::new()),
            Ok(Event::Text(e)) if in_text && !in_phonetic => current.push_str(&text_of(&e)),
            Ok(Event::End(e)) => match e.local_name().as_ref() {
                b"si" => strings.push(std::mem::take(&mut current)),
                b"t" => in_text = false,
                b"rPh" => in_phonetic = false,
                _ => {}
            },
            Ok(Event::Eof) | Err(_) => break,
            _ => {}
        }
        buf.clear();
    }
    strings
}

fn relationships(xml: &[u8]) -> HashMap<String, String> {
    let mut reader = xml_reader(xml);
    let mut buf = Vec::new();
    let mut rels = HashMap::new();

    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(e) | Event::Empty(e)) if e.local_name().as_ref() == b"Relationship" => {
                if let (Some(id), Some(target)) = (attr(&e, b"Id"), attr(&e, b"Target")) {
                    rels.insert(id, target);
                }
            }
            Ok(Event::Eof) | Err(_) => break,
            _ => {}
        }
        buf.clear();
    }
    rels
}

/// `(sheet name, relationship id)` in workbook order
fn workbook_sheets(xml: &[u8]) -> Vec<(String, String)> {
    let mut reader = xml_reader(xml);
    let mut buf = Vec::new();
    let mut sheets = Vec::new();

    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(e) | Event::Empty(e)) if e.local_name().as_ref() == b"sheet" => {
                let name = attr(&e, b"name").unwrap_or_else(|| format!("Sheet{}", sheets.len() + 1));
                let rel_id = attr(&e, b"id").unwrap_or_default();
                sheets.push((name, rel_id));
            }
            Ok(Event::Eof) | Err(_) => break,
            _ => {}
        }
        buf.clear();
    }
    sheets
}

/// Zero-based column index from a cell reference such as `BC12`
fn column_index(reference: &str) -> Option<usize> {
    let letters: String = reference.chars().take_while(|c| c.is_ascii_alphabetic()).collect();
    if letters.is_empty() {
        return None;
    }
    let index = letters
        .to_ascii_uppercase()
        .bytes()
        .fold(0usize, |acc, b| acc * 26 + (b - b'A' + 1) as usize);
    Some(index - 1)
}

fn sheet_rows(xml: &[u8], shared: &[String]) -> (Vec<Vec<String>>, bool) {
    let mut reader = xml_reader(xml);
    let mut buf = Vec::new();
    let mut rows: Vec<Vec<String>> = Vec::new();
    let mut row: Vec<String> = Vec::new();
    let mut truncated = false;

    let mut cell_type = String::new();
    let mut cell_col: Option<usize> = None;
    let mut value = String::new();
    let mut in_value = false;

    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(e)) => match e.local_name().as_ref() {
                b"row" => row.clear(),
                b"c" => {
                    cell_type = attr(&e, b"t").unwrap_or_default();
                    cell_col = attr(&e, b"r").as_deref().and_then(column_index);
                    value.clear();
                }
                b"v" | b"t" => in_value = true,
                _ => {}
            },
            Ok(Event::Text(e)) if in_value => value.push_str(&text_of(&e)),
            Ok(Event::End(e)) => match e.local_name().as_ref() {
                b"v" | b"t" => in_value = false,
                b"c" => {
                    let col = cell_col.unwrap_or(row.len());
                    if col >= MAX_SHEET_COLS {
                        truncated = true;
                        value.clear();
                    } else {
                        let text = match cell_type.as_str() {
                            "s" => value
                                .trim()
                                .parse::<usize>()
                                .ok()
                                .and_then(|i| shared.get(i).cloned())
                                .unwrap_or_default(),
                            "b" if value.trim() == "1" => "TRUE".to_string(),
                            "b" => "FALSE".to_string(),
                            _ => value.clone(),
                        };
                        if row.len() <= col {
                            row.resize(col + 1, String::new());
                        }
                        row[col] = text;
                    }
                }
                b"row" => {
                    if rows.len() >= MAX_SHEET_ROWS {
                        truncated = true;
                        break;
                    }
                    while row.last().is_some_and(|c| c.trim().is_empty()) {
                        row.pop();
                    }
                    if !row.is_empty() {
                        rows.push(std::mem::take(&mut row));
                    }
                }
                _ => {}
            },
            Ok(Event::Eof) | Err(_) => break,
            _ => {}
        }
        buf.clear();
    }
    (rows, truncated)
}

// =============================================================================
// PresentationML
// =============================================================================

fn slide_number(name: &str, prefix: &str) -> Option<usize> {
    name.strip_prefix(prefix)?
        .strip_suffix(".xml")?
        .parse()
        .ok()
}

fn convert_pptx(pkg: &mut Package<'_>, metadata: &mut DocumentMetadata) -> ParseResult<String> {
    let mut slides: Vec<(usize, String)> = pkg
        .file_names()
        .filter_map(|n| slide_number(n, "ppt/slides/slide").map(|i| (i, n.to_string())))
        .collect();
    slides.sort();

    let mut blocks = Vec::new();
    for (position, (_, name)) in slides.iter().enumerate() {
        let Some(xml) = read_part(pkg, name)? else {
            continue;
        };
        let paragraphs = drawing_paragraphs(&xml);
        let mut block = format!("## Slide {}", position + 1);
        if !paragraphs.is_empty() {
            block.push_str("\n\n");
            block.push_str(&paragraphs.join("\n\n"));
        }
        blocks.push(block);
    }
    metadata.page_count = Some(slides.len());
    Ok(blocks.join("\n\n"))
}

/// Text paragraphs from DrawingML (`a:p` / `a:t`)
fn drawing_paragraphs(xml: &[u8]) -> Vec<String> {
    let mut reader = xml_reader(xml);
    let mut buf = Vec::new();
    let mut paragraphs = Vec::new();
    let mut para = String::new();
    let mut in_text = false;

    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(e)) => match e.local_name().as_ref() {
                b"p" => para.clear(),
                b"t" => in_text = true,
                _ => {}
            },
            Ok(Event::Empty(e)) if e.local_name().as_ref() == b"br" => para.push('\n'),
            Ok(Event::Text(e)) if in_text => para.push_str(&text_of(&e)),
            Ok(Event::End(e)) => match e.local_name().as_ref() {
                b"t" => in_text = false,
                b"p" => {
                    let text = para.trim();
                    if !text.is_empty() {
                        paragraphs.push(text.to_string());
                    }
                    para.clear();
                }
                _ => {}
            },
            Ok(Event::Eof) | Err(_) => break,
            _ => {}
        }
        buf.clear();
    }
    paragraphs
}

// =============================================================================
// OpenDocument
// =============================================================================

fn walk_odf(xml: &[u8], spreadsheet: bool) -> String {
    let mut reader = xml_reader(xml);
    let mut buf = Vec::new();
    let mut doc = DocBuilder::default();
    let mut in_paragraph = false;
    let mut cell_repeat = 1;
    let mut pages = 0;
    // Annotations and tracked changes are not body text
    let mut skip_depth = 0usize;

    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(e)) => {
                let name = e.local_name();
                if skip_depth > 0 {
                    skip_depth += 1;
                } else {
                    match name.as_ref() {
                        b"annotation" | b"tracked-changes" => skip_depth = 1,
                        b"h" => {
                            doc.start_paragraph();
                            doc.heading = Some(
                                attr(&e, b"outline-level")
                                    .and_then(|l| l.parse().ok())
                                    .unwrap_or(1),
                            );
                            in_paragraph = true;
                        }
                        b"p" => {
                            doc.start_paragraph();
                            in_paragraph = true;
                        }
                        b"list-item" => doc.list_item = true,
                        b"page" => {
                            pages += 1;
                            let title = attr(&e, b"name")
                                .filter(|n| !n.to_lowercase().starts_with("page"))
                                .map(|n| format!(": {n}"))
                                .unwrap_or_default();
                            doc.push_block(format!("## Slide {pages}{title}"));
                        }
                        b"table" => {
                            if spreadsheet {
                                if let Some(sheet) = attr(&e, b"name") {
                                    doc.push_block(format!("## {sheet}"));
                                }
                            }
                            doc.start_table();
                        }
                        b"table-row" => doc.start_row(),
                        b"table-cell" => {
                            cell_repeat = attr(&e, b"number-columns-repeated")
                                .and_then(|n| n.parse::<usize>().ok())
                                .unwrap_or(1)
                                .clamp(1, MAX_REPEATED_CELLS);
                            doc.start_cell();
                        }
                        _ => {}
                    }
                }
            }
            Ok(Event::Empty(e)) if skip_depth == 0 => match e.local_name().as_ref() {
                b"s" => {
                    let count = attr(&e, b"c").and_then(|c| c.parse().ok()).unwrap_or(1usize);
                    doc.push_text(&" ".repeat(count.min(64)));
                }
                b"tab" => doc.push_text("\t"),
                b"line-break" => doc.push_text("\n"),
                // An empty cell still holds its column
                b"table-cell" => {
                    doc.start_cell();
                    doc.end_cell(1);
                }
                _ => {}
            },
            Ok(Event::Text(e)) if skip_depth == 0 && in_paragraph => doc.push_text(&text_of(&e)),
            Ok(Event::End(e)) => {
                if skip_depth > 0 {
                    skip_depth -= 1;
                } else {
                    match e.local_name().as_ref() {
                        b"h" | b"p" => {
                            doc.end_paragraph();
                            in_paragraph = false;
                        }
                        b"list-item" => doc.list_item = false,
                        b"table-cell" => {
                            doc.end_cell(cell_repeat);
                            cell_repeat = 1;
                        }
                        b"table-row" => doc.end_row(),
                        b"table" => doc.end_table(),
                        _ => {}
                    }
                }
            }
            Ok(Event::Eof) | Err(_) => break,
            _ => {}
        }
        buf.clear();
    }

    doc.finish()
}

// =============================================================================
// EPUB
// =============================================================================

struct ManifestItem {
    href: String,
    media_type: String,
}

fn convert_epub(pkg: &mut Package<'_>, metadata: &mut DocumentMetadata) -> ParseResult<String> {
    let container = require_part(pkg, "META-INF/container.xml")?;
    let opf_path = first_attr(&container, b"rootfile", b"full-path")
        .ok_or_else(|| ParseError::InvalidContent("container.xml has no rootfile".to_string()))?;
    let opf = require_part(pkg, &opf_path)?;
    let base = match opf_path.rfind('/') {
        Some(idx) => opf_path[..=idx].to_string(),
        None => String::new(),
    };

    metadata.title = element_text(&opf, b"title");
    let (manifest, spine) = opf_manifest_and_spine(&opf);

    let mut chapters = Vec::new();
    for idref in &spine {
        let Some(item) = manifest.get(idref) else {
            continue;
        };
        if !item.media_type.contains("html") {
            continue;
        }
        let path = resolve_part_path(&base, &item.href);
        let Some(xhtml) = read_part(pkg, &path)? else {
            metadata.notes.push(format!("spine item {path} missing"));
            continue;
        };
        let (text, images) = xhtml_to_markdown(&xhtml);
        metadata.image_refs.extend(images);
        if !text.is_empty() {
            chapters.push(text);
        }
    }
    metadata.page_count = Some(chapters.len());
    Ok(chapters.join("\n\n"))
}

fn first_attr(xml: &[u8], element: &[u8], name: &[u8]) -> Option<String> {
    let mut reader = xml_reader(xml);
    let mut buf = Vec::new();
    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(e) | Event::Empty(e)) if e.local_name().as_ref() == element => {
                return attr(&e, name);
            }
            Ok(Event::Eof) | Err(_) => return None,
            _ => {}
        }
        buf.clear();
    }
}

fn opf_manifest_and_spine(opf: &[u8]) -> (HashMap<String, ManifestItem>, Vec<String>) {
    let mut reader = xml_reader(opf);
    let mut buf = Vec::new();
    let mut manifest = HashMap::new();
    let mut spine = Vec::new();

    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(e) | Event::Empty(e)) => match e.local_name().as_ref() {
                b"item" => {
                    if let (Some(id), Some(href)) = (attr(&e, b"id"), attr(&e, b"href")) {
                        let media_type = attr(&e, b"media-type").unwrap_or_default();
                        manifest.insert(id, ManifestItem { href, media_type });
                    }
                }
                b"itemref" => {
                    if let Some(idref) = attr(&e, b"idref") {
                        spine.push(idref);
                    }
                }
                _ => {}
            },
            Ok(Event::Eof) | Err(_) => break,
            _ => {}
        }
        buf.clear();
    }
    (manifest, spine)
}

/// Join a relative href onto a package directory, resolving `.` and `..`
fn resolve_part_path(base: &str, href: &str) -> String {
    let href = href.split('#').next().unwrap_or_default();
    let href = urlencoding::decode(href)
        .map(|h| h.into_owned())
        .unwrap_or_else(|_| href.to_string());

    let joined = match href.strip_prefix('/') {
        Some(absolute) => absolute.to_string(),
        None => format!("{base}{href}"),
    };

    let mut parts: Vec<&str> = Vec::new();
    for segment in joined.split('/') {
        match segment {
            "" | "." => {}
            ".." => {
                parts.pop();
            }
            s => parts.push(s),
        }
    }
    parts.join("/")
}

fn heading_tag_level(name: &[u8]) -> Option<usize> {
    match name {
        [b'h', d @ b'1'..=b'6'] => Some((d - b'0') as usize),
        _ => None,
    }
}

fn is_block_tag(name: &[u8]) -> bool {
    matches!(
        name,
        b"p" | b"div"
            | b"li"
            | b"tr"
            | b"blockquote"
            | b"section"
            | b"article"
            | b"pre"
            | b"dt"
            | b"dd"
            | b"figcaption"
    ) || heading_tag_level(name).is_some()
}

/// Plain markdown from one XHTML chapter, plus referenced images
fn xhtml_to_markdown(xhtml: &[u8]) -> (String, Vec<String>) {
    let mut reader = xml_reader(xhtml);
    let mut buf = Vec::new();
    let mut blocks: Vec<String> = Vec::new();
    let mut images = Vec::new();
    let mut current = String::new();
    let mut heading: Option<usize> = None;
    let mut list_item = false;
    let mut skip_depth = 0usize;

    let flush = |current: &mut String,
                 heading: &mut Option<usize>,
                 list_item: &mut bool,
                 blocks: &mut Vec<String>| {
        let text = current.split_whitespace().collect::<Vec<_>>().join(" ");
        current.clear();
        if !text.is_empty() {
            let block = match heading.take() {
                Some(level) => format!("{} {}", "#".repeat(level), text),
                None if *list_item => format!("- {text}"),
                None => text,
            };
            blocks.push(block);
        }
        *heading = None;
        *list_item = false;
    };

    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(e)) => {
                let name = e.local_name();
                let name = name.as_ref();
                if skip_depth > 0 || matches!(name, b"head" | b"script" | b"style") {
                    skip_depth += 1;
                } else if is_block_tag(name) {
                    flush(&mut current, &mut heading, &mut list_item, &mut blocks);
                    heading = heading_tag_level(name);
                    list_item = name == b"li";
                }
            }
            Ok(Event::Empty(e)) if skip_depth == 0 => match e.local_name().as_ref() {
                b"br" => current.push('\n'),
                b"img" | b"image" => {
                    if let Some(src) = attr(&e, b"src").or_else(|| attr(&e, b"href")) {
                        images.push(src);
                    }
                }
                _ => {}
            },
            Ok(Event::Text(e)) if skip_depth == 0 => {
                current.push_str(&text_of(&e));
                current.push(' ');
            }
            Ok(Event::CData(e)) if skip_depth == 0 => {
                current.push_str(&String::from_utf8_lossy(&e));
            }
            Ok(Event::End(e)) => {
                if skip_depth > 0 {
                    skip_depth -= 1;
                } else if is_block_tag(e.local_name().as_ref()) {
                    flush(&mut current, &mut heading, &mut list_item, &mut blocks);
                }
            }
            Ok(Event::Eof) | Err(_) => break,
            _ => {}
        }
        buf.clear();
    }
    flush(&mut current, &mut heading, &mut list_item, &mut blocks);

    (blocks.join("\n\n"), images)
}
