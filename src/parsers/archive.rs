//! Archives: zip, tar, gzip and bzip2 tarballs
//!
//! The archive itself renders as a file listing. Members with a registered
//! format are parsed through the shared cached-parse path, so each one is
//! cached on its own and reused when the same file shows up elsewhere.

use std::io::{Cursor, Read};
use std::path::{Component, Path};
use std::sync::Arc;

use async_trait::async_trait;
use bzip2::read::BzDecoder;
use flate2::read::GzDecoder;
use tracing::debug;
use zip::ZipArchive;

use super::error::{ParseError, ParseResult};
use super::traits::{ParseContext, Parser};
use super::types::{doc_type_of, DocumentMetadata, ParseInput, ParsedContent, ParserId};
use crate::reader::dispatch::{self, DispatchError};

/// Bounds applied while unpacking one archive
#[derive(Debug, Clone)]
pub struct ArchiveLimits {
    pub max_entries: usize,
    /// Archives nested deeper than this are listed but not opened
    pub max_depth: u32,
    pub max_entry_bytes: u64,
    /// Uncompressed bytes read across all members
    pub max_total_bytes: u64,
}

impl Default for ArchiveLimits {
    fn default() -> Self {
        Self {
            max_entries: 200,
            max_depth: 2,
            max_entry_bytes: 50 * 1024 * 1024,
            max_total_bytes: 200 * 1024 * 1024,
        }
    }
}

pub struct ArchiveParser {
    limits: ArchiveLimits,
}

impl ArchiveParser {
    pub fn new(limits: ArchiveLimits) -> Self {
        Self { limits }
    }
}

#[async_trait]
impl Parser for ArchiveParser {
    fn id(&self) -> ParserId {
        ParserId::ARCHIVE
    }

    async fn parse(&self, input: ParseInput, ctx: ParseContext) -> ParseResult<ParsedContent> {
        let limits = self.limits.clone();
        let bytes = input.bytes.clone();
        let extension = input.extension.clone();
        let name = input.name.clone();
        let listing = tokio::task::spawn_blocking(move || {
            read_members(&extension, &name, &bytes, &limits)
        })
        .await??;

        let mut metadata = DocumentMetadata {
            entries: listing.members.iter().map(|m| m.path.clone()).collect(),
            notes: listing.notes,
            ..Default::default()
        };

        let mut sections = vec![render_listing(&input.name, &listing.members, &ctx)];
        let nested = ctx.nested();
        for member in &listing.members {
            let Some(data) = &member.data else {
                continue;
            };
            let Some(ext) = ctx.registry().extension_of(&member.path) else {
                continue;
            };
            if ctx.registry().lookup(&ext).is_none() {
                continue;
            }
            if ctx.depth >= self.limits.max_depth {
                metadata
                    .notes
                    .push(format!("{}: not opened, nesting limit reached", member.path));
                continue;
            }

            match dispatch::parse_bytes(&nested, &member.path, &ext, data.clone(), &input.options).await {
                Ok(parsed) => {
                    debug!(archive = %input.name, member = %member.path, cache_hit = parsed.cache_hit, "Parsed archive member");
                    sections.push(format!("## {}\n\n{}", member.path, parsed.content.markdown));
                }
                Err(DispatchError::Unsupported(_)) => {}
                Err(e) => metadata.notes.push(format!("{}: {}", member.path, e)),
            }
        }

        Ok(ParsedContent::new(sections.join("\n\n"), doc_type_of(&input.extension)).with_metadata(metadata))
    }
}

// =============================================================================
// Unpacking
// =============================================================================

struct Member {
    path: String,
    size: u64,
    data: Option<Arc<Vec<u8>>>,
    skipped: Option<String>,
}

#[derive(Default)]
struct Listing {
    members: Vec<Member>,
    notes: Vec<String>,
}

struct Collector<'a> {
    limits: &'a ArchiveLimits,
    listing: Listing,
    total_bytes: u64,
}

impl<'a> Collector<'a> {
    fn new(limits: &'a ArchiveLimits) -> Self {
        Self {
            limits,
            listing: Listing::default(),
            total_bytes: 0,
        }
    }

    /// Whether another member may be added
    fn has_room(&mut self) -> bool {
        if self.listing.members.len() < self.limits.max_entries {
            return true;
        }
        if !self.listing.notes.iter().any(|n| n.starts_with("listing truncated")) {
            self.listing
                .notes
                .push(format!("listing truncated at {} entries", self.limits.max_entries));
        }
        false
    }

    fn add(&mut self, raw_path: &Path, declared_size: u64, reader: impl Read) -> ParseResult<()> {
        let Some(path) = sanitize_path(raw_path) else {
            self.listing
                .notes
                .push(format!("skipped unsafe path {}", raw_path.display()));
            return Ok(());
        };

        let skip = |reason: &str| Member {
            path: path.clone(),
            size: declared_size,
            data: None,
            skipped: Some(reason.to_string()),
        };

        if declared_size > self.limits.max_entry_bytes {
            self.listing.members.push(skip("larger than the entry size limit"));
            return Ok(());
        }
        if self.total_bytes + declared_size > self.limits.max_total_bytes {
            self.listing.members.push(skip("archive size limit reached"));
            return Ok(());
        }

        let mut data = Vec::new();
        reader
            .take(self.limits.max_entry_bytes + 1)
            .read_to_end(&mut data)?;
        if data.len() as u64 > self.limits.max_entry_bytes {
            self.listing.members.push(skip("larger than the entry size limit"));
            return Ok(());
        }

        self.total_bytes += data.len() as u64;
        self.listing.members.push(Member {
            path,
            size: data.len() as u64,
            data: Some(Arc::new(data)),
            skipped: None,
        });
        Ok(())
    }
}

/// Relative path made only of normal components, `/`-joined
fn sanitize_path(path: &Path) -> Option<String> {
    let mut parts = Vec::new();
    for component in path.components() {
        match component {
            Component::Normal(part) => parts.push(part.to_string_lossy().into_owned()),
            Component::CurDir => {}
            _ => return None,
        }
    }
    (!parts.is_empty()).then(|| parts.join("/"))
}

fn read_members(extension: &str, name: &str, bytes: &[u8], limits: &ArchiveLimits) -> ParseResult<Listing> {
    let mut collector = Collector::new(limits);
    match extension {
        ".zip" => read_zip(bytes, &mut collector)?,
        ".tar" => read_tar(bytes, &mut collector)?,
        ".tar.gz" | ".tgz" => read_tar(GzDecoder::new(bytes), &mut collector)?,
        ".tar.bz2" | ".tbz2" => read_tar(BzDecoder::new(bytes), &mut collector)?,
        ".gz" => read_gzip(bytes, name, &mut collector)?,
        other => return Err(ParseError::Unsupported(other.to_string())),
    }
    Ok(collector.listing)
}

fn read_zip(bytes: &[u8], collector: &mut Collector<'_>) -> ParseResult<()> {
    let mut archive = ZipArchive::new(Cursor::new(bytes))?;
    for index in 0..archive.len() {
        if !collector.has_room() {
            break;
        }
        let file = archive.by_index(index)?;
        if file.is_dir() {
            continue;
        }
        // `enclosed_name` already refuses absolute and parent-relative paths
        match file.enclosed_name() {
            Some(path) => {
                let size = file.size();
                collector.add(&path, size, file)?;
            }
            None => collector
                .listing
                .notes
                .push(format!("skipped unsafe path {}", file.name())),
        }
    }
    Ok(())
}

fn read_tar(reader: impl Read, collector: &mut Collector<'_>) -> ParseResult<()> {
    let mut archive = tar::Archive::new(reader);
    let entries = archive
        .entries()
        .map_err(|e| ParseError::InvalidContent(format!("bad tar archive: {e}")))?;

    for entry in entries {
        if !collector.has_room() {
            break;
        }
        let entry = entry.map_err(|e| ParseError::InvalidContent(format!("bad tar entry: {e}")))?;
        if !entry.header().entry_type().is_file() {
            continue;
        }
        let path = entry
            .path()
            .map_err(|e| ParseError::InvalidContent(format!("bad tar path: {e}")))?
            .into_owned();
        let size = entry.size();
        collector.add(&path, size, entry)?;
    }
    Ok(())
}

/// A lone gzip stream holds exactly one file
fn read_gzip(bytes: &[u8], archive_name: &str, collector: &mut Collector<'_>) -> ParseResult<()> {
    let mut decoder = GzDecoder::new(bytes);
    let mut data = Vec::new();
    (&mut decoder)
        .take(collector.limits.max_entry_bytes + 1)
        .read_to_end(&mut data)
        .map_err(|e| ParseError::InvalidContent(format!("bad gzip stream: {e}")))?;

    let inner_name = decoder
        .header()
        .and_then(|h| h.filename())
        .map(|f| String::from_utf8_lossy(f).into_owned())
        .filter(|f| !f.is_empty())
        .unwrap_or_else(|| {
            let base = archive_name.rsplit('/').next().unwrap_or(archive_name);
            base.strip_suffix(".gz")
                .or_else(|| base.strip_suffix(".GZ"))
                .unwrap_or(base)
                .to_string()
        });

    let size = data.len() as u64;
    collector.add(Path::new(&inner_name), size, Cursor::new(data))
}

// =============================================================================
// Rendering
// =============================================================================

fn human_size(bytes: u64) -> String {
    const UNITS: [&str; 4] = ["KB", "MB", "GB", "TB"];
    if bytes < 1024 {
        return format!("{bytes} B");
    }
    let mut value = bytes as f64 / 1024.0;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    format!("{value:.1} {}", UNITS[unit])
}

fn render_listing(name: &str, members: &[Member], ctx: &ParseContext) -> String {
    let total: u64 = members.iter().map(|m| m.size).sum();
    let mut out = format!(
        "# Archive: {name}\n\n{} file(s), {} uncompressed\n\n## Contents\n",
        members.len(),
        human_size(total)
    );

    for member in members {
        let mut line = format!("\n- {} ({}", member.path, human_size(member.size));
        let supported = ctx
            .registry()
            .extension_of(&member.path)
            .is_some_and(|ext| ctx.registry().lookup(&ext).is_some());
        if !supported {
            if let Some(mime) = mime_guess::from_path(&member.path).first_raw() {
                line.push_str(", ");
                line.push_str(mime);
            }
        }
        line.push(')');
        if let Some(reason) = &member.skipped {
            line.push_str(&format!(" skipped: {reason}"));
        }
        out.push_str(&line);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::{CacheConfig, CacheManager, Namespace, ProcessingOptions};
    use crate::parsers::office::tests::build_zip;
    use crate::parsers::{ParserLoader, ParserSettings};
    use flate2::write::GzEncoder;
    use flate2::Compression;
    use std::io::Write;
    use tempfile::TempDir;

    fn ctx_with(dir: &TempDir, limits: ArchiveLimits) -> ParseContext {
        let config = CacheConfig {
            root_dir: dir.path().to_path_buf(),
            ..Default::default()
        };
        let settings = ParserSettings {
            archive: limits,
            ..Default::default()
        };
        ParseContext::new(CacheManager::new(config), ParserLoader::builtin(settings))
    }

    fn input(name: &str, ext: &str, bytes: Vec<u8>) -> ParseInput {
        ParseInput {
            name: name.to_string(),
            extension: ext.to_string(),
            bytes: Arc::new(bytes),
            options: ProcessingOptions::default(),
        }
    }

    fn tar_bytes(files: &[(&str, &[u8])]) -> Vec<u8> {
        let mut builder = tar::Builder::new(Vec::new());
        for (path, data) in files {
            let mut header = tar::Header::new_gnu();
            header.set_size(data.len() as u64);
            header.set_mode(0o644);
            header.set_cksum();
            builder.append_data(&mut header, path, *data).unwrap();
        }
        builder.into_inner().unwrap()
    }

    #[test]
    fn test_sanitize_path() {
        assert_eq!(sanitize_path(Path::new("a/./b.txt")).as_deref(), Some("a/b.txt"));
        assert_eq!(sanitize_path(Path::new("../etc/passwd")), None);
        assert_eq!(sanitize_path(Path::new("/abs/file")), None);
        assert_eq!(sanitize_path(Path::new(".")), None);
    }

    #[test]
    fn test_human_size() {
        assert_eq!(human_size(12), "12 B");
        assert_eq!(human_size(1536), "1.5 KB");
        assert_eq!(human_size(3 * 1024 * 1024), "3.0 MB");
    }

    #[tokio::test]
    async fn test_zip_members_parsed_and_cached() {
        let dir = TempDir::new().unwrap();
        let ctx = ctx_with(&dir, ArchiveLimits::default());
        let bytes = build_zip(&[
            ("docs/readme.txt", "Read me before anything else."),
            ("data.csv", "a,b\n1,2\n"),
            ("bin/tool.exe", "MZ"),
        ]);

        let parsed = ArchiveParser::new(ArchiveLimits::default())
            .parse(input("bundle.zip", ".zip", bytes), ctx.clone())
            .await
            .unwrap();

        assert_eq!(parsed.doc_type, "zip");
        assert_eq!(parsed.metadata.entries.len(), 3);
        assert!(parsed.markdown.starts_with("# Archive: bundle.zip"));
        assert!(parsed.markdown.contains("## docs/readme.txt\n\nRead me before anything else."));
        assert!(parsed.markdown.contains("| a | b |"));
        assert!(parsed.markdown.contains("- bin/tool.exe (2 B"));
        assert!(!parsed.markdown.contains("## bin/tool.exe"));

        let stats = ctx.cache.stats();
        let documents = stats
            .namespaces
            .iter()
            .find(|n| n.budget.namespace == Namespace::ParsedDocument)
            .unwrap();
        assert_eq!(documents.budget.entry_count, 2);
    }

    #[tokio::test]
    async fn test_tar_gz_and_entry_limit() {
        let dir = TempDir::new().unwrap();
        let limits = ArchiveLimits {
            max_entries: 2,
            ..Default::default()
        };
        let ctx = ctx_with(&dir, limits.clone());
        let tar = tar_bytes(&[
            ("one.txt", b"first file body"),
            ("two.txt", b"second file body"),
            ("three.txt", b"third file body"),
        ]);
        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(&tar).unwrap();
        let gz = encoder.finish().unwrap();

        let parsed = ArchiveParser::new(limits)
            .parse(input("set.tar.gz", ".tar.gz", gz), ctx)
            .await
            .unwrap();
        assert_eq!(parsed.metadata.entries, vec!["one.txt", "two.txt"]);
        assert!(parsed.metadata.notes.iter().any(|n| n.contains("truncated")));
        assert_eq!(parsed.doc_type, "tar_gz");
    }

    #[tokio::test]
    async fn test_single_gzip_file() {
        let dir = TempDir::new().unwrap();
        let ctx = ctx_with(&dir, ArchiveLimits::default());
        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(b"# Notes\n\ncompressed markdown").unwrap();
        let gz = encoder.finish().unwrap();

        let parsed = ArchiveParser::new(ArchiveLimits::default())
            .parse(input("notes.md.gz", ".gz", gz), ctx)
            .await
            .unwrap();
        assert_eq!(parsed.metadata.entries, vec!["notes.md"]);
        assert!(parsed.markdown.contains("## notes.md\n\n# Notes"));
    }

    #[tokio::test]
    async fn test_nesting_limit() {
        let dir = TempDir::new().unwrap();
        let limits = ArchiveLimits {
            max_depth: 1,
            ..Default::default()
        };
        let ctx = ctx_with(&dir, limits.clone());
        let inner = build_zip(&[("deep.txt", "text that is too deep to open")]);
        let mut writer = zip::ZipWriter::new(Cursor::new(Vec::new()));
        writer
            .start_file("inner.zip", zip::write::SimpleFileOptions::default())
            .unwrap();
        writer.write_all(&inner).unwrap();
        let outer = writer.finish().unwrap().into_inner();

        let parsed = ArchiveParser::new(limits)
            .parse(input("outer.zip", ".zip", outer), ctx)
            .await
            .unwrap();
        assert!(parsed.markdown.contains("## inner.zip\n\n# Archive: inner.zip"));
        assert!(parsed.markdown.contains("- deep.txt"));
        assert!(!parsed.markdown.contains("too deep to open"));
    }

    #[tokio::test]
    async fn test_oversized_member_is_listed_not_read() {
        let dir = TempDir::new().unwrap();
        let limits = ArchiveLimits {
            max_entry_bytes: 8,
            ..Default::default()
        };
        let ctx = ctx_with(&dir, limits.clone());
        let tar = tar_bytes(&[("big.txt", b"this body is longer than eight bytes")]);

        let parsed = ArchiveParser::new(limits)
            .parse(input("big.tar", ".tar", tar), ctx)
            .await
            .unwrap();
        assert!(parsed.markdown.contains("skipped: larger than the entry size limit"));
        assert!(!parsed.markdown.contains("## big.txt"));
    }

    #[tokio::test]
    async fn test_corrupt_zip() {
        let dir = TempDir::new().unwrap();
        let ctx = ctx_with(&dir, ArchiveLimits::default());
        let err = ArchiveParser::new(ArchiveLimits::default())
            .parse(input("bad.zip", ".zip", b"PK\x03\x04 nope".to_vec()), ctx)
            .await
            .unwrap_err();
        assert!(matches!(err, ParseError::InvalidContent(_)));
    }
}
