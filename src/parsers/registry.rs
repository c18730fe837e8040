//! Static table of parsers, their extensions and dependencies
//!
//! The registry is pure data. It never probes dependencies or builds
//! parsers; that is the loader's job.

use std::collections::HashMap;
use std::path::Path;

use serde::Serialize;
use thiserror::Error;

use super::types::ParserId;
use crate::cache::Namespace;

/// Registry construction errors
#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("extension {extension} already registered to {existing}, cannot add {parser_id}")]
    DuplicateExtension {
        extension: String,
        existing: ParserId,
        parser_id: ParserId,
    },

    #[error("parser {0} registered twice")]
    DuplicateParser(ParserId),
}

/// What a dependency needs to be usable
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DependencyKind {
    /// Compiled in behind a cargo feature
    Feature { enabled: bool },
    /// External program; any one of the candidates on `PATH` will do
    Executable { candidates: Vec<&'static str> },
}

/// One requirement of a parser
#[derive(Debug, Clone, Serialize)]
pub struct Dependency {
    pub name: &'static str,
    #[serde(flatten)]
    pub kind: DependencyKind,
}

impl Dependency {
    pub fn feature(name: &'static str, enabled: bool) -> Self {
        Self {
            name,
            kind: DependencyKind::Feature { enabled },
        }
    }

    pub fn executable(name: &'static str, candidates: &[&'static str]) -> Self {
        Self {
            name,
            kind: DependencyKind::Executable {
                candidates: candidates.to_vec(),
            },
        }
    }
}

/// Static description of a parser
#[derive(Debug, Clone, Serialize)]
pub struct ParserDescriptor {
    pub parser_id: ParserId,
    /// Bumping this invalidates every cached result of the parser
    pub version: &'static str,
    pub extensions: Vec<String>,
    pub dependencies: Vec<Dependency>,
    /// Where results of this parser are cached
    pub namespace: Namespace,
}

impl ParserDescriptor {
    pub fn new(parser_id: ParserId, version: &'static str, extensions: &[&str]) -> Self {
        Self {
            parser_id,
            version,
            extensions: extensions.iter().map(|e| normalize_extension(e)).collect(),
            dependencies: Vec::new(),
            namespace: Namespace::ParsedDocument,
        }
    }

    pub fn depends_on(mut self, dependency: Dependency) -> Self {
        self.dependencies.push(dependency);
        self
    }

    pub fn cached_in(mut self, namespace: Namespace) -> Self {
        self.namespace = namespace;
        self
    }
}

/// Lowercase with exactly one leading dot
pub fn normalize_extension(ext: &str) -> String {
    format!(".{}", ext.trim().trim_start_matches('.').to_lowercase())
}

/// Extension → parser table
#[derive(Debug, Clone, Default)]
pub struct ParserRegistry {
    descriptors: Vec<ParserDescriptor>,
    by_extension: HashMap<String, usize>,
}

impl ParserRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// The built-in parser table
    pub fn builtin() -> Self {
        let descriptors = [
            ParserDescriptor::new(ParserId::PDF, "1.2.0", &["pdf"])
                .depends_on(Dependency::feature("mupdf", cfg!(feature = "pdf"))),
            ParserDescriptor::new(
                ParserId::OFFICE,
                "1.2.0",
                &["docx", "xlsx", "pptx", "odt", "ods", "odp", "epub"],
            ),
            ParserDescriptor::new(ParserId::LEGACY_OFFICE, "1.1.0", &["doc", "xls", "ppt", "rtf"])
                .depends_on(Dependency::executable("libreoffice", &["soffice", "libreoffice"])),
            ParserDescriptor::new(ParserId::TEXT, "1.1.0", &["txt", "md", "markdown", "json", "csv"]),
            ParserDescriptor::new(
                ParserId::IMAGE,
                "1.3.0",
                &["jpg", "jpeg", "png", "gif", "bmp", "webp", "tiff"],
            )
            .cached_in(Namespace::ExtractedImage),
            ParserDescriptor::new(
                ParserId::ARCHIVE,
                "1.0.0",
                &["zip", "tar", "gz", "tgz", "tar.gz", "tbz2", "tar.bz2"],
            )
            .cached_in(Namespace::ArchiveEntry),
        ];

        let mut registry = Self::new();
        for descriptor in descriptors {
            // The built-in table has no overlaps
            if let Err(e) = registry.register(descriptor) {
                tracing::error!(error = %e, "Built-in parser table is inconsistent");
            }
        }
        registry
    }

    /// Add a parser. Extensions must not already be claimed.
    pub fn register(&mut self, descriptor: ParserDescriptor) -> Result<(), RegistryError> {
        if self.descriptor(descriptor.parser_id).is_some() {
            return Err(RegistryError::DuplicateParser(descriptor.parser_id));
        }
        for ext in &descriptor.extensions {
            if let Some(&idx) = self.by_extension.get(ext) {
                return Err(RegistryError::DuplicateExtension {
                    extension: ext.clone(),
                    existing: self.descriptors[idx].parser_id,
                    parser_id: descriptor.parser_id,
                });
            }
        }

        let idx = self.descriptors.len();
        for ext in &descriptor.extensions {
            self.by_extension.insert(ext.clone(), idx);
        }
        self.descriptors.push(descriptor);
        Ok(())
    }

    /// Descriptor for an extension, case-insensitive, dot optional
    pub fn lookup(&self, extension: &str) -> Option<&ParserDescriptor> {
        self.by_extension
            .get(&normalize_extension(extension))
            .map(|&idx| &self.descriptors[idx])
    }

    pub fn descriptor(&self, parser_id: ParserId) -> Option<&ParserDescriptor> {
        self.descriptors.iter().find(|d| d.parser_id == parser_id)
    }

    pub fn dependencies_of(&self, parser_id: ParserId) -> &[Dependency] {
        self.descriptor(parser_id)
            .map(|d| d.dependencies.as_slice())
            .unwrap_or_default()
    }

    pub fn descriptors(&self) -> &[ParserDescriptor] {
        &self.descriptors
    }

    /// Every registered extension, sorted
    pub fn supported_extensions(&self) -> Vec<String> {
        let mut exts: Vec<String> = self.by_extension.keys().cloned().collect();
        exts.sort();
        exts
    }

    /// Extension of a file name or path.
    ///
    /// Registered multi-part extensions win (`a.tar.gz` → `.tar.gz`).
    /// Otherwise the last extension is returned, registered or not.
    pub fn extension_of(&self, path: impl AsRef<Path>) -> Option<String> {
        let name = path.as_ref().file_name()?.to_str()?.to_lowercase();
        // A leading dot marks a hidden file, not an extension
        let stem_start = name.len() - name.trim_start_matches('.').len();
        let body = &name[stem_start..];

        let dots: Vec<usize> = body.match_indices('.').map(|(i, _)| i).collect();
        for &pos in &dots {
            let candidate = &body[pos..];
            if candidate.len() > 1 && self.by_extension.contains_key(candidate) {
                return Some(candidate.to_string());
            }
        }
        dots.last()
            .map(|&pos| body[pos..].to_string())
            .filter(|ext| ext.len() > 1)
    }
}
