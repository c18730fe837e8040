//! Lazy, memoised parser instantiation
//!
//! Each registered parser moves through `unresolved → {ready, unavailable}`
//! exactly once per process. The first caller probes dependencies and runs
//! the factory; concurrent callers wait on the same cell and reuse the
//! outcome. Nothing is re-probed later, so a dependency installed while the
//! server runs needs a restart.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::OnceCell;
use tracing::{info, warn};

use super::archive::{ArchiveLimits, ArchiveParser};
use super::image::ImageParser;
use super::legacy::LegacyOfficeParser;
use super::office::OfficeParser;
use super::probe::{probe, ProbeResult};
use super::registry::{ParserDescriptor, ParserRegistry};
use super::text::TextParser;
use super::traits::Parser;
use super::types::ParserId;
use crate::cache::Namespace;
use crate::ocr::OcrConfig;

/// Settings handed to parser factories
#[derive(Debug, Clone)]
pub struct ParserSettings {
    pub ocr: OcrConfig,
    pub archive: ArchiveLimits,
    /// Upper bound for one external conversion (legacy office)
    pub conversion_timeout: Duration,
}

impl Default for ParserSettings {
    fn default() -> Self {
        Self {
            ocr: OcrConfig::default(),
            archive: ArchiveLimits::default(),
            conversion_timeout: Duration::from_secs(90),
        }
    }
}

impl ParserSettings {
    /// Settings that change what `parser_id` produces for the same input.
    /// Part of every cache key for that parser.
    pub fn fingerprint(&self, parser_id: ParserId) -> String {
        match parser_id {
            ParserId::IMAGE => self.ocr.fingerprint(),
            ParserId::ARCHIVE => {
                let limits = &self.archive;
                format!(
                    "entries={};depth={};entry_bytes={};total_bytes={}",
                    limits.max_entries, limits.max_depth, limits.max_entry_bytes, limits.max_total_bytes
                )
            }
            _ => String::new(),
        }
    }
}

/// Builds one parser instance
pub type ParserFactory =
    Arc<dyn Fn(&ParserSettings) -> Result<Arc<dyn Parser>, String> + Send + Sync>;

/// Parser id → factory
#[derive(Clone, Default)]
pub struct ParserFactories {
    factories: HashMap<ParserId, ParserFactory>,
}

impl ParserFactories {
    pub fn new() -> Self {
        Self::default()
    }

    /// Factories for every built-in format adapter
    pub fn builtin() -> Self {
        Self::new()
            .with(ParserId::PDF, pdf_factory)
            .with(ParserId::OFFICE, |_| {
                Ok(Arc::new(OfficeParser::new()) as Arc<dyn Parser>)
            })
            .with(ParserId::LEGACY_OFFICE, |settings| {
                LegacyOfficeParser::locate(settings.conversion_timeout)
                    .map(|p| Arc::new(p) as Arc<dyn Parser>)
            })
            .with(ParserId::TEXT, |_| {
                Ok(Arc::new(TextParser::new()) as Arc<dyn Parser>)
            })
            .with(ParserId::IMAGE, |settings| {
                Ok(Arc::new(ImageParser::new(settings.ocr.clone())) as Arc<dyn Parser>)
            })
            .with(ParserId::ARCHIVE, |settings| {
                Ok(Arc::new(ArchiveParser::new(settings.archive.clone())) as Arc<dyn Parser>)
            })
    }

    pub fn with<F>(mut self, parser_id: ParserId, factory: F) -> Self
    where
        F: Fn(&ParserSettings) -> Result<Arc<dyn Parser>, String> + Send + Sync + 'static,
    {
        self.factories.insert(parser_id, Arc::new(factory));
        self
    }

    fn get(&self, parser_id: ParserId) -> Option<&ParserFactory> {
        self.factories.get(&parser_id)
    }
}

#[cfg(feature = "pdf")]
fn pdf_factory(_: &ParserSettings) -> Result<Arc<dyn Parser>, String> {
    Ok(Arc::new(super::pdf::PdfParser::new()))
}

#[cfg(not(feature = "pdf"))]
fn pdf_factory(_: &ParserSettings) -> Result<Arc<dyn Parser>, String> {
    Err("pdf support not compiled in".to_string())
}

/// Why a parser cannot be used
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", content = "detail", rename_all = "snake_case")]
pub enum UnavailableReason {
    MissingDependencies(Vec<String>),
    LoadFailed(String),
}

impl fmt::Display for UnavailableReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::MissingDependencies(missing) => {
                write!(f, "missing dependencies: {}", missing.join("; "))
            }
            Self::LoadFailed(message) => write!(f, "failed to load: {message}"),
        }
    }
}

/// Memoised outcome of resolving one parser
pub struct LoadedParser {
    pub parser_id: ParserId,
    pub version: &'static str,
    pub namespace: Namespace,
    instance: Result<Arc<dyn Parser>, UnavailableReason>,
}

impl LoadedParser {
    pub fn parser(&self) -> Option<&Arc<dyn Parser>> {
        self.instance.as_ref().ok()
    }

    pub fn load_error(&self) -> Option<&UnavailableReason> {
        self.instance.as_ref().err()
    }
}

impl fmt::Debug for LoadedParser {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LoadedParser")
            .field("parser_id", &self.parser_id)
            .field("version", &self.version)
            .field("load_error", &self.load_error())
            .finish()
    }
}

/// Result of [`ParserLoader::resolve`]
#[derive(Clone)]
pub enum Resolution {
    Ready {
        loaded: Arc<LoadedParser>,
        parser: Arc<dyn Parser>,
    },
    Unavailable {
        parser_id: ParserId,
        reason: UnavailableReason,
    },
    Unsupported {
        extension: String,
    },
}

/// Diagnostic view of one parser
#[derive(Debug, Clone, Serialize)]
pub struct Availability {
    pub available: bool,
    pub version: &'static str,
    pub extensions: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<UnavailableReason>,
}

/// Resolves extensions to live parser instances
#[derive(Clone)]
pub struct ParserLoader {
    inner: Arc<ParserLoaderInner>,
}

struct ParserLoaderInner {
    registry: ParserRegistry,
    factories: ParserFactories,
    settings: ParserSettings,
    states: HashMap<ParserId, OnceCell<Arc<LoadedParser>>>,
}

impl ParserLoader {
    pub fn new(registry: ParserRegistry, factories: ParserFactories, settings: ParserSettings) -> Self {
        let states = registry
            .descriptors()
            .iter()
            .map(|d| (d.parser_id, OnceCell::new()))
            .collect();
        Self {
            inner: Arc::new(ParserLoaderInner {
                registry,
                factories,
                settings,
                states,
            }),
        }
    }

    /// Built-in registry and factories
    pub fn builtin(settings: ParserSettings) -> Self {
        Self::new(ParserRegistry::builtin(), ParserFactories::builtin(), settings)
    }

    pub fn registry(&self) -> &ParserRegistry {
        &self.inner.registry
    }

    pub fn settings(&self) -> &ParserSettings {
        &self.inner.settings
    }

    /// Resolve the parser responsible for an extension
    pub async fn resolve(&self, extension: &str) -> Resolution {
        match self.inner.registry.lookup(extension) {
            Some(descriptor) => self.resolve_id(descriptor.parser_id).await,
            None => Resolution::Unsupported {
                extension: extension.to_string(),
            },
        }
    }

    /// Resolve a parser by id
    pub async fn resolve_id(&self, parser_id: ParserId) -> Resolution {
        let (Some(descriptor), Some(cell)) = (
            self.inner.registry.descriptor(parser_id),
            self.inner.states.get(&parser_id),
        ) else {
            return Resolution::Unsupported {
                extension: parser_id.to_string(),
            };
        };

        let loaded = cell.get_or_init(|| self.load(descriptor)).await.clone();
        match loaded.instance.clone() {
            Ok(parser) => Resolution::Ready { loaded, parser },
            Err(reason) => Resolution::Unavailable { parser_id, reason },
        }
    }

    /// Resolve every registered parser. Diagnostics only.
    pub async fn available_parsers(&self) -> BTreeMap<ParserId, Availability> {
        let mut out = BTreeMap::new();
        for descriptor in self.inner.registry.descriptors() {
            let reason = match self.resolve_id(descriptor.parser_id).await {
                Resolution::Ready { .. } => None,
                Resolution::Unavailable { reason, .. } => Some(reason),
                Resolution::Unsupported { .. } => Some(UnavailableReason::LoadFailed(
                    "not registered".to_string(),
                )),
            };
            out.insert(
                descriptor.parser_id,
                Availability {
                    available: reason.is_none(),
                    version: descriptor.version,
                    extensions: descriptor.extensions.clone(),
                    reason,
                },
            );
        }
        out
    }

    /// Whether a parser has been resolved yet
    pub fn is_resolved(&self, parser_id: ParserId) -> bool {
        self.inner
            .states
            .get(&parser_id)
            .is_some_and(|cell| cell.initialized())
    }

    async fn load(&self, descriptor: &ParserDescriptor) -> Arc<LoadedParser> {
        let parser_id = descriptor.parser_id;
        let instance = self.instantiate(descriptor).await;

        match &instance {
            Ok(_) => info!(parser = %parser_id, version = descriptor.version, "Parser loaded"),
            Err(reason) => warn!(parser = %parser_id, %reason, "Parser unavailable"),
        }

        Arc::new(LoadedParser {
            parser_id,
            version: descriptor.version,
            namespace: descriptor.namespace,
            instance,
        })
    }

    async fn instantiate(
        &self,
        descriptor: &ParserDescriptor,
    ) -> Result<Arc<dyn Parser>, UnavailableReason> {
        let dependencies = descriptor.dependencies.clone();
        let probes = tokio::task::spawn_blocking(move || {
            dependencies.iter().map(probe).collect::<Vec<_>>()
        })
        .await
        .map_err(|e| UnavailableReason::LoadFailed(format!("dependency probe failed: {e}")))?;

        let missing: Vec<String> = probes
            .into_iter()
            .filter_map(|result| match result {
                ProbeResult::Available => None,
                ProbeResult::Missing { reason } => Some(reason),
            })
            .collect();
        if !missing.is_empty() {
            return Err(UnavailableReason::MissingDependencies(missing));
        }

        let factory = self
            .inner
            .factories
            .get(descriptor.parser_id)
            .ok_or_else(|| UnavailableReason::LoadFailed("no factory registered".to_string()))?;
        factory(&self.inner.settings).map_err(UnavailableReason::LoadFailed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parsers::registry::Dependency;
    use crate::parsers::{ParseContext, ParseInput, ParseResult, ParsedContent};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Echo;

    #[async_trait]
    impl Parser for Echo {
        fn id(&self) -> ParserId {
            ParserId::new("echo")
        }

        async fn parse(&self, input: ParseInput, _ctx: ParseContext) -> ParseResult<ParsedContent> {
            Ok(ParsedContent::new(
                String::from_utf8_lossy(&input.bytes).to_string(),
                "echo",
            ))
        }
    }

    fn counting_loader(counter: Arc<AtomicUsize>, dependency: Option<Dependency>) -> ParserLoader {
        let mut descriptor = ParserDescriptor::new(ParserId::new("echo"), "1", &["echo"]);
        if let Some(dep) = dependency {
            descriptor = descriptor.depends_on(dep);
        }
        let mut registry = ParserRegistry::new();
        registry.register(descriptor).unwrap();

        let factories = ParserFactories::new().with(ParserId::new("echo"), move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(Arc::new(Echo) as Arc<dyn Parser>)
        });
        ParserLoader::new(registry, factories, ParserSettings::default())
    }

    #[test]
    fn test_fingerprint_only_for_settings_dependent_parsers() {
        let defaults = ParserSettings::default();
        let tuned = ParserSettings {
            ocr: OcrConfig {
                provider: crate::ocr::OcrProviderKind::Tesseract,
                ..Default::default()
            },
            archive: ArchiveLimits {
                max_entries: 5,
                ..Default::default()
            },
            ..Default::default()
        };

        assert_eq!(defaults.fingerprint(ParserId::TEXT), "");
        assert_eq!(defaults.fingerprint(ParserId::TEXT), tuned.fingerprint(ParserId::TEXT));
        assert_ne!(defaults.fingerprint(ParserId::IMAGE), tuned.fingerprint(ParserId::IMAGE));
        assert_ne!(defaults.fingerprint(ParserId::ARCHIVE), tuned.fingerprint(ParserId::ARCHIVE));
    }

    #[tokio::test]
    async fn test_concurrent_first_use_instantiates_once() {
        let counter = Arc::new(AtomicUsize::new(0));
        let loader = counting_loader(counter.clone(), None);

        let mut handles = Vec::new();
        for _ in 0..16 {
            let loader = loader.clone();
            handles.push(tokio::spawn(async move { loader.resolve(".echo").await }));
        }
        for handle in handles {
            assert!(matches!(handle.await.unwrap(), Resolution::Ready { .. }));
        }
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_unavailable_is_memoized() {
        let counter = Arc::new(AtomicUsize::new(0));
        let loader = counting_loader(counter.clone(), Some(Dependency::feature("missing", false)));

        for _ in 0..3 {
            match loader.resolve("ECHO").await {
                Resolution::Unavailable { reason, .. } => {
                    assert!(matches!(reason, UnavailableReason::MissingDependencies(ref m) if m.len() == 1));
                }
                _ => panic!("expected unavailable"),
            }
        }
        assert_eq!(counter.load(Ordering::SeqCst), 0);
        assert!(loader.is_resolved(ParserId::new("echo")));
    }

    #[tokio::test]
    async fn test_factory_failure_is_load_failed() {
        let mut registry = ParserRegistry::new();
        registry
            .register(ParserDescriptor::new(ParserId::new("broken"), "1", &["brk"]))
            .unwrap();
        let factories =
            ParserFactories::new().with(ParserId::new("broken"), |_| Err("boom".to_string()));
        let loader = ParserLoader::new(registry, factories, ParserSettings::default());

        match loader.resolve(".brk").await {
            Resolution::Unavailable { reason, .. } => {
                assert_eq!(reason, UnavailableReason::LoadFailed("boom".to_string()))
            }
            _ => panic!("expected unavailable"),
        }
    }

    #[tokio::test]
    async fn test_unknown_extension_is_unsupported() {
        let loader = ParserLoader::builtin(ParserSettings::default());
        assert!(matches!(
            loader.resolve(".exe").await,
            Resolution::Unsupported { .. }
        ));
        assert!(!loader.is_resolved(ParserId::TEXT));
    }

    #[tokio::test]
    async fn test_available_parsers_resolves_everything() {
        let loader = ParserLoader::builtin(ParserSettings::default());
        let all = loader.available_parsers().await;

        assert_eq!(all.len(), 6);
        assert!(all[&ParserId::TEXT].available);
        assert!(all[&ParserId::OFFICE].available);
        assert!(all[&ParserId::ARCHIVE].available);
        assert_eq!(all[&ParserId::PDF].available, cfg!(feature = "pdf"));
        assert!(loader.is_resolved(ParserId::LEGACY_OFFICE));
    }
}
