//! FileReader: batch orchestration
//!
//! Each file goes through the same pipeline:
//!
//! ```text
//! stat → size check → extension lookup → streamed key → cache lookup
//!      → resolve parser → read → parse (spawned, timed) → length check → write-back
//! ```
//!
//! Files run concurrently up to the worker count. Results keep request order.

use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::stream::{self, StreamExt};
use tokio::task::JoinError;
use tracing::{debug, info, warn};

use super::dispatch::{cache_key, lookup, store};
use super::storage::{FileStat, FileStorage};
use super::types::{BatchError, BatchRequest, BatchResult, ErrorKind, FileOutcome, FileStatus};
use crate::cache::{digest_async_reader, digest_bytes, CacheManager, ProcessingOptions};
use crate::parsers::{ParseContext, ParseInput, ParsedContent, ParserLoader, Resolution};

/// Longest message passed back to callers
const MAX_MESSAGE_CHARS: usize = 300;

/// Limits applied to every batch
#[derive(Debug, Clone)]
pub struct ReaderConfig {
    pub max_file_size: u64,
    pub max_files_per_request: usize,
    pub max_workers: usize,
    pub timeout: Duration,
    /// Shorter extracted text counts as a failed parse
    pub min_content_length: usize,
}

impl Default for ReaderConfig {
    fn default() -> Self {
        Self {
            max_file_size: 20 * 1024 * 1024,
            max_files_per_request: 10,
            max_workers: 5,
            timeout: Duration::from_secs(120),
            min_content_length: 10,
        }
    }
}

/// Reads batches of files into markdown
#[derive(Clone)]
pub struct FileReader {
    inner: Arc<FileReaderInner>,
}

struct FileReaderInner {
    config: ReaderConfig,
    cache: CacheManager,
    loader: ParserLoader,
    storage: Arc<dyn FileStorage>,
}

impl FileReader {
    pub fn new(
        config: ReaderConfig,
        cache: CacheManager,
        loader: ParserLoader,
        storage: Arc<dyn FileStorage>,
    ) -> Self {
        Self {
            inner: Arc::new(FileReaderInner {
                config,
                cache,
                loader,
                storage,
            }),
        }
    }

    pub fn config(&self) -> &ReaderConfig {
        &self.inner.config
    }

    pub fn cache(&self) -> &CacheManager {
        &self.inner.cache
    }

    pub fn loader(&self) -> &ParserLoader {
        &self.inner.loader
    }

    /// Worker count for a request: the override clamped to `[1, max_workers]`
    pub fn worker_count(&self, requested: Option<usize>) -> usize {
        let max = self.inner.config.max_workers.max(1);
        requested.unwrap_or(max).clamp(1, max)
    }

    /// Read every file in the request.
    ///
    /// Only an oversized batch fails as a whole. Every other problem is
    /// reported on the file it belongs to.
    pub async fn read_files(&self, request: BatchRequest) -> Result<BatchResult, BatchError> {
        let max = self.inner.config.max_files_per_request;
        if request.paths.len() > max {
            warn!(count = request.paths.len(), max, "Rejecting oversized batch");
            return Err(BatchError::TooManyFiles {
                count: request.paths.len(),
                max,
            });
        }

        let started = Instant::now();
        let workers = self.worker_count(request.max_workers);
        let max_size = request
            .max_file_size
            .unwrap_or(self.inner.config.max_file_size);
        info!(files = request.paths.len(), workers, max_size, "Processing batch");

        let jobs: Vec<(String, ProcessingOptions)> = request
            .paths
            .iter()
            .map(|path| (path.clone(), request.options_for(path).clone()))
            .collect();

        let results: Vec<FileOutcome> = stream::iter(jobs)
            .map(|(path, options)| {
                let reader = self.clone();
                async move { reader.process_file(path, max_size, options).await }
            })
            .buffered(workers)
            .collect()
            .await;

        let batch = BatchResult { results };
        info!(
            success = batch.count(FileStatus::Success),
            cache_hits = batch.count(FileStatus::CacheHit),
            failed = batch.count(FileStatus::Failed),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Batch finished"
        );
        Ok(batch)
    }

    async fn process_file(&self, path: String, max_size: u64, options: ProcessingOptions) -> FileOutcome {
        let outcome = self.try_process(&path, max_size, &options).await;
        match outcome {
            Ok(outcome) => outcome,
            Err((kind, message)) => {
                debug!(path = %path, ?kind, message = %message, "File failed");
                FileOutcome::failed(path, kind, redact(&message))
            }
        }
    }

    async fn try_process(
        &self,
        path: &str,
        max_size: u64,
        options: &ProcessingOptions,
    ) -> Result<FileOutcome, (ErrorKind, String)> {
        let inner = &self.inner;
        let stat = inner
            .storage
            .stat(path)
            .await
            .map_err(|e| (ErrorKind::FileNotReadable, e.to_string()))?;

        if stat.size > max_size {
            return Err((
                ErrorKind::FileTooLarge,
                format!("file is {} bytes, limit is {} bytes", stat.size, max_size),
            ));
        }

        let registry = inner.loader.registry();
        let descriptor = registry
            .extension_of(&stat.path)
            .and_then(|ext| registry.lookup(&ext).map(|d| (ext, d)));
        let Some((extension, descriptor)) = descriptor else {
            let shown = registry
                .extension_of(&stat.path)
                .unwrap_or_else(|| "(none)".to_string());
            return Err((
                ErrorKind::UnsupportedFormat,
                format!("no parser for extension {shown}"),
            ));
        };

        let digest = self.streamed_digest(&stat).await?;
        let mut key = cache_key(&inner.loader, descriptor, &digest, options);
        let namespace = descriptor.namespace;

        if let Some(content) = lookup(&inner.cache, namespace, &key).await {
            debug!(path, parser = %descriptor.parser_id, "Served from cache");
            return Ok(success(path, FileStatus::CacheHit, content));
        }

        let parser = match inner.loader.resolve_id(descriptor.parser_id).await {
            Resolution::Ready { parser, .. } => parser,
            Resolution::Unavailable { parser_id, reason } => {
                return Err((
                    ErrorKind::DependencyUnavailable,
                    format!("parser {parser_id} unavailable, {reason}"),
                ))
            }
            Resolution::Unsupported { extension } => {
                return Err((
                    ErrorKind::UnsupportedFormat,
                    format!("no parser for extension {extension}"),
                ))
            }
        };

        let bytes = inner
            .storage
            .read(&stat)
            .await
            .map_err(|e| (ErrorKind::FileNotReadable, e.to_string()))?;
        // The file may have changed since it was hashed
        let read_digest = digest_bytes(&bytes);
        if read_digest != digest {
            debug!(path, "File changed while reading, re-keying");
            key = cache_key(&inner.loader, descriptor, &read_digest, options);
        }

        let input = ParseInput {
            name: stat
                .path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_else(|| path.to_string()),
            extension,
            bytes: Arc::new(bytes),
            options: options.clone(),
        };
        let ctx = ParseContext::new(inner.cache.clone(), inner.loader.clone());

        let started = Instant::now();
        let mut task = tokio::spawn(async move { parser.parse(input, ctx).await });
        let content = match tokio::time::timeout(inner.config.timeout, &mut task).await {
            Err(_) => {
                task.abort();
                warn!(path, timeout = ?inner.config.timeout, "Parser timed out");
                return Err((
                    ErrorKind::Timeout,
                    format!("processing exceeded {:?}", inner.config.timeout),
                ));
            }
            Ok(Err(join_error)) => return Err((ErrorKind::ProcessingError, join_failure(join_error))),
            Ok(Ok(Err(parse_error))) => return Err((ErrorKind::ProcessingError, parse_error.to_string())),
            Ok(Ok(Ok(content))) => content,
        };

        let length = content.markdown.trim().chars().count();
        if length < inner.config.min_content_length {
            return Err((
                ErrorKind::ProcessingError,
                format!(
                    "extracted content too short ({length} chars, minimum {})",
                    inner.config.min_content_length
                ),
            ));
        }

        store(&inner.cache, namespace, &key, &content).await;
        debug!(
            path,
            parser = %descriptor.parser_id,
            elapsed_ms = started.elapsed().as_millis() as u64,
            chars = length,
            "Parsed and cached"
        );
        Ok(success(path, FileStatus::Success, content))
    }

    async fn streamed_digest(&self, stat: &FileStat) -> Result<crate::cache::ContentDigest, (ErrorKind, String)> {
        let stream = self
            .inner
            .storage
            .open(stat)
            .await
            .map_err(|e| (ErrorKind::FileNotReadable, e.to_string()))?;
        digest_async_reader(stream)
            .await
            .map_err(|e| (ErrorKind::FileNotReadable, format!("cannot read file: {e}")))
    }
}

fn success(path: &str, status: FileStatus, content: ParsedContent) -> FileOutcome {
    FileOutcome {
        path: path.to_string(),
        status,
        content: Some(content.markdown),
        doc_type: Some(content.doc_type),
        metadata: Some(content.metadata),
        error: None,
    }
}

fn join_failure(error: JoinError) -> String {
    if error.is_panic() {
        warn!("Parser panicked");
        "parser crashed while processing the file".to_string()
    } else {
        "parser task was cancelled".to_string()
    }
}

/// First line only, bounded length
fn redact(message: &str) -> String {
    let first = message.lines().next().unwrap_or("").trim();
    if first.chars().count() <= MAX_MESSAGE_CHARS {
        return first.to_string();
    }
    let mut cut: String = first.chars().take(MAX_MESSAGE_CHARS).collect();
    cut.push('…');
    cut
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::{CacheConfig, Namespace};
    use crate::parsers::{
        ParseError, ParseResult, Parser, ParserDescriptor, ParserFactories, ParserId, ParserRegistry,
        ParserSettings,
    };
    use crate::reader::LocalFileStorage;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::TempDir;

    struct Fixture {
        _cache_dir: TempDir,
        files: TempDir,
        reader: FileReader,
    }

    impl Fixture {
        fn path(&self, name: &str) -> String {
            self.files.path().join(name).display().to_string()
        }

        fn write(&self, name: &str, contents: &[u8]) -> String {
            std::fs::write(self.files.path().join(name), contents).unwrap();
            self.path(name)
        }
    }

    fn fixture_with(config: ReaderConfig, loader: ParserLoader) -> Fixture {
        let cache_dir = TempDir::new().unwrap();
        let cache = CacheManager::new(CacheConfig {
            root_dir: cache_dir.path().to_path_buf(),
            ..Default::default()
        });
        let reader = FileReader::new(config, cache, loader, Arc::new(LocalFileStorage::unrestricted()));
        Fixture {
            _cache_dir: cache_dir,
            files: TempDir::new().unwrap(),
            reader,
        }
    }

    fn fixture() -> Fixture {
        fixture_with(ReaderConfig::default(), ParserLoader::builtin(ParserSettings::default()))
    }

    /// Test parser keyed on the `.t` extension; behaviour chosen by content
    struct Scripted {
        calls: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl Parser for Scripted {
        fn id(&self) -> ParserId {
            ParserId::new("scripted")
        }

        async fn parse(&self, input: ParseInput, _ctx: ParseContext) -> ParseResult<ParsedContent> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let text = String::from_utf8_lossy(&input.bytes).to_string();
            if let Some(ms) = text.strip_prefix("sleep:") {
                let ms: u64 = ms.trim().parse().unwrap_or(0);
                tokio::time::sleep(Duration::from_millis(ms)).await;
            }
            match text.as_str() {
                "panic" => panic!("internal detail /secret/path"),
                "fail" => Err(ParseError::InvalidContent("bad input\nstack line 1\nstack line 2".into())),
                "tiny" => Ok(ParsedContent::new("x", "t")),
                _ => Ok(ParsedContent::new(format!("parsed: {text}"), "t")),
            }
        }
    }

    fn scripted_loader(calls: Arc<AtomicUsize>, extra_dependency: bool) -> ParserLoader {
        let mut registry = ParserRegistry::builtin();
        let mut descriptor = ParserDescriptor::new(ParserId::new("scripted"), "1", &["t"]);
        if extra_dependency {
            descriptor = descriptor.depends_on(crate::parsers::Dependency::feature("widget", false));
        }
        registry.register(descriptor).unwrap();
        let factories = ParserFactories::builtin().with(ParserId::new("scripted"), move |_| {
            Ok(Arc::new(Scripted {
                calls: calls.clone(),
            }) as Arc<dyn Parser>)
        });
        ParserLoader::new(registry, factories, ParserSettings::default())
    }

    #[tokio::test]
    async fn test_batch_too_large_touches_nothing() {
        let fx = fixture();
        let paths: Vec<String> = (0..11).map(|i| fx.path(&format!("f{i}.txt"))).collect();
        let err = fx.reader.read_files(BatchRequest::new(paths)).await.unwrap_err();
        assert!(matches!(err, BatchError::TooManyFiles { count: 11, max: 10 }));
        assert_eq!(err.kind(), ErrorKind::BatchTooLarge);
        assert!(!fx.reader.cache().is_materialized(Namespace::ParsedDocument));
    }

    #[tokio::test]
    async fn test_empty_batch() {
        let fx = fixture();
        let result = fx.reader.read_files(BatchRequest::new(Vec::<String>::new())).await.unwrap();
        assert!(result.results.is_empty());
    }

    #[tokio::test]
    async fn test_mixed_batch_scenario() {
        let fx = fixture();
        let body = b"Quarterly numbers went up across every region.".to_vec();
        let a = fx.write("a.txt", &body);
        let b = fx.write("b.xyz", b"whatever this is");
        let c = fx.write("c.txt", &body);

        let result = fx
            .reader
            .read_files(BatchRequest::new([a.clone(), b.clone()]))
            .await
            .unwrap();
        assert_eq!(result.results[0].status, FileStatus::Success);
        assert_eq!(result.results[1].error_kind(), Some(ErrorKind::UnsupportedFormat));

        let second = fx
            .reader
            .read_files(BatchRequest::new([a.clone(), b.clone(), c.clone()]))
            .await
            .unwrap();
        let paths: Vec<&str> = second.results.iter().map(|r| r.path.as_str()).collect();
        assert_eq!(paths, vec![a.as_str(), b.as_str(), c.as_str()]);
        assert_eq!(second.results[0].status, FileStatus::CacheHit);
        assert_eq!(second.results[1].status, FileStatus::Failed);
        assert_eq!(second.results[2].status, FileStatus::CacheHit);
        assert_eq!(second.results[2].content, result.results[0].content);
    }

    #[tokio::test]
    async fn test_missing_and_oversized_files() {
        let fx = fixture();
        let big = fx.write("big.txt", &vec![b'a'; 2048]);
        let missing = fx.path("missing.txt");

        let result = fx
            .reader
            .read_files(BatchRequest::new([big, missing]).with_max_file_size(1024))
            .await
            .unwrap();
        assert_eq!(result.results[0].error_kind(), Some(ErrorKind::FileTooLarge));
        assert_eq!(result.results[1].error_kind(), Some(ErrorKind::FileNotReadable));
    }

    #[tokio::test]
    async fn test_failures_are_isolated_and_redacted() {
        let calls = Arc::new(AtomicUsize::new(0));
        let fx = fixture_with(ReaderConfig::default(), scripted_loader(calls.clone(), false));
        let ok = fx.write("ok.t", b"a perfectly fine file");
        let panics = fx.write("boom.t", b"panic");
        let fails = fx.write("fail.t", b"fail");
        let tiny = fx.write("tiny.t", b"tiny");

        let result = fx
            .reader
            .read_files(BatchRequest::new([ok, panics, fails, tiny]))
            .await
            .unwrap();

        assert_eq!(result.results[0].status, FileStatus::Success);
        assert_eq!(result.results[0].content.as_deref(), Some("parsed: a perfectly fine file"));

        let crash = result.results[1].error.as_ref().unwrap();
        assert_eq!(crash.kind, ErrorKind::ProcessingError);
        assert!(!crash.message.contains("/secret/path"));

        let failed = result.results[2].error.as_ref().unwrap();
        assert_eq!(failed.kind, ErrorKind::ProcessingError);
        assert!(!failed.message.contains("stack line"));

        assert_eq!(result.results[3].error_kind(), Some(ErrorKind::ProcessingError));
        assert_eq!(calls.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn test_failed_parse_is_retried_next_time() {
        let calls = Arc::new(AtomicUsize::new(0));
        let fx = fixture_with(ReaderConfig::default(), scripted_loader(calls.clone(), false));
        let fails = fx.write("fail.t", b"fail");

        for _ in 0..2 {
            fx.reader.read_files(BatchRequest::new([fails.clone()])).await.unwrap();
        }
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_timeout_is_per_file() {
        let calls = Arc::new(AtomicUsize::new(0));
        let config = ReaderConfig {
            timeout: Duration::from_millis(100),
            ..Default::default()
        };
        let fx = fixture_with(config, scripted_loader(calls, false));
        let slow = fx.write("slow.t", b"sleep:5000");
        let fast = fx.write("fast.t", b"quick and well formed");

        let result = fx
            .reader
            .read_files(BatchRequest::new([slow, fast]))
            .await
            .unwrap();
        assert_eq!(result.results[0].error_kind(), Some(ErrorKind::Timeout));
        let message = &result.results[0].error.as_ref().unwrap().message;
        assert_eq!(message, "processing exceeded 100ms");
        assert_eq!(result.results[1].status, FileStatus::Success);
    }

    #[tokio::test]
    async fn test_order_kept_despite_completion_order() {
        let calls = Arc::new(AtomicUsize::new(0));
        let fx = fixture_with(ReaderConfig::default(), scripted_loader(calls, false));
        let paths: Vec<String> = [300u64, 10, 150, 0, 80]
            .iter()
            .enumerate()
            .map(|(i, ms)| fx.write(&format!("f{i}.t"), format!("sleep:{ms}").as_bytes()))
            .collect();

        let result = fx
            .reader
            .read_files(BatchRequest::new(paths.clone()).with_max_workers(5))
            .await
            .unwrap();
        let got: Vec<String> = result.results.iter().map(|r| r.path.clone()).collect();
        assert_eq!(got, paths);
        assert!(result.results.iter().all(|r| r.status == FileStatus::Success));
    }

    #[tokio::test]
    async fn test_missing_dependency_names_it() {
        let calls = Arc::new(AtomicUsize::new(0));
        let fx = fixture_with(ReaderConfig::default(), scripted_loader(calls.clone(), true));
        let file = fx.write("x.t", b"content that would parse");

        let result = fx.reader.read_files(BatchRequest::new([file])).await.unwrap();
        let error = result.results[0].error.as_ref().unwrap();
        assert_eq!(error.kind, ErrorKind::DependencyUnavailable);
        assert!(error.message.contains("widget"));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_cache_hit_across_paths_skips_parser() {
        let calls = Arc::new(AtomicUsize::new(0));
        let fx = fixture_with(ReaderConfig::default(), scripted_loader(calls.clone(), false));
        let one = fx.write("one.t", b"identical bytes in two files");
        let two = fx.write("two.t", b"identical bytes in two files");

        fx.reader.read_files(BatchRequest::new([one])).await.unwrap();
        let result = fx.reader.read_files(BatchRequest::new([two])).await.unwrap();
        assert_eq!(result.results[0].status, FileStatus::CacheHit);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_worker_clamp() {
        let fx = fixture();
        assert_eq!(fx.reader.worker_count(None), 5);
        assert_eq!(fx.reader.worker_count(Some(0)), 1);
        assert_eq!(fx.reader.worker_count(Some(50)), 5);
        assert_eq!(fx.reader.worker_count(Some(3)), 3);
    }

    #[test]
    fn test_redact() {
        assert_eq!(redact("first\nsecond"), "first");
        let long = "x".repeat(1000);
        assert_eq!(redact(&long).chars().count(), MAX_MESSAGE_CHARS + 1);
    }
}
