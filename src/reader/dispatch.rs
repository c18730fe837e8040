//! Cached parse of in-memory content
//!
//! `lookup → resolve → parse → store`, shared by the batch reader and by
//! parsers that find other files inside their input (archives).

use std::sync::Arc;

use thiserror::Error;
use tracing::{debug, warn};

use crate::cache::{
    digest_bytes, CacheError, CacheKey, CacheManager, ContentDigest, Namespace, ProcessingOptions,
};
use crate::parsers::{
    normalize_extension, ParseContext, ParseError, ParseInput, ParsedContent, ParserDescriptor,
    ParserId, ParserLoader, Resolution, UnavailableReason,
};

#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("unsupported format: {0}")]
    Unsupported(String),

    #[error("parser {parser_id} unavailable: {reason}")]
    Unavailable {
        parser_id: ParserId,
        reason: UnavailableReason,
    },

    #[error(transparent)]
    Parse(#[from] ParseError),
}

/// Parse output and where it came from
#[derive(Debug, Clone)]
pub struct CachedParse {
    pub content: ParsedContent,
    pub cache_hit: bool,
}

/// Key under which a parse of `digest` by `descriptor` is cached. The
/// loader's settings contribute whatever changes that parser's output.
pub fn cache_key(
    loader: &ParserLoader,
    descriptor: &ParserDescriptor,
    digest: &ContentDigest,
    options: &ProcessingOptions,
) -> CacheKey {
    CacheKey::derive(
        digest,
        descriptor.parser_id.as_str(),
        descriptor.version,
        &loader.settings().fingerprint(descriptor.parser_id),
        options,
    )
}

/// Cached parse result, if any
pub async fn lookup(cache: &CacheManager, namespace: Namespace, key: &CacheKey) -> Option<ParsedContent> {
    let hit = cache.get_json::<ParsedContent>(namespace, key).await;
    debug!(namespace = %namespace, key = %key, hit = hit.is_some(), "Cache lookup");
    hit
}

/// Write a parse result back. Failures never reach the caller.
pub async fn store(cache: &CacheManager, namespace: Namespace, key: &CacheKey, content: &ParsedContent) {
    match cache.put_json(namespace, key, content).await {
        Ok(()) => {}
        Err(CacheError::CapacityExceeded { size, max, .. }) => {
            warn!(namespace = %namespace, key = %key, size, max, "Result larger than namespace budget, not cached");
        }
        Err(e) => warn!(namespace = %namespace, key = %key, error = %e, "Cache write failed"),
    }
}

/// Parse bytes whose format is given by `extension`, going through the cache
pub async fn parse_bytes(
    ctx: &ParseContext,
    name: &str,
    extension: &str,
    bytes: Arc<Vec<u8>>,
    options: &ProcessingOptions,
) -> Result<CachedParse, DispatchError> {
    let descriptor = ctx
        .registry()
        .lookup(extension)
        .ok_or_else(|| DispatchError::Unsupported(extension.to_string()))?;
    let namespace = descriptor.namespace;
    let key = cache_key(&ctx.loader, descriptor, &digest_bytes(&bytes), options);

    if let Some(content) = lookup(&ctx.cache, namespace, &key).await {
        return Ok(CachedParse {
            content,
            cache_hit: true,
        });
    }

    let parser = match ctx.loader.resolve_id(descriptor.parser_id).await {
        Resolution::Ready { parser, .. } => parser,
        Resolution::Unavailable { parser_id, reason } => {
            return Err(DispatchError::Unavailable { parser_id, reason })
        }
        Resolution::Unsupported { extension } => return Err(DispatchError::Unsupported(extension)),
    };

    let input = ParseInput {
        name: name.to_string(),
        extension: normalize_extension(extension),
        bytes,
        options: options.clone(),
    };
    let content = parser.parse(input, ctx.clone()).await?;
    store(&ctx.cache, namespace, &key, &content).await;

    Ok(CachedParse {
        content,
        cache_hit: false,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::CacheConfig;
    use crate::parsers::{ParserLoader, ParserSettings};
    use tempfile::TempDir;

    fn ctx(dir: &TempDir) -> ParseContext {
        let config = CacheConfig {
            root_dir: dir.path().to_path_buf(),
            ..Default::default()
        };
        ParseContext::new(
            CacheManager::new(config),
            ParserLoader::builtin(ParserSettings::default()),
        )
    }

    #[tokio::test]
    async fn test_second_parse_hits_cache() {
        let dir = TempDir::new().unwrap();
        let ctx = ctx(&dir);
        let bytes = Arc::new(b"hello from a text file".to_vec());
        let options = ProcessingOptions::default();

        let first = parse_bytes(&ctx, "a.txt", ".txt", bytes.clone(), &options).await.unwrap();
        assert!(!first.cache_hit);
        let second = parse_bytes(&ctx, "b.txt", ".txt", bytes, &options).await.unwrap();
        assert!(second.cache_hit);
        assert_eq!(first.content, second.content);
    }

    #[tokio::test]
    async fn test_parse_failure_is_not_cached() {
        let dir = TempDir::new().unwrap();
        let ctx = ctx(&dir);
        let options = ProcessingOptions::default();

        let err = parse_bytes(&ctx, "e.txt", ".txt", Arc::new(b"   ".to_vec()), &options)
            .await
            .unwrap_err();
        assert!(matches!(err, DispatchError::Parse(ParseError::Empty)));
        let stats = ctx.cache.stats();
        let parsed = &stats.namespaces[0];
        assert_eq!(parsed.budget.namespace, Namespace::ParsedDocument);
        assert_eq!(parsed.budget.entry_count, 0);
    }

    #[tokio::test]
    async fn test_unsupported_extension() {
        let dir = TempDir::new().unwrap();
        let options = ProcessingOptions::default();
        let err = parse_bytes(&ctx(&dir), "x.exe", ".exe", Arc::new(vec![0]), &options)
            .await
            .unwrap_err();
        assert!(matches!(err, DispatchError::Unsupported(_)));
    }
}
