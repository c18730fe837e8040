//! Parser trait and invocation context

use async_trait::async_trait;

use super::error::ParseResult;
use super::loader::ParserLoader;
use super::registry::ParserRegistry;
use super::types::{ParseInput, ParsedContent, ParserId};
use crate::cache::CacheManager;

/// Shared collaborators available during one parse.
///
/// Parsers that recurse (archives) use this to reach the cache and the
/// loader. It is passed per call and never stored by a parser.
#[derive(Clone)]
pub struct ParseContext {
    pub cache: CacheManager,
    pub loader: ParserLoader,
    /// Nesting level; 0 for a file named in the request
    pub depth: u32,
}

impl ParseContext {
    pub fn new(cache: CacheManager, loader: ParserLoader) -> Self {
        Self {
            cache,
            loader,
            depth: 0,
        }
    }

    pub fn registry(&self) -> &ParserRegistry {
        self.loader.registry()
    }

    /// Context for content found inside the current file
    pub fn nested(&self) -> Self {
        Self {
            depth: self.depth + 1,
            ..self.clone()
        }
    }
}

/// A format adapter that turns raw bytes into markdown.
///
/// Implementations hold only immutable, shareable state. One instance
/// serves every invocation for the life of the process.
#[async_trait]
pub trait Parser: Send + Sync {
    fn id(&self) -> ParserId;

    async fn parse(&self, input: ParseInput, ctx: ParseContext) -> ParseResult<ParsedContent>;
}
