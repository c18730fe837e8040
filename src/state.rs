//! Application state management

use std::sync::Arc;

use crate::cache::CacheManager;
use crate::config::Config;
use crate::parsers::ParserLoader;
use crate::reader::{FileReader, LocalFileStorage};

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    inner: Arc<AppStateInner>,
}

struct AppStateInner {
    config: Config,
    cache: CacheManager,
    loader: ParserLoader,
    reader: FileReader,
}

impl AppState {
    /// Wire the cache, parser loader and reader from configuration.
    ///
    /// Nothing touches the disk here. Cache namespaces and parsers
    /// materialise on first use.
    pub fn new(config: Config) -> Self {
        let cache = CacheManager::new(config.cache.clone());
        let loader = ParserLoader::builtin(config.parsers.clone());
        let storage = LocalFileStorage::new(
            config.storage.allowed_dirs.clone(),
            config.storage.allow_relative,
        );
        let reader = FileReader::new(
            config.reader.clone(),
            cache.clone(),
            loader.clone(),
            Arc::new(storage),
        );

        Self {
            inner: Arc::new(AppStateInner {
                config,
                cache,
                loader,
                reader,
            }),
        }
    }

    pub fn config(&self) -> &Config {
        &self.inner.config
    }

    pub fn cache(&self) -> &CacheManager {
        &self.inner.cache
    }

    pub fn loader(&self) -> &ParserLoader {
        &self.inner.loader
    }

    pub fn reader(&self) -> &FileReader {
        &self.inner.reader
    }
}
