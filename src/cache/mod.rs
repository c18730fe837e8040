//! Content-addressed, size-bounded on-disk cache
//!
//! - [`key`]: content digests and cache keys
//! - [`entry`]: namespaces and the record format
//! - [`store`]: one bounded LRU store per namespace
//! - [`manager`]: the namespaced facade the rest of the crate talks to

pub mod entry;
pub mod error;
pub mod key;
pub mod manager;
pub mod store;

pub use entry::{CacheEntry, EntryMeta, Namespace};
pub use error::{CacheError, Result as CacheResult};
pub use key::{
    digest_async_reader, digest_bytes, digest_file, digest_reader, CacheKey, ContentDigest,
    ProcessingOptions,
};
pub use manager::{CacheConfig, CacheManager, CacheStats, NamespaceSplit, NamespaceStats};
pub use store::{BoundedCache, NamespaceBudget, StoreStats};
