//! Namespaced cache facade
//!
//! Splits one total byte budget across the namespaces and opens each
//! namespace's store on first use. Nothing below this layer ever turns into
//! a file failure: open errors, disk errors and corrupt records are logged
//! and read as misses or skipped writes.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio::sync::OnceCell;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::entry::{CacheEntry, Namespace};
use super::error::Result;
use super::key::CacheKey;
use super::store::{BoundedCache, NamespaceBudget, StoreStats};

/// Share of the total budget given to each namespace
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct NamespaceSplit {
    pub parsed: f64,
    pub image: f64,
    pub archive: f64,
}

impl Default for NamespaceSplit {
    fn default() -> Self {
        Self {
            parsed: 0.6,
            image: 0.2,
            archive: 0.2,
        }
    }
}

impl NamespaceSplit {
    /// Clamp negatives to zero and scale down when the ratios sum above 1
    pub fn normalized(self) -> Self {
        let clamp = |v: f64| if v.is_finite() && v > 0.0 { v } else { 0.0 };
        let (p, i, a) = (clamp(self.parsed), clamp(self.image), clamp(self.archive));
        let sum = p + i + a;
        if sum > 1.0 {
            Self {
                parsed: p / sum,
                image: i / sum,
                archive: a / sum,
            }
        } else {
            Self {
                parsed: p,
                image: i,
                archive: a,
            }
        }
    }

    pub fn ratio(&self, namespace: Namespace) -> f64 {
        match namespace {
            Namespace::ParsedDocument => self.parsed,
            Namespace::ExtractedImage => self.image,
            Namespace::ArchiveEntry => self.archive,
        }
    }

    /// `floor(total * ratio)` for one namespace
    pub fn budget(&self, total_bytes: u64, namespace: Namespace) -> u64 {
        (total_bytes as f64 * self.normalized().ratio(namespace)).floor() as u64
    }
}

/// Cache configuration
#[derive(Debug, Clone)]
pub struct CacheConfig {
    /// Root directory; each namespace gets a subdirectory
    pub root_dir: PathBuf,
    /// Total budget across all namespaces
    pub total_size_bytes: u64,
    pub split: NamespaceSplit,
    /// Entries older than this are swept; `None` keeps them until evicted
    pub retention: Option<Duration>,
    pub sweep_interval: Duration,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            root_dir: PathBuf::from("cache"),
            total_size_bytes: 500 * 1024 * 1024,
            split: NamespaceSplit::default(),
            retention: Some(Duration::from_secs(30 * 24 * 60 * 60)),
            sweep_interval: Duration::from_secs(60 * 60),
        }
    }
}

/// Per-namespace view in [`CacheStats`]
#[derive(Debug, Clone, Serialize)]
pub struct NamespaceStats {
    #[serde(flatten)]
    pub budget: NamespaceBudget,
    /// Whether the namespace has been opened in this process
    pub materialized: bool,
    #[serde(flatten)]
    pub counters: StoreStats,
}

/// Aggregate cache statistics
#[derive(Debug, Clone, Serialize)]
pub struct CacheStats {
    pub root_dir: String,
    pub total_size_bytes: u64,
    pub max_size_bytes: u64,
    pub hits: u64,
    pub misses: u64,
    pub namespaces: Vec<NamespaceStats>,
}

/// Namespaced, lazily materialised cache
#[derive(Clone)]
pub struct CacheManager {
    inner: Arc<CacheManagerInner>,
}

struct CacheManagerInner {
    config: CacheConfig,
    namespaces: [OnceCell<BoundedCache>; 3],
}

impl CacheManager {
    pub fn new(config: CacheConfig) -> Self {
        info!(
            root = %config.root_dir.display(),
            total_size_bytes = config.total_size_bytes,
            "Cache configured"
        );
        Self {
            inner: Arc::new(CacheManagerInner {
                config,
                namespaces: [OnceCell::new(), OnceCell::new(), OnceCell::new()],
            }),
        }
    }

    pub fn config(&self) -> &CacheConfig {
        &self.inner.config
    }

    pub fn namespace_dir(&self, namespace: Namespace) -> PathBuf {
        self.inner.config.root_dir.join(namespace.dir_name())
    }

    pub fn budget_for(&self, namespace: Namespace) -> u64 {
        self.inner
            .config
            .split
            .budget(self.inner.config.total_size_bytes, namespace)
    }

    pub fn is_materialized(&self, namespace: Namespace) -> bool {
        self.inner.namespaces[namespace.index()].initialized()
    }

    /// Open the namespace store if needed. A failed open is retried on the
    /// next call.
    async fn store(&self, namespace: Namespace) -> Result<&BoundedCache> {
        self.inner.namespaces[namespace.index()]
            .get_or_try_init(|| {
                BoundedCache::open(
                    self.namespace_dir(namespace),
                    namespace,
                    self.budget_for(namespace),
                )
            })
            .await
    }

    async fn store_or_warn(&self, namespace: Namespace) -> Option<&BoundedCache> {
        match self.store(namespace).await {
            Ok(store) => Some(store),
            Err(e) => {
                warn!(namespace = %namespace, error = %e, "Cache degraded: namespace unavailable");
                None
            }
        }
    }

    // =========================================================================
    // Entry operations
    // =========================================================================

    pub async fn get(&self, namespace: Namespace, key: &CacheKey) -> Option<CacheEntry> {
        self.store_or_warn(namespace).await?.get(key).await
    }

    /// Store a payload. Only a record larger than the namespace budget is
    /// reported; every other failure is logged and skipped.
    pub async fn put(&self, namespace: Namespace, key: &CacheKey, payload: &[u8]) -> Result<()> {
        match self.store_or_warn(namespace).await {
            Some(store) => store.put(key, payload).await,
            None => Ok(()),
        }
    }

    /// Typed lookup; a payload that no longer deserializes is dropped
    pub async fn get_json<T: DeserializeOwned>(
        &self,
        namespace: Namespace,
        key: &CacheKey,
    ) -> Option<T> {
        let entry = self.get(namespace, key).await?;
        match serde_json::from_slice(&entry.payload) {
            Ok(value) => Some(value),
            Err(e) => {
                warn!(namespace = %namespace, key = %key, error = %e, "Dropping undecodable cache payload");
                self.remove(namespace, key).await;
                None
            }
        }
    }

    pub async fn put_json<T: Serialize>(
        &self,
        namespace: Namespace,
        key: &CacheKey,
        value: &T,
    ) -> Result<()> {
        let payload = match serde_json::to_vec(value) {
            Ok(payload) => payload,
            Err(e) => {
                warn!(namespace = %namespace, key = %key, error = %e, "Skipping cache write");
                return Ok(());
            }
        };
        self.put(namespace, key, &payload).await
    }

    pub async fn remove(&self, namespace: Namespace, key: &CacheKey) -> bool {
        match self.store_or_warn(namespace).await {
            Some(store) => store.remove(key).await,
            None => false,
        }
    }

    // =========================================================================
    // Maintenance
    // =========================================================================

    /// Clear one namespace, or all of them. Namespaces with nothing on disk
    /// are left unmaterialised.
    pub async fn clear(&self, namespace: Option<Namespace>) -> usize {
        let targets: Vec<Namespace> = match namespace {
            Some(ns) => vec![ns],
            None => Namespace::ALL.to_vec(),
        };

        let mut removed = 0;
        for ns in targets {
            if !self.is_materialized(ns) && !dir_exists(&self.namespace_dir(ns)).await {
                continue;
            }
            if let Some(store) = self.store_or_warn(ns).await {
                removed += store.clear().await;
            }
        }
        removed
    }

    /// Drop entries past the retention window in every open namespace
    pub async fn sweep_expired(&self) -> usize {
        let Some(retention) = self.inner.config.retention else {
            return 0;
        };
        let mut expired = 0;
        for cell in &self.inner.namespaces {
            if let Some(store) = cell.get() {
                expired += store.evict_expired(retention).await;
            }
        }
        if expired > 0 {
            info!(expired, "Retention sweep finished");
        } else {
            debug!("Retention sweep found nothing to expire");
        }
        expired
    }

    /// Run [`CacheManager::sweep_expired`] on a fixed interval
    pub fn spawn_sweeper(&self) -> JoinHandle<()> {
        let manager = self.clone();
        let period = manager.inner.config.sweep_interval.max(Duration::from_secs(1));
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            // First tick fires immediately
            ticker.tick().await;
            loop {
                ticker.tick().await;
                manager.sweep_expired().await;
            }
        })
    }

    pub fn stats(&self) -> CacheStats {
        let namespaces: Vec<NamespaceStats> = Namespace::ALL
            .iter()
            .map(|&ns| match self.inner.namespaces[ns.index()].get() {
                Some(store) => NamespaceStats {
                    budget: store.budget(),
                    materialized: true,
                    counters: store.stats(),
                },
                None => NamespaceStats {
                    budget: NamespaceBudget {
                        namespace: ns,
                        current_size_bytes: 0,
                        max_size_bytes: self.budget_for(ns),
                        entry_count: 0,
                    },
                    materialized: false,
                    counters: StoreStats::default(),
                },
            })
            .collect();

        CacheStats {
            root_dir: self.inner.config.root_dir.display().to_string(),
            total_size_bytes: namespaces.iter().map(|n| n.budget.current_size_bytes).sum(),
            max_size_bytes: self.inner.config.total_size_bytes,
            hits: namespaces.iter().map(|n| n.counters.hits).sum(),
            misses: namespaces.iter().map(|n| n.counters.misses).sum(),
            namespaces,
        }
    }
}

async fn dir_exists(path: &Path) -> bool {
    tokio::fs::metadata(path)
        .await
        .map(|m| m.is_dir())
        .unwrap_or(false)
}
