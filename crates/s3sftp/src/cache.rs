//! Named resource caches.
//!
//! One bounded, idle-expiring cache per declared resource kind. The set of
//! caches is fixed when the manager is built; each cache is created on first
//! use and lives as long as the manager. Entries are an optimisation only:
//! every value must be recomputable after a miss.

use moka::policy::EvictionPolicy;
use moka::sync::Cache;
use serde::{Deserialize, Serialize};
use std::any::Any;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;
use tracing::debug;

use crate::{Error, Result};

/// Resolved object metadata per backend URI and key
pub const FILE_ATTRIBUTES_CACHE: &str = "s3sftp.userPathFileAttributes";
/// Directory listings per backend URI and prefix
pub const DIRECTORY_CONTENTS_CACHE: &str = "s3sftp.directoryContentsNames";
/// Constructed storage clients per backend URI
pub const BACKEND_CLIENTS_CACHE: &str = "s3sftp.backendClients";

pub type CacheValue = Arc<dyn Any + Send + Sync>;

/// `[cache]` section of the config file, applied to every declared cache
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheSettings {
    pub max_entries: u64,
    pub idle_expiry_secs: u64,
    pub record_stats: bool,
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self {
            max_entries: 100_000,
            idle_expiry_secs: 60,
            record_stats: true,
        }
    }
}

/// Declaration of one named cache
#[derive(Debug, Clone)]
pub struct CacheSpec {
    pub name: String,
    pub max_entries: u64,
    pub idle_expiry: Duration,
    pub record_stats: bool,
}

impl CacheSpec {
    pub fn new(name: impl Into<String>, settings: &CacheSettings) -> Self {
        Self {
            name: name.into(),
            max_entries: settings.max_entries,
            idle_expiry: Duration::from_secs(settings.idle_expiry_secs),
            record_stats: settings.record_stats,
        }
    }
}

/// Hit/miss counters for one cache
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub entries: u64,
}

impl CacheStats {
    #[allow(clippy::cast_precision_loss)]
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}

struct NamedCache {
    entries: Cache<String, CacheValue>,
    record_stats: bool,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl NamedCache {
    fn build(spec: &CacheSpec) -> Self {
        debug!(
            event = "cache_created",
            cache = %spec.name,
            max_entries = spec.max_entries,
            idle_expiry_secs = spec.idle_expiry.as_secs(),
            "Cache initialised"
        );
        Self {
            entries: Cache::builder()
                .name(&spec.name)
                .max_capacity(spec.max_entries)
                .time_to_idle(spec.idle_expiry)
                .eviction_policy(EvictionPolicy::lru())
                .build(),
            record_stats: spec.record_stats,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    fn get(&self, key: &str) -> Option<CacheValue> {
        let value = self.entries.get(key);
        if self.record_stats {
            let counter = if value.is_some() { &self.hits } else { &self.misses };
            counter.fetch_add(1, Ordering::Relaxed);
        }
        value
    }
}

struct CacheSlot {
    spec: CacheSpec,
    cache: OnceLock<NamedCache>,
}

/// Owner of every named cache in the process.
///
/// Built once at startup and shared by `Arc`. The name-to-cache table is
/// never mutated after construction, so lookups take no locks.
pub struct CacheManager {
    slots: HashMap<String, CacheSlot>,
}

impl CacheManager {
    pub fn new(specs: impl IntoIterator<Item = CacheSpec>) -> Self {
        let slots = specs
            .into_iter()
            .map(|spec| {
                (
                    spec.name.clone(),
                    CacheSlot {
                        spec,
                        cache: OnceLock::new(),
                    },
                )
            })
            .collect();
        Self { slots }
    }

    /// The gateway's three standard caches, all using `settings`
    pub fn with_defaults(settings: &CacheSettings) -> Self {
        Self::new(
            [
                FILE_ATTRIBUTES_CACHE,
                DIRECTORY_CONTENTS_CACHE,
                BACKEND_CLIENTS_CACHE,
            ]
            .into_iter()
            .map(|name| CacheSpec::new(name, settings)),
        )
    }

    fn cache(&self, name: &str) -> Result<&NamedCache> {
        let slot = self
            .slots
            .get(name)
            .ok_or_else(|| Error::UnknownCache(name.to_string()))?;
        Ok(slot.cache.get_or_init(|| NamedCache::build(&slot.spec)))
    }

    pub fn get(&self, name: &str, key: &str) -> Result<Option<CacheValue>> {
        Ok(self.cache(name)?.get(key))
    }

    /// Typed lookup. A value of a different type counts as a miss.
    pub fn get_as<T>(&self, name: &str, key: &str) -> Result<Option<Arc<T>>>
    where
        T: Any + Send + Sync,
    {
        Ok(self
            .get(name, key)?
            .and_then(|value| value.downcast::<T>().ok()))
    }

    pub fn put<T>(&self, name: &str, key: impl Into<String>, value: Arc<T>) -> Result<()>
    where
        T: Any + Send + Sync,
    {
        self.cache(name)?.entries.insert(key.into(), value);
        Ok(())
    }

    pub fn invalidate(&self, name: &str, key: &str) -> Result<()> {
        self.cache(name)?.entries.invalidate(key);
        Ok(())
    }

    pub fn stats(&self, name: &str) -> Result<CacheStats> {
        let cache = self.cache(name)?;
        Ok(CacheStats {
            hits: cache.hits.load(Ordering::Relaxed),
            misses: cache.misses.load(Ordering::Relaxed),
            entries: cache.entries.entry_count(),
        })
    }

    pub fn cache_names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.slots.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }
}
