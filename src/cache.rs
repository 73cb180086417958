//! Time-to-live cache for one expensive, rarely-changing resource.
//!
//! Each cache holds a single entry (the installed SDK list, the runtime
//! list, the tool version). Readers take a brief read lock to clone the
//! current `Arc`; loaders are serialized on an async mutex so at most one
//! load is in flight per cache, and callers that queued behind it reuse its
//! result instead of loading again.

use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, trace};

struct CacheEntry<T> {
    value: Arc<T>,
    loaded_at: Instant,
    loaded_at_wall: DateTime<Utc>,
    ttl: Duration,
}

impl<T> CacheEntry<T> {
    /// A TTL too large to represent as an instant never expires.
    fn is_expired_at(&self, now: Instant) -> bool {
        self.loaded_at
            .checked_add(self.ttl)
            .is_some_and(|expires_at| now > expires_at)
    }

    fn metadata(&self, now: Instant, from_cache: bool) -> CacheMetadata {
        CacheMetadata {
            loaded_at: self.loaded_at_wall,
            ttl: self.ttl,
            from_cache,
            age: now.saturating_duration_since(self.loaded_at),
        }
    }
}

/// How a value was obtained.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheMetadata {
    pub loaded_at: DateTime<Utc>,
    pub ttl: Duration,
    pub from_cache: bool,
    pub age: Duration,
}

/// A value returned by [`ResourceCache::get_or_load`].
#[derive(Debug, Clone)]
pub struct Cached<T> {
    pub value: Arc<T>,
    pub metadata: CacheMetadata,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LoadOptions {
    /// Skip the cached entry and always load.
    pub force_reload: bool,
    /// TTL for the entry this call stores, instead of the cache default.
    pub ttl: Option<Duration>,
}

impl LoadOptions {
    #[must_use]
    pub fn force(force_reload: bool) -> Self {
        Self {
            force_reload,
            ttl: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheMetrics {
    pub hits: u64,
    pub misses: u64,
    pub hit_ratio: f64,
}

pub struct ResourceCache<T> {
    name: &'static str,
    default_ttl: Duration,
    entry: RwLock<Option<Arc<CacheEntry<T>>>>,
    load_lock: Mutex<()>,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl<T> std::fmt::Debug for ResourceCache<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResourceCache")
            .field("name", &self.name)
            .field("default_ttl", &self.default_ttl)
            .field("metrics", &self.metrics())
            .finish_non_exhaustive()
    }
}

impl<T> ResourceCache<T> {
    #[must_use]
    pub fn new(default_ttl: Duration) -> Self {
        Self {
            name: "resource",
            default_ttl,
            entry: RwLock::new(None),
            load_lock: Mutex::new(()),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    /// Name used in log events.
    #[must_use]
    pub fn with_name(mut self, name: &'static str) -> Self {
        self.name = name;
        self
    }

    #[must_use]
    pub fn name(&self) -> &'static str {
        self.name
    }

    #[must_use]
    pub fn default_ttl(&self) -> Duration {
        self.default_ttl
    }

    fn current(&self) -> Option<Arc<CacheEntry<T>>> {
        self.entry
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn fresh_entry(&self) -> Option<Arc<CacheEntry<T>>> {
        self.current()
            .filter(|entry| !entry.is_expired_at(Instant::now()))
    }

    fn hit(&self, entry: &CacheEntry<T>) -> Cached<T> {
        self.hits.fetch_add(1, Ordering::Relaxed);
        trace!(cache = self.name, "cache hit");
        Cached {
            value: Arc::clone(&entry.value),
            metadata: entry.metadata(Instant::now(), true),
        }
    }

    /// Return the cached value, loading it first if missing or expired.
    ///
    /// `loader` runs at most once per call and only while this cache's load
    /// lock is held. A loader error is returned as-is and nothing is cached.
    pub async fn get_or_load<F, Fut, E>(&self, loader: F, options: LoadOptions) -> Result<Cached<T>, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        if !options.force_reload
            && let Some(entry) = self.fresh_entry()
        {
            return Ok(self.hit(&entry));
        }

        let _load_guard = self.load_lock.lock().await;

        // Another caller may have loaded while we waited.
        if !options.force_reload
            && let Some(entry) = self.fresh_entry()
        {
            return Ok(self.hit(&entry));
        }

        self.misses.fetch_add(1, Ordering::Relaxed);
        debug!(
            cache = self.name,
            force_reload = options.force_reload,
            "cache miss, loading"
        );

        let value = loader().await?;
        let entry = Arc::new(CacheEntry {
            value: Arc::new(value),
            loaded_at: Instant::now(),
            loaded_at_wall: Utc::now(),
            ttl: options.ttl.unwrap_or(self.default_ttl),
        });
        *self.entry.write().unwrap_or_else(PoisonError::into_inner) = Some(Arc::clone(&entry));

        Ok(Cached {
            value: Arc::clone(&entry.value),
            metadata: entry.metadata(entry.loaded_at, false),
        })
    }

    /// Drop the current entry without loading a replacement.
    pub fn clear(&self) {
        *self.entry.write().unwrap_or_else(PoisonError::into_inner) = None;
        debug!(cache = self.name, "cache cleared");
    }

    /// `true` when there is no entry or the entry has outlived its TTL.
    #[must_use]
    pub fn is_expired(&self) -> bool {
        self.fresh_entry().is_none()
    }

    /// Age and TTL of the current entry, if any.
    #[must_use]
    pub fn peek_metadata(&self) -> Option<CacheMetadata> {
        self.current()
            .map(|entry| entry.metadata(Instant::now(), true))
    }

    #[must_use]
    pub fn metrics(&self) -> CacheMetrics {
        let hits = self.hits.load(Ordering::Relaxed);
        let misses = self.misses.load(Ordering::Relaxed);
        let total = hits + misses;
        CacheMetrics {
            hits,
            misses,
            hit_ratio: if total == 0 {
                0.0
            } else {
                hits as f64 / total as f64
            },
        }
    }

    pub fn reset_metrics(&self) {
        self.hits.store(0, Ordering::Relaxed);
        self.misses.store(0, Ordering::Relaxed);
    }
}
