use parking_lot::RwLock;
use rustc_hash::FxHashMap;
use std::hash::Hash;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

/// Counters describing how a `CompilationCache` has been used.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    /// Successful builds. Concurrent first uses of one key may each count.
    pub builds: u64,
    pub entries: usize,
}

/// Key-based memoization of lazily built artifacts.
///
/// Repeated lookups of an equal key return the same `Arc` without building
/// again. Builds run without holding the lock: concurrent first uses of one
/// key may each build, and the last insert wins. Entries live until `clear`.
pub struct CompilationCache<K, V> {
    name: &'static str,
    entries: RwLock<FxHashMap<K, Arc<V>>>,
    hits: AtomicU64,
    misses: AtomicU64,
    builds: AtomicU64,
}

impl<K, V> CompilationCache<K, V>
where
    K: Eq + Hash + Clone + std::fmt::Debug,
{
    #[must_use]
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            entries: RwLock::new(FxHashMap::default()),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            builds: AtomicU64::new(0),
        }
    }

    /// Returns the cached artifact for `key`, building it with `build_fn` on
    /// a miss. Build failures are returned and nothing is cached.
    pub fn get_or_build<E>(
        &self,
        key: &K,
        build_fn: impl FnOnce() -> Result<V, E>,
    ) -> Result<Arc<V>, E> {
        if let Some(cached) = self.entries.read().get(key) {
            self.hits.fetch_add(1, Ordering::Relaxed);
            tracing::trace!(cache = self.name, ?key, "cache hit");
            return Ok(Arc::clone(cached));
        }

        self.misses.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(cache = self.name, ?key, "cache miss");
        let built = Arc::new(build_fn()?);
        self.builds.fetch_add(1, Ordering::Relaxed);
        self.entries.write().insert(key.clone(), Arc::clone(&built));
        Ok(built)
    }

    #[must_use]
    pub fn get(&self, key: &K) -> Option<Arc<V>> {
        self.entries.read().get(key).cloned()
    }

    pub fn clear(&self) {
        self.entries.write().clear();
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    #[must_use]
    pub fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            builds: self.builds.load(Ordering::Relaxed),
            entries: self.len(),
        }
    }
}

impl<K, V> std::fmt::Debug for CompilationCache<K, V> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CompilationCache")
            .field("name", &self.name)
            .field("entries", &self.entries.read().len())
            .finish_non_exhaustive()
    }
}
