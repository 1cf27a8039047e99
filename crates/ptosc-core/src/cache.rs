//! Process-wide lookup caches.
//!
//! Two lookups are expensive enough to do once: locating the external tool
//! binary and asking the server for its version. Both are cached in a
//! [`OnceCache`], written at most once per key and read concurrently.
//! Components take the cache as an `Arc` so tests can inject a fresh one;
//! [`BinaryCache::global`] and [`VersionCache::global`] are the defaults.

use std::future::Future;
use std::hash::Hash;
use std::path::PathBuf;
use std::sync::{Arc, OnceLock};

use dashmap::DashMap;

use crate::db::ConnectionId;

/// Major/minor version of the database engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct EngineVersion {
    pub major: u32,
    pub minor: u32,
}

impl EngineVersion {
    /// Parse strings such as `8.0.34`, `5.7.42-log` or `10.6.12-MariaDB`.
    pub fn parse(version: &str) -> Option<Self> {
        let mut parts = version.trim().split(|c: char| !c.is_ascii_digit());
        let major = parts.next()?.parse().ok()?;
        let minor = parts.next()?.parse().ok()?;
        Some(Self { major, minor })
    }

    /// Whether the engine can attempt `ALGORITHM=INSTANT`.
    ///
    /// MySQL 5.6 and 5.7 have no instant algorithm at all.
    pub fn supports_instant(&self) -> bool {
        self.major >= 8
    }
}

impl std::fmt::Display for EngineVersion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{}", self.major, self.minor)
    }
}

/// A concurrent map whose entries are computed once and never replaced.
pub struct OnceCache<K, V> {
    entries: DashMap<K, V>,
}

impl<K, V> OnceCache<K, V>
where
    K: Eq + Hash + Clone,
    V: Clone,
{
    /// Create an empty cache.
    pub fn new() -> Self {
        Self {
            entries: DashMap::new(),
        }
    }

    /// Read a cached entry.
    pub fn get(&self, key: &K) -> Option<V> {
        self.entries.get(key).map(|v| v.value().clone())
    }

    /// Return the cached entry or compute, store and return it.
    ///
    /// Errors are not cached. If two callers race on an empty key the first
    /// stored value wins and both observe it.
    pub fn get_or_try_insert_with<E>(&self, key: K, init: impl FnOnce() -> Result<V, E>) -> Result<V, E> {
        if let Some(value) = self.get(&key) {
            return Ok(value);
        }
        let value = init()?;
        Ok(self.entries.entry(key).or_insert(value).value().clone())
    }

    /// Async variant of [`get_or_try_insert_with`](Self::get_or_try_insert_with).
    ///
    /// No map guard is held while `init` runs.
    pub async fn get_or_try_insert_async<E, F, Fut>(&self, key: K, init: F) -> Result<V, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<V, E>>,
    {
        if let Some(value) = self.get(&key) {
            return Ok(value);
        }
        let value = init().await?;
        Ok(self.entries.entry(key).or_insert(value).value().clone())
    }

    /// Number of cached entries.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the cache is empty.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Forget every entry.
    pub fn clear(&self) {
        self.entries.clear();
    }
}

impl<K, V> Default for OnceCache<K, V>
where
    K: Eq + Hash + Clone,
    V: Clone,
{
    fn default() -> Self {
        Self::new()
    }
}

/// Logical binary name to resolved path. `None` records a failed lookup,
/// which is never retried.
pub type BinaryCache = OnceCache<String, Option<PathBuf>>;

/// Engine version per database handle.
pub type VersionCache = OnceCache<ConnectionId, EngineVersion>;

impl OnceCache<String, Option<PathBuf>> {
    /// The process-wide binary cache.
    pub fn global() -> Arc<BinaryCache> {
        static GLOBAL: OnceLock<Arc<BinaryCache>> = OnceLock::new();
        Arc::clone(GLOBAL.get_or_init(|| Arc::new(BinaryCache::new())))
    }
}

impl OnceCache<ConnectionId, EngineVersion> {
    /// The process-wide version cache.
    pub fn global() -> Arc<VersionCache> {
        static GLOBAL: OnceLock<Arc<VersionCache>> = OnceLock::new();
        Arc::clone(GLOBAL.get_or_init(|| Arc::new(VersionCache::new())))
    }
}
