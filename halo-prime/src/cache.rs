use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use async_trait::async_trait;

/// Key/value cache with per-entry expiry.
///
/// Callers treat every error as "cache unavailable": the value is recomputed
/// and the failure is logged, never returned to a device.
#[async_trait]
pub trait Cache: Send + Sync + 'static {
    /// Error type specific to this cache implementation
    type Error: std::error::Error + Send + Sync + 'static;

    /// Fetch a live value. Expired entries are reported as missing.
    async fn get(&self, key: &str) -> Result<Option<String>, Self::Error>;

    /// Store a value, replacing any previous one.
    async fn set(&self, key: &str, value: String, ttl: Duration) -> Result<(), Self::Error>;

    /// Store a value only if no live entry exists. Returns the value that
    /// ends up cached, which is the earlier one when another writer won.
    async fn insert_if_absent(
        &self,
        key: &str,
        value: String,
        ttl: Duration,
    ) -> Result<String, Self::Error>;
}

#[derive(Debug, Clone)]
struct CacheEntry {
    value: String,
    expires_at: Instant,
}

impl CacheEntry {
    fn is_live(&self, now: Instant) -> bool {
        self.expires_at > now
    }
}

/// Process-local cache, enough for a single bootstrap node and for tests.
#[derive(Clone, Default)]
pub struct MemoryCache {
    entries: Arc<Mutex<HashMap<String, CacheEntry>>>,
}

#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    #[error("mutex poisoned: {0}")]
    MutexPoisoned(String),
}

impl<T> From<PoisonError<T>> for CacheError {
    fn from(err: PoisonError<T>) -> Self {
        CacheError::MutexPoisoned(err.to_string())
    }
}

impl MemoryCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Drop expired entries, returning how many were removed.
    pub fn purge_expired(&self) -> Result<usize, CacheError> {
        let mut map = self.entries.lock()?;
        let now = Instant::now();
        let before = map.len();
        map.retain(|_, entry| entry.is_live(now));
        Ok(before - map.len())
    }

    /// Number of stored entries, including expired ones not yet purged.
    pub fn len(&self) -> Result<usize, CacheError> {
        Ok(self.entries.lock()?.len())
    }

    pub fn is_empty(&self) -> Result<bool, CacheError> {
        Ok(self.len()? == 0)
    }
}

#[async_trait]
impl Cache for MemoryCache {
    type Error = CacheError;

    async fn get(&self, key: &str) -> Result<Option<String>, Self::Error> {
        let map = self.entries.lock()?;
        let now = Instant::now();

        Ok(map
            .get(key)
            .filter(|entry| entry.is_live(now))
            .map(|entry| entry.value.clone()))
    }

    async fn set(&self, key: &str, value: String, ttl: Duration) -> Result<(), Self::Error> {
        let mut map = self.entries.lock()?;
        map.insert(
            key.to_string(),
            CacheEntry {
                value,
                expires_at: Instant::now() + ttl,
            },
        );

        Ok(())
    }

    async fn insert_if_absent(
        &self,
        key: &str,
        value: String,
        ttl: Duration,
    ) -> Result<String, Self::Error> {
        let mut map = self.entries.lock()?;
        let now = Instant::now();

        if let Some(existing) = map.get(key).filter(|entry| entry.is_live(now)) {
            return Ok(existing.value.clone());
        }

        map.insert(
            key.to_string(),
            CacheEntry {
                value: value.clone(),
                expires_at: now + ttl,
            },
        );

        Ok(value)
    }
}
