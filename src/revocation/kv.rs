//! TTL key-value store behind the revocation cache.
//!
//! [`KvStore`] is the narrow interface a Redis-like cache has to offer.
//! [`InMemoryKvStore`] is a `DashMap` with lazy eviction on read plus a
//! sweep for the background reaper.

use std::time::{Duration, Instant};

use dashmap::DashMap;

use crate::error::StoreError;

/// Minimal TTL key-value interface.
#[async_trait::async_trait]
pub trait KvStore: Send + Sync + 'static {
    /// Set `key` to `value`, expiring after `ttl`.
    async fn set(&self, key: &str, value: &str, ttl: Duration) -> Result<(), StoreError>;

    /// Whether `key` exists and has not expired.
    async fn exists(&self, key: &str) -> Result<bool, StoreError>;

    /// Delete `key`. Returns whether it existed.
    async fn delete(&self, key: &str) -> Result<bool, StoreError>;

    /// Drop expired keys. Returns how many were dropped.
    async fn reap_expired(&self) -> usize;
}

/// Only presence matters to the revocation cache, so values are not kept.
struct Entry {
    stored_at: Instant,
    ttl: Duration,
}

impl Entry {
    fn is_expired(&self) -> bool {
        self.stored_at.elapsed() >= self.ttl
    }
}

/// In-process [`KvStore`].
#[derive(Default)]
pub struct InMemoryKvStore {
    entries: DashMap<String, Entry>,
}

impl InMemoryKvStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of entries, expired ones included.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the store is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[async_trait::async_trait]
impl KvStore for InMemoryKvStore {
    async fn set(&self, key: &str, _value: &str, ttl: Duration) -> Result<(), StoreError> {
        self.entries.insert(
            key.to_string(),
            Entry {
                stored_at: Instant::now(),
                ttl,
            },
        );
        Ok(())
    }

    async fn exists(&self, key: &str) -> Result<bool, StoreError> {
        let expired = match self.entries.get(key) {
            None => return Ok(false),
            Some(entry) => entry.is_expired(),
        };
        if expired {
            self.entries.remove_if(key, |_, e| e.is_expired());
            return Ok(false);
        }
        Ok(true)
    }

    async fn delete(&self, key: &str) -> Result<bool, StoreError> {
        Ok(self.entries.remove(key).is_some())
    }

    async fn reap_expired(&self) -> usize {
        let before = self.entries.len();
        self.entries.retain(|_, e| !e.is_expired());
        before.saturating_sub(self.entries.len())
    }
}
