//! Registered OAuth clients and the cached registry adapter.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use dashmap::DashMap;
use serde::{Deserialize, Serialize};

use crate::error::StoreError;

/// A registered relying party.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Client {
    /// Public client id.
    pub client_id: String,
    /// Display name.
    #[serde(default)]
    pub name: String,
    /// Service domain, unique per client.
    pub domain: String,
    /// Exact redirect URIs.
    pub redirect_uris: Vec<String>,
    /// Scopes the client may request.
    pub allowed_scopes: Vec<String>,
    /// Inactive clients cannot obtain codes.
    #[serde(default = "default_active")]
    pub active: bool,
}

fn default_active() -> bool {
    true
}

impl Client {
    /// Byte-for-byte redirect URI match.
    #[must_use]
    pub fn allows_redirect(&self, uri: &str) -> bool {
        self.redirect_uris.iter().any(|r| r == uri)
    }

    /// Whether every scope in `requested` is allowed.
    #[must_use]
    pub fn allows_scopes<'a>(&self, mut requested: impl Iterator<Item = &'a str>) -> bool {
        requested.all(|s| self.allowed_scopes.iter().any(|a| a == s))
    }
}

/// Read-only client lookup.
#[async_trait::async_trait]
pub trait ClientRegistry: Send + Sync + 'static {
    /// Find a client by client id.
    async fn find_by_client_id(&self, client_id: &str) -> Result<Option<Client>, StoreError>;

    /// Find a client by its service domain.
    async fn find_by_domain(&self, domain: &str) -> Result<Option<Client>, StoreError>;
}

/// In-memory registry.
#[derive(Debug, Default)]
pub struct InMemoryClientRegistry {
    clients: DashMap<String, Client>,
}

impl InMemoryClientRegistry {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry preloaded with `clients`.
    #[must_use]
    pub fn with_clients(clients: impl IntoIterator<Item = Client>) -> Self {
        let registry = Self::new();
        for client in clients {
            registry.upsert(client);
        }
        registry
    }

    /// Add or replace a client.
    pub fn upsert(&self, client: Client) {
        self.clients.insert(client.client_id.clone(), client);
    }

    /// Remove a client. Returns whether it existed.
    pub fn remove(&self, client_id: &str) -> bool {
        self.clients.remove(client_id).is_some()
    }
}

#[async_trait::async_trait]
impl ClientRegistry for InMemoryClientRegistry {
    async fn find_by_client_id(&self, client_id: &str) -> Result<Option<Client>, StoreError> {
        Ok(self.clients.get(client_id).map(|c| c.clone()))
    }

    async fn find_by_domain(&self, domain: &str) -> Result<Option<Client>, StoreError> {
        Ok(self
            .clients
            .iter()
            .find(|c| c.domain == domain)
            .map(|c| c.clone()))
    }
}

struct CachedClient {
    client: Client,
    cached_at: Instant,
}

/// TTL cache in front of any [`ClientRegistry`].
///
/// Hits are served for `ttl` after the lookup. Misses are not cached, so a
/// newly registered client is visible immediately.
pub struct CachedClientRegistry {
    inner: Arc<dyn ClientRegistry>,
    ttl: Duration,
    by_client_id: DashMap<String, CachedClient>,
    by_domain: DashMap<String, CachedClient>,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl CachedClientRegistry {
    /// Wrap `inner`.
    #[must_use]
    pub fn new(inner: Arc<dyn ClientRegistry>, ttl: Duration) -> Self {
        Self {
            inner,
            ttl,
            by_client_id: DashMap::new(),
            by_domain: DashMap::new(),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    /// Drop every cached entry.
    pub fn invalidate_all(&self) {
        self.by_client_id.clear();
        self.by_domain.clear();
    }

    /// Cache hits so far.
    pub fn hits(&self) -> u64 {
        self.hits.load(Ordering::Relaxed)
    }

    /// Cache misses so far.
    pub fn misses(&self) -> u64 {
        self.misses.load(Ordering::Relaxed)
    }

    fn cached(&self, map: &DashMap<String, CachedClient>, key: &str) -> Option<Client> {
        let stale = match map.get(key) {
            Some(entry) if entry.cached_at.elapsed() <= self.ttl => {
                self.hits.fetch_add(1, Ordering::Relaxed);
                return Some(entry.client.clone());
            }
            Some(_) => true,
            None => false,
        };
        if stale {
            map.remove(key);
        }
        self.misses.fetch_add(1, Ordering::Relaxed);
        None
    }

    fn store(&self, client: &Client) {
        let now = Instant::now();
        self.by_client_id.insert(
            client.client_id.clone(),
            CachedClient {
                client: client.clone(),
                cached_at: now,
            },
        );
        self.by_domain.insert(
            client.domain.clone(),
            CachedClient {
                client: client.clone(),
                cached_at: now,
            },
        );
    }
}

#[async_trait::async_trait]
impl ClientRegistry for CachedClientRegistry {
    async fn find_by_client_id(&self, client_id: &str) -> Result<Option<Client>, StoreError> {
        if let Some(client) = self.cached(&self.by_client_id, client_id) {
            return Ok(Some(client));
        }
        let found = self.inner.find_by_client_id(client_id).await?;
        if let Some(ref client) = found {
            self.store(client);
        }
        Ok(found)
    }

    async fn find_by_domain(&self, domain: &str) -> Result<Option<Client>, StoreError> {
        if let Some(client) = self.cached(&self.by_domain, domain) {
            return Ok(Some(client));
        }
        let found = self.inner.find_by_domain(domain).await?;
        if let Some(ref client) = found {
            self.store(client);
        }
        Ok(found)
    }
}
