//! HTTP server: application context, router and lifecycle.

mod routes;

pub use routes::create_router;

use std::future::IntoFuture;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use axum::{
    Json,
    http::{HeaderMap, StatusCode, header},
    response::{IntoResponse, Response},
};
use chrono::Utc;
use serde_json::json;
use tokio::net::TcpListener;
use tokio::signal;
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};

use crate::auth::{AuthService, ClientInfo, InMemoryUserRepository, UserRepository};
use crate::config::Config;
use crate::keys::{KeyHandle, KeyStore};
use crate::oidc::{
    AuthorizationService, CachedClientRegistry, ClientRegistry, CodeStore, DiscoveryDocument,
    InMemoryClientRegistry, InMemoryCodeStore,
};
use crate::permission::{InMemoryPermissionStore, PermissionEngine, PermissionStore};
use crate::revocation::{InMemoryKvStore, KvStore, RevocationCache};
use crate::session::{InMemorySessionStore, SessionManager, SessionStore};
use crate::token::TokenService;
use crate::{Error, Result};

/// Persistence collaborators.
pub struct Stores {
    /// User accounts.
    pub users: Arc<dyn UserRepository>,
    /// Refresh sessions.
    pub sessions: Arc<dyn SessionStore>,
    /// Roles and assignments.
    pub roles: Arc<dyn PermissionStore>,
    /// Revocation cache backend.
    pub kv: Arc<dyn KvStore>,
    /// Registered clients (wrapped in a cache by [`AppContext::new`]).
    pub clients: Arc<dyn ClientRegistry>,
    /// Authorization codes.
    pub codes: Arc<dyn CodeStore>,
}

impl Stores {
    /// In-process stores, with the clients from `config` registered.
    #[must_use]
    pub fn in_memory(config: &Config) -> Self {
        Self {
            users: Arc::new(InMemoryUserRepository::new()),
            sessions: Arc::new(InMemorySessionStore::new()),
            roles: Arc::new(InMemoryPermissionStore::new()),
            kv: Arc::new(InMemoryKvStore::new()),
            clients: Arc::new(InMemoryClientRegistry::with_clients(
                config.oidc.clients.iter().cloned(),
            )),
            codes: Arc::new(InMemoryCodeStore::new()),
        }
    }
}

/// Everything a request handler needs, built once at startup.
pub struct AppContext {
    /// Loaded configuration.
    pub config: Config,
    /// Current signing keys.
    pub keys: Arc<KeyHandle>,
    /// Token minting and validation.
    pub tokens: Arc<TokenService>,
    /// Session lifecycle.
    pub sessions: Arc<SessionManager>,
    /// Scope snapshots.
    pub permissions: Arc<PermissionEngine>,
    /// Revocation lookups.
    pub revocation: Arc<RevocationCache>,
    /// Authorization codes.
    pub authorization: Arc<AuthorizationService>,
    /// Login, refresh, logout.
    pub auth: Arc<AuthService>,
    /// Discovery document.
    pub discovery: DiscoveryDocument,
}

impl AppContext {
    /// Wire every component from `config`, the initial `keys` and `stores`.
    #[must_use]
    pub fn new(config: Config, keys: KeyStore, stores: Stores) -> Self {
        let store_timeout = config.server.store_timeout;
        let keys = Arc::new(KeyHandle::new(keys));
        let tokens = Arc::new(TokenService::new(
            Arc::clone(&keys),
            config.auth.issuer.clone(),
            config.auth.access_token_ttl,
        ));
        let sessions = Arc::new(SessionManager::new(stores.sessions, store_timeout));
        let permissions = Arc::new(PermissionEngine::new(stores.roles, store_timeout));
        let revocation = Arc::new(RevocationCache::new(
            stores.kv,
            config.revocation.policy,
            config.revocation.retry(),
        ));
        let clients: Arc<dyn ClientRegistry> = Arc::new(CachedClientRegistry::new(
            stores.clients,
            config.registry.cache_ttl,
        ));
        let authorization = Arc::new(AuthorizationService::new(
            clients,
            stores.codes,
            config.oidc.code_lifetime,
            store_timeout,
        ));
        let auth = Arc::new(AuthService::new(
            stores.users,
            Arc::clone(&sessions),
            Arc::clone(&permissions),
            Arc::clone(&tokens),
            Arc::clone(&revocation),
            config.auth.session_ttl,
            store_timeout,
        ));
        let discovery = DiscoveryDocument::new(
            &config.auth.issuer,
            &config.oidc.base_url,
            &config.oidc.scopes_supported,
        );

        Self {
            config,
            keys,
            tokens,
            sessions,
            permissions,
            revocation,
            authorization,
            auth,
            discovery,
        }
    }

    /// Load keys from the configured directory and wire in-memory stores.
    pub fn from_config(config: Config) -> Result<Self> {
        let keys = KeyStore::load(&config.auth.keys_path, &config.auth.active_kid)?;
        let stores = Stores::in_memory(&config);
        Ok(Self::new(config, keys, stores))
    }

    /// Swap in `next`, keeping every current key verifiable.
    pub fn rotate_keys(&self, next: KeyStore) {
        let previous = self.keys.current();
        self.keys.rotate(next.with_grace_keys(&previous));
    }

    /// Reload the key directory and rotate.
    pub fn reload_keys(&self) -> Result<()> {
        let next = KeyStore::load(&self.config.auth.keys_path, &self.config.auth.active_kid)?;
        self.rotate_keys(next);
        Ok(())
    }

    /// Whether the session cookie should carry `Secure`.
    fn secure_cookies(&self) -> bool {
        self.config.oidc.base_url.starts_with("https://")
    }
}

/// Create a JSON error response.
pub(crate) fn error_response(status: StatusCode, error: &str, message: &str) -> Response {
    (status, Json(json!({"error": error, "message": message}))).into_response()
}

/// Extract client IP from `X-Forwarded-For` or `X-Real-IP` headers.
fn extract_client_ip(headers: &HeaderMap) -> Option<IpAddr> {
    headers
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(',').next())
        .and_then(|s| s.trim().parse().ok())
        .or_else(|| {
            headers
                .get("x-real-ip")
                .and_then(|v| v.to_str().ok())
                .and_then(|s| s.trim().parse().ok())
        })
}

fn client_info(headers: &HeaderMap) -> ClientInfo {
    ClientInfo {
        user_agent: headers
            .get(header::USER_AGENT)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string),
        ip: extract_client_ip(headers),
    }
}

/// Periodically purge expired sessions, codes and revocation entries.
pub fn spawn_reaper(ctx: Arc<AppContext>, interval: Duration, mut shutdown: broadcast::Receiver<()>) {
    let sessions = ctx.sessions.store();
    let codes = ctx.authorization.codes();
    let kv = ctx.revocation.store();
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let now = Utc::now();
                    let reaped = sessions.reap_expired(now).await
                        + codes.reap_expired(now).await
                        + kv.reap_expired().await;
                    if reaped > 0 {
                        debug!(count = reaped, "Reaped expired records");
                    }
                }
                _ = shutdown.recv() => {
                    debug!("Reaper shutting down");
                    break;
                }
            }
        }
    });
}

/// Reload signing keys on SIGHUP.
#[cfg(unix)]
fn spawn_key_reloader(ctx: Arc<AppContext>, mut shutdown: broadcast::Receiver<()>) {
    let mut hangup = match signal::unix::signal(signal::unix::SignalKind::hangup()) {
        Ok(s) => s,
        Err(e) => {
            warn!(error = %e, "Failed to install SIGHUP handler, key reload disabled");
            return;
        }
    };
    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = hangup.recv() => {
                    match ctx.reload_keys() {
                        Ok(()) => info!("Signing keys reloaded"),
                        Err(e) => error!(error = %e, "Key reload failed, keeping current keys"),
                    }
                }
                _ = shutdown.recv() => break,
            }
        }
    });
}

/// Identity provider server
pub struct Server {
    ctx: Arc<AppContext>,
}

impl Server {
    /// Create a server around a wired context.
    #[must_use]
    pub fn new(ctx: AppContext) -> Self {
        Self { ctx: Arc::new(ctx) }
    }

    /// Shared context.
    #[must_use]
    pub fn context(&self) -> Arc<AppContext> {
        Arc::clone(&self.ctx)
    }

    /// Serve until SIGINT/SIGTERM, then drain for at most `shutdown_timeout`.
    pub async fn run(self) -> Result<()> {
        let server_config = &self.ctx.config.server;
        let addr = SocketAddr::new(
            server_config
                .host
                .parse()
                .map_err(|e| Error::Config(format!("Invalid host: {e}")))?,
            server_config.port,
        );
        let shutdown_timeout = server_config.shutdown_timeout;

        let (shutdown_tx, _) = broadcast::channel(1);
        spawn_reaper(
            Arc::clone(&self.ctx),
            server_config.reap_interval,
            shutdown_tx.subscribe(),
        );
        #[cfg(unix)]
        spawn_key_reloader(Arc::clone(&self.ctx), shutdown_tx.subscribe());

        let app = create_router(Arc::clone(&self.ctx));
        let listener = TcpListener::bind(addr).await?;

        let keys = self.ctx.keys.current();
        info!("============================================================");
        info!("IDGATE v{}", env!("CARGO_PKG_VERSION"));
        info!("============================================================");
        info!(host = %server_config.host, port = %server_config.port, "Listening");
        info!(issuer = %self.ctx.config.auth.issuer, active_kid = %keys.active_kid(), keys = keys.kids().count(), "Signing keys loaded");
        info!(policy = ?self.ctx.config.revocation.policy, "Revocation cache ready");
        info!("Discovery: {}/.well-known/openid-configuration", self.ctx.config.oidc.base_url);
        info!("============================================================");

        let mut drain_rx = shutdown_tx.subscribe();
        let serve = axum::serve(listener, app)
            .with_graceful_shutdown(shutdown_signal(shutdown_tx))
            .into_future();
        let drain_deadline = async move {
            let _ = drain_rx.recv().await;
            tokio::time::sleep(shutdown_timeout).await;
        };

        tokio::select! {
            result = serve => result.map_err(|e| Error::Internal(e.to_string()))?,
            () = drain_deadline => {
                warn!(timeout = ?shutdown_timeout, "Graceful shutdown timed out, dropping open connections");
            }
        }

        info!("Server stopped");
        Ok(())
    }
}

/// Shutdown signal handler
async fn shutdown_signal(shutdown_tx: broadcast::Sender<()>) {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {},
        () = terminate => {},
    }

    info!("Shutdown signal received");
    let _ = shutdown_tx.send(());
}
