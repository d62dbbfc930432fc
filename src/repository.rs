//! Client, catalogs and repositories.
//!
//! ```text
//! StoreClient ── catalog(name) ──▶ Catalog ── open/create ──▶ Repository
//!                                                              │
//!                                    ArcSwapOption<ConnectionPool>
//!                                                              │
//!                                          get_connection() ──▶ LogicalConnection
//! ```
//!
//! A `StoreClient` owns the transport, the naming capability, the
//! process-wide [`SessionDefaults`] and the [`SessionRegistry`]. Two clients
//! never share defaults, so tests can run with independent settings.

use crate::config::{Config, PoolConfig, PoolSessionMode, SessionDefaults};
use crate::connection::LogicalConnection;
use crate::error::{SessionError, SessionResult};
use crate::pool::ConnectionPool;
use crate::session::{transport_error, SessionFactory, SessionRegistry};
use crate::transport::{HttpTransport, MemoryStore, Naming, RepositoryRef, Transport};
use arc_swap::ArcSwapOption;
use std::fmt;
use std::sync::Arc;

struct ClientInner {
    transport: Arc<dyn Transport>,
    naming: Arc<dyn Naming>,
    defaults: Arc<SessionDefaults>,
    registry: Arc<SessionRegistry>,
    config: Config,
}

/// Entry point: one server, one set of defaults
#[derive(Clone)]
pub struct StoreClient {
    inner: Arc<ClientInner>,
}

impl StoreClient {
    pub fn new(transport: Arc<dyn Transport>, naming: Arc<dyn Naming>, config: Config) -> Self {
        let defaults = Arc::new(SessionDefaults::from_config(&config));
        StoreClient {
            inner: Arc::new(ClientInner {
                transport,
                naming,
                defaults,
                registry: Arc::new(SessionRegistry::new()),
                config,
            }),
        }
    }

    /// Client for the server named in `config.server`
    pub fn connect(config: Config) -> SessionResult<Self> {
        let http = Arc::new(
            HttpTransport::new(&config.server)
                .map_err(|e| transport_error(&config.server.url, e))?,
        );
        tracing::info!(server = %http.base_url(), "client_connected");
        Ok(Self::new(http.clone(), http, config))
    }

    /// Client backed by an in-process store
    pub fn in_memory(store: Arc<MemoryStore>, config: Config) -> Self {
        Self::new(store.clone(), store, config)
    }

    pub fn config(&self) -> &Config {
        &self.inner.config
    }

    pub fn defaults(&self) -> &Arc<SessionDefaults> {
        &self.inner.defaults
    }

    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.inner.registry
    }

    /// `None` is the root catalog
    pub fn catalog(&self, name: Option<&str>) -> Catalog {
        Catalog {
            client: self.clone(),
            name: name.map(str::to_string),
        }
    }

    /// Open (creating if needed) the repository named in `config.server`,
    /// with a pool when `config.pool.enabled`
    pub fn default_repository(&self) -> SessionResult<Repository> {
        let server = &self.inner.config.server;
        let repository = self
            .catalog(server.catalog.as_deref())
            .create_repository(&server.repository)?;
        if self.inner.config.pool.enabled {
            repository.enable_pool(self.inner.config.pool.clone())?;
        }
        Ok(repository)
    }

    fn factory(&self, repository: RepositoryRef) -> SessionFactory {
        SessionFactory::new(
            Arc::clone(&self.inner.transport),
            repository,
            Arc::clone(&self.inner.defaults),
            Arc::clone(&self.inner.registry),
        )
    }
}

impl fmt::Debug for StoreClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StoreClient")
            .field("server", &self.inner.config.server.url)
            .field("sessions", &self.inner.registry.session_count())
            .finish()
    }
}

/// A catalog on the server
#[derive(Clone)]
pub struct Catalog {
    client: StoreClient,
    name: Option<String>,
}

impl Catalog {
    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    fn naming(&self) -> &dyn Naming {
        self.client.inner.naming.as_ref()
    }

    fn naming_error(&self, repository: &str, e: crate::transport::TransportError) -> SessionError {
        let url = self.naming().resolve(self.name(), repository).url;
        transport_error(&url, e)
    }

    pub fn has_repository(&self, repository: &str) -> SessionResult<bool> {
        self.naming()
            .has_repository(self.name(), repository)
            .map_err(|e| self.naming_error(repository, e))
    }

    pub fn list_repositories(&self) -> SessionResult<Vec<String>> {
        self.naming()
            .list_repositories(self.name())
            .map_err(|e| self.naming_error("", e))
    }

    /// Open an existing repository
    pub fn open_repository(&self, repository: &str) -> SessionResult<Repository> {
        if !self.has_repository(repository)? {
            return Err(SessionError::invalid(
                "repository",
                format!(
                    "{} does not exist in catalog {}",
                    repository,
                    self.name().unwrap_or("<root>")
                ),
            ));
        }
        let reference = self.naming().resolve(self.name(), repository);
        Ok(Repository::new(self.client.factory(reference)))
    }

    /// Open a repository, creating it if it does not exist
    pub fn create_repository(&self, repository: &str) -> SessionResult<Repository> {
        let reference = self
            .naming()
            .create_repository(self.name(), repository)
            .map_err(|e| self.naming_error(repository, e))?;
        tracing::debug!(repository = %reference, "repository_opened");
        Ok(Repository::new(self.client.factory(reference)))
    }

    pub fn delete_repository(&self, repository: &str) -> SessionResult<()> {
        self.naming()
            .delete_repository(self.name(), repository)
            .map_err(|e| self.naming_error(repository, e))
    }
}

/// A repository, optionally owning a connection pool
pub struct Repository {
    factory: SessionFactory,
    pool: ArcSwapOption<ConnectionPool>,
}

impl Repository {
    fn new(factory: SessionFactory) -> Self {
        Repository {
            factory,
            pool: ArcSwapOption::empty(),
        }
    }

    pub fn reference(&self) -> &RepositoryRef {
        self.factory.repository()
    }

    pub fn defaults(&self) -> &Arc<SessionDefaults> {
        self.factory.defaults()
    }

    pub fn registry(&self) -> &Arc<SessionRegistry> {
        self.factory.registry()
    }

    /// Build a pool from `config` and attach it, closing any previous pool
    pub fn enable_pool(&self, config: PoolConfig) -> SessionResult<Arc<ConnectionPool>> {
        let pool = Arc::new(ConnectionPool::new(self.factory.clone(), config)?);
        self.set_pool(Some(Arc::clone(&pool)));
        Ok(pool)
    }

    /// Replace the pool. The old pool is closed; connections already using
    /// it keep their sessions until they release them.
    pub fn set_pool(&self, pool: Option<Arc<ConnectionPool>>) {
        if let Some(previous) = self.pool.swap(pool) {
            previous.close();
        }
    }

    pub fn pool(&self) -> Option<Arc<ConnectionPool>> {
        self.pool.load_full()
    }

    /// A new logical connection. With a pool, the pool's session mode
    /// decides how it starts: shared, pinned to a dedicated session, or
    /// already in manual-commit mode.
    pub fn get_connection(&self) -> SessionResult<LogicalConnection> {
        let pool = self.pool.load_full();
        let mode = pool
            .as_ref()
            .map_or(PoolSessionMode::Shared, |p| p.config().session_mode);
        let connection = LogicalConnection::new(self.factory.clone(), pool);
        match mode {
            PoolSessionMode::Shared => {}
            PoolSessionMode::Dedicated => connection.pin()?,
            PoolSessionMode::Tx => connection.set_auto_commit(false)?,
        }
        Ok(connection)
    }

    /// Close the pool, if any
    pub fn shutdown(&self) {
        self.set_pool(None);
    }
}

impl Drop for Repository {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl fmt::Debug for Repository {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Repository")
            .field("reference", &self.reference().to_string())
            .field("pooled", &self.pool.load().is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn client() -> (Arc<MemoryStore>, StoreClient) {
        let store = Arc::new(MemoryStore::new());
        let mut config = Config::default();
        config.session.keepalive = false;
        (Arc::clone(&store), StoreClient::in_memory(store, config))
    }

    #[test]
    fn test_open_missing_repository_fails() {
        let (_, client) = client();
        let err = client
            .catalog(Some("tests"))
            .open_repository("nope")
            .unwrap_err();
        assert!(matches!(err, SessionError::ValidationFailure { .. }));
    }

    #[test]
    fn test_create_then_open() {
        let (_, client) = client();
        let catalog = client.catalog(Some("tests"));
        catalog.create_repository("people").unwrap();
        let repo = catalog.open_repository("people").unwrap();
        assert_eq!(repo.reference().to_string(), "tests/people");
        assert_eq!(catalog.list_repositories().unwrap(), vec!["people"]);
    }

    #[test]
    fn test_pool_session_modes() {
        let (store, client) = client();
        let repo = client.catalog(None).create_repository("modes").unwrap();

        let shared = repo.get_connection().unwrap();
        assert!(!shared.is_bound());

        repo.enable_pool(PoolConfig {
            enabled: true,
            session_mode: PoolSessionMode::Dedicated,
            ..PoolConfig::default()
        })
        .unwrap();
        let dedicated = repo.get_connection().unwrap();
        assert!(dedicated.is_pooled());
        assert!(dedicated.auto_commit());

        repo.enable_pool(PoolConfig {
            enabled: true,
            session_mode: PoolSessionMode::Tx,
            ..PoolConfig::default()
        })
        .unwrap();
        let tx = repo.get_connection().unwrap();
        assert!(!tx.auto_commit());
        assert!(tx.is_pooled());

        drop((dedicated, tx));
        repo.shutdown();
        assert!(repo.pool().is_none());
        assert_eq!(store.session_count(), 0);
    }

    #[test]
    fn test_default_repository_from_config() {
        let store = Arc::new(MemoryStore::new());
        let mut config = Config::default();
        config.session.keepalive = false;
        config.server.catalog = Some("cfg".to_string());
        config.server.repository = "main".to_string();
        config.pool.enabled = true;
        config.pool.initial_size = 2;
        let client = StoreClient::in_memory(Arc::clone(&store), config);

        let repo = client.default_repository().unwrap();
        assert_eq!(repo.reference().to_string(), "cfg/main");
        assert_eq!(repo.pool().unwrap().stats().idle, 2);
    }
}
