//! # graphsession
//!
//! Session lifecycle and connection pooling for a remote transactional graph
//! store reached over stateless HTTP.
//!
//! ## Architecture
//!
//! ```text
//! StoreClient
//!     ├── SessionDefaults      (runtime-mutable lifetime / port / batch size)
//!     ├── SessionRegistry      (every dedicated session this client opened)
//!     └── Catalog → Repository
//!                     ├── ConnectionPool (optional, swappable)
//!                     └── get_connection() → LogicalConnection
//!                                               ├── shared backend (stateless)
//!                                               ├── BackendSession (dedicated, keep-alive)
//!                                               ├── SessionOverlay (masquerade, cache, bulk, ...)
//!                                               └── BlankNodeAllocator
//! ```
//!
//! A `LogicalConnection` starts on the shared, stateless backend. It binds
//! to a dedicated server-side session only when something needs one: manual
//! commit, a non-default overlay, or an explicit pin. Once nothing needs it
//! any more, the session goes back to the pool (or is closed).
//!
//! ## Usage
//!
//! ```rust,ignore
//! use graphsession::{Config, StoreClient, Statement};
//!
//! let client = StoreClient::connect(Config::load()?)?;
//! let repo = client.catalog(Some("tests")).create_repository("people")?;
//!
//! let conn = repo.get_connection()?;
//! conn.set_auto_commit(false)?;
//! conn.add(vec![Statement::new("<a>", "<knows>", "<b>")])?;
//! conn.commit()?;
//! conn.close()?;
//! ```

pub mod blank_node;
pub mod config;
pub mod connection;
pub mod error;
pub mod overlay;
pub mod pool;
pub mod repository;
pub mod session;
pub mod transport;

pub use blank_node::{BlankNode, BlankNodeAllocator};
pub use config::{Config, PoolConfig, PoolSessionMode, SessionDefaults};
pub use connection::LogicalConnection;
pub use error::{SessionError, SessionResult};
pub use overlay::{DuplicateSuppression, SessionOverlay};
pub use pool::{ConnectionPool, PoolStats, PooledSession};
pub use repository::{Catalog, Repository, StoreClient};
pub use session::{
    ActivityClock, BackendSession, SessionFactory, SessionInfo, SessionRegistry, SessionState,
};
pub use transport::{
    HttpTransport, MemoryStore, Naming, Operation, Reply, RepositoryRef, Statement, Transport,
    TransportError,
};
