//! Transport and naming capabilities.
//!
//! The session core never talks HTTP directly. It drives a [`Transport`]
//! (open / invoke / ping / close against the server's session URL space) and
//! a [`Naming`] capability (catalog + repository name → base URL). Two
//! implementations ship with the crate:
//!
//! - [`HttpTransport`]: blocking reqwest client against a live server
//! - [`MemoryStore`]: in-process store with server-side sessions, used by
//!   tests, benchmarks and the CLI's offline mode

mod http;
mod memory;

pub use http::{adjust_session_url, HttpTransport};
pub use memory::{MemoryStore, RoundTrip};

use crate::overlay::DuplicateSuppression;
use serde::{Deserialize, Serialize};
use std::fmt;

/// A catalog + repository pair resolved to its base URL
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RepositoryRef {
    /// None = root catalog
    pub catalog: Option<String>,
    pub name: String,
    /// Base URL on the server's main port
    pub url: String,
}

impl fmt::Display for RepositoryRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.catalog {
            Some(catalog) => write!(f, "{catalog}/{}", self.name),
            None => write!(f, "{}", self.name),
        }
    }
}

/// An opaque statement. Terms are carried in whatever textual form the
/// server's statement endpoint accepts; the core never interprets them.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Statement {
    pub subject: String,
    pub predicate: String,
    pub object: String,
    pub graph: Option<String>,
}

impl Statement {
    pub fn new(
        subject: impl Into<String>,
        predicate: impl Into<String>,
        object: impl Into<String>,
    ) -> Self {
        Statement {
            subject: subject.into(),
            predicate: predicate.into(),
            object: object.into(),
            graph: None,
        }
    }

    pub fn in_graph(mut self, graph: impl Into<String>) -> Self {
        self.graph = Some(graph.into());
        self
    }

    /// Equality on subject, predicate and object only
    pub fn same_triple(&self, other: &Statement) -> bool {
        self.subject == other.subject
            && self.predicate == other.predicate
            && self.object == other.object
    }
}

/// Where a request is sent
#[derive(Debug, Clone, Copy)]
pub enum Endpoint<'a> {
    /// Session-less, autocommitting access through the repository URL
    Shared(&'a RepositoryRef),
    /// A dedicated session URL
    Session(&'a str),
}

impl fmt::Display for Endpoint<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Endpoint::Shared(repo) => write!(f, "{}", repo.url),
            Endpoint::Session(url) => write!(f, "{url}"),
        }
    }
}

/// Parameters for opening a dedicated session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OpenSession {
    pub lifetime_secs: u64,
    pub auto_commit: bool,
}

/// One request against a repository or session
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Operation {
    /// Number of statements visible to the caller
    Size,
    /// Add statements; `commit_every > 0` commits every N statements
    Add {
        statements: Vec<Statement>,
        commit_every: u32,
    },
    Remove(Vec<Statement>),
    /// Remove every visible statement
    Clear,
    Contains(Statement),
    Commit,
    Rollback,
    SetAutoCommit(bool),
    /// Reserve this many blank node identifiers
    BlankNodes(usize),
    SetMasquerade(Option<String>),
    /// 0 disables the cache
    SetTripleCache(u64),
    TripleCacheSize,
    SetBulkMode(bool),
    BulkMode,
    SetDuplicateSuppression(DuplicateSuppression),
    DuplicateSuppression,
    /// Delete duplicates now, comparing by `spo` or `spog`
    DeleteDuplicates(DuplicateSuppression),
}

impl Operation {
    /// Short name used in logs and round-trip accounting
    pub fn name(&self) -> &'static str {
        match self {
            Operation::Size => "size",
            Operation::Add { .. } => "add",
            Operation::Remove(_) => "remove",
            Operation::Clear => "clear",
            Operation::Contains(_) => "contains",
            Operation::Commit => "commit",
            Operation::Rollback => "rollback",
            Operation::SetAutoCommit(_) => "set_auto_commit",
            Operation::BlankNodes(_) => "blank_nodes",
            Operation::SetMasquerade(_) => "set_masquerade",
            Operation::SetTripleCache(_) => "set_triple_cache",
            Operation::TripleCacheSize => "triple_cache_size",
            Operation::SetBulkMode(_) => "set_bulk_mode",
            Operation::BulkMode => "bulk_mode",
            Operation::SetDuplicateSuppression(_) => "set_duplicate_suppression",
            Operation::DuplicateSuppression => "duplicate_suppression",
            Operation::DeleteDuplicates(_) => "delete_duplicates",
        }
    }

    /// Operations that only make sense inside a dedicated session
    pub fn requires_session(&self) -> bool {
        matches!(
            self,
            Operation::Commit
                | Operation::Rollback
                | Operation::SetAutoCommit(_)
                | Operation::SetMasquerade(_)
                | Operation::SetTripleCache(_)
                | Operation::SetBulkMode(_)
                | Operation::SetDuplicateSuppression(_)
        )
    }
}

/// Server reply to an [`Operation`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reply {
    Done,
    Count(u64),
    Flag(bool),
    Text(String),
    Identifiers(Vec<String>),
}

impl Reply {
    pub fn into_count(self) -> Result<u64, TransportError> {
        match self {
            Reply::Count(n) => Ok(n),
            other => Err(TransportError::unexpected("count", &other)),
        }
    }

    pub fn into_flag(self) -> Result<bool, TransportError> {
        match self {
            Reply::Flag(b) => Ok(b),
            other => Err(TransportError::unexpected("flag", &other)),
        }
    }

    pub fn into_text(self) -> Result<String, TransportError> {
        match self {
            Reply::Text(s) => Ok(s),
            other => Err(TransportError::unexpected("text", &other)),
        }
    }

    pub fn into_identifiers(self) -> Result<Vec<String>, TransportError> {
        match self {
            Reply::Identifiers(ids) => Ok(ids),
            other => Err(TransportError::unexpected("identifiers", &other)),
        }
    }
}

/// Failure at the transport boundary
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    /// The server no longer knows this session (expired or closed)
    #[error("Session {url} is gone")]
    SessionGone { url: String },

    /// The server refused the request as invalid
    #[error("Request rejected ({status}): {message}")]
    Rejected { status: u16, message: String },

    /// Network-level failure or unexpected HTTP status
    #[error("Cannot reach {endpoint}: {message}")]
    Unreachable { endpoint: String, message: String },

    /// The server replied with something the client cannot interpret
    #[error("Protocol error: {0}")]
    Protocol(String),
}

impl TransportError {
    fn unexpected(expected: &str, got: &Reply) -> Self {
        TransportError::Protocol(format!("expected {expected} reply, got {got:?}"))
    }
}

/// The session/repository request capability.
///
/// Each method maps to one request/response pair. Implementations must be
/// usable from many threads at once; the core does not serialise calls to
/// different sessions.
pub trait Transport: Send + Sync {
    /// Ask the server for a dedicated session; returns the session URL
    fn open_session(
        &self,
        repository: &RepositoryRef,
        params: &OpenSession,
    ) -> Result<String, TransportError>;

    fn invoke(&self, endpoint: Endpoint<'_>, op: &Operation) -> Result<Reply, TransportError>;

    /// Reset the session's expiry deadline
    fn ping(&self, session_url: &str) -> Result<(), TransportError>;

    fn close_session(&self, session_url: &str) -> Result<(), TransportError>;
}

/// The catalog / repository naming capability
pub trait Naming: Send + Sync {
    /// Base URL for a repository (it need not exist yet)
    fn resolve(&self, catalog: Option<&str>, repository: &str) -> RepositoryRef;

    fn has_repository(&self, catalog: Option<&str>, repository: &str)
        -> Result<bool, TransportError>;

    fn create_repository(
        &self,
        catalog: Option<&str>,
        repository: &str,
    ) -> Result<RepositoryRef, TransportError>;

    fn delete_repository(&self, catalog: Option<&str>, repository: &str)
        -> Result<(), TransportError>;

    fn list_repositories(&self, catalog: Option<&str>) -> Result<Vec<String>, TransportError>;
}
