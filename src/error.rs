//! Error types for session and pool management.
//!
//! Every error that leaves the crate is a [`SessionError`]. Lifecycle errors
//! (pool exhaustion, session expiry, closed sessions) carry the repository and,
//! where one exists, the session identity so callers can decide whether to
//! re-bind, back off, or give up.

use std::time::Duration;

/// Session-management error type.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SessionError {
    /// No pooled session became available within the borrow timeout
    #[error(
        "Connection pool for {repository} exhausted after {waited:?} ({active}/{max_active} sessions checked out)"
    )]
    PoolExhausted {
        repository: String,
        waited: Duration,
        active: usize,
        max_active: usize,
    },

    /// The pool was closed before or during the borrow
    #[error("Connection pool for {repository} is closed")]
    PoolClosed { repository: String },

    /// The session outlived its lifetime without a ping or operation
    #[error("Session {session} on {repository} expired (lifetime {lifetime_secs}s)")]
    SessionExpired {
        session: String,
        repository: String,
        lifetime_secs: u64,
    },

    /// The session was closed explicitly and accepts no further operations
    #[error("Session {session} on {repository} is closed")]
    SessionClosed { session: String, repository: String },

    /// The logical connection was closed
    #[error("Connection to {repository} is closed")]
    ConnectionClosed { repository: String },

    /// Network or HTTP-level failure
    #[error("Transport failure on {endpoint}: {message}")]
    TransportFailure { endpoint: String, message: String },

    /// The server (or client-side validation) rejected a setting
    #[error("Invalid {setting}: {message}")]
    ValidationFailure { setting: String, message: String },

    /// Programmer error, e.g. commit while autocommitting
    #[error("Illegal state transition: {0}")]
    IllegalStateTransition(String),

    /// Configuration could not be loaded or is inconsistent
    #[error("Configuration error: {0}")]
    Config(String),
}

impl SessionError {
    /// Whether retrying the same call (after backoff) can succeed.
    ///
    /// Expired sessions are not retryable in this sense: the caller has to
    /// re-bind to a fresh session first.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            SessionError::PoolExhausted { .. } | SessionError::TransportFailure { .. }
        )
    }

    pub fn is_session_expired(&self) -> bool {
        matches!(self, SessionError::SessionExpired { .. })
    }

    /// Session identity attached to the error, if any
    pub fn session(&self) -> Option<&str> {
        match self {
            SessionError::SessionExpired { session, .. }
            | SessionError::SessionClosed { session, .. } => Some(session),
            _ => None,
        }
    }

    pub(crate) fn illegal(message: impl Into<String>) -> Self {
        SessionError::IllegalStateTransition(message.into())
    }

    pub(crate) fn invalid(setting: &str, message: impl Into<String>) -> Self {
        SessionError::ValidationFailure {
            setting: setting.to_string(),
            message: message.into(),
        }
    }
}

impl From<figment::Error> for SessionError {
    fn from(e: figment::Error) -> Self {
        SessionError::Config(e.to_string())
    }
}

/// Result type for session operations
pub type SessionResult<T> = Result<T, SessionError>;
