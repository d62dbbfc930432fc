//! Backend sessions.
//!
//! A [`BackendSession`] is one dedicated, stateful server session. Its
//! lifecycle is a small state machine:
//!
//! ```text
//! Pending ──open ok──▶ Active ──close──▶ Closed
//!    │                   │                 ▲
//!    └──open failed      └──deadline──▶ Expired ──close──┘
//! ```
//!
//! The server expires a session once `lifetime` elapses after its last
//! request. The client tracks the same deadline in an [`ActivityClock`],
//! stamped with the time each request was *dispatched*, so the local view
//! can only err on the side of "expired early".

use super::keepalive::KeepAlive;
use super::registry::{SessionKey, SessionRegistry};
use crate::config::SessionDefaults;
use crate::error::{SessionError, SessionResult};
use crate::transport::{
    adjust_session_url, Endpoint, OpenSession, Operation, Reply, RepositoryRef, Transport,
    TransportError,
};
use parking_lot::Mutex;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Lifecycle state of a backend session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SessionState {
    Pending,
    Active,
    Expired,
    Closed,
}

impl SessionState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, SessionState::Expired | SessionState::Closed)
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SessionState::Pending => "pending",
            SessionState::Active => "active",
            SessionState::Expired => "expired",
            SessionState::Closed => "closed",
        };
        f.write_str(name)
    }
}

/// Last-activity timestamp shared between a session and its keep-alive.
///
/// Stored as nanoseconds since a fixed base instant so concurrent updates
/// can use `fetch_max`: a late-finishing old request never moves the
/// deadline backwards.
#[derive(Debug)]
pub struct ActivityClock {
    base: Instant,
    last_activity: AtomicU64,
    lifetime: Duration,
}

impl ActivityClock {
    pub fn new(lifetime: Duration) -> Self {
        ActivityClock {
            base: Instant::now(),
            last_activity: AtomicU64::new(0),
            lifetime,
        }
    }

    /// Record a request dispatched at `at`
    pub fn touch_at(&self, at: Instant) {
        let nanos = at.saturating_duration_since(self.base).as_nanos() as u64;
        self.last_activity.fetch_max(nanos, Ordering::SeqCst);
    }

    pub fn touch(&self) {
        self.touch_at(Instant::now());
    }

    pub fn lifetime(&self) -> Duration {
        self.lifetime
    }

    pub fn last_activity(&self) -> Instant {
        self.base + Duration::from_nanos(self.last_activity.load(Ordering::SeqCst))
    }

    pub fn deadline(&self) -> Instant {
        self.last_activity() + self.lifetime
    }

    pub fn is_expired_at(&self, now: Instant) -> bool {
        now >= self.deadline()
    }

    pub fn is_expired(&self) -> bool {
        self.is_expired_at(Instant::now())
    }

    /// Time since the last recorded request
    pub fn idle(&self) -> Duration {
        Instant::now().saturating_duration_since(self.last_activity())
    }

    pub fn remaining(&self) -> Duration {
        self.deadline().saturating_duration_since(Instant::now())
    }
}

/// Opens dedicated sessions against one repository
#[derive(Clone)]
pub struct SessionFactory {
    transport: Arc<dyn Transport>,
    repository: RepositoryRef,
    defaults: Arc<SessionDefaults>,
    registry: Arc<SessionRegistry>,
}

impl SessionFactory {
    pub fn new(
        transport: Arc<dyn Transport>,
        repository: RepositoryRef,
        defaults: Arc<SessionDefaults>,
        registry: Arc<SessionRegistry>,
    ) -> Self {
        SessionFactory {
            transport,
            repository,
            defaults,
            registry,
        }
    }

    pub fn repository(&self) -> &RepositoryRef {
        &self.repository
    }

    pub fn defaults(&self) -> &Arc<SessionDefaults> {
        &self.defaults
    }

    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.registry
    }

    pub fn transport(&self) -> &Arc<dyn Transport> {
        &self.transport
    }

    /// Open a session in autocommit mode.
    ///
    /// `lifetime_secs = None` takes the process-wide default at this moment.
    pub fn open(&self, lifetime_secs: Option<u64>) -> SessionResult<Arc<BackendSession>> {
        self.open_with(lifetime_secs, None)
    }

    /// Like [`open`](Self::open), with an explicit keep-alive choice in place
    /// of the default
    pub fn open_with(
        &self,
        lifetime_secs: Option<u64>,
        keepalive: Option<bool>,
    ) -> SessionResult<Arc<BackendSession>> {
        let lifetime_secs = lifetime_secs.unwrap_or_else(|| self.defaults.session_lifetime_secs());
        let keepalive = keepalive.unwrap_or_else(|| self.defaults.keepalive());
        let repository = self.repository.to_string();
        let key = self.registry.register_pending(&repository, lifetime_secs);

        let clock = Arc::new(ActivityClock::new(Duration::from_secs(lifetime_secs)));
        let params = OpenSession {
            lifetime_secs,
            auto_commit: true,
        };
        clock.touch();
        let opened = self
            .transport
            .open_session(&self.repository, &params)
            .and_then(|url| {
                adjust_session_url(
                    &url,
                    &self.repository.url,
                    self.defaults.use_main_port_for_sessions(),
                    self.defaults.override_server_use_main_port(),
                )
            });
        let url = match opened {
            Ok(url) => url,
            Err(e) => {
                self.registry.open_failed(key, &e.to_string());
                tracing::warn!(repository = %repository, error = %e, "session_open_failed");
                return Err(transport_error(&self.repository.url, e));
            }
        };

        self.registry.activate(key, &url, Arc::clone(&clock));
        let keepalive = if keepalive {
            KeepAlive::start(
                key,
                url.clone(),
                Arc::clone(&self.transport),
                Arc::clone(&clock),
                Arc::clone(&self.registry),
            )
        } else {
            None
        };

        tracing::info!(
            repository = %repository,
            session = %url,
            lifetime_secs,
            keepalive = keepalive.is_some(),
            "session_opened"
        );

        Ok(Arc::new(BackendSession {
            key,
            url,
            repository,
            lifetime_secs,
            clock,
            state: Mutex::new(SessionState::Active),
            auto_commit: AtomicBool::new(true),
            upload_commit_period: AtomicU32::new(0),
            transport: Arc::clone(&self.transport),
            registry: Arc::clone(&self.registry),
            keepalive: Mutex::new(keepalive),
        }))
    }
}

/// One dedicated server session
pub struct BackendSession {
    key: SessionKey,
    url: String,
    repository: String,
    lifetime_secs: u64,
    clock: Arc<ActivityClock>,
    state: Mutex<SessionState>,
    auto_commit: AtomicBool,
    upload_commit_period: AtomicU32,
    transport: Arc<dyn Transport>,
    registry: Arc<SessionRegistry>,
    keepalive: Mutex<Option<KeepAlive>>,
}

impl BackendSession {
    pub fn key(&self) -> SessionKey {
        self.key
    }

    /// Server-assigned session URL
    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn repository(&self) -> &str {
        &self.repository
    }

    /// Lifetime fixed at creation
    pub fn lifetime_secs(&self) -> u64 {
        self.lifetime_secs
    }

    pub fn clock(&self) -> &ActivityClock {
        &self.clock
    }

    /// Current state; an active session past its deadline reports `Expired`
    pub fn state(&self) -> SessionState {
        let state = *self.state.lock();
        if state == SessionState::Active && self.clock.is_expired() {
            SessionState::Expired
        } else {
            state
        }
    }

    pub fn is_usable(&self) -> bool {
        self.state() == SessionState::Active
    }

    pub fn auto_commit(&self) -> bool {
        self.auto_commit.load(Ordering::SeqCst)
    }

    pub fn upload_commit_period(&self) -> u32 {
        self.upload_commit_period.load(Ordering::SeqCst)
    }

    /// Client-side: attached to later add requests
    pub fn set_upload_commit_period(&self, period: u32) {
        self.upload_commit_period.store(period, Ordering::SeqCst);
    }

    pub fn has_keepalive(&self) -> bool {
        self.keepalive.lock().is_some()
    }

    /// Run one request inside this session
    pub fn invoke(&self, op: &Operation) -> SessionResult<Reply> {
        self.ensure_usable()?;
        let op = self.with_commit_period(op);
        let dispatched = Instant::now();
        match self.transport.invoke(Endpoint::Session(&self.url), &op) {
            Ok(reply) => {
                self.clock.touch_at(dispatched);
                if let Operation::SetAutoCommit(on) = op {
                    self.auto_commit.store(on, Ordering::SeqCst);
                }
                tracing::trace!(session = %self.url, op = op.name(), "session_request");
                Ok(reply)
            }
            Err(e) => Err(self.fail(e)),
        }
    }

    /// Reset the expiry deadline without doing anything else
    pub fn ping(&self) -> SessionResult<()> {
        self.ensure_usable()?;
        let dispatched = Instant::now();
        match self.transport.ping(&self.url) {
            Ok(()) => {
                self.clock.touch_at(dispatched);
                Ok(())
            }
            Err(e) => Err(self.fail(e)),
        }
    }

    /// Close the session.
    ///
    /// Closing a closed session does nothing. Closing an expired session
    /// still asks the server to drop it, releases the client-side state and
    /// reports `SessionExpired`.
    pub fn close(&self) -> SessionResult<()> {
        let previous = {
            let mut state = self.state.lock();
            let previous = *state;
            if previous == SessionState::Closed {
                return Ok(());
            }
            *state = SessionState::Closed;
            previous
        };
        self.stop_keepalive();

        if previous == SessionState::Expired || self.clock.is_expired() {
            // The server may still hold it if its clock lags ours
            if let Err(e) = self.transport.close_session(&self.url) {
                tracing::debug!(session = %self.url, error = %e, "expired_session_close_ignored");
            }
            self.registry.remove(self.key);
            tracing::info!(session = %self.url, "expired_session_closed");
            return Err(self.expired_error());
        }

        let result = self.transport.close_session(&self.url);
        self.registry.remove(self.key);
        match result {
            Ok(()) => {
                tracing::info!(session = %self.url, "session_closed");
                Ok(())
            }
            Err(TransportError::SessionGone { .. }) => {
                tracing::info!(session = %self.url, "session_gone_at_close");
                Err(self.expired_error())
            }
            Err(e) => {
                tracing::warn!(session = %self.url, error = %e, "session_close_failed");
                Err(transport_error(&self.url, e))
            }
        }
    }

    fn ensure_usable(&self) -> SessionResult<()> {
        match self.state() {
            SessionState::Active => Ok(()),
            SessionState::Closed => Err(SessionError::SessionClosed {
                session: self.url.clone(),
                repository: self.repository.clone(),
            }),
            SessionState::Expired => {
                self.mark_expired();
                Err(self.expired_error())
            }
            SessionState::Pending => Err(SessionError::illegal(format!(
                "session {} is still opening",
                self.url
            ))),
        }
    }

    fn with_commit_period(&self, op: &Operation) -> Operation {
        match op {
            Operation::Add {
                statements,
                commit_every: 0,
            } => Operation::Add {
                statements: statements.clone(),
                commit_every: self.upload_commit_period(),
            },
            other => other.clone(),
        }
    }

    fn fail(&self, error: TransportError) -> SessionError {
        match error {
            TransportError::SessionGone { .. } => {
                self.mark_expired();
                self.expired_error()
            }
            other => transport_error(&self.url, other),
        }
    }

    fn mark_expired(&self) {
        {
            let mut state = self.state.lock();
            if *state != SessionState::Active {
                return;
            }
            *state = SessionState::Expired;
        }
        self.stop_keepalive();
        self.registry.mark_expired(self.key);
        tracing::info!(
            session = %self.url,
            lifetime_secs = self.lifetime_secs,
            "session_expired"
        );
    }

    fn stop_keepalive(&self) {
        if let Some(keepalive) = self.keepalive.lock().take() {
            keepalive.stop();
        }
    }

    fn expired_error(&self) -> SessionError {
        SessionError::SessionExpired {
            session: self.url.clone(),
            repository: self.repository.clone(),
            lifetime_secs: self.lifetime_secs,
        }
    }
}

impl fmt::Debug for BackendSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BackendSession")
            .field("url", &self.url)
            .field("repository", &self.repository)
            .field("lifetime_secs", &self.lifetime_secs)
            .field("state", &self.state())
            .finish()
    }
}

impl Drop for BackendSession {
    fn drop(&mut self) {
        self.stop_keepalive();
        let state = *self.state.get_mut();
        if state == SessionState::Closed {
            return;
        }
        if state == SessionState::Active && !self.clock.is_expired() {
            tracing::warn!(session = %self.url, "session_dropped_while_open");
            if let Err(e) = self.transport.close_session(&self.url) {
                tracing::debug!(session = %self.url, error = %e, "session_close_on_drop_failed");
            }
        }
        self.registry.remove(self.key);
    }
}

/// Map a transport failure to the caller-facing error
pub(crate) fn transport_error(endpoint: &str, error: TransportError) -> SessionError {
    match error {
        TransportError::Rejected { message, .. } => SessionError::invalid("request", message),
        TransportError::SessionGone { url } => SessionError::TransportFailure {
            endpoint: endpoint.to_string(),
            message: format!("session {url} is gone"),
        },
        TransportError::Unreachable { message, .. } => SessionError::TransportFailure {
            endpoint: endpoint.to_string(),
            message,
        },
        TransportError::Protocol(message) => SessionError::TransportFailure {
            endpoint: endpoint.to_string(),
            message,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::{MemoryStore, Naming};

    fn factory(store: &Arc<MemoryStore>, lifetime: u64, keepalive: bool) -> SessionFactory {
        let defaults = Arc::new(SessionDefaults::default());
        defaults.set_session_lifetime_secs(lifetime);
        defaults.set_keepalive(keepalive);
        let repo = store.create_repository(None, "backend").unwrap();
        SessionFactory::new(
            Arc::clone(store) as Arc<dyn Transport>,
            repo,
            defaults,
            Arc::new(SessionRegistry::new()),
        )
    }

    #[test]
    fn test_activity_clock_never_moves_backwards() {
        let clock = ActivityClock::new(Duration::from_secs(10));
        let early = Instant::now();
        std::thread::sleep(Duration::from_millis(5));
        clock.touch();
        let later = clock.last_activity();
        clock.touch_at(early);
        assert_eq!(clock.last_activity(), later);
        assert!(!clock.is_expired());
        assert!(clock.remaining() <= Duration::from_secs(10));
    }

    #[test]
    fn test_zero_lifetime_clock_is_expired() {
        let clock = ActivityClock::new(Duration::ZERO);
        assert!(clock.is_expired());
    }

    #[test]
    fn test_open_registers_active_session() {
        let store = Arc::new(MemoryStore::new());
        let factory = factory(&store, 60, false);
        let session = factory.open(None).unwrap();

        assert_eq!(session.state(), SessionState::Active);
        assert_eq!(session.lifetime_secs(), 60);
        assert!(session.auto_commit());
        let info = factory.registry().get(session.key()).unwrap();
        assert_eq!(info.url.as_deref(), Some(session.url()));
        assert!(store.has_session(session.url()));
    }

    #[test]
    fn test_lifetime_is_fixed_at_creation() {
        let store = Arc::new(MemoryStore::new());
        let factory = factory(&store, 60, false);
        let session = factory.open(None).unwrap();
        factory.defaults().set_session_lifetime_secs(5);
        assert_eq!(session.lifetime_secs(), 60);
        assert_eq!(factory.open(None).unwrap().lifetime_secs(), 5);
    }

    #[test]
    fn test_close_twice_is_noop() {
        let store = Arc::new(MemoryStore::new());
        let factory = factory(&store, 60, false);
        let session = factory.open(None).unwrap();
        session.close().unwrap();
        session.close().unwrap();
        assert_eq!(session.state(), SessionState::Closed);
        assert!(!store.has_session(session.url()));
        assert_eq!(factory.registry().session_count(), 0);
    }

    #[test]
    fn test_operations_on_closed_session_fail() {
        let store = Arc::new(MemoryStore::new());
        let session = factory(&store, 60, false).open(None).unwrap();
        session.close().unwrap();
        let err = session.invoke(&Operation::Size).unwrap_err();
        assert!(matches!(err, SessionError::SessionClosed { .. }));
        assert!(matches!(session.ping(), Err(SessionError::SessionClosed { .. })));
    }

    #[test]
    fn test_server_side_expiry_detected() {
        let store = Arc::new(MemoryStore::new());
        let session = factory(&store, 60, false).open(None).unwrap();
        store.expire_session(session.url());

        let err = session.invoke(&Operation::Size).unwrap_err();
        assert!(err.is_session_expired());
        assert_eq!(session.state(), SessionState::Expired);

        let err = session.close().unwrap_err();
        assert!(err.is_session_expired());
        assert_eq!(session.state(), SessionState::Closed);
        assert!(session.close().is_ok());
    }

    #[test]
    fn test_close_after_local_expiry_still_closes_server_session() {
        let store = Arc::new(MemoryStore::new());
        let session = factory(&store, 1, false).open(None).unwrap();
        store.extend_session(session.url(), Duration::from_secs(60));
        std::thread::sleep(Duration::from_millis(1200));
        assert_eq!(session.state(), SessionState::Expired);
        assert!(store.has_session(session.url()));

        let err = session.close().unwrap_err();
        assert!(err.is_session_expired());
        assert!(!store.has_session(session.url()));
        assert_eq!(store.round_trips().closes, 1);
    }

    #[test]
    fn test_keepalive_choice_per_open() {
        let store = Arc::new(MemoryStore::new());
        let factory = factory(&store, 60, true);
        assert!(factory.open(None).unwrap().has_keepalive());
        assert!(!factory.open_with(None, Some(false)).unwrap().has_keepalive());

        factory.defaults().set_keepalive(false);
        assert!(!factory.open(None).unwrap().has_keepalive());
        assert!(factory.open_with(None, Some(true)).unwrap().has_keepalive());
    }

    #[test]
    fn test_open_failure_leaves_no_registry_entry() {
        let store = Arc::new(MemoryStore::new());
        let factory = factory(&store, 60, false);
        store.fail_next_opens(1);
        let err = factory.open(None).unwrap_err();
        assert!(matches!(err, SessionError::TransportFailure { .. }));
        assert_eq!(factory.registry().session_count(), 0);
        assert!(factory.open(None).is_ok());
    }

    #[test]
    fn test_upload_commit_period_attached_to_adds() {
        let store = Arc::new(MemoryStore::new());
        let session = factory(&store, 60, false).open(None).unwrap();
        session.set_upload_commit_period(2);
        let statements = (0..5)
            .map(|i| crate::transport::Statement::new(format!("<s{i}>"), "<p>", "<o>"))
            .collect();
        session.invoke(&Operation::SetAutoCommit(false)).unwrap();
        session
            .invoke(&Operation::Add {
                statements,
                commit_every: 0,
            })
            .unwrap();
        // 4 of 5 were committed in periods of 2; the last is still pending
        assert_eq!(store.committed_len(None, "backend"), 4);
    }

    #[test]
    fn test_drop_without_close_releases_server_session() {
        let store = Arc::new(MemoryStore::new());
        let factory = factory(&store, 60, false);
        let url = {
            let session = factory.open(None).unwrap();
            session.url().to_string()
        };
        assert!(!store.has_session(&url));
        assert_eq!(factory.registry().session_count(), 0);
    }
}
