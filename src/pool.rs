//! Bounded pool of dedicated sessions for one repository.
//!
//! ```text
//! ConnectionPool
//! ├── state: Mutex<PoolState>      idle stack (LIFO), live count, counters
//! ├── available: Condvar           signalled on return / slot release
//! └── evictor thread (optional)    crossbeam tick every eviction interval
//! ```
//!
//! `total` counts every live session the pool is responsible for: idle ones,
//! checked-out ones, and ones being created or validated outside the lock.
//! It never exceeds `max_active`, which bounds checked-out sessions too.
//! Sessions are reset to the default overlay on return, never on borrow.

use crate::config::PoolConfig;
use crate::error::{SessionError, SessionResult};
use crate::overlay::SessionOverlay;
use crate::session::{BackendSession, SessionEvent, SessionFactory};
use crate::transport::Operation;
use crossbeam_channel::{bounded, select, tick, Sender};
use parking_lot::{Condvar, Mutex};
use std::fmt;
use std::ops::Deref;
use std::sync::Arc;
use std::thread;
use std::time::Instant;

/// Pool counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PoolStats {
    /// Checked out, being created, or being validated
    pub active: usize,
    pub idle: usize,
    pub total: usize,
    pub created: u64,
    pub destroyed: u64,
    pub borrowed: u64,
    pub returned: u64,
    pub evicted: u64,
}

struct IdleSession {
    session: Arc<BackendSession>,
    since: Instant,
}

#[derive(Default)]
struct PoolState {
    /// Oldest first; borrow pops the most recently returned
    idle: Vec<IdleSession>,
    total: usize,
    closed: bool,
    created: u64,
    destroyed: u64,
    borrowed: u64,
    returned: u64,
    evicted: u64,
}

struct PoolInner {
    factory: SessionFactory,
    config: PoolConfig,
    state: Mutex<PoolState>,
    available: Condvar,
    evictor: Mutex<Option<Sender<()>>>,
}

/// Connection pool keyed by one repository
pub struct ConnectionPool {
    inner: Arc<PoolInner>,
}

impl ConnectionPool {
    /// Build a pool and warm `initial_size` sessions. A warm-up failure is
    /// returned and no pool is created.
    pub fn new(factory: SessionFactory, config: PoolConfig) -> SessionResult<Self> {
        config.validate().map_err(SessionError::Config)?;
        let inner = Arc::new(PoolInner {
            factory,
            config,
            state: Mutex::new(PoolState::default()),
            available: Condvar::new(),
            evictor: Mutex::new(None),
        });
        let pool = ConnectionPool { inner };

        let initial = pool.inner.config.initial_size;
        if initial > 0 {
            pool.ensure_idle(initial)?;
        }
        pool.start_evictor();

        tracing::info!(
            repository = %pool.inner.factory.repository(),
            max_active = pool.inner.config.max_active,
            initial_size = initial,
            "pool_created"
        );
        Ok(pool)
    }

    pub fn config(&self) -> &PoolConfig {
        &self.inner.config
    }

    pub fn factory(&self) -> &SessionFactory {
        &self.inner.factory
    }

    /// Lifetime new pooled sessions get right now
    pub fn session_lifetime_secs(&self) -> u64 {
        self.inner.lifetime_secs()
    }

    /// Borrow a session, blocking up to `max_wait`
    pub fn borrow(&self) -> SessionResult<PooledSession> {
        let session = self.inner.borrow()?;
        Ok(PooledSession {
            session,
            pool: Arc::clone(&self.inner),
            settled: false,
        })
    }

    /// Create sessions until at least `count` are idle, bounded by
    /// `max_active`. Returns how many were created.
    pub fn ensure_idle(&self, count: usize) -> SessionResult<usize> {
        self.inner.ensure_idle(count)
    }

    /// Run one eviction pass now. Each pass also reaps expired entries from
    /// the session registry.
    pub fn evict(&self) {
        self.inner.evict_once();
    }

    pub fn stats(&self) -> PoolStats {
        let state = self.inner.state.lock();
        PoolStats {
            active: state.total - state.idle.len(),
            idle: state.idle.len(),
            total: state.total,
            created: state.created,
            destroyed: state.destroyed,
            borrowed: state.borrowed,
            returned: state.returned,
            evicted: state.evicted,
        }
    }

    pub fn is_closed(&self) -> bool {
        self.inner.state.lock().closed
    }

    /// Close idle sessions and refuse further borrows. Checked-out sessions
    /// are closed when they come back. Closing twice is a no-op.
    pub fn close(&self) {
        self.inner.close();
    }

    fn start_evictor(&self) {
        let Some(interval) = self.inner.config.eviction_interval() else {
            return;
        };
        let (shutdown_tx, shutdown_rx) = bounded::<()>(0);
        let ticker = tick(interval);
        let inner = Arc::clone(&self.inner);
        let spawned = thread::Builder::new()
            .name(format!("pool-evictor-{}", inner.factory.repository()))
            .spawn(move || loop {
                select! {
                    recv(shutdown_rx) -> _ => break,
                    recv(ticker) -> _ => inner.evict_once(),
                }
            });
        match spawned {
            Ok(_) => *self.inner.evictor.lock() = Some(shutdown_tx),
            Err(e) => tracing::warn!(error = %e, "pool_evictor_spawn_failed"),
        }
    }
}

impl Drop for ConnectionPool {
    fn drop(&mut self) {
        self.inner.close();
    }
}

impl fmt::Debug for ConnectionPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionPool")
            .field("repository", &self.inner.factory.repository().to_string())
            .field("stats", &self.stats())
            .finish()
    }
}

impl PoolInner {
    fn repository(&self) -> String {
        self.factory.repository().to_string()
    }

    fn lifetime_secs(&self) -> u64 {
        self.config
            .session_lifetime_secs
            .unwrap_or_else(|| self.factory.defaults().session_lifetime_secs())
    }

    fn open(&self) -> SessionResult<Arc<BackendSession>> {
        self.factory.open(Some(self.lifetime_secs()))
    }

    fn borrow(&self) -> SessionResult<Arc<BackendSession>> {
        let started = Instant::now();
        let deadline = started + self.config.max_wait();
        let mut state = self.state.lock();
        loop {
            if state.closed {
                return Err(SessionError::PoolClosed {
                    repository: self.repository(),
                });
            }

            if let Some(idle) = state.idle.pop() {
                if !idle.session.is_usable() {
                    state.total -= 1;
                    state.destroyed += 1;
                    drop(state);
                    discard(&idle.session, "expired while idle");
                    state = self.state.lock();
                    continue;
                }
                if self.config.test_on_borrow {
                    drop(state);
                    let valid = validate(&idle.session);
                    state = self.state.lock();
                    if let Err(e) = valid {
                        state.total -= 1;
                        state.destroyed += 1;
                        drop(state);
                        discard(&idle.session, &e.to_string());
                        self.available.notify_one();
                        state = self.state.lock();
                        continue;
                    }
                }
                state.borrowed += 1;
                drop(state);
                self.record_borrow(&idle.session, false);
                return Ok(idle.session);
            }

            if state.total < self.config.max_active {
                state.total += 1;
                drop(state);
                return match self.open() {
                    Ok(session) => {
                        let mut state = self.state.lock();
                        state.created += 1;
                        state.borrowed += 1;
                        drop(state);
                        self.record_borrow(&session, true);
                        Ok(session)
                    }
                    Err(e) => {
                        self.state.lock().total -= 1;
                        self.available.notify_one();
                        Err(e)
                    }
                };
            }

            let exhausted = self.config.max_wait_ms == 0
                || self.available.wait_until(&mut state, deadline).timed_out();
            if exhausted && state.idle.is_empty() && state.total >= self.config.max_active {
                let err = SessionError::PoolExhausted {
                    repository: self.repository(),
                    waited: started.elapsed(),
                    active: state.total - state.idle.len(),
                    max_active: self.config.max_active,
                };
                drop(state);
                tracing::warn!(repository = %self.repository(), error = %err, "pool_exhausted");
                return Err(err);
            }
        }
    }

    fn record_borrow(&self, session: &BackendSession, created: bool) {
        tracing::debug!(
            repository = %self.repository(),
            session = %session.url(),
            created,
            "pool_session_borrowed"
        );
        self.factory.registry().record(SessionEvent::Borrowed {
            url: session.url().to_string(),
            at: Instant::now(),
        });
    }

    /// Take a session back, resetting it for the next borrower
    fn give_back(&self, session: Arc<BackendSession>) {
        let reset = if self.state.lock().closed {
            Err(SessionError::PoolClosed {
                repository: self.repository(),
            })
        } else {
            self.reset(&session)
        };
        if let Err(e) = reset {
            let mut state = self.state.lock();
            state.total -= 1;
            state.destroyed += 1;
            state.returned += 1;
            drop(state);
            self.available.notify_one();
            discard(&session, &e.to_string());
            return;
        }

        self.factory.registry().record(SessionEvent::Returned {
            url: session.url().to_string(),
            at: Instant::now(),
        });
        let mut state = self.state.lock();
        state.returned += 1;
        if state.idle.len() >= self.config.max_idle {
            state.total -= 1;
            state.destroyed += 1;
            drop(state);
            self.available.notify_one();
            discard(&session, "above max_idle");
            return;
        }
        state.idle.push(IdleSession {
            session,
            since: Instant::now(),
        });
        drop(state);
        self.available.notify_one();
    }

    /// Drop a checked-out session without reuse
    fn invalidate(&self, session: Arc<BackendSession>) {
        let mut state = self.state.lock();
        state.total -= 1;
        state.destroyed += 1;
        drop(state);
        self.available.notify_one();
        discard(&session, "invalidated by borrower");
    }

    fn reset(&self, session: &BackendSession) -> SessionResult<()> {
        if !session.is_usable() {
            return Err(SessionError::illegal(format!(
                "session {} is {}",
                session.url(),
                session.state()
            )));
        }
        if !session.auto_commit() {
            session.invoke(&Operation::Rollback)?;
            session.invoke(&Operation::SetAutoCommit(true))?;
        }
        SessionOverlay::reset(session)?;
        if self.config.test_on_return {
            validate(session)?;
        }
        Ok(())
    }

    fn ensure_idle(&self, count: usize) -> SessionResult<usize> {
        let mut created = 0;
        loop {
            {
                let mut state = self.state.lock();
                if state.closed
                    || state.idle.len() >= count
                    || state.total >= self.config.max_active
                {
                    return Ok(created);
                }
                state.total += 1;
            }
            match self.open() {
                Ok(session) => {
                    let mut state = self.state.lock();
                    state.created += 1;
                    state.idle.insert(
                        0,
                        IdleSession {
                            session,
                            since: Instant::now(),
                        },
                    );
                    drop(state);
                    self.available.notify_one();
                    created += 1;
                }
                Err(e) => {
                    self.state.lock().total -= 1;
                    self.available.notify_one();
                    return Err(e);
                }
            }
        }
    }

    fn evict_once(&self) {
        let min_idle_time = self.config.min_evictable_idle_time();
        let (stale, testing) = {
            let mut state = self.state.lock();
            if state.closed {
                return;
            }
            let (stale, fresh): (Vec<_>, Vec<_>) = std::mem::take(&mut state.idle)
                .into_iter()
                .partition(|idle| idle.since.elapsed() >= min_idle_time || !idle.session.is_usable());
            state.idle = fresh;
            state.total -= stale.len();
            state.evicted += stale.len() as u64;
            state.destroyed += stale.len() as u64;

            let testing: Vec<IdleSession> = if self.config.test_while_idle {
                let n = self.config.num_tests_per_eviction_run.min(state.idle.len());
                state.idle.drain(..n).collect()
            } else {
                Vec::new()
            };
            (stale, testing)
        };
        if !stale.is_empty() {
            self.available.notify_all();
        }

        for idle in stale {
            self.record_eviction(&idle.session, "idle too long");
            discard(&idle.session, "evicted");
        }

        for idle in testing {
            match validate(&idle.session) {
                Ok(()) => {
                    let mut state = self.state.lock();
                    if state.closed {
                        state.total -= 1;
                        drop(state);
                        discard(&idle.session, "pool closed");
                        continue;
                    }
                    state.idle.insert(0, idle);
                    drop(state);
                    self.available.notify_one();
                }
                Err(e) => {
                    let mut state = self.state.lock();
                    state.total -= 1;
                    state.evicted += 1;
                    state.destroyed += 1;
                    drop(state);
                    self.available.notify_one();
                    self.record_eviction(&idle.session, &e.to_string());
                    discard(&idle.session, "failed idle validation");
                }
            }
        }

        self.factory.registry().reap_expired();

        if self.config.min_idle > 0 {
            if let Err(e) = self.ensure_idle(self.config.min_idle) {
                tracing::warn!(repository = %self.repository(), error = %e, "pool_min_idle_refill_failed");
            }
        }
    }

    fn record_eviction(&self, session: &BackendSession, reason: &str) {
        tracing::debug!(session = %session.url(), reason, "pool_session_evicted");
        self.factory.registry().record(SessionEvent::Evicted {
            url: session.url().to_string(),
            reason: reason.to_string(),
            at: Instant::now(),
        });
    }

    fn close(&self) {
        let drained = {
            let mut state = self.state.lock();
            if state.closed {
                return;
            }
            state.closed = true;
            let drained = std::mem::take(&mut state.idle);
            state.total -= drained.len();
            state.destroyed += drained.len() as u64;
            drained
        };
        self.evictor.lock().take();
        self.available.notify_all();
        for idle in &drained {
            discard(&idle.session, "pool closed");
        }
        tracing::info!(
            repository = %self.repository(),
            closed_idle = drained.len(),
            "pool_closed"
        );
    }
}

/// Lightweight liveness check: ping then size
fn validate(session: &BackendSession) -> SessionResult<()> {
    session.ping()?;
    session.invoke(&Operation::Size)?;
    Ok(())
}

fn discard(session: &BackendSession, reason: &str) {
    if let Err(e) = session.close() {
        tracing::debug!(session = %session.url(), reason, error = %e, "pool_session_close_failed");
    }
}

/// A session checked out of a pool. Returned on drop.
pub struct PooledSession {
    session: Arc<BackendSession>,
    pool: Arc<PoolInner>,
    settled: bool,
}

impl PooledSession {
    /// Return to the pool (resetting it) now
    pub fn release(mut self) {
        self.settled = true;
        self.pool.give_back(Arc::clone(&self.session));
    }

    /// Remove from the pool and close, e.g. after the session expired
    pub fn invalidate(mut self) {
        self.settled = true;
        self.pool.invalidate(Arc::clone(&self.session));
    }

    pub fn session(&self) -> &Arc<BackendSession> {
        &self.session
    }
}

impl Deref for PooledSession {
    type Target = BackendSession;

    fn deref(&self) -> &BackendSession {
        &self.session
    }
}

impl Drop for PooledSession {
    fn drop(&mut self) {
        if !self.settled {
            self.pool.give_back(Arc::clone(&self.session));
        }
    }
}

impl fmt::Debug for PooledSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PooledSession")
            .field("session", &self.session)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SessionDefaults;
    use crate::session::SessionRegistry;
    use crate::transport::{MemoryStore, Naming, Transport};
    use std::time::Duration;

    fn pool_with(store: &Arc<MemoryStore>, config: PoolConfig) -> SessionResult<ConnectionPool> {
        let defaults = Arc::new(SessionDefaults::default());
        defaults.set_keepalive(false);
        let repo = store.create_repository(None, "pooled").unwrap();
        let factory = SessionFactory::new(
            Arc::clone(store) as Arc<dyn Transport>,
            repo,
            defaults,
            Arc::new(SessionRegistry::new()),
        );
        ConnectionPool::new(factory, config)
    }

    fn config(max_active: usize) -> PoolConfig {
        PoolConfig {
            enabled: true,
            max_active,
            max_wait_ms: 50,
            ..PoolConfig::default()
        }
    }

    #[test]
    fn test_borrow_creates_then_reuses() {
        let store = Arc::new(MemoryStore::new());
        let pool = pool_with(&store, config(2)).unwrap();

        let first_url = {
            let lease = pool.borrow().unwrap();
            lease.url().to_string()
        };
        let lease = pool.borrow().unwrap();
        assert_eq!(lease.url(), first_url);

        let stats = pool.stats();
        assert_eq!(stats.created, 1);
        assert_eq!(stats.borrowed, 2);
        assert_eq!(stats.returned, 1);
        assert_eq!(stats.active, 1);
    }

    #[test]
    fn test_exhausted_after_max_wait() {
        let store = Arc::new(MemoryStore::new());
        let pool = pool_with(&store, config(1)).unwrap();
        let _held = pool.borrow().unwrap();

        let started = Instant::now();
        let err = pool.borrow().unwrap_err();
        assert!(started.elapsed() >= Duration::from_millis(50));
        match err {
            SessionError::PoolExhausted {
                active, max_active, ..
            } => {
                assert_eq!(active, 1);
                assert_eq!(max_active, 1);
            }
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[test]
    fn test_zero_max_wait_fails_fast() {
        let store = Arc::new(MemoryStore::new());
        let pool = pool_with(
            &store,
            PoolConfig {
                max_wait_ms: 0,
                ..config(1)
            },
        )
        .unwrap();
        let _held = pool.borrow().unwrap();
        assert!(matches!(
            pool.borrow(),
            Err(SessionError::PoolExhausted { .. })
        ));
    }

    #[test]
    fn test_creation_failure_rolls_back_slot() {
        let store = Arc::new(MemoryStore::new());
        let pool = pool_with(&store, config(1)).unwrap();
        store.fail_next_opens(1);
        assert!(matches!(
            pool.borrow(),
            Err(SessionError::TransportFailure { .. })
        ));
        assert_eq!(pool.stats().total, 0);
        assert!(pool.borrow().is_ok());
    }

    #[test]
    fn test_warm_up_and_warm_up_failure() {
        let store = Arc::new(MemoryStore::new());
        let pool = pool_with(
            &store,
            PoolConfig {
                initial_size: 2,
                ..config(3)
            },
        )
        .unwrap();
        assert_eq!(pool.stats().idle, 2);
        assert_eq!(store.session_count(), 2);

        store.fail_next_opens(1);
        let err = pool_with(
            &store,
            PoolConfig {
                initial_size: 1,
                ..config(1)
            },
        )
        .unwrap_err();
        assert!(matches!(err, SessionError::TransportFailure { .. }));
    }

    #[test]
    fn test_invalid_config_rejected() {
        let store = Arc::new(MemoryStore::new());
        let err = pool_with(&store, config(0)).unwrap_err();
        assert!(matches!(err, SessionError::Config(_)));
    }

    #[test]
    fn test_expired_idle_session_is_replaced() {
        let store = Arc::new(MemoryStore::new());
        let pool = pool_with(&store, config(1)).unwrap();
        let url = pool.borrow().unwrap().url().to_string();
        store.expire_session(&url);

        // still looks usable locally; test_on_borrow is off so it is handed out
        let lease = pool.borrow().unwrap();
        assert!(lease.invoke(&Operation::Size).unwrap_err().is_session_expired());
        lease.invalidate();

        let fresh = pool.borrow().unwrap();
        assert_ne!(fresh.url(), url);
        assert_eq!(pool.stats().total, 1);
    }

    #[test]
    fn test_test_on_borrow_skips_dead_sessions() {
        let store = Arc::new(MemoryStore::new());
        let pool = pool_with(
            &store,
            PoolConfig {
                test_on_borrow: true,
                ..config(1)
            },
        )
        .unwrap();
        let url = pool.borrow().unwrap().url().to_string();
        store.expire_session(&url);

        let lease = pool.borrow().unwrap();
        assert_ne!(lease.url(), url);
        assert_eq!(pool.stats().destroyed, 1);
    }

    #[test]
    fn test_max_idle_closes_surplus() {
        let store = Arc::new(MemoryStore::new());
        let pool = pool_with(
            &store,
            PoolConfig {
                max_idle: 1,
                ..config(3)
            },
        )
        .unwrap();
        let a = pool.borrow().unwrap();
        let b = pool.borrow().unwrap();
        a.release();
        b.release();
        let stats = pool.stats();
        assert_eq!(stats.idle, 1);
        assert_eq!(stats.total, 1);
        assert_eq!(store.session_count(), 1);
    }

    #[test]
    fn test_close_refuses_borrow_and_closes_returns() {
        let store = Arc::new(MemoryStore::new());
        let pool = pool_with(&store, config(2)).unwrap();
        let lease = pool.borrow().unwrap();
        pool.borrow().unwrap().release();
        pool.close();
        pool.close();

        assert!(matches!(pool.borrow(), Err(SessionError::PoolClosed { .. })));
        assert_eq!(store.session_count(), 1);
        drop(lease);
        assert_eq!(store.session_count(), 0);
        assert_eq!(pool.stats().total, 0);
    }

    #[test]
    fn test_evict_removes_long_idle_sessions() {
        let store = Arc::new(MemoryStore::new());
        let pool = pool_with(
            &store,
            PoolConfig {
                min_evictable_idle_time_ms: 0,
                ..config(2)
            },
        )
        .unwrap();
        let lease = pool.borrow().unwrap();
        pool.borrow().unwrap().release();
        pool.evict();

        let stats = pool.stats();
        assert_eq!(stats.evicted, 1);
        assert_eq!(stats.idle, 0);
        // the checked-out session is never evicted
        assert!(lease.is_usable());
        assert_eq!(stats.active, 1);
    }

    #[test]
    fn test_min_idle_refilled_by_eviction_run() {
        let store = Arc::new(MemoryStore::new());
        let pool = pool_with(
            &store,
            PoolConfig {
                min_idle: 2,
                ..config(4)
            },
        )
        .unwrap();
        assert_eq!(pool.stats().idle, 0);
        pool.evict();
        assert_eq!(pool.stats().idle, 2);
    }
}
