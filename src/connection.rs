//! Logical connections.
//!
//! A [`LogicalConnection`] is what callers hold. It starts on the shared,
//! autocommitting backend and is promoted to a dedicated session the moment
//! it needs one:
//!
//! ```text
//!            set_auto_commit(false) / session-scoped overlay / pin
//!   Shared ───────────────────────────────────────────────────────▶ Bound
//!     ▲                                                              │
//!     └──── set_auto_commit(true) or overlay back to defaults ───────┘
//!                  (only when no other reason to stay bound remains)
//! ```
//!
//! A bound session comes from the repository's pool when there is one and
//! the connection's lifetime matches the pool's; otherwise the connection
//! opens (and later closes) its own session.
//!
//! Invariants:
//! - `auto_commit == false` implies a binding
//! - a session-scoped overlay (masquerade, triple cache, bulk mode,
//!   duplicate suppression) implies a binding

use crate::blank_node::{BlankNode, BlankNodeAllocator};
use crate::error::{SessionError, SessionResult};
use crate::overlay::{ApplyMode, DuplicateSuppression, OverlayStep, SessionOverlay};
use crate::pool::{ConnectionPool, PooledSession};
use crate::session::{transport_error, BackendSession, SessionFactory};
use crate::transport::{Endpoint, Operation, Reply, RepositoryRef, Statement};
use parking_lot::{Mutex, MutexGuard};
use std::fmt;
use std::sync::Arc;

enum Binding {
    Shared,
    Pooled(PooledSession),
    Owned(Arc<BackendSession>),
}

impl Binding {
    fn session(&self) -> Option<&BackendSession> {
        match self {
            Binding::Shared => None,
            Binding::Pooled(lease) => Some(&**lease),
            Binding::Owned(session) => Some(&**session),
        }
    }

    fn is_bound(&self) -> bool {
        !matches!(self, Binding::Shared)
    }

    fn is_pooled(&self) -> bool {
        matches!(self, Binding::Pooled(_))
    }
}

struct ConnectionState {
    auto_commit: bool,
    binding: Binding,
    overlay: SessionOverlay,
    /// Per-connection lifetime for sessions bound from now on
    lifetime_secs: Option<u64>,
    /// Per-connection keep-alive choice for sessions bound from now on
    keepalive: Option<bool>,
    /// Keep the binding even when nothing else requires it
    pinned: bool,
    closed: bool,
}

/// A caller-facing connection to one repository
pub struct LogicalConnection {
    factory: SessionFactory,
    pool: Option<Arc<ConnectionPool>>,
    allocator: BlankNodeAllocator,
    state: Mutex<ConnectionState>,
}

impl LogicalConnection {
    pub fn new(factory: SessionFactory, pool: Option<Arc<ConnectionPool>>) -> Self {
        let batch = factory.defaults().blank_nodes_per_request();
        LogicalConnection {
            factory,
            pool,
            allocator: BlankNodeAllocator::new(batch),
            state: Mutex::new(ConnectionState {
                auto_commit: true,
                binding: Binding::Shared,
                overlay: SessionOverlay::default(),
                lifetime_secs: None,
                keepalive: None,
                pinned: false,
                closed: false,
            }),
        }
    }

    pub fn repository(&self) -> &RepositoryRef {
        self.factory.repository()
    }

    pub fn pool(&self) -> Option<&Arc<ConnectionPool>> {
        self.pool.as_ref()
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    pub fn auto_commit(&self) -> bool {
        self.state.lock().auto_commit
    }

    /// Whether a dedicated session is bound
    pub fn is_bound(&self) -> bool {
        self.state.lock().binding.is_bound()
    }

    /// Whether the bound session came from the pool
    pub fn is_pooled(&self) -> bool {
        self.state.lock().binding.is_pooled()
    }

    /// URL of the bound session, if any
    pub fn session_url(&self) -> Option<String> {
        self.state
            .lock()
            .binding
            .session()
            .map(|s| s.url().to_string())
    }

    /// Lifetime of the bound session, fixed when it was opened
    pub fn bound_session_lifetime_secs(&self) -> Option<u64> {
        self.state
            .lock()
            .binding
            .session()
            .map(BackendSession::lifetime_secs)
    }

    /// Client-side overlay values
    pub fn overlay(&self) -> SessionOverlay {
        self.state.lock().overlay.clone()
    }

    // ---- autocommit and transactions ----

    pub fn set_auto_commit(&self, on: bool) -> SessionResult<()> {
        let mut state = self.open_state()?;
        if state.auto_commit == on {
            return Ok(());
        }
        if on {
            self.bound(&state)?.invoke(&Operation::SetAutoCommit(true))?;
            state.auto_commit = true;
            self.release_if_unneeded(&mut state)
        } else {
            let newly_bound = self.bind(&mut state)?;
            let switched = self
                .bound(&state)
                .and_then(|session| session.invoke(&Operation::SetAutoCommit(false)));
            if let Err(e) = switched {
                if newly_bound {
                    self.release_quietly(&mut state);
                }
                return Err(e);
            }
            state.auto_commit = false;
            tracing::debug!(
                repository = %self.repository(),
                session = ?state.binding.session().map(BackendSession::url),
                "connection_manual_commit"
            );
            Ok(())
        }
    }

    /// Commit the current transaction; the connection stays in
    /// manual-commit mode and stays bound
    pub fn commit(&self) -> SessionResult<()> {
        let state = self.open_state()?;
        if state.auto_commit {
            return Err(SessionError::illegal("commit while autocommit is on"));
        }
        self.bound(&state)?.invoke(&Operation::Commit)?;
        Ok(())
    }

    pub fn rollback(&self) -> SessionResult<()> {
        let state = self.open_state()?;
        if state.auto_commit {
            return Err(SessionError::illegal("rollback while autocommit is on"));
        }
        self.bound(&state)?.invoke(&Operation::Rollback)?;
        Ok(())
    }

    /// Reset the bound session's expiry deadline. Without a binding there is
    /// nothing to keep alive.
    pub fn ping(&self) -> SessionResult<()> {
        let state = self.open_state()?;
        match state.binding.session() {
            Some(session) => session.ping(),
            None => Ok(()),
        }
    }

    /// Bind to a dedicated session and keep it until `unpin` or `close`
    pub fn pin(&self) -> SessionResult<()> {
        let mut state = self.open_state()?;
        self.bind(&mut state)?;
        state.pinned = true;
        Ok(())
    }

    pub fn unpin(&self) -> SessionResult<()> {
        let mut state = self.open_state()?;
        state.pinned = false;
        self.release_if_unneeded(&mut state)
    }

    /// Drop a dead binding (e.g. after `SessionExpired`) and start over in
    /// autocommit mode. Uncommitted work on the old session is lost. The
    /// overlay is kept and re-applied if it still needs a session.
    pub fn reset_binding(&self) -> SessionResult<()> {
        let mut state = self.open_state()?;
        match std::mem::replace(&mut state.binding, Binding::Shared) {
            Binding::Shared => {}
            Binding::Pooled(lease) => lease.invalidate(),
            Binding::Owned(session) => {
                if let Err(e) = session.close() {
                    tracing::debug!(session = %session.url(), error = %e, "reset_binding_close_failed");
                }
            }
        }
        state.auto_commit = true;
        if state.pinned || state.overlay.requires_dedicated_session() {
            self.bind(&mut state)?;
        }
        Ok(())
    }

    // ---- session lifetime ----

    /// Lifetime sessions bound from now on will get
    pub fn session_lifetime_secs(&self) -> u64 {
        let state = self.state.lock();
        state.lifetime_secs.unwrap_or_else(|| match &self.pool {
            Some(pool) => pool.session_lifetime_secs(),
            None => self.factory.defaults().session_lifetime_secs(),
        })
    }

    /// Applies to the next binding; a bound session keeps its lifetime
    pub fn set_session_lifetime_secs(&self, secs: u64) {
        self.state.lock().lifetime_secs = Some(secs);
    }

    /// Whether sessions bound from now on get a background pinger
    pub fn keepalive(&self) -> bool {
        self.state
            .lock()
            .keepalive
            .unwrap_or_else(|| self.factory.defaults().keepalive())
    }

    /// Applies to the next binding, like the lifetime. Without a pinger the
    /// session expires unless the caller keeps it busy or calls `ping`.
    pub fn set_keepalive(&self, on: bool) {
        self.state.lock().keepalive = Some(on);
    }

    // ---- overlay ----

    pub fn set_masquerade_as_user(&self, user: Option<&str>) -> SessionResult<()> {
        let user = user.map(str::to_string);
        self.update_overlay(OverlayStep::Masquerade, |overlay| {
            overlay.set_masquerade_user(user)
        })?;
        // ids minted under another identity must not leak
        self.allocator.discard();
        Ok(())
    }

    pub fn masquerade_as_user(&self) -> Option<String> {
        self.state.lock().overlay.masquerade_user().map(str::to_string)
    }

    pub fn set_triple_cache_size(&self, size: u64) -> SessionResult<()> {
        self.update_overlay(OverlayStep::TripleCache, |overlay| {
            overlay.set_triple_cache_size(size);
            Ok(())
        })
    }

    pub fn disable_triple_cache(&self) -> SessionResult<()> {
        self.set_triple_cache_size(0)
    }

    /// Effective triple cache size, asked from the session when bound
    pub fn triple_cache_size(&self) -> SessionResult<u64> {
        let state = self.open_state()?;
        match state.binding.session() {
            Some(session) => Ok(session
                .invoke(&Operation::TripleCacheSize)?
                .into_count()
                .map_err(|e| transport_error(session.url(), e))?),
            None => Ok(state.overlay.triple_cache_size()),
        }
    }

    pub fn set_bulk_mode(&self, on: bool) -> SessionResult<()> {
        self.update_overlay(OverlayStep::BulkMode, |overlay| {
            overlay.set_bulk_mode(on);
            Ok(())
        })
    }

    pub fn bulk_mode(&self) -> SessionResult<bool> {
        let state = self.open_state()?;
        match state.binding.session() {
            Some(session) => Ok(session
                .invoke(&Operation::BulkMode)?
                .into_flag()
                .map_err(|e| transport_error(session.url(), e))?),
            None => Ok(state.overlay.bulk_mode()),
        }
    }

    pub fn set_duplicate_suppression(&self, policy: DuplicateSuppression) -> SessionResult<()> {
        self.update_overlay(OverlayStep::DuplicateSuppression, |overlay| {
            overlay.set_duplicate_suppression(policy);
            Ok(())
        })
    }

    /// Parse `false`, `spo` or `spog`; an invalid token changes nothing
    pub fn set_duplicate_suppression_str(&self, token: &str) -> SessionResult<()> {
        self.update_overlay(OverlayStep::DuplicateSuppression, |overlay| {
            overlay.set_duplicate_suppression_str(token)
        })
    }

    pub fn duplicate_suppression(&self) -> SessionResult<DuplicateSuppression> {
        let state = self.open_state()?;
        match state.binding.session() {
            Some(session) => session
                .invoke(&Operation::DuplicateSuppression)?
                .into_text()
                .map_err(|e| transport_error(session.url(), e))?
                .parse(),
            None => Ok(state.overlay.duplicate_suppression()),
        }
    }

    pub fn set_upload_commit_period(&self, period: u32) -> SessionResult<()> {
        self.update_overlay(OverlayStep::UploadCommitPeriod, |overlay| {
            overlay.set_upload_commit_period(period);
            Ok(())
        })
    }

    pub fn upload_commit_period(&self) -> u32 {
        self.state.lock().overlay.upload_commit_period()
    }

    // ---- blank nodes ----

    pub fn create_blank_node(&self) -> SessionResult<BlankNode> {
        self.allocator.allocate(|amount| {
            let reply = self.execute(Operation::BlankNodes(amount))?;
            reply
                .into_identifiers()
                .map_err(|e| transport_error(&self.repository().url, e))
        })
    }

    pub fn blank_node_batch_size(&self) -> usize {
        self.allocator.batch_size()
    }

    /// Takes effect on the next refill
    pub fn set_blank_node_batch_size(&self, size: usize) {
        self.allocator.set_batch_size(size);
    }

    pub fn blank_node_allocator(&self) -> &BlankNodeAllocator {
        &self.allocator
    }

    // ---- statements ----

    pub fn size(&self) -> SessionResult<u64> {
        self.execute(Operation::Size)?
            .into_count()
            .map_err(|e| transport_error(&self.repository().url, e))
    }

    pub fn is_empty(&self) -> SessionResult<bool> {
        Ok(self.size()? == 0)
    }

    pub fn add(&self, statements: Vec<Statement>) -> SessionResult<()> {
        self.execute(Operation::Add {
            statements,
            commit_every: 0,
        })?;
        Ok(())
    }

    pub fn add_statement(&self, statement: Statement) -> SessionResult<()> {
        self.add(vec![statement])
    }

    pub fn remove(&self, statements: Vec<Statement>) -> SessionResult<()> {
        self.execute(Operation::Remove(statements))?;
        Ok(())
    }

    /// Remove every statement visible to this connection
    pub fn clear(&self) -> SessionResult<()> {
        self.execute(Operation::Clear)?;
        Ok(())
    }

    pub fn contains(&self, statement: &Statement) -> SessionResult<bool> {
        self.execute(Operation::Contains(statement.clone()))?
            .into_flag()
            .map_err(|e| transport_error(&self.repository().url, e))
    }

    /// Delete duplicate statements now, comparing by `spo` or `spog`
    pub fn delete_duplicates(&self, mode: DuplicateSuppression) -> SessionResult<()> {
        if mode == DuplicateSuppression::Off {
            return Err(SessionError::invalid(
                "duplicate comparison",
                "delete duplicates needs spo or spog",
            ));
        }
        self.execute(Operation::DeleteDuplicates(mode))?;
        Ok(())
    }

    /// Run one request on the bound session, or on the shared backend
    pub fn execute(&self, op: Operation) -> SessionResult<Reply> {
        let state = self.open_state()?;
        if let Some(session) = state.binding.session() {
            return session.invoke(&op);
        }
        if op.requires_session() {
            return Err(SessionError::illegal(format!(
                "{} requires a dedicated session",
                op.name()
            )));
        }
        let op = match op {
            Operation::Add {
                statements,
                commit_every: 0,
            } => Operation::Add {
                statements,
                commit_every: state.overlay.upload_commit_period(),
            },
            other => other,
        };
        let repository = self.repository();
        self.factory
            .transport()
            .invoke(Endpoint::Shared(repository), &op)
            .map_err(|e| transport_error(&repository.url, e))
    }

    // ---- close ----

    /// Release the binding and refuse further use.
    ///
    /// A second close is a no-op. If the bound session had expired, the
    /// connection is still closed and `SessionExpired` is returned.
    pub fn close(&self) -> SessionResult<()> {
        let mut state = self.state.lock();
        if state.closed {
            return Ok(());
        }
        state.closed = true;
        let binding = std::mem::replace(&mut state.binding, Binding::Shared);
        drop(state);

        let result = match binding {
            Binding::Shared => Ok(()),
            Binding::Pooled(lease) => {
                if lease.state().is_terminal() {
                    let session = lease.url().to_string();
                    let lifetime_secs = lease.lifetime_secs();
                    lease.invalidate();
                    Err(SessionError::SessionExpired {
                        session,
                        repository: self.repository().to_string(),
                        lifetime_secs,
                    })
                } else {
                    lease.release();
                    Ok(())
                }
            }
            Binding::Owned(session) => session.close(),
        };
        tracing::debug!(repository = %self.repository(), ok = result.is_ok(), "connection_closed");
        result
    }

    // ---- binding internals ----

    fn open_state(&self) -> SessionResult<MutexGuard<'_, ConnectionState>> {
        let state = self.state.lock();
        if state.closed {
            return Err(SessionError::ConnectionClosed {
                repository: self.repository().to_string(),
            });
        }
        debug_assert!(state.auto_commit || state.binding.is_bound());
        Ok(state)
    }

    fn bound<'s>(&self, state: &'s ConnectionState) -> SessionResult<&'s BackendSession> {
        state
            .binding
            .session()
            .ok_or_else(|| SessionError::illegal("connection has no dedicated session"))
    }

    /// Pooled sessions carry the pool's lifetime and the default keep-alive
    fn pool_fits(&self, state: &ConnectionState, pool: &ConnectionPool) -> bool {
        state
            .lifetime_secs
            .is_none_or(|secs| secs == pool.session_lifetime_secs())
            && state
                .keepalive
                .is_none_or(|on| on == self.factory.defaults().keepalive())
    }

    /// Bind a dedicated session and push the overlay to it. Returns whether
    /// a new binding was made.
    fn bind(&self, state: &mut ConnectionState) -> SessionResult<bool> {
        if state.binding.is_bound() {
            return Ok(false);
        }
        let binding = match &self.pool {
            Some(pool) if self.pool_fits(state, pool) => Binding::Pooled(pool.borrow()?),
            _ => Binding::Owned(self.factory.open_with(state.lifetime_secs, state.keepalive)?),
        };
        let applied = match binding.session() {
            Some(session) => state.overlay.apply_to(session, ApplyMode::NonDefault),
            None => Ok(()),
        };
        if let Err(e) = applied {
            discard_binding(binding);
            return Err(e);
        }
        if let Some(session) = binding.session() {
            tracing::debug!(
                repository = %self.repository(),
                session = %session.url(),
                pooled = binding.is_pooled(),
                "connection_bound"
            );
        }
        state.binding = binding;
        Ok(true)
    }

    /// Drop the binding once nothing requires it any more
    fn release_if_unneeded(&self, state: &mut ConnectionState) -> SessionResult<()> {
        if !state.auto_commit || state.pinned || state.overlay.requires_dedicated_session() {
            return Ok(());
        }
        match std::mem::replace(&mut state.binding, Binding::Shared) {
            Binding::Shared => Ok(()),
            Binding::Pooled(lease) => {
                tracing::debug!(session = %lease.url(), "connection_released");
                lease.release();
                Ok(())
            }
            Binding::Owned(session) => {
                tracing::debug!(session = %session.url(), "connection_released");
                session.close()
            }
        }
    }

    fn release_quietly(&self, state: &mut ConnectionState) {
        if let Err(e) = self.release_if_unneeded(state) {
            tracing::debug!(error = %e, "connection_release_failed");
        }
    }

    /// Change one overlay field. Unbound: purely client-side unless the new
    /// value needs a session, in which case bind (pushing the whole
    /// overlay). Bound: push just this field. Either way the stored overlay
    /// only changes once the session accepted it.
    fn update_overlay<F>(&self, step: OverlayStep, change: F) -> SessionResult<()>
    where
        F: FnOnce(&mut SessionOverlay) -> SessionResult<()>,
    {
        let mut state = self.open_state()?;
        let mut next = state.overlay.clone();
        change(&mut next)?;

        let pushed = state
            .binding
            .session()
            .map(|session| next.apply_step(session, step));
        if let Some(pushed) = pushed {
            pushed?;
            state.overlay = next;
            return self.release_if_unneeded(&mut state);
        }

        if next.requires_dedicated_session() {
            let previous = std::mem::replace(&mut state.overlay, next);
            if let Err(e) = self.bind(&mut state) {
                state.overlay = previous;
                return Err(e);
            }
        } else {
            state.overlay = next;
        }
        Ok(())
    }
}

fn discard_binding(binding: Binding) {
    match binding {
        Binding::Shared => {}
        Binding::Pooled(lease) => lease.release(),
        Binding::Owned(session) => {
            if let Err(e) = session.close() {
                tracing::debug!(session = %session.url(), error = %e, "discard_binding_failed");
            }
        }
    }
}

impl fmt::Debug for LogicalConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.lock();
        f.debug_struct("LogicalConnection")
            .field("repository", &self.repository().to_string())
            .field("auto_commit", &state.auto_commit)
            .field("session", &state.binding.session().map(BackendSession::url))
            .field("overlay", &state.overlay)
            .field("closed", &state.closed)
            .finish()
    }
}

impl Drop for LogicalConnection {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            tracing::debug!(repository = %self.repository(), error = %e, "connection_drop_close_failed");
        }
    }
}
