//! In-process store with server-side sessions.
//!
//! `MemoryStore` implements both [`Transport`] and [`Naming`] and behaves
//! like the remote server as far as the session core can observe:
//!
//! - shared (session-less) requests autocommit immediately
//! - each dedicated session has its own deadline, refreshed by every request
//!   and ping, and its own log of uncommitted operations
//! - reads inside a session see committed data plus the session's own log
//! - masquerading restricts visibility to the graphs granted to that user
//! - duplicate suppression is enforced when statements reach committed state
//!
//! Session URLs use a per-session port (`http://127.0.0.1:<port>/sessions/<id>`)
//! unless the store is built with [`MemoryStore::with_main_port_sessions`],
//! in which case they are routed through the main port.

use super::{
    Endpoint, Naming, OpenSession, Operation, Reply, RepositoryRef, Statement, Transport,
    TransportError,
};
use crate::overlay::DuplicateSuppression;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use uuid::Uuid;

const HOST: &str = "http://127.0.0.1";
const MAIN_PORT: u16 = 10035;
const FIRST_SESSION_PORT: u16 = 50000;

/// Request counters, by kind
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RoundTrip {
    pub opens: u64,
    pub invokes: u64,
    pub pings: u64,
    pub closes: u64,
    pub blank_node_requests: u64,
}

#[derive(Debug, Default)]
struct Counters {
    opens: AtomicU64,
    invokes: AtomicU64,
    pings: AtomicU64,
    closes: AtomicU64,
    blank_node_requests: AtomicU64,
}

#[derive(Debug, Clone)]
enum PendingOp {
    Add(Statement),
    Remove(Statement),
    Clear { user: Option<String> },
    DeleteDuplicates(DuplicateSuppression),
}

#[derive(Debug)]
struct RepoData {
    catalog: Option<String>,
    name: String,
    statements: Vec<Statement>,
}

#[derive(Debug)]
struct ServerSession {
    repo_url: String,
    lifetime: Duration,
    deadline: Instant,
    auto_commit: bool,
    pending: Vec<PendingOp>,
    masquerade: Option<String>,
    triple_cache: u64,
    bulk_mode: bool,
    duplicates: DuplicateSuppression,
}

#[derive(Debug, Default)]
struct StoreState {
    repositories: HashMap<String, RepoData>,
    sessions: HashMap<String, ServerSession>,
    /// user -> graphs the user may see
    users: HashMap<String, HashSet<String>>,
    next_port: u16,
    next_blank: u64,
    failing_opens: usize,
    offline: bool,
}

/// Whole-store view used while executing one request
struct Scope<'a> {
    users: &'a HashMap<String, HashSet<String>>,
    committed: &'a mut Vec<Statement>,
}

/// In-memory server stand-in
#[derive(Debug)]
pub struct MemoryStore {
    state: Mutex<StoreState>,
    main_port_sessions: bool,
    blank_prefix: String,
    counters: Counters,
}

impl MemoryStore {
    pub fn new() -> Self {
        let uuid = Uuid::new_v4().simple().to_string();
        MemoryStore {
            state: Mutex::new(StoreState {
                next_port: FIRST_SESSION_PORT,
                ..StoreState::default()
            }),
            main_port_sessions: false,
            blank_prefix: uuid[..8].to_string(),
            counters: Counters::default(),
        }
    }

    /// A store whose server is configured to route sessions through the
    /// main port
    pub fn with_main_port_sessions() -> Self {
        MemoryStore {
            main_port_sessions: true,
            ..MemoryStore::new()
        }
    }

    pub fn base_url(&self) -> String {
        format!("{HOST}:{MAIN_PORT}")
    }

    /// Register a user that can be masqueraded as
    pub fn add_user(&self, user: &str) {
        self.state.lock().users.entry(user.to_string()).or_default();
    }

    /// Let `user` see statements in `graph`
    pub fn allow_user_graph(&self, user: &str, graph: &str) {
        self.state
            .lock()
            .users
            .entry(user.to_string())
            .or_default()
            .insert(graph.to_string());
    }

    /// Make the next `n` open requests fail as unreachable
    pub fn fail_next_opens(&self, n: usize) {
        self.state.lock().failing_opens = n;
    }

    /// While offline every request fails as unreachable
    pub fn set_offline(&self, offline: bool) {
        self.state.lock().offline = offline;
    }

    pub fn has_session(&self, url: &str) -> bool {
        let now = Instant::now();
        let state = self.state.lock();
        session_id(url)
            .and_then(|id| state.sessions.get(id))
            .is_some_and(|s| s.deadline > now)
    }

    /// Live sessions
    pub fn session_count(&self) -> usize {
        let now = Instant::now();
        self.state
            .lock()
            .sessions
            .values()
            .filter(|s| s.deadline > now)
            .count()
    }

    /// Force a session past its deadline
    pub fn expire_session(&self, url: &str) {
        let mut state = self.state.lock();
        if let Some(session) = session_id(url).and_then(|id| state.sessions.get_mut(id)) {
            session.deadline = Instant::now();
        }
    }

    /// Push a session's deadline out, as a server whose clock lags the
    /// client's would
    pub fn extend_session(&self, url: &str, extra: Duration) {
        let mut state = self.state.lock();
        if let Some(session) = session_id(url).and_then(|id| state.sessions.get_mut(id)) {
            session.deadline += extra;
        }
    }

    pub fn session_masquerade(&self, url: &str) -> Option<String> {
        self.inspect(url, |s| s.masquerade.clone()).flatten()
    }

    pub fn session_triple_cache(&self, url: &str) -> Option<u64> {
        self.inspect(url, |s| s.triple_cache)
    }

    pub fn session_bulk_mode(&self, url: &str) -> Option<bool> {
        self.inspect(url, |s| s.bulk_mode)
    }

    pub fn session_duplicate_suppression(&self, url: &str) -> Option<DuplicateSuppression> {
        self.inspect(url, |s| s.duplicates)
    }

    pub fn session_auto_commit(&self, url: &str) -> Option<bool> {
        self.inspect(url, |s| s.auto_commit)
    }

    pub fn session_lifetime(&self, url: &str) -> Option<Duration> {
        self.inspect(url, |s| s.lifetime)
    }

    /// Committed statements in a repository
    pub fn committed_len(&self, catalog: Option<&str>, repository: &str) -> usize {
        let url = repository_url(catalog, repository);
        self.state
            .lock()
            .repositories
            .get(&url)
            .map_or(0, |repo| repo.statements.len())
    }

    pub fn round_trips(&self) -> RoundTrip {
        RoundTrip {
            opens: self.counters.opens.load(Ordering::SeqCst),
            invokes: self.counters.invokes.load(Ordering::SeqCst),
            pings: self.counters.pings.load(Ordering::SeqCst),
            closes: self.counters.closes.load(Ordering::SeqCst),
            blank_node_requests: self.counters.blank_node_requests.load(Ordering::SeqCst),
        }
    }

    fn inspect<T>(&self, url: &str, f: impl FnOnce(&ServerSession) -> T) -> Option<T> {
        let state = self.state.lock();
        session_id(url).and_then(|id| state.sessions.get(id)).map(f)
    }

    fn session_url(&self, repo_url: &str, port: u16, id: &str) -> String {
        if self.main_port_sessions {
            format!("{repo_url}/session/{port}/sessions/{id}")
        } else {
            format!("{HOST}:{port}/sessions/{id}")
        }
    }

    fn blank_nodes(&self, state: &mut StoreState, amount: usize) -> Reply {
        self.counters
            .blank_node_requests
            .fetch_add(1, Ordering::SeqCst);
        let ids = (0..amount)
            .map(|_| {
                state.next_blank += 1;
                format!("_:b{}x{}", self.blank_prefix, state.next_blank)
            })
            .collect();
        Reply::Identifiers(ids)
    }

    fn invoke_shared(
        &self,
        state: &mut StoreState,
        repo_url: &str,
        op: &Operation,
    ) -> Result<Reply, TransportError> {
        if op.requires_session() {
            return Err(rejected(400, format!("{} requires a session", op.name())));
        }
        if let Operation::BlankNodes(amount) = op {
            return Ok(self.blank_nodes(state, *amount));
        }
        let StoreState {
            repositories,
            users,
            ..
        } = state;
        let repo = repositories
            .get_mut(repo_url)
            .ok_or_else(|| rejected(404, format!("no repository at {repo_url}")))?;
        let mut scope = Scope {
            users,
            committed: &mut repo.statements,
        };
        match op {
            Operation::TripleCacheSize => Ok(Reply::Count(0)),
            Operation::BulkMode => Ok(Reply::Flag(false)),
            Operation::DuplicateSuppression => {
                Ok(Reply::Text(DuplicateSuppression::Off.as_str().to_string()))
            }
            _ => scope.execute(op, None, DuplicateSuppression::Off, None),
        }
    }

    fn invoke_session(
        &self,
        state: &mut StoreState,
        url: &str,
        op: &Operation,
    ) -> Result<Reply, TransportError> {
        let id = live_session(state, url)?;
        if let Operation::BlankNodes(amount) = op {
            touch(state, &id);
            return Ok(self.blank_nodes(state, *amount));
        }
        if let Operation::SetMasquerade(Some(user)) = op {
            if !state.users.contains_key(user) {
                return Err(rejected(400, format!("unknown user '{user}'")));
            }
        }

        let StoreState {
            repositories,
            sessions,
            users,
            ..
        } = state;
        let session = sessions
            .get_mut(&id)
            .ok_or_else(|| TransportError::SessionGone {
                url: url.to_string(),
            })?;
        session.deadline = Instant::now() + session.lifetime;
        let repo = repositories
            .get_mut(&session.repo_url)
            .ok_or_else(|| rejected(404, format!("no repository at {}", session.repo_url)))?;
        let mut scope = Scope {
            users,
            committed: &mut repo.statements,
        };

        match op {
            Operation::Commit => {
                scope.commit(session);
                Ok(Reply::Done)
            }
            Operation::Rollback => {
                session.pending.clear();
                Ok(Reply::Done)
            }
            Operation::SetAutoCommit(on) => {
                if *on {
                    scope.commit(session);
                }
                session.auto_commit = *on;
                Ok(Reply::Done)
            }
            Operation::SetMasquerade(user) => {
                session.masquerade = user.clone();
                Ok(Reply::Done)
            }
            Operation::SetTripleCache(size) => {
                session.triple_cache = *size;
                Ok(Reply::Done)
            }
            Operation::TripleCacheSize => Ok(Reply::Count(session.triple_cache)),
            Operation::SetBulkMode(on) => {
                session.bulk_mode = *on;
                Ok(Reply::Done)
            }
            Operation::BulkMode => Ok(Reply::Flag(session.bulk_mode)),
            Operation::SetDuplicateSuppression(policy) => {
                session.duplicates = *policy;
                Ok(Reply::Done)
            }
            Operation::DuplicateSuppression => {
                Ok(Reply::Text(session.duplicates.as_str().to_string()))
            }
            Operation::Add {
                statements,
                commit_every,
            } if !session.auto_commit => {
                for (i, statement) in statements.iter().enumerate() {
                    session.pending.push(PendingOp::Add(statement.clone()));
                    if *commit_every > 0 && (i + 1) % (*commit_every as usize) == 0 {
                        scope.commit(session);
                    }
                }
                Ok(Reply::Done)
            }
            _ if !session.auto_commit => scope.stage(op, session),
            _ => {
                let user = session.masquerade.clone();
                scope.execute(op, user.as_deref(), session.duplicates, None)
            }
        }
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl Scope<'_> {
    fn visible(&self, user: Option<&str>, statement: &Statement) -> bool {
        visible(self.users, user, statement)
    }

    /// Read or write against committed data, optionally overlaid with a
    /// session's uncommitted log
    fn execute(
        &mut self,
        op: &Operation,
        user: Option<&str>,
        duplicates: DuplicateSuppression,
        pending: Option<&[PendingOp]>,
    ) -> Result<Reply, TransportError> {
        let view = |scope: &Scope<'_>| -> Vec<Statement> {
            let mut view = scope.committed.clone();
            for op in pending.unwrap_or_default() {
                apply(&mut view, op, scope.users, duplicates);
            }
            view.retain(|s| scope.visible(user, s));
            view
        };
        match op {
            Operation::Size => Ok(Reply::Count(view(self).len() as u64)),
            Operation::Contains(statement) => Ok(Reply::Flag(
                view(self).iter().any(|s| s == statement),
            )),
            Operation::Add { statements, .. } => {
                for statement in statements {
                    apply(
                        self.committed,
                        &PendingOp::Add(statement.clone()),
                        self.users,
                        duplicates,
                    );
                }
                Ok(Reply::Done)
            }
            Operation::Remove(statements) => {
                for statement in statements {
                    apply(
                        self.committed,
                        &PendingOp::Remove(statement.clone()),
                        self.users,
                        duplicates,
                    );
                }
                Ok(Reply::Done)
            }
            Operation::Clear => {
                let clear = PendingOp::Clear {
                    user: user.map(str::to_string),
                };
                apply(self.committed, &clear, self.users, duplicates);
                Ok(Reply::Done)
            }
            Operation::DeleteDuplicates(mode) => {
                check_dedup_mode(*mode)?;
                apply(
                    self.committed,
                    &PendingOp::DeleteDuplicates(*mode),
                    self.users,
                    duplicates,
                );
                Ok(Reply::Done)
            }
            Operation::Commit | Operation::Rollback => Ok(Reply::Done),
            other => Err(rejected(400, format!("unsupported here: {}", other.name()))),
        }
    }

    /// Record a write in the session log, or answer a read from the
    /// session's view
    fn stage(&mut self, op: &Operation, session: &mut ServerSession) -> Result<Reply, TransportError> {
        match op {
            Operation::Remove(statements) => {
                session
                    .pending
                    .extend(statements.iter().cloned().map(PendingOp::Remove));
                Ok(Reply::Done)
            }
            Operation::Clear => {
                session.pending.push(PendingOp::Clear {
                    user: session.masquerade.clone(),
                });
                Ok(Reply::Done)
            }
            Operation::DeleteDuplicates(mode) => {
                check_dedup_mode(*mode)?;
                session.pending.push(PendingOp::DeleteDuplicates(*mode));
                Ok(Reply::Done)
            }
            read => {
                let user = session.masquerade.clone();
                self.execute(
                    read,
                    user.as_deref(),
                    session.duplicates,
                    Some(session.pending.as_slice()),
                )
            }
        }
    }

    fn commit(&mut self, session: &mut ServerSession) {
        for op in session.pending.drain(..) {
            apply(self.committed, &op, self.users, session.duplicates);
        }
    }
}

fn apply(
    statements: &mut Vec<Statement>,
    op: &PendingOp,
    users: &HashMap<String, HashSet<String>>,
    duplicates: DuplicateSuppression,
) {
    match op {
        PendingOp::Add(statement) => {
            let duplicate = match duplicates {
                DuplicateSuppression::Off => false,
                DuplicateSuppression::Spo => statements.iter().any(|s| s.same_triple(statement)),
                DuplicateSuppression::Spog => statements.contains(statement),
            };
            if !duplicate {
                statements.push(statement.clone());
            }
        }
        PendingOp::Remove(statement) => statements.retain(|s| s != statement),
        PendingOp::Clear { user } => {
            statements.retain(|s| !visible(users, user.as_deref(), s));
        }
        PendingOp::DeleteDuplicates(mode) => {
            let mut kept: Vec<Statement> = Vec::with_capacity(statements.len());
            for statement in statements.drain(..) {
                let duplicate = match mode {
                    DuplicateSuppression::Spo => kept.iter().any(|s| s.same_triple(&statement)),
                    _ => kept.contains(&statement),
                };
                if !duplicate {
                    kept.push(statement);
                }
            }
            *statements = kept;
        }
    }
}

/// A masqueraded user only sees statements in graphs granted to them
fn visible(
    users: &HashMap<String, HashSet<String>>,
    user: Option<&str>,
    statement: &Statement,
) -> bool {
    match user {
        None => true,
        Some(user) => match (&statement.graph, users.get(user)) {
            (Some(graph), Some(graphs)) => graphs.contains(graph),
            _ => false,
        },
    }
}

fn check_dedup_mode(mode: DuplicateSuppression) -> Result<(), TransportError> {
    if mode == DuplicateSuppression::Off {
        Err(rejected(400, "delete duplicates needs spo or spog"))
    } else {
        Ok(())
    }
}

fn rejected(status: u16, message: impl Into<String>) -> TransportError {
    TransportError::Rejected {
        status,
        message: message.into(),
    }
}

fn repository_url(catalog: Option<&str>, repository: &str) -> String {
    match catalog {
        Some(catalog) => {
            format!("{HOST}:{MAIN_PORT}/catalogs/{catalog}/repositories/{repository}")
        }
        None => format!("{HOST}:{MAIN_PORT}/repositories/{repository}"),
    }
}

/// Session id is the last path segment after `/sessions/`
fn session_id(url: &str) -> Option<&str> {
    let (_, id) = url.rsplit_once("/sessions/")?;
    let id = id.trim_end_matches('/');
    (!id.is_empty() && !id.contains('/')).then_some(id)
}

/// Resolve a session URL to a live session id, dropping it if past deadline
fn live_session(state: &mut StoreState, url: &str) -> Result<String, TransportError> {
    let gone = || TransportError::SessionGone {
        url: url.to_string(),
    };
    let id = session_id(url).ok_or_else(gone)?.to_string();
    let expired = state
        .sessions
        .get(&id)
        .map(|s| s.deadline <= Instant::now())
        .ok_or_else(gone)?;
    if expired {
        state.sessions.remove(&id);
        return Err(gone());
    }
    Ok(id)
}

fn touch(state: &mut StoreState, id: &str) {
    if let Some(session) = state.sessions.get_mut(id) {
        session.deadline = Instant::now() + session.lifetime;
    }
}

fn unreachable(endpoint: &str) -> TransportError {
    TransportError::Unreachable {
        endpoint: endpoint.to_string(),
        message: "connection refused".to_string(),
    }
}

impl Transport for MemoryStore {
    fn open_session(
        &self,
        repository: &RepositoryRef,
        params: &OpenSession,
    ) -> Result<String, TransportError> {
        self.counters.opens.fetch_add(1, Ordering::SeqCst);
        let mut state = self.state.lock();
        if state.offline {
            return Err(unreachable(&repository.url));
        }
        if state.failing_opens > 0 {
            state.failing_opens -= 1;
            return Err(unreachable(&repository.url));
        }
        if !state.repositories.contains_key(&repository.url) {
            return Err(rejected(404, format!("no repository {repository}")));
        }
        let port = state.next_port;
        state.next_port = state.next_port.checked_add(1).unwrap_or(FIRST_SESSION_PORT);
        let id = Uuid::new_v4().simple().to_string();
        let lifetime = Duration::from_secs(params.lifetime_secs);
        state.sessions.insert(
            id.clone(),
            ServerSession {
                repo_url: repository.url.clone(),
                lifetime,
                deadline: Instant::now() + lifetime,
                auto_commit: params.auto_commit,
                pending: Vec::new(),
                masquerade: None,
                triple_cache: 0,
                bulk_mode: false,
                duplicates: DuplicateSuppression::Off,
            },
        );
        Ok(self.session_url(&repository.url, port, &id))
    }

    fn invoke(&self, endpoint: Endpoint<'_>, op: &Operation) -> Result<Reply, TransportError> {
        self.counters.invokes.fetch_add(1, Ordering::SeqCst);
        let mut state = self.state.lock();
        if state.offline {
            return Err(unreachable(&endpoint.to_string()));
        }
        match endpoint {
            Endpoint::Shared(repo) => self.invoke_shared(&mut state, &repo.url, op),
            Endpoint::Session(url) => self.invoke_session(&mut state, url, op),
        }
    }

    fn ping(&self, session_url: &str) -> Result<(), TransportError> {
        self.counters.pings.fetch_add(1, Ordering::SeqCst);
        let mut state = self.state.lock();
        if state.offline {
            return Err(unreachable(session_url));
        }
        let id = live_session(&mut state, session_url)?;
        touch(&mut state, &id);
        Ok(())
    }

    fn close_session(&self, session_url: &str) -> Result<(), TransportError> {
        self.counters.closes.fetch_add(1, Ordering::SeqCst);
        let mut state = self.state.lock();
        if state.offline {
            return Err(unreachable(session_url));
        }
        let id = live_session(&mut state, session_url)?;
        state.sessions.remove(&id);
        Ok(())
    }
}

impl Naming for MemoryStore {
    fn resolve(&self, catalog: Option<&str>, repository: &str) -> RepositoryRef {
        RepositoryRef {
            catalog: catalog.map(str::to_string),
            name: repository.to_string(),
            url: repository_url(catalog, repository),
        }
    }

    fn has_repository(
        &self,
        catalog: Option<&str>,
        repository: &str,
    ) -> Result<bool, TransportError> {
        let url = repository_url(catalog, repository);
        Ok(self.state.lock().repositories.contains_key(&url))
    }

    fn create_repository(
        &self,
        catalog: Option<&str>,
        repository: &str,
    ) -> Result<RepositoryRef, TransportError> {
        let repo = self.resolve(catalog, repository);
        let mut state = self.state.lock();
        if state.offline {
            return Err(unreachable(&repo.url));
        }
        state
            .repositories
            .entry(repo.url.clone())
            .or_insert_with(|| RepoData {
                catalog: repo.catalog.clone(),
                name: repo.name.clone(),
                statements: Vec::new(),
            });
        Ok(repo)
    }

    fn delete_repository(
        &self,
        catalog: Option<&str>,
        repository: &str,
    ) -> Result<(), TransportError> {
        let url = repository_url(catalog, repository);
        let mut state = self.state.lock();
        if state.repositories.remove(&url).is_none() {
            return Err(rejected(404, format!("no repository at {url}")));
        }
        state.sessions.retain(|_, s| s.repo_url != url);
        Ok(())
    }

    fn list_repositories(&self, catalog: Option<&str>) -> Result<Vec<String>, TransportError> {
        let state = self.state.lock();
        let mut names: Vec<String> = state
            .repositories
            .values()
            .filter(|repo| repo.catalog.as_deref() == catalog)
            .map(|repo| repo.name.clone())
            .collect();
        names.sort();
        Ok(names)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store_with_repo() -> (MemoryStore, RepositoryRef) {
        let store = MemoryStore::new();
        let repo = store.create_repository(Some("tests"), "people").unwrap();
        (store, repo)
    }

    fn open(store: &MemoryStore, repo: &RepositoryRef, lifetime_secs: u64) -> String {
        store
            .open_session(
                repo,
                &OpenSession {
                    lifetime_secs,
                    auto_commit: true,
                },
            )
            .unwrap()
    }

    fn add(statement: Statement) -> Operation {
        Operation::Add {
            statements: vec![statement],
            commit_every: 0,
        }
    }

    fn size(store: &MemoryStore, endpoint: Endpoint<'_>) -> u64 {
        store
            .invoke(endpoint, &Operation::Size)
            .unwrap()
            .into_count()
            .unwrap()
    }

    #[test]
    fn test_session_urls() {
        let (store, repo) = store_with_repo();
        let url = open(&store, &repo, 60);
        assert!(url.starts_with("http://127.0.0.1:50000/sessions/"));
        assert_eq!(session_id(&url).map(str::len), Some(32));

        let main = MemoryStore::with_main_port_sessions();
        let repo = main.create_repository(None, "r").unwrap();
        let url = open(&main, &repo, 60);
        assert!(url.starts_with("http://127.0.0.1:10035/repositories/r/session/50000/sessions/"));
    }

    #[test]
    fn test_uncommitted_writes_are_session_local() {
        let (store, repo) = store_with_repo();
        let url = open(&store, &repo, 60);
        let session = Endpoint::Session(&url);
        store.invoke(session, &Operation::SetAutoCommit(false)).unwrap();
        store
            .invoke(session, &add(Statement::new("<a>", "<p>", "<b>")))
            .unwrap();

        assert_eq!(size(&store, session), 1);
        assert_eq!(size(&store, Endpoint::Shared(&repo)), 0);

        store.invoke(session, &Operation::Commit).unwrap();
        assert_eq!(size(&store, Endpoint::Shared(&repo)), 1);
    }

    #[test]
    fn test_rollback_discards_pending() {
        let (store, repo) = store_with_repo();
        let url = open(&store, &repo, 60);
        let session = Endpoint::Session(&url);
        store.invoke(session, &Operation::SetAutoCommit(false)).unwrap();
        store
            .invoke(session, &add(Statement::new("<a>", "<p>", "<b>")))
            .unwrap();
        store.invoke(session, &Operation::Rollback).unwrap();
        assert_eq!(size(&store, session), 0);
    }

    #[test]
    fn test_deadline_and_ping() {
        let (store, repo) = store_with_repo();
        let url = open(&store, &repo, 60);
        store.ping(&url).unwrap();
        store.expire_session(&url);
        assert!(matches!(
            store.ping(&url),
            Err(TransportError::SessionGone { .. })
        ));
        assert!(!store.has_session(&url));
        assert!(matches!(
            store.close_session(&url),
            Err(TransportError::SessionGone { .. })
        ));
    }

    #[test]
    fn test_masquerade_restricts_visibility() {
        let (store, repo) = store_with_repo();
        store.allow_user_graph("alice", "<g:alice>");
        store
            .invoke(
                Endpoint::Shared(&repo),
                &Operation::Add {
                    statements: vec![
                        Statement::new("<a>", "<p>", "<b>").in_graph("<g:alice>"),
                        Statement::new("<c>", "<p>", "<d>").in_graph("<g:bob>"),
                        Statement::new("<e>", "<p>", "<f>"),
                    ],
                    commit_every: 0,
                },
            )
            .unwrap();

        let url = open(&store, &repo, 60);
        let session = Endpoint::Session(&url);
        store
            .invoke(session, &Operation::SetMasquerade(Some("alice".to_string())))
            .unwrap();
        assert_eq!(size(&store, session), 1);

        store.invoke(session, &Operation::SetMasquerade(None)).unwrap();
        assert_eq!(size(&store, session), 3);
    }

    #[test]
    fn test_unknown_masquerade_user_rejected() {
        let (store, repo) = store_with_repo();
        let url = open(&store, &repo, 60);
        let err = store
            .invoke(
                Endpoint::Session(&url),
                &Operation::SetMasquerade(Some("mallory".to_string())),
            )
            .unwrap_err();
        assert!(matches!(err, TransportError::Rejected { status: 400, .. }));
        assert_eq!(store.session_masquerade(&url), None);
    }

    #[test]
    fn test_duplicate_suppression_at_commit() {
        let (store, repo) = store_with_repo();
        let url = open(&store, &repo, 60);
        let session = Endpoint::Session(&url);
        store
            .invoke(
                session,
                &Operation::SetDuplicateSuppression(DuplicateSuppression::Spo),
            )
            .unwrap();
        let statement = Statement::new("<a>", "<p>", "<b>");
        store.invoke(session, &add(statement.clone())).unwrap();
        store
            .invoke(session, &add(statement.in_graph("<g>")))
            .unwrap();
        assert_eq!(store.committed_len(Some("tests"), "people"), 1);
    }

    #[test]
    fn test_delete_duplicates() {
        let (store, repo) = store_with_repo();
        let statement = Statement::new("<a>", "<p>", "<b>");
        for _ in 0..3 {
            store
                .invoke(Endpoint::Shared(&repo), &add(statement.clone()))
                .unwrap();
        }
        assert_eq!(size(&store, Endpoint::Shared(&repo)), 3);
        store
            .invoke(
                Endpoint::Shared(&repo),
                &Operation::DeleteDuplicates(DuplicateSuppression::Spog),
            )
            .unwrap();
        assert_eq!(size(&store, Endpoint::Shared(&repo)), 1);
    }

    #[test]
    fn test_shared_endpoint_refuses_session_operations() {
        let (store, repo) = store_with_repo();
        let err = store
            .invoke(Endpoint::Shared(&repo), &Operation::Commit)
            .unwrap_err();
        assert!(matches!(err, TransportError::Rejected { status: 400, .. }));
    }

    #[test]
    fn test_blank_node_ids() {
        let (store, repo) = store_with_repo();
        let ids = store
            .invoke(Endpoint::Shared(&repo), &Operation::BlankNodes(3))
            .unwrap()
            .into_identifiers()
            .unwrap();
        assert_eq!(ids.len(), 3);
        let unique: HashSet<_> = ids.iter().collect();
        assert_eq!(unique.len(), 3);
        assert!(ids.iter().all(|id| id.starts_with("_:b")));
        assert_eq!(store.round_trips().blank_node_requests, 1);
    }

    #[test]
    fn test_offline_and_failing_opens() {
        let (store, repo) = store_with_repo();
        store.fail_next_opens(1);
        assert!(matches!(
            store.open_session(
                &repo,
                &OpenSession {
                    lifetime_secs: 1,
                    auto_commit: true
                }
            ),
            Err(TransportError::Unreachable { .. })
        ));
        open(&store, &repo, 60);

        store.set_offline(true);
        assert!(store.invoke(Endpoint::Shared(&repo), &Operation::Size).is_err());
        store.set_offline(false);
        assert_eq!(size(&store, Endpoint::Shared(&repo)), 0);
    }

    #[test]
    fn test_naming() {
        let store = MemoryStore::new();
        store.create_repository(Some("c"), "b").unwrap();
        store.create_repository(Some("c"), "a").unwrap();
        store.create_repository(None, "root").unwrap();
        assert_eq!(store.list_repositories(Some("c")).unwrap(), vec!["a", "b"]);
        assert!(store.has_repository(None, "root").unwrap());
        store.delete_repository(Some("c"), "a").unwrap();
        assert!(!store.has_repository(Some("c"), "a").unwrap());
        assert!(store.delete_repository(Some("c"), "a").is_err());
    }
}
