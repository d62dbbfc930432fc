//! Session Registry
//!
//! Process-wide directory of the dedicated sessions opened through one
//! client, plus a bounded event log of their lifecycle. Nothing in the
//! session core reads it to make a decision.
//!
//! ```text
//! SessionRegistry
//! ├── sessions: DashMap<SessionKey, SessionEntry>
//! │   └── repository, url, state, lifetime, opened_at, activity clock
//! └── events: EventLog (bounded, oldest dropped first)
//! ```

use super::backend::{ActivityClock, SessionState};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::RwLock;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

/// Client-side key of a registered session
pub type SessionKey = u64;

/// Point-in-time view of one registered session
#[derive(Debug, Clone)]
pub struct SessionInfo {
    pub key: SessionKey,
    pub repository: String,
    /// Server-assigned URL (None while the open request is in flight)
    pub url: Option<String>,
    pub state: SessionState,
    pub lifetime_secs: u64,
    pub opened_at: DateTime<Utc>,
    pub keepalive_pings: u64,
}

impl SessionInfo {
    /// One-line human-readable description
    pub fn describe(&self) -> String {
        format!(
            "#{} {} {} [{}] lifetime={}s opened={} pings={}",
            self.key,
            self.repository,
            self.url.as_deref().unwrap_or("<pending>"),
            self.state,
            self.lifetime_secs,
            self.opened_at.format("%H:%M:%S"),
            self.keepalive_pings,
        )
    }
}

struct SessionEntry {
    info: SessionInfo,
    clock: Option<Arc<ActivityClock>>,
}

/// Lifecycle event recorded by the registry and the pool
#[derive(Debug, Clone)]
pub enum SessionEvent {
    Opened {
        key: SessionKey,
        repository: String,
        url: String,
        at: Instant,
    },
    OpenFailed {
        repository: String,
        reason: String,
        at: Instant,
    },
    Closed {
        key: SessionKey,
        url: String,
        at: Instant,
    },
    Expired {
        key: SessionKey,
        url: String,
        at: Instant,
    },
    /// Entries removed by `reap_expired`
    Reaped { count: usize, at: Instant },
    Borrowed { url: String, at: Instant },
    Returned { url: String, at: Instant },
    Evicted {
        url: String,
        reason: String,
        at: Instant,
    },
}

/// Bounded in-memory event log.
///
/// `events_since` takes a logical index that stays valid after old events
/// have been dropped; use `logical_len()` to remember where you were.
pub struct EventLog {
    events: RwLock<VecDeque<SessionEvent>>,
    capacity: usize,
    dropped: AtomicU64,
}

impl EventLog {
    /// `capacity == 0` keeps every event
    pub fn new(capacity: usize) -> Self {
        Self {
            events: RwLock::new(VecDeque::with_capacity(capacity.min(4096))),
            capacity,
            dropped: AtomicU64::new(0),
        }
    }

    pub fn record(&self, event: SessionEvent) {
        let mut events = self.events.write();
        if self.capacity > 0 && events.len() >= self.capacity {
            events.pop_front();
            self.dropped.fetch_add(1, Ordering::SeqCst);
        }
        events.push_back(event);
    }

    pub fn events(&self) -> Vec<SessionEvent> {
        self.events.read().iter().cloned().collect()
    }

    pub fn events_since(&self, logical_start: usize) -> Vec<SessionEvent> {
        let events = self.events.read();
        let dropped = self.dropped.load(Ordering::SeqCst) as usize;
        let start = logical_start.saturating_sub(dropped);
        events.iter().skip(start).cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.events.read().len()
    }

    pub fn logical_len(&self) -> usize {
        let events = self.events.read();
        events.len() + self.dropped.load(Ordering::SeqCst) as usize
    }

    pub fn is_empty(&self) -> bool {
        self.events.read().is_empty()
    }

    pub fn clear(&self) {
        let mut events = self.events.write();
        events.clear();
        self.dropped.store(0, Ordering::SeqCst);
    }
}

impl Default for EventLog {
    fn default() -> Self {
        Self::new(10_000)
    }
}

/// Summary statistics about registered sessions
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RegistryStats {
    pub total: usize,
    pub pending: usize,
    pub active: usize,
    pub expired: usize,
}

/// Directory of live sessions
pub struct SessionRegistry {
    sessions: DashMap<SessionKey, SessionEntry>,
    next_key: AtomicU64,
    events: EventLog,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self {
            sessions: DashMap::new(),
            next_key: AtomicU64::new(1),
            events: EventLog::default(),
        }
    }

    /// Record a session whose open request is about to be sent
    pub(crate) fn register_pending(&self, repository: &str, lifetime_secs: u64) -> SessionKey {
        let key = self.next_key.fetch_add(1, Ordering::SeqCst);
        self.sessions.insert(
            key,
            SessionEntry {
                info: SessionInfo {
                    key,
                    repository: repository.to_string(),
                    url: None,
                    state: SessionState::Pending,
                    lifetime_secs,
                    opened_at: Utc::now(),
                    keepalive_pings: 0,
                },
                clock: None,
            },
        );
        key
    }

    /// The server acknowledged the session
    pub(crate) fn activate(&self, key: SessionKey, url: &str, clock: Arc<ActivityClock>) {
        if let Some(mut entry) = self.sessions.get_mut(&key) {
            entry.info.url = Some(url.to_string());
            entry.info.state = SessionState::Active;
            entry.clock = Some(clock);
            self.events.record(SessionEvent::Opened {
                key,
                repository: entry.info.repository.clone(),
                url: url.to_string(),
                at: Instant::now(),
            });
        }
    }

    /// The open request failed; forget the pending entry
    pub(crate) fn open_failed(&self, key: SessionKey, reason: &str) {
        if let Some((_, entry)) = self.sessions.remove(&key) {
            self.events.record(SessionEvent::OpenFailed {
                repository: entry.info.repository,
                reason: reason.to_string(),
                at: Instant::now(),
            });
        }
    }

    pub(crate) fn mark_expired(&self, key: SessionKey) {
        if let Some(mut entry) = self.sessions.get_mut(&key) {
            if entry.info.state == SessionState::Expired {
                return;
            }
            entry.info.state = SessionState::Expired;
            let url = entry.info.url.clone().unwrap_or_default();
            drop(entry);
            self.events.record(SessionEvent::Expired {
                key,
                url,
                at: Instant::now(),
            });
        }
    }

    /// Remove a closed session
    pub(crate) fn remove(&self, key: SessionKey) {
        if let Some((_, entry)) = self.sessions.remove(&key) {
            self.events.record(SessionEvent::Closed {
                key,
                url: entry.info.url.unwrap_or_default(),
                at: Instant::now(),
            });
        }
    }

    pub(crate) fn record_keepalive(&self, key: SessionKey) {
        if let Some(mut entry) = self.sessions.get_mut(&key) {
            entry.info.keepalive_pings += 1;
        }
    }

    pub(crate) fn record(&self, event: SessionEvent) {
        self.events.record(event);
    }

    pub fn has_session(&self, key: SessionKey) -> bool {
        self.sessions.contains_key(&key)
    }

    pub fn get(&self, key: SessionKey) -> Option<SessionInfo> {
        self.sessions.get(&key).map(|entry| entry.info.clone())
    }

    /// Look a session up by its server URL
    pub fn find_by_url(&self, url: &str) -> Option<SessionInfo> {
        self.sessions
            .iter()
            .find(|entry| entry.info.url.as_deref() == Some(url))
            .map(|entry| entry.info.clone())
    }

    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    /// All sessions, sorted by key for deterministic output
    pub fn list_sessions(&self) -> Vec<SessionInfo> {
        let mut infos: Vec<SessionInfo> = self
            .sessions
            .iter()
            .map(|entry| entry.info.clone())
            .collect();
        infos.sort_unstable_by_key(|info| info.key);
        infos
    }

    pub fn sessions_for(&self, repository: &str) -> Vec<SessionInfo> {
        self.list_sessions()
            .into_iter()
            .filter(|info| info.repository == repository)
            .collect()
    }

    pub fn describe(&self) -> Vec<String> {
        self.list_sessions().iter().map(SessionInfo::describe).collect()
    }

    /// Drop entries whose session expired or whose deadline passed without
    /// the owner noticing (orphans). Returns the number removed.
    pub fn reap_expired(&self) -> usize {
        let now = Instant::now();
        let before = self.sessions.len();
        self.sessions.retain(|_, entry| {
            let lapsed = entry
                .clock
                .as_ref()
                .is_some_and(|clock| clock.is_expired_at(now));
            !(entry.info.state == SessionState::Expired || lapsed)
        });
        let reaped = before.saturating_sub(self.sessions.len());
        if reaped > 0 {
            tracing::info!(reaped, "expired_sessions_reaped");
            self.events.record(SessionEvent::Reaped {
                count: reaped,
                at: Instant::now(),
            });
        }
        reaped
    }

    pub fn stats(&self) -> RegistryStats {
        let mut stats = RegistryStats::default();
        for entry in &self.sessions {
            stats.total += 1;
            match entry.info.state {
                SessionState::Pending => stats.pending += 1,
                SessionState::Active => stats.active += 1,
                SessionState::Expired => stats.expired += 1,
                SessionState::Closed => {}
            }
        }
        stats
    }

    pub fn events(&self) -> &EventLog {
        &self.events
    }
}

impl Default for SessionRegistry {
    fn default() -> Self {
        Self::new()
    }
}
