//! Configuration System
//!
//! Provides hierarchical configuration loading from:
//! - graphsession.toml (default configuration)
//! - graphsession.local.toml (git-ignored local overrides)
//! - Environment variables (GRAPHSESSION_* prefix)
//!
//! ## Example
//!
//! ```toml
//! # graphsession.toml
//! [server]
//! url = "http://localhost:10035"
//! username = "test"
//! password = "xyzzy"
//! catalog = "tests"
//! repository = "people"
//!
//! [session]
//! default_lifetime_secs = 600
//!
//! [pool]
//! enabled = true
//! max_active = 4
//! max_wait_ms = 5000
//! ```
//!
//! Environment variable overrides:
//! ```bash
//! GRAPHSESSION_SESSION__USE_MAIN_PORT_FOR_SESSIONS=true
//! GRAPHSESSION_POOL__MAX_ACTIVE=16
//! ```
//!
//! The process-wide defaults that the client mutates at runtime (default
//! session lifetime, main-port toggle, blank-node batch size) live in
//! [`SessionDefaults`], which is built from a `Config` and injected into
//! repositories and pools.

use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

/// Main configuration struct
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub session: SessionSettings,
    #[serde(default)]
    pub pool: PoolConfig,
    #[serde(default)]
    pub blank_nodes: BlankNodeConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Remote store endpoint and credentials
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Base URL of the server's main port
    #[serde(default = "default_server_url")]
    pub url: String,

    #[serde(default)]
    pub username: String,

    #[serde(default)]
    pub password: String,

    /// Catalog name (None = root catalog)
    #[serde(default)]
    pub catalog: Option<String>,

    /// Repository the pool and CLI connect to
    #[serde(default = "default_repository")]
    pub repository: String,

    /// Socket timeout for every HTTP request in milliseconds. 0 = none.
    #[serde(default = "default_http_timeout_ms")]
    pub http_timeout_ms: u64,
}

/// Dedicated session settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionSettings {
    /// Lifetime of new dedicated sessions unless a connection overrides it
    #[serde(default = "default_lifetime_secs")]
    pub default_lifetime_secs: u64,

    /// Talk to dedicated sessions through the main port instead of the
    /// session's own port
    #[serde(default)]
    pub use_main_port_for_sessions: bool,

    /// Rewrite main-port session URLs handed out by the server back to
    /// their dedicated port
    #[serde(default)]
    pub override_server_use_main_port: bool,

    /// Run a background pinger for every dedicated session
    #[serde(default = "default_true")]
    pub keepalive: bool,
}

/// Which kind of backend a pooled repository hands out
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum PoolSessionMode {
    /// Connections start on the shared backend and promote on demand
    #[default]
    Shared,
    /// Connections start bound to a dedicated autocommitting session
    Dedicated,
    /// Connections start bound to a dedicated session in manual-commit mode
    Tx,
}

/// Connection pool configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolConfig {
    /// Attach a pool to repositories opened through the client
    #[serde(default)]
    pub enabled: bool,

    /// Upper bound on live pooled sessions (checked out + idle)
    #[serde(default = "default_max_active")]
    pub max_active: usize,

    /// Sessions opened eagerly when the pool is created
    #[serde(default)]
    pub initial_size: usize,

    /// Idle sessions beyond this are closed on return
    #[serde(default = "default_max_idle")]
    pub max_idle: usize,

    /// The evictor tops the idle list back up to this many sessions
    #[serde(default)]
    pub min_idle: usize,

    /// How long `borrow()` blocks before failing with `PoolExhausted`.
    /// 0 = fail immediately when exhausted.
    #[serde(default = "default_max_wait_ms")]
    pub max_wait_ms: u64,

    /// Validate a session with a round trip before handing it out
    #[serde(default)]
    pub test_on_borrow: bool,

    /// Validate a session with a round trip when it comes back
    #[serde(default)]
    pub test_on_return: bool,

    /// Let the evictor validate idle sessions that are not yet evictable
    #[serde(default)]
    pub test_while_idle: bool,

    /// Evictor interval in milliseconds. 0 = no evictor thread.
    #[serde(default)]
    pub time_between_eviction_runs_ms: u64,

    /// Idle time after which the evictor closes a session
    #[serde(default = "default_min_evictable_idle_time_ms")]
    pub min_evictable_idle_time_ms: u64,

    /// Maximum idle sessions validated per evictor run
    #[serde(default = "default_num_tests_per_eviction_run")]
    pub num_tests_per_eviction_run: usize,

    /// Lifetime of pooled sessions (None = the default in effect at creation)
    #[serde(default)]
    pub session_lifetime_secs: Option<u64>,

    /// What `Repository::get_connection` hands out when pooled
    #[serde(default)]
    pub session_mode: PoolSessionMode,
}

/// Blank node allocation settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BlankNodeConfig {
    /// Identifiers fetched per server round trip
    #[serde(default = "default_blank_nodes_per_request")]
    pub per_request: usize,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Log format (text, json)
    #[serde(default = "default_log_format")]
    pub format: String,
}

// Default value functions
fn default_server_url() -> String {
    "http://localhost:10035".to_string()
}
fn default_repository() -> String {
    "default".to_string()
}
fn default_http_timeout_ms() -> u64 {
    60_000
}
fn default_lifetime_secs() -> u64 {
    3600
}
fn default_true() -> bool {
    true
}
fn default_max_active() -> usize {
    8
}
fn default_max_idle() -> usize {
    8
}
fn default_max_wait_ms() -> u64 {
    30_000
}
fn default_min_evictable_idle_time_ms() -> u64 {
    1_800_000 // 30 minutes
}
fn default_num_tests_per_eviction_run() -> usize {
    3
}
fn default_blank_nodes_per_request() -> usize {
    100
}
fn default_log_level() -> String {
    "info".to_string()
}
fn default_log_format() -> String {
    "text".to_string()
}

impl Config {
    /// Load configuration from default locations
    ///
    /// Merges in order:
    /// 1. graphsession.toml (base configuration)
    /// 2. graphsession.local.toml (local overrides, git-ignored)
    /// 3. Environment variables (GRAPHSESSION_* prefix)
    pub fn load() -> Result<Self, figment::Error> {
        Figment::new()
            .merge(Toml::file("graphsession.toml"))
            .merge(Toml::file("graphsession.local.toml"))
            .merge(Env::prefixed("GRAPHSESSION_").split("__"))
            .extract()
    }

    /// Load configuration from specific file path
    pub fn from_file(path: &str) -> Result<Self, figment::Error> {
        Figment::new()
            .merge(Toml::file(path))
            .merge(Env::prefixed("GRAPHSESSION_").split("__"))
            .extract()
    }

    /// Render as TOML, in the same shape `from_file` reads
    pub fn to_toml(&self) -> Result<String, toml::ser::Error> {
        toml::to_string(self)
    }
}

impl Default for Config {
    fn default() -> Self {
        Config {
            server: ServerConfig::default(),
            session: SessionSettings::default(),
            pool: PoolConfig::default(),
            blank_nodes: BlankNodeConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        ServerConfig {
            url: default_server_url(),
            username: String::new(),
            password: String::new(),
            catalog: None,
            repository: default_repository(),
            http_timeout_ms: default_http_timeout_ms(),
        }
    }
}

impl Default for SessionSettings {
    fn default() -> Self {
        SessionSettings {
            default_lifetime_secs: default_lifetime_secs(),
            use_main_port_for_sessions: false,
            override_server_use_main_port: false,
            keepalive: true,
        }
    }
}

impl Default for PoolConfig {
    fn default() -> Self {
        PoolConfig {
            enabled: false,
            max_active: default_max_active(),
            initial_size: 0,
            max_idle: default_max_idle(),
            min_idle: 0,
            max_wait_ms: default_max_wait_ms(),
            test_on_borrow: false,
            test_on_return: false,
            test_while_idle: false,
            time_between_eviction_runs_ms: 0,
            min_evictable_idle_time_ms: default_min_evictable_idle_time_ms(),
            num_tests_per_eviction_run: default_num_tests_per_eviction_run(),
            session_lifetime_secs: None,
            session_mode: PoolSessionMode::Shared,
        }
    }
}

impl PoolConfig {
    /// Check the invariants the pool relies on
    pub fn validate(&self) -> Result<(), String> {
        if self.max_active == 0 {
            return Err("pool.max_active must be at least 1".to_string());
        }
        if self.initial_size > self.max_active {
            return Err(format!(
                "pool.initial_size ({}) exceeds pool.max_active ({})",
                self.initial_size, self.max_active
            ));
        }
        if self.min_idle > self.max_active {
            return Err(format!(
                "pool.min_idle ({}) exceeds pool.max_active ({})",
                self.min_idle, self.max_active
            ));
        }
        Ok(())
    }

    pub fn max_wait(&self) -> Duration {
        Duration::from_millis(self.max_wait_ms)
    }

    pub fn eviction_interval(&self) -> Option<Duration> {
        (self.time_between_eviction_runs_ms > 0)
            .then(|| Duration::from_millis(self.time_between_eviction_runs_ms))
    }

    pub fn min_evictable_idle_time(&self) -> Duration {
        Duration::from_millis(self.min_evictable_idle_time_ms)
    }
}

impl Default for BlankNodeConfig {
    fn default() -> Self {
        BlankNodeConfig {
            per_request: default_blank_nodes_per_request(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        LoggingConfig {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

/// Runtime-mutable process-wide defaults.
///
/// One instance is shared (via `Arc`) by everything created from the same
/// client. Changing a default affects sessions and allocators created
/// afterwards, never ones that already exist.
#[derive(Debug)]
pub struct SessionDefaults {
    lifetime_secs: AtomicU64,
    use_main_port: AtomicBool,
    override_server_main_port: AtomicBool,
    keepalive: AtomicBool,
    blank_nodes_per_request: AtomicUsize,
}

impl SessionDefaults {
    pub fn from_config(config: &Config) -> Self {
        SessionDefaults {
            lifetime_secs: AtomicU64::new(config.session.default_lifetime_secs),
            use_main_port: AtomicBool::new(config.session.use_main_port_for_sessions),
            override_server_main_port: AtomicBool::new(
                config.session.override_server_use_main_port,
            ),
            keepalive: AtomicBool::new(config.session.keepalive),
            blank_nodes_per_request: AtomicUsize::new(config.blank_nodes.per_request),
        }
    }

    pub fn session_lifetime_secs(&self) -> u64 {
        self.lifetime_secs.load(Ordering::SeqCst)
    }

    pub fn set_session_lifetime_secs(&self, secs: u64) {
        self.lifetime_secs.store(secs, Ordering::SeqCst);
    }

    pub fn use_main_port_for_sessions(&self) -> bool {
        self.use_main_port.load(Ordering::SeqCst)
    }

    pub fn set_use_main_port_for_sessions(&self, on: bool) {
        self.use_main_port.store(on, Ordering::SeqCst);
    }

    pub fn override_server_use_main_port(&self) -> bool {
        self.override_server_main_port.load(Ordering::SeqCst)
    }

    pub fn set_override_server_use_main_port(&self, on: bool) {
        self.override_server_main_port.store(on, Ordering::SeqCst);
    }

    pub fn keepalive(&self) -> bool {
        self.keepalive.load(Ordering::SeqCst)
    }

    pub fn set_keepalive(&self, on: bool) {
        self.keepalive.store(on, Ordering::SeqCst);
    }

    pub fn blank_nodes_per_request(&self) -> usize {
        self.blank_nodes_per_request.load(Ordering::SeqCst)
    }

    pub fn set_blank_nodes_per_request(&self, amount: usize) {
        self.blank_nodes_per_request.store(amount, Ordering::SeqCst);
    }
}

impl Default for SessionDefaults {
    fn default() -> Self {
        Self::from_config(&Config::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.server.url, "http://localhost:10035");
        assert_eq!(config.server.repository, "default");
        assert!(config.server.catalog.is_none());
        assert_eq!(config.session.default_lifetime_secs, 3600);
        assert!(!config.session.use_main_port_for_sessions);
        assert!(config.session.keepalive);
    }

    #[test]
    fn test_default_pool_config() {
        let pool = PoolConfig::default();
        assert!(!pool.enabled);
        assert_eq!(pool.max_active, 8);
        assert_eq!(pool.initial_size, 0);
        assert_eq!(pool.max_wait(), Duration::from_secs(30));
        assert_eq!(pool.eviction_interval(), None);
        assert_eq!(pool.session_mode, PoolSessionMode::Shared);
        assert!(pool.validate().is_ok());
    }

    #[test]
    fn test_pool_config_validation() {
        let mut pool = PoolConfig {
            max_active: 0,
            ..Default::default()
        };
        assert!(pool.validate().is_err());

        pool.max_active = 2;
        pool.initial_size = 3;
        assert!(pool.validate().unwrap_err().contains("initial_size"));

        pool.initial_size = 2;
        pool.min_idle = 5;
        assert!(pool.validate().unwrap_err().contains("min_idle"));
    }

    #[test]
    fn test_default_blank_node_config() {
        assert_eq!(BlankNodeConfig::default().per_request, 100);
    }

    #[test]
    fn test_config_toml_roundtrip() {
        let config = Config::default();
        let toml_str = config.to_toml().unwrap();
        assert!(toml_str.contains("[server]"));
        assert!(toml_str.contains("[pool]"));
        let back: Config = toml::from_str(&toml_str).unwrap();
        assert_eq!(back.session.default_lifetime_secs, 3600);
        assert_eq!(back.pool.max_active, 8);
        assert_eq!(back.logging.level, "info");
    }

    #[test]
    fn test_session_mode_serde() {
        let json = serde_json::to_string(&PoolSessionMode::Tx).unwrap();
        assert_eq!(json, "\"tx\"");
        let mode: PoolSessionMode = serde_json::from_str("\"dedicated\"").unwrap();
        assert_eq!(mode, PoolSessionMode::Dedicated);
    }

    #[test]
    fn test_session_defaults_mutation_is_visible() {
        let defaults = SessionDefaults::default();
        assert_eq!(defaults.session_lifetime_secs(), 3600);
        defaults.set_session_lifetime_secs(30);
        assert_eq!(defaults.session_lifetime_secs(), 30);
        defaults.set_blank_nodes_per_request(7);
        assert_eq!(defaults.blank_nodes_per_request(), 7);
        defaults.set_use_main_port_for_sessions(true);
        assert!(defaults.use_main_port_for_sessions());
    }

    #[test]
    fn test_independent_defaults_do_not_interfere() {
        let a = SessionDefaults::default();
        let b = SessionDefaults::default();
        a.set_session_lifetime_secs(5);
        assert_eq!(b.session_lifetime_secs(), 3600);
    }
}
