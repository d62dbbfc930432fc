//! Config loading, TOML parsing, and env var override tests.
//!
//! Some tests are `#[ignore]` (they chdir or set env vars and conflict in
//! parallel). Run them with:
//! `cargo test --test config_tests -- --ignored --test-threads=1`

use graphsession::config::SessionDefaults;
use graphsession::{Config, PoolSessionMode};
use std::env;
use std::fs;
use tempfile::TempDir;

// Default Configuration Tests
#[test]
fn test_config_default_server() {
    let config = Config::default();
    assert_eq!(config.server.url, "http://localhost:10035");
    assert!(config.server.username.is_empty());
    assert_eq!(config.server.http_timeout_ms, 60_000);
}

#[test]
fn test_config_default_session() {
    let config = Config::default();
    assert_eq!(config.session.default_lifetime_secs, 3600);
    assert!(!config.session.override_server_use_main_port);
    assert!(config.session.keepalive);
}

#[test]
fn test_config_default_pool_disabled() {
    let config = Config::default();
    assert!(!config.pool.enabled);
    assert_eq!(config.pool.min_idle, 0);
    assert!(!config.pool.test_on_borrow);
    assert_eq!(config.pool.session_lifetime_secs, None);
}

#[test]
fn test_config_default_logging() {
    let config = Config::default();
    assert_eq!(config.logging.level, "info");
    assert_eq!(config.logging.format, "text");
}

// TOML File Parsing Tests
#[test]
fn test_load_config_from_file() {
    let temp = TempDir::new().unwrap();
    let config_path = temp.path().join("graphsession.toml");

    let config_content = r#"
[server]
url = "http://store.internal:10035"
username = "test"
password = "xyzzy"
catalog = "tests"
repository = "people"

[session]
default_lifetime_secs = 120
use_main_port_for_sessions = true

[pool]
enabled = true
max_active = 4
initial_size = 2
max_wait_ms = 500
test_on_borrow = true
time_between_eviction_runs_ms = 1000
session_lifetime_secs = 300
session_mode = "tx"

[blank_nodes]
per_request = 250

[logging]
level = "debug"
format = "json"
"#;

    fs::write(&config_path, config_content).unwrap();
    let config = Config::from_file(config_path.to_str().unwrap()).unwrap();

    assert_eq!(config.server.url, "http://store.internal:10035");
    assert_eq!(config.server.username, "test");
    assert_eq!(config.server.catalog.as_deref(), Some("tests"));
    assert_eq!(config.server.repository, "people");
    assert_eq!(config.session.default_lifetime_secs, 120);
    assert!(config.session.use_main_port_for_sessions);
    assert!(config.pool.enabled);
    assert_eq!(config.pool.max_active, 4);
    assert_eq!(config.pool.initial_size, 2);
    assert!(config.pool.test_on_borrow);
    assert_eq!(config.pool.session_lifetime_secs, Some(300));
    assert_eq!(config.pool.session_mode, PoolSessionMode::Tx);
    assert_eq!(config.blank_nodes.per_request, 250);
    assert_eq!(config.logging.format, "json");

    // Unset fields keep their defaults
    assert_eq!(config.pool.max_idle, 8);
    assert!(config.session.keepalive);
}

#[test]
fn test_partial_file_uses_defaults() {
    let temp = TempDir::new().unwrap();
    let config_path = temp.path().join("partial.toml");
    fs::write(&config_path, "[pool]\nmax_active = 2\n").unwrap();

    let config = Config::from_file(config_path.to_str().unwrap()).unwrap();
    assert_eq!(config.pool.max_active, 2);
    assert_eq!(config.server.repository, "default");
    assert_eq!(config.session.default_lifetime_secs, 3600);
}

#[test]
fn test_invalid_session_mode_is_rejected() {
    let temp = TempDir::new().unwrap();
    let config_path = temp.path().join("bad.toml");
    fs::write(&config_path, "[pool]\nsession_mode = \"sometimes\"\n").unwrap();

    assert!(Config::from_file(config_path.to_str().unwrap()).is_err());
}

#[test]
fn test_session_defaults_follow_config() {
    let mut config = Config::default();
    config.session.default_lifetime_secs = 90;
    config.session.keepalive = false;
    config.blank_nodes.per_request = 7;

    let defaults = SessionDefaults::from_config(&config);
    assert_eq!(defaults.session_lifetime_secs(), 90);
    assert!(!defaults.keepalive());
    assert_eq!(defaults.blank_nodes_per_request(), 7);

    defaults.set_session_lifetime_secs(10);
    defaults.set_use_main_port_for_sessions(true);
    assert_eq!(defaults.session_lifetime_secs(), 10);
    assert!(defaults.use_main_port_for_sessions());
}

#[test]
#[ignore = "Requires --test-threads=1 due to directory change"]
fn test_load_merges_local_overrides() {
    let temp = TempDir::new().unwrap();
    fs::write(
        temp.path().join("graphsession.toml"),
        "[server]\nrepository = \"base\"\n\n[pool]\nmax_active = 3\n",
    )
    .unwrap();
    fs::write(
        temp.path().join("graphsession.local.toml"),
        "[pool]\nmax_active = 6\n",
    )
    .unwrap();

    let original_dir = env::current_dir().unwrap();
    env::set_current_dir(temp.path()).unwrap();
    let config = Config::load();
    env::set_current_dir(original_dir).unwrap();

    let config = config.unwrap();
    assert_eq!(config.server.repository, "base");
    assert_eq!(config.pool.max_active, 6);
}

#[test]
#[ignore = "Requires --test-threads=1 due to env var mutation"]
fn test_env_overrides_file() {
    let temp = TempDir::new().unwrap();
    let config_path = temp.path().join("graphsession.toml");
    fs::write(&config_path, "[pool]\nmax_active = 3\n").unwrap();

    env::set_var("GRAPHSESSION_POOL__MAX_ACTIVE", "16");
    env::set_var("GRAPHSESSION_SESSION__USE_MAIN_PORT_FOR_SESSIONS", "true");
    let config = Config::from_file(config_path.to_str().unwrap());
    env::remove_var("GRAPHSESSION_POOL__MAX_ACTIVE");
    env::remove_var("GRAPHSESSION_SESSION__USE_MAIN_PORT_FOR_SESSIONS");

    let config = config.unwrap();
    assert_eq!(config.pool.max_active, 16);
    assert!(config.session.use_main_port_for_sessions);
}
