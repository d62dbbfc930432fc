//! `graphsession` command-line tool
//!
//! Small operator tool for poking a graph store through the session layer.
//!
//! ## Usage
//!
//! ```bash
//! # Statement count of the configured repository
//! graphsession size
//!
//! # Open a dedicated session and ping it
//! graphsession --server http://localhost:10035 --repository people ping
//!
//! # Fetch blank nodes through a session
//! graphsession blank-nodes --count 5
//!
//! # Check out pooled sessions and list what the registry sees
//! graphsession --memory sessions --connections 3
//!
//! # Show the merged configuration (files + GRAPHSESSION_* env)
//! graphsession config
//! ```
//!
//! Tracing goes to a file when `GRAPHSESSION_TRACE=1`; see [`init_tracing`].

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use graphsession::config::LoggingConfig;
use graphsession::{Config, MemoryStore, Repository, StoreClient};

use std::env;
use std::sync::Arc;
use std::sync::OnceLock;

static TRACE_GUARD: OnceLock<tracing_appender::non_blocking::WorkerGuard> = OnceLock::new();

/// Session and pool diagnostics for a remote graph store
#[derive(Parser, Debug)]
#[command(name = "graphsession", version)]
struct Cli {
    /// Configuration file (defaults to graphsession.toml + graphsession.local.toml)
    #[arg(long)]
    config: Option<String>,

    /// Server base URL, overrides `server.url`
    #[arg(long)]
    server: Option<String>,

    /// Run against an in-process store instead of a server
    #[arg(long, conflicts_with = "server")]
    memory: bool,

    /// Catalog name, overrides `server.catalog`
    #[arg(long)]
    catalog: Option<String>,

    /// Repository name, overrides `server.repository`
    #[arg(long)]
    repository: Option<String>,

    /// Lifetime in seconds of sessions opened by this command
    #[arg(long)]
    lifetime: Option<u64>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Print the number of statements in the repository
    Size,
    /// Open a dedicated session, ping it and close it
    Ping,
    /// Allocate blank nodes through a dedicated session
    BlankNodes {
        #[arg(long, default_value_t = 10)]
        count: usize,
    },
    /// Open manual-commit connections through a pool and list the live sessions
    Sessions {
        #[arg(long, default_value_t = 2)]
        connections: usize,
    },
    /// Print the effective configuration as TOML
    Config,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut config = match &cli.config {
        Some(path) => Config::from_file(path)
            .with_context(|| format!("failed to load configuration from {path}"))?,
        None => Config::load().unwrap_or_else(|_| Config::default()),
    };
    init_tracing(&config.logging);

    if let Some(url) = &cli.server {
        config.server.url = url.clone();
    }
    if cli.catalog.is_some() {
        config.server.catalog = cli.catalog.clone();
    }
    if let Some(repository) = &cli.repository {
        config.server.repository = repository.clone();
    }

    if let Command::Config = cli.command {
        config.server.password = "<redacted>".to_string();
        print!("{}", config.to_toml()?);
        return Ok(());
    }

    let client = if cli.memory {
        StoreClient::in_memory(Arc::new(MemoryStore::new()), config)
    } else {
        StoreClient::connect(config).context("failed to build HTTP client")?
    };
    if let Some(lifetime) = cli.lifetime {
        client.defaults().set_session_lifetime_secs(lifetime);
    }

    let repository = client
        .default_repository()
        .context("failed to open repository")?;
    tracing::info!(repository = %repository.reference(), command = ?cli.command, "cli_start");

    match cli.command {
        Command::Size => size(&repository),
        Command::Ping => ping(&repository),
        Command::BlankNodes { count } => blank_nodes(&repository, count),
        Command::Sessions { connections } => sessions(&client, &repository, connections),
        Command::Config => Ok(()),
    }
}

fn size(repository: &Repository) -> Result<()> {
    let conn = repository.get_connection()?;
    println!("{}", conn.size()?);
    conn.close()?;
    Ok(())
}

fn ping(repository: &Repository) -> Result<()> {
    let conn = repository.get_connection()?;
    conn.pin()?;
    conn.ping()?;
    println!(
        "{} ok (lifetime {}s)",
        conn.session_url().unwrap_or_default(),
        conn.bound_session_lifetime_secs().unwrap_or_default()
    );
    conn.close()?;
    Ok(())
}

fn blank_nodes(repository: &Repository, count: usize) -> Result<()> {
    let conn = repository.get_connection()?;
    for _ in 0..count {
        println!("{}", conn.create_blank_node()?);
    }
    conn.close()?;
    Ok(())
}

fn sessions(client: &StoreClient, repository: &Repository, connections: usize) -> Result<()> {
    if repository.pool().is_none() {
        repository.enable_pool(client.config().pool.clone())?;
    }
    let mut held = Vec::with_capacity(connections);
    for _ in 0..connections {
        let conn = repository.get_connection()?;
        conn.set_auto_commit(false)?;
        held.push(conn);
    }
    for line in client.registry().describe() {
        println!("{line}");
    }
    if let Some(pool) = repository.pool() {
        let stats = pool.stats();
        println!(
            "pool: active={} idle={} created={} destroyed={}",
            stats.active, stats.idle, stats.created, stats.destroyed
        );
    }
    for conn in held {
        conn.close()?;
    }
    Ok(())
}

fn init_tracing(logging_config: &LoggingConfig) {
    // Environment variables take precedence over config file values
    let enabled = env::var("GRAPHSESSION_TRACE")
        .ok()
        .is_some_and(|v| v != "0");
    if !enabled {
        return;
    }

    let log_path = env::var("GRAPHSESSION_TRACE_FILE")
        .unwrap_or_else(|_| "graphsession_trace.log".to_string());

    let json = env::var("GRAPHSESSION_TRACE_JSON")
        .ok()
        .map_or_else(|| logging_config.format == "json", |v| v != "0");

    let level = env::var("GRAPHSESSION_TRACE_LEVEL")
        .ok()
        .unwrap_or_else(|| logging_config.level.clone());

    let file = match std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&log_path)
    {
        Ok(f) => f,
        Err(e) => {
            eprintln!("ERROR: Unable to open GRAPHSESSION_TRACE_FILE '{log_path}': {e}");
            return;
        }
    };

    let (non_blocking, guard) = tracing_appender::non_blocking(file);
    let _ = TRACE_GUARD.set(guard);

    let filter = tracing_subscriber::EnvFilter::try_new(level)
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));

    let base = || {
        tracing_subscriber::fmt()
            .with_env_filter(filter.clone())
            .with_ansi(false)
            .with_thread_names(true)
            .with_writer(non_blocking.clone())
    };

    let subscriber: Box<dyn tracing::Subscriber + Send + Sync> = if json {
        Box::new(base().json().finish())
    } else {
        Box::new(base().compact().finish())
    };

    let _ = tracing::subscriber::set_global_default(subscriber);
}
