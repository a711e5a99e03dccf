//! kvsession CLI - inspect and maintain a session store
//!
//! Opens the configured store and runs one command against it.

use anyhow::Context;
use clap::{Parser, Subcommand};
use kvsession_core::{init_logging, now_epoch, LoggingConfig, StoreConfig, ValueCodec};
use kvsession_store::{
    CancellationToken, JsonCodec, RecordLookup, RecordStore, SessionManager, SqlRecordStore,
};
use std::path::PathBuf;
use tracing::{debug, info};

const DEFAULT_TTL_SECS: i64 = 3600;

#[derive(Parser)]
#[command(name = "kvsession")]
#[command(about = "Inspect and maintain a persistent session store")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Configuration file path
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Database URL, overrides the configuration file
    #[arg(long, env = "KVSESSION_DATABASE_URL")]
    database_url: Option<String>,

    /// Session table name
    #[arg(long)]
    table: Option<String>,

    /// Verbose output
    #[arg(short, long)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Report whether a session is live
    Check {
        /// Session id
        id: String,
    },

    /// Print the stored values of a session without touching its expiry
    Show {
        /// Session id
        id: String,
    },

    /// Set one value and save the session
    Set {
        /// Session id
        id: String,

        /// Value name
        key: String,

        /// Value as JSON (plain text is stored as a string)
        value: String,

        /// Session TTL in seconds
        #[arg(long, default_value_t = DEFAULT_TTL_SECS)]
        ttl: i64,
    },

    /// Delete a session
    Delete {
        /// Session id
        id: String,
    },

    /// Move a session to a new id
    Rotate {
        /// Current session id
        old: String,

        /// New session id; a random one when omitted
        new: Option<String>,

        /// TTL of the rotated session in seconds
        #[arg(long, default_value_t = DEFAULT_TTL_SECS)]
        ttl: i64,
    },

    /// Delete expired sessions now
    Gc,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let mut logging_config = LoggingConfig::default();
    if cli.verbose {
        logging_config.level = "debug".to_string();
        logging_config.filter_directives = vec![
            "kvsession_core=debug".to_string(),
            "kvsession_store=debug".to_string(),
            "sqlx=warn".to_string(),
        ];
    }
    init_logging(&logging_config)
        .map_err(|e| anyhow::anyhow!("Failed to initialize logging: {}", e))?;

    let config = load_config(&cli)?;
    debug!(table = config.effective_table_name(), "Loaded store configuration");

    match cli.command {
        Commands::Check { id } => handle_check(&config, &id).await,
        Commands::Show { id } => handle_show(&config, &id).await,
        Commands::Set { id, key, value, ttl } => handle_set(&config, &id, key, &value, ttl).await,
        Commands::Delete { id } => handle_delete(&config, &id).await,
        Commands::Rotate { old, new, ttl } => handle_rotate(&config, &old, new, ttl).await,
        Commands::Gc => handle_gc(&config).await,
    }
}

fn load_config(cli: &Cli) -> anyhow::Result<StoreConfig> {
    let mut config = StoreConfig::load(cli.config.as_deref()).context("Failed to load configuration")?;

    if let Some(url) = &cli.database_url {
        config.database_url = url.clone();
    }
    if let Some(table) = &cli.table {
        config.table_name = table.clone();
    }

    // The CLI runs one command and exits; a single connection is enough.
    config.max_open_conns = 1;
    config.max_idle_conns = 0;

    config.validate()?;
    Ok(config)
}

async fn open(config: &StoreConfig) -> anyhow::Result<SessionManager> {
    SessionManager::connect(config.clone())
        .await
        .with_context(|| format!("Failed to open session store at {}", config.database_url))
}

async fn handle_check(config: &StoreConfig, id: &str) -> anyhow::Result<()> {
    let manager = open(config).await?;
    let live = manager.check(id).await?;
    println!("{}", if live { "live" } else { "missing" });
    manager.close().await?;
    Ok(())
}

async fn handle_show(config: &StoreConfig, id: &str) -> anyhow::Result<()> {
    let store = SqlRecordStore::connect(config).await?;

    match store.lookup(id, now_epoch()).await? {
        RecordLookup::Present(record) => {
            let values = JsonCodec.decode(&record.value)?;
            println!("expires in {}s", record.expires_at - now_epoch());
            println!("{}", serde_json::to_string_pretty(&values)?);
        }
        RecordLookup::Expired => println!("expired"),
        RecordLookup::Absent => println!("missing"),
    }

    store.close().await;
    Ok(())
}

async fn handle_set(
    config: &StoreConfig,
    id: &str,
    key: String,
    raw: &str,
    ttl: i64,
) -> anyhow::Result<()> {
    let value: serde_json::Value = serde_json::from_str(raw).unwrap_or_else(|_| serde_json::Value::from(raw));

    let manager = open(config).await?;
    let session = manager.update(CancellationToken::new(), id, ttl).await?;
    session.set(key, value);
    session.save().await?;
    info!(session_id = %id, keys = session.len(), "Session saved");

    drop(session);
    manager.close().await?;
    Ok(())
}

async fn handle_delete(config: &StoreConfig, id: &str) -> anyhow::Result<()> {
    let manager = open(config).await?;
    manager.delete(id).await?;
    println!("deleted {}", id);
    manager.close().await?;
    Ok(())
}

async fn handle_rotate(
    config: &StoreConfig,
    old: &str,
    new: Option<String>,
    ttl: i64,
) -> anyhow::Result<()> {
    let new = new.unwrap_or_else(|| uuid::Uuid::new_v4().to_string());

    let manager = open(config).await?;
    let live = manager.check(old).await?;
    let session = manager
        .refresh(CancellationToken::new(), old, &new, ttl)
        .await?;
    if live {
        println!("{}", session.session_id());
    } else {
        println!("no live session {}, nothing rotated", old);
    }

    drop(session);
    manager.close().await?;
    Ok(())
}

async fn handle_gc(config: &StoreConfig) -> anyhow::Result<()> {
    let manager = open(config).await?;
    let deleted = manager.reap_now().await?;
    println!("removed {} expired sessions", deleted);
    manager.close().await?;
    Ok(())
}
