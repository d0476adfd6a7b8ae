//! CLI for RelayMQ
//!
//! Starts the HTTP broker. Flags:
//! - `--config`: configuration file (defaults to `config/default`, if present)
//! - `--database`: overrides `storage.path`
//! - `--purge`: deletes the database before opening it

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use relaymq::broker::Broker;
use relaymq::client::HttpPushClient;
use relaymq::config::load_config_from;
use relaymq::persistence::{Repository, Store};
use relaymq::transport::build_router;
use relaymq::utils::logging;
use tokio::net::TcpListener;
use tracing::{error, info, warn};

#[derive(Parser, Debug)]
#[command(name = "relaymq", about = "Single-node publish/subscribe broker")]
struct Cli {
    /// Configuration file to load
    #[arg(long)]
    config: Option<String>,
    /// Path of the sled database directory
    #[arg(long)]
    database: Option<PathBuf>,
    /// Delete the database before starting
    #[arg(long)]
    purge: bool,
}

#[tokio::main]
async fn main() {
    if let Err(e) = run(Cli::parse()).await {
        error!("Server failed: {:#}", e);
        eprintln!("relaymq: {e:#}");
        std::process::exit(1);
    }
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    if let Err(e) = dotenvy::dotenv() {
        if !e.not_found() {
            return Err(e).context("failed to read .env");
        }
    }

    let mut settings =
        load_config_from(cli.config.as_deref()).context("failed to load configuration")?;
    if let Some(path) = cli.database {
        settings.storage.path = path.to_string_lossy().into_owned();
    }
    logging::init(&settings.logging.level);

    if cli.purge {
        match std::fs::remove_dir_all(&settings.storage.path) {
            Ok(()) => warn!(path = %settings.storage.path, "database purged"),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e).context("failed to purge database"),
        }
    }

    let store = Store::open(&settings.storage.path)
        .with_context(|| format!("failed to open database at {}", settings.storage.path))?;
    let repo = Repository::new(store, settings.storage.cache_capacity);
    let push_client = HttpPushClient::new(Duration::from_millis(settings.broker.push_timeout_ms))?;
    let broker = Broker::open(settings.broker.clone(), repo, Arc::new(push_client))?;
    let resumed = broker.resume()?;

    let addr = format!("{}:{}", settings.server.host, settings.server.port);
    let listener = TcpListener::bind(&addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    info!(
        %addr,
        mode = ?settings.broker.delivery_mode,
        resumed,
        "relaymq listening"
    );

    axum::serve(listener, build_router(broker.clone()))
        .with_graceful_shutdown(async {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("Shutdown signal received. Exiting gracefully.");
            }
        })
        .await
        .context("server error")?;

    broker.shutdown()?;
    Ok(())
}
