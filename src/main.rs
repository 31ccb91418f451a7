//! Command line interface for operating the group chat relay. Supports
//! initialization, ingesting events through the admission path, serving
//! HTTP/WebSocket endpoints, store maintenance and group inspection.

mod config;
mod error;
mod event;
mod filter;
mod groups;
mod hub;
mod kv;
mod policy;
mod relay;
mod server;
mod storage;
mod ws;

use std::{fs, net::SocketAddr, path::Path, sync::Arc};

use anyhow::Context;
use clap::{Parser, Subcommand};
use config::Settings;
use event::Keys;
use relay::Relay;
use storage::Store;
use tokio::sync::watch;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

/// Command line interface entry point.
#[derive(Parser)]
#[command(
    name = "chatstr",
    author,
    version,
    about = "Nostr relay for moderated group chat",
    short_flag = 'v',
    long_flag = "version"
)]
struct Cli {
    /// Path to the `.env` configuration file.
    #[arg(long, default_value = ".env")]
    env: String,
    /// Subcommand to execute.
    #[command(subcommand)]
    command: Commands,
}

/// Supported CLI subcommands.
#[derive(Subcommand)]
enum Commands {
    /// Create the store at `STORE_ROOT`.
    Init,
    /// Admit one or more event files as if a client had published them.
    Ingest {
        /// Paths to JSON event files to ingest.
        #[arg(required = true)]
        files: Vec<String>,
    },
    /// Rebuild indexes and latest pointers from stored events.
    Reindex,
    /// Launch HTTP and WebSocket services.
    Serve,
    /// Verify a random sample of stored events.
    Verify {
        #[arg(long, default_value_t = 1000)]
        sample: usize,
    },
    /// Compact the event database.
    Compact,
    /// Print the derived state of a group as JSON.
    Group {
        /// Group id (the `h` tag value).
        id: String,
    },
}

/// Execute the selected CLI subcommand.
async fn run(cli: Cli) -> anyhow::Result<()> {
    ensure_env_file(&cli.env)?;
    let cfg = Settings::from_env(&cli.env)?;
    let store = Store::open(&cfg.store_root, cfg.replaceable_kinds.clone())
        .with_context(|| format!("opening store at {}", cfg.store_root.display()))?;
    match cli.command {
        Commands::Init => {
            info!(root = %cfg.store_root.display(), "store ready");
        }
        Commands::Ingest { files } => {
            let relay = relay_for(&cfg, store);
            for f in files {
                let data = fs::read_to_string(&f).with_context(|| format!("reading {f}"))?;
                let ev: event::Event =
                    serde_json::from_str(&data).with_context(|| format!("parsing {f}"))?;
                let id = ev.id.clone();
                let outcome = relay
                    .publish(ev)
                    .await
                    .with_context(|| format!("admitting {f}"))?;
                info!(%id, file = %f, outcome = outcome.message(), "ingested");
            }
        }
        Commands::Reindex => {
            store.reindex()?;
        }
        Commands::Serve => {
            let http_addr: SocketAddr = cfg.bind_http.as_str().parse().context("BIND_HTTP")?;
            let ws_addr: SocketAddr = cfg.bind_ws.as_str().parse().context("BIND_WS")?;
            let relay = Arc::new(relay_for(&cfg, store));
            info!(pubkey = relay.pubkey(), "relay key loaded");
            let (stop_tx, stop_rx) = watch::channel(false);
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    info!("shutting down");
                    let _ = stop_tx.send(true);
                }
            });
            tokio::try_join!(
                server::serve_http(http_addr, relay.clone(), stopped(stop_rx.clone())),
                ws::serve_ws(ws_addr, relay.clone(), stopped(stop_rx))
            )?;
        }
        Commands::Verify { sample } => {
            let checked = store.verify_sample(sample)?;
            info!(checked, "signatures verified");
        }
        Commands::Compact => {
            store.compact()?;
            info!("event database compacted");
        }
        Commands::Group { id } => {
            let relay = relay_for(&cfg, store);
            let state = relay.group(&id).await?;
            if !state.created {
                warn!(group = %id, "group has never been created");
            }
            println!("{}", serde_json::to_string_pretty(&state)?);
        }
    }
    Ok(())
}

fn relay_for(cfg: &Settings, store: Store) -> Relay {
    Relay::new(store, cfg.relay_keys.clone(), cfg.relay.clone())
}

/// Resolves once the shutdown flag flips.
async fn stopped(mut rx: watch::Receiver<bool>) {
    while !*rx.borrow() {
        if rx.changed().await.is_err() {
            // Sender gone without a signal: keep serving.
            std::future::pending::<()>().await;
        }
    }
}

/// Create a default `.env` file if one is not already present at `path`.
fn ensure_env_file(path: &str) -> anyhow::Result<()> {
    let env_path = Path::new(path);
    if env_path.exists() {
        return Ok(());
    }
    let base_dir = match env_path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => {
            fs::create_dir_all(parent)?;
            parent.to_path_buf()
        }
        _ => std::env::current_dir()?,
    };
    let store_root = base_dir.join("chatstr-data");
    let keys = Keys::generate();
    let mut content = String::new();
    content.push_str(&format!("STORE_ROOT={}\n", store_root.to_string_lossy()));
    content.push_str("BIND_HTTP=127.0.0.1:7777\n");
    content.push_str("BIND_WS=127.0.0.1:7778\n");
    content.push_str(&format!("RELAY_PRIVATE_KEY={}\n", keys.secret_hex()));
    content.push_str(&format!("RELAY_PUBLIC_KEY={}\n", keys.public_key()));
    content.push_str("RELAY_NAME=Chatstr Relay\n");
    content.push_str("ALLOWED_KINDS=9-12,9000-9021,39000-39002\n");
    content.push_str("REPLACEABLE_KINDS=39000,39001,39002\n");
    content.push_str("ALLOW_GROUP_CREATION=1\n");
    fs::write(env_path, content)?;
    info!(path = %env_path.display(), "wrote default configuration");
    Ok(())
}

/// `RUST_LOG` picks the level, `LOG_FORMAT=json` switches to JSON lines.
fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let json = std::env::var("LOG_FORMAT").map(|v| v == "json").unwrap_or(false);
    if json {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .json()
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .init();
    }
}

#[cfg(not(test))]
#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();
    let cli = Cli::parse();
    run(cli).await
}
