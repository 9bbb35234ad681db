//! msync Server - serves a directory's Merkle digest for incremental sync
//!
//! Clients ask for the aggregate hash, then for the changes since the
//! version they hold, and fall back to the full digest when the server
//! can no longer diff against their baseline.

use anyhow::{Context, Result};
use bytes::Bytes;
use clap::{Parser, Subcommand};
use http_body_util::Full;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Request, Response};
use hyper_util::rt::TokioIo;
use msync_core::{DigestStore, ScanConfig, Scanner, ServerConfig, SnapshotRegistry};
use msync_http::SyncService;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// msync Server Configuration
#[derive(Parser, Debug)]
#[command(name = "msync-server")]
#[command(author = "msync Contributors")]
#[command(version = "0.1.0")]
#[command(about = "Serve a directory digest for incremental sync", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Start the server
    Start {
        /// Listen address (e.g., 0.0.0.0:8000)
        #[arg(short, long)]
        addr: Option<String>,

        /// Directory to serve. Without one the server starts empty.
        #[arg(short, long)]
        root: Option<PathBuf>,

        /// JSON config file; flags override its values
        #[arg(short, long)]
        config: Option<PathBuf>,

        /// Previous versions kept for incremental changesets
        #[arg(long)]
        history_depth: Option<usize>,

        /// Seconds between automatic rescans of the root
        #[arg(long)]
        rescan_interval: Option<u64>,

        /// Extra directory names to skip while scanning
        #[arg(long = "exclude")]
        exclude: Vec<String>,

        /// Enable debug logging
        #[arg(long)]
        debug: bool,
    },

    /// Scan a directory once and print its aggregate hash
    Scan {
        /// Directory to scan
        path: PathBuf,

        /// Print every entry, not just the summary
        #[arg(short, long)]
        verbose: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Start {
            addr,
            root,
            config,
            history_depth,
            rescan_interval,
            exclude,
            debug,
        } => {
            init_tracing(debug);

            let mut server_config = match &config {
                Some(path) => ServerConfig::load(path)
                    .with_context(|| format!("Failed to load server config {:?}", path))?,
                None => ServerConfig::default(),
            };
            if let Some(addr) = addr {
                server_config.listen_addr = addr;
            }
            if root.is_some() {
                server_config.root = root;
            }
            if let Some(depth) = history_depth {
                server_config.history_depth = depth;
            }
            if rescan_interval.is_some() {
                server_config.rescan_interval_secs = rescan_interval;
            }
            server_config.scan = server_config.scan.exclude_dirs(exclude);

            run_server(server_config).await
        }

        Commands::Scan { path, verbose } => {
            init_tracing(false);
            cmd_scan(path, verbose).await
        }
    }
}

fn init_tracing(debug: bool) {
    let env_filter = if debug {
        tracing_subscriber::EnvFilter::new("debug")
    } else {
        tracing_subscriber::EnvFilter::from_default_env().add_directive(tracing::Level::INFO.into())
    };

    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(env_filter)
        .init();
}

async fn run_server(config: ServerConfig) -> Result<()> {
    info!("Starting msync server on {}", config.listen_addr);

    let initial = match &config.root {
        Some(root) => {
            info!("Serving directory {:?}", root);
            scan_blocking(root.clone(), config.scan.clone())
                .await
                .with_context(|| format!("Initial scan of {:?} failed", root))?
        }
        None => {
            warn!("No root directory configured; serving an empty digest");
            DigestStore::empty()
        }
    };

    let registry = Arc::new(SnapshotRegistry::new(initial, config.history_depth));
    let mut service = SyncService::new(registry);
    if let Some(root) = &config.root {
        service = service.with_scan_root(root.clone(), config.scan.clone());
    }
    let service = Arc::new(service);

    if let (Some(secs), Some(_)) = (config.rescan_interval_secs, &config.root) {
        if secs > 0 {
            spawn_rescan_loop(service.clone(), Duration::from_secs(secs));
        }
    }

    let addr: SocketAddr = config
        .listen_addr
        .parse()
        .with_context(|| format!("Invalid listen address {}", config.listen_addr))?;
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind {}", addr))?;

    info!("Server listening on {}", addr);

    loop {
        let (stream, peer) = listener.accept().await?;
        let service = service.clone();
        let io = TokioIo::new(stream);

        tokio::spawn(async move {
            if let Err(e) = http1::Builder::new()
                .serve_connection(io, service_fn(move |req| handle_request(req, service.clone())))
                .await
            {
                error!("Error serving connection from {}: {:?}", peer, e);
            }
        });
    }
}

/// Handle incoming HTTP request
async fn handle_request(
    req: Request<hyper::body::Incoming>,
    service: Arc<SyncService>,
) -> Result<Response<Full<Bytes>>, hyper::Error> {
    let method = req.method().clone();
    let uri = req.uri().clone();

    let resp = service.handle(req).await;
    info!("{} {} -> {}", method, uri, resp.status().as_u16());
    Ok(resp)
}

/// Rescan the root on a fixed period, publishing whatever changed.
fn spawn_rescan_loop(service: Arc<SyncService>, period: Duration) {
    info!("Rescanning every {}s", period.as_secs());
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(period);
        // first tick fires immediately; the initial scan already covered it
        ticker.tick().await;
        loop {
            ticker.tick().await;
            match service.rescan().await {
                Ok(result) if result.changed => {
                    info!(
                        version = result.version,
                        files = result.file_count,
                        "Periodic rescan published new version"
                    );
                }
                Ok(_) => {}
                Err(e) => warn!("Periodic rescan failed: {}", e),
            }
        }
    });
}

async fn scan_blocking(root: PathBuf, config: ScanConfig) -> Result<DigestStore> {
    let store = tokio::task::spawn_blocking(move || Scanner::with_config(root, config).scan())
        .await
        .context("Scan task panicked")??;
    Ok(store)
}

async fn cmd_scan(path: PathBuf, verbose: bool) -> Result<()> {
    let store = scan_blocking(path.clone(), ScanConfig::default())
        .await
        .with_context(|| format!("Failed to scan {:?}", path))?;

    if verbose {
        for (p, hash) in store.entries() {
            println!("{}  {}", hash, p);
        }
    }
    println!("Files:          {}", store.len());
    println!("Aggregate hash: {}", store.aggregate_hash());
    Ok(())
}
