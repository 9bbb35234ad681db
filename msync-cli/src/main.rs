//! msync: keep a local digest cache converged with an msync server.
//!
//! # Usage
//!
//! ```bash
//! # Is the cached digest still current?
//! msync check --server http://host:8000
//!
//! # Pull whatever changed
//! msync sync --server http://host:8000
//!
//! # Compare local files against the cached digest
//! msync local ./checkout
//!
//! # Show the persisted state without contacting the server
//! msync status
//!
//! # Leave the diverged state (or drop the cache with --forget)
//! msync reset
//! ```

mod remote;

use anyhow::{Context, Result};
use chrono::{TimeZone, Utc};
use clap::{Args, Parser, Subcommand};
use msync_core::{
    Changeset, ClientConfig, ClientSyncState, SyncClient, SyncStatus, SyncStrategy,
};
use remote::HttpTransport;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::info;

#[derive(Parser, Debug)]
#[command(name = "msync")]
#[command(author = "msync Contributors")]
#[command(version = "0.1.0")]
#[command(about = "Merkle-digest file set synchronization client")]
struct Cli {
    #[command(flatten)]
    global: GlobalArgs,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Args, Debug)]
struct GlobalArgs {
    /// JSON config file; flags override its values
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Server base URL
    #[arg(short, long, global = true)]
    server: Option<String>,

    /// Directory holding the persisted sync state
    #[arg(long, global = true)]
    state_dir: Option<PathBuf>,

    /// Request timeout in seconds
    #[arg(long, global = true)]
    timeout: Option<u64>,

    /// Enable debug logging
    #[arg(long, global = true)]
    debug: bool,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Compare the cached aggregate hash with the server's
    Check,

    /// Bring the cached digest up to date with the server
    Sync {
        /// Print every changed path
        #[arg(short, long)]
        verbose: bool,
    },

    /// Scan a local directory and compare it with the cached digest
    Local {
        /// Directory to scan
        path: PathBuf,

        /// Extra directory names to skip
        #[arg(long = "exclude")]
        exclude: Vec<String>,

        /// Print every changed path
        #[arg(short, long)]
        verbose: bool,
    },

    /// Show the persisted sync state
    Status,

    /// Clear the diverged state
    Reset {
        /// Drop the cached digest entirely
        #[arg(long)]
        forget: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let level = if cli.global.debug { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(level)),
        )
        .with_writer(std::io::stderr)
        .init();

    let config = resolve_config(&cli.global)?;

    match cli.command {
        Commands::Check => cmd_check(&config).await,
        Commands::Sync { verbose } => cmd_sync(&config, verbose).await,
        Commands::Local {
            path,
            exclude,
            verbose,
        } => cmd_local(&config, &path, exclude, verbose),
        Commands::Status => cmd_status(&config),
        Commands::Reset { forget } => cmd_reset(&config, forget),
    }
}

/// Config file values, then flag overrides.
fn resolve_config(global: &GlobalArgs) -> Result<ClientConfig> {
    let mut config = match &global.config {
        Some(path) => ClientConfig::load(path)
            .with_context(|| format!("Failed to load client config {:?}", path))?,
        None => ClientConfig::default(),
    };
    if let Some(server) = &global.server {
        config.server_url = server.clone();
    }
    if let Some(dir) = &global.state_dir {
        config.state_dir = dir.clone();
    }
    if let Some(timeout) = global.timeout {
        config.timeout_secs = timeout;
    }
    Ok(config)
}

fn load_state(config: &ClientConfig) -> Result<ClientSyncState> {
    Ok(ClientSyncState::load(&config.state_dir)?.unwrap_or_default())
}

fn connect(config: &ClientConfig) -> Result<SyncClient<HttpTransport>> {
    let transport = HttpTransport::new(
        &config.server_url,
        Duration::from_secs(config.timeout_secs),
    )?;
    Ok(SyncClient::with_state(transport, load_state(config)?))
}

async fn cmd_check(config: &ClientConfig) -> Result<()> {
    let mut client = connect(config)?;
    let report = client.check_staleness().await?;
    client.state().save(&config.state_dir)?;

    println!("Server:         {}", config.server_url);
    println!("Server version: {}", report.server.version);
    println!("Server hash:    {}", report.server.aggregate_hash);
    println!("Server files:   {}", report.server.file_count);
    match report.local_hash {
        Some(hash) => println!("Local hash:     {}", hash),
        None => println!("Local hash:     (none)"),
    }
    println!("Status:         {}", report.status);
    Ok(())
}

async fn cmd_sync(config: &ClientConfig, verbose: bool) -> Result<()> {
    let mut client = connect(config)?;
    let result = client.sync().await;
    // a failed sync may still have refreshed the status
    client.state().save(&config.state_dir)?;
    let outcome = result?;

    match outcome.strategy {
        SyncStrategy::UpToDate => {
            println!("Already up to date at version {}", outcome.version);
            return Ok(());
        }
        SyncStrategy::Incremental => {
            println!("Synced incrementally to version {}", outcome.version);
        }
        SyncStrategy::Full(reason) => {
            println!(
                "Synced to version {} from the full digest ({:?})",
                outcome.version, reason
            );
        }
    }
    print_changes(&outcome.changeset, verbose);
    println!("Aggregate hash: {}", outcome.aggregate_hash);
    Ok(())
}

fn cmd_local(config: &ClientConfig, path: &Path, exclude: Vec<String>, verbose: bool) -> Result<()> {
    let mut client_state = load_state(config)?;
    if client_state.version.is_none() {
        println!("Never synced; every local file counts as new.");
    }

    let scan = config.scan.clone().exclude_dirs(exclude);
    let scanned = msync_core::Scanner::with_config(path, scan)
        .scan()
        .with_context(|| format!("Failed to scan {:?}", path))?;

    // drift detection is local only; the transport is never touched
    let mut client = SyncClient::with_state(Offline, client_state);
    let changes = client.detect_local_drift(&scanned);
    client_state = client.into_state();
    client_state.save(&config.state_dir)?;

    if changes.is_empty() {
        println!("No local changes ({} files)", scanned.len());
    } else {
        print_changes(&changes, verbose);
    }
    println!("Status: {}", client_state.status);
    Ok(())
}

fn cmd_status(config: &ClientConfig) -> Result<()> {
    let state = load_state(config)?;
    println!("State file:     {:?}", ClientSyncState::state_file_path(&config.state_dir));
    println!("Status:         {}", state.status);
    match state.version {
        Some(v) => println!("Version:        {}", v),
        None => println!("Version:        (none)"),
    }
    match state.aggregate_hash {
        Some(h) => println!("Aggregate hash: {}", h),
        None => println!("Aggregate hash: (none)"),
    }
    println!("Files:          {}", state.digest.len());
    if state.last_sync_timestamp > 0 {
        if let Some(ts) = Utc.timestamp_opt(state.last_sync_timestamp, 0).single() {
            println!("Last sync:      {}", ts.format("%Y-%m-%d %H:%M:%S UTC"));
        }
    }
    Ok(())
}

fn cmd_reset(config: &ClientConfig, forget: bool) -> Result<()> {
    if forget {
        ClientSyncState::remove(&config.state_dir)?;
        info!("Removed sync state in {:?}", config.state_dir);
        println!("Cached digest dropped");
        return Ok(());
    }

    let mut client = SyncClient::with_state(Offline, load_state(config)?);
    client.reset();
    let state = client.into_state();
    state.save(&config.state_dir)?;
    println!("Status: {}", state.status);
    Ok(())
}

fn print_changes(changeset: &Changeset, verbose: bool) {
    println!("Changes: {}", changeset.summary());
    if !verbose {
        return;
    }
    for entry in &changeset.added {
        println!("  A {}", entry.path);
    }
    for entry in &changeset.modified {
        println!("  M {}", entry.path);
    }
    for path in &changeset.deleted {
        println!("  D {}", path);
    }
}

/// Transport for commands that only touch local state.
struct Offline;

#[async_trait::async_trait]
impl msync_core::SyncTransport for Offline {
    async fn get_aggregate_hash(&self) -> Result<msync_core::AggregateHashResponse> {
        anyhow::bail!("offline")
    }

    async fn get_changeset(
        &self,
        _request: &msync_core::ChangesetRequest,
    ) -> Result<msync_core::ChangesetResponse> {
        anyhow::bail!("offline")
    }

    async fn get_full_digest(&self) -> Result<msync_core::FullDigestResponse> {
        anyhow::bail!("offline")
    }
}
