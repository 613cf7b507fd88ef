//! DNSBL reputation CLI.

use anyhow::Result;
use clap::{Parser, Subcommand};
use dnsbl_reputation::{BatchOrchestrator, Config, DnsblClient, ResultStore};
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "dnsbl-reputation")]
#[command(about = "Check IPv4 addresses against a DNS blocklist and cache the answers")]
#[command(version)]
struct Args {
    /// Path to configuration file (defaults are used when it does not exist)
    #[arg(short, long, default_value = "dnsbl-reputation.yaml")]
    config: PathBuf,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short = 'L', long, default_value = "info")]
    log_level: String,

    /// Print example configuration and exit
    #[arg(long)]
    print_config: bool,

    /// Validate configuration and exit
    #[arg(long)]
    validate: bool,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Look up addresses and cache the results
    Lookup {
        /// IPv4 addresses to check
        #[arg(required = true)]
        ips: Vec<String>,
    },
    /// Show the cached result for an address
    Get {
        /// IPv4 address
        ip: String,
    },
    /// Show the number of cached addresses
    Stats,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Handle --print-config
    if args.print_config {
        println!("{}", Config::example());
        return Ok(());
    }

    // Initialize logging
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&args.log_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    // Load configuration
    let config = if args.config.exists() {
        info!(config = %args.config.display(), "Loading configuration");
        Config::load(&args.config)?
    } else {
        info!(config = %args.config.display(), "Configuration file not found, using defaults");
        let config = Config::default();
        config.validate()?;
        config
    };

    // Handle --validate
    if args.validate {
        info!("Configuration is valid");
        return Ok(());
    }

    let Some(command) = args.command else {
        anyhow::bail!("no command given (try --help)");
    };

    // Open the result store
    let store = Arc::new(ResultStore::open(&config.store.path, config.store.max_connections).await?);
    let result = run(command, &config, store.clone()).await;

    if let Err(e) = store.close().await {
        warn!(error = %e, "Error closing result store");
    }

    result
}

async fn run(command: Command, config: &Config, store: Arc<ResultStore>) -> Result<()> {
    match command {
        Command::Lookup { ips } => {
            let client = Arc::new(DnsblClient::new(config.dnsbl.clone())?);
            let batch = BatchOrchestrator::new(client, store, config.batch.clone());

            // Ctrl-C cancels in-flight lookups
            let cancel = CancellationToken::new();
            let on_interrupt = cancel.clone();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    warn!("Interrupted, cancelling lookups");
                    on_interrupt.cancel();
                }
            });

            info!(addresses = ips.len(), zone = %config.dnsbl.zone, "Starting batch lookup");
            let results = batch.lookup_and_cache_all(&ips, &cancel).await;
            println!("{}", serde_json::to_string_pretty(&results)?);
        }
        Command::Get { ip } => match store.get(&ip).await? {
            Some(record) => println!("{}", serde_json::to_string_pretty(&record)?),
            None => println!("{ip}: not cached"),
        },
        Command::Stats => {
            println!("cached addresses: {}", store.count().await?);
        }
    }

    Ok(())
}
