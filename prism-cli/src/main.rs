use anyhow::Result;
use clap::{Parser, Subcommand};
use prism_transport::{MultiSearchConfig, TracingObserver, Transport, TransportConfig};
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

mod commands;

#[derive(Parser, Debug)]
#[command(name = "prism-client")]
#[command(about = "Prism client - cluster-aware transport diagnostics")]
#[command(version)]
struct Cli {
    /// Transport config file (TOML or YAML)
    #[arg(short, long, global = true, env = "PRISM_CLIENT_CONFIG")]
    config: Option<PathBuf>,

    /// Seed node URL (repeatable, overrides the config file)
    #[arg(short, long = "node", global = true)]
    nodes: Vec<String>,

    /// Client name reported in logs
    #[arg(long, global = true)]
    name: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Check that the cluster answers
    Ping,

    /// Send one request through the transport
    Request {
        /// HTTP method
        method: String,

        /// Request path, e.g. /_cluster/health
        path: String,

        /// JSON request body
        #[arg(short, long)]
        body: Option<String>,

        /// Query parameter as key=value (repeatable)
        #[arg(short, long = "query")]
        query: Vec<String>,
    },

    /// Discover cluster nodes and print them
    Sniff,

    /// Run searches from an NDJSON file through the multi-search batcher
    Msearch {
        /// File with alternating header and body lines
        #[arg(short, long)]
        file: PathBuf,

        /// Searches per _msearch request
        #[arg(long, default_value = "5")]
        operations: usize,

        /// Maximum concurrent _msearch requests
        #[arg(long, default_value = "5")]
        concurrency: usize,

        /// Flush a partial batch after this many milliseconds
        #[arg(long, default_value = "500")]
        flush_interval_ms: u64,
    },
}

fn load_config(cli: &Cli) -> Result<TransportConfig> {
    let mut config = match &cli.config {
        Some(path) => {
            tracing::info!("Loading config from {}", path.display());
            TransportConfig::read_file(path)?
        }
        None => TransportConfig::default(),
    };

    if !cli.nodes.is_empty() {
        config.nodes = cli.nodes.clone();
    }
    if config.nodes.is_empty() {
        config.nodes.push("http://localhost:9200".to_string());
    }
    if let Some(name) = &cli.name {
        config.name = name.clone();
    }
    Ok(config)
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "info".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();
    let config = load_config(&cli)?;

    let transport = Transport::builder(config)
        .observer(Arc::new(TracingObserver))
        .build()?;

    match cli.command {
        Commands::Ping => commands::run_ping(&transport).await?,
        Commands::Request {
            method,
            path,
            body,
            query,
        } => commands::run_request(&transport, &method, &path, body, query).await?,
        Commands::Sniff => commands::run_sniff(&transport).await?,
        Commands::Msearch {
            file,
            operations,
            concurrency,
            flush_interval_ms,
        } => {
            let config = MultiSearchConfig {
                operations,
                concurrency,
                flush_interval_ms,
                ..MultiSearchConfig::default()
            };
            commands::run_msearch(&transport, &file, config).await?
        }
    }

    Ok(())
}
