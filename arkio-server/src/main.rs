mod config;
mod runner;

use clap::{Parser, Subcommand};
use config::Config;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

#[derive(Parser)]
#[command(name = "arkio")]
#[command(about = "Preservation node daemon: replication, ingest, restore and registry sync")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the node: pipelines, fixity sweep, source scanner and sync loop
    Server {
        /// Path to configuration file
        #[arg(short, long, default_value = "arkio.yaml")]
        config: String,
    },
    /// Pull registry records from every configured peer once, then exit
    Sync {
        /// Path to configuration file
        #[arg(short, long, default_value = "arkio.yaml")]
        config: String,
    },
}

#[tokio::main]
async fn main() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "arkio=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Server { config } => {
            tracing::info!("Starting arkio node with config: {}", config);

            let cfg = match Config::from_file(&config) {
                Ok(c) => c,
                Err(e) => {
                    tracing::error!("Failed to load config: {}", e);
                    std::process::exit(1);
                }
            };

            if let Err(e) = runner::run_server(cfg).await {
                tracing::error!("Server error: {}", e);
                std::process::exit(1);
            }
        }
        Commands::Sync { config } => {
            let cfg = match Config::from_file(&config) {
                Ok(c) => c,
                Err(e) => {
                    tracing::error!("Failed to load config: {}", e);
                    std::process::exit(1);
                }
            };

            if let Err(e) = runner::run_sync_once(&cfg).await {
                tracing::error!("Sync failed: {}", e);
                std::process::exit(1);
            }
        }
    }
}
