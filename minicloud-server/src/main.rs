mod config;
mod server;

use clap::{Parser, Subcommand};
use config::Config;
use server::{build_service, run_server};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

#[derive(Parser)]
#[command(name = "minicloud")]
#[command(about = "Single-node object storage with a separate metadata index")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the server
    Server {
        /// Path to configuration file
        #[arg(short, long, default_value = "config.yaml")]
        config: String,

        /// Create the storage layout and metadata schema, then exit
        #[arg(long)]
        init: bool,
    },
    /// Compare content and metadata for the given keys
    Verify {
        /// Path to configuration file
        #[arg(short, long, default_value = "config.yaml")]
        config: String,

        #[arg(required = true)]
        keys: Vec<String>,
    },
}

#[tokio::main]
async fn main() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "minicloud_server=info,minicloud_core=info,tower_http=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Server { config, init } => {
            tracing::info!("Starting MiniCloud server with config: {}", config);

            let cfg = load_config(&config);

            if init {
                if let Err(e) = build_service(&cfg) {
                    tracing::error!("Initialization failed: {}", e);
                    std::process::exit(1);
                }
                tracing::info!(
                    "Initialized storage at {:?} with index {:?}",
                    cfg.storage.data_dir,
                    cfg.storage.metadata_db_path()
                );
                return;
            }

            tracing::info!(
                "Bind: {}, Data dir: {:?}, Backend: {:?}",
                cfg.server.bind_addr,
                cfg.storage.data_dir,
                cfg.storage.backend
            );

            if let Err(e) = run_server(cfg).await {
                tracing::error!("Server error: {}", e);
                std::process::exit(1);
            }
        }
        Commands::Verify { config, keys } => {
            let cfg = load_config(&config);
            match run_verify(&cfg, &keys).await {
                Ok(true) => {}
                Ok(false) => std::process::exit(2),
                Err(e) => {
                    tracing::error!("Verify failed: {:#}", e);
                    std::process::exit(1);
                }
            }
        }
    }
}

fn load_config(path: &str) -> Config {
    match Config::from_file(path) {
        Ok(c) => c,
        Err(e) => {
            tracing::error!("Failed to load config: {}", e);
            std::process::exit(1);
        }
    }
}

/// Print one JSON report line per key. Returns whether every key was consistent.
async fn run_verify(cfg: &Config, keys: &[String]) -> anyhow::Result<bool> {
    let service = build_service(cfg)?;
    let mut all_consistent = true;

    for key in keys {
        let consistency = service.verify(key).await?;
        all_consistent &= consistency.is_consistent();

        let report = serde_json::json!({
            "key": key,
            "consistent": consistency.is_consistent(),
            "consistency": consistency,
        });
        println!("{}", serde_json::to_string(&report)?);
    }

    Ok(all_consistent)
}
