//! fde — push deployment for places CI can't reach.

use std::path::PathBuf;
use std::process;

use clap::{Parser, Subcommand};
use tracing::{error, info};

use fde::app::options::AppOptions;
use fde::app::run::run;
use fde::client;
use fde::config::Config;
use fde::errors::FdeError;
use fde::logs::{init_logging, LogOptions};
use fde::utils::version_info;

#[derive(Parser)]
#[command(name = "fde", about = "Self-hosted push deployment pipeline", version)]
struct Cli {
    /// Config file (defaults to fde.yml / fde.yaml in the working directory).
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Package the local path, upload it, and run the deploy command.
    Deploy {
        /// Environment name from the config file.
        env: String,

        /// Run the deploy synchronously instead of streaming output.
        #[arg(long)]
        no_stream: bool,
    },

    /// Round-trip check against an environment's server.
    Ping {
        /// Environment name from the config file.
        env: String,
    },

    /// Show an environment's server health report.
    Health {
        /// Environment name from the config file.
        env: String,
    },

    /// Start the deployment server.
    Start,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let config = match Config::load(cli.config.as_deref()).await {
        Ok(config) => config,
        Err(e) => {
            eprintln!("failed to load configuration: {}", e);
            process::exit(1);
        }
    };

    if let Err(e) = init_logging(LogOptions {
        log_level: config.log_level.clone(),
        ..Default::default()
    }) {
        eprintln!("failed to initialize logging: {}", e);
    }

    let result = match cli.command {
        Commands::Deploy { env, no_stream } => client::run_deploy(&config, &env, no_stream).await,
        Commands::Ping { env } => client::run_ping(&config, &env).await,
        Commands::Health { env } => client::run_health(&config, &env).await,
        Commands::Start => start_server(config).await,
    };

    if let Err(e) = result {
        error!("{}", e);
        process::exit(1);
    }
}

async fn start_server(config: Config) -> Result<(), FdeError> {
    let version = version_info();
    info!("fde server {} ({})", version.version, version.git_hash);
    run(
        version.version,
        config,
        AppOptions::default(),
        await_shutdown_signal(),
    )
    .await
}

async fn await_shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate()).expect("install SIGTERM handler");

        tokio::select! {
            _ = sigterm.recv() => {
                info!("SIGTERM received, shutting down...");
            }
            _ = tokio::signal::ctrl_c() => {
                info!("Ctrl+C received, shutting down...");
            }
        }
    }

    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c()
            .await
            .expect("Failed to listen for Ctrl+C");
        info!("Ctrl+C received, shutting down...");
    }
}
