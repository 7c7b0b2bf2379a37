use std::sync::Arc;

use clap::{Parser, Subcommand};

use tab_relay_core::config::RelayConfig;
use tab_relay_server::RelayState;

#[derive(Parser)]
#[command(
    name = "tab-relay",
    about = "CDP relay between automation clients and a privileged browser extension",
    version
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Config file path
    #[arg(short, long, global = true)]
    config: Option<String>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the relay server
    Serve {
        /// Interface to bind (default: 127.0.0.1)
        #[arg(long)]
        host: Option<String>,

        /// Port to listen on (default: 9223)
        #[arg(long)]
        port: Option<u16>,

        /// Shared secret automation clients must present
        #[arg(long)]
        token: Option<String>,

        /// Do not provision a tab on the first auto-attach call
        #[arg(long)]
        no_auto_provision: bool,
    },

    /// Probe a running relay and print its status
    Status {
        #[arg(long)]
        host: Option<String>,

        #[arg(long)]
        port: Option<u16>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Load config first so its logging level can seed the filter.
    let config_path = cli
        .config
        .map(std::path::PathBuf::from)
        .unwrap_or_else(RelayConfig::default_path);
    let mut config = RelayConfig::load(&config_path)?;

    let filter = if cli.verbose {
        "debug".to_string()
    } else {
        config.log_level().unwrap_or_else(|| "info".to_string())
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(filter)),
        )
        .init();

    match cli.command {
        Commands::Serve { host, port, token, no_auto_provision } => {
            let server = config.server.get_or_insert_with(Default::default);
            if let Some(host) = host {
                server.host = Some(host);
            }
            if let Some(port) = port {
                server.port = Some(port);
            }
            if let Some(token) = token {
                server.token = Some(token);
            }
            if no_auto_provision {
                server.auto_provision = Some(false);
            }

            let host = config.host();
            let port = config.port();
            tracing::info!("Starting tab relay on {host}:{port}");

            let state = Arc::new(RelayState::new(config));
            tab_relay_server::start_relay(state, &host, port).await?;
        }
        Commands::Status { host, port } => {
            let host = host.unwrap_or_else(|| config.host());
            let port = port.unwrap_or_else(|| config.port());
            let base = format!("http://{host}:{port}");

            let version: serde_json::Value =
                reqwest::get(format!("{base}/version")).await?.json().await?;
            let status: serde_json::Value = reqwest::get(format!("{base}/extension/status"))
                .await?
                .json()
                .await?;

            println!(
                "tab-relay v{} at {base}",
                version["version"].as_str().unwrap_or("?")
            );
            println!(
                "Extension: {}",
                if status["connected"].as_bool().unwrap_or(false) {
                    "connected"
                } else {
                    "not connected"
                }
            );
        }
    }

    Ok(())
}
