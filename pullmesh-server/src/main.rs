mod config;
mod server;

use clap::{Parser, Subcommand};
use config::AgentConfig;
use server::run_server;
use std::path::PathBuf;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

#[derive(Parser)]
#[command(name = "pullmesh")]
#[command(about = "Peer-to-peer download accelerator for container image layers")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start a proxy agent node
    Serve {
        /// Address the HTTP listener binds to
        #[arg(long, default_value = "0.0.0.0")]
        addr: String,

        /// Port the HTTP listener binds to
        #[arg(long, default_value_t = 5000)]
        port: u16,

        /// Seed peer (host:port) to join an existing mesh through
        #[arg(long)]
        peer: Option<String>,

        /// Address advertised to peers; autodetected when omitted
        #[arg(long = "advertise-addr")]
        advertise_addr: Option<String>,

        /// Directory layer files are cached under
        #[arg(long = "data-dir", default_value = "/tmp/pullmesh")]
        data_dir: PathBuf,
    },
}

#[tokio::main]
async fn main() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "pullmesh=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Serve {
            addr,
            port,
            peer,
            advertise_addr,
            data_dir,
        } => {
            let config = AgentConfig {
                bind_addr: addr,
                port,
                peer,
                advertise_addr,
                data_dir,
            };

            if let Err(error) = run_server(config).await {
                tracing::error!("Server error: {}", error);
                std::process::exit(1);
            }
        }
    }
}
