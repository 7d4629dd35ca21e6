// Ferry device client: list devices on a relay, send a file, receive files.

mod commands;
mod config;
mod connection;
mod sink;

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use ferry_core::ClientCore;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Parser)]
#[command(name = "ferry")]
#[command(about = "Send files to other devices through a Ferry relay", long_about = None)]
#[command(version)]
struct Cli {
    /// Relay address, host:port (overrides config and FERRY_RELAY_ADDR)
    #[arg(long, global = true)]
    relay: Option<String>,

    /// Name other devices see (overrides config and FERRY_DEVICE_NAME)
    #[arg(long, global = true)]
    name: Option<String>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List the other devices connected to the relay
    Devices,
    /// Send a file to a device
    Send {
        /// Device name or id prefix
        device: String,
        /// File to send
        path: PathBuf,
    },
    /// Wait for incoming files
    Receive {
        /// Accept every request without asking
        #[arg(short, long)]
        yes: bool,
        /// Directory to save files into
        #[arg(short, long, default_value = ".")]
        out: PathBuf,
        /// Exit after the first file
        #[arg(long)]
        once: bool,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    let mut cfg = config::load()?;
    if let Some(relay) = cli.relay {
        cfg.relay_addr = relay;
    }
    if let Some(name) = cli.name {
        cfg.device_name = name;
    }
    let core = ClientCore::new(cfg.core_config()?, cfg.device_name.clone());

    match cli.command {
        Commands::Devices => commands::devices(&cfg.relay_addr, core).await,
        Commands::Send { device, path } => {
            commands::send(&cfg.relay_addr, core, &device, &path).await
        }
        Commands::Receive { yes, out, once } => {
            let opts = commands::ReceiveOptions {
                auto_accept: yes,
                out_dir: out,
                once,
            };
            commands::receive(&cfg.relay_addr, core, opts).await
        }
    }
}

fn init_logging(verbose: bool) {
    let default = if verbose {
        "ferry_cli=debug,ferry_core=debug"
    } else {
        "ferry_cli=info,ferry_core=warn"
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();
}
