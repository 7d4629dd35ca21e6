// Ferry relay: device registry, transfer handshake and chunk forwarding over TCP.

mod config;
mod transport;

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use ferry_core::RelayCore;
use tokio::net::TcpListener;
use tokio::sync::Mutex;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Parser)]
#[command(name = "ferry-relay")]
#[command(about = "Relay that pairs devices and forwards file chunks between them", long_about = None)]
#[command(version)]
struct Cli {
    /// Address to listen on (overrides config and FERRY_LISTEN_ADDR)
    #[arg(long)]
    listen: Option<SocketAddr>,

    /// Config file (default: ~/.config/ferry/relay.toml, then /etc/ferry/relay.toml)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Enable debug logging
    #[arg(short, long)]
    verbose: bool,
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    let mut cfg = config::load(cli.config.as_deref())?;
    if let Some(addr) = cli.listen {
        cfg.listen_addr = addr;
    }
    let core = Arc::new(Mutex::new(RelayCore::new(cfg.core_config()?)));

    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(async {
        let listener = TcpListener::bind(cfg.listen_addr)
            .await
            .with_context(|| format!("binding {}", cfg.listen_addr))?;
        info!(addr = %cfg.listen_addr, version = env!("CARGO_PKG_VERSION"), "relay listening");
        tokio::select! {
            res = transport::run_relay(core, listener) => res.context("accept loop failed")?,
            res = shutdown_signal() => {
                res?;
                info!("shutting down");
            }
        }
        Ok::<_, anyhow::Error>(())
    })
}

fn init_logging(verbose: bool) {
    let default = if verbose {
        "ferry_relay=debug,ferry_core=debug"
    } else {
        "ferry_relay=info,ferry_core=info"
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();
}

/// Wait for Ctrl+C or SIGTERM (Unix). Open connections are dropped with the runtime.
async fn shutdown_signal() -> std::io::Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate())?;
        tokio::select! {
            res = tokio::signal::ctrl_c() => res?,
            _ = sigterm.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await?;
    }
    Ok(())
}
