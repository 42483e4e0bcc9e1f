use std::net::IpAddr;
use std::net::Ipv4Addr;
use std::net::SocketAddr;
use std::path::PathBuf;

use anyhow::Context;
use clap::Parser;
use npshell_core::Server;
use npshell_core::ServerConfig;
use tracing::info;

/// Multi-user shell server with numbered and user pipes.
#[derive(Debug, Parser)]
#[command(name = "npshell-server", version)]
pub struct Cli {
    /// TCP port to listen on.
    pub port: u16,

    /// TOML file with server settings; built-in defaults when omitted.
    #[arg(long, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Address to bind.
    #[arg(long, value_name = "ADDR", default_value_t = IpAddr::V4(Ipv4Addr::UNSPECIFIED))]
    pub bind: IpAddr,
}

/// Log to stderr, filtered by `RUST_LOG` (default `info`).
pub fn init_tracing() {
    if tracing::dispatcher::has_been_set() {
        return;
    }
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();
}

pub async fn run(cli: Cli) -> anyhow::Result<()> {
    let config = match &cli.config {
        Some(path) => ServerConfig::load(path)
            .with_context(|| format!("failed to load config from {}", path.display()))?,
        None => ServerConfig::default(),
    };

    let addr = SocketAddr::new(cli.bind, cli.port);
    let server = Server::bind(addr, config)
        .await
        .with_context(|| format!("failed to listen on {addr}"))?;
    info!(addr = %server.local_addr()?, "npshell server listening");

    server
        .run_until(async {
            if tokio::signal::ctrl_c().await.is_err() {
                // No signal handling available; serve until killed.
                std::future::pending::<()>().await;
            }
        })
        .await;
    Ok(())
}
