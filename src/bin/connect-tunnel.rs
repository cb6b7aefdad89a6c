//! connect-tunnel: HTTP CONNECT forward proxy.

use std::net::{IpAddr, SocketAddr};
use std::time::Duration;

use clap::Parser;
use connect_tunnel::{DirectMode, ProxyConfig, Server, DEFAULT_PORT};
use tracing::{error, info};

/// connect-tunnel - HTTP CONNECT forward proxy
#[derive(Parser, Debug)]
#[command(name = "connect-tunnel", version, about = "HTTP CONNECT forward proxy")]
struct Cli {
    /// Listen port
    #[arg(short, long, env = "PORT", default_value_t = DEFAULT_PORT)]
    port: u16,

    /// Listen address
    #[arg(long, default_value = "0.0.0.0")]
    bind: IpAddr,

    /// Target dial timeout in seconds
    #[arg(long, default_value_t = 10)]
    dial_timeout: u64,

    /// Close tunnels idle for this many seconds (default: never)
    #[arg(long)]
    idle_timeout: Option<u64>,

    /// Seconds the other direction may keep flushing after one side closes
    #[arg(long, default_value_t = 5)]
    drain_timeout: u64,

    /// TCP keepalive idle time on target sockets, in seconds
    #[arg(long)]
    keepalive: Option<u64>,

    /// Target address family preference (auto, 46, 64, 4, 6)
    #[arg(long, default_value = "auto")]
    dial_mode: DirectMode,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    use tracing_subscriber::EnvFilter;
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cli.log_level));
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .init();

    let config = ProxyConfig::new()
        .with_listen(SocketAddr::new(cli.bind, cli.port))
        .with_dial_timeout(Duration::from_secs(cli.dial_timeout))
        .with_dial_mode(cli.dial_mode)
        .with_keepalive(cli.keepalive.map(Duration::from_secs))
        .with_idle_timeout(cli.idle_timeout.map(Duration::from_secs))
        .with_drain_timeout(Duration::from_secs(cli.drain_timeout));

    info!(
        version = env!("CARGO_PKG_VERSION"),
        listen = %config.listen,
        "starting connect-tunnel"
    );

    let server = match Server::bind(config).await {
        Ok(server) => server,
        Err(e) => {
            error!(error = %e, "failed to start");
            std::process::exit(1);
        }
    };

    let shutdown = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "failed to listen for ctrl-c");
            std::future::pending::<()>().await;
        }
        info!("received ctrl-c");
    };

    if let Err(e) = server.run_until(shutdown).await {
        error!(error = %e, "server error");
        std::process::exit(1);
    }
}
