use std::{net::SocketAddr, process::exit, time::Duration};

use clap::Parser;
use oneway_exchange::{describe_metrics, Exchange, ExchangeConfig};
use protocol::{DEFAULT_CONTROL_PORT, DEFAULT_POOL_PORT, DEFAULT_SOCKS5_PORT};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Reverse-tunnel exchange: services behind NAT register here and are reached through the forward proxy
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// TCP address for control connections from services
    #[arg(env, long, default_value_t = SocketAddr::from(([0, 0, 0, 0], DEFAULT_CONTROL_PORT)))]
    control_listener: SocketAddr,

    /// TCP address services dial back to
    #[arg(env, long, default_value_t = SocketAddr::from(([0, 0, 0, 0], DEFAULT_POOL_PORT)))]
    pool_listener: SocketAddr,

    /// TCP address of the SOCKS5 forward proxy
    #[arg(env, long, default_value_t = SocketAddr::from(([0, 0, 0, 0], DEFAULT_SOCKS5_PORT)))]
    socks5_listener: SocketAddr,

    /// TCP address of the optional HTTP CONNECT forward proxy
    #[arg(env, long)]
    http_proxy_listener: Option<SocketAddr>,

    /// How long a proxy request waits for the service to dial back
    #[arg(env, long, default_value_t = 15000)]
    rendezvous_timeout_ms: u64,

    /// Deadline for register, dial-back header and proxy handshakes
    #[arg(env, long, default_value_t = 5000)]
    handshake_timeout_ms: u64,

    /// Pending connect commands buffered per service
    #[arg(env, long, default_value_t = 64)]
    command_channel_size: usize,
}

#[tokio::main]
async fn main() {
    if std::env::var_os("RUST_LOG").is_none() {
        std::env::set_var("RUST_LOG", "info");
    }
    if std::env::var_os("RUST_BACKTRACE").is_none() {
        std::env::set_var("RUST_BACKTRACE", "1");
    }
    let args: Args = Args::parse();
    tracing_subscriber::registry().with(fmt::layer()).with(EnvFilter::from_default_env()).init();
    describe_metrics();

    let cfg = ExchangeConfig {
        control_listener: args.control_listener,
        pool_listener: args.pool_listener,
        socks5_listener: args.socks5_listener,
        http_proxy_listener: args.http_proxy_listener,
        rendezvous_timeout: Duration::from_millis(args.rendezvous_timeout_ms),
        handshake_timeout: Duration::from_millis(args.handshake_timeout_ms),
        command_channel_size: args.command_channel_size,
    };
    let exchange = match Exchange::new(cfg).await {
        Ok(exchange) => exchange,
        Err(e) => {
            log::error!("[OnewayExchange] startup failed {e:?}");
            exit(1);
        }
    };

    let cancel = CancellationToken::new();
    let signal_cancel = cancel.clone();
    tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            log::error!("[OnewayExchange] listen ctrl-c error {e:?}");
            return;
        }
        log::info!("[OnewayExchange] ctrl-c received, shutting down");
        signal_cancel.cancel();
    });

    if let Err(e) = exchange.run(cancel).await {
        log::error!("[OnewayExchange] stopped with error {e:?}");
        exit(1);
    }
    log::info!("[OnewayExchange] stopped");
}
