use std::{sync::Arc, time::Duration};

use clap::Parser;
use oneway_agent::{run_service_connection, ControlConnection, ServiceAgentConfig};
use protocol::{control::RegisterRequest, DEFAULT_CONTROL_PORT, DEFAULT_POOL_PORT};
use tokio::time::sleep;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Expose a local TCP service through a oneway exchange without accepting inbound connections.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Control listener of the exchange
    #[arg(env, long, default_value_t = format!("127.0.0.1:{DEFAULT_CONTROL_PORT}"))]
    control_addr: String,

    /// Pool listener of the exchange, used for dial-backs
    #[arg(env, long, default_value_t = format!("127.0.0.1:{DEFAULT_POOL_PORT}"))]
    pool_addr: String,

    /// Local service which dial-backs are piped to
    #[arg(env, long, default_value = "127.0.0.1:8080")]
    local_target: String,

    /// Namespace of the service
    #[arg(env, long, default_value = "default")]
    namespace: String,

    /// Name clients use to reach this service
    #[arg(env, long)]
    service_name: String,

    /// Delay before reconnecting after the control connection ends
    #[arg(env, long, default_value_t = 1000)]
    reconnect_delay_ms: u64,
}

#[tokio::main]
async fn main() {
    if std::env::var_os("RUST_LOG").is_none() {
        std::env::set_var("RUST_LOG", "info");
    }
    let args = Args::parse();
    tracing_subscriber::registry().with(fmt::layer()).with(EnvFilter::from_default_env()).init();

    let cfg = Arc::new(ServiceAgentConfig {
        control_addr: args.control_addr,
        pool_addr: args.pool_addr,
        local_target: args.local_target,
        namespace: args.namespace,
        service_name: args.service_name,
    });

    loop {
        let req = RegisterRequest {
            namespace: cfg.namespace.clone(),
            service_name: cfg.service_name.clone(),
        };
        match ControlConnection::connect(&cfg.control_addr, req).await {
            Ok(conn) => {
                log::info!("[OnewayAgent] registered {}/{} at {}", cfg.namespace, cfg.service_name, cfg.control_addr);
                if let Err(e) = run_service_connection(conn, cfg.clone()).await {
                    log::error!("[OnewayAgent] control connection ended {e:?}");
                }
            }
            Err(e) => {
                log::error!("[OnewayAgent] connect to exchange {} error {e:?}", cfg.control_addr);
            }
        }
        sleep(Duration::from_millis(args.reconnect_delay_ms)).await;
    }
}
