use std::sync::Arc;

use protocol::{control::ConnectCommand, dial_back::write_dial_back_header};
use tokio::{io::copy_bidirectional, net::TcpStream};

mod connection;

pub use connection::ControlConnection;

#[derive(Debug, Clone)]
pub struct ServiceAgentConfig {
    pub control_addr: String,
    pub pool_addr: String,
    pub local_target: String,
    pub namespace: String,
    pub service_name: String,
}

/// Answer connect commands until the control connection ends. Each command gets its own task.
pub async fn run_service_connection(mut conn: ControlConnection, cfg: Arc<ServiceAgentConfig>) -> anyhow::Result<()> {
    loop {
        let cmd = conn.recv().await?;
        if cmd.service_name != cfg.service_name {
            log::warn!("[ServiceAgent] ignore command {} for other service {}", cmd.id, cmd.service_name);
            continue;
        }
        log::info!("[ServiceAgent] connect command {}", cmd.id);
        let cfg = cfg.clone();
        tokio::spawn(async move {
            let id = cmd.id;
            if let Err(e) = dial_back(&cfg, cmd).await {
                log::error!("[ServiceAgent] dial-back {id} error {e:?}");
            }
        });
    }
}

/// Connect the local target, then dial back to the exchange pool and pipe both together.
pub async fn dial_back(cfg: &ServiceAgentConfig, cmd: ConnectCommand) -> anyhow::Result<()> {
    let mut local = TcpStream::connect(&cfg.local_target).await?;
    let mut remote = TcpStream::connect(&cfg.pool_addr).await?;
    write_dial_back_header(&mut remote, cmd.id).await?;
    log::info!("[ServiceAgent] dial-back {} established {} <=> {}", cmd.id, cfg.pool_addr, cfg.local_target);

    let (to_local, to_remote) = copy_bidirectional(&mut remote, &mut local).await?;
    log::info!("[ServiceAgent] dial-back {} closed, {to_local} bytes in {to_remote} bytes out", cmd.id);
    Ok(())
}
