use std::{net::SocketAddr, sync::Arc, time::Duration};

use anyhow::anyhow;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

mod bridge;
mod control_listener;
mod error;
mod exchange;
mod metrics;
mod pooler;
mod proxy_listener;
mod queue;
mod registry;
mod utils;

#[cfg(test)]
mod tests;

pub use bridge::{Bridge, BridgeError, BridgeStats};
pub use control_listener::{ControlListener, ControlStream, TcpControlStream};
pub use error::{ConnResult, ExchangeError};
pub use exchange::ExchangeService;
pub use self::metrics::*;
pub use pooler::{ConnectionPooler, PendingConn, PoolerRequester};
pub use proxy_listener::{http::HttpConnectDetector, socks5::Socks5Detector, DestinationDetector, ProxyDestination, ProxyTcpListener};
pub use queue::ConnectionQueue;
pub use registry::{Service, ServiceRegistry, ServiceSessionId};
pub use utils::ErrorExt;

pub struct ExchangeConfig {
    pub control_listener: SocketAddr,
    pub pool_listener: SocketAddr,
    pub socks5_listener: SocketAddr,
    pub http_proxy_listener: Option<SocketAddr>,
    pub rendezvous_timeout: Duration,
    pub handshake_timeout: Duration,
    pub command_channel_size: usize,
}

pub struct Exchange {
    service: Arc<ExchangeService>,
    control: ControlListener,
    pooler: ConnectionPooler,
    socks5: ProxyTcpListener<Socks5Detector>,
    http_proxy: Option<ProxyTcpListener<HttpConnectDetector>>,
}

impl Exchange {
    /// Bind every listener. Fails if any address cannot be bound.
    pub async fn new(cfg: ExchangeConfig) -> anyhow::Result<Self> {
        let pooler = ConnectionPooler::new(cfg.pool_listener, cfg.handshake_timeout).await?;
        let service = Arc::new(ExchangeService::new(pooler.requester(), cfg.rendezvous_timeout, cfg.command_channel_size));
        let control = ControlListener::new(cfg.control_listener, cfg.handshake_timeout).await?;
        let socks5 = ProxyTcpListener::new(cfg.socks5_listener, Socks5Detector::default(), cfg.handshake_timeout).await?;
        let http_proxy = match cfg.http_proxy_listener {
            Some(addr) => Some(ProxyTcpListener::new(addr, HttpConnectDetector::default(), cfg.handshake_timeout).await?),
            None => None,
        };

        Ok(Self {
            service,
            control,
            pooler,
            socks5,
            http_proxy,
        })
    }

    pub fn service(&self) -> Arc<ExchangeService> {
        self.service.clone()
    }

    pub fn control_addr(&self) -> anyhow::Result<SocketAddr> {
        self.control.local_addr()
    }

    pub fn pool_addr(&self) -> anyhow::Result<SocketAddr> {
        self.pooler.local_addr()
    }

    pub fn socks5_addr(&self) -> anyhow::Result<SocketAddr> {
        self.socks5.local_addr()
    }

    pub fn http_proxy_addr(&self) -> Option<anyhow::Result<SocketAddr>> {
        self.http_proxy.as_ref().map(|l| l.local_addr())
    }

    /// Run every component until `cancel` fires or one of them exits. Any exit cancels the rest;
    /// the first error is returned once all components have stopped.
    pub async fn run(self, cancel: CancellationToken) -> anyhow::Result<()> {
        let mut tasks = JoinSet::new();
        tasks.spawn(self.pooler.run(cancel.clone()));
        tasks.spawn(self.control.run(self.service.clone(), cancel.clone()));
        tasks.spawn(self.socks5.run(self.service.clone(), cancel.clone()));
        if let Some(http_proxy) = self.http_proxy {
            tasks.spawn(http_proxy.run(self.service.clone(), cancel.clone()));
        }

        let mut first_err = None;
        while let Some(joined) = tasks.join_next().await {
            let res = joined.map_err(|e| anyhow!("component task failed: {e}")).and_then(|r| r);
            if let Err(e) = res {
                log::error!("[Exchange] component stopped with error {e:?}");
                first_err.get_or_insert(e);
            }
            if !cancel.is_cancelled() {
                log::info!("[Exchange] a component stopped, shutting down others");
                cancel.cancel();
            }
        }

        log::info!("[Exchange] all components stopped");
        match first_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}
