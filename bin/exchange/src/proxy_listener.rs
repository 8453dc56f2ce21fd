//! Forward proxy front ends: accept downstream clients, find out which service they want and bridge them to it.

use std::{future::Future, net::SocketAddr, sync::Arc, time::Duration};

use anyhow::anyhow;
use metrics::{counter, gauge};
use tokio::{
    io::{AsyncBufRead, AsyncRead, AsyncWrite, BufReader},
    net::{TcpListener, TcpStream},
    select,
};
use tokio_util::{sync::CancellationToken, task::TaskTracker};

use crate::{
    bridge::Bridge,
    error::ExchangeError,
    exchange::ExchangeService,
    utils::{accept_backoff, ErrorExt},
    METRICS_PROXY_COUNT, METRICS_PROXY_ERROR_COUNT, METRICS_PROXY_LIVE,
};

pub mod http;
pub mod socks5;

/// Where a downstream client wants to go. `host` is the service name, the port is informational.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProxyDestination {
    pub host: String,
    pub port: u16,
}

pub trait DestinationDetector: Send + Sync + 'static {
    fn name(&self) -> &str;
    /// Run the proxy handshake up to the point where the destination is known. Bytes buffered
    /// past the handshake stay in `stream` and are bridged afterwards.
    fn determine<S: AsyncBufRead + AsyncWrite + Unpin + Send>(&self, stream: &mut S) -> impl Future<Output = anyhow::Result<ProxyDestination>> + Send;
    /// Tell the client whether its destination was reached.
    fn reply<S: AsyncRead + AsyncWrite + Unpin + Send>(&self, stream: &mut S, res: Result<(), &ExchangeError>) -> impl Future<Output = anyhow::Result<()>> + Send;
}

pub struct ProxyTcpListener<Detector> {
    listener: TcpListener,
    detector: Arc<Detector>,
    handshake_timeout: Duration,
}

impl<Detector: DestinationDetector> ProxyTcpListener<Detector> {
    pub async fn new(addr: SocketAddr, detector: Detector, handshake_timeout: Duration) -> anyhow::Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        log::info!("[ProxyTcpListener {}] listening on {}", detector.name(), listener.local_addr()?);
        Ok(Self {
            listener,
            detector: detector.into(),
            handshake_timeout,
        })
    }

    pub fn local_addr(&self) -> anyhow::Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    pub async fn run(self, exchange: Arc<ExchangeService>, cancel: CancellationToken) -> anyhow::Result<()> {
        let name = self.detector.name().to_string();
        let tracker = TaskTracker::new();
        loop {
            let (stream, remote) = select! {
                _ = cancel.cancelled() => break,
                accept = self.listener.accept() => match accept {
                    Ok(incoming) => incoming,
                    Err(e) => {
                        log::error!("[ProxyTcpListener {name}] accept error {e:?}");
                        accept_backoff(&cancel).await;
                        continue;
                    }
                },
            };

            counter!(METRICS_PROXY_COUNT).increment(1);
            let detector = self.detector.clone();
            let exchange = exchange.clone();
            let cancel = cancel.clone();
            let handshake_timeout = self.handshake_timeout;
            tracker.spawn(async move {
                let res = serve_proxy_conn(detector.as_ref(), &exchange, stream, remote, handshake_timeout, &cancel).await;
                if res.is_err() {
                    counter!(METRICS_PROXY_ERROR_COUNT).increment(1);
                }
                res.print_on_err(&format!("[ProxyTcpListener {}] conn from {remote}", detector.name()));
            });
        }

        log::info!("[ProxyTcpListener {name}] stopped accepting, waiting {} proxy conns", tracker.len());
        tracker.close();
        tracker.wait().await;
        Ok(())
    }
}

async fn serve_proxy_conn<Detector: DestinationDetector>(
    detector: &Detector,
    exchange: &ExchangeService,
    stream: TcpStream,
    remote: SocketAddr,
    handshake_timeout: Duration,
    cancel: &CancellationToken,
) -> anyhow::Result<()> {
    let mut stream = BufReader::new(stream);
    let dest = tokio::time::timeout(handshake_timeout, detector.determine(&mut stream))
        .await
        .map_err(|_| anyhow!("{} handshake timeout", detector.name()))??;
    log::info!("[ProxyTcpListener {}] {remote} => {}:{}", detector.name(), dest.host, dest.port);

    let conn = match exchange.request_conn(&dest.host, cancel).await {
        Ok(conn) => conn,
        Err(e) => {
            detector.reply(&mut stream, Err(&e)).await.print_on_err("[ProxyTcpListener] reply failure");
            return Err(e.into());
        }
    };
    detector.reply(&mut stream, Ok(())).await?;

    gauge!(METRICS_PROXY_LIVE).increment(1.0);
    let (stats, res) = Bridge::new(stream, conn).run(cancel).await;
    gauge!(METRICS_PROXY_LIVE).decrement(1.0);
    log::info!(
        "[ProxyTcpListener {}] {remote} => {} closed, {} bytes to client {} bytes from client in {:?}",
        detector.name(),
        dest.host,
        stats.sent,
        stats.recv,
        stats.duration
    );
    res?;
    Ok(())
}
