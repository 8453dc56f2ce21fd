//! Control plane: services connect here, register a name and then receive connect commands.

use std::{future::Future, net::SocketAddr, sync::Arc, time::Duration};

use anyhow::anyhow;
use futures::{SinkExt, StreamExt};
use protocol::{
    bincode_stream::BincodeCodec,
    control::{ConnectCommand, ControlMessage, RegisterRequest},
};
use tokio::{
    net::{
        tcp::{OwnedReadHalf, OwnedWriteHalf},
        TcpListener, TcpStream,
    },
    select,
};
use tokio_util::{
    codec::{FramedRead, FramedWrite},
    sync::CancellationToken,
    task::TaskTracker,
};

use crate::{
    exchange::ExchangeService,
    utils::{accept_backoff, ErrorExt},
};

/// What a registration needs from its transport.
pub trait ControlStream: Send {
    fn send(&mut self, cmd: &ConnectCommand) -> impl Future<Output = anyhow::Result<()>> + Send;
    /// Resolves once the peer has gone away. Must be cancel safe.
    fn closed(&mut self) -> impl Future<Output = ()> + Send;
}

pub struct TcpControlStream {
    remote: SocketAddr,
    reader: FramedRead<OwnedReadHalf, BincodeCodec<RegisterRequest>>,
    writer: FramedWrite<OwnedWriteHalf, BincodeCodec<ControlMessage>>,
}

impl TcpControlStream {
    /// Read the registration of a fresh control connection and acknowledge it.
    pub async fn accept(stream: TcpStream, handshake_timeout: Duration) -> anyhow::Result<(RegisterRequest, Self)> {
        let remote = stream.peer_addr()?;
        let (read, write) = stream.into_split();
        let mut reader = FramedRead::new(read, BincodeCodec::<RegisterRequest>::default());
        let mut writer = FramedWrite::new(write, BincodeCodec::<ControlMessage>::default());

        let req = tokio::time::timeout(handshake_timeout, reader.next())
            .await
            .map_err(|_| anyhow!("register request from {remote} timeout"))?
            .ok_or_else(|| anyhow!("{remote} closed before register"))??;

        if req.service_name.is_empty() {
            writer.send(ControlMessage::Registered(Err("empty service name".to_string()))).await?;
            return Err(anyhow!("{remote} register with empty service name"));
        }
        writer.send(ControlMessage::Registered(Ok(()))).await?;

        Ok((req, Self { remote, reader, writer }))
    }
}

impl ControlStream for TcpControlStream {
    async fn send(&mut self, cmd: &ConnectCommand) -> anyhow::Result<()> {
        self.writer.send(ControlMessage::Connect(cmd.clone())).await?;
        Ok(())
    }

    async fn closed(&mut self) {
        loop {
            match self.reader.next().await {
                Some(Ok(req)) => log::warn!("[TcpControlStream {}] unexpected frame after register {req:?}", self.remote),
                Some(Err(e)) => {
                    log::warn!("[TcpControlStream {}] read error {e:?}", self.remote);
                    break;
                }
                None => break,
            }
        }
    }
}

pub struct ControlListener {
    listener: TcpListener,
    handshake_timeout: Duration,
}

impl ControlListener {
    pub async fn new(addr: SocketAddr, handshake_timeout: Duration) -> anyhow::Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        log::info!("[ControlListener] listening on {}", listener.local_addr()?);
        Ok(Self { listener, handshake_timeout })
    }

    pub fn local_addr(&self) -> anyhow::Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    pub async fn run(self, exchange: Arc<ExchangeService>, cancel: CancellationToken) -> anyhow::Result<()> {
        let tracker = TaskTracker::new();
        loop {
            let (stream, remote) = select! {
                _ = cancel.cancelled() => break,
                accept = self.listener.accept() => match accept {
                    Ok(incoming) => incoming,
                    Err(e) => {
                        log::error!("[ControlListener] accept error {e:?}");
                        accept_backoff(&cancel).await;
                        continue;
                    }
                },
            };

            log::info!("[ControlListener] new control connection from {remote}");
            let exchange = exchange.clone();
            let cancel = cancel.clone();
            let handshake_timeout = self.handshake_timeout;
            tracker.spawn(async move {
                serve_control_conn(exchange, stream, handshake_timeout, cancel)
                    .await
                    .print_on_err(&format!("[ControlListener] registration from {remote}"));
            });
        }

        log::info!("[ControlListener] stopped accepting, waiting {} registrations", tracker.len());
        tracker.close();
        tracker.wait().await;
        Ok(())
    }
}

async fn serve_control_conn(exchange: Arc<ExchangeService>, stream: TcpStream, handshake_timeout: Duration, cancel: CancellationToken) -> anyhow::Result<()> {
    let (req, stream) = TcpControlStream::accept(stream, handshake_timeout).await?;
    exchange.register_service(req, stream, &cancel).await?;
    Ok(())
}
