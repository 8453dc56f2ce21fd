//! Control connection from a service to the exchange.

use anyhow::{anyhow, bail};
use futures::{SinkExt, StreamExt};
use protocol::{
    bincode_stream::BincodeCodec,
    control::{ConnectCommand, ControlMessage, RegisterRequest},
};
use tokio::net::{
    tcp::{OwnedReadHalf, OwnedWriteHalf},
    TcpStream,
};
use tokio_util::codec::{FramedRead, FramedWrite};

pub struct ControlConnection {
    reader: FramedRead<OwnedReadHalf, BincodeCodec<ControlMessage>>,
    // kept open, the exchange treats a closed stream as a gone service
    _writer: FramedWrite<OwnedWriteHalf, BincodeCodec<RegisterRequest>>,
}

impl ControlConnection {
    /// Connect to the exchange control listener and register `req`.
    pub async fn connect(addr: &str, req: RegisterRequest) -> anyhow::Result<Self> {
        let stream = TcpStream::connect(addr).await?;
        let (read, write) = stream.into_split();
        let mut reader = FramedRead::new(read, BincodeCodec::<ControlMessage>::default());
        let mut writer = FramedWrite::new(write, BincodeCodec::<RegisterRequest>::default());

        log::info!("[ControlConnection] register {}/{} at {addr}", req.namespace, req.service_name);
        writer.send(req).await?;
        match reader.next().await.ok_or_else(|| anyhow!("exchange closed before ack"))?? {
            ControlMessage::Registered(Ok(())) => Ok(Self { reader, _writer: writer }),
            ControlMessage::Registered(Err(e)) => bail!("exchange rejected register: {e}"),
            ControlMessage::Connect(cmd) => bail!("unexpected command {} before ack", cmd.id),
        }
    }

    /// Next connect command. Errors once the exchange is gone.
    pub async fn recv(&mut self) -> anyhow::Result<ConnectCommand> {
        loop {
            match self.reader.next().await.ok_or_else(|| anyhow!("control connection closed"))?? {
                ControlMessage::Connect(cmd) => return Ok(cmd),
                ControlMessage::Registered(res) => log::warn!("[ControlConnection] unexpected register ack {res:?}"),
            }
        }
    }
}
