//! Header a service writes as the first bytes of every dial-back connection.
//!
//! Layout: 2 bytes magic `OW`, then the rendezvous id as big-endian u64.

use std::io;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::RendezvousId;

pub const DIAL_BACK_MAGIC: [u8; 2] = *b"OW";
pub const DIAL_BACK_HEADER_LEN: usize = 10;

pub fn encode_dial_back_header(id: RendezvousId) -> [u8; DIAL_BACK_HEADER_LEN] {
    let mut buf = [0u8; DIAL_BACK_HEADER_LEN];
    buf[..2].copy_from_slice(&DIAL_BACK_MAGIC);
    buf[2..].copy_from_slice(&id.to_be_bytes());
    buf
}

pub fn decode_dial_back_header(buf: &[u8; DIAL_BACK_HEADER_LEN]) -> io::Result<RendezvousId> {
    if buf[..2] != DIAL_BACK_MAGIC {
        return Err(io::Error::new(io::ErrorKind::InvalidData, "invalid dial-back magic"));
    }
    let mut id = [0u8; 8];
    id.copy_from_slice(&buf[2..]);
    Ok(u64::from_be_bytes(id).into())
}

pub async fn write_dial_back_header<W: AsyncWrite + Unpin>(writer: &mut W, id: RendezvousId) -> io::Result<()> {
    writer.write_all(&encode_dial_back_header(id)).await?;
    writer.flush().await
}

pub async fn read_dial_back_header<R: AsyncRead + Unpin>(reader: &mut R) -> io::Result<RendezvousId> {
    let mut buf = [0u8; DIAL_BACK_HEADER_LEN];
    reader.read_exact(&mut buf).await?;
    decode_dial_back_header(&buf)
}
