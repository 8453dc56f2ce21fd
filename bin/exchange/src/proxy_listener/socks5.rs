//! SOCKS5 (RFC 1928) with "no authentication" and CONNECT only.

use std::net::{Ipv4Addr, Ipv6Addr};

use anyhow::{anyhow, bail};
use tokio::io::{AsyncBufRead, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::ExchangeError;

use super::{DestinationDetector, ProxyDestination};

const SOCKS_VERSION: u8 = 0x05;
const AUTH_NONE: u8 = 0x00;
const AUTH_NO_ACCEPTABLE: u8 = 0xff;
const CMD_CONNECT: u8 = 0x01;

const ATYP_IPV4: u8 = 0x01;
const ATYP_DOMAIN: u8 = 0x03;
const ATYP_IPV6: u8 = 0x04;

const REP_SUCCEEDED: u8 = 0x00;
const REP_GENERAL_FAILURE: u8 = 0x01;
const REP_HOST_UNREACHABLE: u8 = 0x04;
const REP_COMMAND_NOT_SUPPORTED: u8 = 0x07;
const REP_ADDRESS_TYPE_NOT_SUPPORTED: u8 = 0x08;

#[derive(Debug, Default)]
pub struct Socks5Detector {}

async fn write_reply<S: AsyncWrite + Unpin>(stream: &mut S, rep: u8) -> std::io::Result<()> {
    // bound address is always reported as 0.0.0.0:0
    stream.write_all(&[SOCKS_VERSION, rep, 0x00, ATYP_IPV4, 0, 0, 0, 0, 0, 0]).await?;
    stream.flush().await
}

impl DestinationDetector for Socks5Detector {
    fn name(&self) -> &str {
        "socks5"
    }

    async fn determine<S: AsyncBufRead + AsyncWrite + Unpin + Send>(&self, stream: &mut S) -> anyhow::Result<ProxyDestination> {
        let mut greeting = [0u8; 2];
        stream.read_exact(&mut greeting).await?;
        if greeting[0] != SOCKS_VERSION {
            bail!("unsupported socks version {}", greeting[0]);
        }
        let mut methods = vec![0u8; greeting[1] as usize];
        stream.read_exact(&mut methods).await?;
        if !methods.contains(&AUTH_NONE) {
            stream.write_all(&[SOCKS_VERSION, AUTH_NO_ACCEPTABLE]).await?;
            stream.flush().await?;
            bail!("client offers no acceptable auth method {methods:?}");
        }
        stream.write_all(&[SOCKS_VERSION, AUTH_NONE]).await?;
        stream.flush().await?;

        let mut head = [0u8; 4];
        stream.read_exact(&mut head).await?;
        let [version, cmd, _rsv, atyp] = head;
        if version != SOCKS_VERSION {
            bail!("unsupported socks version {version} in request");
        }

        let host = match atyp {
            ATYP_IPV4 => {
                let mut addr = [0u8; 4];
                stream.read_exact(&mut addr).await?;
                Ipv4Addr::from(addr).to_string()
            }
            ATYP_DOMAIN => {
                let len = stream.read_u8().await?;
                let mut domain = vec![0u8; len as usize];
                stream.read_exact(&mut domain).await?;
                String::from_utf8(domain).map_err(|_| anyhow!("domain is not utf8"))?
            }
            ATYP_IPV6 => {
                let mut addr = [0u8; 16];
                stream.read_exact(&mut addr).await?;
                Ipv6Addr::from(addr).to_string()
            }
            _ => {
                write_reply(stream, REP_ADDRESS_TYPE_NOT_SUPPORTED).await?;
                bail!("unsupported address type {atyp}");
            }
        };
        let port = stream.read_u16().await?;

        if cmd != CMD_CONNECT {
            write_reply(stream, REP_COMMAND_NOT_SUPPORTED).await?;
            bail!("unsupported command {cmd}");
        }
        if host.is_empty() {
            write_reply(stream, REP_HOST_UNREACHABLE).await?;
            bail!("empty destination");
        }
        Ok(ProxyDestination { host, port })
    }

    async fn reply<S: AsyncRead + AsyncWrite + Unpin + Send>(&self, stream: &mut S, res: Result<(), &ExchangeError>) -> anyhow::Result<()> {
        let rep = match res {
            Ok(()) => REP_SUCCEEDED,
            Err(ExchangeError::ServiceNotFound(_)) | Err(ExchangeError::ServiceGone(_)) => REP_HOST_UNREACHABLE,
            Err(_) => REP_GENERAL_FAILURE,
        };
        write_reply(stream, rep).await?;
        Ok(())
    }
}
