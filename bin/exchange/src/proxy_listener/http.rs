use anyhow::{anyhow, bail};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::ExchangeError;

use super::{DestinationDetector, ProxyDestination};

const MAX_HEAD_SIZE: usize = 8 * 1024;

/// HTTP forward proxy which only understands `CONNECT host:port`.
#[derive(Debug, Default)]
pub struct HttpConnectDetector {}

/// Read the request head line by line. Whatever follows the blank line stays buffered in `stream`.
async fn read_head<S: AsyncBufRead + Unpin>(stream: &mut S) -> anyhow::Result<Vec<u8>> {
    let mut head = Vec::with_capacity(256);
    loop {
        let limit = (MAX_HEAD_SIZE - head.len()) as u64;
        let n = (&mut *stream).take(limit).read_until(b'\n', &mut head).await?;
        if head.ends_with(b"\r\n\r\n") || head.ends_with(b"\n\n") {
            return Ok(head);
        }
        if head.len() >= MAX_HEAD_SIZE {
            bail!("request head exceeds {MAX_HEAD_SIZE} bytes");
        }
        if n == 0 {
            bail!("closed before end of request head");
        }
    }
}

fn parse_authority(target: &str) -> anyhow::Result<ProxyDestination> {
    let (host, port) = target.rsplit_once(':').ok_or_else(|| anyhow!("missing port in {target}"))?;
    let port = port.parse::<u16>().map_err(|_| anyhow!("invalid port in {target}"))?;
    let host = host.trim_start_matches('[').trim_end_matches(']');
    if host.is_empty() {
        bail!("missing host in {target}");
    }
    Ok(ProxyDestination { host: host.to_string(), port })
}

async fn write_status<S: AsyncWrite + Unpin>(stream: &mut S, status: &str) -> std::io::Result<()> {
    stream.write_all(format!("HTTP/1.1 {status}\r\nContent-Length: 0\r\nConnection: close\r\n\r\n").as_bytes()).await?;
    stream.flush().await
}

impl DestinationDetector for HttpConnectDetector {
    fn name(&self) -> &str {
        "http-connect"
    }

    async fn determine<S: AsyncBufRead + AsyncWrite + Unpin + Send>(&self, stream: &mut S) -> anyhow::Result<ProxyDestination> {
        let head = read_head(stream).await?;
        let (method, target) = {
            let mut headers = [httparse::EMPTY_HEADER; 64];
            let mut req = httparse::Request::new(&mut headers);
            if req.parse(&head)?.is_partial() {
                bail!("incomplete request head");
            }
            (req.method.unwrap_or_default().to_string(), req.path.unwrap_or_default().to_string())
        };

        if !method.eq_ignore_ascii_case("CONNECT") {
            write_status(stream, "405 Method Not Allowed").await?;
            bail!("unsupported method {method}");
        }
        match parse_authority(&target) {
            Ok(dest) => Ok(dest),
            Err(e) => {
                write_status(stream, "400 Bad Request").await?;
                Err(e)
            }
        }
    }

    async fn reply<S: AsyncRead + AsyncWrite + Unpin + Send>(&self, stream: &mut S, res: Result<(), &ExchangeError>) -> anyhow::Result<()> {
        match res {
            Ok(()) => {
                stream.write_all(b"HTTP/1.1 200 Connection Established\r\n\r\n").await?;
                stream.flush().await?;
            }
            Err(ExchangeError::ServiceNotFound(_)) | Err(ExchangeError::ServiceGone(_)) => write_status(stream, "404 Not Found").await?,
            Err(ExchangeError::Timeout(_)) => write_status(stream, "504 Gateway Timeout").await?,
            Err(_) => write_status(stream, "502 Bad Gateway").await?,
        }
        Ok(())
    }
}
