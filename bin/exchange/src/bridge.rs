//! Full-duplex byte copy between two connections with shared shutdown.

use std::{
    fmt, io,
    time::{Duration, Instant},
};

use tokio::{
    io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt},
    select,
};
use tokio_util::sync::CancellationToken;

const COPY_BUF_SIZE: usize = 16 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct BridgeStats {
    /// Bytes copied from destination to source.
    pub sent: u64,
    /// Bytes copied from source to destination.
    pub recv: u64,
    pub duration: Duration,
}

#[derive(Debug)]
pub struct BridgeError {
    errors: Vec<io::Error>,
}

impl BridgeError {
    pub fn errors(&self) -> &[io::Error] {
        &self.errors
    }
}

impl fmt::Display for BridgeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "bridge failed with {} error(s)", self.errors.len())?;
        for e in &self.errors {
            write!(f, "; {e}")?;
        }
        Ok(())
    }
}

impl std::error::Error for BridgeError {}

fn already_closed(e: &io::Error) -> bool {
    matches!(e.kind(), io::ErrorKind::NotConnected | io::ErrorKind::BrokenPipe)
}

fn into_result(errors: Vec<io::Error>) -> Result<(), BridgeError> {
    let errors = errors.into_iter().filter(|e| !already_closed(e)).collect::<Vec<_>>();
    if errors.is_empty() {
        Ok(())
    } else {
        Err(BridgeError { errors })
    }
}

pub struct Bridge<A, B> {
    source: A,
    dest: B,
}

impl<A, B> Bridge<A, B>
where
    A: AsyncRead + AsyncWrite + Unpin + Send,
    B: AsyncRead + AsyncWrite + Unpin + Send,
{
    pub fn new(source: A, dest: B) -> Self {
        Self { source, dest }
    }

    /// Copy in both directions until both sides end, one direction fails or `cancel` fires, then close
    /// both endpoints. EOF in one direction shuts down the writer it was copying into and leaves the
    /// other direction running. Stats are always returned and count what was moved before termination.
    pub async fn run(self, cancel: &CancellationToken) -> (BridgeStats, Result<(), BridgeError>) {
        let started = Instant::now();
        let stop = cancel.child_token();

        let (mut source_r, mut source_w) = tokio::io::split(self.source);
        let (mut dest_r, mut dest_w) = tokio::io::split(self.dest);
        let ((recv, forward), (sent, backward)) = tokio::join!(pipe(&mut source_r, &mut dest_w, &stop), pipe(&mut dest_r, &mut source_w, &stop));

        let bridge = Bridge {
            source: source_r.unsplit(source_w),
            dest: dest_r.unsplit(dest_w),
        };
        let mut errors = Vec::new();
        errors.extend(forward.err());
        errors.extend(backward.err());
        if let Err(e) = bridge.close().await {
            errors.extend(e.errors);
        }

        let stats = BridgeStats {
            sent,
            recv,
            duration: started.elapsed(),
        };
        log::debug!("[Bridge] finished sent {} recv {} in {:?}", stats.sent, stats.recv, stats.duration);
        (stats, into_result(errors))
    }

    /// Shut down both endpoints concurrently.
    pub async fn close(self) -> Result<(), BridgeError> {
        let Self { mut source, mut dest } = self;
        let (source_res, dest_res) = tokio::join!(source.shutdown(), dest.shutdown());
        into_result(source_res.err().into_iter().chain(dest_res.err()).collect())
    }
}

async fn pipe<R, W>(reader: &mut R, writer: &mut W, stop: &CancellationToken) -> (u64, io::Result<()>)
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut copied = 0;
    let res = select! {
        res = copy_counted(reader, writer, &mut copied) => res,
        _ = stop.cancelled() => Ok(()),
    };
    if res.is_err() {
        stop.cancel();
    }
    (copied, res)
}

async fn copy_counted<R, W>(reader: &mut R, writer: &mut W, copied: &mut u64) -> io::Result<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = vec![0u8; COPY_BUF_SIZE];
    loop {
        let n = reader.read(&mut buf).await?;
        if n == 0 {
            // propagate the half-close, the peer may already be gone
            return match writer.shutdown().await {
                Err(e) if !already_closed(&e) => Err(e),
                _ => Ok(()),
            };
        }
        writer.write_all(&buf[..n]).await?;
        writer.flush().await?;
        *copied += n as u64;
    }
}
