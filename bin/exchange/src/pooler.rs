//! Pool listener: services dial back here after receiving a connect command.
//! Each dial-back starts with the header from `protocol::dial_back`, which names the request it answers.

use std::{net::SocketAddr, sync::Arc, time::Duration};

use anyhow::anyhow;
use metrics::counter;
use protocol::{dial_back::read_dial_back_header, RendezvousId};
use tokio::{
    net::{TcpListener, TcpStream},
    select,
    sync::oneshot,
    time::{sleep_until, Instant},
};
use tokio_util::{sync::CancellationToken, task::TaskTracker};

use crate::{
    error::{ConnResult, ExchangeError},
    queue::ConnectionQueue,
    utils::{accept_backoff, ErrorExt},
    METRICS_DIAL_BACK_COUNT, METRICS_DIAL_BACK_ERROR_COUNT, METRICS_DIAL_BACK_ORPHAN_COUNT,
};

pub struct ConnectionPooler {
    listener: TcpListener,
    queue: Arc<ConnectionQueue<TcpStream>>,
    handshake_timeout: Duration,
}

/// Cloneable handle used by the request path to park and resolve rendezvous.
#[derive(Clone)]
pub struct PoolerRequester {
    queue: Arc<ConnectionQueue<TcpStream>>,
}

/// A parked rendezvous. Dropping it before the dial-back arrives evicts the queue entry,
/// so a late dial-back for the same id is treated as an orphan.
pub struct PendingConn<S> {
    id: RendezvousId,
    rx: oneshot::Receiver<ConnResult<S>>,
    queue: Arc<ConnectionQueue<S>>,
}

impl ConnectionPooler {
    pub async fn new(addr: SocketAddr, handshake_timeout: Duration) -> anyhow::Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        log::info!("[ConnectionPooler] listening on {}", listener.local_addr()?);
        Ok(Self {
            listener,
            queue: Arc::new(ConnectionQueue::new()),
            handshake_timeout,
        })
    }

    pub fn local_addr(&self) -> anyhow::Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    pub fn requester(&self) -> PoolerRequester {
        PoolerRequester { queue: self.queue.clone() }
    }

    pub async fn run(self, cancel: CancellationToken) -> anyhow::Result<()> {
        let tracker = TaskTracker::new();
        loop {
            let (stream, remote) = select! {
                _ = cancel.cancelled() => break,
                accept = self.listener.accept() => match accept {
                    Ok(incoming) => incoming,
                    Err(e) => {
                        log::error!("[ConnectionPooler] accept error {e:?}");
                        counter!(METRICS_DIAL_BACK_ERROR_COUNT).increment(1);
                        accept_backoff(&cancel).await;
                        continue;
                    }
                },
            };

            counter!(METRICS_DIAL_BACK_COUNT).increment(1);
            let queue = self.queue.clone();
            let handshake_timeout = self.handshake_timeout;
            tracker.spawn(async move {
                let res = handle_dial_back(queue, stream, remote, handshake_timeout).await;
                if res.is_err() {
                    counter!(METRICS_DIAL_BACK_ERROR_COUNT).increment(1);
                }
                res.print_on_err("[ConnectionPooler] dial-back");
            });
        }

        log::info!("[ConnectionPooler] stopped accepting, waiting {} dial-back handshakes", tracker.len());
        tracker.close();
        tracker.wait().await;
        Ok(())
    }
}

async fn handle_dial_back(queue: Arc<ConnectionQueue<TcpStream>>, mut stream: TcpStream, remote: SocketAddr, handshake_timeout: Duration) -> anyhow::Result<()> {
    let id = tokio::time::timeout(handshake_timeout, read_dial_back_header(&mut stream))
        .await
        .map_err(|_| anyhow!("dial-back header from {remote} timeout"))??;

    match queue.add_connection(id, Ok(stream)) {
        Ok(()) => log::info!("[ConnectionPooler] dial-back from {remote} matched request {id}"),
        Err(e) => {
            counter!(METRICS_DIAL_BACK_ORPHAN_COUNT).increment(1);
            log::warn!("[ConnectionPooler] dial-back from {remote} dropped: {e}");
        }
    }
    Ok(())
}

impl PoolerRequester {
    /// Park a rendezvous. Must happen before the matching connect command is sent.
    pub fn wait_for_conn(&self) -> PendingConn<TcpStream> {
        PendingConn::new(self.queue.clone())
    }

    /// Resolve a parked rendezvous with an error instead of a connection.
    pub fn reject(&self, id: RendezvousId, err: ExchangeError) -> Result<(), ExchangeError> {
        self.queue.add_connection(id, Err(err))
    }

    pub fn is_waiting(&self, id: RendezvousId) -> bool {
        self.queue.contains(id)
    }

    pub fn pending_count(&self) -> usize {
        self.queue.len()
    }
}

impl<S> PendingConn<S> {
    pub fn new(queue: Arc<ConnectionQueue<S>>) -> Self {
        let (id, rx) = queue.add_request();
        Self { id, rx, queue }
    }

    pub fn id(&self) -> RendezvousId {
        self.id
    }

    pub async fn wait(mut self, deadline: Instant, cancel: &CancellationToken) -> ConnResult<S> {
        select! {
            biased;
            res = &mut self.rx => res.unwrap_or(Err(ExchangeError::ConnReqNotFound(self.id))),
            _ = cancel.cancelled() => Err(ExchangeError::Cancelled),
            _ = sleep_until(deadline) => Err(ExchangeError::Timeout(self.id)),
        }
    }
}

impl<S> Drop for PendingConn<S> {
    fn drop(&mut self) {
        if self.queue.remove_request(self.id) {
            log::debug!("[PendingConn] request {} abandoned => evicted", self.id);
        }
    }
}
