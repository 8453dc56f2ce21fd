use std::{
    collections::HashMap,
    sync::atomic::{AtomicU64, Ordering},
    time::Duration,
};

use derive_more::derive::{Deref, Display, From};
use parking_lot::RwLock;
use protocol::control::ConnectCommand;
use tokio::{net::TcpStream, select, sync::mpsc, time::Instant};
use tokio_util::sync::CancellationToken;

use crate::{error::ExchangeError, pooler::PoolerRequester};

/// Distinguishes successive registrations of the same service name.
#[derive(Debug, Display, Hash, PartialEq, Eq, From, Deref, Clone, Copy)]
pub struct ServiceSessionId(u64);

impl ServiceSessionId {
    pub fn next() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        Self(NEXT.fetch_add(1, Ordering::Relaxed))
    }
}

/// Handle to one live registration. The command receiver is owned by the registration's forwarder.
#[derive(Debug, Clone)]
pub struct Service {
    namespace: String,
    name: String,
    session_id: ServiceSessionId,
    command_tx: mpsc::Sender<ConnectCommand>,
    closed: CancellationToken,
}

impl Service {
    pub fn new(namespace: String, name: String, command_tx: mpsc::Sender<ConnectCommand>, closed: CancellationToken) -> Self {
        Self {
            namespace,
            name,
            session_id: ServiceSessionId::next(),
            command_tx,
            closed,
        }
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn session_id(&self) -> ServiceSessionId {
        self.session_id
    }

    #[cfg(test)]
    pub(crate) fn command_tx(&self) -> &mpsc::Sender<ConnectCommand> {
        &self.command_tx
    }

    /// Ask this service for a new connection and wait for its dial-back.
    ///
    /// The rendezvous is parked before the command is queued, so the service can never dial back
    /// before its id is known. One deadline covers both the queueing and the wait.
    pub async fn request_conn(&self, pooler: &PoolerRequester, timeout: Duration, cancel: &CancellationToken) -> Result<TcpStream, ExchangeError> {
        let deadline = Instant::now() + timeout;
        let pending = pooler.wait_for_conn();
        let id = pending.id();
        let cmd = ConnectCommand {
            namespace: self.namespace.clone(),
            service_name: self.name.clone(),
            id,
        };

        select! {
            biased;
            _ = cancel.cancelled() => return Err(ExchangeError::Cancelled),
            _ = self.closed.cancelled() => return Err(ExchangeError::ServiceGone(self.name.clone())),
            _ = tokio::time::sleep_until(deadline) => return Err(ExchangeError::Timeout(id)),
            sent = self.command_tx.send(cmd) => {
                if sent.is_err() {
                    return Err(ExchangeError::ServiceGone(self.name.clone()));
                }
            }
        }
        log::debug!("[Service {}/{}] queued connect command {id}", self.namespace, self.name);

        // a result already delivered wins over the registration ending right after
        select! {
            biased;
            res = pending.wait(deadline, cancel) => res,
            _ = self.closed.cancelled() => Err(ExchangeError::ServiceGone(self.name.clone())),
        }
    }
}

/// Live services keyed by name.
#[derive(Default)]
pub struct ServiceRegistry {
    services: RwLock<HashMap<String, Service>>,
}

impl ServiceRegistry {
    /// Insert `service`, returning the registration it replaced if any.
    pub fn insert(&self, service: Service) -> Option<Service> {
        self.services.write().insert(service.name.clone(), service)
    }

    pub fn get(&self, name: &str) -> Result<Service, ExchangeError> {
        self.services.read().get(name).cloned().ok_or_else(|| ExchangeError::ServiceNotFound(name.to_string()))
    }

    /// Remove the entry for `name` only if it still belongs to `session_id`.
    pub fn remove(&self, name: &str, session_id: ServiceSessionId) -> bool {
        let mut services = self.services.write();
        match services.get(name) {
            Some(current) if current.session_id == session_id => {
                services.remove(name);
                true
            }
            _ => false,
        }
    }

    pub fn len(&self) -> usize {
        self.services.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
