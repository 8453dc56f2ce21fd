//! Glue between registrations and connection requests.

use std::time::Duration;

use metrics::{counter, gauge, histogram};
use protocol::control::{ConnectCommand, RegisterRequest};
use tokio::{net::TcpStream, select, sync::mpsc};
use tokio_util::sync::CancellationToken;

use crate::{
    control_listener::ControlStream,
    error::ExchangeError,
    pooler::PoolerRequester,
    registry::{Service, ServiceRegistry},
    METRICS_CONN_REQUEST_COUNT, METRICS_CONN_REQUEST_ERROR_COUNT, METRICS_CONN_REQUEST_HISTOGRAM, METRICS_CONN_REQUEST_TIMEOUT_COUNT, METRICS_SERVICE_COUNT, METRICS_SERVICE_LIVE,
};

pub struct ExchangeService {
    registry: ServiceRegistry,
    pooler: PoolerRequester,
    rendezvous_timeout: Duration,
    command_channel_size: usize,
}

impl ExchangeService {
    pub fn new(pooler: PoolerRequester, rendezvous_timeout: Duration, command_channel_size: usize) -> Self {
        Self {
            registry: ServiceRegistry::default(),
            pooler,
            rendezvous_timeout,
            command_channel_size: command_channel_size.max(1),
        }
    }

    pub fn pooler(&self) -> &PoolerRequester {
        &self.pooler
    }

    pub fn service_count(&self) -> usize {
        self.registry.len()
    }

    pub fn get_service(&self, name: &str) -> Result<Service, ExchangeError> {
        self.registry.get(name)
    }

    /// Register the service announced by `req` and forward its connect commands over `stream`
    /// until `cancel` fires, the peer disconnects or a send fails.
    ///
    /// Registering an already known name replaces the previous entry. The replaced registration
    /// keeps its stream open but stops receiving commands.
    pub async fn register_service<C: ControlStream>(&self, req: RegisterRequest, mut stream: C, cancel: &CancellationToken) -> Result<(), ExchangeError> {
        let (command_tx, mut command_rx) = mpsc::channel(self.command_channel_size);
        let closed = cancel.child_token();
        let _closed_guard = closed.clone().drop_guard();

        let service = Service::new(req.namespace, req.service_name, command_tx, closed.clone());
        let namespace = service.namespace().to_string();
        let name = service.name().to_string();
        let session_id = service.session_id();
        if let Some(old) = self.registry.insert(service) {
            log::warn!("[ExchangeService] service {name} session {session_id} replaced session {}", old.session_id());
        } else {
            log::info!("[ExchangeService] service {namespace}/{name} registered, session {session_id}");
        }
        counter!(METRICS_SERVICE_COUNT).increment(1);
        gauge!(METRICS_SERVICE_LIVE).increment(1.0);

        let mut detached = false;
        let res = loop {
            select! {
                _ = closed.cancelled() => {
                    log::info!("[ExchangeService] service {name} session {session_id} closed");
                    break Ok(());
                },
                _ = stream.closed() => {
                    log::info!("[ExchangeService] service {name} session {session_id} disconnected");
                    break Ok(());
                },
                cmd = command_rx.recv(), if !detached => match cmd {
                    Some(cmd) => {
                        if let Err(e) = self.forward_command(&name, &mut stream, cmd, &closed).await {
                            break Err(e);
                        }
                    }
                    None => {
                        log::info!("[ExchangeService] service {name} session {session_id} detached, no more commands");
                        detached = true;
                    }
                },
            }
        };

        closed.cancel();
        if self.registry.remove(&name, session_id) {
            log::info!("[ExchangeService] service {name} session {session_id} removed");
        }
        gauge!(METRICS_SERVICE_LIVE).decrement(1.0);
        res
    }

    async fn forward_command<C: ControlStream>(&self, name: &str, stream: &mut C, cmd: ConnectCommand, closed: &CancellationToken) -> Result<(), ExchangeError> {
        let id = cmd.id;
        if cmd.service_name != name {
            log::warn!("[ExchangeService] command {id} for {} arrived at service {name}", cmd.service_name);
            let err = ExchangeError::Mismatch {
                expected: name.to_string(),
                got: cmd.service_name,
            };
            if let Err(e) = self.pooler.reject(id, err) {
                log::debug!("[ExchangeService] reject mismatched command {id}: {e}");
            }
            return Ok(());
        }

        if !self.pooler.is_waiting(id) {
            log::debug!("[ExchangeService] skip command {id} for {name}, nobody waits for it");
            return Ok(());
        }

        select! {
            res = stream.send(&cmd) => match res {
                Ok(()) => {
                    log::debug!("[ExchangeService] sent command {id} to {name}");
                    Ok(())
                }
                Err(e) => {
                    log::error!("[ExchangeService] send command {id} to {name} error {e:?}");
                    let err = ExchangeError::Transport(e.to_string());
                    if let Err(e) = self.pooler.reject(id, err.clone()) {
                        log::debug!("[ExchangeService] reject command {id}: {e}");
                    }
                    Err(err)
                }
            },
            _ = closed.cancelled() => Ok(()),
        }
    }

    /// Obtain a fresh connection from the service registered as `name`.
    pub async fn request_conn(&self, name: &str, cancel: &CancellationToken) -> Result<TcpStream, ExchangeError> {
        counter!(METRICS_CONN_REQUEST_COUNT).increment(1);
        let started = std::time::Instant::now();
        let res = match self.registry.get(name) {
            Ok(service) => service.request_conn(&self.pooler, self.rendezvous_timeout, cancel).await,
            Err(e) => Err(e),
        };

        match &res {
            Ok(_) => {
                histogram!(METRICS_CONN_REQUEST_HISTOGRAM).record(started.elapsed().as_secs_f64());
                log::info!("[ExchangeService] got connection for {name} after {:?}", started.elapsed());
            }
            Err(e) => {
                if matches!(e, ExchangeError::Timeout(_)) {
                    counter!(METRICS_CONN_REQUEST_TIMEOUT_COUNT).increment(1);
                }
                counter!(METRICS_CONN_REQUEST_ERROR_COUNT).increment(1);
                log::warn!("[ExchangeService] request connection for {name} error {e}");
            }
        }
        res
    }
}
