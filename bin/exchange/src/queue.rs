//! Rendezvous table: maps a request id to the one-shot slot its waiter listens on.

use std::collections::HashMap;

use parking_lot::Mutex;
use protocol::RendezvousId;
use tokio::sync::oneshot;

use crate::error::{ConnResult, ExchangeError};

struct QueueInternal<S> {
    current_id: u64,
    store: HashMap<RendezvousId, oneshot::Sender<ConnResult<S>>>,
}

pub struct ConnectionQueue<S> {
    internal: Mutex<QueueInternal<S>>,
}

impl<S> Default for ConnectionQueue<S> {
    fn default() -> Self {
        Self {
            internal: Mutex::new(QueueInternal {
                current_id: 0,
                store: HashMap::new(),
            }),
        }
    }
}

impl<S> ConnectionQueue<S> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocate the next id and park a slot for it. Ids start at 1 and never repeat.
    pub fn add_request(&self) -> (RendezvousId, oneshot::Receiver<ConnResult<S>>) {
        let (tx, rx) = oneshot::channel();
        let mut internal = self.internal.lock();
        internal.current_id += 1;
        let id: RendezvousId = internal.current_id.into();
        internal.store.insert(id, tx);
        (id, rx)
    }

    /// Resolve the slot of `id` exactly once. An unknown id, an already resolved id or a waiter
    /// which already gave up all return `ConnReqNotFound` and `result` is dropped.
    pub fn add_connection(&self, id: RendezvousId, result: ConnResult<S>) -> Result<(), ExchangeError> {
        let tx = self.internal.lock().store.remove(&id).ok_or(ExchangeError::ConnReqNotFound(id))?;
        tx.send(result).map_err(|_| ExchangeError::ConnReqNotFound(id))
    }

    pub fn remove_request(&self, id: RendezvousId) -> bool {
        self.internal.lock().store.remove(&id).is_some()
    }

    pub fn contains(&self, id: RendezvousId) -> bool {
        self.internal.lock().store.contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.internal.lock().store.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
