use protocol::RendezvousId;

#[derive(Debug, thiserror::Error, Clone, PartialEq, Eq)]
pub enum ExchangeError {
    #[error("service {0} not found")]
    ServiceNotFound(String),
    #[error("connection request {0} not found")]
    ConnReqNotFound(RendezvousId),
    #[error("command for service {got} delivered to registration of {expected}")]
    Mismatch { expected: String, got: String },
    #[error("service {0} is gone")]
    ServiceGone(String),
    #[error("connection request {0} timed out")]
    Timeout(RendezvousId),
    #[error("request cancelled")]
    Cancelled,
    #[error("control stream failure: {0}")]
    Transport(String),
}

/// Outcome delivered to a rendezvous waiter.
pub type ConnResult<S> = Result<S, ExchangeError>;
