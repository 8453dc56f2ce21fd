use serde::{Deserialize, Serialize};

use crate::RendezvousId;

/// First frame a service sends over a fresh control connection.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RegisterRequest {
    pub namespace: String,
    pub service_name: String,
}

/// Ask a registered service to dial back into the pool listener with `id`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ConnectCommand {
    pub namespace: String,
    pub service_name: String,
    pub id: RendezvousId,
}

/// Frames pushed from the exchange to a service.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum ControlMessage {
    Registered(Result<(), String>),
    Connect(ConnectCommand),
}
