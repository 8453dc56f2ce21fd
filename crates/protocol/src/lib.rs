use derive_more::derive::{Deref, Display, From};
use serde::{Deserialize, Serialize};

pub mod bincode_stream;
pub mod control;
pub mod dial_back;

pub const DEFAULT_CONTROL_PORT: u16 = 9090;
pub const DEFAULT_POOL_PORT: u16 = 9091;
pub const DEFAULT_SOCKS5_PORT: u16 = 1080;

/// Token correlating a proxy-side connection request with the dial-back a service makes for it.
/// Issued by the exchange from a monotonic counter starting at 1.
#[derive(Debug, Display, Hash, PartialEq, Eq, PartialOrd, Ord, From, Deref, Clone, Copy, Serialize, Deserialize)]
pub struct RendezvousId(u64);
