//! # camrelay core
//!
//! Transport plumbing for camrelay: the duplex binary channel to the
//! processing endpoint, endpoint derivation from the page location, one-shot
//! continuations and the shared error taxonomy.

#![deny(missing_docs)]
#![warn(clippy::all)]

pub mod channel;
pub mod continuation;
pub mod endpoint;
pub mod error;
pub mod transport;

// Re-export main types
pub use channel::{
    Channel, ChannelBackend, ChannelEvent, ChannelEventKind, ChannelSignal, ChannelState,
    ChannelStats, ConnectionId,
};
pub use continuation::PendingContinuations;
pub use endpoint::{derive_endpoint, is_secure, DEFAULT_WS_PATH};
pub use error::{EncoderFaultKind, RelayError};
pub use transport::{ConnectionConfig, ConnectionMetrics, WebSocketBackend, DEFAULT_SEND_QUEUE};
