//! Duplex binary channel to the remote endpoint
//!
//! [`Channel`] is a pure state machine: it asks a [`ChannelBackend`] to open,
//! send and close, and learns about the outcome through [`ChannelEvent`]s fed
//! back by the owner's event loop. Every connection attempt gets a fresh
//! [`ConnectionId`]; events carrying any other id are stale and ignored, so at
//! most one connection is ever live.

use crate::error::RelayError;
use bytes::Bytes;
use tracing::{debug, info};
use uuid::Uuid;

/// Identifier of a single connection attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionId(Uuid);

impl ConnectionId {
    /// Generate a fresh connection id
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Underlying uuid
    pub fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Connection state of the channel
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub enum ChannelState {
    /// No live connection
    Closed,
    /// Connection requested, not yet open
    Connecting,
    /// Connection open, sends are allowed
    Open,
    /// Close requested, waiting for the transport to confirm
    Closing,
}

/// What happened on a connection
#[derive(Debug, Clone, PartialEq)]
pub enum ChannelEventKind {
    /// The connection is open
    Opened,
    /// One inbound binary message
    Message(Bytes),
    /// Transport reported an error; closure is reported separately
    Error(String),
    /// The connection is gone
    Closed {
        /// Close code, if the peer sent one
        code: Option<u16>,
        /// Close reason
        reason: String,
    },
}

/// Event reported by a backend for one connection
#[derive(Debug, Clone, PartialEq)]
pub struct ChannelEvent {
    /// Connection the event belongs to
    pub connection: ConnectionId,
    /// What happened
    pub kind: ChannelEventKind,
}

impl ChannelEvent {
    /// Create a new event
    pub fn new(connection: ConnectionId, kind: ChannelEventKind) -> Self {
        Self { connection, kind }
    }
}

/// Transport used by a [`Channel`].
///
/// Calls return immediately; completion and inbound traffic are reported as
/// [`ChannelEvent`]s.
pub trait ChannelBackend: Send {
    /// Start opening a connection to `url`
    fn open(&mut self, connection: ConnectionId, url: &str) -> Result<(), RelayError>;

    /// Queue one binary message on an open connection
    fn send(&mut self, connection: ConnectionId, data: Bytes) -> Result<(), RelayError>;

    /// Start closing a connection
    fn close(&mut self, connection: ConnectionId);
}

impl<T: ChannelBackend + ?Sized> ChannelBackend for Box<T> {
    fn open(&mut self, connection: ConnectionId, url: &str) -> Result<(), RelayError> {
        (**self).open(connection, url)
    }

    fn send(&mut self, connection: ConnectionId, data: Bytes) -> Result<(), RelayError> {
        (**self).send(connection, data)
    }

    fn close(&mut self, connection: ConnectionId) {
        (**self).close(connection)
    }
}

/// Outcome of applying an event to the channel
#[derive(Debug, Clone, PartialEq)]
pub enum ChannelSignal {
    /// Transitioned Connecting → Open
    Opened,
    /// Inbound message, in arrival order
    Message(Bytes),
    /// Transport error; the state is unchanged
    Error(String),
    /// Transitioned to Closed
    Closed {
        /// Close code, if any
        code: Option<u16>,
        /// Close reason
        reason: String,
        /// Whether the connection was open when it closed
        was_open: bool,
    },
}

/// Channel counters
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChannelStats {
    /// Connection attempts
    pub connects: u64,
    /// Attempts that reached Open
    pub opens: u64,
    /// Connections that reached Closed
    pub closes: u64,
    /// Messages sent
    pub messages_sent: u64,
    /// Messages the transport refused because its queue was full
    pub messages_dropped: u64,
    /// Bytes sent
    pub bytes_sent: u64,
    /// Messages received
    pub messages_received: u64,
    /// Bytes received
    pub bytes_received: u64,
    /// Events ignored because they belonged to a replaced connection
    pub stale_events: u64,
}

/// Duplex binary channel state machine
#[derive(Debug)]
pub struct Channel<B> {
    backend: B,
    state: ChannelState,
    current: Option<ConnectionId>,
    endpoint: Option<String>,
    stats: ChannelStats,
}

impl<B: ChannelBackend> Channel<B> {
    /// Create a closed channel over `backend`
    pub fn new(backend: B) -> Self {
        Self {
            backend,
            state: ChannelState::Closed,
            current: None,
            endpoint: None,
            stats: ChannelStats::default(),
        }
    }

    /// Current state
    pub fn state(&self) -> ChannelState {
        self.state
    }

    /// Whether sends are allowed right now
    pub fn is_open(&self) -> bool {
        self.state == ChannelState::Open
    }

    /// Current connection, if any
    pub fn connection(&self) -> Option<ConnectionId> {
        self.current
    }

    /// Endpoint of the most recent connection attempt
    pub fn endpoint(&self) -> Option<&str> {
        self.endpoint.as_deref()
    }

    /// Counters
    pub fn stats(&self) -> &ChannelStats {
        &self.stats
    }

    /// Access the backend
    pub fn backend(&self) -> &B {
        &self.backend
    }

    /// Mutable access to the backend
    pub fn backend_mut(&mut self) -> &mut B {
        &mut self.backend
    }

    /// Open a new connection to `url`.
    ///
    /// While Connecting or Open this returns the current connection. While
    /// Closing, the old connection is left to finish closing and a new one is
    /// created; its late events are ignored.
    pub fn connect(&mut self, url: &str) -> Result<ConnectionId, RelayError> {
        if let (ChannelState::Connecting | ChannelState::Open, Some(current)) =
            (self.state, self.current)
        {
            debug!("Channel already {:?} on {}", self.state, current);
            return Ok(current);
        }

        let connection = ConnectionId::new();
        self.stats.connects += 1;
        self.endpoint = Some(url.to_string());

        if let Err(e) = self.backend.open(connection, url) {
            self.state = ChannelState::Closed;
            self.current = None;
            return Err(e);
        }

        info!("Connecting to {} ({})", url, connection);
        self.current = Some(connection);
        self.state = ChannelState::Connecting;
        Ok(connection)
    }

    /// Send one binary message. Only valid while Open.
    pub fn send(&mut self, data: Bytes) -> Result<(), RelayError> {
        let connection = match (self.state, self.current) {
            (ChannelState::Open, Some(connection)) => connection,
            _ => {
                return Err(RelayError::InvalidState {
                    expected: "Open".to_string(),
                    actual: format!("{:?}", self.state),
                })
            }
        };

        let len = data.len() as u64;
        if let Err(e) = self.backend.send(connection, data) {
            if matches!(e, RelayError::Congested { .. }) {
                self.stats.messages_dropped += 1;
            }
            return Err(e);
        }
        self.stats.messages_sent += 1;
        self.stats.bytes_sent += len;
        Ok(())
    }

    /// Start closing the channel. Returns `false` when already Closed or Closing.
    pub fn close(&mut self) -> bool {
        match self.state {
            ChannelState::Closed | ChannelState::Closing => false,
            ChannelState::Connecting | ChannelState::Open => {
                if let Some(connection) = self.current {
                    info!("Closing connection {}", connection);
                    self.backend.close(connection);
                }
                self.state = ChannelState::Closing;
                true
            }
        }
    }

    /// Apply a backend event. Stale events yield `None`.
    pub fn accept(&mut self, event: ChannelEvent) -> Option<ChannelSignal> {
        if Some(event.connection) != self.current {
            self.stats.stale_events += 1;
            debug!(
                "Ignoring stale event for connection {}: {:?}",
                event.connection, event.kind
            );
            return None;
        }

        match event.kind {
            ChannelEventKind::Opened => {
                if self.state != ChannelState::Connecting {
                    debug!("Ignoring open while {:?}", self.state);
                    return None;
                }
                self.state = ChannelState::Open;
                self.stats.opens += 1;
                info!("Connection {} open", event.connection);
                Some(ChannelSignal::Opened)
            }
            ChannelEventKind::Message(data) => {
                self.stats.messages_received += 1;
                self.stats.bytes_received += data.len() as u64;
                Some(ChannelSignal::Message(data))
            }
            ChannelEventKind::Error(reason) => Some(ChannelSignal::Error(reason)),
            ChannelEventKind::Closed { code, reason } => {
                let was_open = self.state == ChannelState::Open;
                self.state = ChannelState::Closed;
                self.current = None;
                self.stats.closes += 1;
                info!(
                    "Connection {} closed (code {:?}) {}",
                    event.connection, code, reason
                );
                Some(ChannelSignal::Closed {
                    code,
                    reason,
                    was_open,
                })
            }
        }
    }
}
