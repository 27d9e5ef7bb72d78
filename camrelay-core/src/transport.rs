//! WebSocket transport backing the duplex channel
//!
//! Each connection runs in its own tokio task. The task owns the socket,
//! drains a bounded outbound queue fed by [`WebSocketBackend::send`] and
//! reports everything that happens as [`ChannelEvent`]s on the event sender
//! handed to the backend. A message that finds the queue full is dropped.

use crate::channel::{ChannelBackend, ChannelEvent, ChannelEventKind, ConnectionId};
use crate::error::RelayError;
use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, warn};

/// Connection configuration
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    /// Time allowed for the opening handshake
    pub timeout: Duration,
    /// Time allowed for the peer to answer a local close
    pub close_timeout: Duration,
    /// Outbound messages buffered per connection before new ones are dropped
    pub send_queue: usize,
}

/// Default outbound queue length, under a second of 100 ms chunks
pub const DEFAULT_SEND_QUEUE: usize = 8;

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(10),
            close_timeout: Duration::from_secs(2),
            send_queue: DEFAULT_SEND_QUEUE,
        }
    }
}

impl ConnectionConfig {
    /// Configuration with the given handshake timeout
    pub fn with_timeout(timeout: Duration) -> Self {
        Self {
            timeout,
            ..Self::default()
        }
    }
}

/// Transport counters shared by all connections of a backend
#[derive(Debug, Clone, Default)]
pub struct ConnectionMetrics {
    /// Connection establishment attempts
    pub connection_attempts: u32,
    /// Successful connections
    pub successful_connections: u32,
    /// Failed connection attempts
    pub failed_connections: u32,
    /// Binary frames written
    pub frames_sent: u64,
    /// Binary frames dropped because the outbound queue was full
    pub frames_dropped: u64,
    /// Payload bytes written
    pub bytes_sent: u64,
    /// Binary frames read
    pub frames_received: u64,
    /// Payload bytes read
    pub bytes_received: u64,
    /// Last connection attempt time
    pub last_attempt: Option<Instant>,
}

// Dropping `outbound` asks the task to close once queued frames are written
#[derive(Debug)]
struct ConnectionHandle {
    url: String,
    outbound: mpsc::Sender<Bytes>,
}

/// WebSocket implementation of [`ChannelBackend`]
#[derive(Debug)]
pub struct WebSocketBackend {
    config: ConnectionConfig,
    events: mpsc::UnboundedSender<ChannelEvent>,
    connections: HashMap<ConnectionId, ConnectionHandle>,
    metrics: Arc<RwLock<ConnectionMetrics>>,
}

impl WebSocketBackend {
    /// Create a backend reporting to `events`
    pub fn new(config: ConnectionConfig, events: mpsc::UnboundedSender<ChannelEvent>) -> Self {
        Self {
            config,
            events,
            connections: HashMap::new(),
            metrics: Arc::new(RwLock::new(ConnectionMetrics::default())),
        }
    }

    /// Snapshot of the transport counters
    pub fn metrics(&self) -> ConnectionMetrics {
        self.metrics.read().clone()
    }

    /// Connections whose task is still running
    pub fn active_connections(&self) -> usize {
        self.connections
            .values()
            .filter(|handle| !handle.outbound.is_closed())
            .count()
    }
}

impl ChannelBackend for WebSocketBackend {
    fn open(&mut self, connection: ConnectionId, url: &str) -> Result<(), RelayError> {
        let runtime =
            tokio::runtime::Handle::try_current().map_err(|e| RelayError::Initialization {
                reason: format!("WebSocket transport needs a tokio runtime: {}", e),
            })?;

        self.connections
            .retain(|_, handle| !handle.outbound.is_closed());

        let (outbound_tx, outbound_rx) = mpsc::channel(self.config.send_queue.max(1));
        self.connections.insert(
            connection,
            ConnectionHandle {
                url: url.to_string(),
                outbound: outbound_tx,
            },
        );

        runtime.spawn(run_connection(
            connection,
            url.to_string(),
            self.config.clone(),
            outbound_rx,
            self.events.clone(),
            self.metrics.clone(),
        ));
        Ok(())
    }

    fn send(&mut self, connection: ConnectionId, data: Bytes) -> Result<(), RelayError> {
        let handle = self
            .connections
            .get(&connection)
            .ok_or_else(|| RelayError::InvalidState {
                expected: "open connection".to_string(),
                actual: format!("unknown connection {}", connection),
            })?;

        match handle.outbound.try_send(data) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(data)) => {
                self.metrics.write().frames_dropped += 1;
                debug!(
                    "Send queue for {} full, dropping {} bytes",
                    connection,
                    data.len()
                );
                Err(RelayError::Congested {
                    endpoint: handle.url.clone(),
                    capacity: handle.outbound.max_capacity(),
                })
            }
            Err(TrySendError::Closed(_)) => Err(RelayError::Connection {
                endpoint: handle.url.clone(),
                reason: "connection task has ended".to_string(),
            }),
        }
    }

    fn close(&mut self, connection: ConnectionId) {
        match self.connections.remove(&connection) {
            Some(handle) if handle.outbound.is_closed() => {
                debug!("Connection {} already finished", connection);
            }
            Some(_) => debug!("Closing connection {} after queued frames", connection),
            None => {}
        }
    }
}

async fn run_connection(
    connection: ConnectionId,
    url: String,
    config: ConnectionConfig,
    mut outbound: mpsc::Receiver<Bytes>,
    events: mpsc::UnboundedSender<ChannelEvent>,
    metrics: Arc<RwLock<ConnectionMetrics>>,
) {
    let emit = |kind: ChannelEventKind| {
        if events.send(ChannelEvent::new(connection, kind)).is_err() {
            debug!("Event receiver gone for connection {}", connection);
        }
    };

    {
        let mut m = metrics.write();
        m.connection_attempts += 1;
        m.last_attempt = Some(Instant::now());
    }

    let ws_stream = match tokio::time::timeout(config.timeout, connect_async(url.as_str())).await {
        Ok(Ok((ws_stream, _response))) => ws_stream,
        Ok(Err(e)) => {
            metrics.write().failed_connections += 1;
            warn!("WebSocket connection to {} failed: {}", url, e);
            emit(ChannelEventKind::Error(e.to_string()));
            emit(ChannelEventKind::Closed {
                code: None,
                reason: e.to_string(),
            });
            return;
        }
        Err(_) => {
            metrics.write().failed_connections += 1;
            let reason = format!("connection timed out after {:?}", config.timeout);
            warn!("WebSocket connection to {}: {}", url, reason);
            emit(ChannelEventKind::Error(reason.clone()));
            emit(ChannelEventKind::Closed { code: None, reason });
            return;
        }
    };

    metrics.write().successful_connections += 1;
    info!("WebSocket connected to {}", url);
    emit(ChannelEventKind::Opened);

    let (mut sink, mut stream) = ws_stream.split();
    let mut close_deadline: Option<tokio::time::Instant> = None;

    let (code, reason) = loop {
        tokio::select! {
            next = outbound.recv(), if close_deadline.is_none() => match next {
                Some(data) => {
                    let len = data.len() as u64;
                    if let Err(e) = sink.send(Message::Binary(data.to_vec())).await {
                        emit(ChannelEventKind::Error(e.to_string()));
                        break (None, e.to_string());
                    }
                    let mut m = metrics.write();
                    m.frames_sent += 1;
                    m.bytes_sent += len;
                }
                None => {
                    let frame = CloseFrame {
                        code: CloseCode::Normal,
                        reason: "".into(),
                    };
                    if let Err(e) = sink.send(Message::Close(Some(frame))).await {
                        debug!("Close frame not delivered on {}: {}", connection, e);
                        break (Some(u16::from(CloseCode::Normal)), String::new());
                    }
                    close_deadline = Some(tokio::time::Instant::now() + config.close_timeout);
                }
            },
            inbound = stream.next() => match inbound {
                Some(Ok(Message::Binary(data))) => {
                    {
                        let mut m = metrics.write();
                        m.frames_received += 1;
                        m.bytes_received += data.len() as u64;
                    }
                    emit(ChannelEventKind::Message(Bytes::from(data)));
                }
                Some(Ok(Message::Text(text))) => {
                    debug!("Ignoring {} byte text message on {}", text.len(), connection);
                }
                Some(Ok(Message::Close(frame))) => {
                    break match frame {
                        Some(frame) => (Some(u16::from(frame.code)), frame.reason.to_string()),
                        None => (None, String::new()),
                    };
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    if close_deadline.is_some() {
                        break (Some(u16::from(CloseCode::Normal)), String::new());
                    }
                    emit(ChannelEventKind::Error(e.to_string()));
                    break (None, e.to_string());
                }
                None => break (None, "connection ended".to_string()),
            },
            _ = tokio::time::sleep_until(close_deadline.unwrap_or_else(tokio::time::Instant::now)),
                if close_deadline.is_some() =>
            {
                debug!("Peer did not answer close on {}", connection);
                break (Some(u16::from(CloseCode::Normal)), String::new());
            }
        }
    };

    if let Err(e) = sink.close().await {
        debug!("Sink close on {}: {}", connection, e);
    }
    emit(ChannelEventKind::Closed { code, reason });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = ConnectionConfig::default();
        assert_eq!(config.timeout, Duration::from_secs(10));
        assert!(config.close_timeout < config.timeout);

        let config = ConnectionConfig::with_timeout(Duration::from_millis(250));
        assert_eq!(config.timeout, Duration::from_millis(250));
    }

    #[test]
    fn test_open_requires_runtime() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let mut backend = WebSocketBackend::new(ConnectionConfig::default(), tx);
        let err = backend
            .open(ConnectionId::new(), "ws://127.0.0.1:1/ws/video")
            .unwrap_err();
        assert_eq!(err.error_code(), "INITIALIZATION_FAILED");
    }

    #[test]
    fn test_send_to_unknown_connection() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let mut backend = WebSocketBackend::new(ConnectionConfig::default(), tx);
        let err = backend
            .send(ConnectionId::new(), Bytes::from_static(b"chunk"))
            .unwrap_err();
        assert_eq!(err.error_code(), "INVALID_STATE");
    }
}
