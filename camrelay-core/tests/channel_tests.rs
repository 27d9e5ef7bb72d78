//! Channel state machine tests over a recording backend

use bytes::Bytes;
use tokio_test::{assert_err, assert_ok};
use camrelay_core::{
    Channel, ChannelBackend, ChannelEvent, ChannelEventKind, ChannelSignal, ChannelState,
    ConnectionId, RelayError,
};

#[derive(Debug, Clone, PartialEq)]
enum Call {
    Open(ConnectionId, String),
    Send(ConnectionId, Bytes),
    Close(ConnectionId),
}

#[derive(Debug, Default)]
struct RecordingBackend {
    calls: Vec<Call>,
    refuse_open: bool,
    // Sends accepted before the backend reports a full queue
    queue: Option<usize>,
}

impl ChannelBackend for RecordingBackend {
    fn open(&mut self, connection: ConnectionId, url: &str) -> Result<(), RelayError> {
        if self.refuse_open {
            return Err(RelayError::Connection {
                endpoint: url.to_string(),
                reason: "refused".to_string(),
            });
        }
        self.calls.push(Call::Open(connection, url.to_string()));
        Ok(())
    }

    fn send(&mut self, connection: ConnectionId, data: Bytes) -> Result<(), RelayError> {
        let queued = self.calls.iter().filter(|c| matches!(c, Call::Send(..))).count();
        if let Some(capacity) = self.queue.filter(|&capacity| queued >= capacity) {
            return Err(RelayError::Congested {
                endpoint: URL.to_string(),
                capacity,
            });
        }
        self.calls.push(Call::Send(connection, data));
        Ok(())
    }

    fn close(&mut self, connection: ConnectionId) {
        self.calls.push(Call::Close(connection));
    }
}

const URL: &str = "ws://localhost:8888/ws/video";

fn opened_channel() -> (Channel<RecordingBackend>, ConnectionId) {
    let mut channel = Channel::new(RecordingBackend::default());
    let id = channel.connect(URL).unwrap();
    assert_eq!(
        channel.accept(ChannelEvent::new(id, ChannelEventKind::Opened)),
        Some(ChannelSignal::Opened)
    );
    (channel, id)
}

// ---------------------------------------------------------------------------
// Connection lifecycle
// ---------------------------------------------------------------------------

#[test]
fn test_connect_then_open() {
    let mut channel = Channel::new(RecordingBackend::default());
    assert_eq!(channel.state(), ChannelState::Closed);

    let id = channel.connect(URL).unwrap();
    assert_eq!(channel.state(), ChannelState::Connecting);
    assert_eq!(channel.connection(), Some(id));
    assert_eq!(channel.endpoint(), Some(URL));
    assert_eq!(channel.backend().calls, vec![Call::Open(id, URL.to_string())]);

    channel.accept(ChannelEvent::new(id, ChannelEventKind::Opened));
    assert!(channel.is_open());
    assert_eq!(channel.stats().opens, 1);
}

#[test]
fn test_connect_while_connecting_reuses_connection() {
    let mut channel = Channel::new(RecordingBackend::default());
    let first = channel.connect(URL).unwrap();
    let second = channel.connect(URL).unwrap();

    assert_eq!(first, second);
    assert_eq!(channel.backend().calls.len(), 1);
    assert_eq!(channel.stats().connects, 1);
}

#[test]
fn test_refused_open_leaves_channel_closed() {
    let mut channel = Channel::new(RecordingBackend {
        refuse_open: true,
        ..Default::default()
    });

    let err = channel.connect(URL).unwrap_err();
    assert_eq!(err.error_code(), "CONNECTION_FAILED");
    assert_eq!(channel.state(), ChannelState::Closed);
    assert_eq!(channel.connection(), None);
}

#[test]
fn test_close_is_idempotent() {
    let (mut channel, id) = opened_channel();

    assert!(channel.close());
    assert_eq!(channel.state(), ChannelState::Closing);
    assert!(!channel.close());

    let closes = channel
        .backend()
        .calls
        .iter()
        .filter(|c| matches!(c, Call::Close(_)))
        .count();
    assert_eq!(closes, 1);

    let signal = channel.accept(ChannelEvent::new(
        id,
        ChannelEventKind::Closed {
            code: Some(1000),
            reason: String::new(),
        },
    ));
    assert_eq!(
        signal,
        Some(ChannelSignal::Closed {
            code: Some(1000),
            reason: String::new(),
            was_open: false,
        })
    );
    assert_eq!(channel.state(), ChannelState::Closed);
    assert!(!channel.close());
}

#[test]
fn test_peer_close_while_open() {
    let (mut channel, id) = opened_channel();

    let signal = channel.accept(ChannelEvent::new(
        id,
        ChannelEventKind::Closed {
            code: Some(1011),
            reason: "server restart".to_string(),
        },
    ));

    match signal {
        Some(ChannelSignal::Closed { was_open, code, .. }) => {
            assert!(was_open);
            assert_eq!(code, Some(1011));
        }
        other => panic!("Expected close signal, got {:?}", other),
    }
    assert_eq!(channel.connection(), None);
}

// ---------------------------------------------------------------------------
// Sending and receiving
// ---------------------------------------------------------------------------

#[test]
fn test_send_requires_open() {
    let mut channel = Channel::new(RecordingBackend::default());
    let err = assert_err!(channel.send(Bytes::from_static(b"chunk")));
    assert_eq!(err.error_code(), "INVALID_STATE");

    assert_ok!(channel.connect(URL));
    assert_err!(channel.send(Bytes::from_static(b"chunk")));
    assert_eq!(channel.stats().messages_sent, 0);
}

#[test]
fn test_send_when_open() {
    let (mut channel, id) = opened_channel();
    assert_ok!(channel.send(Bytes::from_static(b"abc")));

    assert_eq!(
        channel.backend().calls.last(),
        Some(&Call::Send(id, Bytes::from_static(b"abc")))
    );
    assert_eq!(channel.stats().bytes_sent, 3);
}

#[test]
fn test_full_send_queue_counts_as_drop() {
    let (mut channel, _) = opened_channel();
    channel.backend_mut().queue = Some(1);

    assert_ok!(channel.send(Bytes::from_static(b"first")));
    let err = assert_err!(channel.send(Bytes::from_static(b"second")));
    assert_eq!(err.error_code(), "SEND_QUEUE_FULL");
    assert!(!err.is_fatal());

    // Still open; only the message was lost
    assert!(channel.is_open());
    assert_eq!(channel.stats().messages_sent, 1);
    assert_eq!(channel.stats().messages_dropped, 1);
}

#[test]
fn test_messages_delivered_in_order() {
    let (mut channel, id) = opened_channel();

    let received: Vec<Bytes> = (0u8..5)
        .filter_map(|i| {
            match channel.accept(ChannelEvent::new(
                id,
                ChannelEventKind::Message(Bytes::from(vec![i])),
            )) {
                Some(ChannelSignal::Message(data)) => Some(data),
                _ => None,
            }
        })
        .collect();

    assert_eq!(received.len(), 5);
    for (i, data) in received.iter().enumerate() {
        assert_eq!(data.as_ref(), &[i as u8]);
    }
    assert_eq!(channel.stats().messages_received, 5);
}

#[test]
fn test_error_does_not_change_state() {
    let (mut channel, id) = opened_channel();
    let signal = channel.accept(ChannelEvent::new(
        id,
        ChannelEventKind::Error("broken pipe".to_string()),
    ));
    assert_eq!(signal, Some(ChannelSignal::Error("broken pipe".to_string())));
    assert!(channel.is_open());
}

// ---------------------------------------------------------------------------
// Stale connections
// ---------------------------------------------------------------------------

#[test]
fn test_events_from_replaced_connection_are_ignored() {
    let (mut channel, old) = opened_channel();
    channel.close();

    let new = channel.connect(URL).unwrap();
    assert_ne!(old, new);
    assert_eq!(channel.state(), ChannelState::Connecting);

    let late_close = ChannelEvent::new(
        old,
        ChannelEventKind::Closed {
            code: Some(1000),
            reason: String::new(),
        },
    );
    assert_eq!(channel.accept(late_close), None);
    assert_eq!(channel.state(), ChannelState::Connecting);

    let late_frame = ChannelEvent::new(old, ChannelEventKind::Message(Bytes::from_static(b"x")));
    assert_eq!(channel.accept(late_frame), None);
    assert_eq!(channel.stats().stale_events, 2);

    channel.accept(ChannelEvent::new(new, ChannelEventKind::Opened));
    assert!(channel.is_open());
}

#[test]
fn test_open_after_local_close_is_ignored() {
    let mut channel = Channel::new(RecordingBackend::default());
    let id = channel.connect(URL).unwrap();
    channel.close();

    assert_eq!(
        channel.accept(ChannelEvent::new(id, ChannelEventKind::Opened)),
        None
    );
    assert_eq!(channel.state(), ChannelState::Closing);
}
