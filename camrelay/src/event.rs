//! Session inputs and status events

use camrelay_core::{ChannelEvent, ChannelState};
use camrelay_media::{CaptureEvent, CaptureState, RecorderEvent};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::debug;

/// Asynchronous completion delivered to the session controller
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    /// Capture device answered or a stream ended
    Capture(CaptureEvent),
    /// Recorder produced a chunk, faulted or stopped
    Recorder(RecorderEvent),
    /// Channel opened, received, errored or closed
    Channel(ChannelEvent),
}

impl From<CaptureEvent> for SessionEvent {
    fn from(event: CaptureEvent) -> Self {
        SessionEvent::Capture(event)
    }
}

impl From<RecorderEvent> for SessionEvent {
    fn from(event: RecorderEvent) -> Self {
        SessionEvent::Recorder(event)
    }
}

impl From<ChannelEvent> for SessionEvent {
    fn from(event: ChannelEvent) -> Self {
        SessionEvent::Channel(event)
    }
}

/// Session phase, derived from subsystem state and pending work
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionPhase {
    /// Not recording and not waiting for anything
    Stopped,
    /// Start requested, waiting for the capture device
    AwaitingCapture,
    /// Capture ready, waiting for the channel to open
    AwaitingConnection,
    /// Chunks are flowing to the channel
    Recording,
}

impl std::fmt::Display for SessionPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            SessionPhase::Stopped => "stopped",
            SessionPhase::AwaitingCapture => "awaiting_capture",
            SessionPhase::AwaitingConnection => "awaiting_connection",
            SessionPhase::Recording => "recording",
        };
        f.write_str(name)
    }
}

/// Why an outbound chunk did not reach the wire
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DropReason {
    /// Chunk had no data
    Empty,
    /// Channel was not open
    NotOpen,
    /// Encoder had already stopped or faulted
    Inactive,
    /// Transport send queue was full
    Congested,
}

/// Observable session activity
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StatusEvent {
    /// The derived session phase changed
    PhaseChanged {
        /// Previous phase
        from: SessionPhase,
        /// New phase
        to: SessionPhase,
    },
    /// Capture source changed state
    CaptureChanged {
        /// New capture state
        state: CaptureState,
    },
    /// Channel changed state
    ChannelChanged {
        /// New channel state
        state: ChannelState,
    },
    /// A chunk was handed to the channel
    ChunkSent {
        /// Chunk size in bytes
        bytes: usize,
    },
    /// A chunk was discarded
    ChunkDropped {
        /// Why it was discarded
        reason: DropReason,
    },
    /// An inbound frame was shown
    FrameDisplayed {
        /// Display handle of the frame
        handle: u64,
    },
    /// An inbound frame arrived while a render was pending
    FrameDropped,
    /// An inbound frame could not be decoded
    FrameRejected,
    /// A notification went to the notify sink
    Notified {
        /// Notification title
        title: String,
        /// Notification body
        body: String,
    },
}

impl StatusEvent {
    /// Get the event type as a string
    pub fn event_type(&self) -> &'static str {
        match self {
            StatusEvent::PhaseChanged { .. } => "phase_changed",
            StatusEvent::CaptureChanged { .. } => "capture_changed",
            StatusEvent::ChannelChanged { .. } => "channel_changed",
            StatusEvent::ChunkSent { .. } => "chunk_sent",
            StatusEvent::ChunkDropped { .. } => "chunk_dropped",
            StatusEvent::FrameDisplayed { .. } => "frame_displayed",
            StatusEvent::FrameDropped => "frame_dropped",
            StatusEvent::FrameRejected => "frame_rejected",
            StatusEvent::Notified { .. } => "notified",
        }
    }

    /// Whether this is outbound chunk traffic
    pub fn is_chunk_event(&self) -> bool {
        matches!(
            self,
            StatusEvent::ChunkSent { .. } | StatusEvent::ChunkDropped { .. }
        )
    }

    /// Whether this is inbound frame traffic
    pub fn is_frame_event(&self) -> bool {
        matches!(
            self,
            StatusEvent::FrameDisplayed { .. }
                | StatusEvent::FrameDropped
                | StatusEvent::FrameRejected
        )
    }

    /// Whether this reports a lifecycle change
    pub fn is_lifecycle_event(&self) -> bool {
        matches!(
            self,
            StatusEvent::PhaseChanged { .. }
                | StatusEvent::CaptureChanged { .. }
                | StatusEvent::ChannelChanged { .. }
        )
    }

    /// Whether this is a user-facing notification
    pub fn is_notification(&self) -> bool {
        matches!(self, StatusEvent::Notified { .. })
    }
}

/// Timestamped status event
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusUpdate {
    /// When the event was emitted
    pub at: DateTime<Utc>,
    /// What happened
    #[serde(flatten)]
    pub event: StatusEvent,
}

impl StatusUpdate {
    /// Stamp `event` with the current time
    pub fn now(event: StatusEvent) -> Self {
        Self {
            at: Utc::now(),
            event,
        }
    }
}

/// Subscriber side of the status broadcast.
///
/// Slow subscribers skip what they missed rather than stall the session.
#[derive(Debug)]
pub struct StatusStream {
    receiver: broadcast::Receiver<StatusUpdate>,
    filter: StatusFilter,
    closed: bool,
}

impl StatusStream {
    /// Wrap a broadcast receiver
    pub fn new(receiver: broadcast::Receiver<StatusUpdate>) -> Self {
        Self {
            receiver,
            filter: StatusFilter::all(),
            closed: false,
        }
    }

    /// Only yield events accepted by `filter`
    pub fn with_filter(mut self, filter: StatusFilter) -> Self {
        self.filter = filter;
        self
    }

    /// Next matching event, or `None` once the session is gone
    pub async fn next(&mut self) -> Option<StatusUpdate> {
        if self.closed {
            return None;
        }
        loop {
            match self.receiver.recv().await {
                Ok(update) if self.filter.should_include(&update.event) => return Some(update),
                Ok(_) => {}
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    debug!("Status subscriber lagged, skipped {} events", skipped);
                }
                Err(broadcast::error::RecvError::Closed) => {
                    self.closed = true;
                    return None;
                }
            }
        }
    }

    /// Next matching event without waiting
    pub fn try_next(&mut self) -> Result<Option<StatusUpdate>, broadcast::error::TryRecvError> {
        if self.closed {
            return Err(broadcast::error::TryRecvError::Closed);
        }
        loop {
            match self.receiver.try_recv() {
                Ok(update) if self.filter.should_include(&update.event) => return Ok(Some(update)),
                Ok(_) => {}
                Err(broadcast::error::TryRecvError::Empty) => return Ok(None),
                Err(broadcast::error::TryRecvError::Lagged(skipped)) => {
                    debug!("Status subscriber lagged, skipped {} events", skipped);
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Stop yielding events
    pub fn close(&mut self) {
        self.closed = true;
    }

    /// Whether the stream has been closed
    pub fn is_closed(&self) -> bool {
        self.closed
    }
}

/// Selects which status events a stream yields
#[derive(Debug, Clone)]
pub struct StatusFilter {
    /// Phase, capture and channel changes
    pub include_lifecycle: bool,
    /// Chunk sent and dropped
    pub include_chunks: bool,
    /// Frame displayed, dropped and rejected
    pub include_frames: bool,
    /// Notifications
    pub include_notifications: bool,
}

impl StatusFilter {
    /// Every event
    pub fn all() -> Self {
        Self {
            include_lifecycle: true,
            include_chunks: true,
            include_frames: true,
            include_notifications: true,
        }
    }

    /// Lifecycle changes and notifications only
    pub fn quiet() -> Self {
        Self {
            include_lifecycle: true,
            include_chunks: false,
            include_frames: false,
            include_notifications: true,
        }
    }

    /// Check if an event passes the filter
    pub fn should_include(&self, event: &StatusEvent) -> bool {
        (self.include_lifecycle && event.is_lifecycle_event())
            || (self.include_chunks && event.is_chunk_event())
            || (self.include_frames && event.is_frame_event())
            || (self.include_notifications && event.is_notification())
    }
}

impl Default for StatusFilter {
    fn default() -> Self {
        Self::all()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_types_and_categories() {
        let sent = StatusEvent::ChunkSent { bytes: 12 };
        assert_eq!(sent.event_type(), "chunk_sent");
        assert!(sent.is_chunk_event());
        assert!(!sent.is_lifecycle_event());

        let phase = StatusEvent::PhaseChanged {
            from: SessionPhase::Stopped,
            to: SessionPhase::AwaitingCapture,
        };
        assert!(phase.is_lifecycle_event());
        assert!(StatusFilter::quiet().should_include(&phase));
        assert!(!StatusFilter::quiet().should_include(&StatusEvent::FrameDropped));
    }

    #[test]
    fn test_update_serializes_flat() {
        let update = StatusUpdate::now(StatusEvent::ChunkDropped {
            reason: DropReason::NotOpen,
        });
        let json = serde_json::to_value(&update).unwrap();
        assert_eq!(json["type"], "chunk_dropped");
        assert_eq!(json["reason"], "not_open");
        assert!(json["at"].is_string());
    }

    #[tokio::test]
    async fn test_stream_filters_and_ends() {
        let (tx, rx) = broadcast::channel(8);
        let mut stream = StatusStream::new(rx).with_filter(StatusFilter::quiet());

        tx.send(StatusUpdate::now(StatusEvent::FrameDropped)).unwrap();
        tx.send(StatusUpdate::now(StatusEvent::Notified {
            title: "Connection Error".to_string(),
            body: "Connection error: refused".to_string(),
        }))
        .unwrap();
        drop(tx);

        let update = stream.next().await.unwrap();
        assert_eq!(update.event.event_type(), "notified");
        assert!(stream.next().await.is_none());
        assert!(stream.is_closed());
    }
}
