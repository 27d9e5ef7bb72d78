//! Chunk encoder
//!
//! Wraps a [`Recorder`] bound to one live stream. Recorders emit encoded
//! chunks on a fixed interval as [`RecorderEvent`]s; the encoder decides
//! which of them reach the channel. A chunk is forwarded only when it is
//! non-empty, the encoder is still Recording and the channel is open at the
//! moment it arrives, otherwise it is dropped.

use crate::capture::{MediaStream, StreamId};
use crate::format::EncodingFormat;
use bytes::Bytes;
use camrelay_core::EncoderFaultKind;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Default chunk interval
pub const DEFAULT_CHUNK_INTERVAL: Duration = Duration::from_millis(100);

/// Encoder lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EncoderState {
    /// Created, never started
    Idle,
    /// Emitting chunks
    Recording,
    /// Stopped; may be started again on the same stream
    Stopped,
    /// A fatal fault occurred; must be replaced
    Faulted,
}

/// Encoder-level fault
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncoderFault {
    /// Classification
    pub kind: EncoderFaultKind,
    /// Message from the recorder
    pub message: String,
}

impl EncoderFault {
    /// Create a fault
    pub fn new(kind: EncoderFaultKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    /// Whether this fault ends the recording
    pub fn is_fatal(&self) -> bool {
        self.kind.is_fatal()
    }

    /// Notification title
    pub fn title(&self) -> &'static str {
        match self.kind {
            EncoderFaultKind::InvalidState => "Invalid Media State Error",
            EncoderFaultKind::Security => "Media Security Error",
            EncoderFaultKind::Other => "Media Error",
        }
    }

    /// Notification body
    pub fn body(&self) -> String {
        match self.kind {
            EncoderFaultKind::InvalidState => format!(
                "You can't record the video right now. Try again later. Error: {}",
                self.message
            ),
            EncoderFaultKind::Security => format!(
                "Recording the specified source is not allowed due to security restrictions. Error: {}",
                self.message
            ),
            EncoderFaultKind::Other => format!(
                "A problem occurred while trying to record the video. Error: {}",
                self.message
            ),
        }
    }
}

impl fmt::Display for EncoderFault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)
    }
}

impl From<EncoderFault> for crate::error::MediaError {
    fn from(fault: EncoderFault) -> Self {
        crate::error::MediaError::EncoderFault {
            kind: fault.kind,
            message: fault.message,
        }
    }
}

/// Identifier of one recorder instance.
///
/// Each encoder gets a fresh id, so events from a recorder that was replaced
/// on the same stream can be told apart and ignored.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RecorderId(Uuid);

impl RecorderId {
    /// Generate a fresh recorder id
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for RecorderId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for RecorderId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// What a recorder reported
#[derive(Debug, Clone, PartialEq)]
pub enum RecorderEventKind {
    /// One encoded chunk, possibly empty
    ChunkReady(Bytes),
    /// Fault while running
    Fault(EncoderFault),
    /// Recorder finished after a stop
    Stopped,
}

/// Event reported by recorder `recorder` bound to `stream`
#[derive(Debug, Clone, PartialEq)]
pub struct RecorderEvent {
    /// Recorder that reported
    pub recorder: RecorderId,
    /// Stream the recorder is bound to
    pub stream: StreamId,
    /// What happened
    pub kind: RecorderEventKind,
}

impl RecorderEvent {
    /// Create an event
    pub fn new(recorder: RecorderId, stream: StreamId, kind: RecorderEventKind) -> Self {
        Self {
            recorder,
            stream,
            kind,
        }
    }
}

/// A running encoder backend for one stream
pub trait Recorder: Send {
    /// Begin emitting chunks every `interval`
    fn start(&mut self, interval: Duration) -> Result<(), EncoderFault>;

    /// Stop emitting; remaining data may still be flushed as a final chunk.
    ///
    /// A recorder whose backend ends on its own must still report
    /// [`RecorderEventKind::Stopped`], after any fault, and accept a later
    /// `start`.
    fn stop(&mut self);
}

/// Creates recorders bound to a stream and format
pub trait RecorderFactory: Send {
    /// Create a recorder for `stream` encoding to `format`, tagging its
    /// events with `id`
    fn create(
        &mut self,
        id: RecorderId,
        stream: &MediaStream,
        format: &EncodingFormat,
    ) -> Result<Box<dyn Recorder>, EncoderFault>;
}

/// What happened to one chunk
#[derive(Debug, Clone, PartialEq)]
pub enum ChunkDisposition {
    /// Forward to the channel
    Forward(Bytes),
    /// Empty chunk, dropped
    DroppedEmpty,
    /// Encoder no longer Recording, dropped
    DroppedInactive,
    /// Channel not open, dropped
    DroppedNotOpen,
}

/// Encoder counters
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EncoderStats {
    /// Chunks delivered by the recorder
    pub chunks_emitted: u64,
    /// Chunks handed to the channel
    pub chunks_forwarded: u64,
    /// Empty chunks dropped
    pub dropped_empty: u64,
    /// Chunks delivered after the encoder left Recording
    pub dropped_inactive: u64,
    /// Chunks dropped because the channel was not open
    pub dropped_not_open: u64,
    /// Bytes handed to the channel
    pub bytes_forwarded: u64,
    /// Faults reported
    pub faults: u64,
}

/// Chunk encoder bound to one live stream
pub struct ChunkEncoder {
    recorder: Box<dyn Recorder>,
    id: RecorderId,
    stream: StreamId,
    format: EncodingFormat,
    state: EncoderState,
    stats: EncoderStats,
    // Stopped events still owed by the recorder for earlier stop() calls
    stops_in_flight: u32,
}

impl fmt::Debug for ChunkEncoder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChunkEncoder")
            .field("id", &self.id)
            .field("stream", &self.stream)
            .field("format", &self.format)
            .field("state", &self.state)
            .field("stats", &self.stats)
            .finish()
    }
}

impl ChunkEncoder {
    /// Wrap recorder `id` created for `stream`
    pub fn new(
        recorder: Box<dyn Recorder>,
        id: RecorderId,
        stream: StreamId,
        format: EncodingFormat,
    ) -> Self {
        Self {
            recorder,
            id,
            stream,
            format,
            state: EncoderState::Idle,
            stats: EncoderStats::default(),
            stops_in_flight: 0,
        }
    }

    /// Create an encoder through `factory`
    pub fn create(
        factory: &mut dyn RecorderFactory,
        stream: &MediaStream,
        format: &EncodingFormat,
    ) -> Result<Self, EncoderFault> {
        let id = RecorderId::new();
        let recorder = factory.create(id, stream, format)?;
        Ok(Self::new(recorder, id, stream.id, format.clone()))
    }

    /// Current state
    pub fn state(&self) -> EncoderState {
        self.state
    }

    /// Whether chunks are being emitted
    pub fn is_recording(&self) -> bool {
        self.state == EncoderState::Recording
    }

    /// Recorder this encoder drives
    pub fn id(&self) -> RecorderId {
        self.id
    }

    /// Stream this encoder is bound to
    pub fn stream(&self) -> StreamId {
        self.stream
    }

    /// Whether `event` came from this encoder's recorder
    pub fn owns(&self, event: &RecorderEvent) -> bool {
        event.recorder == self.id
    }

    /// Output format
    pub fn format(&self) -> &EncodingFormat {
        &self.format
    }

    /// Counters
    pub fn stats(&self) -> &EncoderStats {
        &self.stats
    }

    /// Start recording. A no-op while Recording; refused once Faulted.
    pub fn start(&mut self, interval: Duration) -> Result<(), EncoderFault> {
        match self.state {
            EncoderState::Recording => return Ok(()),
            EncoderState::Faulted => {
                return Err(EncoderFault::new(
                    EncoderFaultKind::InvalidState,
                    "encoder has faulted and must be recreated",
                ))
            }
            EncoderState::Idle | EncoderState::Stopped => {}
        }

        if let Err(fault) = self.recorder.start(interval) {
            self.stats.faults += 1;
            if fault.is_fatal() {
                self.state = EncoderState::Faulted;
            }
            return Err(fault);
        }

        info!(
            "Recording stream {} as {} every {:?}",
            self.stream, self.format, interval
        );
        self.state = EncoderState::Recording;
        Ok(())
    }

    /// Stop recording. Returns `false` when not Recording.
    pub fn stop(&mut self) -> bool {
        if self.state != EncoderState::Recording {
            return false;
        }
        self.recorder.stop();
        self.stops_in_flight += 1;
        self.state = EncoderState::Stopped;
        info!("Stopped recording stream {}", self.stream);
        true
    }

    /// Decide what to do with a chunk delivered by the recorder
    pub fn accept_chunk(&mut self, data: Bytes, channel_open: bool) -> ChunkDisposition {
        self.stats.chunks_emitted += 1;
        if data.is_empty() {
            self.stats.dropped_empty += 1;
            return ChunkDisposition::DroppedEmpty;
        }
        // Includes the final flush after a stop or a fault
        if self.state != EncoderState::Recording {
            self.stats.dropped_inactive += 1;
            debug!(
                "Dropping {} byte chunk, encoder is {:?}",
                data.len(),
                self.state
            );
            return ChunkDisposition::DroppedInactive;
        }
        if !channel_open {
            self.stats.dropped_not_open += 1;
            debug!("Dropping {} byte chunk, channel not open", data.len());
            return ChunkDisposition::DroppedNotOpen;
        }
        self.stats.chunks_forwarded += 1;
        self.stats.bytes_forwarded += data.len() as u64;
        ChunkDisposition::Forward(data)
    }

    /// Apply a fault reported while running. Returns whether it was fatal.
    pub fn on_fault(&mut self, fault: &EncoderFault) -> bool {
        self.stats.faults += 1;
        if !fault.is_fatal() {
            warn!("Encoder reported non-fatal fault: {}", fault);
            return false;
        }
        warn!("Encoder faulted: {}", fault);
        if self.state == EncoderState::Recording {
            self.recorder.stop();
        }
        self.state = EncoderState::Faulted;
        true
    }

    /// Recorder reported that it stopped.
    ///
    /// Acknowledges an earlier [`stop`](Self::stop) first, so a late report
    /// from a previous run does not end a restarted recording.
    pub fn on_stopped(&mut self) {
        if self.stops_in_flight > 0 {
            self.stops_in_flight -= 1;
            return;
        }
        if self.state == EncoderState::Recording {
            debug!("Recorder for stream {} stopped by itself", self.stream);
            self.state = EncoderState::Stopped;
        }
    }
}
