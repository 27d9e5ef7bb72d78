//! Session controller
//!
//! Binds the capture source, the chunk encoder and the channel into one
//! recording session. Every input (a user intent or a backend completion)
//! goes through a transition method that leaves the session satisfying:
//!
//! ```text
//! encoder Recording  <=>  intent = Start && capture Ready && channel Open
//! ```
//!
//! Work that has to wait for the capture device or the connection is parked
//! as a one-shot continuation keyed by the condition it waits for.

use crate::event::{DropReason, SessionEvent, SessionPhase, StatusEvent, StatusUpdate};
use crate::notify::Notifier;
use camrelay_core::{
    Channel, ChannelBackend, ChannelEvent, ChannelSignal, ChannelState, ChannelStats,
    EncoderFaultKind, PendingContinuations, RelayError,
};
use camrelay_media::{
    CaptureEvent, CaptureOutcome, CaptureSource, CaptureState, ChunkDisposition, ChunkEncoder,
    DisplayStats, EncoderFault, EncoderState, EncoderStats, FrameOutcome, FrameSink, MediaError,
    RecorderEvent, RecorderEventKind, RecorderFactory, DEFAULT_CHUNK_INTERVAL,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

/// Body of the notification shown when no preferred format is supported
pub const UNSUPPORTED_FORMAT_BODY: &str = "Media format WebM and vp8 / vp9 codecs are not supported";

const STATUS_CAPACITY: usize = 256;

/// What the user last asked for
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Intent {
    /// Stop was requested, or nothing was requested yet
    StopRequested,
    /// Start was requested
    StartRequested,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Awaited {
    CaptureReady,
    ChannelOpen,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Continuation {
    ConnectChannel,
    BeginRecording,
}

/// Session parameters
#[derive(Debug, Clone, PartialEq)]
pub struct SessionSettings {
    /// WebSocket endpoint chunks are sent to
    pub endpoint: String,
    /// Interval between encoded chunks
    pub chunk_interval: Duration,
    /// Open the channel during bootstrap, before any start intent
    pub connect_on_startup: bool,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            endpoint: "ws://localhost:8888/ws/video".to_string(),
            chunk_interval: DEFAULT_CHUNK_INTERVAL,
            connect_on_startup: true,
        }
    }
}

impl SessionSettings {
    /// Settings for `endpoint` with the default interval
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            ..Self::default()
        }
    }

    /// Validate settings
    pub fn validate(&self) -> Result<(), RelayError> {
        if self.endpoint.trim().is_empty() {
            return Err(RelayError::Configuration {
                message: "endpoint must not be empty".to_string(),
            });
        }
        if self.chunk_interval.is_zero() {
            return Err(RelayError::Configuration {
                message: "chunk interval must be greater than zero".to_string(),
            });
        }
        Ok(())
    }
}

/// Orchestrates one capture source, its encoder and the channel
pub struct SessionController {
    capture: CaptureSource,
    recorders: Box<dyn RecorderFactory>,
    encoder: Option<ChunkEncoder>,
    channel: Channel<Box<dyn ChannelBackend>>,
    display: Box<dyn FrameSink>,
    notifier: Arc<dyn Notifier>,
    settings: SessionSettings,
    intent: Intent,
    pending: PendingContinuations<Awaited, Continuation>,
    status: broadcast::Sender<StatusUpdate>,
    last_phase: SessionPhase,
    last_capture: CaptureState,
    last_channel: ChannelState,
    notifications: u64,
}

impl std::fmt::Debug for SessionController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionController")
            .field("intent", &self.intent)
            .field("phase", &self.phase())
            .field("capture", &self.capture.state())
            .field("channel", &self.channel.state())
            .field("encoder", &self.encoder_state())
            .field("pending", &self.pending.len())
            .finish()
    }
}

impl SessionController {
    /// Create a controller owning every subsystem
    pub fn new(
        capture: CaptureSource,
        recorders: Box<dyn RecorderFactory>,
        channel_backend: Box<dyn ChannelBackend>,
        display: Box<dyn FrameSink>,
        notifier: Arc<dyn Notifier>,
        settings: SessionSettings,
    ) -> Self {
        let (status, _) = broadcast::channel(STATUS_CAPACITY);
        let last_capture = capture.state();
        Self {
            capture,
            recorders,
            encoder: None,
            channel: Channel::new(channel_backend),
            display,
            notifier,
            settings,
            intent: Intent::StopRequested,
            pending: PendingContinuations::new(),
            status,
            last_phase: SessionPhase::Stopped,
            last_capture,
            last_channel: ChannelState::Closed,
            notifications: 0,
        }
    }

    /// Subscribe to status events
    pub fn subscribe(&self) -> broadcast::Receiver<StatusUpdate> {
        self.status.subscribe()
    }

    /// Sender side of the status broadcast
    pub fn status_sender(&self) -> broadcast::Sender<StatusUpdate> {
        self.status.clone()
    }

    /// Last requested intent
    pub fn intent(&self) -> Intent {
        self.intent
    }

    /// Session settings
    pub fn settings(&self) -> &SessionSettings {
        &self.settings
    }

    /// Capture source state
    pub fn capture_state(&self) -> CaptureState {
        self.capture.state()
    }

    /// Channel state
    pub fn channel_state(&self) -> ChannelState {
        self.channel.state()
    }

    /// Encoder state, if an encoder exists
    pub fn encoder_state(&self) -> Option<EncoderState> {
        self.encoder.as_ref().map(|encoder| encoder.state())
    }

    /// Whether chunks are being produced
    pub fn is_recording(&self) -> bool {
        self.encoder
            .as_ref()
            .map(|encoder| encoder.is_recording())
            .unwrap_or(false)
    }

    /// Encoder counters for the current stream
    pub fn encoder_stats(&self) -> Option<EncoderStats> {
        self.encoder.as_ref().map(|encoder| encoder.stats().clone())
    }

    /// Channel counters
    pub fn channel_stats(&self) -> &ChannelStats {
        self.channel.stats()
    }

    /// Display counters
    pub fn display_stats(&self) -> DisplayStats {
        self.display.stats()
    }

    /// Number of notifications surfaced so far
    pub fn notifications(&self) -> u64 {
        self.notifications
    }

    /// Current phase, derived from subsystem state and pending continuations
    pub fn phase(&self) -> SessionPhase {
        if self.is_recording() {
            SessionPhase::Recording
        } else if self.pending.is_pending(Awaited::ChannelOpen) {
            SessionPhase::AwaitingConnection
        } else if self.pending.is_pending(Awaited::CaptureReady) {
            SessionPhase::AwaitingCapture
        } else {
            SessionPhase::Stopped
        }
    }

    /// Whether the encoder is Recording exactly when it should be
    pub fn invariant_holds(&self) -> bool {
        let wanted = self.intent == Intent::StartRequested
            && self.capture.is_ready()
            && self.channel.is_open();
        self.is_recording() == wanted
    }

    /// Acquire the capture device and, when configured, pre-connect the channel
    pub fn bootstrap(&mut self) {
        info!("Bootstrapping session for {}", self.settings.endpoint);
        if let Err(e) = self.capture.acquire() {
            self.capture_unavailable(e);
        }
        if self.settings.connect_on_startup {
            self.open_channel();
        }
        self.settle();
    }

    /// User start intent. A no-op while Recording.
    pub fn start(&mut self) {
        if self.is_recording() {
            debug!("Start ignored, already recording");
            return;
        }
        self.intent = Intent::StartRequested;
        self.advance();
        self.settle();
    }

    /// User stop intent: stop the encoder, then close the channel
    pub fn stop(&mut self) {
        self.intent = Intent::StopRequested;
        self.pending.clear();
        if let Some(encoder) = self.encoder.as_mut() {
            encoder.stop();
        }
        if !self.channel.close() {
            debug!("Channel already {:?}", self.channel.state());
        }
        self.settle();
    }

    /// Apply an asynchronous completion
    pub fn handle(&mut self, event: SessionEvent) {
        match event {
            SessionEvent::Capture(event) => self.on_capture(event),
            SessionEvent::Recorder(event) => self.on_recorder(event),
            SessionEvent::Channel(event) => self.on_channel(event),
        }
        self.settle();
    }

    /// Stop, close, drop the encoder and release the capture device
    pub fn shutdown(&mut self) {
        info!("Shutting down session");
        self.stop();
        self.encoder = None;
        self.display.clear();
        self.capture.teardown();
        self.settle();
    }

    fn advance(&mut self) {
        match self.capture.state() {
            CaptureState::Ready => self.connect_and_record(),
            CaptureState::Requesting => {
                self.pending
                    .register(Awaited::CaptureReady, Continuation::ConnectChannel);
            }
            CaptureState::Uninitialized => {
                self.pending
                    .register(Awaited::CaptureReady, Continuation::ConnectChannel);
                if let Err(e) = self.capture.acquire() {
                    self.capture_unavailable(e);
                }
            }
            CaptureState::Failed => {
                warn!("Capture source unavailable, start has no effect");
                self.abandon();
            }
        }
    }

    fn connect_and_record(&mut self) {
        match self.channel.state() {
            ChannelState::Open => self.begin_recording(),
            ChannelState::Connecting => {
                self.pending
                    .register(Awaited::ChannelOpen, Continuation::BeginRecording);
            }
            ChannelState::Closed | ChannelState::Closing => {
                if self.open_channel() {
                    self.pending
                        .register(Awaited::ChannelOpen, Continuation::BeginRecording);
                } else {
                    self.abandon();
                }
            }
        }
    }

    fn open_channel(&mut self) -> bool {
        let endpoint = self.settings.endpoint.clone();
        match self.channel.connect(&endpoint) {
            Ok(_) => true,
            Err(e) => {
                warn!("Could not connect to {}: {}", endpoint, e);
                let body = format!("Connection error: {}", e);
                self.notify(&e.notify_title(), &body);
                false
            }
        }
    }

    fn begin_recording(&mut self) {
        if self.intent != Intent::StartRequested
            || !self.capture.is_ready()
            || !self.channel.is_open()
        {
            return;
        }

        let needs_encoder = self
            .encoder
            .as_ref()
            .map(|encoder| encoder.state() == EncoderState::Faulted)
            .unwrap_or(true);
        if needs_encoder {
            if let Err(fault) = self.create_encoder() {
                self.report_fault(&fault);
                self.abandon();
                return;
            }
        }

        let interval = self.settings.chunk_interval;
        let result = match self.encoder.as_mut() {
            Some(encoder) => encoder.start(interval),
            None => {
                self.abandon();
                return;
            }
        };
        if let Err(fault) = result {
            self.report_fault(&fault);
            self.abandon();
        }
    }

    fn create_encoder(&mut self) -> Result<(), EncoderFault> {
        let (stream, format) = match (self.capture.stream(), self.capture.format()) {
            (Some(stream), Some(format)) => (stream.clone(), format.clone()),
            _ => {
                return Err(EncoderFault::new(
                    EncoderFaultKind::InvalidState,
                    "no live capture stream",
                ))
            }
        };
        self.encoder = None;
        let encoder = ChunkEncoder::create(self.recorders.as_mut(), &stream, &format)?;
        debug!("Created encoder for stream {} as {}", stream.id, format);
        self.encoder = Some(encoder);
        Ok(())
    }

    fn run(&mut self, continuation: Continuation) {
        debug!("Running continuation {:?}", continuation);
        match continuation {
            Continuation::ConnectChannel => {
                if self.intent == Intent::StartRequested {
                    self.connect_and_record();
                }
            }
            Continuation::BeginRecording => self.begin_recording(),
        }
    }

    fn on_capture(&mut self, event: CaptureEvent) {
        match self.capture.on_event(event) {
            CaptureOutcome::Ready { stream, .. } => {
                // A new stream always gets a new encoder; a failure here is
                // reported when recording is attempted
                if let Err(fault) = self.create_encoder() {
                    warn!("No encoder for stream {}: {}", stream.id, fault);
                }
                for continuation in self.pending.drain(Awaited::CaptureReady) {
                    self.run(continuation);
                }
            }
            CaptureOutcome::Denied(failure) => {
                self.notify(&failure.title(), &failure.body());
                self.abandon();
            }
            CaptureOutcome::Unsupported(e) => {
                debug!("Format negotiation failed: {}", e);
                self.notify("Media Error", UNSUPPORTED_FORMAT_BODY);
                self.abandon();
            }
            CaptureOutcome::Ended { stream, reason } => {
                if let Some(mut encoder) = self.encoder.take() {
                    encoder.stop();
                }
                self.notify("Media Error", &format!("Video stream {} ended: {}", stream, reason));
                self.abandon();
            }
            CaptureOutcome::Ignored => {}
        }
    }

    fn on_recorder(&mut self, event: RecorderEvent) {
        let encoder = match self.encoder.as_mut() {
            Some(encoder) if encoder.owns(&event) => encoder,
            _ => {
                debug!(
                    "Ignoring event from replaced recorder {} on stream {}",
                    event.recorder, event.stream
                );
                return;
            }
        };

        match event.kind {
            RecorderEventKind::ChunkReady(data) => {
                let status = match encoder.accept_chunk(data, self.channel.is_open()) {
                    ChunkDisposition::Forward(data) => {
                        let bytes = data.len();
                        match self.channel.send(data) {
                            Ok(()) => StatusEvent::ChunkSent { bytes },
                            Err(e) => {
                                debug!("Chunk not sent: {}", e);
                                let reason = match e {
                                    RelayError::Congested { .. } => DropReason::Congested,
                                    _ => DropReason::NotOpen,
                                };
                                StatusEvent::ChunkDropped { reason }
                            }
                        }
                    }
                    ChunkDisposition::DroppedEmpty => StatusEvent::ChunkDropped {
                        reason: DropReason::Empty,
                    },
                    ChunkDisposition::DroppedInactive => StatusEvent::ChunkDropped {
                        reason: DropReason::Inactive,
                    },
                    ChunkDisposition::DroppedNotOpen => StatusEvent::ChunkDropped {
                        reason: DropReason::NotOpen,
                    },
                };
                self.emit(status);
            }
            RecorderEventKind::Fault(fault) => {
                let fatal = encoder.on_fault(&fault);
                self.report_fault(&fault);
                if fatal {
                    self.abandon();
                }
            }
            RecorderEventKind::Stopped => {
                let was_recording = encoder.is_recording();
                encoder.on_stopped();
                if was_recording && !encoder.is_recording() {
                    warn!("Recorder stopped while recording");
                    self.abandon();
                }
            }
        }
    }

    fn on_channel(&mut self, event: ChannelEvent) {
        let signal = match self.channel.accept(event) {
            Some(signal) => signal,
            None => return,
        };

        match signal {
            ChannelSignal::Opened => {
                for continuation in self.pending.drain(Awaited::ChannelOpen) {
                    self.run(continuation);
                }
            }
            ChannelSignal::Message(data) => {
                let status = match self.display.on_frame(&data) {
                    FrameOutcome::Displayed(handle) => StatusEvent::FrameDisplayed { handle: handle.0 },
                    FrameOutcome::Dropped => StatusEvent::FrameDropped,
                    FrameOutcome::Rejected => StatusEvent::FrameRejected,
                };
                self.emit(status);
            }
            ChannelSignal::Error(reason) => {
                self.notify("Connection Error", &format!("Connection error: {}", reason));
            }
            ChannelSignal::Closed {
                code,
                reason,
                was_open,
            } => {
                let awaited = self.pending.cancel(Awaited::ChannelOpen) > 0;
                let stopped = self
                    .encoder
                    .as_mut()
                    .map(|encoder| encoder.stop())
                    .unwrap_or(false);
                if stopped {
                    info!("Recording stopped, connection closed");
                }
                // A start still waiting for capture reconnects once capture is ready
                if awaited || stopped {
                    debug!(
                        "Connection closed (code {:?}, was open: {}) {}",
                        code, was_open, reason
                    );
                    self.abandon();
                }
            }
        }
    }

    fn capture_unavailable(&mut self, error: MediaError) {
        let error = RelayError::from(error);
        self.notify(&error.notify_title(), &error.to_string());
        self.abandon();
    }

    fn report_fault(&mut self, fault: &EncoderFault) {
        self.notify(fault.title(), &fault.body());
    }

    /// Give up on the current start intent
    fn abandon(&mut self) {
        if self.intent == Intent::StartRequested {
            debug!("Start intent abandoned");
        }
        self.intent = Intent::StopRequested;
        self.pending.clear();
        if let Some(encoder) = self.encoder.as_mut() {
            encoder.stop();
        }
    }

    fn notify(&mut self, title: &str, body: &str) {
        self.notifications += 1;
        self.notifier.notify(title, body);
        self.emit(StatusEvent::Notified {
            title: title.to_string(),
            body: body.to_string(),
        });
    }

    fn emit(&self, event: StatusEvent) {
        // No subscribers is fine
        let _ = self.status.send(StatusUpdate::now(event));
    }

    fn settle(&mut self) {
        let capture = self.capture.state();
        if capture != self.last_capture {
            self.last_capture = capture;
            self.emit(StatusEvent::CaptureChanged { state: capture });
        }

        let channel = self.channel.state();
        if channel != self.last_channel {
            self.last_channel = channel;
            self.emit(StatusEvent::ChannelChanged { state: channel });
        }

        let phase = self.phase();
        if phase != self.last_phase {
            info!("Session {} -> {}", self.last_phase, phase);
            let from = std::mem::replace(&mut self.last_phase, phase);
            self.emit(StatusEvent::PhaseChanged { from, to: phase });
        }

        debug_assert!(
            self.invariant_holds(),
            "recording invariant broken: intent {:?}, capture {:?}, channel {:?}, encoder {:?}",
            self.intent,
            capture,
            channel,
            self.encoder_state()
        );
    }
}
