//! Session runtime
//!
//! Backends report completions on unbounded queues. One tokio task owns the
//! [`SessionController`] and applies commands and completions one at a time,
//! so no transition ever runs concurrently with another.

use crate::event::{StatusStream, StatusUpdate};
use crate::notify::{Notifier, TracingNotifier};
use crate::session::{SessionController, SessionSettings};
use camrelay_core::{ChannelBackend, ChannelEvent, ConnectionConfig, RelayError, WebSocketBackend};
use camrelay_media::{
    CaptureDevice, CaptureEvent, CaptureSource, EncodingFormat, FfmpegCaptureDevice, FfmpegConfig,
    FfmpegRecorderFactory, FrameSink, NullSink, PreviewSink, RecorderEvent, RecorderFactory,
    SyntheticDevice, SyntheticRecorderFactory,
};
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, info};

const COMMAND_CAPACITY: usize = 32;

/// User intent sent to a running session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    /// Start recording
    Start,
    /// Stop recording and close the channel
    Stop,
    /// Stop and end the session task
    Shutdown,
}

/// Wires backends to the queues a [`SessionRuntime`] listens on
pub struct SessionBuilder {
    settings: SessionSettings,
    preferences: Vec<EncodingFormat>,
    connection: ConnectionConfig,
    capture_tx: mpsc::UnboundedSender<CaptureEvent>,
    capture_rx: mpsc::UnboundedReceiver<CaptureEvent>,
    recorder_tx: mpsc::UnboundedSender<RecorderEvent>,
    recorder_rx: mpsc::UnboundedReceiver<RecorderEvent>,
    channel_tx: mpsc::UnboundedSender<ChannelEvent>,
    channel_rx: mpsc::UnboundedReceiver<ChannelEvent>,
    device: Option<Box<dyn CaptureDevice>>,
    preview: Option<Box<dyn PreviewSink>>,
    recorders: Option<Box<dyn RecorderFactory>>,
    channel: Option<Box<dyn ChannelBackend>>,
    display: Option<Box<dyn FrameSink>>,
    notifier: Option<Arc<dyn Notifier>>,
}

impl std::fmt::Debug for SessionBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionBuilder")
            .field("settings", &self.settings)
            .field("preferences", &self.preferences)
            .field("has_device", &self.device.is_some())
            .field("has_recorders", &self.recorders.is_some())
            .field("has_channel", &self.channel.is_some())
            .finish()
    }
}

impl SessionBuilder {
    /// Start building a session with `settings`
    pub fn new(settings: SessionSettings) -> Self {
        let (capture_tx, capture_rx) = mpsc::unbounded_channel();
        let (recorder_tx, recorder_rx) = mpsc::unbounded_channel();
        let (channel_tx, channel_rx) = mpsc::unbounded_channel();
        Self {
            settings,
            preferences: EncodingFormat::default_preferences(),
            connection: ConnectionConfig::default(),
            capture_tx,
            capture_rx,
            recorder_tx,
            recorder_rx,
            channel_tx,
            channel_rx,
            device: None,
            preview: None,
            recorders: None,
            channel: None,
            display: None,
            notifier: None,
        }
    }

    /// Queue capture devices report to
    pub fn capture_sender(&self) -> mpsc::UnboundedSender<CaptureEvent> {
        self.capture_tx.clone()
    }

    /// Queue recorders report to
    pub fn recorder_sender(&self) -> mpsc::UnboundedSender<RecorderEvent> {
        self.recorder_tx.clone()
    }

    /// Queue channel backends report to
    pub fn channel_sender(&self) -> mpsc::UnboundedSender<ChannelEvent> {
        self.channel_tx.clone()
    }

    /// Use `device` for capture
    pub fn device(mut self, device: Box<dyn CaptureDevice>) -> Self {
        self.device = Some(device);
        self
    }

    /// Attach a local preview to the live stream
    pub fn preview(mut self, preview: Box<dyn PreviewSink>) -> Self {
        self.preview = Some(preview);
        self
    }

    /// Encoding format preference order
    pub fn preferences(mut self, preferences: Vec<EncodingFormat>) -> Self {
        self.preferences = preferences;
        self
    }

    /// Use `factory` to create recorders
    pub fn recorder_factory(mut self, factory: Box<dyn RecorderFactory>) -> Self {
        self.recorders = Some(factory);
        self
    }

    /// Use `backend` instead of the WebSocket transport
    pub fn channel_backend(mut self, backend: Box<dyn ChannelBackend>) -> Self {
        self.channel = Some(backend);
        self
    }

    /// Settings for the default WebSocket transport
    pub fn connection_config(mut self, config: ConnectionConfig) -> Self {
        self.connection = config;
        self
    }

    /// Where inbound frames go
    pub fn display(mut self, display: Box<dyn FrameSink>) -> Self {
        self.display = Some(display);
        self
    }

    /// Where notifications go
    pub fn notifier(mut self, notifier: Arc<dyn Notifier>) -> Self {
        self.notifier = Some(notifier);
        self
    }

    /// Synthetic device and recorders emitting `chunk_size` byte chunks
    pub fn synthetic(self, chunk_size: usize) -> Self {
        let device = SyntheticDevice::new(self.capture_sender());
        let recorders = SyntheticRecorderFactory::new(self.recorder_sender(), chunk_size);
        self.device(Box::new(device))
            .recorder_factory(Box::new(recorders))
    }

    /// ffmpeg capture device and recorders
    pub fn ffmpeg(self, config: FfmpegConfig) -> Self {
        let device = FfmpegCaptureDevice::new(config.clone(), self.capture_sender());
        let recorders = FfmpegRecorderFactory::new(config, self.recorder_sender());
        self.device(Box::new(device))
            .recorder_factory(Box::new(recorders))
    }

    /// Assemble the runtime
    pub fn build(self) -> Result<SessionRuntime, RelayError> {
        self.settings.validate()?;
        if self.preferences.is_empty() {
            return Err(RelayError::Configuration {
                message: "at least one encoding format is required".to_string(),
            });
        }

        let device = self.device.ok_or_else(|| RelayError::Configuration {
            message: "no capture device configured".to_string(),
        })?;
        let recorders = self.recorders.ok_or_else(|| RelayError::Configuration {
            message: "no recorder factory configured".to_string(),
        })?;
        let channel = match self.channel {
            Some(channel) => channel,
            None => Box::new(WebSocketBackend::new(self.connection, self.channel_tx.clone())),
        };
        let display = self
            .display
            .unwrap_or_else(|| Box::new(NullSink::default()));
        let notifier = self
            .notifier
            .unwrap_or_else(|| Arc::new(TracingNotifier));

        let mut capture = CaptureSource::with_preferences(device, self.preferences);
        if let Some(preview) = self.preview {
            capture.set_preview(preview);
        }

        let controller = SessionController::new(
            capture,
            recorders,
            channel,
            display,
            notifier,
            self.settings,
        );

        Ok(SessionRuntime {
            controller,
            capture_rx: self.capture_rx,
            recorder_rx: self.recorder_rx,
            channel_rx: self.channel_rx,
        })
    }
}

/// A session and the queues feeding it
pub struct SessionRuntime {
    controller: SessionController,
    capture_rx: mpsc::UnboundedReceiver<CaptureEvent>,
    recorder_rx: mpsc::UnboundedReceiver<RecorderEvent>,
    channel_rx: mpsc::UnboundedReceiver<ChannelEvent>,
}

impl std::fmt::Debug for SessionRuntime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionRuntime")
            .field("controller", &self.controller)
            .finish()
    }
}

impl SessionRuntime {
    /// The controller driven by this runtime
    pub fn controller(&self) -> &SessionController {
        &self.controller
    }

    /// Subscribe to status events
    pub fn subscribe(&self) -> StatusStream {
        StatusStream::new(self.controller.subscribe())
    }

    /// Bootstrap, then apply commands and completions until shutdown.
    ///
    /// Returns the controller so its final state can be inspected.
    pub async fn run(mut self, mut commands: mpsc::Receiver<Command>) -> SessionController {
        self.controller.bootstrap();

        loop {
            tokio::select! {
                command = commands.recv() => match command {
                    Some(Command::Start) => self.controller.start(),
                    Some(Command::Stop) => self.controller.stop(),
                    Some(Command::Shutdown) | None => break,
                },
                Some(event) = self.capture_rx.recv() => self.controller.handle(event.into()),
                Some(event) = self.recorder_rx.recv() => self.controller.handle(event.into()),
                Some(event) = self.channel_rx.recv() => self.controller.handle(event.into()),
            }
        }

        self.controller.shutdown();
        info!("Session ended");
        self.controller
    }

    /// Run on the current tokio runtime
    pub fn spawn(self) -> (SessionHandle, JoinHandle<SessionController>) {
        let (commands_tx, commands_rx) = mpsc::channel(COMMAND_CAPACITY);
        let handle = SessionHandle {
            commands: commands_tx,
            status: self.controller.status_sender(),
        };
        let task = tokio::spawn(self.run(commands_rx));
        (handle, task)
    }
}

/// Control surface of a spawned session
#[derive(Debug, Clone)]
pub struct SessionHandle {
    commands: mpsc::Sender<Command>,
    status: broadcast::Sender<StatusUpdate>,
}

impl SessionHandle {
    /// Request recording
    pub async fn start(&self) -> Result<(), RelayError> {
        self.send(Command::Start).await
    }

    /// Request stop
    pub async fn stop(&self) -> Result<(), RelayError> {
        self.send(Command::Stop).await
    }

    /// End the session task
    pub async fn shutdown(&self) -> Result<(), RelayError> {
        self.send(Command::Shutdown).await
    }

    /// Subscribe to status events
    pub fn subscribe(&self) -> StatusStream {
        StatusStream::new(self.status.subscribe())
    }

    /// Whether the session task has ended
    pub fn is_closed(&self) -> bool {
        self.commands.is_closed()
    }

    async fn send(&self, command: Command) -> Result<(), RelayError> {
        debug!("Session command {:?}", command);
        self.commands
            .send(command)
            .await
            .map_err(|_| RelayError::InvalidState {
                expected: "running session".to_string(),
                actual: "session ended".to_string(),
            })
    }
}
