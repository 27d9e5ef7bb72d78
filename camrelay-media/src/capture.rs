//! Capture source
//!
//! [`CaptureSource`] owns the capture device and the live stream it yields.
//! Access is requested once; the device answers asynchronously with a
//! [`CaptureEvent`] which the owner feeds back through
//! [`CaptureSource::on_event`]. A source that failed stays failed for the
//! lifetime of the process.

use crate::error::{MediaError, MediaResult};
use crate::format::{select_format, EncodingFormat};
use serde::{Deserialize, Serialize};
use std::fmt;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Identifier of one live stream instance
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct StreamId(Uuid);

impl StreamId {
    /// Generate a fresh stream id
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for StreamId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for StreamId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Capture device description
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceInfo {
    /// Device identifier, e.g. `/dev/video0`
    pub id: String,
    /// Human-readable name
    pub name: String,
}

impl DeviceInfo {
    /// Create a device description
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
        }
    }
}

/// A live video-only stream handed out by a device
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MediaStream {
    /// Stream instance id
    pub id: StreamId,
    /// Device the stream comes from
    pub device: DeviceInfo,
}

impl MediaStream {
    /// Create a stream for `device` with a fresh id
    pub fn new(device: DeviceInfo) -> Self {
        Self {
            id: StreamId::new(),
            device,
        }
    }
}

/// Why access to the device was refused
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CaptureFailureKind {
    /// User or system policy refused access
    PermissionDenied,
    /// Device is in use elsewhere
    DeviceBusy,
    /// No matching device
    NoDevice,
    /// Anything else
    Other,
}

impl CaptureFailureKind {
    /// Short error name shown in the notification title
    pub fn name(&self) -> &'static str {
        match self {
            CaptureFailureKind::PermissionDenied => "NotAllowedError",
            CaptureFailureKind::DeviceBusy => "NotReadableError",
            CaptureFailureKind::NoDevice => "NotFoundError",
            CaptureFailureKind::Other => "AbortError",
        }
    }
}

/// Refusal reported by a device
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CaptureFailure {
    /// Classification
    pub kind: CaptureFailureKind,
    /// Message from the device layer
    pub message: String,
}

impl CaptureFailure {
    /// Create a failure
    pub fn new(kind: CaptureFailureKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    /// Notification title
    pub fn title(&self) -> String {
        format!("Media Error: {}", self.kind.name())
    }

    /// Notification body
    pub fn body(&self) -> String {
        format!("Could not open webcam: {}", self.message)
    }
}

impl From<CaptureFailure> for MediaError {
    fn from(failure: CaptureFailure) -> Self {
        MediaError::CaptureFailed {
            reason: failure.message,
        }
    }
}

/// Completion reported by a capture device
#[derive(Debug, Clone, PartialEq)]
pub enum CaptureEvent {
    /// Access granted, stream is live
    Granted(MediaStream),
    /// Access refused
    Denied(CaptureFailure),
    /// A live stream ended
    Ended {
        /// Stream that ended
        stream: StreamId,
        /// Why it ended
        reason: String,
    },
}

/// Capture source lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CaptureState {
    /// Access not requested yet
    Uninitialized,
    /// Waiting for the device to answer
    Requesting,
    /// Stream live and format negotiated
    Ready,
    /// Access refused, no usable format, or stream lost
    Failed,
}

/// Capture device backend.
///
/// `request_access` returns immediately; the answer arrives later as a
/// [`CaptureEvent`] on whatever sender the device was built with.
pub trait CaptureDevice: Send {
    /// Ask for video-only access
    fn request_access(&mut self) -> MediaResult<()>;

    /// Whether the encoder stack can produce `format` from this device
    fn supports_format(&self, format: &EncodingFormat) -> bool;

    /// Release a stream previously granted
    fn release(&mut self, stream: &MediaStream);

    /// Describe the device
    fn describe(&self) -> DeviceInfo;
}

/// Local preview of the live stream
pub trait PreviewSink: Send {
    /// Bind the preview to a live stream
    fn attach(&mut self, stream: &MediaStream);

    /// Unbind the preview
    fn detach(&mut self, stream: &MediaStream);
}

/// Result of applying a capture event
#[derive(Debug)]
pub enum CaptureOutcome {
    /// Source is Ready
    Ready {
        /// The live stream
        stream: MediaStream,
        /// Negotiated format
        format: EncodingFormat,
    },
    /// Access was refused; source is Failed
    Denied(CaptureFailure),
    /// No preference matched; stream released, source is Failed
    Unsupported(MediaError),
    /// The live stream ended; source is Failed
    Ended {
        /// Stream that ended
        stream: StreamId,
        /// Why it ended
        reason: String,
    },
    /// Event did not apply to the current state
    Ignored,
}

/// Owner of the capture device and its live stream
pub struct CaptureSource {
    device: Box<dyn CaptureDevice>,
    preview: Option<Box<dyn PreviewSink>>,
    preferences: Vec<EncodingFormat>,
    state: CaptureState,
    stream: Option<MediaStream>,
    format: Option<EncodingFormat>,
}

impl fmt::Debug for CaptureSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CaptureSource")
            .field("device", &self.device.describe())
            .field("state", &self.state)
            .field("stream", &self.stream)
            .field("format", &self.format)
            .finish()
    }
}

impl CaptureSource {
    /// Create a source with the default format preferences
    pub fn new(device: Box<dyn CaptureDevice>) -> Self {
        Self::with_preferences(device, EncodingFormat::default_preferences())
    }

    /// Create a source with an explicit format preference order
    pub fn with_preferences(device: Box<dyn CaptureDevice>, preferences: Vec<EncodingFormat>) -> Self {
        Self {
            device,
            preview: None,
            preferences,
            state: CaptureState::Uninitialized,
            stream: None,
            format: None,
        }
    }

    /// Attach a preview sink, bound whenever a stream is live
    pub fn set_preview(&mut self, preview: Box<dyn PreviewSink>) {
        if let Some(stream) = &self.stream {
            if let Some(old) = self.preview.as_mut() {
                old.detach(stream);
            }
        }
        let mut preview = preview;
        if let Some(stream) = &self.stream {
            preview.attach(stream);
        }
        self.preview = Some(preview);
    }

    /// Current state
    pub fn state(&self) -> CaptureState {
        self.state
    }

    /// Whether a stream is live with a negotiated format
    pub fn is_ready(&self) -> bool {
        self.state == CaptureState::Ready
    }

    /// Live stream, when Ready
    pub fn stream(&self) -> Option<&MediaStream> {
        self.stream.as_ref()
    }

    /// Negotiated format, when Ready
    pub fn format(&self) -> Option<&EncodingFormat> {
        self.format.as_ref()
    }

    /// Format preference order
    pub fn preferences(&self) -> &[EncodingFormat] {
        &self.preferences
    }

    /// Device description
    pub fn device_info(&self) -> DeviceInfo {
        self.device.describe()
    }

    /// Request capture access.
    ///
    /// Only acts when Uninitialized; Requesting and Ready are no-ops. A Failed
    /// source is never retried.
    pub fn acquire(&mut self) -> MediaResult<()> {
        match self.state {
            CaptureState::Uninitialized => {}
            CaptureState::Requesting | CaptureState::Ready => return Ok(()),
            CaptureState::Failed => {
                return Err(MediaError::InvalidState {
                    message: "capture source failed; restart to retry".to_string(),
                })
            }
        }

        info!("Requesting capture access to {}", self.device.describe().id);
        match self.device.request_access() {
            Ok(()) => {
                self.state = CaptureState::Requesting;
                Ok(())
            }
            Err(e) => {
                warn!("Capture request failed: {}", e);
                self.state = CaptureState::Failed;
                Err(e)
            }
        }
    }

    /// Select the first supported format from the preference list
    pub fn select_format(&self) -> MediaResult<EncodingFormat> {
        let device = &self.device;
        select_format(&self.preferences, |format| device.supports_format(format))
    }

    /// Apply a device event
    pub fn on_event(&mut self, event: CaptureEvent) -> CaptureOutcome {
        match event {
            CaptureEvent::Granted(stream) => {
                if self.state != CaptureState::Requesting {
                    debug!("Releasing unrequested stream {} ({:?})", stream.id, self.state);
                    self.device.release(&stream);
                    return CaptureOutcome::Ignored;
                }

                let format = match self.format.clone() {
                    Some(format) => format,
                    None => match self.select_format() {
                        Ok(format) => format,
                        Err(e) => {
                            warn!("No supported encoding format: {}", e);
                            self.device.release(&stream);
                            self.state = CaptureState::Failed;
                            return CaptureOutcome::Unsupported(e);
                        }
                    },
                };

                info!("Capture ready on {} using {}", stream.device.id, format);
                if let Some(preview) = self.preview.as_mut() {
                    preview.attach(&stream);
                }
                self.format = Some(format.clone());
                self.stream = Some(stream.clone());
                self.state = CaptureState::Ready;
                CaptureOutcome::Ready { stream, format }
            }
            CaptureEvent::Denied(failure) => {
                if self.state != CaptureState::Requesting {
                    debug!("Ignoring capture denial while {:?}", self.state);
                    return CaptureOutcome::Ignored;
                }
                warn!("Capture access denied: {}", failure.message);
                self.state = CaptureState::Failed;
                CaptureOutcome::Denied(failure)
            }
            CaptureEvent::Ended { stream, reason } => {
                let current = match self.stream.take() {
                    Some(current) if current.id == stream => current,
                    other => {
                        self.stream = other;
                        debug!("Ignoring end of unknown stream {}", stream);
                        return CaptureOutcome::Ignored;
                    }
                };
                warn!("Capture stream {} ended: {}", stream, reason);
                if let Some(preview) = self.preview.as_mut() {
                    preview.detach(&current);
                }
                self.device.release(&current);
                self.state = CaptureState::Failed;
                CaptureOutcome::Ended { stream, reason }
            }
        }
    }

    /// Release the stream and detach the preview
    pub fn teardown(&mut self) {
        if let Some(stream) = self.stream.take() {
            info!("Releasing capture stream {}", stream.id);
            if let Some(preview) = self.preview.as_mut() {
                preview.detach(&stream);
            }
            self.device.release(&stream);
        }
        if self.state != CaptureState::Failed {
            self.state = CaptureState::Uninitialized;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::sync::Arc;

    #[derive(Default)]
    struct Log {
        requests: usize,
        released: Vec<StreamId>,
    }

    struct FakeDevice {
        log: Arc<Mutex<Log>>,
        codecs: Vec<&'static str>,
    }

    impl CaptureDevice for FakeDevice {
        fn request_access(&mut self) -> MediaResult<()> {
            self.log.lock().requests += 1;
            Ok(())
        }

        fn supports_format(&self, format: &EncodingFormat) -> bool {
            self.codecs.contains(&format.codec.as_str())
        }

        fn release(&mut self, stream: &MediaStream) {
            self.log.lock().released.push(stream.id);
        }

        fn describe(&self) -> DeviceInfo {
            DeviceInfo::new("fake0", "Fake camera")
        }
    }

    fn source(codecs: Vec<&'static str>) -> (CaptureSource, Arc<Mutex<Log>>) {
        let log = Arc::new(Mutex::new(Log::default()));
        let device = FakeDevice {
            log: log.clone(),
            codecs,
        };
        (CaptureSource::new(Box::new(device)), log)
    }

    fn granted() -> MediaStream {
        MediaStream::new(DeviceInfo::new("fake0", "Fake camera"))
    }

    #[test]
    fn test_acquire_then_grant() {
        let (mut source, log) = source(vec!["vp8", "vp9"]);
        source.acquire().unwrap();
        source.acquire().unwrap();
        assert_eq!(source.state(), CaptureState::Requesting);
        assert_eq!(log.lock().requests, 1);

        match source.on_event(CaptureEvent::Granted(granted())) {
            CaptureOutcome::Ready { format, .. } => assert_eq!(format, EncodingFormat::webm_vp9()),
            other => panic!("Expected Ready, got {:?}", other),
        }
        assert!(source.is_ready());
        assert!(source.stream().is_some());
    }

    #[test]
    fn test_falls_back_to_vp8() {
        let (mut source, _) = source(vec!["vp8"]);
        source.acquire().unwrap();
        source.on_event(CaptureEvent::Granted(granted()));
        assert_eq!(source.format(), Some(&EncodingFormat::webm_vp8()));
    }

    #[test]
    fn test_unsupported_format_fails_and_releases() {
        let (mut source, log) = source(vec![]);
        source.acquire().unwrap();
        let stream = granted();
        let id = stream.id;

        assert!(matches!(
            source.on_event(CaptureEvent::Granted(stream)),
            CaptureOutcome::Unsupported(MediaError::UnsupportedFormat { .. })
        ));
        assert_eq!(source.state(), CaptureState::Failed);
        assert_eq!(log.lock().released, vec![id]);
    }

    #[test]
    fn test_denied_is_final() {
        let (mut source, log) = source(vec!["vp9"]);
        source.acquire().unwrap();
        let failure = CaptureFailure::new(CaptureFailureKind::PermissionDenied, "Permission denied");
        assert!(matches!(
            source.on_event(CaptureEvent::Denied(failure.clone())),
            CaptureOutcome::Denied(_)
        ));
        assert_eq!(failure.title(), "Media Error: NotAllowedError");
        assert_eq!(failure.body(), "Could not open webcam: Permission denied");

        assert!(source.acquire().is_err());
        assert_eq!(log.lock().requests, 1);
    }

    #[test]
    fn test_stream_end_fails_source() {
        let (mut source, log) = source(vec!["vp9"]);
        source.acquire().unwrap();
        let stream = granted();
        let id = stream.id;
        source.on_event(CaptureEvent::Granted(stream));

        let other = StreamId::new();
        assert!(matches!(
            source.on_event(CaptureEvent::Ended {
                stream: other,
                reason: "unplugged".to_string()
            }),
            CaptureOutcome::Ignored
        ));
        assert!(source.is_ready());

        assert!(matches!(
            source.on_event(CaptureEvent::Ended {
                stream: id,
                reason: "unplugged".to_string()
            }),
            CaptureOutcome::Ended { .. }
        ));
        assert_eq!(source.state(), CaptureState::Failed);
        assert_eq!(log.lock().released, vec![id]);
    }

    #[test]
    fn test_teardown_releases_stream() {
        let (mut source, log) = source(vec!["vp9"]);
        source.acquire().unwrap();
        let stream = granted();
        let id = stream.id;
        source.on_event(CaptureEvent::Granted(stream));

        source.teardown();
        source.teardown();
        assert_eq!(log.lock().released, vec![id]);
        assert!(source.stream().is_none());
    }
}
