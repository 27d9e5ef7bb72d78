//! ffmpeg-backed capture device and recorder
//!
//! The device probes access with a one-frame capture and learns which VP8/VP9
//! encoders the local ffmpeg build provides. The recorder runs
//! `ffmpeg ... -f webm pipe:1` and slices its stdout into one chunk per
//! interval tick.

use crate::capture::{
    CaptureDevice, CaptureEvent, CaptureFailure, CaptureFailureKind, DeviceInfo, MediaStream,
    StreamId,
};
use crate::encoder::{
    EncoderFault, Recorder, RecorderEvent, RecorderEventKind, RecorderFactory, RecorderId,
};
use crate::error::{MediaError, MediaResult};
use crate::format::EncodingFormat;
use bytes::BytesMut;
use camrelay_core::EncoderFaultKind;
use parking_lot::RwLock;
use std::collections::HashSet;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::process::{Child, Command};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

/// ffmpeg invocation settings
#[derive(Debug, Clone, PartialEq)]
pub struct FfmpegConfig {
    /// ffmpeg executable
    pub binary: String,
    /// Input demuxer, e.g. `v4l2`, `avfoundation`, `dshow`
    pub input_format: String,
    /// Device passed to `-i`
    pub device: String,
    /// Capture frame rate
    pub framerate: u32,
    /// Capture width
    pub width: u32,
    /// Capture height
    pub height: u32,
    /// Target video bitrate in kbit/s
    pub bitrate_kbps: u32,
    /// Time allowed for the access and encoder probes
    pub probe_timeout: Duration,
}

impl Default for FfmpegConfig {
    fn default() -> Self {
        Self {
            binary: "ffmpeg".to_string(),
            input_format: "v4l2".to_string(),
            device: "/dev/video0".to_string(),
            framerate: 30,
            width: 640,
            height: 480,
            bitrate_kbps: 1000,
            probe_timeout: Duration::from_secs(10),
        }
    }
}

impl FfmpegConfig {
    /// Validate configuration
    pub fn validate(&self) -> MediaResult<()> {
        if self.binary.trim().is_empty() {
            return Err(MediaError::InvalidConfiguration {
                message: "ffmpeg binary must not be empty".to_string(),
            });
        }
        if self.device.trim().is_empty() {
            return Err(MediaError::InvalidConfiguration {
                message: "capture device must not be empty".to_string(),
            });
        }
        if self.framerate == 0 || self.framerate > 120 {
            return Err(MediaError::InvalidConfiguration {
                message: format!("framerate {} out of range 1-120", self.framerate),
            });
        }
        if self.width == 0 || self.height == 0 {
            return Err(MediaError::InvalidConfiguration {
                message: format!("invalid capture size {}x{}", self.width, self.height),
            });
        }
        Ok(())
    }

    fn input_args(&self) -> Vec<String> {
        vec![
            "-hide_banner".to_string(),
            "-loglevel".to_string(),
            "error".to_string(),
            "-f".to_string(),
            self.input_format.clone(),
            "-framerate".to_string(),
            self.framerate.to_string(),
            "-video_size".to_string(),
            format!("{}x{}", self.width, self.height),
            "-i".to_string(),
            self.device.clone(),
        ]
    }

    /// Arguments for the one-frame access probe
    pub fn probe_args(&self) -> Vec<String> {
        let mut args = self.input_args();
        args.extend(["-frames:v", "1", "-f", "null", "-"].map(String::from));
        args
    }

    /// Arguments for a recording to `encoder` written to stdout as WebM
    pub fn record_args(&self, encoder: &str) -> Vec<String> {
        let bitrate = format!("{}k", self.bitrate_kbps);
        let mut args = self.input_args();
        args.extend(
            [
                "-an",
                "-c:v",
                encoder,
                "-b:v",
                bitrate.as_str(),
                "-deadline",
                "realtime",
                "-cpu-used",
                "8",
                "-f",
                "webm",
                "pipe:1",
            ]
            .map(String::from),
        );
        args
    }
}

/// ffmpeg encoder implementing `format`, if any
pub fn encoder_for(format: &EncodingFormat) -> Option<&'static str> {
    if format.container != "webm" {
        return None;
    }
    match format.codec.as_str() {
        "vp9" => Some("libvpx-vp9"),
        "vp8" => Some("libvpx"),
        _ => None,
    }
}

/// Encoder names listed by `ffmpeg -encoders`
pub fn parse_encoders(listing: &str) -> HashSet<String> {
    listing
        .lines()
        .skip_while(|line| !line.trim_start().starts_with("---"))
        .skip(1)
        .filter_map(|line| {
            let mut fields = line.split_whitespace();
            let flags = fields.next()?;
            let name = fields.next()?;
            flags.starts_with('V').then(|| name.to_string())
        })
        .collect()
}

/// Classify a failed access probe from ffmpeg's stderr
pub fn classify_capture_error(stderr: &str) -> CaptureFailureKind {
    if stderr.contains("Permission denied") || stderr.contains("Operation not permitted") {
        CaptureFailureKind::PermissionDenied
    } else if stderr.contains("Device or resource busy") {
        CaptureFailureKind::DeviceBusy
    } else if stderr.contains("No such file or directory") || stderr.contains("No such device") {
        CaptureFailureKind::NoDevice
    } else {
        CaptureFailureKind::Other
    }
}

/// Classify an abnormal recorder exit from ffmpeg's stderr
pub fn classify_encoder_error(stderr: &str) -> EncoderFaultKind {
    if stderr.contains("Permission denied") || stderr.contains("Operation not permitted") {
        EncoderFaultKind::Security
    } else if stderr.contains("Device or resource busy") {
        EncoderFaultKind::InvalidState
    } else {
        EncoderFaultKind::Other
    }
}

fn last_line(stderr: &str) -> Option<String> {
    stderr
        .lines()
        .rev()
        .map(str::trim)
        .find(|line| !line.is_empty())
        .map(String::from)
}

fn runtime() -> MediaResult<tokio::runtime::Handle> {
    tokio::runtime::Handle::try_current().map_err(|e| MediaError::InvalidState {
        message: format!("ffmpeg backend needs a tokio runtime: {}", e),
    })
}

/// Run `ffmpeg -encoders` and return the video encoder names
pub async fn probe_encoders(config: &FfmpegConfig) -> MediaResult<HashSet<String>> {
    let output = tokio::time::timeout(
        config.probe_timeout,
        Command::new(&config.binary)
            .args(["-hide_banner", "-encoders"])
            .stdin(Stdio::null())
            .output(),
    )
    .await
    .map_err(|_| MediaError::ProcessFailed {
        program: config.binary.clone(),
        reason: "encoder probe timed out".to_string(),
    })??;

    if !output.status.success() {
        return Err(MediaError::ProcessFailed {
            program: config.binary.clone(),
            reason: format!("encoder probe exited with {}", output.status),
        });
    }
    Ok(parse_encoders(&String::from_utf8_lossy(&output.stdout)))
}

/// Capture one frame to check the device can be opened
pub async fn probe_device(config: &FfmpegConfig) -> Result<(), CaptureFailure> {
    let mut command = Command::new(&config.binary);
    command
        .args(config.probe_args())
        .stdin(Stdio::null())
        .kill_on_drop(true);

    let output = match tokio::time::timeout(config.probe_timeout, command.output()).await {
        Ok(Ok(output)) => output,
        Ok(Err(e)) => {
            let kind = match e.kind() {
                std::io::ErrorKind::NotFound => CaptureFailureKind::NoDevice,
                std::io::ErrorKind::PermissionDenied => CaptureFailureKind::PermissionDenied,
                _ => CaptureFailureKind::Other,
            };
            return Err(CaptureFailure::new(
                kind,
                format!("failed to run {}: {}", config.binary, e),
            ));
        }
        Err(_) => {
            return Err(CaptureFailure::new(
                CaptureFailureKind::DeviceBusy,
                format!("{} did not deliver a frame in time", config.device),
            ))
        }
    };

    if output.status.success() {
        return Ok(());
    }
    let stderr = String::from_utf8_lossy(&output.stderr);
    Err(CaptureFailure::new(
        classify_capture_error(&stderr),
        last_line(&stderr).unwrap_or_else(|| format!("ffmpeg exited with {}", output.status)),
    ))
}

/// Camera opened through ffmpeg
#[derive(Debug)]
pub struct FfmpegCaptureDevice {
    config: FfmpegConfig,
    events: mpsc::UnboundedSender<CaptureEvent>,
    encoders: Arc<RwLock<HashSet<String>>>,
}

impl FfmpegCaptureDevice {
    /// Create a device reporting to `events`
    pub fn new(config: FfmpegConfig, events: mpsc::UnboundedSender<CaptureEvent>) -> Self {
        Self {
            config,
            events,
            encoders: Arc::new(RwLock::new(HashSet::new())),
        }
    }

    /// Encoders found by the last probe
    pub fn encoders(&self) -> HashSet<String> {
        self.encoders.read().clone()
    }
}

impl CaptureDevice for FfmpegCaptureDevice {
    fn request_access(&mut self) -> MediaResult<()> {
        self.config.validate()?;
        let runtime = runtime()?;

        let config = self.config.clone();
        let events = self.events.clone();
        let encoders = self.encoders.clone();
        let device = self.describe();

        runtime.spawn(async move {
            let event = match probe_encoders(&config).await {
                Err(e) => CaptureEvent::Denied(CaptureFailure::new(
                    CaptureFailureKind::Other,
                    e.to_string(),
                )),
                Ok(found) => {
                    debug!("ffmpeg video encoders: {} found", found.len());
                    *encoders.write() = found;
                    match probe_device(&config).await {
                        Ok(()) => {
                            info!("Opened {} through {}", config.device, config.input_format);
                            CaptureEvent::Granted(MediaStream::new(device))
                        }
                        Err(failure) => CaptureEvent::Denied(failure),
                    }
                }
            };
            if events.send(event).is_err() {
                debug!("Capture event receiver gone");
            }
        });
        Ok(())
    }

    fn supports_format(&self, format: &EncodingFormat) -> bool {
        encoder_for(format)
            .map(|name| self.encoders.read().contains(name))
            .unwrap_or(false)
    }

    fn release(&mut self, stream: &MediaStream) {
        // The device is held only while a recorder process runs
        debug!("Released stream {} on {}", stream.id, stream.device.id);
    }

    fn describe(&self) -> DeviceInfo {
        DeviceInfo::new(
            self.config.device.clone(),
            format!("{} ({})", self.config.device, self.config.input_format),
        )
    }
}

/// Creates [`FfmpegRecorder`]s
#[derive(Debug)]
pub struct FfmpegRecorderFactory {
    config: FfmpegConfig,
    events: mpsc::UnboundedSender<RecorderEvent>,
}

impl FfmpegRecorderFactory {
    /// Create a factory whose recorders report to `events`
    pub fn new(config: FfmpegConfig, events: mpsc::UnboundedSender<RecorderEvent>) -> Self {
        Self { config, events }
    }
}

impl RecorderFactory for FfmpegRecorderFactory {
    fn create(
        &mut self,
        id: RecorderId,
        stream: &MediaStream,
        format: &EncodingFormat,
    ) -> Result<Box<dyn Recorder>, EncoderFault> {
        let encoder = encoder_for(format).ok_or_else(|| {
            EncoderFault::new(
                EncoderFaultKind::Other,
                format!("no ffmpeg encoder for {}", format),
            )
        })?;
        Ok(Box::new(FfmpegRecorder {
            config: self.config.clone(),
            encoder,
            id,
            stream: stream.id,
            events: self.events.clone(),
            stop: None,
        }))
    }
}

/// Recorder running one ffmpeg process per start
#[derive(Debug)]
pub struct FfmpegRecorder {
    config: FfmpegConfig,
    encoder: &'static str,
    id: RecorderId,
    stream: StreamId,
    events: mpsc::UnboundedSender<RecorderEvent>,
    // Closed once the process task has finished
    stop: Option<oneshot::Sender<()>>,
}

impl FfmpegRecorder {
    /// Whether an ffmpeg process is still running for this recorder
    pub fn is_running(&self) -> bool {
        self.stop.as_ref().is_some_and(|stop| !stop.is_closed())
    }
}

impl Recorder for FfmpegRecorder {
    fn start(&mut self, interval: Duration) -> Result<(), EncoderFault> {
        if self.is_running() {
            return Err(EncoderFault::new(
                EncoderFaultKind::InvalidState,
                "recorder is already running",
            ));
        }
        let runtime =
            runtime().map_err(|e| EncoderFault::new(EncoderFaultKind::Other, e.to_string()))?;
        let _guard = runtime.enter();

        let child = Command::new(&self.config.binary)
            .args(self.config.record_args(self.encoder))
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                let kind = match e.kind() {
                    std::io::ErrorKind::PermissionDenied => EncoderFaultKind::Security,
                    _ => EncoderFaultKind::Other,
                };
                EncoderFault::new(kind, format!("failed to start {}: {}", self.config.binary, e))
            })?;

        let (stop_tx, stop_rx) = oneshot::channel();
        self.stop = Some(stop_tx);
        runtime.spawn(run_recorder(
            child,
            self.id,
            self.stream,
            interval,
            stop_rx,
            self.events.clone(),
        ));
        Ok(())
    }

    fn stop(&mut self) {
        if let Some(stop) = self.stop.take() {
            if stop.send(()).is_err() {
                debug!("Recorder for stream {} already exited", self.stream);
            }
        }
    }
}

impl Drop for FfmpegRecorder {
    fn drop(&mut self) {
        Recorder::stop(self);
    }
}

/// Drive one ffmpeg process until it is stopped or exits.
///
/// Every exit path ends with `Stopped`, and the stop receiver is dropped
/// first so the recorder can be started again as soon as that is seen.
async fn run_recorder(
    mut child: Child,
    id: RecorderId,
    stream: StreamId,
    interval: Duration,
    mut stop: oneshot::Receiver<()>,
    events: mpsc::UnboundedSender<RecorderEvent>,
) {
    let emit = |kind: RecorderEventKind| {
        if events.send(RecorderEvent::new(id, stream, kind)).is_err() {
            debug!("Recorder event receiver gone for stream {}", stream);
        }
    };

    let (mut stdout, stderr) = match (child.stdout.take(), child.stderr.take()) {
        (Some(stdout), Some(stderr)) => (stdout, stderr),
        _ => {
            drop(stop);
            emit(RecorderEventKind::Fault(EncoderFault::new(
                EncoderFaultKind::Other,
                "ffmpeg pipes unavailable",
            )));
            emit(RecorderEventKind::Stopped);
            return;
        }
    };
    let stderr_task = tokio::spawn(async move {
        let mut stderr = stderr;
        let mut text = String::new();
        let _ = stderr.read_to_string(&mut text).await;
        text
    });

    let mut buffer = BytesMut::with_capacity(64 * 1024);
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    ticker.tick().await;
    let mut stdout_open = true;

    loop {
        tokio::select! {
            _ = &mut stop => {
                if let Some(mut stdin) = child.stdin.take() {
                    let _ = stdin.write_all(b"q").await;
                }
                let drain = async {
                    let mut rest = Vec::new();
                    let _ = stdout.read_to_end(&mut rest).await;
                    let _ = child.wait().await;
                    rest
                };
                match tokio::time::timeout(Duration::from_secs(2), drain).await {
                    Ok(rest) => buffer.extend_from_slice(&rest),
                    Err(_) => {
                        warn!("ffmpeg for stream {} ignored quit, killing", stream);
                        let _ = child.kill().await;
                    }
                }
                drop(stop);
                emit(RecorderEventKind::ChunkReady(buffer.split().freeze()));
                emit(RecorderEventKind::Stopped);
                return;
            }
            _ = ticker.tick() => {
                emit(RecorderEventKind::ChunkReady(buffer.split().freeze()));
            }
            read = stdout.read_buf(&mut buffer), if stdout_open => match read {
                Ok(0) => stdout_open = false,
                Ok(_) => {}
                Err(e) => {
                    warn!("Reading ffmpeg output failed: {}", e);
                    stdout_open = false;
                }
            },
            status = child.wait(), if !stdout_open => {
                drop(stop);
                if !buffer.is_empty() {
                    emit(RecorderEventKind::ChunkReady(buffer.split().freeze()));
                }
                let stderr = stderr_task.await.unwrap_or_default();
                match status {
                    Ok(status) if status.success() => {
                        info!("ffmpeg for stream {} finished", stream);
                    }
                    Ok(status) => {
                        let message = last_line(&stderr)
                            .unwrap_or_else(|| format!("ffmpeg exited with {}", status));
                        emit(RecorderEventKind::Fault(EncoderFault::new(
                            classify_encoder_error(&stderr),
                            message,
                        )));
                    }
                    Err(e) => {
                        emit(RecorderEventKind::Fault(EncoderFault::new(
                            EncoderFaultKind::Other,
                            e.to_string(),
                        )));
                    }
                }
                // The process is gone whatever the fault class
                emit(RecorderEventKind::Stopped);
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const LISTING: &str = "Encoders:
 V..... = Video
 A..... = Audio
 ------
 V....D libx264              libx264 H.264 / AVC / MPEG-4 AVC
 V....D libvpx               libvpx VP8 (codec vp8)
 V....D libvpx-vp9           libvpx VP9 (codec vp9)
 A....D libopus              libopus Opus (codec opus)
";

    #[test]
    fn test_parse_encoders() {
        let found = parse_encoders(LISTING);
        assert!(found.contains("libvpx"));
        assert!(found.contains("libvpx-vp9"));
        assert!(found.contains("libx264"));
        assert!(!found.contains("libopus"));
        assert!(!found.contains("="));
    }

    #[test]
    fn test_encoder_for_format() {
        assert_eq!(encoder_for(&EncodingFormat::webm_vp9()), Some("libvpx-vp9"));
        assert_eq!(encoder_for(&EncodingFormat::webm_vp8()), Some("libvpx"));
        assert_eq!(encoder_for(&EncodingFormat::new("mp4", "vp9")), None);
    }

    #[test]
    fn test_classify_capture_errors() {
        assert_eq!(
            classify_capture_error("/dev/video0: Permission denied"),
            CaptureFailureKind::PermissionDenied
        );
        assert_eq!(
            classify_capture_error("ioctl(VIDIOC_STREAMON): Device or resource busy"),
            CaptureFailureKind::DeviceBusy
        );
        assert_eq!(
            classify_capture_error("/dev/video9: No such file or directory"),
            CaptureFailureKind::NoDevice
        );
        assert_eq!(classify_capture_error("weird"), CaptureFailureKind::Other);
    }

    #[test]
    fn test_classify_encoder_errors() {
        assert_eq!(
            classify_encoder_error("Operation not permitted"),
            EncoderFaultKind::Security
        );
        assert_eq!(
            classify_encoder_error("Device or resource busy"),
            EncoderFaultKind::InvalidState
        );
        assert_eq!(
            classify_encoder_error("Conversion failed!"),
            EncoderFaultKind::Other
        );
    }

    #[test]
    fn test_record_args() {
        let config = FfmpegConfig::default();
        let args = config.record_args("libvpx-vp9");
        let joined = args.join(" ");
        assert!(joined.contains("-f v4l2"));
        assert!(joined.contains("-i /dev/video0"));
        assert!(joined.contains("-video_size 640x480"));
        assert!(joined.contains("-an -c:v libvpx-vp9 -b:v 1000k"));
        assert!(joined.ends_with("-f webm pipe:1"));

        let probe = config.probe_args().join(" ");
        assert!(probe.ends_with("-frames:v 1 -f null -"));
    }

    #[test]
    fn test_validate() {
        assert!(FfmpegConfig::default().validate().is_ok());
        let config = FfmpegConfig {
            framerate: 0,
            ..FfmpegConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_last_line() {
        assert_eq!(last_line("a\nb\n\n"), Some("b".to_string()));
        assert_eq!(last_line("  \n"), None);
    }
}
