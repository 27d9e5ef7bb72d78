//! # camrelay media
//!
//! Capture source, chunk encoder and frame display for camrelay, plus the
//! ffmpeg-backed and synthetic device implementations.

#![warn(clippy::all)]

pub mod capture;
pub mod display;
pub mod encoder;
pub mod error;
pub mod ffmpeg;
pub mod format;
pub mod software;
pub mod synthetic;

// Re-export main types
pub use capture::{
    CaptureDevice, CaptureEvent, CaptureFailure, CaptureFailureKind, CaptureOutcome,
    CaptureSource, CaptureState, DeviceInfo, MediaStream, PreviewSink, StreamId,
};
pub use display::{
    DisplayHandle, DisplayStats, DisplaySurface, FrameDisplay, FrameOutcome, FrameSink, NullSink,
};
pub use encoder::{
    ChunkDisposition, ChunkEncoder, EncoderFault, EncoderState, EncoderStats, Recorder,
    RecorderEvent, RecorderEventKind, RecorderFactory, RecorderId, DEFAULT_CHUNK_INTERVAL,
};
pub use error::{ErrorCategory, MediaError, MediaResult};
pub use ffmpeg::{FfmpegCaptureDevice, FfmpegConfig, FfmpegRecorder, FfmpegRecorderFactory};
pub use format::{select_format, EncodingFormat};
pub use software::{DecodedFrame, SoftwareSurface, SurfaceView};
pub use synthetic::{synthetic_chunk, SyntheticDevice, SyntheticRecorder, SyntheticRecorderFactory};
