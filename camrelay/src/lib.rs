//! # camrelay
//!
//! Streams a live camera capture to a WebSocket endpoint as encoded chunks
//! and shows the processed frames the endpoint sends back.
//!
//! ## Key Features
//!
//! - **One control surface**: idempotent `start`/`stop` over a capture
//!   source, a chunk encoder and a duplex channel that become ready in any order
//! - **Live-stream semantics**: chunks that cannot be sent right away are
//!   dropped, never buffered
//! - **Bounded display**: a frame arriving while the previous one is still
//!   rendering is discarded
//! - **Pluggable backends**: ffmpeg or synthetic capture, WebSocket or custom transport
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use camrelay::{RelayConfig, StatusFilter};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let mut config = RelayConfig::default();
//!     config.capture.backend = camrelay::CaptureBackend::Synthetic;
//!
//!     let runtime = config.session_builder()?.build()?;
//!     let (session, task) = runtime.spawn();
//!
//!     let mut status = session.subscribe().with_filter(StatusFilter::quiet());
//!     session.start().await?;
//!
//!     while let Some(update) = status.next().await {
//!         println!("{}: {:?}", update.event.event_type(), update.event);
//!     }
//!
//!     session.shutdown().await?;
//!     task.await?;
//!     Ok(())
//! }
//! ```

#![deny(missing_docs)]
#![warn(clippy::all)]

// Re-export the subsystem types sessions are assembled from
pub use camrelay_core::{
    derive_endpoint, ChannelBackend, ChannelEvent, ChannelEventKind, ChannelState,
    ConnectionConfig, ConnectionId, RelayError, WebSocketBackend,
};
pub use camrelay_media::{
    CaptureDevice, CaptureEvent, CaptureFailure, CaptureFailureKind, CaptureState, EncodingFormat,
    FfmpegConfig, FrameDisplay, FrameSink, MediaStream, RecorderEvent, RecorderEventKind,
    RecorderFactory, SoftwareSurface, SurfaceView,
};

// Public API modules
pub mod config;
pub mod event;
pub mod logging;
pub mod notify;
pub mod runtime;
pub mod session;

// Re-export main API types
pub use config::{CaptureBackend, RelayConfig};
pub use event::{
    DropReason, SessionEvent, SessionPhase, StatusEvent, StatusFilter, StatusStream, StatusUpdate,
};
pub use logging::init_logging;
pub use notify::{ChannelNotifier, Notification, Notifier, TracingNotifier};
pub use runtime::{Command, SessionBuilder, SessionHandle, SessionRuntime};
pub use session::{Intent, SessionController, SessionSettings, UNSUPPORTED_FORMAT_BODY};
