//! Frame display
//!
//! Each inbound message is one complete image. [`FrameDisplay`] shows it on a
//! [`DisplaySurface`] unless the surface is still rendering the previous one,
//! in which case the new frame is dropped. At most one display handle is live
//! at a time: the previous handle is released before the next is acquired.

use crate::error::MediaResult;
use serde::{Deserialize, Serialize};
use std::fmt;
use tracing::{debug, warn};

/// Handle to a displayable object owned by a surface
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DisplayHandle(pub u64);

impl fmt::Display for DisplayHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "display#{}", self.0)
    }
}

/// Rendering target for decoded frames
pub trait DisplaySurface: Send {
    /// Decoded image type
    type Frame;

    /// Whether the previously assigned frame is still being rendered
    fn is_render_pending(&self) -> bool;

    /// Decode one inbound message into an image
    fn decode(&mut self, data: &[u8]) -> MediaResult<Self::Frame>;

    /// Turn a decoded image into a displayable object
    fn acquire(&mut self, frame: Self::Frame) -> DisplayHandle;

    /// Free the resources behind a displayable object
    fn release(&mut self, handle: DisplayHandle);

    /// Make `handle` the one shown
    fn assign(&mut self, handle: DisplayHandle);
}

/// What happened to an inbound frame
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameOutcome {
    /// Shown under this handle
    Displayed(DisplayHandle),
    /// Previous render still pending, frame discarded
    Dropped,
    /// Frame could not be decoded
    Rejected,
}

/// Display counters
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DisplayStats {
    /// Frames received
    pub frames_received: u64,
    /// Frames shown
    pub frames_displayed: u64,
    /// Frames dropped while a render was pending
    pub frames_dropped: u64,
    /// Frames that failed to decode
    pub frames_rejected: u64,
    /// Handles released
    pub handles_released: u64,
}

/// Object-safe view of a frame display
pub trait FrameSink: Send {
    /// Handle one inbound frame
    fn on_frame(&mut self, data: &[u8]) -> FrameOutcome;

    /// Release the current handle
    fn clear(&mut self);

    /// Counters
    fn stats(&self) -> DisplayStats;
}

/// Frame display over a surface
#[derive(Debug)]
pub struct FrameDisplay<S> {
    surface: S,
    current: Option<DisplayHandle>,
    stats: DisplayStats,
}

impl<S: DisplaySurface> FrameDisplay<S> {
    /// Create a display over `surface`
    pub fn new(surface: S) -> Self {
        Self {
            surface,
            current: None,
            stats: DisplayStats::default(),
        }
    }

    /// The surface
    pub fn surface(&self) -> &S {
        &self.surface
    }

    /// Mutable access to the surface
    pub fn surface_mut(&mut self) -> &mut S {
        &mut self.surface
    }

    /// Handle currently shown
    pub fn current_handle(&self) -> Option<DisplayHandle> {
        self.current
    }

    /// Show an inbound frame unless a render is still pending
    pub fn on_frame(&mut self, data: &[u8]) -> FrameOutcome {
        self.stats.frames_received += 1;

        if self.surface.is_render_pending() {
            self.stats.frames_dropped += 1;
            debug!("Drop image");
            return FrameOutcome::Dropped;
        }

        let frame = match self.surface.decode(data) {
            Ok(frame) => frame,
            Err(e) => {
                self.stats.frames_rejected += 1;
                warn!("Discarding undecodable frame ({} bytes): {}", data.len(), e);
                return FrameOutcome::Rejected;
            }
        };

        if let Some(previous) = self.current.take() {
            self.surface.release(previous);
            self.stats.handles_released += 1;
        }

        let handle = self.surface.acquire(frame);
        self.surface.assign(handle);
        self.current = Some(handle);
        self.stats.frames_displayed += 1;
        FrameOutcome::Displayed(handle)
    }

    /// Release the current handle
    pub fn clear(&mut self) {
        if let Some(previous) = self.current.take() {
            self.surface.release(previous);
            self.stats.handles_released += 1;
        }
    }

    /// Counters
    pub fn stats(&self) -> &DisplayStats {
        &self.stats
    }
}

impl<S: DisplaySurface> FrameSink for FrameDisplay<S> {
    fn on_frame(&mut self, data: &[u8]) -> FrameOutcome {
        FrameDisplay::on_frame(self, data)
    }

    fn clear(&mut self) {
        FrameDisplay::clear(self)
    }

    fn stats(&self) -> DisplayStats {
        self.stats.clone()
    }
}

/// Sink that discards every frame
#[derive(Debug, Default)]
pub struct NullSink {
    stats: DisplayStats,
}

impl FrameSink for NullSink {
    fn on_frame(&mut self, _data: &[u8]) -> FrameOutcome {
        self.stats.frames_received += 1;
        self.stats.frames_dropped += 1;
        FrameOutcome::Dropped
    }

    fn clear(&mut self) {}

    fn stats(&self) -> DisplayStats {
        self.stats.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::MediaError;
    use std::collections::HashSet;

    #[derive(Default)]
    struct FakeSurface {
        pending: bool,
        next: u64,
        live: HashSet<DisplayHandle>,
        assigned: Option<DisplayHandle>,
        max_live: usize,
    }

    impl DisplaySurface for FakeSurface {
        type Frame = Vec<u8>;

        fn is_render_pending(&self) -> bool {
            self.pending
        }

        fn decode(&mut self, data: &[u8]) -> MediaResult<Vec<u8>> {
            if data.is_empty() {
                return Err(MediaError::DecodingFailed {
                    reason: "empty".to_string(),
                });
            }
            Ok(data.to_vec())
        }

        fn acquire(&mut self, _frame: Vec<u8>) -> DisplayHandle {
            self.next += 1;
            let handle = DisplayHandle(self.next);
            self.live.insert(handle);
            self.max_live = self.max_live.max(self.live.len());
            handle
        }

        fn release(&mut self, handle: DisplayHandle) {
            self.live.remove(&handle);
        }

        fn assign(&mut self, handle: DisplayHandle) {
            self.assigned = Some(handle);
        }
    }

    #[test]
    fn test_replaces_handle() {
        let mut display = FrameDisplay::new(FakeSurface::default());

        for _ in 0..10 {
            assert!(matches!(display.on_frame(b"jpeg"), FrameOutcome::Displayed(_)));
        }

        let surface = display.surface();
        assert_eq!(surface.live.len(), 1);
        assert_eq!(surface.max_live, 1);
        assert_eq!(surface.assigned, display.current_handle());
        assert_eq!(display.stats().handles_released, 9);
    }

    #[test]
    fn test_drops_while_render_pending() {
        let mut display = FrameDisplay::new(FakeSurface::default());
        let first = display.on_frame(b"one");

        display.surface_mut().pending = true;
        assert_eq!(display.on_frame(b"two"), FrameOutcome::Dropped);
        assert_eq!(display.on_frame(b"three"), FrameOutcome::Dropped);

        if let FrameOutcome::Displayed(handle) = first {
            assert_eq!(display.current_handle(), Some(handle));
        } else {
            panic!("first frame should display");
        }
        assert_eq!(display.stats().frames_dropped, 2);
    }

    #[test]
    fn test_undecodable_keeps_previous_frame() {
        let mut display = FrameDisplay::new(FakeSurface::default());
        display.on_frame(b"one");
        let shown = display.current_handle();

        assert_eq!(display.on_frame(b""), FrameOutcome::Rejected);
        assert_eq!(display.current_handle(), shown);
        assert_eq!(display.stats().frames_rejected, 1);
    }

    #[test]
    fn test_clear_releases_handle() {
        let mut display = FrameDisplay::new(FakeSurface::default());
        display.on_frame(b"one");
        display.clear();
        display.clear();

        assert!(display.surface().live.is_empty());
        assert_eq!(display.current_handle(), None);
    }
}
