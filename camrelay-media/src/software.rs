//! Software display surface
//!
//! Decodes inbound images with the `image` crate into RGBA buffers. Assigning
//! a handle marks a render as pending until a presenter picks the frame up
//! through a [`SurfaceView`] and reports completion.

use crate::display::{DisplayHandle, DisplaySurface};
use crate::error::{MediaError, MediaResult};
use image::RgbaImage;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;
use tracing::debug;

/// A decoded frame ready to present
#[derive(Debug, Clone)]
pub struct DecodedFrame {
    /// RGBA pixels
    pub image: RgbaImage,
    /// Time the frame was decoded
    pub decoded_at: Instant,
}

impl DecodedFrame {
    /// Width in pixels
    pub fn width(&self) -> u32 {
        self.image.width()
    }

    /// Height in pixels
    pub fn height(&self) -> u32 {
        self.image.height()
    }
}

#[derive(Debug, Default)]
struct SurfaceState {
    next_handle: u64,
    handles: HashMap<DisplayHandle, Arc<DecodedFrame>>,
    assigned: Option<DisplayHandle>,
    pending: Option<Arc<DecodedFrame>>,
    rendered: u64,
}

/// Display surface backed by in-memory RGBA buffers
#[derive(Debug, Clone, Default)]
pub struct SoftwareSurface {
    state: Arc<Mutex<SurfaceState>>,
}

impl SoftwareSurface {
    /// Create an empty surface
    pub fn new() -> Self {
        Self::default()
    }

    /// Presenter-side view sharing this surface's state
    pub fn view(&self) -> SurfaceView {
        SurfaceView {
            state: self.state.clone(),
        }
    }
}

impl DisplaySurface for SoftwareSurface {
    type Frame = DecodedFrame;

    fn is_render_pending(&self) -> bool {
        self.state.lock().pending.is_some()
    }

    fn decode(&mut self, data: &[u8]) -> MediaResult<DecodedFrame> {
        let image = image::load_from_memory(data).map_err(|e| MediaError::DecodingFailed {
            reason: e.to_string(),
        })?;
        Ok(DecodedFrame {
            image: image.to_rgba8(),
            decoded_at: Instant::now(),
        })
    }

    fn acquire(&mut self, frame: DecodedFrame) -> DisplayHandle {
        let mut state = self.state.lock();
        state.next_handle += 1;
        let handle = DisplayHandle(state.next_handle);
        state.handles.insert(handle, Arc::new(frame));
        handle
    }

    fn release(&mut self, handle: DisplayHandle) {
        let mut state = self.state.lock();
        if state.handles.remove(&handle).is_none() {
            debug!("Release of unknown handle {}", handle);
        }
        if state.assigned == Some(handle) {
            state.assigned = None;
        }
    }

    fn assign(&mut self, handle: DisplayHandle) {
        let mut state = self.state.lock();
        let frame = state.handles.get(&handle).cloned();
        state.assigned = Some(handle);
        state.pending = frame;
    }
}

/// Presenter-side access to a [`SoftwareSurface`]
#[derive(Debug, Clone)]
pub struct SurfaceView {
    state: Arc<Mutex<SurfaceState>>,
}

impl SurfaceView {
    /// Frame awaiting render, if any
    pub fn pending_frame(&self) -> Option<Arc<DecodedFrame>> {
        self.state.lock().pending.clone()
    }

    /// Mark the pending frame as rendered
    pub fn complete_render(&self) {
        let mut state = self.state.lock();
        if state.pending.take().is_some() {
            state.rendered += 1;
        }
    }

    /// Frame currently assigned
    pub fn current_frame(&self) -> Option<Arc<DecodedFrame>> {
        let state = self.state.lock();
        state
            .assigned
            .and_then(|handle| state.handles.get(&handle).cloned())
    }

    /// Number of handles not yet released
    pub fn live_handles(&self) -> usize {
        self.state.lock().handles.len()
    }

    /// Renders completed so far
    pub fn rendered_frames(&self) -> u64 {
        self.state.lock().rendered
    }
}
