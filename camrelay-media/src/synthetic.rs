//! Synthetic capture device and recorder
//!
//! Stand-ins for real hardware: the device answers access requests at once
//! (granting, or refusing with a configured failure) and recorders emit
//! deterministic chunks on the interval. Used by the demo binary and tests.

use crate::capture::{CaptureDevice, CaptureEvent, CaptureFailure, DeviceInfo, MediaStream, StreamId};
use crate::encoder::{
    EncoderFault, Recorder, RecorderEvent, RecorderEventKind, RecorderFactory, RecorderId,
};
use crate::error::MediaResult;
use crate::format::EncodingFormat;
use bytes::{BufMut, Bytes, BytesMut};
use camrelay_core::EncoderFaultKind;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tracing::debug;

/// Device that answers access requests immediately
#[derive(Debug)]
pub struct SyntheticDevice {
    events: mpsc::UnboundedSender<CaptureEvent>,
    info: DeviceInfo,
    formats: Vec<EncodingFormat>,
    denial: Option<CaptureFailure>,
}

impl SyntheticDevice {
    /// Device that grants access and supports every default format
    pub fn new(events: mpsc::UnboundedSender<CaptureEvent>) -> Self {
        Self {
            events,
            info: DeviceInfo::new("synthetic0", "Synthetic camera"),
            formats: EncodingFormat::default_preferences(),
            denial: None,
        }
    }

    /// Refuse access with `failure`
    pub fn denying(mut self, failure: CaptureFailure) -> Self {
        self.denial = Some(failure);
        self
    }

    /// Restrict the formats the device claims to support
    pub fn with_formats(mut self, formats: Vec<EncodingFormat>) -> Self {
        self.formats = formats;
        self
    }
}

impl CaptureDevice for SyntheticDevice {
    fn request_access(&mut self) -> MediaResult<()> {
        let event = match &self.denial {
            Some(failure) => CaptureEvent::Denied(failure.clone()),
            None => CaptureEvent::Granted(MediaStream::new(self.info.clone())),
        };
        if self.events.send(event).is_err() {
            debug!("Capture event receiver gone");
        }
        Ok(())
    }

    fn supports_format(&self, format: &EncodingFormat) -> bool {
        self.formats.contains(format)
    }

    fn release(&mut self, stream: &MediaStream) {
        debug!("Released synthetic stream {}", stream.id);
    }

    fn describe(&self) -> DeviceInfo {
        self.info.clone()
    }
}

/// Creates [`SyntheticRecorder`]s
#[derive(Debug)]
pub struct SyntheticRecorderFactory {
    events: mpsc::UnboundedSender<RecorderEvent>,
    chunk_size: usize,
}

impl SyntheticRecorderFactory {
    /// Factory whose recorders emit `chunk_size` byte chunks
    pub fn new(events: mpsc::UnboundedSender<RecorderEvent>, chunk_size: usize) -> Self {
        Self { events, chunk_size }
    }
}

impl RecorderFactory for SyntheticRecorderFactory {
    fn create(
        &mut self,
        id: RecorderId,
        stream: &MediaStream,
        _format: &EncodingFormat,
    ) -> Result<Box<dyn Recorder>, EncoderFault> {
        Ok(Box::new(SyntheticRecorder {
            id,
            stream: stream.id,
            events: self.events.clone(),
            chunk_size: self.chunk_size,
            stop: None,
        }))
    }
}

/// Recorder emitting numbered chunks
#[derive(Debug)]
pub struct SyntheticRecorder {
    id: RecorderId,
    stream: StreamId,
    events: mpsc::UnboundedSender<RecorderEvent>,
    chunk_size: usize,
    stop: Option<oneshot::Sender<()>>,
}

/// Build the chunk with sequence number `seq`: the big-endian sequence
/// followed by filler up to `size` bytes
pub fn synthetic_chunk(seq: u64, size: usize) -> Bytes {
    let mut chunk = BytesMut::with_capacity(size.max(8));
    chunk.put_u64(seq);
    while chunk.len() < size {
        chunk.put_u8((seq % 251) as u8);
    }
    chunk.freeze()
}

impl Recorder for SyntheticRecorder {
    fn start(&mut self, interval: Duration) -> Result<(), EncoderFault> {
        if self.stop.as_ref().is_some_and(|stop| !stop.is_closed()) {
            return Err(EncoderFault::new(
                EncoderFaultKind::InvalidState,
                "recorder is already running",
            ));
        }
        let runtime = tokio::runtime::Handle::try_current()
            .map_err(|e| EncoderFault::new(EncoderFaultKind::Other, e.to_string()))?;

        let (stop_tx, mut stop_rx) = oneshot::channel();
        self.stop = Some(stop_tx);

        let (id, stream) = (self.id, self.stream);
        let events = self.events.clone();
        let size = self.chunk_size;
        runtime.spawn(async move {
            let emit = |kind| events.send(RecorderEvent::new(id, stream, kind)).is_ok();
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            let mut seq = 0u64;
            loop {
                tokio::select! {
                    _ = &mut stop_rx => {
                        emit(RecorderEventKind::Stopped);
                        return;
                    }
                    _ = ticker.tick() => {
                        if !emit(RecorderEventKind::ChunkReady(synthetic_chunk(seq, size))) {
                            return;
                        }
                        seq += 1;
                    }
                }
            }
        });
        Ok(())
    }

    fn stop(&mut self) {
        if let Some(stop) = self.stop.take() {
            let _ = stop.send(());
        }
    }
}

impl Drop for SyntheticRecorder {
    fn drop(&mut self) {
        Recorder::stop(self);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_chunk_layout() {
        let chunk = synthetic_chunk(3, 16);
        assert_eq!(chunk.len(), 16);
        assert_eq!(&chunk[..8], &3u64.to_be_bytes());
        assert!(chunk[8..].iter().all(|b| *b == 3));

        assert_eq!(synthetic_chunk(1, 0).len(), 8);
    }

    #[test]
    fn test_device_grants_immediately() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut device = SyntheticDevice::new(tx);
        device.request_access().unwrap();
        assert!(matches!(rx.try_recv(), Ok(CaptureEvent::Granted(_))));
        assert!(device.supports_format(&EncodingFormat::webm_vp8()));
    }
}
