//! End-to-end runtime tests: synthetic capture, real WebSocket transport and
//! a loopback server answering every chunk with an image

use camrelay::{
    ChannelNotifier, ConnectionConfig, FrameDisplay, SessionBuilder, SessionPhase,
    SessionSettings, SoftwareSurface, StatusEvent, StatusStream,
};
use futures::{SinkExt, StreamExt};
use image::{ImageFormat, Rgba, RgbaImage};
use parking_lot::Mutex;
use std::io::Cursor;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio_test::{assert_err, assert_ok};
use tokio_tungstenite::tungstenite::Message;

const CHUNK_SIZE: usize = 64;

fn png() -> Vec<u8> {
    let image = RgbaImage::from_pixel(6, 4, Rgba([255, 0, 0, 255]));
    let mut out = Cursor::new(Vec::new());
    image.write_to(&mut out, ImageFormat::Png).unwrap();
    out.into_inner()
}

/// Server replying to each binary chunk with a PNG; records chunk sizes
async fn image_server(received: Arc<Mutex<Vec<usize>>>) -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let frame = png();

    tokio::spawn(async move {
        while let Ok((stream, _)) = listener.accept().await {
            let received = received.clone();
            let frame = frame.clone();
            tokio::spawn(async move {
                let mut ws = match tokio_tungstenite::accept_async(stream).await {
                    Ok(ws) => ws,
                    Err(_) => return,
                };
                while let Some(Ok(msg)) = ws.next().await {
                    match msg {
                        Message::Binary(data) => {
                            received.lock().push(data.len());
                            if ws.send(Message::Binary(frame.clone())).await.is_err() {
                                break;
                            }
                        }
                        Message::Close(_) => break,
                        _ => {}
                    }
                }
            });
        }
    });

    format!("ws://{}/ws/video", addr)
}

async fn wait_for<F>(status: &mut StatusStream, mut matches: F) -> StatusEvent
where
    F: FnMut(&StatusEvent) -> bool,
{
    tokio::time::timeout(Duration::from_secs(10), async {
        loop {
            let update = status.next().await.expect("status stream ended");
            if matches(&update.event) {
                return update.event;
            }
        }
    })
    .await
    .expect("timed out waiting for status event")
}

fn settings(endpoint: String) -> SessionSettings {
    SessionSettings {
        endpoint,
        chunk_interval: Duration::from_millis(20),
        connect_on_startup: false,
    }
}

#[tokio::test]
async fn test_chunks_out_frames_back() {
    let received = Arc::new(Mutex::new(Vec::new()));
    let endpoint = image_server(received.clone()).await;

    let surface = SoftwareSurface::new();
    let view = surface.view();
    let (notifier, mut notes) = ChannelNotifier::new();

    let runtime = SessionBuilder::new(settings(endpoint))
        .synthetic(CHUNK_SIZE)
        .connection_config(ConnectionConfig::with_timeout(Duration::from_secs(2)))
        .display(Box::new(FrameDisplay::new(surface)))
        .notifier(Arc::new(notifier))
        .build()
        .unwrap();
    let (session, task) = runtime.spawn();
    let mut status = session.subscribe();

    assert_ok!(session.start().await);
    wait_for(&mut status, |e| {
        matches!(e, StatusEvent::PhaseChanged { to: SessionPhase::Recording, .. })
    })
    .await;
    wait_for(&mut status, |e| matches!(e, StatusEvent::ChunkSent { bytes } if *bytes == CHUNK_SIZE)).await;
    wait_for(&mut status, |e| matches!(e, StatusEvent::FrameDisplayed { .. })).await;

    let frame = view.pending_frame().expect("frame awaiting render");
    assert_eq!((frame.width(), frame.height()), (6, 4));
    view.complete_render();

    assert_ok!(session.stop().await);
    wait_for(&mut status, |e| {
        matches!(e, StatusEvent::PhaseChanged { to: SessionPhase::Stopped, .. })
    })
    .await;

    session.shutdown().await.unwrap();
    let controller = task.await.unwrap();

    assert!(controller.channel_stats().messages_sent >= 1);
    assert!(controller.display_stats().frames_displayed >= 1);
    assert!(received.lock().iter().all(|len| *len == CHUNK_SIZE));
    assert!(notes.try_recv().is_err());
    assert!(session.is_closed());
}

#[tokio::test]
async fn test_unreachable_endpoint_is_notified() {
    // Bind then drop to get a port nothing listens on
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);

    let (notifier, mut notes) = ChannelNotifier::new();
    let runtime = SessionBuilder::new(settings(format!("ws://{}/ws/video", addr)))
        .synthetic(CHUNK_SIZE)
        .connection_config(ConnectionConfig::with_timeout(Duration::from_secs(2)))
        .notifier(Arc::new(notifier))
        .build()
        .unwrap();
    let (session, task) = runtime.spawn();
    let mut status = session.subscribe();

    session.start().await.unwrap();
    wait_for(&mut status, |e| {
        matches!(e, StatusEvent::PhaseChanged { from: SessionPhase::AwaitingConnection, to: SessionPhase::Stopped })
    })
    .await;

    let note = notes.recv().await.unwrap();
    assert_eq!(note.title, "Connection Error");
    assert!(note.body.starts_with("Connection error: "));

    session.shutdown().await.unwrap();
    let controller = task.await.unwrap();
    assert_eq!(controller.channel_stats().connects, 1);
    assert_eq!(controller.channel_stats().messages_sent, 0);
}

#[tokio::test]
async fn test_build_requires_capture_backend() {
    let err = SessionBuilder::new(SessionSettings::default())
        .build()
        .unwrap_err();
    assert_eq!(err.error_code(), "INVALID_CONFIGURATION");

    let err = SessionBuilder::new(SessionSettings {
        chunk_interval: Duration::ZERO,
        ..SessionSettings::default()
    })
    .synthetic(CHUNK_SIZE)
    .build()
    .unwrap_err();
    assert_eq!(err.error_code(), "INVALID_CONFIGURATION");
}

#[tokio::test]
async fn test_handle_reports_ended_session() {
    let runtime = SessionBuilder::new(settings("ws://127.0.0.1:9/ws/video".to_string()))
        .synthetic(CHUNK_SIZE)
        .build()
        .unwrap();
    let (session, task) = runtime.spawn();

    session.shutdown().await.unwrap();
    task.await.unwrap();

    let err = assert_err!(session.start().await);
    assert_eq!(err.error_code(), "INVALID_STATE");
}
