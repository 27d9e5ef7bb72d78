//! Synthetic session demo
//!
//! Runs a loopback WebSocket endpoint that answers every chunk with a small
//! generated image, then records from the synthetic camera for two seconds.

use camrelay::{
    init_logging, ChannelNotifier, FrameDisplay, SessionBuilder, SessionSettings,
    SoftwareSurface, StatusFilter,
};
use futures::{SinkExt, StreamExt};
use image::{ImageFormat, Rgba, RgbaImage};
use std::io::Cursor;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio_tungstenite::tungstenite::Message;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    init_logging("info");

    println!("🔄 Starting loopback endpoint");
    let endpoint = spawn_endpoint().await?;

    let surface = SoftwareSurface::new();
    let view = surface.view();
    let (notifier, mut notes) = ChannelNotifier::new();

    let settings = SessionSettings {
        endpoint: endpoint.clone(),
        chunk_interval: Duration::from_millis(100),
        connect_on_startup: true,
    };
    let runtime = SessionBuilder::new(settings)
        .synthetic(2048)
        .display(Box::new(FrameDisplay::new(surface)))
        .notifier(Arc::new(notifier))
        .build()?;
    let (session, task) = runtime.spawn();

    let mut status = session.subscribe().with_filter(StatusFilter::quiet());
    tokio::spawn(async move {
        while let Some(update) = status.next().await {
            println!("📡 {}: {:?}", update.event.event_type(), update.event);
        }
    });

    // Presenter: finish a render every 50ms
    let presenter = {
        let view = view.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_millis(50));
            loop {
                ticker.tick().await;
                view.complete_render();
            }
        })
    };

    println!("🎥 Recording to {} for 2 seconds", endpoint);
    session.start().await?;
    tokio::time::sleep(Duration::from_secs(2)).await;
    session.stop().await?;
    session.shutdown().await?;

    let controller = task.await?;
    presenter.abort();

    let channel = controller.channel_stats();
    let display = controller.display_stats();
    println!("📊 Session summary:");
    println!("   Chunks sent: {} ({} bytes)", channel.messages_sent, channel.bytes_sent);
    println!("   Frames received: {}", display.frames_received);
    println!("   Frames displayed: {}", display.frames_displayed);
    println!("   Frames dropped: {}", display.frames_dropped);
    println!("   Renders completed: {}", view.rendered_frames());

    while let Ok(note) = notes.try_recv() {
        println!("⚠️  {}: {}", note.title, note.body);
    }
    Ok(())
}

/// Endpoint answering each binary chunk with a PNG whose shade follows the chunk number
async fn spawn_endpoint() -> Result<String, Box<dyn std::error::Error>> {
    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let addr = listener.local_addr()?;

    tokio::spawn(async move {
        while let Ok((stream, _)) = listener.accept().await {
            tokio::spawn(async move {
                let Ok(mut ws) = tokio_tungstenite::accept_async(stream).await else {
                    return;
                };
                let mut shade = 0u8;
                while let Some(Ok(msg)) = ws.next().await {
                    match msg {
                        Message::Binary(_) => {
                            shade = shade.wrapping_add(16);
                            let Some(frame) = render(shade) else {
                                continue;
                            };
                            if ws.send(Message::Binary(frame)).await.is_err() {
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

    Ok(format!("ws://{}/ws/video", addr))
}

fn render(shade: u8) -> Option<Vec<u8>> {
    let image = RgbaImage::from_pixel(64, 48, Rgba([shade, 64, 255 - shade, 255]));
    let mut out = Cursor::new(Vec::new());
    image.write_to(&mut out, ImageFormat::Png).ok()?;
    Some(out.into_inner())
}
