//! camrelay — entry point.
//!
//! ```text
//! camrelay                        Stream with camrelay.toml or defaults
//! camrelay --config <path>        Use custom config TOML
//! camrelay --synthetic            Generated chunks instead of a camera
//! camrelay --gen-config           Dump default config and exit
//! ```
//!
//! Type `start`, `stop` or `quit` on stdin to control the session.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{error, info, warn};

use camrelay::{
    init_logging, CaptureBackend, FrameDisplay, RelayConfig, SessionHandle, SoftwareSurface,
    StatusStream, SurfaceView,
};
use camrelay_media::DecodedFrame;

// ── CLI ──────────────────────────────────────────────────────────

#[derive(Parser, Debug)]
#[command(name = "camrelay", about = "Stream a camera to a WebSocket endpoint")]
struct Cli {
    /// Path to configuration TOML file.
    #[arg(short, long, default_value = "camrelay.toml")]
    config: PathBuf,

    /// Page URL the endpoint is derived from (overrides config).
    /// Example: https://cam.example.com/
    #[arg(short, long)]
    page_url: Option<String>,

    /// Capture device (overrides config). Example: /dev/video2
    #[arg(short, long)]
    device: Option<String>,

    /// Use the synthetic capture backend.
    #[arg(long)]
    synthetic: bool,

    /// Print status events as JSON lines.
    #[arg(long)]
    json: bool,

    /// Print the default configuration to stdout and exit.
    #[arg(long)]
    gen_config: bool,
}

// ── Main ─────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    if cli.gen_config {
        println!("{}", RelayConfig::default().to_toml_string()?);
        return Ok(());
    }

    let mut config = RelayConfig::load(&cli.config);
    if let Some(page_url) = cli.page_url {
        config.endpoint.page_url = page_url;
    }
    if let Some(device) = cli.device {
        config.capture.device = device;
    }
    if cli.synthetic {
        config.capture.backend = CaptureBackend::Synthetic;
    }

    init_logging(&config.logging.level);
    info!("camrelay v{}", env!("CARGO_PKG_VERSION"));

    let surface = SoftwareSurface::new();
    let view = surface.view();
    let runtime = config
        .session_builder()
        .context("invalid configuration")?
        .display(Box::new(FrameDisplay::new(surface)))
        .build()?;
    info!("Streaming to {}", runtime.controller().settings().endpoint);

    let (session, task) = runtime.spawn();

    let printer = tokio::spawn(print_status(session.subscribe(), cli.json));
    let presenter = tokio::spawn(present(
        view,
        config.output_path(),
        config.display.max_fps,
    ));

    if let Err(e) = read_commands(&session).await {
        error!("stdin: {e}");
    }

    if session.shutdown().await.is_err() {
        warn!("session already ended");
    }
    let controller = task.await.context("session task failed")?;
    presenter.abort();
    let _ = printer.await;

    let channel = controller.channel_stats();
    let shown = controller.display_stats();
    info!(
        "sent {} chunks ({} bytes), displayed {} of {} frames",
        channel.messages_sent,
        channel.bytes_sent,
        shown.frames_displayed,
        shown.frames_received
    );
    Ok(())
}

// ── Commands ─────────────────────────────────────────────────────

async fn read_commands(session: &SessionHandle) -> anyhow::Result<()> {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        let line = tokio::select! {
            line = lines.next_line() => line?,
            _ = tokio::signal::ctrl_c() => None,
        };
        let Some(line) = line else {
            return Ok(());
        };

        match line.trim() {
            "start" => session.start().await?,
            "stop" => session.stop().await?,
            "quit" | "exit" => return Ok(()),
            "" => {}
            other => eprintln!("unknown command '{other}' (start, stop, quit)"),
        }
    }
}

// ── Output ───────────────────────────────────────────────────────

async fn print_status(mut status: StatusStream, json: bool) {
    while let Some(update) = status.next().await {
        if json {
            match serde_json::to_string(&update) {
                Ok(line) => println!("{line}"),
                Err(e) => warn!("status not serializable: {e}"),
            }
        } else if !update.event.is_frame_event() && !update.event.is_chunk_event() {
            println!(
                "{} {} {:?}",
                update.at.format("%H:%M:%S%.3f"),
                update.event.event_type(),
                update.event
            );
        }
    }
}

/// Complete renders at up to `max_fps`, writing each frame when a path is set
async fn present(view: SurfaceView, output: Option<PathBuf>, max_fps: u32) {
    let period = Duration::from_secs(1) / max_fps.max(1);
    let mut ticker = tokio::time::interval(period);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    loop {
        ticker.tick().await;
        let Some(frame) = view.pending_frame() else {
            continue;
        };
        if let Some(path) = output.clone() {
            if let Err(e) = tokio::task::spawn_blocking(move || write_frame(&frame, &path)).await {
                warn!("frame writer failed: {e}");
            }
        }
        view.complete_render();
    }
}

fn write_frame(frame: &Arc<DecodedFrame>, path: &Path) {
    if let Err(e) = frame.image.save(path) {
        warn!("could not write {}: {e}", path.display());
    }
}
