//! A thin, runnable proof that `stitcher`'s public Session API is sufficient
//! on its own. Drives a synthetic scrolling "document" through
//! a full session and writes the frozen composite to disk.
//!
//! This binary is not core logic: the synthetic frame source below stands in
//! for the real Frame Source collaborator, which this crate
//! deliberately does not implement.

use anyhow::{Context, Result, bail};
use async_trait::async_trait;
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use stitcher::controller::ControllerEvent;
use stitcher::session::start_session;
use stitcher::source::{CaptureUnavailable, FrameSource};
use stitcher::types::{Frame, PixelFormat, Rect, SessionConfig};

#[derive(Debug, Parser)]
#[command(name = "stitch-demo")]
#[command(about = "Exercise the scrolling screenshot stitcher against a synthetic document.")]
struct Cli {
    #[arg(long, default_value_t = 480)]
    width: u32,

    #[arg(long, default_value_t = 240)]
    height: u32,

    #[arg(long, default_value_t = 3000)]
    document_height: u32,

    #[arg(long, default_value_t = 35)]
    scroll_step_px: u32,

    #[arg(long, default_value_t = 5)]
    idle_repeats: u32,

    #[arg(long, default_value = "stitched.png")]
    output: PathBuf,

    #[arg(long, value_parser = parse_duration, default_value = "30s")]
    timeout: Duration,
}

fn parse_duration(value: &str) -> std::result::Result<Duration, String> {
    humantime::parse_duration(value).map_err(|e| e.to_string())
}

/// A document tall enough to require several scrolls, rendered as a
/// deterministic gradient so every row has a distinct, comparable signature.
struct SyntheticDocument {
    width: u32,
    height: u32,
}

impl SyntheticDocument {
    fn row_rgb(&self, global_y: u32, x: u32) -> [u8; 3] {
        [
            ((x * 3 + global_y * 7) % 255) as u8,
            ((x * 11 + global_y * 2) % 255) as u8,
            ((x * 5 + global_y * 13) % 255) as u8,
        ]
    }

    fn viewport(&self, top: u32, viewport_height: u32) -> Frame {
        let mut data = vec![0u8; self.width as usize * viewport_height as usize * 4];
        for y in 0..viewport_height {
            let global_y = (top + y).min(self.height.saturating_sub(1));
            for x in 0..self.width {
                let [r, g, b] = self.row_rgb(global_y, x);
                let idx = (y as usize * self.width as usize + x as usize) * 4;
                data[idx] = r;
                data[idx + 1] = g;
                data[idx + 2] = b;
                data[idx + 3] = 255;
            }
        }
        Frame::new(self.width, viewport_height, PixelFormat::Rgba8, data, 0)
    }
}

/// Emits viewports that scroll down `scroll_step_px` at a time until the
/// document is exhausted, then repeats the final viewport so the session's
/// idle auto-stop policy has something to trigger on.
struct ScrollingSource {
    document: SyntheticDocument,
    viewport_height: u32,
    scroll_step_px: u32,
    idle_repeats: u32,
    sequence: AtomicU64,
    cursor: std::sync::Mutex<u32>,
    repeats_sent: std::sync::Mutex<u32>,
}

#[async_trait]
impl FrameSource for ScrollingSource {
    async fn capture(&self, _rect: Rect) -> Result<Frame, CaptureUnavailable> {
        let mut cursor = self.cursor.lock().expect("cursor lock poisoned");
        let max_top = self.document.height.saturating_sub(self.viewport_height);
        let at_bottom = *cursor >= max_top;

        if at_bottom {
            let mut repeats = self.repeats_sent.lock().expect("repeats lock poisoned");
            if *repeats >= self.idle_repeats {
                return Err(CaptureUnavailable::new("synthetic document exhausted"));
            }
            *repeats += 1;
        } else {
            *cursor = (*cursor + self.scroll_step_px).min(max_top);
        }

        let top = *cursor;
        drop(cursor);

        let sequence = self.sequence.fetch_add(1, Ordering::SeqCst);
        let mut frame = self.document.viewport(top, self.viewport_height);
        frame.sequence = sequence;
        Ok(frame)
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    if cli.document_height <= cli.height {
        bail!("--document-height must exceed --height for there to be anything to scroll");
    }

    let rect = Rect::new(0, 0, cli.width, cli.height);
    let config = SessionConfig::defaults_for_height(cli.height);

    let source = Arc::new(ScrollingSource {
        document: SyntheticDocument {
            width: cli.width,
            height: cli.document_height,
        },
        viewport_height: cli.height,
        scroll_step_px: cli.scroll_step_px,
        idle_repeats: cli.idle_repeats,
        sequence: AtomicU64::new(0),
        cursor: std::sync::Mutex::new(0),
        repeats_sent: std::sync::Mutex::new(0),
    });

    let handle = start_session(source, rect, config).context("failed to start session")?;

    let mut events = handle.subscribe();
    let event_task = tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(ControllerEvent::FrameAccepted { sequence, dy, dx, confidence, canvas_height, jump }) => {
                    println!(
                        "frame {sequence}: accepted dy={dy} dx={dx} confidence={confidence:.3} canvas_height={canvas_height}{}",
                        if jump { " (jump)" } else { "" }
                    );
                }
                Ok(ControllerEvent::FrameSkipped { sequence, reason }) => {
                    println!("frame {sequence}: skipped ({reason:?})");
                }
                Ok(ControllerEvent::StateChanged { from, to }) => {
                    println!("state: {from:?} -> {to:?}");
                    // The observer channel's sender outlives the session
                    // (it's held by `SessionHandle`, not just the
                    // controller task), so it never closes on its own —
                    // stop draining once the session reaches a terminal
                    // state or this task would await forever.
                    if to.is_terminal() {
                        break;
                    }
                }
                Ok(ControllerEvent::Warning { code, detail }) => {
                    eprintln!("warning [{code}]: {detail}");
                }
                Ok(ControllerEvent::Info { code, detail }) => {
                    println!("info [{code}]: {detail}");
                }
                Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                    eprintln!("observer lagged, dropped {skipped} events");
                }
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
            }
        }
    });

    let wait_until_terminal = async {
        loop {
            if handle.state().is_terminal() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    };

    if tokio::time::timeout(cli.timeout, wait_until_terminal).await.is_err() {
        eprintln!("timed out waiting for the session to finish; stopping it now");
        let _ = handle.stop();
        tokio::time::sleep(Duration::from_millis(200)).await;
    }

    let _ = event_task.await;

    let image = match handle.finalize() {
        Ok(image) => image,
        Err(err) => {
            eprintln!("session did not finish cleanly ({err}); salvaging a snapshot instead");
            handle.snapshot().await.context("snapshot also failed")?
        }
    };

    image
        .save(&cli.output)
        .with_context(|| format!("failed to write composite to {}", cli.output.display()))?;
    println!(
        "wrote {}x{} composite to {}",
        image.width(),
        image.height(),
        cli.output.display()
    );

    Ok(())
}
