//! The public Session API surfaced to the rest of the application
//! `start_session`, `pause`, `resume`, `stop`, `subscribe`,
//! `snapshot`, `finalize`, all hung off a [`SessionHandle`].
//!
//! This is the one place in the crate that spawns tasks: the capture-compare
//! loop runs detached on
//! [`StitchController::run`], and a second lightweight task mirrors its
//! published [`SessionState`] onto a handle field the synchronous
//! `pause`/`resume`/`stop` methods can check without awaiting anything.

use crate::controller::{ControllerCommand, ControllerEvent, StitchController, observer_channel};
use crate::error::StitchError;
use crate::source::FrameSource;
use crate::types::{Image, Rect, SessionConfig, SessionState};
use std::sync::{Arc, Mutex};
use tokio::sync::{broadcast, mpsc, oneshot};

/// A live subscription to a session's observer channel.
pub type Subscription = broadcast::Receiver<ControllerEvent>;

const COMMAND_CHANNEL_CAPACITY: usize = 16;

struct Shared {
    state: SessionState,
    final_image: Option<Image>,
    fault: Option<StitchError>,
}

/// A handle to one stitching session. Cheap to clone; every clone observes
/// and controls the same underlying session.
#[derive(Clone)]
pub struct SessionHandle {
    commands: mpsc::Sender<ControllerCommand>,
    events: broadcast::Sender<ControllerEvent>,
    shared: Arc<Mutex<Shared>>,
}

/// Starts a new session over `rect`, driven by `source` (the external Frame
/// Source collaborator. Validates `config` against `rect`
/// synchronously, before anything is
/// spawned.
pub fn start_session(
    source: Arc<dyn FrameSource>,
    rect: Rect,
    config: SessionConfig,
) -> Result<SessionHandle, StitchError> {
    let (events_tx, _unused_rx) = observer_channel();
    let controller = StitchController::new(source, rect, config, events_tx.clone())?;

    let (commands_tx, commands_rx) = mpsc::channel(COMMAND_CHANNEL_CAPACITY);
    let shared = Arc::new(Mutex::new(Shared {
        state: SessionState::Running,
        final_image: None,
        fault: None,
    }));

    // Subscribe before spawning the controller so no StateChanged event can
    // be published before this receiver exists to see it.
    let state_events = events_tx.subscribe();
    let state_shared = shared.clone();
    tokio::spawn(track_state(state_events, state_shared));

    let run_shared = shared.clone();
    tokio::spawn(async move {
        let outcome = controller.run(commands_rx).await;
        let mut guard = run_shared.lock().expect("session state lock poisoned");
        match outcome {
            Ok(image) => {
                guard.state = SessionState::Finished;
                guard.final_image = Some(image);
            }
            Err(err) => {
                guard.state = SessionState::Faulted;
                guard.fault = Some(err);
            }
        }
    });

    Ok(SessionHandle {
        commands: commands_tx,
        events: events_tx,
        shared,
    })
}

async fn track_state(mut events: Subscription, shared: Arc<Mutex<Shared>>) {
    loop {
        match events.recv().await {
            // Terminal transitions are left to the run-completion task
            // (below), which sets `state` together with `final_image`/
            // `fault` under the same lock acquisition. Mirroring them here
            // too would let a caller observe `Finished`/`Faulted` through
            // `state()` before the image or fault reason is actually
            // stored, racing `finalize()` into a spurious `InternalError`.
            Ok(ControllerEvent::StateChanged { to, .. }) if !to.is_terminal() => {
                shared.lock().expect("session state lock poisoned").state = to;
            }
            Ok(_) => {}
            Err(broadcast::error::RecvError::Lagged(_)) => continue,
            Err(broadcast::error::RecvError::Closed) => return,
        }
    }
}

impl SessionHandle {
    /// The session's current lifecycle state.
    pub fn state(&self) -> SessionState {
        self.shared.lock().expect("session state lock poisoned").state
    }

    /// Pauses the session. Only valid from `Running`.
    pub fn pause(&self) -> Result<(), StitchError> {
        if self.state() != SessionState::Running {
            return Err(StitchError::NotRunning);
        }
        let _ = self.commands.try_send(ControllerCommand::Pause);
        Ok(())
    }

    /// Resumes the session. Only valid from `Paused`.
    pub fn resume(&self) -> Result<(), StitchError> {
        if self.state() != SessionState::Paused {
            return Err(StitchError::NotRunning);
        }
        let _ = self.commands.try_send(ControllerCommand::Resume);
        Ok(())
    }

    /// Stops the session. Honored within one capture-and-compare
    /// cycle; a no-op on an already
    /// terminal session.
    pub fn stop(&self) -> Result<(), StitchError> {
        if self.state().is_terminal() {
            return Err(StitchError::NotRunning);
        }
        let _ = self.commands.try_send(ControllerCommand::Stop);
        Ok(())
    }

    /// Returns a fresh subscription to this session's observer channel.
    pub fn subscribe(&self) -> Subscription {
        self.events.subscribe()
    }

    /// A non-destructive read of
    /// the current canvas. Valid in any state — a `Faulted` session still
    /// permits salvaging partial results.
    pub async fn snapshot(&self) -> Result<Image, StitchError> {
        if let Some(image) = self.shared.lock().expect("session state lock poisoned").final_image.clone() {
            return Ok(image);
        }

        let (reply_tx, reply_rx) = oneshot::channel();
        self.commands
            .send(ControllerCommand::Snapshot(reply_tx))
            .await
            .map_err(|_| StitchError::NotRunning)?;
        reply_rx
            .await
            .map_err(|_| StitchError::InternalError("controller task ended before replying to snapshot".to_string()))
    }

    /// Consumes the final composite. Only valid in `Finished`.
    pub fn finalize(&self) -> Result<Image, StitchError> {
        let guard = self.shared.lock().expect("session state lock poisoned");
        match guard.state {
            SessionState::Finished => guard.final_image.clone().ok_or_else(|| {
                StitchError::InternalError("finished session produced no frozen image".to_string())
            }),
            SessionState::Faulted => Err(guard
                .fault
                .clone()
                .unwrap_or(StitchError::InternalError("session faulted with no recorded reason".to_string()))),
            _ => Err(StitchError::NotRunning),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::MockFrameSource;
    use crate::types::PixelFormat;

    fn gradient_frame(width: u32, height: u32, row_offset: u32, sequence: u64) -> crate::types::Frame {
        let mut data = vec![0u8; width as usize * height as usize * 4];
        for y in 0..height {
            for x in 0..width {
                let global_y = y + row_offset;
                let idx = (y as usize * width as usize + x as usize) * 4;
                data[idx] = ((x * 3 + global_y * 7) % 255) as u8;
                data[idx + 1] = ((x * 11 + global_y * 2) % 255) as u8;
                data[idx + 2] = ((x * 5 + global_y * 13) % 255) as u8;
                data[idx + 3] = 255;
            }
        }
        crate::types::Frame::new(width, height, PixelFormat::Rgba8, data, sequence)
    }

    fn idle_stop_config(height: u32) -> SessionConfig {
        let mut config = SessionConfig::defaults_for_height(height);
        config.auto_stop_on_idle = true;
        config.idle_stop_threshold = 3;
        config
    }

    #[tokio::test]
    async fn finalize_returns_frozen_image_once_session_finishes() {
        let width = 40;
        let height = 100;
        let f0 = gradient_frame(width, height, 0, 0);
        let f1 = gradient_frame(width, height, 30, 1);
        let source = Arc::new(MockFrameSource::new(vec![
            f0,
            f1.clone(),
            f1.clone(),
            f1.clone(),
            f1,
        ]));

        let handle = start_session(source, Rect::new(0, 0, width, height), idle_stop_config(height)).unwrap();

        for _ in 0..200 {
            if handle.state().is_terminal() {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        }

        assert_eq!(handle.state(), SessionState::Finished);
        let image = handle.finalize().unwrap();
        assert_eq!(image.height(), height + 30);
    }

    #[tokio::test]
    async fn snapshot_before_finish_reads_current_canvas_via_the_running_controller() {
        let width = 30;
        let height = 80;
        let frames: Vec<_> = (0..2).map(|i| gradient_frame(width, height, i * 5, i as u64)).collect();
        let source = Arc::new(MockFrameSource::new(frames));
        let mut config = SessionConfig::defaults_for_height(height);
        config.capture_interval_ms = 5_000; // keep the loop parked between cycles
        let handle = start_session(source, Rect::new(0, 0, width, height), config).unwrap();

        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        let image = handle.snapshot().await.unwrap();
        assert_eq!(image.width(), width);
        assert!(image.height() >= height);
    }

    #[tokio::test]
    async fn pause_then_stop_is_rejected_when_not_running() {
        let width = 20;
        let height = 60;
        let source = Arc::new(MockFrameSource::new(vec![gradient_frame(width, height, 0, 0)]));
        let handle = start_session(source, Rect::new(0, 0, width, height), idle_stop_config(height)).unwrap();

        for _ in 0..200 {
            if handle.state().is_terminal() {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        }
        assert!(handle.state().is_terminal());
        assert!(matches!(handle.pause(), Err(StitchError::NotRunning)));
        assert!(matches!(handle.stop(), Err(StitchError::NotRunning)));
    }

    #[test]
    fn start_session_rejects_invalid_rect_synchronously() {
        let source = Arc::new(MockFrameSource::new(Vec::new()));
        let config = SessionConfig::defaults_for_height(100);
        let result = start_session(source, Rect::new(0, 0, 0, 100), config);
        assert!(matches!(result, Err(StitchError::InvalidRect(_))));
    }
}
