use crate::canvas::{Canvas, CanvasError};
use crate::comparator::{ComparatorParams, FrameComparator, SearchDirection, Verdict};
use crate::error::StitchError;
use crate::scheduler::{CaptureScheduler, SchedulerFeedback};
use crate::source::FrameSource;
use crate::types::{AcceptedFrameRecord, DirectionLock, Rect, SessionConfig, SessionState};
use image::RgbaImage;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::time::Instant;

/// Commands a [`crate::session::SessionHandle`] sends to a running
/// Controller task.
pub enum ControllerCommand {
    Pause,
    Resume,
    Stop,
    Snapshot(oneshot::Sender<RgbaImage>),
}

/// Why a captured frame was not appended to the Canvas.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    Identical,
    UnrelatedFirstAttempt,
    UnrelatedForcedRecapturePending,
    UnrelatedLostAlignment,
    DirectionLocked,
}

/// Structured events published on the observer channel.
#[derive(Debug, Clone)]
pub enum ControllerEvent {
    FrameAccepted {
        sequence: u64,
        dy: i64,
        dx: i32,
        confidence: f64,
        canvas_height: u64,
        jump: bool,
    },
    FrameSkipped {
        sequence: u64,
        reason: SkipReason,
    },
    StateChanged {
        from: SessionState,
        to: SessionState,
    },
    Warning {
        code: String,
        detail: String,
    },
    Info {
        code: String,
        detail: String,
    },
}

const OBSERVER_CHANNEL_CAPACITY: usize = 256;

pub fn observer_channel() -> (broadcast::Sender<ControllerEvent>, broadcast::Receiver<ControllerEvent>) {
    broadcast::channel(OBSERVER_CHANNEL_CAPACITY)
}

/// Owns the session state machine and orchestrates the capture-compare loop.
pub struct StitchController {
    source: Arc<dyn FrameSource>,
    rect: Rect,
    config: SessionConfig,
    comparator: FrameComparator,
    scheduler: CaptureScheduler,
    canvas: Canvas,
    events: broadcast::Sender<ControllerEvent>,

    state: SessionState,
    sequence: u64,
    idle_counter: u32,
    consecutive_unrelated: u32,
    consecutive_capture_failures: u32,
    direction_history: Vec<i8>,
    latched_sign: Option<i8>,
    accepted_frames: Vec<AcceptedFrameRecord>,
    last_progress: Instant,
}

impl StitchController {
    pub fn new(
        source: Arc<dyn FrameSource>,
        rect: Rect,
        config: SessionConfig,
        events: broadcast::Sender<ControllerEvent>,
    ) -> Result<Self, StitchError> {
        config.validate(rect).map_err(StitchError::InvalidRect)?;

        let retention_floor = rect.height as u64 + config.max_search_offset_px as u64 + config.blend_band_px as u64;
        let canvas = Canvas::new(
            rect.width,
            crate::types::PixelFormat::Rgba8,
            rect.height,
            config.blend_band_px,
            config.ignore_margins,
            config.memory_cap_bytes,
            retention_floor,
        );
        let scheduler = CaptureScheduler::new(config.capture_interval_ms, config.identical_backoff_ms);

        Ok(Self {
            source,
            rect,
            config,
            comparator: FrameComparator::new(),
            scheduler,
            canvas,
            events,
            state: SessionState::Idle,
            sequence: 0,
            idle_counter: 0,
            consecutive_unrelated: 0,
            consecutive_capture_failures: 0,
            direction_history: Vec::new(),
            latched_sign: None,
            accepted_frames: Vec::new(),
            last_progress: Instant::now(),
        })
    }

    fn publish(&self, event: ControllerEvent) {
        // Best-effort: no subscribers, or a lagging subscriber dropping
        // old events, are not errors the main loop should react to.
        let _ = self.events.send(event);
    }

    fn transition(&mut self, to: SessionState) {
        if self.state == to {
            return;
        }
        let from = self.state;
        self.state = to;
        self.publish(ControllerEvent::StateChanged { from, to });
    }

    fn search_direction(&self) -> SearchDirection {
        match self.config.direction_lock {
            DirectionLock::DownOnly => SearchDirection::DownOnly,
            DirectionLock::UpOnly => SearchDirection::UpOnly,
            DirectionLock::Auto => match self.latched_sign {
                Some(1) => SearchDirection::DownOnly,
                Some(-1) => SearchDirection::UpOnly,
                _ => SearchDirection::Any,
            },
        }
    }

    fn is_up_only_locked(&self) -> bool {
        matches!(self.config.direction_lock, DirectionLock::UpOnly)
            || matches!(self.config.direction_lock, DirectionLock::Auto if self.latched_sign == Some(-1))
    }

    fn update_direction_latch(&mut self, dy: i64) {
        let sign: i8 = if dy > 0 { 1 } else { -1 };
        match self.direction_history.last().copied() {
            Some(last) if last == sign => self.direction_history.push(sign),
            _ => self.direction_history = vec![sign],
        }
        if self.latched_sign.is_none() && self.direction_history.len() >= 3 {
            self.latched_sign = Some(sign);
        }
    }

    fn reset_direction_latch(&mut self) {
        self.direction_history.clear();
        self.latched_sign = None;
    }

    fn comparator_params(&self) -> ComparatorParams {
        ComparatorParams {
            max_search_offset_px: self.config.max_search_offset_px,
            max_horizontal_offset_px: self.config.max_horizontal_offset_px,
            min_confidence: self.config.min_confidence,
            ignore_margins: self.config.ignore_margins,
            metric: self.config.metric.into(),
        }
    }

    /// Runs the session to completion, returning the frozen canvas on
    /// `Finished` or the fault reason on `Faulted`.
    pub async fn run(mut self, mut commands: mpsc::Receiver<ControllerCommand>) -> Result<RgbaImage, StitchError> {
        self.transition(SessionState::Running);

        let first = self
            .source
            .capture(self.rect)
            .await
            .map_err(|err| StitchError::CaptureFailed(err.to_string()))?;
        self.canvas
            .initialize(&first)
            .map_err(|err| StitchError::InternalError(err.to_string()))?;
        self.sequence = first.sequence;
        self.last_progress = Instant::now();

        loop {
            if self.state == SessionState::Stopping {
                self.transition(SessionState::Finished);
                break;
            }

            match self.drain_commands(&mut commands).await {
                LoopSignal::Continue => {}
                LoopSignal::Finished => break,
                LoopSignal::Faulted(err) => return Err(err),
            }
            if self.state == SessionState::Stopping {
                self.transition(SessionState::Finished);
                break;
            }
            if self.state == SessionState::Paused {
                // Block on the command channel instead of busy-looping: the
                // only way out of `Paused` is `Resume` or `Stop`.
                match commands.recv().await {
                    Some(cmd) => match self.apply_command(Some(cmd)) {
                        LoopSignal::Continue => {}
                        LoopSignal::Finished => break,
                        LoopSignal::Faulted(err) => return Err(err),
                    },
                    None => self.transition(SessionState::Stopping),
                }
                continue;
            }

            let delay = self.scheduler.next_delay();
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                maybe_cmd = commands.recv() => {
                    match self.apply_command(maybe_cmd) {
                        LoopSignal::Continue => continue,
                        LoopSignal::Finished => break,
                        LoopSignal::Faulted(err) => return Err(err),
                    }
                }
            }
            if self.state != SessionState::Running {
                continue;
            }

            match self.run_cycle().await {
                Ok(()) => {}
                Err(fault) => {
                    self.transition(SessionState::Faulted);
                    return Err(fault);
                }
            }

            if self.config.no_progress_timeout_ms > 0
                && self.last_progress.elapsed() >= Duration::from_millis(self.config.no_progress_timeout_ms)
            {
                self.transition(SessionState::Faulted);
                return Err(StitchError::LostAlignment);
            }
        }

        self.canvas
            .freeze()
            .map_err(|err| StitchError::InternalError(err.to_string()))
    }

    async fn drain_commands(&mut self, commands: &mut mpsc::Receiver<ControllerCommand>) -> LoopSignal {
        loop {
            match commands.try_recv() {
                Ok(cmd) => {
                    let signal = self.apply_command(Some(cmd));
                    if !matches!(signal, LoopSignal::Continue) {
                        return signal;
                    }
                }
                Err(mpsc::error::TryRecvError::Empty) => return LoopSignal::Continue,
                Err(mpsc::error::TryRecvError::Disconnected) => return LoopSignal::Continue,
            }
        }
    }

    fn apply_command(&mut self, cmd: Option<ControllerCommand>) -> LoopSignal {
        match cmd {
            None => LoopSignal::Continue,
            Some(ControllerCommand::Pause) => {
                if self.state == SessionState::Running {
                    self.transition(SessionState::Paused);
                }
                LoopSignal::Continue
            }
            Some(ControllerCommand::Resume) => {
                if self.state == SessionState::Paused {
                    self.transition(SessionState::Running);
                }
                LoopSignal::Continue
            }
            Some(ControllerCommand::Stop) => {
                self.transition(SessionState::Stopping);
                LoopSignal::Continue
            }
            Some(ControllerCommand::Snapshot(reply)) => {
                if let Ok(image) = self.canvas.snapshot() {
                    let _ = reply.send(image);
                }
                LoopSignal::Continue
            }
        }
    }

    async fn run_cycle(&mut self) -> Result<(), StitchError> {
        let frame = match self.source.capture(self.rect).await {
            Ok(frame) => {
                self.consecutive_capture_failures = 0;
                frame
            }
            Err(err) => {
                self.consecutive_capture_failures += 1;
                self.publish(ControllerEvent::Warning {
                    code: "capture_failed".to_string(),
                    detail: err.to_string(),
                });
                if self.consecutive_capture_failures >= 3 {
                    return Err(StitchError::CaptureFailed(err.to_string()));
                }
                return Ok(());
            }
        };
        self.sequence = frame.sequence;

        let tail = self
            .canvas
            .tail_frame(self.rect.height, self.sequence)
            .ok_or_else(|| StitchError::InternalError("canvas tail unavailable".to_string()))?;

        let verdict = self.compare_with_watchdog(tail, frame.clone()).await;

        match verdict {
            Verdict::Identical => self.handle_identical(),
            Verdict::Scrolled { dy, dx, confidence } if dy == 0 => {
                let _ = (dx, confidence);
                self.handle_identical();
            }
            Verdict::Scrolled { dy, dx, confidence } => {
                self.handle_scrolled(&frame, dy, dx, confidence)?;
            }
            Verdict::Unrelated => self.handle_unrelated(&frame)?,
        }

        Ok(())
    }

    async fn compare_with_watchdog(&self, tail: crate::types::Frame, frame: crate::types::Frame) -> Verdict {
        let comparator = self.comparator;
        let direction = self.search_direction();
        let params = self.comparator_params();
        let budget = Duration::from_millis(self.config.frame_watchdog_ms);

        let task = tokio::task::spawn_blocking(move || comparator.compare(&tail, &frame, direction, params));
        match tokio::time::timeout(budget, task).await {
            Ok(Ok(verdict)) => verdict,
            Ok(Err(_join_error)) => Verdict::Unrelated,
            Err(_timeout) => Verdict::Unrelated,
        }
    }

    fn handle_identical(&mut self) {
        self.idle_counter += 1;
        self.scheduler.on_feedback(SchedulerFeedback::Idle);
        self.publish(ControllerEvent::FrameSkipped {
            sequence: self.sequence,
            reason: SkipReason::Identical,
        });
        if self.config.auto_stop_on_idle && self.idle_counter >= self.config.idle_stop_threshold {
            self.transition(SessionState::Stopping);
        }
    }

    fn handle_scrolled(&mut self, frame: &crate::types::Frame, dy: i64, dx: i32, confidence: f64) -> Result<(), StitchError> {
        let accepted = dy > 0 || (dy < 0 && self.is_up_only_locked());
        if !accepted {
            self.publish(ControllerEvent::FrameSkipped {
                sequence: self.sequence,
                reason: SkipReason::DirectionLocked,
            });
            return Ok(());
        }

        let top_before = self.canvas.top_logical_index();
        let bottom_before = self.canvas.bottom_logical_index();

        self.canvas.append_strip(frame, dy, dx, true).map_err(|err| match err {
            CanvasError::SpillFailed(detail) => StitchError::OutOfMemory(detail),
            other => StitchError::InternalError(other.to_string()),
        })?;

        let (y_start, y_end) = if dy > 0 {
            (bottom_before + 1, bottom_before + dy)
        } else {
            (top_before + dy, top_before - 1)
        };

        self.idle_counter = 0;
        self.consecutive_unrelated = 0;
        self.scheduler.on_feedback(SchedulerFeedback::Motion);
        self.update_direction_latch(dy);
        self.last_progress = Instant::now();
        self.accepted_frames.push(AcceptedFrameRecord {
            sequence: self.sequence,
            dy,
            dx,
            confidence,
            canvas_y_start: y_start as u64,
            canvas_y_end: y_end as u64,
            jump: false,
        });
        self.publish(ControllerEvent::FrameAccepted {
            sequence: self.sequence,
            dy,
            dx,
            confidence,
            canvas_height: self.canvas.canvas_height(),
            jump: false,
        });
        Ok(())
    }

    fn handle_unrelated(&mut self, frame: &crate::types::Frame) -> Result<(), StitchError> {
        self.consecutive_unrelated += 1;
        self.reset_direction_latch();

        match self.consecutive_unrelated {
            1 => {
                self.publish(ControllerEvent::FrameSkipped {
                    sequence: self.sequence,
                    reason: SkipReason::UnrelatedFirstAttempt,
                });
                Ok(())
            }
            2 => {
                self.publish(ControllerEvent::FrameSkipped {
                    sequence: self.sequence,
                    reason: SkipReason::UnrelatedForcedRecapturePending,
                });
                self.scheduler.on_feedback(SchedulerFeedback::Force);
                Ok(())
            }
            _ => {
                if !self.config.allow_jump {
                    self.publish(ControllerEvent::FrameSkipped {
                        sequence: self.sequence,
                        reason: SkipReason::UnrelatedLostAlignment,
                    });
                    return Err(StitchError::LostAlignment);
                }
                let dy = self.rect.height as i64;
                let top_before = self.canvas.top_logical_index();
                let bottom_before = self.canvas.bottom_logical_index();
                self.canvas
                    .append_strip(frame, dy, 0, false)
                    .map_err(|err| StitchError::InternalError(err.to_string()))?;
                let _ = top_before;

                self.consecutive_unrelated = 0;
                self.idle_counter = 0;
                self.scheduler.on_feedback(SchedulerFeedback::Motion);
                self.last_progress = Instant::now();
                self.accepted_frames.push(AcceptedFrameRecord {
                    sequence: self.sequence,
                    dy,
                    dx: 0,
                    confidence: 0.0,
                    canvas_y_start: (bottom_before + 1) as u64,
                    canvas_y_end: (bottom_before + dy) as u64,
                    jump: true,
                });
                self.publish(ControllerEvent::FrameAccepted {
                    sequence: self.sequence,
                    dy,
                    dx: 0,
                    confidence: 0.0,
                    canvas_height: self.canvas.canvas_height(),
                    jump: true,
                });
                self.publish(ControllerEvent::Info {
                    code: "jump_append".to_string(),
                    detail: "appended non-overlapping frame after repeated unrelated captures".to_string(),
                });
                Ok(())
            }
        }
    }
}

enum LoopSignal {
    Continue,
    Finished,
    Faulted(StitchError),
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::MockFrameSource;
    use crate::types::{Frame, PixelFormat, SessionConfig};

    fn gradient_frame(width: u32, height: u32, row_offset: u32, sequence: u64) -> Frame {
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
        Frame::new(width, height, PixelFormat::Rgba8, data, sequence)
    }

    fn base_config(height: u32) -> SessionConfig {
        let mut config = SessionConfig::defaults_for_height(height);
        config.auto_stop_on_idle = true;
        config.idle_stop_threshold = 3;
        config
    }

    #[tokio::test]
    async fn clean_scroll_grows_canvas_and_stops_on_repeated_identical() {
        let width = 60;
        let height = 120;
        let f0 = gradient_frame(width, height, 0, 0);
        let f1 = gradient_frame(width, height, 40, 1);
        let f2 = f1.clone();
        let f3 = f1.clone();
        let f4 = f1.clone();

        let source = Arc::new(MockFrameSource::new(vec![f0, f1, f2, f3, f4]));
        let rect = Rect::new(0, 0, width, height);
        let (events, mut rx) = observer_channel();
        let controller = StitchController::new(source, rect, base_config(height), events).unwrap();

        let (_tx, commands_rx) = mpsc::channel(8);
        let image = controller.run(commands_rx).await.unwrap();
        assert_eq!(image.height(), height + 40);

        let mut accepted = 0;
        let mut skipped = 0;
        while let Ok(event) = rx.try_recv() {
            match event {
                ControllerEvent::FrameAccepted { .. } => accepted += 1,
                ControllerEvent::FrameSkipped { .. } => skipped += 1,
                _ => {}
            }
        }
        assert_eq!(accepted, 1);
        assert!(skipped >= 3);
    }

    #[tokio::test]
    async fn three_consecutive_capture_failures_faults_the_session() {
        let width = 40;
        let height = 80;
        let f0 = gradient_frame(width, height, 0, 0);
        let source = Arc::new(MockFrameSource::new(vec![f0]));
        let rect = Rect::new(0, 0, width, height);
        let (events, _rx) = observer_channel();
        let controller = StitchController::new(source, rect, base_config(height), events).unwrap();

        let (_tx, commands_rx) = mpsc::channel(8);
        let result = controller.run(commands_rx).await;
        assert!(matches!(result, Err(StitchError::CaptureFailed(_))));
    }

    #[tokio::test]
    async fn repeated_unrelated_without_jump_faults_with_lost_alignment() {
        let width = 40;
        let height = 80;
        let f0 = gradient_frame(width, height, 0, 0);
        let mut source_frames = vec![f0];
        for seq in 1..6u64 {
            let mut data = vec![0u8; width as usize * height as usize * 4];
            for (i, byte) in data.iter_mut().enumerate() {
                *byte = ((i + seq as usize) % 255) as u8;
            }
            source_frames.push(Frame::new(width, height, PixelFormat::Rgba8, data, seq));
        }
        let source = Arc::new(MockFrameSource::new(source_frames));
        let rect = Rect::new(0, 0, width, height);
        let mut config = base_config(height);
        config.allow_jump = false;
        let (events, mut rx) = observer_channel();
        let controller = StitchController::new(source, rect, config, events).unwrap();

        let (_tx, commands_rx) = mpsc::channel(8);
        let result = controller.run(commands_rx).await;
        assert!(matches!(result, Err(StitchError::LostAlignment)));

        // Scenario 3 (spec.md §8): three consecutive unrelated `FrameSkipped`
        // events precede the fault, not just two.
        let mut unrelated_skips = 0;
        while let Ok(event) = rx.try_recv() {
            if let ControllerEvent::FrameSkipped {
                reason:
                    SkipReason::UnrelatedFirstAttempt
                    | SkipReason::UnrelatedForcedRecapturePending
                    | SkipReason::UnrelatedLostAlignment,
                ..
            } = event
            {
                unrelated_skips += 1;
            }
        }
        assert_eq!(unrelated_skips, 3);
    }

    #[tokio::test]
    async fn allow_jump_appends_full_frame_after_three_unrelated() {
        let width = 40;
        let height = 80;
        let f0 = gradient_frame(width, height, 0, 0);
        let mut source_frames = vec![f0];
        for seq in 1..4u64 {
            let mut data = vec![0u8; width as usize * height as usize * 4];
            for (i, byte) in data.iter_mut().enumerate() {
                *byte = ((i * 17 + seq as usize * 31) % 255) as u8;
            }
            source_frames.push(Frame::new(width, height, PixelFormat::Rgba8, data, seq));
        }
        // After the jump-append, feed enough repeats of the last frame to
        // trigger the idle auto-stop so `run` returns cleanly.
        let last = source_frames.last().unwrap().clone();
        for _ in 0..4 {
            source_frames.push(last.clone());
        }

        let source = Arc::new(MockFrameSource::new(source_frames));
        let rect = Rect::new(0, 0, width, height);
        let mut config = base_config(height);
        config.allow_jump = true;
        let (events, mut rx) = observer_channel();
        let controller = StitchController::new(source, rect, config, events).unwrap();

        let (_tx, commands_rx) = mpsc::channel(8);
        let image = controller.run(commands_rx).await.unwrap();
        assert_eq!(image.height(), height * 2);

        let mut saw_jump = false;
        while let Ok(event) = rx.try_recv() {
            if let ControllerEvent::FrameAccepted { jump: true, .. } = event {
                saw_jump = true;
            }
        }
        assert!(saw_jump);
    }
}
