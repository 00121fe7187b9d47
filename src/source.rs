use crate::types::{Frame, Rect};
use async_trait::async_trait;
use std::fmt;
use std::sync::Mutex;

/// Raised by a [`FrameSource`] when a capture cannot be produced.
#[derive(Debug, Clone)]
pub struct CaptureUnavailable {
    pub reason: String,
}

impl CaptureUnavailable {
    pub fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
        }
    }
}

impl fmt::Display for CaptureUnavailable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "capture unavailable: {}", self.reason)
    }
}

impl std::error::Error for CaptureUnavailable {}

/// The Frame Source external contract.
///
/// The stitcher core only ever consumes this trait; it specifies nothing
/// about how a rectangle of desktop pixels is actually acquired. No ordering
/// or rate guarantees are made — the [`crate::scheduler::CaptureScheduler`]
/// owns cadence.
#[async_trait]
pub trait FrameSource: Send + Sync {
    async fn capture(&self, rect: Rect) -> Result<Frame, CaptureUnavailable>;
}

/// A test double that replays a fixed sequence of frames, standing in for
/// screen capture the way `MockScreenshotProvider` stands in for
/// `screencapture` elsewhere in this codebase.
pub struct MockFrameSource {
    frames: Mutex<std::collections::VecDeque<Frame>>,
    exhausted_reason: String,
}

impl MockFrameSource {
    pub fn new(frames: Vec<Frame>) -> Self {
        Self {
            frames: Mutex::new(frames.into()),
            exhausted_reason: "no more frames queued".to_string(),
        }
    }

    /// Pushes another frame onto the queue; useful for tests that feed frames
    /// in step with assertions rather than pre-loading the whole sequence.
    pub fn push(&self, frame: Frame) {
        self.frames.lock().expect("mock frame source lock poisoned").push_back(frame);
    }
}

#[async_trait]
impl FrameSource for MockFrameSource {
    async fn capture(&self, _rect: Rect) -> Result<Frame, CaptureUnavailable> {
        let mut frames = self.frames.lock().expect("mock frame source lock poisoned");
        frames
            .pop_front()
            .ok_or_else(|| CaptureUnavailable::new(self.exhausted_reason.clone()))
    }
}

/// A source that always fails, for exercising the Controller's
/// three-consecutive-failures-faults-the-session path.
#[derive(Debug, Default, Clone, Copy)]
pub struct FailingFrameSource;

#[async_trait]
impl FrameSource for FailingFrameSource {
    async fn capture(&self, _rect: Rect) -> Result<Frame, CaptureUnavailable> {
        Err(CaptureUnavailable::new("intentional test failure"))
    }
}
