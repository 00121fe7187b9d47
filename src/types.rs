use std::time::Instant;

/// The final rendered composite a session produces.
pub type Image = image::RgbaImage;

/// A rectangular region in screen coordinates, fixed for the lifetime of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Rect {
    pub x: i32,
    pub y: i32,
    pub width: u32,
    pub height: u32,
}

impl Rect {
    pub fn new(x: i32, y: i32, width: u32, height: u32) -> Self {
        Self {
            x,
            y,
            width,
            height,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.width == 0 || self.height == 0
    }
}

/// Pixel layout of a [`Frame`]'s backing buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PixelFormat {
    Rgba8,
    Rgb8,
}

impl PixelFormat {
    pub fn bytes_per_pixel(self) -> usize {
        match self {
            PixelFormat::Rgba8 => 4,
            PixelFormat::Rgb8 => 3,
        }
    }
}

/// An immutable rectangular pixel buffer captured at one point in time.
///
/// Width and height are fixed for the session; every `Frame` a session
/// produces shares the capture rectangle's dimensions.
#[derive(Debug, Clone)]
pub struct Frame {
    pub width: u32,
    pub height: u32,
    pub format: PixelFormat,
    pub data: Vec<u8>,
    pub captured_at: Instant,
    pub sequence: u64,
}

impl Frame {
    pub fn new(
        width: u32,
        height: u32,
        format: PixelFormat,
        data: Vec<u8>,
        sequence: u64,
    ) -> Self {
        debug_assert_eq!(
            data.len(),
            width as usize * height as usize * format.bytes_per_pixel(),
            "frame buffer length does not match width*height*bpp"
        );
        Self {
            width,
            height,
            format,
            data,
            captured_at: Instant::now(),
            sequence,
        }
    }

    pub fn row_bytes(&self) -> usize {
        self.width as usize * self.format.bytes_per_pixel()
    }

    /// Borrow the pixel bytes of a single row (0-indexed from the top).
    pub fn row(&self, y: u32) -> &[u8] {
        let row_bytes = self.row_bytes();
        let start = y as usize * row_bytes;
        &self.data[start..start + row_bytes]
    }

    /// Luminance of pixel (x, y) using ITU-R BT.601 integer weights.
    pub fn luma(&self, x: u32, y: u32) -> u8 {
        let bpp = self.format.bytes_per_pixel();
        let row = self.row(y);
        let offset = x as usize * bpp;
        let r = row[offset] as u32;
        let g = row[offset + 1] as u32;
        let b = row[offset + 2] as u32;
        ((r * 299 + g * 587 + b * 114) / 1000) as u8
    }
}

/// Selects which similarity metric the comparator's overlap search uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Metric {
    /// Normalized cross-correlation, scored in `[0, 1]` (1 = perfect match).
    NormalizedCrossCorrelation,
    /// Mean absolute difference, converted to a `[0, 1]` similarity score.
    MeanAbsoluteDifference,
}

/// Latched scroll-direction policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DirectionLock {
    Auto,
    DownOnly,
    UpOnly,
}

/// Pixel margins excluded from comparison and from fresh writes into the canvas.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct IgnoreMargins {
    pub top: u32,
    pub bottom: u32,
    pub left: u32,
    pub right: u32,
}

impl IgnoreMargins {
    pub fn none() -> Self {
        Self::default()
    }

    pub fn covers_entire(&self, width: u32, height: u32) -> bool {
        self.left.saturating_add(self.right) >= width
            || self.top.saturating_add(self.bottom) >= height
    }
}

/// Recognized session options.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct SessionConfig {
    pub capture_interval_ms: u64,
    pub identical_backoff_ms: u64,
    pub max_search_offset_px: u32,
    pub min_confidence: f64,
    pub blend_band_px: u32,
    pub memory_cap_bytes: u64,
    pub direction_lock: DirectionLockConfig,
    pub ignore_margins: IgnoreMargins,
    pub metric: MetricConfig,
    pub idle_stop_threshold: u32,
    pub auto_stop_on_idle: bool,
    pub allow_jump: bool,
    pub max_horizontal_offset_px: u32,
    pub frame_watchdog_ms: u64,
    pub no_progress_timeout_ms: u64,
}

/// `serde`-friendly mirror of [`DirectionLock`] (kept distinct so the wire
/// format is stable even if the in-memory enum grows non-serializable
/// variants later).
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DirectionLockConfig {
    Auto,
    DownOnly,
    UpOnly,
}

impl From<DirectionLockConfig> for DirectionLock {
    fn from(value: DirectionLockConfig) -> Self {
        match value {
            DirectionLockConfig::Auto => DirectionLock::Auto,
            DirectionLockConfig::DownOnly => DirectionLock::DownOnly,
            DirectionLockConfig::UpOnly => DirectionLock::UpOnly,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum MetricConfig {
    NormalizedCrossCorrelation,
    MeanAbsoluteDifference,
}

impl From<MetricConfig> for Metric {
    fn from(value: MetricConfig) -> Self {
        match value {
            MetricConfig::NormalizedCrossCorrelation => Metric::NormalizedCrossCorrelation,
            MetricConfig::MeanAbsoluteDifference => Metric::MeanAbsoluteDifference,
        }
    }
}

impl serde::Serialize for IgnoreMargins {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        use serde::ser::SerializeStruct;
        let mut state = serializer.serialize_struct("IgnoreMargins", 4)?;
        state.serialize_field("top", &self.top)?;
        state.serialize_field("bottom", &self.bottom)?;
        state.serialize_field("left", &self.left)?;
        state.serialize_field("right", &self.right)?;
        state.end()
    }
}

impl<'de> serde::Deserialize<'de> for IgnoreMargins {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        #[derive(serde::Deserialize)]
        struct Raw {
            #[serde(default)]
            top: u32,
            #[serde(default)]
            bottom: u32,
            #[serde(default)]
            left: u32,
            #[serde(default)]
            right: u32,
        }
        let raw = Raw::deserialize(deserializer)?;
        Ok(IgnoreMargins {
            top: raw.top,
            bottom: raw.bottom,
            left: raw.left,
            right: raw.right,
        })
    }
}

pub const DEFAULT_CAPTURE_INTERVAL_MS: u64 = 150;
pub const DEFAULT_IDENTICAL_BACKOFF_MS: u64 = 400;
pub const DEFAULT_MIN_CONFIDENCE: f64 = 0.90;
pub const DEFAULT_BLEND_BAND_PX: u32 = 8;
pub const DEFAULT_MEMORY_CAP_BYTES: u64 = 512 * 1024 * 1024;
pub const DEFAULT_IDLE_STOP_THRESHOLD: u32 = 20;
pub const DEFAULT_FRAME_WATCHDOG_MS: u64 = 2_000;
pub const DEFAULT_NO_PROGRESS_TIMEOUT_MS: u64 = 30_000;
pub const DEFAULT_MAX_HORIZONTAL_OFFSET_PX: u32 = 8;
pub const RESCUE_THRESHOLD: f64 = 0.70;
pub const SCORE_EPSILON: f64 = 1e-6;

impl SessionConfig {
    /// Builds a config for a capture rectangle of the given height, following
    /// the documented defaults (`max_search_offset_px` defaults to H/2).
    pub fn defaults_for_height(height: u32) -> Self {
        Self {
            capture_interval_ms: DEFAULT_CAPTURE_INTERVAL_MS,
            identical_backoff_ms: DEFAULT_IDENTICAL_BACKOFF_MS,
            max_search_offset_px: (height / 2).max(1),
            min_confidence: DEFAULT_MIN_CONFIDENCE,
            blend_band_px: DEFAULT_BLEND_BAND_PX,
            memory_cap_bytes: DEFAULT_MEMORY_CAP_BYTES,
            direction_lock: DirectionLockConfig::Auto,
            ignore_margins: IgnoreMargins::none(),
            metric: MetricConfig::MeanAbsoluteDifference,
            idle_stop_threshold: DEFAULT_IDLE_STOP_THRESHOLD,
            auto_stop_on_idle: true,
            allow_jump: false,
            max_horizontal_offset_px: DEFAULT_MAX_HORIZONTAL_OFFSET_PX,
            frame_watchdog_ms: DEFAULT_FRAME_WATCHDOG_MS,
            no_progress_timeout_ms: DEFAULT_NO_PROGRESS_TIMEOUT_MS,
        }
    }

    /// Validates the configuration against a capture rectangle, per the
    /// "Misconfiguration" row: rejected synchronously at `start_session`.
    pub fn validate(&self, rect: Rect) -> Result<(), String> {
        if rect.is_empty() {
            return Err("capture rectangle must have positive width and height".to_string());
        }
        if self.ignore_margins.covers_entire(rect.width, rect.height) {
            return Err("ignore_margins cover the entire capture rectangle".to_string());
        }
        if self.capture_interval_ms == 0 {
            return Err("capture_interval_ms must be greater than 0".to_string());
        }
        if !(0.0..=1.0).contains(&self.min_confidence) {
            return Err("min_confidence must be in [0, 1]".to_string());
        }
        if self.max_search_offset_px == 0 {
            return Err("max_search_offset_px must be greater than 0".to_string());
        }
        if self.blend_band_px as u64 >= rect.height as u64 {
            return Err("blend_band_px must be smaller than the capture rectangle height".to_string());
        }
        Ok(())
    }

    /// Loads a config override from a TOML file, the same way
    /// `ConfigPrivacyGuard` reads its policy file: missing values fall back
    /// to the height-derived defaults rather than failing. The stitcher
    /// itself never reads this file on its own; a host application loads it
    /// once and passes the resulting `SessionConfig` into `start_session`
    /// (no global singletons: every session is fully owned by its handle).
    pub fn load_toml(path: &std::path::Path, default_height: u32) -> anyhow::Result<Self> {
        use anyhow::Context;
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read session config {}", path.display()))?;
        Self::from_toml_str(&text, default_height)
    }

    pub fn from_toml_str(text: &str, default_height: u32) -> anyhow::Result<Self> {
        use anyhow::Context;
        let overrides: SessionConfigOverrides = toml::from_str(text)
            .context("failed to parse session config (expected TOML)")?;
        Ok(overrides.apply(Self::defaults_for_height(default_height)))
    }

    pub fn to_toml_string(&self) -> anyhow::Result<String> {
        toml::to_string_pretty(self).map_err(anyhow::Error::from)
    }
}

/// Every field optional, so a config file only needs to name the options a
/// host wants to override; everything else keeps `defaults_for_height`'s
/// value. Mirrors the `PrivacyConfigFile` deny/allow split in `privacy.rs`.
#[derive(Debug, Default, serde::Deserialize)]
#[serde(rename_all = "kebab-case")]
struct SessionConfigOverrides {
    capture_interval_ms: Option<u64>,
    identical_backoff_ms: Option<u64>,
    max_search_offset_px: Option<u32>,
    min_confidence: Option<f64>,
    blend_band_px: Option<u32>,
    memory_cap_bytes: Option<u64>,
    direction_lock: Option<DirectionLockConfig>,
    ignore_margins: Option<IgnoreMargins>,
    metric: Option<MetricConfig>,
    idle_stop_threshold: Option<u32>,
    auto_stop_on_idle: Option<bool>,
    allow_jump: Option<bool>,
    max_horizontal_offset_px: Option<u32>,
    frame_watchdog_ms: Option<u64>,
    no_progress_timeout_ms: Option<u64>,
}

impl SessionConfigOverrides {
    fn apply(self, mut base: SessionConfig) -> SessionConfig {
        if let Some(v) = self.capture_interval_ms {
            base.capture_interval_ms = v;
        }
        if let Some(v) = self.identical_backoff_ms {
            base.identical_backoff_ms = v;
        }
        if let Some(v) = self.max_search_offset_px {
            base.max_search_offset_px = v;
        }
        if let Some(v) = self.min_confidence {
            base.min_confidence = v;
        }
        if let Some(v) = self.blend_band_px {
            base.blend_band_px = v;
        }
        if let Some(v) = self.memory_cap_bytes {
            base.memory_cap_bytes = v;
        }
        if let Some(v) = self.direction_lock {
            base.direction_lock = v;
        }
        if let Some(v) = self.ignore_margins {
            base.ignore_margins = v;
        }
        if let Some(v) = self.metric {
            base.metric = v;
        }
        if let Some(v) = self.idle_stop_threshold {
            base.idle_stop_threshold = v;
        }
        if let Some(v) = self.auto_stop_on_idle {
            base.auto_stop_on_idle = v;
        }
        if let Some(v) = self.allow_jump {
            base.allow_jump = v;
        }
        if let Some(v) = self.max_horizontal_offset_px {
            base.max_horizontal_offset_px = v;
        }
        if let Some(v) = self.frame_watchdog_ms {
            base.frame_watchdog_ms = v;
        }
        if let Some(v) = self.no_progress_timeout_ms {
            base.no_progress_timeout_ms = v;
        }
        base
    }
}

/// One of the session lifecycle states driven by the Controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    Running,
    Paused,
    Stopping,
    Finished,
    Faulted,
}

impl SessionState {
    pub fn is_terminal(self) -> bool {
        matches!(self, SessionState::Finished | SessionState::Faulted)
    }
}

/// Metadata retained per accepted frame.
#[derive(Debug, Clone, Copy)]
pub struct AcceptedFrameRecord {
    pub sequence: u64,
    pub dy: i64,
    pub dx: i32,
    pub confidence: f64,
    pub canvas_y_start: u64,
    pub canvas_y_end: u64,
    pub jump: bool,
}
