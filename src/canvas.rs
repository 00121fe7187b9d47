use crate::types::{Frame, IgnoreMargins, PixelFormat};
use image::RgbaImage;
use std::collections::VecDeque;
use std::fmt;
use std::io::{Read, Seek, SeekFrom, Write};

/// Errors surfaced by [`Canvas`].
#[derive(Debug)]
pub enum CanvasError {
    NotInitialized,
    AlreadyInitialized,
    Frozen,
    InvalidShift(String),
    DimensionMismatch { expected: u32, found: u32 },
    SpillFailed(String),
}

impl fmt::Display for CanvasError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CanvasError::NotInitialized => write!(f, "canvas has not been initialized"),
            CanvasError::AlreadyInitialized => write!(f, "canvas is already initialized"),
            CanvasError::Frozen => write!(f, "canvas is frozen and no longer accepts writes"),
            CanvasError::InvalidShift(detail) => write!(f, "invalid append shift: {detail}"),
            CanvasError::DimensionMismatch { expected, found } => {
                write!(f, "frame width {found} does not match canvas width {expected}")
            }
            CanvasError::SpillFailed(detail) => write!(f, "canvas spill failed: {detail}"),
        }
    }
}

impl std::error::Error for CanvasError {}

/// A growing composite image of fixed width, backed by an in-memory row
/// deque with an overflow spill file.
///
/// Rows are addressed by a signed logical index so that `append_strip` can
/// grow the canvas either downward (`dy > 0`) or upward (`dy < 0`) without
/// renumbering existing rows; [`Canvas::freeze`] renumbers to a 0-based
/// image as its very last step.
pub struct Canvas {
    width: u32,
    format: PixelFormat,
    frame_height: u32,
    blend_band_px: u32,
    ignore_margins: IgnoreMargins,
    memory_cap_bytes: u64,
    retention_floor: u64,

    rows: VecDeque<Vec<u8>>,
    top_index: i64,
    total_height: u64,
    spill: Option<SpillFile>,
    initialized: bool,
    frozen: bool,
}

impl Canvas {
    /// `retention_floor` should be `H + max_search_offset_px + blend_band_px`:
    /// the comparator never needs more rows than that, so rows older than it
    /// are eligible for spilling.
    pub fn new(
        width: u32,
        format: PixelFormat,
        frame_height: u32,
        blend_band_px: u32,
        ignore_margins: IgnoreMargins,
        memory_cap_bytes: u64,
        retention_floor: u64,
    ) -> Self {
        Self {
            width,
            format,
            frame_height,
            blend_band_px,
            ignore_margins,
            memory_cap_bytes,
            retention_floor,
            rows: VecDeque::new(),
            top_index: 0,
            total_height: 0,
            spill: None,
            initialized: false,
            frozen: false,
        }
    }

    pub fn canvas_height(&self) -> u64 {
        self.total_height
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized
    }

    fn row_bytes(&self) -> usize {
        self.width as usize * self.format.bytes_per_pixel()
    }

    fn bottom_index(&self) -> i64 {
        self.top_index + self.rows.len() as i64 - 1
    }

    fn memory_bytes_in_use(&self) -> u64 {
        self.rows.len() as u64 * self.row_bytes() as u64
    }

    /// Copies `first_frame` into rows `[0, H)`.
    pub fn initialize(&mut self, first_frame: &Frame) -> Result<(), CanvasError> {
        if self.initialized {
            return Err(CanvasError::AlreadyInitialized);
        }
        if first_frame.width != self.width {
            return Err(CanvasError::DimensionMismatch {
                expected: self.width,
                found: first_frame.width,
            });
        }
        for y in 0..first_frame.height {
            self.rows.push_back(first_frame.row(y).to_vec());
        }
        self.top_index = 0;
        self.total_height = first_frame.height as u64;
        self.initialized = true;
        self.enforce_memory_cap()?;
        Ok(())
    }

    /// Extends the canvas by `|dy|` new rows. `dy > 0` appends
    /// at the bottom from the bottom `dy` rows of `frame`; `dy < 0` prepends
    /// at the top from the top `|dy|` rows of `frame`. `blend` controls
    /// whether the seam-hiding blend band is applied — callers performing a
    /// jump append (no true overlap) pass `false`.
    pub fn append_strip(
        &mut self,
        frame: &Frame,
        dy: i64,
        dx: i32,
        blend: bool,
    ) -> Result<(), CanvasError> {
        if self.frozen {
            return Err(CanvasError::Frozen);
        }
        if !self.initialized {
            return Err(CanvasError::NotInitialized);
        }
        if frame.width != self.width {
            return Err(CanvasError::DimensionMismatch {
                expected: self.width,
                found: frame.width,
            });
        }
        if dy == 0 || dy.unsigned_abs() as u32 > self.frame_height {
            return Err(CanvasError::InvalidShift(format!(
                "dy must be nonzero and at most {} in magnitude, got {dy}",
                self.frame_height
            )));
        }

        if dy > 0 {
            self.append_bottom(frame, dy as u32, dx, blend);
        } else {
            self.prepend_top(frame, (-dy) as u32, dx, blend);
        }

        self.enforce_memory_cap()
    }

    fn append_bottom(&mut self, frame: &Frame, dy: u32, dx: i32, blend: bool) {
        let old_bottom = self.bottom_index();
        let h = self.frame_height as i64;

        if blend && self.blend_band_px > 0 {
            let band = self.blend_band_px as i64;
            for k in 0..band {
                let idx = old_bottom - band + 1 + k;
                let tail_offset = idx - (old_bottom - h + 1);
                let i = tail_offset - dy as i64;
                if i < 0 || i >= h - dy as i64 {
                    continue;
                }
                let Some(existing) = self.row_clone_at(idx) else {
                    continue;
                };
                let new_row = shifted_row(frame, i as u32, dx, self.format.bytes_per_pixel());
                let alpha_new = (k + 1) as f64 / (band + 1) as f64;
                let blended = blend_rows(&existing, &new_row, alpha_new, self.format, self.width, &self.ignore_margins);
                if let Some(slot) = self.row_mut_at(idx) {
                    *slot = blended;
                }
            }
        }

        for src_y in (self.frame_height - dy)..self.frame_height {
            let row = shifted_row(frame, src_y, dx, self.format.bytes_per_pixel());
            self.rows.push_back(row);
        }
        self.total_height += dy as u64;
    }

    fn prepend_top(&mut self, frame: &Frame, abs_dy: u32, dx: i32, blend: bool) {
        let old_top = self.top_index;

        if blend && self.blend_band_px > 0 {
            let band = self.blend_band_px.min(self.frame_height.saturating_sub(abs_dy)) as i64;
            for k in 0..band {
                let idx = old_top + k;
                let i = abs_dy as i64 + k;
                if i < 0 || i >= self.frame_height as i64 {
                    continue;
                }
                let Some(existing) = self.row_clone_at(idx) else {
                    continue;
                };
                let new_row = shifted_row(frame, i as u32, dx, self.format.bytes_per_pixel());
                let alpha_new = (band - k) as f64 / (band + 1) as f64;
                let blended = blend_rows(&existing, &new_row, alpha_new, self.format, self.width, &self.ignore_margins);
                if let Some(slot) = self.row_mut_at(idx) {
                    *slot = blended;
                }
            }
        }

        for src_y in (0..abs_dy).rev() {
            let row = shifted_row(frame, src_y, dx, self.format.bytes_per_pixel());
            self.rows.push_front(row);
            self.top_index -= 1;
        }
        self.total_height += abs_dy as u64;
    }

    fn row_mut_at(&mut self, idx: i64) -> Option<&mut Vec<u8>> {
        let pos = idx - self.top_index;
        if pos < 0 || pos as usize >= self.rows.len() {
            return None;
        }
        self.rows.get_mut(pos as usize)
    }

    fn row_clone_at(&self, idx: i64) -> Option<Vec<u8>> {
        let pos = idx - self.top_index;
        if pos < 0 || pos as usize >= self.rows.len() {
            return None;
        }
        self.rows.get(pos as usize).cloned()
    }

    /// Returns a frame-shaped view of the bottom `n` rows, for the
    /// Comparator's `read_tail`. `None` if fewer than `n` rows are resident
    /// (should not happen given `retention_floor`).
    pub fn tail_frame(&self, n: u32, sequence: u64) -> Option<Frame> {
        if (n as usize) > self.rows.len() {
            return None;
        }
        let mut data = Vec::with_capacity(n as usize * self.row_bytes());
        for row in self.rows.iter().skip(self.rows.len() - n as usize) {
            data.extend_from_slice(row);
        }
        Some(Frame::new(self.width, n, self.format, data, sequence))
    }

    /// Spills rows older than `retention_floor` to a temp file once the
    /// in-memory footprint exceeds `memory_cap_bytes`.
    fn enforce_memory_cap(&mut self) -> Result<(), CanvasError> {
        while self.memory_bytes_in_use() > self.memory_cap_bytes
            && self.rows.len() as u64 > self.retention_floor
        {
            let Some(row) = self.rows.pop_front() else {
                break;
            };
            let idx = self.top_index;
            self.top_index += 1;
            if self.spill.is_none() {
                self.spill = Some(SpillFile::create()?);
            }
            self.spill.as_mut().unwrap().append_row(idx, &row)?;
        }
        Ok(())
    }

    /// The logical index of the topmost resident row (can be negative if
    /// `append_strip` has prepended rows). Exposed so the Controller can
    /// record where an accepted frame landed without forcing a freeze.
    pub fn top_logical_index(&self) -> i64 {
        self.top_index
    }

    /// The logical index of the bottommost resident row.
    pub fn bottom_logical_index(&self) -> i64 {
        self.bottom_index()
    }

    /// A non-destructive read of the current canvas, usable while the
    /// session is still running.
    pub fn snapshot(&mut self) -> Result<RgbaImage, CanvasError> {
        self.assemble()
    }

    /// Returns the full canvas as a single image, renumbered top-to-bottom
    /// from 0. The canvas is immutable afterward.
    pub fn freeze(&mut self) -> Result<RgbaImage, CanvasError> {
        if self.frozen {
            return Err(CanvasError::Frozen);
        }
        self.frozen = true;
        self.assemble()
    }

    fn assemble(&mut self) -> Result<RgbaImage, CanvasError> {
        let mut rows: Vec<(i64, Vec<u8>)> = Vec::with_capacity(self.total_height as usize);
        if let Some(spill) = self.spill.as_mut() {
            rows.extend(spill.read_all(self.row_bytes())?);
        }
        for (offset, row) in self.rows.iter().enumerate() {
            rows.push((self.top_index + offset as i64, row.clone()));
        }
        rows.sort_by_key(|(idx, _)| *idx);

        let bpp = self.format.bytes_per_pixel();
        let mut buffer = Vec::with_capacity(rows.len() * self.width as usize * 4);
        for (_, row) in &rows {
            match self.format {
                PixelFormat::Rgba8 => buffer.extend_from_slice(row),
                PixelFormat::Rgb8 => {
                    for px in row.chunks(bpp) {
                        buffer.extend_from_slice(px);
                        buffer.push(255);
                    }
                }
            }
        }

        RgbaImage::from_raw(self.width, rows.len() as u32, buffer)
            .ok_or_else(|| CanvasError::SpillFailed("failed to assemble frozen canvas buffer".to_string()))
    }
}

fn shifted_row(frame: &Frame, src_y: u32, dx: i32, bpp: usize) -> Vec<u8> {
    let width = frame.width as i64;
    let mut out = vec![0u8; frame.row_bytes()];
    let src_row = frame.row(src_y);
    for x in 0..width {
        let src_x = x + dx as i64;
        if src_x >= 0 && src_x < width {
            let src_off = src_x as usize * bpp;
            let dst_off = x as usize * bpp;
            out[dst_off..dst_off + bpp].copy_from_slice(&src_row[src_off..src_off + bpp]);
        }
    }
    out
}

/// Blends `existing` and `new` byte-for-byte, except inside the left/right
/// ignore margins, where `existing` is always kept — ignored columns are
/// never overwritten, even by a blend.
fn blend_rows(
    existing: &[u8],
    new: &[u8],
    alpha_new: f64,
    format: PixelFormat,
    width: u32,
    margins: &IgnoreMargins,
) -> Vec<u8> {
    let bpp = format.bytes_per_pixel();
    let mut out = existing.to_vec();
    let x_start = margins.left as usize;
    let x_end = (width as usize).saturating_sub(margins.right as usize);
    for x in x_start..x_end {
        let offset = x * bpp;
        for c in 0..bpp {
            let o = existing[offset + c] as f64;
            let n = new[offset + c] as f64;
            out[offset + c] = (o * (1.0 - alpha_new) + n * alpha_new).round().clamp(0.0, 255.0) as u8;
        }
    }
    out
}

struct SpillFile {
    temp: tempfile::NamedTempFile,
}

impl SpillFile {
    fn create() -> Result<Self, CanvasError> {
        let temp = tempfile::NamedTempFile::new().map_err(spill_err)?;
        Ok(Self { temp })
    }

    fn append_row(&mut self, index: i64, row: &[u8]) -> Result<(), CanvasError> {
        self.temp.write_all(&index.to_le_bytes()).map_err(spill_err)?;
        self.temp.write_all(row).map_err(spill_err)?;
        Ok(())
    }

    fn read_all(&mut self, row_bytes: usize) -> Result<Vec<(i64, Vec<u8>)>, CanvasError> {
        self.temp.seek(SeekFrom::Start(0)).map_err(spill_err)?;
        let mut out = Vec::new();
        let mut index_buf = [0u8; 8];
        loop {
            match self.temp.read_exact(&mut index_buf) {
                Ok(()) => {}
                Err(err) if err.kind() == std::io::ErrorKind::UnexpectedEof => break,
                Err(err) => return Err(spill_err(err)),
            }
            let index = i64::from_le_bytes(index_buf);
            let mut row = vec![0u8; row_bytes];
            self.temp.read_exact(&mut row).map_err(spill_err)?;
            out.push((index, row));
        }
        Ok(out)
    }
}

fn spill_err(err: std::io::Error) -> CanvasError {
    CanvasError::SpillFailed(err.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::PixelFormat;

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

    fn retention_floor(h: u32) -> u64 {
        h as u64 + (h / 2) as u64 + 8
    }

    #[test]
    fn initialize_sets_height_to_frame_height() {
        let mut canvas = Canvas::new(100, PixelFormat::Rgba8, 150, 8, IgnoreMargins::none(), 64 * 1024 * 1024, retention_floor(150));
        let frame = gradient_frame(100, 150, 0, 0);
        canvas.initialize(&frame).unwrap();
        assert_eq!(canvas.canvas_height(), 150);
    }

    #[test]
    fn append_grows_height_and_tail_matches_shifted_frame() {
        let mut canvas = Canvas::new(100, PixelFormat::Rgba8, 150, 8, IgnoreMargins::none(), 64 * 1024 * 1024, retention_floor(150));
        let f0 = gradient_frame(100, 150, 0, 0);
        canvas.initialize(&f0).unwrap();

        let f1 = gradient_frame(100, 150, 40, 1);
        canvas.append_strip(&f1, 40, 0, true).unwrap();
        assert_eq!(canvas.canvas_height(), 190);

        let tail = canvas.tail_frame(150, 99).unwrap();
        // Outside the blend band, the tail must equal f1 exactly.
        for y in (canvas.blend_band_px as u32)..150 {
            assert_eq!(tail.row(y), f1.row(y));
        }
    }

    #[test]
    fn prepend_grows_height_upward() {
        let mut canvas = Canvas::new(100, PixelFormat::Rgba8, 150, 8, IgnoreMargins::none(), 64 * 1024 * 1024, retention_floor(150));
        let f0 = gradient_frame(100, 150, 100, 0);
        canvas.initialize(&f0).unwrap();

        let f1 = gradient_frame(100, 150, 70, 1);
        canvas.append_strip(&f1, -30, 0, true).unwrap();
        assert_eq!(canvas.canvas_height(), 180);
    }

    #[test]
    fn blend_band_is_between_old_and_new_values() {
        let width = 40;
        let height = 60;
        let mut old = vec![0u8; width * height * 4];
        for px in old.chunks_mut(4) {
            px[0] = 10;
            px[1] = 10;
            px[2] = 10;
            px[3] = 255;
        }
        let old_frame = Frame::new(width as u32, height as u32, PixelFormat::Rgba8, old, 0);

        let mut canvas = Canvas::new(width as u32, PixelFormat::Rgba8, height as u32, 10, IgnoreMargins::none(), 64 * 1024 * 1024, retention_floor(height as u32));
        canvas.initialize(&old_frame).unwrap();

        let mut new_data = vec![0u8; width * height * 4];
        for px in new_data.chunks_mut(4) {
            px[0] = 200;
            px[1] = 200;
            px[2] = 200;
            px[3] = 255;
        }
        let new_frame = Frame::new(width as u32, height as u32, PixelFormat::Rgba8, new_data, 1);

        canvas.append_strip(&new_frame, 20, 0, true).unwrap();
        let tail = canvas.tail_frame(height as u32, 2).unwrap();
        // Row just inside the blend band (index H - blend_band_px) should be
        // strictly between 10 and 200, not flush to either extreme.
        let blended_pixel = tail.row(height as u32 - 10)[0];
        assert!(blended_pixel > 10 && blended_pixel < 200);
    }

    #[test]
    fn memory_cap_forces_spill_and_freeze_reconstructs_correctly() {
        let width = 20;
        let height = 30;
        let tiny_cap = (width * height * 4 * 2) as u64; // room for ~2 frames' worth of rows
        let mut canvas = Canvas::new(
            width as u32,
            PixelFormat::Rgba8,
            height as u32,
            4,
            IgnoreMargins::none(),
            tiny_cap,
            retention_floor(height as u32),
        );
        let f0 = gradient_frame(width as u32, height as u32, 0, 0);
        canvas.initialize(&f0).unwrap();

        let mut row_offset = 0u32;
        for seq in 1..15u64 {
            row_offset += 10;
            let frame = gradient_frame(width as u32, height as u32, row_offset, seq);
            canvas.append_strip(&frame, 10, 0, true).unwrap();
        }

        assert!(canvas.spill.is_some(), "expected spill to have been triggered");
        let expected_height = canvas.canvas_height();
        let image = canvas.freeze().unwrap();
        assert_eq!(image.height() as u64, expected_height);
        assert_eq!(image.width(), width as u32);
    }

    #[test]
    fn dimension_mismatch_is_rejected() {
        let mut canvas = Canvas::new(100, PixelFormat::Rgba8, 150, 8, IgnoreMargins::none(), 64 * 1024 * 1024, retention_floor(150));
        let wrong_width = gradient_frame(90, 150, 0, 0);
        assert!(canvas.initialize(&wrong_width).is_err());
    }
}
