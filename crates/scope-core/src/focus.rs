//! Focus metric estimation.
//!
//! A frame is reduced to a scalar score according to the focus mode:
//!
//! - [`FocusMode::Sharpness`]: Tenengrad energy, the mean squared Sobel
//!   gradient magnitude over the interior of the frame.
//! - [`FocusMode::Contrast`]: standard deviation over mean intensity.
//!
//! Scores are averaged over the [`FOCUS_WINDOW_FRAMES`] most recent frames.
//! With fewer frames available the average covers what is there.
//!
//! The functions here are pure. The camera driver owns a
//! [`FocusMetricEstimator`] and publishes its [`FocusReading`]s.

use std::collections::VecDeque;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::data::{Frame, ImageQuality};
use crate::limits::FOCUS_WINDOW_FRAMES;
use crate::types::FocusMode;

/// Pixel deviation from the interior mean that marks a border pixel as foreign.
const BOUNDARY_DEVIATION: f64 = 0.25;

/// Border band width as a fraction of the smaller frame dimension.
const BOUNDARY_BAND: f64 = 0.1;

// =============================================================================
// Per-frame metrics
// =============================================================================

/// Tenengrad sharpness on normalized pixels.
///
/// Returns 0 for frames smaller than 3×3.
pub fn tenengrad(frame: &Frame) -> f64 {
    let w = frame.width as usize;
    let h = frame.height as usize;
    if w < 3 || h < 3 {
        return 0.0;
    }
    let px = frame.normalized();
    if px.len() < w * h {
        return 0.0;
    }
    let at = |x: usize, y: usize| px[y * w + x];

    let mut energy = 0.0;
    for y in 1..h - 1 {
        for x in 1..w - 1 {
            let gx = (at(x + 1, y - 1) + 2.0 * at(x + 1, y) + at(x + 1, y + 1))
                - (at(x - 1, y - 1) + 2.0 * at(x - 1, y) + at(x - 1, y + 1));
            let gy = (at(x - 1, y + 1) + 2.0 * at(x, y + 1) + at(x + 1, y + 1))
                - (at(x - 1, y - 1) + 2.0 * at(x, y - 1) + at(x + 1, y - 1));
            energy += gx * gx + gy * gy;
        }
    }
    energy / ((w - 2) * (h - 2)) as f64
}

/// Normalized intensity spread (σ / μ). Zero for black or empty frames.
pub fn contrast(frame: &Frame) -> f64 {
    let px = frame.normalized();
    if px.is_empty() {
        return 0.0;
    }
    let n = px.len() as f64;
    let mean = px.iter().sum::<f64>() / n;
    if mean <= f64::EPSILON {
        return 0.0;
    }
    let var = px.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / n;
    var.sqrt() / mean
}

/// Single-frame score for a focus mode.
pub fn measure(frame: &Frame, mode: FocusMode) -> f64 {
    match mode {
        FocusMode::Sharpness => tenengrad(frame),
        FocusMode::Contrast => contrast(frame),
    }
}

/// Fraction of the border band whose pixels deviate strongly from the interior mean.
pub fn boundary_score(frame: &Frame) -> f64 {
    let w = frame.width as usize;
    let h = frame.height as usize;
    let band = ((w.min(h) as f64 * BOUNDARY_BAND).ceil() as usize).max(1);
    if w <= 2 * band || h <= 2 * band {
        return 0.0;
    }
    let px = frame.normalized();
    if px.len() < w * h {
        return 0.0;
    }

    let mut interior_sum = 0.0;
    let mut interior_n = 0usize;
    for y in band..h - band {
        for x in band..w - band {
            interior_sum += px[y * w + x];
            interior_n += 1;
        }
    }
    let interior_mean = interior_sum / interior_n as f64;

    let mut border_n = 0usize;
    let mut foreign = 0usize;
    for y in 0..h {
        for x in 0..w {
            let in_band = x < band || y < band || x >= w - band || y >= h - band;
            if in_band {
                border_n += 1;
                if (px[y * w + x] - interior_mean).abs() > BOUNDARY_DEVIATION {
                    foreign += 1;
                }
            }
        }
    }
    foreign as f64 / border_n as f64
}

/// All image-quality figures for one frame.
pub fn image_quality(frame: &Frame) -> ImageQuality {
    ImageQuality {
        sharpness: tenengrad(frame),
        contrast: contrast(frame),
        mean_intensity: frame.mean(),
        boundary_score: boundary_score(frame),
    }
}

// =============================================================================
// Sliding window
// =============================================================================

/// One scored frame.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct FocusSample {
    /// Single-frame score
    pub value: f64,
    /// Focus actuator position when the frame was taken
    pub position: f64,
    /// Monotonic frame counter
    pub sequence: u64,
    /// Wall-clock capture time
    pub timestamp: DateTime<Utc>,
}

/// Bounded most-recent-N window of samples, oldest evicted first.
#[derive(Debug, Clone)]
pub struct FocusWindow {
    samples: VecDeque<FocusSample>,
    capacity: usize,
}

impl Default for FocusWindow {
    fn default() -> Self {
        Self::new(FOCUS_WINDOW_FRAMES)
    }
}

impl FocusWindow {
    /// Window holding at most `capacity` samples (at least one).
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            samples: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    /// Append a sample, evicting the oldest when full.
    pub fn push(&mut self, sample: FocusSample) {
        if self.samples.len() == self.capacity {
            self.samples.pop_front();
        }
        self.samples.push_back(sample);
    }

    /// Mean of the held samples, `None` when empty.
    pub fn average(&self) -> Option<f64> {
        if self.samples.is_empty() {
            return None;
        }
        Some(self.samples.iter().map(|s| s.value).sum::<f64>() / self.samples.len() as f64)
    }

    /// Number of held samples.
    pub fn len(&self) -> usize {
        self.samples.len()
    }

    /// True when no samples are held.
    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// Configured capacity.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Most recent sample.
    pub fn latest(&self) -> Option<&FocusSample> {
        self.samples.back()
    }

    /// Number of most recent samples taken at the same position as the latest one.
    pub fn trailing_at_latest(&self) -> usize {
        match self.samples.back() {
            Some(last) => self
                .samples
                .iter()
                .rev()
                .take_while(|s| s.position == last.position)
                .count(),
            None => 0,
        }
    }

    /// Drop all samples.
    pub fn clear(&mut self) {
        self.samples.clear();
    }
}

// =============================================================================
// Estimator
// =============================================================================

/// Averaged focus score as published on the camera's live signal.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct FocusReading {
    /// Window-averaged score
    pub score: f64,
    /// Actuator position of the most recent frame
    pub position: f64,
    /// Sequence number of the most recent frame
    pub sequence: u64,
    /// Frames in the average
    pub frames: usize,
    /// Trailing frames in the window taken at `position`
    pub settled_frames: usize,
    /// Metric the score was computed with
    pub mode: FocusMode,
}

impl Default for FocusReading {
    fn default() -> Self {
        Self {
            score: 0.0,
            position: 0.0,
            sequence: 0,
            frames: 0,
            settled_frames: 0,
            mode: FocusMode::default(),
        }
    }
}

/// Turns a stream of frames into averaged focus readings.
#[derive(Debug, Clone)]
pub struct FocusMetricEstimator {
    mode: FocusMode,
    window: FocusWindow,
    sequence: u64,
}

impl FocusMetricEstimator {
    /// Estimator for `mode` with the standard window.
    pub fn new(mode: FocusMode) -> Self {
        Self {
            mode,
            window: FocusWindow::default(),
            sequence: 0,
        }
    }

    /// Active metric.
    pub fn mode(&self) -> FocusMode {
        self.mode
    }

    /// Switch metric. Scores of different metrics are not comparable, so the
    /// window restarts.
    pub fn set_mode(&mut self, mode: FocusMode) {
        if mode != self.mode {
            self.mode = mode;
            self.window.clear();
        }
    }

    /// Score a frame taken at `position` and return the updated reading.
    pub fn observe(&mut self, frame: &Frame, position: f64) -> FocusReading {
        self.sequence += 1;
        self.window.push(FocusSample {
            value: measure(frame, self.mode),
            position,
            sequence: self.sequence,
            timestamp: Utc::now(),
        });
        self.reading()
    }

    /// Current reading without consuming a frame.
    pub fn reading(&self) -> FocusReading {
        let latest = self.window.latest();
        FocusReading {
            score: self.window.average().unwrap_or(0.0),
            position: latest.map(|s| s.position).unwrap_or(0.0),
            sequence: self.sequence,
            frames: self.window.len(),
            settled_frames: self.window.trailing_at_latest(),
            mode: self.mode,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn checkerboard(size: u32, cell: u32) -> Frame {
        let mut data = Vec::with_capacity((size * size) as usize);
        for y in 0..size {
            for x in 0..size {
                let on = ((x / cell) + (y / cell)) % 2 == 0;
                data.push(if on { 220 } else { 30 });
            }
        }
        Frame::from_u8(size, size, data)
    }

    fn sample(value: f64, sequence: u64) -> FocusSample {
        FocusSample {
            value,
            position: 0.5,
            sequence,
            timestamp: Utc::now(),
        }
    }

    #[test]
    fn flat_frame_has_no_sharpness_or_contrast() {
        let frame = Frame::from_u8(8, 8, vec![128; 64]);
        assert_eq!(tenengrad(&frame), 0.0);
        assert!(contrast(&frame) < 1e-12);
    }

    #[test]
    fn edges_raise_sharpness() {
        let fine = checkerboard(16, 2);
        let flat = Frame::from_u8(16, 16, vec![128; 256]);
        assert!(tenengrad(&fine) > tenengrad(&flat));
        assert!(measure(&fine, FocusMode::Contrast) > 0.5);
    }

    #[test]
    fn black_frame_contrast_is_zero() {
        let frame = Frame::from_u8(4, 4, vec![0; 16]);
        assert_eq!(contrast(&frame), 0.0);
    }

    #[test]
    fn window_averages_available_frames() {
        let mut window = FocusWindow::default();
        assert_eq!(window.average(), None);
        window.push(sample(3.0, 1));
        assert_eq!(window.average(), Some(3.0));
        window.push(sample(6.0, 2));
        assert_eq!(window.average(), Some(4.5));
    }

    #[test]
    fn window_evicts_oldest() {
        let mut window = FocusWindow::new(3);
        for (i, v) in [1.0, 2.0, 3.0, 10.0].into_iter().enumerate() {
            window.push(sample(v, i as u64));
        }
        assert_eq!(window.len(), 3);
        assert_eq!(window.average(), Some(5.0));
        assert_eq!(window.latest().map(|s| s.sequence), Some(3));
    }

    #[test]
    fn estimator_mode_switch_restarts_window() {
        let mut est = FocusMetricEstimator::new(FocusMode::Sharpness);
        let frame = checkerboard(12, 3);
        est.observe(&frame, 0.2);
        est.observe(&frame, 0.3);
        assert_eq!(est.reading().frames, 2);

        est.set_mode(FocusMode::Contrast);
        assert_eq!(est.reading().frames, 0);
        let reading = est.observe(&frame, 0.4);
        assert_eq!(reading.frames, 1);
        assert_eq!(reading.sequence, 3);
        assert_eq!(reading.position, 0.4);
        assert_eq!(reading.mode, FocusMode::Contrast);
    }

    #[test]
    fn settled_frames_count_trailing_position() {
        let mut est = FocusMetricEstimator::new(FocusMode::Sharpness);
        let frame = checkerboard(12, 3);
        est.observe(&frame, 0.2);
        est.observe(&frame, 0.3);
        assert_eq!(est.reading().settled_frames, 1);
        est.observe(&frame, 0.3);
        est.observe(&frame, 0.3);
        let reading = est.reading();
        assert_eq!(reading.settled_frames, 3);
        assert_eq!(reading.frames, 3);
    }

    #[test]
    fn boundary_score_flags_dark_edge() {
        let size = 20u32;
        let mut data = vec![200u8; (size * size) as usize];
        for y in 0..size {
            for x in 0..3 {
                data[(y * size + x) as usize] = 0;
            }
        }
        let edge = Frame::from_u8(size, size, data);
        let uniform = Frame::from_u8(size, size, vec![200; (size * size) as usize]);
        assert!(boundary_score(&edge) > 0.1);
        assert_eq!(boundary_score(&uniform), 0.0);
    }
}
