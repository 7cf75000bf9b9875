//! Region-of-interest brightness sampling.
//!
//! Each delivered frame is reduced to a single number: the mean of the 16-bit
//! luma samples in a fixed 200x200 square at the frame centre. The mean is
//! then coarsely rescaled into the operator display value.

use std::fmt;

use tracing::warn;

use crate::error::{CaptureError, Result};
use crate::format::REQUIRED_PIXEL_FORMAT;
use crate::traits::{FourCC, PlanarBuffer};

/// Half the side length of the sampled square, in samples.
pub const ROI_HALF_SIZE: u32 = 100;

/// Consecutive wrong-format frames tolerated before the session is failed.
pub const WRONG_FORMAT_LIMIT: u32 = 100;

/// Divisor applied to the raw mean: 10 display steps per unit after removing
/// the 4x container scaling.
const DISPLAY_DIVISOR: f64 = 40.0;
const DISPLAY_STEP: i64 = 10;
const DISPLAY_OFFSET: i64 = 1020;

/// Half-open sample rectangle `[x0, x1) x [y0, y1)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RoiRegion {
    /// First column.
    pub x0: u32,
    /// Column past the last.
    pub x1: u32,
    /// First row.
    pub y0: u32,
    /// Row past the last.
    pub y1: u32,
}

impl RoiRegion {
    /// The centred region for a `width` x `height` frame.
    ///
    /// The centre is `(width / 2 - 1, height / 2 - 1)`; frames too small to
    /// contain the full square are rejected.
    pub fn centered(width: u32, height: u32) -> Result<Self> {
        let too_small = || CaptureError::FrameTooSmall { width, height };
        let center_x = (width / 2).checked_sub(1).ok_or_else(too_small)?;
        let center_y = (height / 2).checked_sub(1).ok_or_else(too_small)?;
        let x0 = center_x.checked_sub(ROI_HALF_SIZE).ok_or_else(too_small)?;
        let y0 = center_y.checked_sub(ROI_HALF_SIZE).ok_or_else(too_small)?;
        let region = Self {
            x0,
            x1: center_x + ROI_HALF_SIZE,
            y0,
            y1: center_y + ROI_HALF_SIZE,
        };
        if region.x1 > width || region.y1 > height {
            return Err(too_small());
        }
        Ok(region)
    }

    /// Number of samples in the region.
    pub const fn sample_count(&self) -> u64 {
        (self.x1 - self.x0) as u64 * (self.y1 - self.y0) as u64
    }
}

/// Computes the ROI mean of a frame's luma plane.
#[derive(Debug, Default)]
pub struct RoiSampler;

impl RoiSampler {
    /// Create a sampler.
    pub const fn new() -> Self {
        Self
    }

    /// Arithmetic mean of the luma samples inside the centred region.
    pub fn sample(&self, frame: &PlanarBuffer) -> Result<f64> {
        let region = RoiRegion::centered(frame.width, frame.height)?;
        let plane = frame
            .luma()
            .ok_or_else(|| CaptureError::InvalidBuffer("missing luma plane".to_owned()))?;

        let row_start = region.x0 as usize * 2;
        let row_end = region.x1 as usize * 2;
        let mut sum: u64 = 0;
        for y in region.y0..region.y1 {
            let offset = y as usize * plane.bytes_per_row;
            let row = plane
                .data
                .get(offset + row_start..offset + row_end)
                .ok_or_else(|| {
                    CaptureError::InvalidBuffer(format!(
                        "luma plane too short for row {y} ({} bytes, stride {})",
                        plane.data.len(),
                        plane.bytes_per_row
                    ))
                })?;
            sum += row
                .chunks_exact(2)
                .map(|pair| match pair {
                    [lo, hi] => u64::from(u16::from_le_bytes([*lo, *hi])),
                    _ => 0,
                })
                .sum::<u64>();
        }

        #[allow(clippy::cast_precision_loss)]
        Ok(sum as f64 / region.sample_count() as f64)
    }
}

/// Rescale a raw ROI mean into the operator display value.
///
/// `trunc(mean / 40) * 10 - 1020`, nominally `0..=13400`. This is a coarse
/// quantization for judging image quality in the field, not a calibrated
/// intensity; the precision loss is intended.
pub fn normalize_display(mean: f64) -> i64 {
    #[allow(clippy::cast_possible_truncation)]
    let steps = (mean / DISPLAY_DIVISOR).trunc() as i64;
    steps * DISPLAY_STEP - DISPLAY_OFFSET
}

/// Brightness metric published once per sampled frame.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RoiMetric {
    /// Raw ROI mean.
    pub mean: f64,
    /// Display value from [`normalize_display`].
    pub display: i64,
    /// Sequence number of the sampled frame.
    pub sequence: u64,
}

impl RoiMetric {
    /// Build the metric for a frame's raw mean.
    pub fn new(mean: f64, sequence: u64) -> Self {
        Self {
            mean,
            display: normalize_display(mean),
            sequence,
        }
    }

    /// Operator label, e.g. `ROI Avg: 4180`.
    pub fn label(&self) -> String {
        format!("ROI Avg: {}", self.display)
    }
}

impl fmt::Display for RoiMetric {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ROI Avg: {}", self.display)
    }
}

/// What to do with a delivered frame after checking its pixel format.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameVerdict {
    /// Correct format: sample it.
    Sample,
    /// Wrong format, still under the limit: skip it.
    Skip,
    /// Wrong format for too long: the device has left the required format.
    Fatal,
}

/// Counts consecutive frames that arrive in a foreign pixel format.
#[derive(Debug)]
pub struct WrongFormatGuard {
    expected: FourCC,
    limit: u32,
    consecutive: u32,
}

impl Default for WrongFormatGuard {
    fn default() -> Self {
        Self::new(REQUIRED_PIXEL_FORMAT, WRONG_FORMAT_LIMIT)
    }
}

impl WrongFormatGuard {
    /// Guard for `expected`, failing after more than `limit` mismatches in a row.
    pub const fn new(expected: FourCC, limit: u32) -> Self {
        Self {
            expected,
            limit,
            consecutive: 0,
        }
    }

    /// Check one frame's tag. A matching frame resets the count.
    pub fn observe(&mut self, pixel_format: FourCC) -> FrameVerdict {
        if pixel_format == self.expected {
            self.consecutive = 0;
            return FrameVerdict::Sample;
        }
        self.consecutive = self.consecutive.saturating_add(1);
        if self.consecutive > self.limit {
            warn!(
                count = self.consecutive,
                actual = %pixel_format,
                expected = %self.expected,
                "Device keeps delivering frames in the wrong format"
            );
            FrameVerdict::Fatal
        } else {
            FrameVerdict::Skip
        }
    }

    /// Current run of mismatching frames.
    pub const fn consecutive(&self) -> u32 {
        self.consecutive
    }
}
