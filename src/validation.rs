//! Frame validation utilities.
//!
//! Structural checks for bi-planar frames before they reach the sampler, and
//! the sequence gap check the capture loop uses to spot skipped driver frames.

use crate::error::{CaptureError, Result};
use crate::format::REQUIRED_PIXEL_FORMAT;
use crate::traits::PlanarBuffer;

/// Bytes per sample in either plane of a 16-bit container format.
const BYTES_PER_SAMPLE: usize = 2;

/// Low bits that are always zero when 10 significant bits sit in the high end
/// of a 16-bit container.
const P010_PADDING_MASK: u16 = 0x003F;

/// Validates that a frame's planes are large enough for its declared size.
///
/// A 10-bit bi-planar frame has a full-resolution luma plane followed by an
/// interleaved chroma plane at half height. Rows may be padded, so only the
/// lower bound on stride is checked.
///
/// # Arguments
///
/// * `frame` - The frame to validate
///
/// # Errors
///
/// Returns `InvalidBuffer` if:
/// - The frame does not have exactly two planes
/// - A plane's stride is narrower than one row of samples
/// - A plane's data is shorter than `stride * rows`
pub fn validate_planar_layout(frame: &PlanarBuffer) -> Result<()> {
    if frame.planes.len() != 2 {
        return Err(CaptureError::InvalidBuffer(format!(
            "expected 2 planes, got {}",
            frame.planes.len()
        )));
    }

    let min_stride = frame.width as usize * BYTES_PER_SAMPLE;
    let rows = [frame.height as usize, frame.height.div_ceil(2) as usize];
    for (index, (plane, rows)) in frame.planes.iter().zip(rows).enumerate() {
        if plane.bytes_per_row < min_stride {
            return Err(CaptureError::InvalidBuffer(format!(
                "plane {index} stride {} is narrower than {min_stride} bytes",
                plane.bytes_per_row
            )));
        }
        let required = plane.bytes_per_row * rows;
        if plane.data.len() < required {
            return Err(CaptureError::InvalidBuffer(format!(
                "plane {index} holds {} bytes, expected at least {required}",
                plane.data.len()
            )));
        }
    }

    Ok(())
}

/// Validates that luma samples carry their 10 bits in the high end of each
/// 16-bit word.
///
/// This samples every `step`-th pixel on every `step`-th row rather than the
/// whole plane.
///
/// # Errors
///
/// Returns `InvalidBuffer` if the frame is not tagged with the required
/// format or any sampled value has low padding bits set.
pub fn validate_sample_alignment(frame: &PlanarBuffer, step: u32) -> Result<()> {
    if frame.pixel_format != REQUIRED_PIXEL_FORMAT {
        return Err(CaptureError::InvalidBuffer(format!(
            "frame is {}, not {REQUIRED_PIXEL_FORMAT}",
            frame.pixel_format
        )));
    }

    let step = step.max(1) as usize;
    for y in (0..frame.height).step_by(step) {
        for x in (0..frame.width).step_by(step) {
            let value = frame.luma_sample(x, y).ok_or_else(|| {
                CaptureError::InvalidBuffer(format!("failed to read luma at ({x}, {y})"))
            })?;
            if value & P010_PADDING_MASK != 0 {
                return Err(CaptureError::InvalidBuffer(format!(
                    "luma sample {value:#06x} at ({x}, {y}) has padding bits set"
                )));
            }
        }
    }

    Ok(())
}

/// Number of frames missing between `prev` and `curr`, or `None` if `curr`
/// follows directly.
///
/// A non-increasing sequence counts as a gap of zero frames.
pub const fn sequence_gap(prev: u64, curr: u64) -> Option<u64> {
    if curr == prev.wrapping_add(1) {
        None
    } else {
        Some(curr.saturating_sub(prev).saturating_sub(1))
    }
}
