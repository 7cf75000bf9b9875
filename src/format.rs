//! Capture format selection.

use crate::error::{CaptureError, Result};
use crate::traits::{CaptureFormat, FourCC};

/// The only pixel layout the accessory can be used with: 10-bit bi-planar
/// 4:2:0, luma in plane 0.
pub const REQUIRED_PIXEL_FORMAT: FourCC = FourCC::P010;

/// Pick the first format carrying [`REQUIRED_PIXEL_FORMAT`].
///
/// There is no scoring and no fallback: a device without the required layout
/// cannot be used, and the caller must not open a session with anything else.
pub fn select_format(supported: &[CaptureFormat]) -> Result<CaptureFormat> {
    supported
        .iter()
        .find(|format| format.pixel_format == REQUIRED_PIXEL_FORMAT)
        .cloned()
        .ok_or(CaptureError::FormatUnavailable {
            required: REQUIRED_PIXEL_FORMAT,
        })
}
