//! CF-Cam-Capture: capture-session control and ROI intensity pipeline for a
//! fluorescence imaging accessory.
//!
//! The library drives a back-facing camera into a fixed 10-bit bi-planar
//! capture mode, applies operator exposure, gain and illumination settings,
//! and reduces every frame to a mean brightness over a centred region.
//! Hardware access goes through the collaborator traits in [`traits`], with a
//! V4L2 implementation in [`device`] and mock devices for tests.

pub mod config;
pub mod controller;
pub mod device;
pub mod error;
pub mod format;
pub mod frames;
pub mod sampler;
pub mod service;
pub mod session;
pub mod traits;
pub mod validation;

#[cfg(test)]
pub mod mock;

pub use config::Config;
pub use controller::{CaptureSettings, EffectiveSettings, ExposureController};
pub use device::{DevicePermissions, V4L2Device, V4L2Provider, V4L2Session};
pub use error::{CaptureError, FailureReason, Result};
pub use sampler::{RoiMetric, RoiSampler};
pub use service::{CaptureService, Presentation};
pub use session::{CaptureSessionManager, SessionEvent, SessionSnapshot, SessionState};
pub use traits::{
    CameraDevice, CaptureFormat, CaptureSession, DeviceBounds, DeviceKind, DeviceProvider,
    FourCC, PlanarBuffer,
};
