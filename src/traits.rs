//! Core types and collaborator traits for the capture subsystem.
//!
//! The platform camera driver is not part of this crate: it is consumed through
//! [`DeviceProvider`], [`CameraDevice`], [`CaptureSession`] and [`Authorizer`].

use std::fmt;
use std::ops::{Deref, DerefMut};
use std::str::FromStr;
use std::time::Duration;

use serde::Deserialize;
use tracing::warn;

use crate::error::Result;
use crate::frames::FrameSink;

/// Pixel format tag (e.g., P010, NV12, YUYV).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FourCC(pub [u8; 4]);

impl FourCC {
    /// Create a new `FourCC` from a 4-byte array.
    #[must_use]
    pub const fn new(code: &[u8; 4]) -> Self {
        Self(*code)
    }

    /// 10-bit 4:2:0 bi-planar (Y plane + interleaved CbCr plane), one sample
    /// per little-endian 16-bit word with the value in the high bits.
    pub const P010: Self = Self::new(b"P010");
    /// 8-bit 4:2:0 bi-planar.
    pub const NV12: Self = Self::new(b"NV12");
    /// YUYV pixel format (4:2:2 packed).
    pub const YUYV: Self = Self::new(b"YUYV");
    /// MJPEG pixel format (Motion JPEG).
    pub const MJPG: Self = Self::new(b"MJPG");
}

impl fmt::Display for FourCC {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for byte in self.0 {
            write!(f, "{}", char::from(byte))?;
        }
        Ok(())
    }
}

impl From<v4l::FourCC> for FourCC {
    fn from(fourcc: v4l::FourCC) -> Self {
        Self(fourcc.repr)
    }
}

impl From<FourCC> for v4l::FourCC {
    fn from(fourcc: FourCC) -> Self {
        Self::new(&fourcc.0)
    }
}

/// One entry of a device's supported capture format list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CaptureFormat {
    /// Pixel layout tag.
    pub pixel_format: FourCC,
    /// Frame width in pixels.
    pub width: u32,
    /// Frame height in pixels.
    pub height: u32,
}

impl CaptureFormat {
    /// Create a new capture format.
    #[must_use]
    pub const fn new(pixel_format: FourCC, width: u32, height: u32) -> Self {
        Self {
            pixel_format,
            width,
            height,
        }
    }
}

impl fmt::Display for CaptureFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}x{}", self.pixel_format, self.width, self.height)
    }
}

/// Back-facing camera kinds the accessory can be mounted over.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DeviceKind {
    /// Ultra-wide angle camera.
    #[default]
    UltraWide,
    /// Wide angle (main) camera.
    Wide,
    /// Telephoto camera.
    Telephoto,
}

impl DeviceKind {
    /// Discovery preference: the first available kind becomes active.
    pub const PREFERENCE: [Self; 3] = [Self::UltraWide, Self::Wide, Self::Telephoto];

    /// Name shown in the camera picker.
    pub const fn label(self) -> &'static str {
        match self {
            Self::UltraWide => "Ultra-wide",
            Self::Wide => "Wide",
            Self::Telephoto => "Telephoto",
        }
    }
}

impl fmt::Display for DeviceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

impl FromStr for DeviceKind {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "ultra-wide" | "ultrawide" | "ultra_wide" => Ok(Self::UltraWide),
            "wide" => Ok(Self::Wide),
            "telephoto" | "tele" => Ok(Self::Telephoto),
            other => Err(format!(
                "unknown camera '{other}', expected ultra-wide, wide or telephoto"
            )),
        }
    }
}

/// Device-reported limits for exposure, gain and illumination.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DeviceBounds {
    /// Lowest accepted sensor gain (ISO).
    pub min_gain: f32,
    /// Highest accepted sensor gain (ISO).
    pub max_gain: f32,
    /// Whether a custom exposure duration can be set.
    pub supports_custom_exposure: bool,
    /// Whether the illumination source (torch) can be driven.
    pub supports_illumination: bool,
}

/// Illumination command issued to the device.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Illumination {
    /// Light source off.
    Off,
    /// Light source on at a level in `(0, 1]`.
    On(f32),
}

/// Camera access authorization as reported by the platform.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthorizationStatus {
    /// Access previously granted.
    Authorized,
    /// The operator has not been asked yet.
    NotDetermined,
    /// Access denied or restricted.
    Denied,
}

/// One memory plane of a frame buffer.
#[derive(Debug, Clone)]
pub struct Plane {
    /// Raw plane bytes.
    pub data: Vec<u8>,
    /// Bytes per row (stride), including any padding.
    pub bytes_per_row: usize,
}

/// A captured planar frame. Plane 0 is luma.
#[derive(Debug, Clone)]
pub struct PlanarBuffer {
    /// Frame width in pixels.
    pub width: u32,
    /// Frame height in pixels.
    pub height: u32,
    /// Pixel layout tag reported by the driver.
    pub pixel_format: FourCC,
    /// Memory planes.
    pub planes: Vec<Plane>,
    /// Frame sequence number.
    pub sequence: u64,
    /// Capture timestamp.
    pub timestamp: Duration,
}

impl PlanarBuffer {
    /// The luma plane, if present.
    #[must_use]
    pub fn luma(&self) -> Option<&Plane> {
        self.planes.first()
    }

    /// Read one 16-bit luma sample.
    ///
    /// Returns `None` when the coordinates fall outside the frame or the plane
    /// is too short for them.
    #[must_use]
    pub fn luma_sample(&self, x: u32, y: u32) -> Option<u16> {
        if x >= self.width || y >= self.height {
            return None;
        }
        let plane = self.luma()?;
        let offset = y as usize * plane.bytes_per_row + x as usize * 2;
        let bytes = plane.data.get(offset..offset + 2)?;
        Some(u16::from_le_bytes([*bytes.first()?, *bytes.get(1)?]))
    }
}

/// A camera exposed by the platform driver.
///
/// Configuration calls are only valid between
/// [`lock_for_configuration`](Self::lock_for_configuration) and
/// [`unlock_for_configuration`](Self::unlock_for_configuration); use
/// [`ConfigurationLock`] rather than calling these directly.
pub trait CameraDevice: Send {
    /// The camera kind this device represents.
    fn kind(&self) -> DeviceKind;

    /// Platform identifier (e.g. a device node path).
    fn unique_id(&self) -> &str;

    /// Human-readable device name.
    fn name(&self) -> &str;

    /// Capture formats in driver order.
    fn supported_formats(&self) -> Vec<CaptureFormat>;

    /// Limits for the currently active format.
    fn bounds(&self) -> DeviceBounds;

    /// Acquire exclusive configuration access.
    fn lock_for_configuration(&mut self) -> Result<()>;

    /// Release exclusive configuration access.
    fn unlock_for_configuration(&mut self);

    /// Make `format` the active capture format.
    fn set_active_format(&mut self, format: &CaptureFormat) -> Result<()>;

    /// Switch to manual exposure with the given duration and gain.
    ///
    /// Returns the exposure duration the device actually runs.
    fn set_custom_exposure(&mut self, duration: Duration, gain: f32) -> Result<Duration>;

    /// Drive the illumination source.
    fn set_illumination(&mut self, illumination: Illumination) -> Result<()>;
}

/// Finds back-facing cameras by kind.
pub trait DeviceProvider: Send {
    /// Return the device of the given kind, if the platform has one.
    fn discover(&self, kind: DeviceKind) -> Option<Box<dyn CameraDevice>>;
}

/// The platform capture session that routes an input device to a frame output.
pub trait CaptureSession: Send {
    /// Start batching configuration changes.
    fn begin_configuration(&mut self);

    /// Apply batched configuration changes.
    ///
    /// Fails when a running session cannot resume streaming afterwards.
    fn commit_configuration(&mut self) -> Result<()>;

    /// Attach `device` as the session input.
    fn attach_input(&mut self, device: &dyn CameraDevice) -> Result<()>;

    /// Remove the current input, if any.
    fn detach_input(&mut self);

    /// Attach the frame output; frames are pushed into `sink`.
    fn attach_output(&mut self, sink: FrameSink) -> Result<()>;

    /// Start delivering frames.
    fn start_running(&mut self) -> Result<()>;

    /// Stop delivering frames.
    fn stop_running(&mut self);
}

/// Platform camera permission check.
pub trait Authorizer: Send {
    /// Current authorization status.
    fn status(&self) -> AuthorizationStatus;

    /// Ask the operator for access, blocking until they answer.
    fn request_access(&self) -> bool;
}

/// Scoped exclusive configuration access to a device.
///
/// The device is unlocked when the guard drops, on every exit path.
pub struct ConfigurationLock<'a> {
    device: &'a mut dyn CameraDevice,
}

impl<'a> ConfigurationLock<'a> {
    /// Lock `device` for configuration.
    pub fn acquire(device: &'a mut dyn CameraDevice) -> Result<Self> {
        device.lock_for_configuration()?;
        Ok(Self { device })
    }
}

impl<'a> Deref for ConfigurationLock<'a> {
    type Target = dyn CameraDevice + 'a;

    fn deref(&self) -> &Self::Target {
        &*self.device
    }
}

impl DerefMut for ConfigurationLock<'_> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut *self.device
    }
}

impl Drop for ConfigurationLock<'_> {
    fn drop(&mut self) {
        self.device.unlock_for_configuration();
    }
}

/// Batched session reconfiguration.
///
/// [`commit`](Self::commit) applies the batch and reports the outcome. A
/// transaction dropped without it still commits, and any error is logged.
pub struct SessionTransaction<'a, S: CaptureSession + ?Sized> {
    session: &'a mut S,
    committed: bool,
}

impl<'a, S: CaptureSession + ?Sized> SessionTransaction<'a, S> {
    /// Begin a configuration batch on `session`.
    pub fn begin(session: &'a mut S) -> Self {
        session.begin_configuration();
        Self {
            session,
            committed: false,
        }
    }

    /// Commit the batch.
    pub fn commit(mut self) -> Result<()> {
        self.committed = true;
        self.session.commit_configuration()
    }
}

impl<S: CaptureSession + ?Sized> Deref for SessionTransaction<'_, S> {
    type Target = S;

    fn deref(&self) -> &Self::Target {
        self.session
    }
}

impl<S: CaptureSession + ?Sized> DerefMut for SessionTransaction<'_, S> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.session
    }
}

impl<S: CaptureSession + ?Sized> Drop for SessionTransaction<'_, S> {
    fn drop(&mut self) {
        if self.committed {
            return;
        }
        if let Err(err) = self.session.commit_configuration() {
            warn!(error = %err, "Abandoned session configuration failed to commit");
        }
    }
}
