//! Mock collaborators for testing without hardware.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use crate::error::{CaptureError, Result};
use crate::frames::FrameSink;
use crate::traits::{
    AuthorizationStatus, Authorizer, CameraDevice, CaptureFormat, CaptureSession, DeviceBounds,
    DeviceKind, DeviceProvider, FourCC, Illumination, PlanarBuffer, Plane,
};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// A call made on a [`MockDevice`].
#[derive(Debug, Clone, PartialEq)]
pub enum DeviceCall {
    /// Configuration lock acquired.
    Lock,
    /// Configuration lock released.
    Unlock,
    /// Active format set.
    Format(CaptureFormat),
    /// Custom exposure set.
    Exposure(Duration, f32),
    /// Illumination set.
    Illumination(Illumination),
}

/// Mock camera device that records every call.
pub struct MockDevice {
    kind: DeviceKind,
    id: String,
    formats: Vec<CaptureFormat>,
    bounds: DeviceBounds,
    fail_lock: bool,
    fail_exposure: bool,
    exposure_step: Option<Duration>,
    locked: bool,
    calls: Arc<Mutex<Vec<DeviceCall>>>,
}

impl MockDevice {
    /// Create a mock device offering NV12 and P010 at 1920x1080.
    #[must_use]
    pub fn new(kind: DeviceKind) -> Self {
        Self {
            kind,
            id: format!("mock:{kind}"),
            formats: vec![
                CaptureFormat::new(FourCC::NV12, 1920, 1080),
                CaptureFormat::new(FourCC::P010, 1920, 1080),
            ],
            bounds: DeviceBounds {
                min_gain: 50.0,
                max_gain: 800.0,
                supports_custom_exposure: true,
                supports_illumination: true,
            },
            fail_lock: false,
            fail_exposure: false,
            exposure_step: None,
            locked: false,
            calls: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Replace the supported format list.
    #[must_use]
    pub fn with_formats(mut self, formats: Vec<CaptureFormat>) -> Self {
        self.formats = formats;
        self
    }

    /// Set the reported gain bounds.
    #[must_use]
    pub const fn with_gain_bounds(mut self, min_gain: f32, max_gain: f32) -> Self {
        self.bounds.min_gain = min_gain;
        self.bounds.max_gain = max_gain;
        self
    }

    /// Toggle custom exposure support.
    #[must_use]
    pub const fn with_custom_exposure(mut self, supported: bool) -> Self {
        self.bounds.supports_custom_exposure = supported;
        self
    }

    /// Toggle illumination support.
    #[must_use]
    pub const fn with_illumination(mut self, supported: bool) -> Self {
        self.bounds.supports_illumination = supported;
        self
    }

    /// Make `lock_for_configuration` fail.
    #[must_use]
    pub const fn with_failing_lock(mut self, fail: bool) -> Self {
        self.fail_lock = fail;
        self
    }

    /// Make `set_custom_exposure` fail.
    #[must_use]
    pub const fn with_failing_exposure(mut self, fail: bool) -> Self {
        self.fail_exposure = fail;
        self
    }

    /// Round applied exposures up to a multiple of `step`, as drivers with
    /// coarse exposure units do.
    #[must_use]
    pub const fn with_exposure_step(mut self, step: Duration) -> Self {
        self.exposure_step = Some(step);
        self
    }

    /// Calls recorded so far.
    pub fn calls(&self) -> Vec<DeviceCall> {
        lock(&self.calls).clone()
    }

    /// Shared handle to the call log, usable after the device is moved.
    pub fn call_log(&self) -> Arc<Mutex<Vec<DeviceCall>>> {
        Arc::clone(&self.calls)
    }

    /// Whether the configuration lock is currently held.
    pub const fn is_locked(&self) -> bool {
        self.locked
    }

    fn record(&self, call: DeviceCall) {
        lock(&self.calls).push(call);
    }

    fn require_lock(&self) -> Result<()> {
        if self.locked {
            Ok(())
        } else {
            Err(CaptureError::ConfigurationFailed(
                "device not locked for configuration".to_owned(),
            ))
        }
    }
}

impl CameraDevice for MockDevice {
    fn kind(&self) -> DeviceKind {
        self.kind
    }

    fn unique_id(&self) -> &str {
        &self.id
    }

    fn name(&self) -> &str {
        self.kind.label()
    }

    fn supported_formats(&self) -> Vec<CaptureFormat> {
        self.formats.clone()
    }

    fn bounds(&self) -> DeviceBounds {
        self.bounds
    }

    fn lock_for_configuration(&mut self) -> Result<()> {
        if self.fail_lock {
            return Err(CaptureError::Driver("device busy".to_owned()));
        }
        self.locked = true;
        self.record(DeviceCall::Lock);
        Ok(())
    }

    fn unlock_for_configuration(&mut self) {
        self.locked = false;
        self.record(DeviceCall::Unlock);
    }

    fn set_active_format(&mut self, format: &CaptureFormat) -> Result<()> {
        self.require_lock()?;
        self.record(DeviceCall::Format(format.clone()));
        Ok(())
    }

    fn set_custom_exposure(&mut self, duration: Duration, gain: f32) -> Result<Duration> {
        self.require_lock()?;
        if self.fail_exposure {
            return Err(CaptureError::Driver("exposure rejected".to_owned()));
        }
        self.record(DeviceCall::Exposure(duration, gain));
        let applied = match self.exposure_step {
            Some(step) if !step.is_zero() => {
                let steps = duration.as_nanos().div_ceil(step.as_nanos());
                step * u32::try_from(steps).unwrap_or(u32::MAX)
            }
            _ => duration,
        };
        Ok(applied)
    }

    fn set_illumination(&mut self, illumination: Illumination) -> Result<()> {
        self.require_lock()?;
        self.record(DeviceCall::Illumination(illumination));
        Ok(())
    }
}

/// Mock provider handing out pre-built devices.
#[derive(Default)]
pub struct MockProvider {
    devices: Mutex<HashMap<DeviceKind, MockDevice>>,
}

impl MockProvider {
    /// Provider with no devices.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a device; its kind decides which discovery returns it.
    #[must_use]
    pub fn with_device(self, device: MockDevice) -> Self {
        lock(&self.devices).insert(device.kind, device);
        self
    }
}

impl DeviceProvider for MockProvider {
    fn discover(&self, kind: DeviceKind) -> Option<Box<dyn CameraDevice>> {
        lock(&self.devices)
            .remove(&kind)
            .map(|device| Box::new(device) as Box<dyn CameraDevice>)
    }
}

/// A call made on a [`MockSession`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionCall {
    /// Configuration batch opened.
    Begin,
    /// Configuration batch committed.
    Commit,
    /// Input attached, by device id.
    AttachInput(String),
    /// Input removed.
    DetachInput,
    /// Frame output attached.
    AttachOutput,
    /// Session started.
    Start,
    /// Session stopped.
    Stop,
}

#[derive(Default)]
struct SessionShared {
    calls: Vec<SessionCall>,
    sink: Option<FrameSink>,
    failing_inputs: HashSet<String>,
    fail_output: bool,
    fail_commit: bool,
}

/// Mock capture session. Clones share state, so a test can keep a handle
/// after moving one into the session manager.
#[derive(Clone, Default)]
pub struct MockSession {
    shared: Arc<Mutex<SessionShared>>,
}

impl MockSession {
    /// Session accepting every input and output.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Refuse to attach the device with the given id.
    #[must_use]
    pub fn with_failing_input(self, device_id: &str) -> Self {
        lock(&self.shared).failing_inputs.insert(device_id.to_owned());
        self
    }

    /// Refuse to attach the frame output.
    #[must_use]
    pub fn with_failing_output(self) -> Self {
        lock(&self.shared).fail_output = true;
        self
    }

    /// Make every later commit report that streaming could not resume.
    pub fn fail_commits(&self, fail: bool) {
        lock(&self.shared).fail_commit = fail;
    }

    /// Calls recorded so far.
    pub fn calls(&self) -> Vec<SessionCall> {
        lock(&self.shared).calls.clone()
    }

    /// Push a frame into the attached output, as the driver would.
    pub fn deliver(&self, frame: PlanarBuffer) -> bool {
        let sink = lock(&self.shared).sink.clone();
        sink.is_some_and(|sink| sink.deliver(frame))
    }

    /// End the stream with an error, as a failing driver would. Returns
    /// `false` when no output is attached.
    pub fn fail_stream(&self, message: &str) -> bool {
        let Some(sink) = lock(&self.shared).sink.clone() else {
            return false;
        };
        sink.fail(message);
        true
    }

    fn record(&self, call: SessionCall) {
        lock(&self.shared).calls.push(call);
    }
}

impl CaptureSession for MockSession {
    fn begin_configuration(&mut self) {
        self.record(SessionCall::Begin);
    }

    fn commit_configuration(&mut self) -> Result<()> {
        self.record(SessionCall::Commit);
        if lock(&self.shared).fail_commit {
            return Err(CaptureError::Driver("stream did not resume".to_owned()));
        }
        Ok(())
    }

    fn attach_input(&mut self, device: &dyn CameraDevice) -> Result<()> {
        let id = device.unique_id().to_owned();
        if lock(&self.shared).failing_inputs.contains(&id) {
            return Err(CaptureError::Driver(format!("cannot add input {id}")));
        }
        self.record(SessionCall::AttachInput(id));
        Ok(())
    }

    fn detach_input(&mut self) {
        self.record(SessionCall::DetachInput);
    }

    fn attach_output(&mut self, sink: FrameSink) -> Result<()> {
        let mut shared = lock(&self.shared);
        if shared.fail_output {
            return Err(CaptureError::Driver("cannot add output".to_owned()));
        }
        shared.sink = Some(sink);
        shared.calls.push(SessionCall::AttachOutput);
        Ok(())
    }

    fn start_running(&mut self) -> Result<()> {
        self.record(SessionCall::Start);
        Ok(())
    }

    fn stop_running(&mut self) {
        self.record(SessionCall::Stop);
    }
}

/// Mock authorizer with a fixed status and prompt answer.
pub struct MockAuthorizer {
    status: AuthorizationStatus,
    grant: bool,
}

impl MockAuthorizer {
    /// Access already granted.
    #[must_use]
    pub const fn authorized() -> Self {
        Self {
            status: AuthorizationStatus::Authorized,
            grant: true,
        }
    }

    /// Access denied.
    #[must_use]
    pub const fn denied() -> Self {
        Self {
            status: AuthorizationStatus::Denied,
            grant: false,
        }
    }

    /// Not asked yet; the prompt answers `grant`.
    #[must_use]
    pub const fn prompt(grant: bool) -> Self {
        Self {
            status: AuthorizationStatus::NotDetermined,
            grant,
        }
    }
}

impl Authorizer for MockAuthorizer {
    fn status(&self) -> AuthorizationStatus {
        self.status
    }

    fn request_access(&self) -> bool {
        self.grant
    }
}

/// Luma test patterns for generated frames.
#[derive(Debug, Clone, Copy)]
pub enum TestPattern {
    /// Every sample has the same value.
    Solid(u16),
    /// Alternating samples in both directions.
    Checkerboard(u16, u16),
    /// First value inside the centred sampling square, second outside.
    CenterSquare(u16, u16),
}

/// Generate a P010 frame: a luma plane from `pattern` and a neutral chroma
/// plane.
pub fn generate_frame(width: u32, height: u32, pattern: TestPattern) -> PlanarBuffer {
    let bytes_per_row = width as usize * 2;
    let mut luma = Vec::with_capacity(bytes_per_row * height as usize);
    for y in 0..height {
        for x in 0..width {
            let value = match pattern {
                TestPattern::Solid(value) => value,
                TestPattern::Checkerboard(a, b) => {
                    if (x + y) % 2 == 0 {
                        a
                    } else {
                        b
                    }
                }
                TestPattern::CenterSquare(inside, outside) => {
                    let center_x = i64::from(width / 2) - 1;
                    let center_y = i64::from(height / 2) - 1;
                    let dx = i64::from(x) - center_x;
                    let dy = i64::from(y) - center_y;
                    if (-100..100).contains(&dx) && (-100..100).contains(&dy) {
                        inside
                    } else {
                        outside
                    }
                }
            };
            luma.extend_from_slice(&value.to_le_bytes());
        }
    }

    // 10-bit mid-grey in the high bits
    let neutral = (512u16 << 6).to_le_bytes();
    let chroma_len = bytes_per_row * (height as usize / 2);
    let chroma = neutral.iter().copied().cycle().take(chroma_len).collect();

    PlanarBuffer {
        width,
        height,
        pixel_format: FourCC::P010,
        planes: vec![
            Plane {
                data: luma,
                bytes_per_row,
            },
            Plane {
                data: chroma,
                bytes_per_row,
            },
        ],
        sequence: 0,
        timestamp: Duration::ZERO,
    }
}

impl PlanarBuffer {
    /// Re-tag the frame with another pixel format.
    #[must_use]
    pub fn with_format(mut self, pixel_format: FourCC) -> Self {
        self.pixel_format = pixel_format;
        self
    }

    /// Append `padding` bytes of `fill` to every row of every plane.
    #[must_use]
    pub fn with_row_padding(mut self, padding: usize, fill: u8) -> Self {
        for plane in &mut self.planes {
            let stride = plane.bytes_per_row;
            let rows = plane.data.len() / stride.max(1);
            let mut padded = Vec::with_capacity(rows * (stride + padding));
            for row in plane.data.chunks(stride.max(1)) {
                padded.extend_from_slice(row);
                padded.resize(padded.len() + padding, fill);
            }
            plane.data = padded;
            plane.bytes_per_row = stride + padding;
        }
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generated_frame_layout() {
        let frame = generate_frame(64, 32, TestPattern::Solid(0x0300));
        assert_eq!(frame.planes.len(), 2);
        assert_eq!(frame.planes[0].data.len(), 64 * 32 * 2);
        assert_eq!(frame.planes[1].data.len(), 64 * 16 * 2);
        assert_eq!(frame.luma_sample(5, 5), Some(0x0300));
    }

    #[test]
    fn test_checkerboard_pattern() {
        let frame = generate_frame(8, 8, TestPattern::Checkerboard(1, 2));
        assert_eq!(frame.luma_sample(0, 0), Some(1));
        assert_eq!(frame.luma_sample(1, 0), Some(2));
        assert_eq!(frame.luma_sample(1, 1), Some(1));
    }

    #[test]
    fn test_row_padding_keeps_samples() {
        let frame =
            generate_frame(16, 4, TestPattern::Checkerboard(7, 9)).with_row_padding(8, 0xAA);
        assert_eq!(frame.planes[0].bytes_per_row, 40);
        assert_eq!(frame.planes[0].data.len(), 40 * 4);
        assert_eq!(frame.luma_sample(15, 3), Some(7));
    }

    #[test]
    fn test_mock_device_requires_lock() {
        let mut device = MockDevice::new(DeviceKind::Wide);
        assert!(device.set_illumination(Illumination::Off).is_err());
        device.lock_for_configuration().expect("lock failed");
        assert!(device.set_illumination(Illumination::Off).is_ok());
        device.unlock_for_configuration();
        assert!(!device.is_locked());
    }

    #[test]
    fn test_mock_provider_discovery() {
        let provider = MockProvider::new().with_device(MockDevice::new(DeviceKind::Telephoto));
        assert!(provider.discover(DeviceKind::Wide).is_none());
        let device = provider
            .discover(DeviceKind::Telephoto)
            .expect("telephoto registered");
        assert_eq!(device.kind(), DeviceKind::Telephoto);
    }
}
