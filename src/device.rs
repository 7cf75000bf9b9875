//! V4L2 implementation of the collaborator traits using the v4l crate.

use std::fs::OpenOptions;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use tracing::{debug, error, info, trace, warn};
use v4l::buffer::Type;
use v4l::control::{Control, Description, Value};
use v4l::framesize::FrameSizeEnum;
use v4l::io::mmap::Stream;
use v4l::io::traits::CaptureStream as V4lCaptureStream;
use v4l::video::Capture;
use v4l::Device;

use crate::config::DeviceMap;
use crate::error::{CaptureError, Result};
use crate::format::REQUIRED_PIXEL_FORMAT;
use crate::frames::FrameSink;
use crate::traits::{
    AuthorizationStatus, Authorizer, CameraDevice, CaptureFormat, CaptureSession, DeviceBounds,
    DeviceKind, DeviceProvider, FourCC, Illumination, PlanarBuffer, Plane,
};
use crate::validation::{sequence_gap, validate_planar_layout};

const CAMERA_CLASS_BASE: u32 = 0x009a_0900;
const USER_CLASS_BASE: u32 = 0x0098_0900;
const IMAGE_SOURCE_CLASS_BASE: u32 = 0x009e_0900;
const FLASH_CLASS_BASE: u32 = 0x009c_0900;

const CID_EXPOSURE_AUTO: u32 = CAMERA_CLASS_BASE + 1;
const CID_EXPOSURE_ABSOLUTE: u32 = CAMERA_CLASS_BASE + 2;
const CID_ISO_SENSITIVITY: u32 = CAMERA_CLASS_BASE + 23;
const CID_GAIN: u32 = USER_CLASS_BASE + 19;
const CID_ANALOGUE_GAIN: u32 = IMAGE_SOURCE_CLASS_BASE + 3;
const CID_FLASH_LED_MODE: u32 = FLASH_CLASS_BASE + 1;
const CID_FLASH_TORCH_INTENSITY: u32 = FLASH_CLASS_BASE + 8;

const EXPOSURE_MANUAL: i64 = 1;
const FLASH_LED_MODE_NONE: i64 = 0;
const FLASH_LED_MODE_TORCH: i64 = 2;

/// `EXPOSURE_ABSOLUTE` counts in 100 µs units.
const EXPOSURE_UNIT_MICROS: u64 = 100;

/// Gain-like controls in order of preference.
const GAIN_CONTROLS: [u32; 3] = [CID_ISO_SENSITIVITY, CID_GAIN, CID_ANALOGUE_GAIN];

const DEFAULT_BUFFER_COUNT: u32 = 4;

/// Longest a capture thread blocks waiting for a buffer before it rechecks
/// its stop flag.
const CAPTURE_POLL_TIMEOUT: Duration = Duration::from_millis(500);

fn driver_error(err: impl std::fmt::Display) -> CaptureError {
    CaptureError::Driver(err.to_string())
}

/// Node path for a V4L2 device index.
pub fn node_path(index: usize) -> PathBuf {
    PathBuf::from(format!("/dev/video{index}"))
}

/// V4L2 camera bound to one [`DeviceKind`].
pub struct V4L2Device {
    device: Device,
    id: String,
    name: String,
    kind: DeviceKind,
    locked: bool,
    controls: Vec<Description>,
}

impl V4L2Device {
    /// Open `/dev/video{index}` as the camera of `kind`.
    pub fn open(kind: DeviceKind, index: usize) -> Result<Self> {
        let device = Device::new(index).map_err(driver_error)?;
        let caps = device.query_caps().map_err(driver_error)?;
        if !caps
            .capabilities
            .contains(v4l::capability::Flags::VIDEO_CAPTURE)
        {
            return Err(CaptureError::Driver(format!(
                "{} cannot capture video",
                caps.card
            )));
        }

        let controls = device.query_controls().unwrap_or_else(|err| {
            warn!(index, error = %err, "Could not query device controls");
            Vec::new()
        });
        debug!(index, card = %caps.card, controls = controls.len(), "Opened V4L2 device");

        Ok(Self {
            device,
            id: node_path(index).display().to_string(),
            name: caps.card,
            kind,
            locked: false,
            controls,
        })
    }

    fn control(&self, id: u32) -> Option<&Description> {
        self.controls.iter().find(|control| control.id == id)
    }

    fn gain_control(&self) -> Option<&Description> {
        GAIN_CONTROLS.iter().find_map(|&id| self.control(id))
    }

    fn require_lock(&self) -> Result<()> {
        if self.locked {
            Ok(())
        } else {
            Err(CaptureError::ConfigurationFailed(format!(
                "{} is not locked for configuration",
                self.name
            )))
        }
    }

    fn write_control(&self, id: u32, value: i64) -> Result<()> {
        self.device
            .set_control(Control {
                id,
                value: Value::Integer(value),
            })
            .map_err(|err| CaptureError::Driver(format!("control {id:#x}: {err}")))
    }
}

impl CameraDevice for V4L2Device {
    fn kind(&self) -> DeviceKind {
        self.kind
    }

    fn unique_id(&self) -> &str {
        &self.id
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn supported_formats(&self) -> Vec<CaptureFormat> {
        let descriptions = match self.device.enum_formats() {
            Ok(descriptions) => descriptions,
            Err(err) => {
                warn!(device = %self.name, error = %err, "Could not enumerate formats");
                return Vec::new();
            }
        };

        let mut formats = Vec::new();
        for description in descriptions {
            let sizes = self
                .device
                .enum_framesizes(description.fourcc)
                .unwrap_or_default();
            for size in sizes {
                let (width, height) = match size.size {
                    FrameSizeEnum::Discrete(discrete) => (discrete.width, discrete.height),
                    FrameSizeEnum::Stepwise(stepwise) => (stepwise.max_width, stepwise.max_height),
                };
                formats.push(CaptureFormat::new(
                    FourCC::from(description.fourcc),
                    width,
                    height,
                ));
            }
        }
        formats
    }

    fn bounds(&self) -> DeviceBounds {
        #[allow(clippy::cast_precision_loss)]
        let (min_gain, max_gain) = self
            .gain_control()
            .map_or((1.0, 1.0), |control| {
                (control.minimum as f32, control.maximum as f32)
            });
        DeviceBounds {
            min_gain,
            max_gain,
            supports_custom_exposure: self.control(CID_EXPOSURE_ABSOLUTE).is_some(),
            supports_illumination: self.control(CID_FLASH_LED_MODE).is_some(),
        }
    }

    fn lock_for_configuration(&mut self) -> Result<()> {
        if self.locked {
            return Err(CaptureError::ConfigurationFailed(format!(
                "{} is already locked",
                self.name
            )));
        }
        self.locked = true;
        Ok(())
    }

    fn unlock_for_configuration(&mut self) {
        self.locked = false;
    }

    fn set_active_format(&mut self, format: &CaptureFormat) -> Result<()> {
        self.require_lock()?;
        let mut fmt = self.device.format().map_err(driver_error)?;
        fmt.width = format.width;
        fmt.height = format.height;
        fmt.fourcc = format.pixel_format.into();

        let actual = self.device.set_format(&fmt).map_err(driver_error)?;
        let actual_fourcc = FourCC::from(actual.fourcc);
        if actual_fourcc != format.pixel_format {
            return Err(CaptureError::ConfigurationFailed(format!(
                "driver negotiated {actual_fourcc} instead of {}",
                format.pixel_format
            )));
        }
        info!(
            device = %self.name,
            width = actual.width,
            height = actual.height,
            stride = actual.stride,
            "Active format set"
        );
        Ok(())
    }

    fn set_custom_exposure(&mut self, duration: Duration, gain: f32) -> Result<Duration> {
        self.require_lock()?;
        let exposure = self
            .control(CID_EXPOSURE_ABSOLUTE)
            .ok_or(CaptureError::UnsupportedExposureMode)?;
        let units = exposure_units(duration).clamp(exposure.minimum, exposure.maximum);

        if self.control(CID_EXPOSURE_AUTO).is_some() {
            self.write_control(CID_EXPOSURE_AUTO, EXPOSURE_MANUAL)?;
        }
        self.write_control(CID_EXPOSURE_ABSOLUTE, units)?;

        if let Some(control) = self.gain_control() {
            #[allow(clippy::cast_possible_truncation)]
            let value = (gain.round() as i64).clamp(control.minimum, control.maximum);
            self.write_control(control.id, value)?;
        }
        Ok(exposure_duration(units))
    }

    fn set_illumination(&mut self, illumination: Illumination) -> Result<()> {
        self.require_lock()?;
        match illumination {
            Illumination::Off => self.write_control(CID_FLASH_LED_MODE, FLASH_LED_MODE_NONE),
            Illumination::On(level) => {
                if let Some(intensity) = self.control(CID_FLASH_TORCH_INTENSITY) {
                    let value = torch_intensity(level, intensity.minimum, intensity.maximum);
                    self.write_control(CID_FLASH_TORCH_INTENSITY, value)?;
                }
                self.write_control(CID_FLASH_LED_MODE, FLASH_LED_MODE_TORCH)
            }
        }
    }
}

/// Exposure in `EXPOSURE_ABSOLUTE` units, at least one.
fn exposure_units(duration: Duration) -> i64 {
    let units = duration
        .as_micros()
        .div_ceil(u128::from(EXPOSURE_UNIT_MICROS))
        .max(1);
    i64::try_from(units).unwrap_or(i64::MAX)
}

/// Duration of `units` `EXPOSURE_ABSOLUTE` steps.
fn exposure_duration(units: i64) -> Duration {
    let units = u64::try_from(units.max(0)).unwrap_or_default();
    Duration::from_micros(units.saturating_mul(EXPOSURE_UNIT_MICROS))
}

/// Map a `[0, 1]` illumination level onto a torch intensity control range.
fn torch_intensity(level: f32, minimum: i64, maximum: i64) -> i64 {
    #[allow(clippy::cast_precision_loss)]
    let span = (maximum - minimum) as f64;
    #[allow(clippy::cast_possible_truncation)]
    let offset = (f64::from(level.clamp(0.0, 1.0)) * span).round() as i64;
    minimum + offset
}

/// Discovers cameras from the configured device indices.
pub struct V4L2Provider {
    devices: DeviceMap,
}

impl V4L2Provider {
    /// Provider over the given index map.
    pub const fn new(devices: DeviceMap) -> Self {
        Self { devices }
    }
}

impl DeviceProvider for V4L2Provider {
    fn discover(&self, kind: DeviceKind) -> Option<Box<dyn CameraDevice>> {
        let index = self.devices.index(kind)?;
        match V4L2Device::open(kind, index) {
            Ok(device) => Some(Box::new(device)),
            Err(err) => {
                warn!(kind = %kind, index, error = %err, "Configured camera could not be opened");
                None
            }
        }
    }
}

/// Summary of a video node for `list-devices`.
#[derive(Debug, Clone)]
pub struct DeviceSummary {
    /// Device index.
    pub index: usize,
    /// Node path.
    pub path: PathBuf,
    /// Card name.
    pub name: String,
    /// Whether the node offers the required pixel format.
    pub supports_required_format: bool,
}

/// Enumerate every video node on the system.
pub fn list_devices() -> Vec<DeviceSummary> {
    v4l::context::enum_devices()
        .into_iter()
        .map(|node| {
            let index = node.index();
            let supports_required_format = Device::new(index)
                .and_then(|device| device.enum_formats())
                .map(|formats| {
                    formats
                        .iter()
                        .any(|format| FourCC::from(format.fourcc) == REQUIRED_PIXEL_FORMAT)
                })
                .unwrap_or(false);
            DeviceSummary {
                index,
                path: node.path().to_path_buf(),
                name: node.name().unwrap_or_else(|| "unknown".to_owned()),
                supports_required_format,
            }
        })
        .collect()
}

/// Capture session streaming one V4L2 node into a [`FrameSink`].
///
/// Attaching an input only records its node path; streaming (re)starts when
/// the session is running and a configuration batch is committed. A stream
/// that dies while running closes the sink with [`FrameSink::fail`].
pub struct V4L2Session {
    input: Option<PathBuf>,
    sink: Option<FrameSink>,
    running: bool,
    buffer_count: u32,
    capture: Option<CaptureThread>,
}

impl Default for V4L2Session {
    fn default() -> Self {
        Self::new()
    }
}

impl V4L2Session {
    /// Idle session with the default buffer count.
    pub const fn new() -> Self {
        Self {
            input: None,
            sink: None,
            running: false,
            buffer_count: DEFAULT_BUFFER_COUNT,
            capture: None,
        }
    }

    fn ensure_streaming(&mut self) -> Result<()> {
        if self.capture.is_some() {
            return Ok(());
        }
        let (Some(input), Some(sink)) = (&self.input, &self.sink) else {
            return Err(CaptureError::Driver(
                "session has no input or output attached".to_owned(),
            ));
        };
        self.capture = Some(CaptureThread::spawn(
            input.clone(),
            sink.clone(),
            self.buffer_count,
        )?);
        Ok(())
    }

    fn stop_streaming(&mut self) {
        if let Some(capture) = self.capture.take() {
            capture.stop();
        }
    }
}

impl CaptureSession for V4L2Session {
    fn begin_configuration(&mut self) {
        debug!("Begin session configuration");
    }

    fn commit_configuration(&mut self) -> Result<()> {
        if self.running {
            self.ensure_streaming()?;
        }
        debug!("Committed session configuration");
        Ok(())
    }

    fn attach_input(&mut self, device: &dyn CameraDevice) -> Result<()> {
        let path = PathBuf::from(device.unique_id());
        if !path.exists() {
            return Err(CaptureError::Driver(format!(
                "{} does not exist",
                path.display()
            )));
        }
        self.stop_streaming();
        info!(device = %device.name(), path = %path.display(), "Input attached");
        self.input = Some(path);
        Ok(())
    }

    fn detach_input(&mut self) {
        self.stop_streaming();
        self.input = None;
    }

    fn attach_output(&mut self, sink: FrameSink) -> Result<()> {
        self.sink = Some(sink);
        Ok(())
    }

    fn start_running(&mut self) -> Result<()> {
        self.ensure_streaming()?;
        self.running = true;
        Ok(())
    }

    fn stop_running(&mut self) {
        self.running = false;
        self.stop_streaming();
    }
}

impl Drop for V4L2Session {
    fn drop(&mut self) {
        self.stop_streaming();
    }
}

struct CaptureThread {
    stop: Arc<AtomicBool>,
    handle: JoinHandle<()>,
}

impl CaptureThread {
    fn spawn(path: PathBuf, sink: FrameSink, buffer_count: u32) -> Result<Self> {
        let stop = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&stop);
        let handle = thread::Builder::new()
            .name("v4l2-capture".to_owned())
            .spawn(move || match run_capture(&path, &sink, buffer_count, &flag) {
                Ok(()) => debug!(path = %path.display(), "Capture stream stopped"),
                Err(err) if flag.load(Ordering::Relaxed) => {
                    debug!(path = %path.display(), error = %err, "Capture stream ended on stop");
                }
                Err(err) => {
                    error!(path = %path.display(), error = %err, "Capture stream failed");
                    sink.fail(err.to_string());
                }
            })?;
        Ok(Self { stop, handle })
    }

    fn stop(self) {
        self.stop.store(true, Ordering::Relaxed);
        if self.handle.join().is_err() {
            error!("Capture thread panicked");
        }
    }
}

fn run_capture(path: &Path, sink: &FrameSink, buffer_count: u32, stop: &AtomicBool) -> Result<()> {
    let device = Device::with_path(path).map_err(driver_error)?;
    let format = device.format().map_err(driver_error)?;
    let pixel_format = FourCC::from(format.fourcc);
    let stride = format.stride as usize;
    let mut stream =
        Stream::with_buffers(&device, Type::VideoCapture, buffer_count).map_err(driver_error)?;
    stream.set_timeout(CAPTURE_POLL_TIMEOUT);
    info!(
        path = %path.display(),
        format = %pixel_format,
        width = format.width,
        height = format.height,
        "Streaming started"
    );

    let mut previous: Option<u64> = None;
    while !stop.load(Ordering::Relaxed) {
        let (buf, meta) = match stream.next() {
            Ok(next) => next,
            Err(err) if err.kind() == ErrorKind::TimedOut => {
                trace!(path = %path.display(), "No frame within poll timeout");
                continue;
            }
            Err(err) => return Err(driver_error(err)),
        };
        let sequence = u64::from(meta.sequence);
        if let Some(missed) = previous.and_then(|prev| sequence_gap(prev, sequence)) {
            if missed > 0 {
                debug!(sequence, missed, "Driver skipped frames");
            }
        }
        previous = Some(sequence);

        // V4L2 timestamps are non-negative in practice
        #[allow(clippy::cast_sign_loss)]
        let secs = meta.timestamp.sec.max(0) as u64;
        #[allow(clippy::cast_sign_loss, clippy::cast_possible_truncation)]
        let nanos = (meta.timestamp.usec.max(0) as u32).saturating_mul(1000);
        let used = buf.get(..meta.bytesused as usize).unwrap_or(buf);

        let frame = PlanarBuffer {
            width: format.width,
            height: format.height,
            pixel_format,
            planes: split_planes(used, stride, format.height),
            sequence,
            timestamp: Duration::new(secs, nanos),
        };

        if pixel_format == REQUIRED_PIXEL_FORMAT {
            if let Err(err) = validate_planar_layout(&frame) {
                warn!(sequence = frame.sequence, error = %err, "Dropping malformed frame");
                continue;
            }
        }
        if !sink.deliver(frame) {
            debug!("Frame output closed");
            break;
        }
    }
    Ok(())
}

/// Split a contiguous bi-planar buffer into its luma and chroma planes.
fn split_planes(data: &[u8], stride: usize, height: u32) -> Vec<Plane> {
    let luma_len = (stride * height as usize).min(data.len());
    let (luma, chroma) = data.split_at(luma_len);
    vec![
        Plane {
            data: luma.to_vec(),
            bytes_per_row: stride,
        },
        Plane {
            data: chroma.to_vec(),
            bytes_per_row: stride,
        },
    ]
}

/// Authorizer that checks read/write access to the configured device nodes.
///
/// V4L2 has no interactive permission prompt, so the status is never
/// `NotDetermined`.
pub struct DevicePermissions {
    paths: Vec<PathBuf>,
}

impl DevicePermissions {
    /// Check the nodes named in `devices`.
    pub fn for_devices(devices: &DeviceMap) -> Self {
        Self {
            paths: devices
                .entries()
                .map(|(_, index)| node_path(index))
                .collect(),
        }
    }
}

impl Authorizer for DevicePermissions {
    fn status(&self) -> AuthorizationStatus {
        for path in &self.paths {
            match OpenOptions::new().read(true).write(true).open(path) {
                Ok(_) => return AuthorizationStatus::Authorized,
                Err(err) if err.kind() == ErrorKind::PermissionDenied => {
                    warn!(path = %path.display(), "No permission to open video device");
                    return AuthorizationStatus::Denied;
                }
                Err(err) => debug!(path = %path.display(), error = %err, "Video device not usable"),
            }
        }
        // Nothing to probe: discovery reports the missing camera instead.
        AuthorizationStatus::Authorized
    }

    fn request_access(&self) -> bool {
        self.status() == AuthorizationStatus::Authorized
    }
}
