//! Exposure, gain and illumination control.
//!
//! Operator requests never reach the device directly: [`ExposureController`]
//! validates and clamps them against [`DeviceBounds`], issues them inside one
//! [`ConfigurationLock`], and returns what was actually applied.

use std::fmt;
use std::time::Duration;

use tracing::{debug, warn};

use crate::error::{CaptureError, Result};
use crate::traits::{CameraDevice, ConfigurationLock, DeviceBounds, Illumination};

/// Smallest non-zero illumination level the light source is driven at.
pub const MIN_ILLUMINATION_LEVEL: f32 = 0.01;

const MICROS_PER_SECOND: f64 = 1_000_000.0;

/// Operator-requested capture settings.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CaptureSettings {
    /// Exposure duration in seconds, must be positive.
    pub exposure_seconds: f64,
    /// Sensor gain (ISO).
    pub gain: f32,
    /// Illumination level in `[0, 1]`; zero or below turns the light off.
    pub illumination: f32,
}

impl CaptureSettings {
    /// Build settings from raw operator control positions.
    ///
    /// Controls move in coarse steps: exposure in whole milliseconds, gain in
    /// whole ISO units, illumination in hundredths.
    #[must_use]
    pub fn from_operator(exposure_seconds: f64, gain: f32, illumination: f32) -> Self {
        Self {
            exposure_seconds: (exposure_seconds * 1000.0).round() / 1000.0,
            gain: gain.round(),
            illumination: (illumination * 100.0).round() / 100.0,
        }
    }

    /// Reject requests that cannot be issued to any device.
    ///
    /// Exposure must be a positive finite duration; gain and illumination
    /// must be finite.
    pub fn validate(&self) -> Result<()> {
        quantize_exposure(self.exposure_seconds)?;
        if !self.gain.is_finite() {
            return Err(CaptureError::InvalidSettings(format!(
                "gain must be finite, got {}",
                self.gain
            )));
        }
        if !self.illumination.is_finite() {
            return Err(CaptureError::InvalidSettings(format!(
                "illumination must be finite, got {}",
                self.illumination
            )));
        }
        Ok(())
    }
}

impl Default for CaptureSettings {
    fn default() -> Self {
        Self {
            exposure_seconds: 0.033,
            gain: 100.0,
            illumination: 0.0,
        }
    }
}

/// Settings as issued to the device, after clamping and rounding.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EffectiveSettings {
    /// Exposure duration in force on the device.
    pub exposure: Duration,
    /// Gain within the device's bounds.
    pub gain: f32,
    /// Illumination command, `None` when the device has no light source.
    pub illumination: Option<Illumination>,
}

impl EffectiveSettings {
    /// Operator-facing strings for these settings.
    #[must_use]
    pub fn readout(&self) -> OperatorReadout {
        let level = match self.illumination {
            Some(Illumination::On(level)) => level,
            Some(Illumination::Off) | None => 0.0,
        };
        OperatorReadout {
            exposure: format!("{}ms", self.exposure.as_millis()),
            gain: format!("{}", self.gain.round()),
            illumination: format!("{}%", (level * 100.0).round()),
        }
    }
}

/// Labels shown next to the operator controls.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OperatorReadout {
    /// Exposure label, e.g. `33ms`.
    pub exposure: String,
    /// Gain label, e.g. `400`.
    pub gain: String,
    /// Illumination label, e.g. `50%`.
    pub illumination: String,
}

impl fmt::Display for OperatorReadout {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "exposure {} | ISO {} | torch {}",
            self.exposure, self.gain, self.illumination
        )
    }
}

/// Round an exposure to the nearest microsecond, half away from zero.
///
/// Device exposure ticks are microseconds; rounding once here keeps repeated
/// re-applications of the same request from drifting.
pub fn quantize_exposure(seconds: f64) -> Result<Duration> {
    if !seconds.is_finite() || seconds <= 0.0 {
        return Err(CaptureError::InvalidSettings(format!(
            "exposure must be a positive duration, got {seconds}s"
        )));
    }
    let micros = (seconds * MICROS_PER_SECOND).round().max(1.0);
    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    Ok(Duration::from_micros(micros as u64))
}

/// Clamp `gain` into the device's bounds.
///
/// Inverted bounds resolve to `max_gain`.
pub fn clamp_gain(gain: f32, bounds: &DeviceBounds) -> f32 {
    gain.max(bounds.min_gain).min(bounds.max_gain)
}

/// Illumination command for a requested level, or `None` if the device has no
/// light source.
///
/// `level` must be finite; see [`CaptureSettings::validate`].
pub fn resolve_illumination(level: f32, bounds: &DeviceBounds) -> Option<Illumination> {
    if level <= 0.0 {
        Some(Illumination::Off)
    } else if bounds.supports_illumination {
        Some(Illumination::On(level.clamp(MIN_ILLUMINATION_LEVEL, 1.0)))
    } else {
        None
    }
}

/// Validates, clamps and applies capture settings.
#[derive(Debug, Default)]
pub struct ExposureController;

impl ExposureController {
    /// Create a controller.
    pub const fn new() -> Self {
        Self
    }

    /// Resolve `requested` against `bounds` without touching a device.
    pub fn resolve(
        &self,
        requested: &CaptureSettings,
        bounds: &DeviceBounds,
    ) -> Result<EffectiveSettings> {
        if !bounds.supports_custom_exposure {
            return Err(CaptureError::UnsupportedExposureMode);
        }
        requested.validate()?;
        Ok(EffectiveSettings {
            exposure: quantize_exposure(requested.exposure_seconds)?,
            gain: clamp_gain(requested.gain, bounds),
            illumination: resolve_illumination(requested.illumination, bounds),
        })
    }

    /// Apply `requested` to `device` in a single configuration transaction.
    ///
    /// The returned exposure is the one the device reports running, which
    /// may be coarser than a microsecond.
    ///
    /// `UnsupportedExposureMode` is fatal for the caller. Anything that fails
    /// inside the transaction is reported as `ConfigurationFailed` and leaves
    /// the previously applied settings in force.
    pub fn apply(
        &self,
        device: &mut dyn CameraDevice,
        requested: &CaptureSettings,
        bounds: &DeviceBounds,
    ) -> Result<EffectiveSettings> {
        let effective = self.resolve(requested, bounds)?;

        let mut lock = ConfigurationLock::acquire(device).map_err(into_configuration_failed)?;
        let exposure = lock
            .set_custom_exposure(effective.exposure, effective.gain)
            .map_err(into_configuration_failed)?;
        match effective.illumination {
            Some(illumination) => lock
                .set_illumination(illumination)
                .map_err(into_configuration_failed)?,
            None => debug!(
                level = requested.illumination,
                "Illumination requested but not supported, skipping"
            ),
        }
        drop(lock);

        if exposure != effective.exposure {
            debug!(
                requested_us = effective.exposure.as_micros(),
                applied_us = exposure.as_micros(),
                "Device quantized exposure"
            );
        }
        let effective = EffectiveSettings {
            exposure,
            ..effective
        };
        debug!(
            exposure_us = effective.exposure.as_micros(),
            gain = effective.gain,
            illumination = ?effective.illumination,
            "Applied capture settings"
        );
        Ok(effective)
    }
}

fn into_configuration_failed(err: CaptureError) -> CaptureError {
    match err {
        CaptureError::ConfigurationFailed(_) => err,
        other => {
            warn!(error = %other, "Device configuration transaction failed");
            CaptureError::ConfigurationFailed(other.to_string())
        }
    }
}
