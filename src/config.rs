//! Configuration file handling.
//!
//! Loads `~/.config/cf-cam/config.toml` (or the path given with `--config`).
//! A missing file yields the defaults; a malformed one is an error.

use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::controller::CaptureSettings;
use crate::traits::DeviceKind;

/// Top-level configuration.
#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
#[serde(default)]
pub struct Config {
    /// Initial capture settings and camera choice.
    pub capture: CaptureConfig,
    /// V4L2 device index for each camera kind.
    pub devices: DeviceMap,
    /// Log filter.
    pub logging: LoggingConfig,
}

/// `[capture]` section.
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default)]
pub struct CaptureConfig {
    /// Exposure in seconds.
    pub exposure_seconds: f64,
    /// Sensor gain.
    pub gain: f32,
    /// Illumination level in `[0, 1]`.
    pub illumination: f32,
    /// Camera to switch to once streaming, if not the discovered default.
    pub camera: Option<DeviceKind>,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        let settings = CaptureSettings::default();
        Self {
            exposure_seconds: settings.exposure_seconds,
            gain: settings.gain,
            illumination: settings.illumination,
            camera: None,
        }
    }
}

/// `[devices]` section: `/dev/videoN` index per camera kind.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct DeviceMap {
    /// Ultra-wide camera index.
    pub ultra_wide: Option<usize>,
    /// Wide camera index.
    pub wide: Option<usize>,
    /// Telephoto camera index.
    pub telephoto: Option<usize>,
}

impl Default for DeviceMap {
    fn default() -> Self {
        Self {
            ultra_wide: None,
            wide: Some(0),
            telephoto: None,
        }
    }
}

impl DeviceMap {
    /// Configured index for `kind`.
    pub const fn index(&self, kind: DeviceKind) -> Option<usize> {
        match kind {
            DeviceKind::UltraWide => self.ultra_wide,
            DeviceKind::Wide => self.wide,
            DeviceKind::Telephoto => self.telephoto,
        }
    }

    /// Every configured `(kind, index)` pair in discovery preference order.
    pub fn entries(&self) -> impl Iterator<Item = (DeviceKind, usize)> + '_ {
        DeviceKind::PREFERENCE
            .into_iter()
            .filter_map(|kind| self.index(kind).map(|index| (kind, index)))
    }
}

/// `[logging]` section.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct LoggingConfig {
    /// `tracing` filter directive, overridden by `RUST_LOG`.
    pub filter: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            filter: "info".to_owned(),
        }
    }
}

impl Config {
    /// Load configuration from `path`, or from [`default_path`] when `None`.
    ///
    /// Returns the defaults if the file does not exist.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let path = path.map_or_else(default_path, Path::to_path_buf);
        if !path.exists() {
            return Ok(Self::default());
        }

        let content = std::fs::read_to_string(&path).map_err(|source| ConfigError::Io {
            path: path.clone(),
            source,
        })?;
        toml::from_str(&content).map_err(|source| ConfigError::Parse { path, source })
    }

    /// Initial operator request from the `[capture]` section.
    pub fn capture_settings(&self) -> CaptureSettings {
        CaptureSettings::from_operator(
            self.capture.exposure_seconds,
            self.capture.gain,
            self.capture.illumination,
        )
    }
}

/// Errors that can occur when loading configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// The file exists but could not be read.
    #[error("failed to read config file '{}': {source}", path.display())]
    Io {
        /// Path that was read.
        path: PathBuf,
        /// Underlying error.
        source: std::io::Error,
    },
    /// The file is not valid TOML for [`Config`].
    #[error("failed to parse config file '{}': {source}", path.display())]
    Parse {
        /// Path that was parsed.
        path: PathBuf,
        /// Underlying error.
        source: toml::de::Error,
    },
}

/// Default config file location.
pub fn default_path() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from(".config"))
        .join("cf-cam")
        .join("config.toml")
}
