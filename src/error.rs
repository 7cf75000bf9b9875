//! Error taxonomy for capture operations.
//!
//! Errors are split into fatal conditions, which drive the session into
//! [`SessionState::Failed`](crate::session::SessionState::Failed), and
//! recoverable ones, which are logged and leave the session untouched.

use std::fmt;

use crate::traits::{DeviceKind, FourCC};

/// Reason code carried by a failed session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FailureReason {
    /// Camera access was denied by the operator or platform.
    NotAuthorized,
    /// No back-facing camera of any supported kind was found.
    NoDeviceAvailable,
    /// The active device does not offer the 10-bit bi-planar format.
    FormatUnavailable,
    /// The active device cannot run with a custom exposure duration.
    UnsupportedExposureMode,
    /// The device input could not be attached to the session.
    InputAttachFailed,
    /// The frame output could not be attached to the session.
    OutputAttachFailed,
    /// The new input could not be attached during a camera switch.
    SwitchFailed,
    /// The device kept delivering frames in a foreign pixel format.
    WrongFrameFormat,
    /// The device stream stopped while the session was running.
    StreamFailed,
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            Self::NotAuthorized => "camera access not authorized",
            Self::NoDeviceAvailable => "no camera device available",
            Self::FormatUnavailable => "10-bit bi-planar format unavailable",
            Self::UnsupportedExposureMode => "custom exposure mode unsupported",
            Self::InputAttachFailed => "could not attach device input",
            Self::OutputAttachFailed => "could not attach frame output",
            Self::SwitchFailed => "could not attach input during camera switch",
            Self::WrongFrameFormat => "device delivered frames in the wrong pixel format",
            Self::StreamFailed => "device stream stopped unexpectedly",
        };
        f.write_str(text)
    }
}

/// Error type for capture operations.
#[derive(Debug, thiserror::Error)]
pub enum CaptureError {
    /// Camera access was denied.
    #[error("camera access not authorized")]
    NotAuthorized,
    /// No device of any preferred kind could be discovered.
    #[error("no camera device available")]
    NoDeviceAvailable,
    /// A specific device kind was requested but never discovered.
    #[error("{0} camera is not available")]
    DeviceUnavailable(DeviceKind),
    /// The required pixel format is not in the device's format list.
    #[error("required pixel format {required} not offered by device")]
    FormatUnavailable {
        /// The format that was searched for.
        required: FourCC,
    },
    /// The device does not support custom exposure.
    #[error("custom exposure mode not supported by device")]
    UnsupportedExposureMode,
    /// A device configuration transaction failed.
    #[error("device configuration failed: {0}")]
    ConfigurationFailed(String),
    /// Requested settings cannot be issued at all.
    #[error("invalid capture settings: {0}")]
    InvalidSettings(String),
    /// The input could not be attached to the session.
    #[error("failed to attach input: {0}")]
    InputAttachFailed(String),
    /// The output could not be attached to the session.
    #[error("failed to attach output: {0}")]
    OutputAttachFailed(String),
    /// The input for the newly selected camera could not be attached.
    #[error("camera switch failed: {0}")]
    SwitchFailed(String),
    /// Too many consecutive frames arrived in a foreign pixel format.
    #[error("{count} consecutive frames arrived as {actual}")]
    WrongFrameFormat {
        /// Number of consecutive mismatching frames.
        count: u32,
        /// Pixel format of the last mismatching frame.
        actual: FourCC,
    },
    /// The device stream ended with an error while running.
    #[error("frame stream failed: {0}")]
    StreamFailed(String),
    /// The frame is smaller than the sampling region.
    #[error("frame {width}x{height} is smaller than the sampling region")]
    FrameTooSmall {
        /// Frame width in samples.
        width: u32,
        /// Frame height in samples.
        height: u32,
    },
    /// The frame buffer layout is inconsistent with its declared size.
    #[error("invalid frame buffer: {0}")]
    InvalidBuffer(String),
    /// The operation is not permitted in the current session state.
    #[error("cannot {operation} while session is {state}")]
    InvalidState {
        /// The refused operation.
        operation: &'static str,
        /// Human-readable session state.
        state: String,
    },
    /// The platform driver reported an error.
    #[error("driver error: {0}")]
    Driver(String),
    /// The control thread has exited; no further commands are accepted.
    #[error("capture service has stopped")]
    ServiceStopped,
    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl CaptureError {
    /// The session failure this error forces, if it is fatal.
    pub const fn fatal_reason(&self) -> Option<FailureReason> {
        match self {
            Self::NotAuthorized => Some(FailureReason::NotAuthorized),
            Self::NoDeviceAvailable => Some(FailureReason::NoDeviceAvailable),
            Self::FormatUnavailable { .. } => Some(FailureReason::FormatUnavailable),
            Self::UnsupportedExposureMode => Some(FailureReason::UnsupportedExposureMode),
            Self::InputAttachFailed(_) => Some(FailureReason::InputAttachFailed),
            Self::OutputAttachFailed(_) => Some(FailureReason::OutputAttachFailed),
            Self::SwitchFailed(_) => Some(FailureReason::SwitchFailed),
            Self::WrongFrameFormat { .. } => Some(FailureReason::WrongFrameFormat),
            Self::StreamFailed(_) => Some(FailureReason::StreamFailed),
            Self::DeviceUnavailable(_)
            | Self::ConfigurationFailed(_)
            | Self::InvalidSettings(_)
            | Self::FrameTooSmall { .. }
            | Self::InvalidBuffer(_)
            | Self::InvalidState { .. }
            | Self::Driver(_)
            | Self::ServiceStopped
            | Self::Io(_) => None,
        }
    }

    /// Whether this error terminates the session.
    pub const fn is_fatal(&self) -> bool {
        self.fatal_reason().is_some()
    }
}

/// Result type for capture operations.
pub type Result<T> = std::result::Result<T, CaptureError>;
