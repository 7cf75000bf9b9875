//! Capture session state machine.
//!
//! [`CaptureSessionManager`] owns the [`SessionContext`] and is the only code
//! that reconfigures devices or the platform session. It is driven from the
//! control queue (see [`crate::service`]), so its operations never overlap.

use std::fmt;

use tokio::sync::mpsc::UnboundedSender;
use tracing::{debug, error, info, warn};

use crate::controller::{CaptureSettings, EffectiveSettings, ExposureController};
use crate::error::{CaptureError, FailureReason, Result};
use crate::format::select_format;
use crate::frames::{FrameSink, FrameStats};
use crate::traits::{
    AuthorizationStatus, Authorizer, CameraDevice, CaptureFormat, CaptureSession,
    ConfigurationLock, DeviceKind, DeviceProvider, SessionTransaction,
};

/// Lifecycle of the capture subsystem.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Nothing has been set up yet.
    Uninitialized,
    /// Waiting for the operator to answer the camera permission prompt.
    AwaitingAuthorization,
    /// Input and output attached, not yet streaming.
    Ready,
    /// Streaming frames with settings applied.
    Running,
    /// Terminal; the whole flow must be rebuilt.
    Failed(FailureReason),
}

impl SessionState {
    /// Whether no further operation is accepted.
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Failed(_))
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Uninitialized => f.write_str("uninitialized"),
            Self::AwaitingAuthorization => f.write_str("awaiting authorization"),
            Self::Ready => f.write_str("ready"),
            Self::Running => f.write_str("running"),
            Self::Failed(reason) => write!(f, "failed ({reason})"),
        }
    }
}

/// Notification sent to the presentation layer.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    /// The session moved to a new state.
    StateChanged(SessionState),
    /// A camera became the session input.
    CameraActivated {
        /// The active camera kind.
        kind: DeviceKind,
        /// The format selected for it.
        format: CaptureFormat,
    },
    /// Settings were applied; values are post-clamp.
    SettingsApplied(EffectiveSettings),
    /// A configuration transaction failed; previous settings remain.
    ConfigurationFailed(String),
    /// The device stopped delivering the required pixel format.
    WrongFormatFatal,
}

/// Immutable copy of the session context.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionSnapshot {
    /// Current state.
    pub state: SessionState,
    /// Active camera, if any.
    pub active: Option<DeviceKind>,
    /// Selected format for the active camera.
    pub format: Option<CaptureFormat>,
    /// Last operator request.
    pub requested: CaptureSettings,
    /// Settings last applied to the device.
    pub effective: Option<EffectiveSettings>,
    /// Frame hand-off counters.
    pub frames: FrameStats,
}

/// Mutable state of the capture subsystem.
#[derive(Debug)]
pub struct SessionContext {
    state: SessionState,
    active: Option<DeviceKind>,
    format: Option<CaptureFormat>,
    requested: CaptureSettings,
    effective: Option<EffectiveSettings>,
}

impl SessionContext {
    /// Fresh context holding the initial operator settings.
    pub const fn new(requested: CaptureSettings) -> Self {
        Self {
            state: SessionState::Uninitialized,
            active: None,
            format: None,
            requested,
            effective: None,
        }
    }

    /// Current state.
    pub const fn state(&self) -> SessionState {
        self.state
    }

    /// Copy out the context together with the frame counters.
    pub fn snapshot(&self, frames: FrameStats) -> SessionSnapshot {
        SessionSnapshot {
            state: self.state,
            active: self.active,
            format: self.format.clone(),
            requested: self.requested,
            effective: self.effective,
            frames,
        }
    }
}

/// Cameras found during setup, in discovery preference order.
#[derive(Default)]
struct DeviceRoster {
    devices: Vec<Box<dyn CameraDevice>>,
}

impl DeviceRoster {
    fn discover(provider: &dyn DeviceProvider) -> Self {
        let devices = DeviceKind::PREFERENCE
            .iter()
            .filter_map(|&kind| {
                let device = provider.discover(kind);
                match &device {
                    Some(found) => info!(kind = %kind, device = %found.name(), "Found camera"),
                    None => debug!(kind = %kind, "Camera kind not present"),
                }
                device
            })
            .collect();
        Self { devices }
    }

    fn preferred(&self) -> Option<DeviceKind> {
        self.devices.first().map(|device| device.kind())
    }

    fn contains(&self, kind: DeviceKind) -> bool {
        self.devices.iter().any(|device| device.kind() == kind)
    }

    fn get_mut(&mut self, kind: DeviceKind) -> Option<&mut Box<dyn CameraDevice>> {
        self.devices.iter_mut().find(|device| device.kind() == kind)
    }
}

/// Drives device selection, session (re)configuration and camera switches.
pub struct CaptureSessionManager<P, S, A> {
    context: SessionContext,
    provider: P,
    session: S,
    authorizer: A,
    controller: ExposureController,
    roster: DeviceRoster,
    frames: FrameSink,
    events: UnboundedSender<SessionEvent>,
}

impl<P, S, A> CaptureSessionManager<P, S, A>
where
    P: DeviceProvider,
    S: CaptureSession,
    A: Authorizer,
{
    /// Create a manager. Nothing is touched until [`initialize`](Self::initialize).
    pub fn new(
        provider: P,
        session: S,
        authorizer: A,
        frames: FrameSink,
        events: UnboundedSender<SessionEvent>,
        initial: CaptureSettings,
    ) -> Self {
        Self {
            context: SessionContext::new(initial),
            provider,
            session,
            authorizer,
            controller: ExposureController::new(),
            roster: DeviceRoster::default(),
            frames,
            events,
        }
    }

    /// Current state.
    pub const fn state(&self) -> SessionState {
        self.context.state()
    }

    /// Copy of the current context.
    pub fn snapshot(&self) -> SessionSnapshot {
        self.context.snapshot(self.frames.stats())
    }

    /// Check authorization, discover cameras and attach input and output.
    ///
    /// Ends in `Ready` or `Failed`.
    pub fn initialize(&mut self) -> Result<()> {
        self.require("initialize", |state| state == SessionState::Uninitialized)?;

        match self.authorizer.status() {
            AuthorizationStatus::Authorized => {}
            AuthorizationStatus::NotDetermined => {
                self.transition(SessionState::AwaitingAuthorization);
                if !self.authorizer.request_access() {
                    return self.fail_with(CaptureError::NotAuthorized);
                }
                info!("Camera access granted");
            }
            AuthorizationStatus::Denied => return self.fail_with(CaptureError::NotAuthorized),
        }

        self.setup()
    }

    fn setup(&mut self) -> Result<()> {
        self.roster = DeviceRoster::discover(&self.provider);
        let Some(kind) = self.roster.preferred() else {
            return self.fail_with(CaptureError::NoDeviceAvailable);
        };

        let attached = {
            let mut transaction = SessionTransaction::begin(&mut self.session);
            let attached = match self.roster.get_mut(kind) {
                Some(device) => attach_device(&mut *transaction, &**device, &self.frames),
                None => Err(CaptureError::NoDeviceAvailable),
            };
            match attached {
                Ok(format) => transaction
                    .commit()
                    .map(|()| format)
                    .map_err(|err| CaptureError::InputAttachFailed(err.to_string())),
                Err(err) => Err(err),
            }
        };

        match attached {
            Ok(format) => {
                info!(kind = %kind, format = %format, "Capture session configured");
                self.activate(kind, format);
                self.transition(SessionState::Ready);
                Ok(())
            }
            Err(err) => self.fail_with(err),
        }
    }

    /// Apply the held settings and format, then start streaming.
    pub fn start(&mut self) -> Result<()> {
        self.require("start", |state| state == SessionState::Ready)?;
        let (Some(kind), Some(format)) = (self.context.active, self.context.format.clone()) else {
            return Err(CaptureError::NoDeviceAvailable);
        };

        if let Err(err) = self.apply_to_active(kind, &format) {
            if err.is_fatal() {
                return self.fail_with(err);
            }
            self.report_recoverable(&err);
        }

        self.session.start_running()?;
        self.transition(SessionState::Running);
        Ok(())
    }

    /// Record a new operator request and apply it if streaming.
    ///
    /// Returns the applied settings when the session is running.
    pub fn update_settings(
        &mut self,
        requested: CaptureSettings,
    ) -> Result<Option<EffectiveSettings>> {
        self.require("update settings", |state| !state.is_terminal())?;
        requested.validate()?;
        self.context.requested = requested;

        if self.state() != SessionState::Running {
            debug!(?requested, "Settings held until the session starts");
            return Ok(None);
        }
        let Some(kind) = self.context.active else {
            return Ok(None);
        };
        let Some(device) = self.roster.get_mut(kind) else {
            return Err(CaptureError::DeviceUnavailable(kind));
        };

        let bounds = device.bounds();
        match self
            .controller
            .apply(&mut **device, &self.context.requested, &bounds)
        {
            Ok(effective) => {
                self.record_effective(effective);
                Ok(Some(effective))
            }
            Err(err) if err.is_fatal() => self.fail_with(err).map(|()| None),
            Err(err) => {
                self.report_recoverable(&err);
                Err(err)
            }
        }
    }

    /// Swap the session input to the camera of `kind`.
    ///
    /// The retained request (not the previously clamped value) is re-clamped
    /// against the new camera's bounds. Once the old input is removed there is
    /// no way back: an attach failure, or a commit that cannot resume
    /// streaming, fails the session.
    pub fn switch_camera(&mut self, kind: DeviceKind) -> Result<()> {
        self.require("switch camera", |state| {
            matches!(state, SessionState::Ready | SessionState::Running)
        })?;
        if self.context.active == Some(kind) {
            debug!(kind = %kind, "Camera already active");
            return Ok(());
        }
        if !self.roster.contains(kind) {
            warn!(kind = %kind, "Requested camera was not discovered");
            return Err(CaptureError::DeviceUnavailable(kind));
        }

        info!(from = ?self.context.active, to = %kind, "Switching camera");
        let running = self.state() == SessionState::Running;
        let outcome = {
            let mut transaction = SessionTransaction::begin(&mut self.session);
            transaction.detach_input();
            let swapped = match self.roster.get_mut(kind) {
                Some(device) => swap_input(
                    &mut *transaction,
                    &mut **device,
                    running.then_some((&self.controller, &self.context.requested)),
                ),
                None => Err(CaptureError::DeviceUnavailable(kind)),
            };
            match swapped {
                Ok(swapped) => transaction
                    .commit()
                    .map(|()| swapped)
                    .map_err(|err| CaptureError::SwitchFailed(err.to_string())),
                Err(err) => Err(err),
            }
        };

        match outcome {
            Ok((format, applied)) => {
                self.activate(kind, format);
                match applied {
                    Some(Ok(effective)) => self.record_effective(effective),
                    Some(Err(err)) if err.is_fatal() => return self.fail_with(err),
                    Some(Err(err)) => self.report_recoverable(&err),
                    None => {}
                }
                Ok(())
            }
            Err(err) => {
                self.context.active = None;
                self.context.format = None;
                self.fail_with(err)
            }
        }
    }

    /// Move to `Failed(reason)`, stop streaming and close the frame channel.
    pub fn fail(&mut self, reason: FailureReason) {
        if self.state().is_terminal() {
            return;
        }
        error!(reason = %reason, "Capture session failed");
        self.session.stop_running();
        self.frames.close();
        if reason == FailureReason::WrongFrameFormat {
            self.emit(SessionEvent::WrongFormatFatal);
        }
        self.transition(SessionState::Failed(reason));
    }

    /// Stop streaming and close the frame channel without changing state.
    pub fn shutdown(&mut self) {
        info!(state = %self.state(), "Shutting down capture session");
        if self.state() == SessionState::Running {
            self.session.stop_running();
        }
        self.frames.close();
    }

    /// Set the active format and apply the retained request to the camera of
    /// `kind`. Shared by start and camera switch.
    fn apply_to_active(&mut self, kind: DeviceKind, format: &CaptureFormat) -> Result<()> {
        let device = self
            .roster
            .get_mut(kind)
            .ok_or(CaptureError::DeviceUnavailable(kind))?;
        let effective = apply_format_and_settings(
            &self.controller,
            &mut **device,
            format,
            &self.context.requested,
        )?;
        self.record_effective(effective);
        Ok(())
    }

    fn require(
        &self,
        operation: &'static str,
        allowed: impl Fn(SessionState) -> bool,
    ) -> Result<()> {
        let state = self.state();
        if allowed(state) {
            Ok(())
        } else {
            warn!(operation, state = %state, "Operation refused");
            Err(CaptureError::InvalidState {
                operation,
                state: state.to_string(),
            })
        }
    }

    fn activate(&mut self, kind: DeviceKind, format: CaptureFormat) {
        self.context.active = Some(kind);
        self.context.format = Some(format.clone());
        self.emit(SessionEvent::CameraActivated { kind, format });
    }

    fn record_effective(&mut self, effective: EffectiveSettings) {
        info!(
            exposure_us = effective.exposure.as_micros(),
            gain = effective.gain,
            illumination = ?effective.illumination,
            "Capture settings in force"
        );
        self.context.effective = Some(effective);
        self.emit(SessionEvent::SettingsApplied(effective));
    }

    fn report_recoverable(&self, err: &CaptureError) {
        warn!(error = %err, "Configuration failed, previous settings remain");
        self.emit(SessionEvent::ConfigurationFailed(err.to_string()));
    }

    fn fail_with(&mut self, err: CaptureError) -> Result<()> {
        if let Some(reason) = err.fatal_reason() {
            self.fail(reason);
        }
        Err(err)
    }

    fn transition(&mut self, next: SessionState) {
        let previous = self.context.state;
        self.context.state = next;
        info!(from = %previous, to = %next, "Session state changed");
        self.emit(SessionEvent::StateChanged(next));
    }

    fn emit(&self, event: SessionEvent) {
        if self.events.send(event).is_err() {
            debug!("Presentation channel closed, dropping event");
        }
    }
}

/// Select the format for `device` and attach it plus the frame output.
fn attach_device<S: CaptureSession + ?Sized>(
    session: &mut S,
    device: &dyn CameraDevice,
    frames: &FrameSink,
) -> Result<CaptureFormat> {
    let format = select_format(&device.supported_formats())?;
    session
        .attach_input(device)
        .map_err(|err| CaptureError::InputAttachFailed(err.to_string()))?;
    session
        .attach_output(frames.clone())
        .map_err(|err| CaptureError::OutputAttachFailed(err.to_string()))?;
    Ok(format)
}

/// Attach `device` in place of the removed input and, when `reapply` is set,
/// push the retained request to it.
fn swap_input<S: CaptureSession + ?Sized>(
    session: &mut S,
    device: &mut dyn CameraDevice,
    reapply: Option<(&ExposureController, &CaptureSettings)>,
) -> Result<(CaptureFormat, Option<Result<EffectiveSettings>>)> {
    session
        .attach_input(&*device)
        .map_err(|err| CaptureError::SwitchFailed(err.to_string()))?;
    let format = select_format(&device.supported_formats())?;
    let applied = reapply.map(|(controller, requested)| {
        apply_format_and_settings(controller, device, &format, requested)
    });
    Ok((format, applied))
}

/// Make `format` active on `device`, then clamp and apply `requested` against
/// the bounds the device reports for that format.
pub fn apply_format_and_settings(
    controller: &ExposureController,
    device: &mut dyn CameraDevice,
    format: &CaptureFormat,
    requested: &CaptureSettings,
) -> Result<EffectiveSettings> {
    {
        let mut lock = ConfigurationLock::acquire(&mut *device)
            .map_err(|err| CaptureError::ConfigurationFailed(err.to_string()))?;
        lock.set_active_format(format)
            .map_err(|err| CaptureError::ConfigurationFailed(err.to_string()))?;
    }
    debug!(device = %device.name(), format = %format, "Active format set");
    let bounds = device.bounds();
    controller.apply(device, requested, &bounds)
}
