//! Threads that run the capture subsystem.
//!
//! Two execution contexts, never more:
//!
//! * the **control thread** owns the [`CaptureSessionManager`] and drains a
//!   FIFO of [`ControlCommand`]s, so reconfigurations never overlap;
//! * the **frame worker** pulls frames from the latest-wins slot, samples the
//!   ROI and publishes the metric.
//!
//! The presentation side only ever sees [`Presentation`]: session events and
//! the latest [`RoiMetric`].

use std::sync::mpsc::{self, Receiver, Sender};
use std::thread::{self, JoinHandle};

use tokio::sync::{mpsc as async_mpsc, watch};
use tracing::{debug, error, info, trace, warn};

use crate::controller::CaptureSettings;
use crate::error::{CaptureError, FailureReason, Result};
use crate::frames::{frame_channel, FrameReceiver};
use crate::sampler::{FrameVerdict, RoiMetric, RoiSampler, WrongFormatGuard};
use crate::session::{CaptureSessionManager, SessionEvent, SessionSnapshot};
use crate::traits::{Authorizer, CaptureSession, DeviceKind, DeviceProvider, PlanarBuffer};

/// Commands executed in order on the control thread.
#[derive(Debug)]
pub enum ControlCommand {
    /// Authorize, discover and attach.
    Initialize,
    /// Apply settings and start streaming.
    Start,
    /// Replace the operator request.
    UpdateSettings(CaptureSettings),
    /// Make another camera the session input.
    SwitchCamera(DeviceKind),
    /// Force the session into `Failed`.
    Fail(FailureReason),
    /// Reply with a copy of the session context.
    Snapshot(Sender<SessionSnapshot>),
    /// Stop streaming and exit the control thread.
    Shutdown,
}

/// Receiving half handed to the presentation layer.
pub struct Presentation {
    /// Session notifications in emission order.
    pub events: async_mpsc::UnboundedReceiver<SessionEvent>,
    /// Most recent ROI metric; `None` until the first frame is sampled.
    pub metric: watch::Receiver<Option<RoiMetric>>,
}

/// Handle to the running capture subsystem.
pub struct CaptureService {
    control: Sender<ControlCommand>,
    control_thread: Option<JoinHandle<()>>,
    worker_thread: Option<JoinHandle<()>>,
}

impl CaptureService {
    /// Spawn the control thread and frame worker.
    ///
    /// Nothing touches the hardware until [`initialize`](Self::initialize).
    pub fn spawn<P, S, A>(
        provider: P,
        session: S,
        authorizer: A,
        initial: CaptureSettings,
    ) -> Result<(Self, Presentation)>
    where
        P: DeviceProvider + 'static,
        S: CaptureSession + 'static,
        A: Authorizer + 'static,
    {
        let (frame_sink, frame_receiver) = frame_channel();
        let (event_tx, event_rx) = async_mpsc::unbounded_channel();
        let (metric_tx, metric_rx) = watch::channel(None);
        let (control_tx, control_rx) = mpsc::channel();

        let manager = CaptureSessionManager::new(
            provider,
            session,
            authorizer,
            frame_sink,
            event_tx,
            initial,
        );

        let control_thread = thread::Builder::new()
            .name("capture-control".to_owned())
            .spawn(move || run_control_loop(manager, &control_rx))?;

        let worker = FrameWorker::new(frame_receiver, metric_tx, control_tx.clone());
        let worker_thread = thread::Builder::new()
            .name("frame-worker".to_owned())
            .spawn(move || worker.run())?;

        info!("Capture service started");
        Ok((
            Self {
                control: control_tx,
                control_thread: Some(control_thread),
                worker_thread: Some(worker_thread),
            },
            Presentation {
                events: event_rx,
                metric: metric_rx,
            },
        ))
    }

    /// Queue session setup.
    pub fn initialize(&self) -> Result<()> {
        self.send(ControlCommand::Initialize)
    }

    /// Queue streaming start.
    pub fn start(&self) -> Result<()> {
        self.send(ControlCommand::Start)
    }

    /// Queue a new operator request.
    pub fn update_settings(&self, settings: CaptureSettings) -> Result<()> {
        self.send(ControlCommand::UpdateSettings(settings))
    }

    /// Queue a camera switch.
    pub fn switch_camera(&self, kind: DeviceKind) -> Result<()> {
        self.send(ControlCommand::SwitchCamera(kind))
    }

    /// Session context after every previously queued command has run.
    pub fn snapshot(&self) -> Result<SessionSnapshot> {
        let (reply_tx, reply_rx) = mpsc::channel();
        self.send(ControlCommand::Snapshot(reply_tx))?;
        reply_rx.recv().map_err(|_| CaptureError::ServiceStopped)
    }

    /// Stop streaming and join both threads.
    pub fn shutdown(mut self) {
        self.stop();
    }

    fn send(&self, command: ControlCommand) -> Result<()> {
        self.control
            .send(command)
            .map_err(|_| CaptureError::ServiceStopped)
    }

    fn stop(&mut self) {
        let _ = self.control.send(ControlCommand::Shutdown);
        for handle in [self.control_thread.take(), self.worker_thread.take()]
            .into_iter()
            .flatten()
        {
            let name = handle.thread().name().unwrap_or("capture").to_owned();
            if handle.join().is_err() {
                error!(thread = %name, "Capture thread panicked");
            }
        }
    }
}

impl Drop for CaptureService {
    fn drop(&mut self) {
        self.stop();
    }
}

fn run_control_loop<P, S, A>(
    mut manager: CaptureSessionManager<P, S, A>,
    commands: &Receiver<ControlCommand>,
) where
    P: DeviceProvider,
    S: CaptureSession,
    A: Authorizer,
{
    for command in commands {
        debug!(?command, "Control command");
        let outcome = match command {
            ControlCommand::Initialize => manager.initialize(),
            ControlCommand::Start => manager.start(),
            ControlCommand::UpdateSettings(settings) => manager.update_settings(settings).map(drop),
            ControlCommand::SwitchCamera(kind) => manager.switch_camera(kind),
            ControlCommand::Fail(reason) => {
                manager.fail(reason);
                Ok(())
            }
            ControlCommand::Snapshot(reply) => {
                let _ = reply.send(manager.snapshot());
                Ok(())
            }
            ControlCommand::Shutdown => break,
        };
        if let Err(err) = outcome {
            warn!(error = %err, state = %manager.state(), "Control command failed");
        }
    }
    manager.shutdown();
    debug!("Control thread exiting");
}

/// Samples delivered frames and publishes the ROI metric.
pub struct FrameWorker {
    receiver: FrameReceiver,
    guard: WrongFormatGuard,
    sampler: RoiSampler,
    metric: watch::Sender<Option<RoiMetric>>,
    control: Sender<ControlCommand>,
}

impl FrameWorker {
    /// Worker reading from `receiver`. Wrong-format failures are reported on
    /// `control`.
    pub fn new(
        receiver: FrameReceiver,
        metric: watch::Sender<Option<RoiMetric>>,
        control: Sender<ControlCommand>,
    ) -> Self {
        Self {
            receiver,
            guard: WrongFormatGuard::default(),
            sampler: RoiSampler::new(),
            metric,
            control,
        }
    }

    /// Process one frame.
    pub fn handle(&mut self, frame: &PlanarBuffer) -> FrameVerdict {
        let verdict = self.guard.observe(frame.pixel_format);
        match verdict {
            FrameVerdict::Sample => match self.sampler.sample(frame) {
                Ok(mean) => {
                    let metric = RoiMetric::new(mean, frame.sequence);
                    trace!(
                        sequence = frame.sequence,
                        mean,
                        display = metric.display,
                        "Sampled frame"
                    );
                    self.metric.send_replace(Some(metric));
                }
                Err(err) => {
                    warn!(sequence = frame.sequence, error = %err, "Skipping unsampleable frame");
                }
            },
            FrameVerdict::Skip => debug!(
                sequence = frame.sequence,
                format = %frame.pixel_format,
                consecutive = self.guard.consecutive(),
                "Skipping frame in wrong format"
            ),
            FrameVerdict::Fatal => {
                let err = CaptureError::WrongFrameFormat {
                    count: self.guard.consecutive(),
                    actual: frame.pixel_format,
                };
                error!(error = %err, "Failing session");
                self.report(FailureReason::WrongFrameFormat);
            }
        }
        verdict
    }

    /// Run until the frame channel closes or the format guard trips.
    ///
    /// A channel closed by a failing frame source fails the session.
    pub fn run(mut self) {
        while let Some(frame) = self.receiver.recv() {
            if self.handle(&frame) == FrameVerdict::Fatal {
                break;
            }
        }
        if let Some(message) = self.receiver.take_failure() {
            let err = CaptureError::StreamFailed(message);
            error!(error = %err, "Failing session");
            self.report(FailureReason::StreamFailed);
        }
        debug!("Frame worker exiting");
    }

    fn report(&self, reason: FailureReason) {
        if self.control.send(ControlCommand::Fail(reason)).is_err() {
            debug!("Control thread already gone");
        }
    }
}
