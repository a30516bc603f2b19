// THEORY:
// The `pipeline` module is the top-level API of the turret core. `ControlLoop` wires a
// frame source, a localizer and a target handler into one sequential loop and owns
// all three exclusively, so none of their state needs a lock.
//
// Lifecycle: Idle -> Running -> Draining -> Stopped.
// - Idle: everything is constructed, the background is captured and the turret has
//   been homed.
// - Running: one frame per iteration. The cancellation token is checked before every
//   read, so a cancel never interrupts a PWM write half-way.
// - Draining: the frame source is released first, then the actuator pins, in the order
//   they were acquired. The first failure is returned, but every resource still gets
//   its chance to be released.
// - Stopped: terminal.
//
// Per-frame failures are swallowed (logged, counted) so one bad frame never stops
// tracking. Only a lost device, an exhausted source, a cancellation or a run of
// actuation failures ends the loop.

use image::{GrayImage, RgbImage};
use tracing::{debug, error, info, warn};

use crate::core_modules::frame::{FrameBuffer, FrameSource};
use crate::core_modules::localizer::{Localization, Localizer};
use crate::core_modules::region::Region;
use crate::core_modules::turret::{TargetHandler, TargetOutcome};
use crate::error::{Axis, FrameProcessingError, Result, TurretError};
use crate::worker::CancelToken;

// Re-export key data structures for the public API.
pub use crate::core_modules::debouncer::DebounceDecision;

/// Observes the loop's intermediate images. Implementations must not block and cannot
/// fail the loop.
pub trait PresentationSink: Send {
    /// The working-resolution colour frame, unmodified.
    fn on_frame(&self, frame: &RgbImage);

    /// The absolute difference against the background.
    fn on_mask(&self, delta: &GrayImage);

    /// The binary threshold mask targets are extracted from.
    fn on_threshold(&self, threshold: &GrayImage);

    /// The loop's verdict on a frame. Delivered before that frame's images.
    fn on_report(&self, _frame_id: u64, _report: &Report) {}
}

/// The lifecycle state of a [`ControlLoop`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopState {
    Idle,
    Running,
    Draining,
    Stopped,
}

/// The result of processing one frame.
#[derive(Debug, Clone, PartialEq)]
pub enum Report {
    /// The frame held no target.
    NoTarget,
    /// A target was found and handed to the turret.
    Target { region: Region, outcome: TargetOutcome },
    /// A target was found but driving the servos failed.
    ActuationFailed { region: Region, axis: Axis },
    /// The frame could not be processed and was skipped.
    Skipped,
    /// The frame source has no more frames.
    EndOfStream,
}

impl Report {
    pub fn region(&self) -> Option<Region> {
        match self {
            Report::Target { region, .. } | Report::ActuationFailed { region, .. } => Some(*region),
            _ => None,
        }
    }
}

/// Why a run ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EndReason {
    Cancelled,
    Exhausted,
    DeviceLost(String),
    ActuationFailures(u32),
}

/// Counters for one run of the loop.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LoopSummary {
    pub frames_processed: u64,
    pub frames_skipped: u64,
    pub detections: u64,
    pub actuations: u64,
    pub debounced: u64,
    pub actuation_failures: u64,
    pub end_reason: Option<EndReason>,
}

/// The detection-to-actuation control loop.
pub struct ControlLoop<S: FrameSource, L: Localizer, H: TargetHandler> {
    source: S,
    localizer: L,
    handler: H,
    sink: Option<Box<dyn PresentationSink>>,
    state: LoopState,
    max_consecutive_failures: u32,
    consecutive_failures: u32,
    summary: LoopSummary,
}

impl<S: FrameSource, L: Localizer, H: TargetHandler> ControlLoop<S, L, H> {
    /// Assembles the loop and homes the turret. The loop starts out `Idle`.
    ///
    /// If homing fails the source is closed before the error is returned.
    pub fn new(
        mut source: S,
        localizer: L,
        mut handler: H,
        max_consecutive_failures: u32,
    ) -> Result<Self> {
        if let Err(e) = handler.home() {
            if let Err(close_err) = source.close() {
                warn!(error = %close_err, "could not close frame source after failed homing");
            }
            return Err(e.into());
        }
        Ok(Self {
            source,
            localizer,
            handler,
            sink: None,
            state: LoopState::Idle,
            max_consecutive_failures,
            consecutive_failures: 0,
            summary: LoopSummary::default(),
        })
    }

    /// Attaches a presentation sink.
    pub fn with_sink(mut self, sink: Box<dyn PresentationSink>) -> Self {
        self.sink = Some(sink);
        self
    }

    pub fn state(&self) -> LoopState {
        self.state
    }

    pub fn summary(&self) -> &LoopSummary {
        &self.summary
    }

    pub fn localizer(&self) -> &L {
        &self.localizer
    }

    pub fn handler(&self) -> &H {
        &self.handler
    }

    /// Runs until cancelled, exhausted, or failed, then drains and stops.
    pub fn run(&mut self, cancel: &CancelToken) -> Result<LoopSummary> {
        if self.state == LoopState::Stopped {
            return Err(TurretError::Stopped);
        }
        self.state = LoopState::Running;
        info!("control loop running");

        let reason = loop {
            if cancel.is_cancelled() {
                break EndReason::Cancelled;
            }
            match self.step() {
                Ok(Report::EndOfStream) => break EndReason::Exhausted,
                Ok(_) => {}
                Err(TurretError::Device(e)) => {
                    error!(error = %e, "frame source failed");
                    break EndReason::DeviceLost(e.to_string());
                }
                Err(e) => return Err(e),
            }
            if self.consecutive_failures >= self.max_consecutive_failures {
                error!(
                    failures = self.consecutive_failures,
                    "too many consecutive actuation failures"
                );
                break EndReason::ActuationFailures(self.consecutive_failures);
            }
        };

        info!(?reason, "control loop draining");
        self.summary.end_reason = Some(reason);
        self.drain()?;
        Ok(self.summary.clone())
    }

    /// Processes exactly one frame.
    pub fn step(&mut self) -> Result<Report> {
        match self.state {
            LoopState::Stopped | LoopState::Draining => return Err(TurretError::Stopped),
            LoopState::Idle => self.state = LoopState::Running,
            LoopState::Running => {}
        }

        let Some(frame) = self.source.read()? else {
            return Ok(Report::EndOfStream);
        };
        self.summary.frames_processed += 1;

        let localization = match self.localizer.locate(&frame) {
            Ok(localization) => localization,
            Err(e) => return Ok(self.skip(&frame, e)),
        };

        let report = match localization.region {
            None => Report::NoTarget,
            Some(region) => self.engage(region, &localization, &frame),
        };
        self.publish(frame.frame_id, &localization, &report);
        Ok(report)
    }

    /// Releases the frame source, then the turret. Moves the loop to `Stopped`.
    pub fn drain(&mut self) -> Result<()> {
        if self.state == LoopState::Stopped {
            return Err(TurretError::Stopped);
        }
        self.state = LoopState::Draining;

        let mut first_error: Option<TurretError> = None;
        if let Err(e) = self.source.close() {
            error!(error = %e, "could not close frame source");
            first_error.get_or_insert(e.into());
        }
        if let Err(e) = self.handler.release() {
            error!(error = %e, "could not release actuators");
            first_error.get_or_insert(e.into());
        }

        self.state = LoopState::Stopped;
        info!(summary = ?self.summary, "control loop stopped");
        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    fn skip(&mut self, frame: &FrameBuffer, e: FrameProcessingError) -> Report {
        warn!(frame_id = frame.frame_id, error = %e, "skipping frame");
        self.summary.frames_skipped += 1;
        if let Some(sink) = &self.sink {
            sink.on_report(frame.frame_id, &Report::Skipped);
        }
        Report::Skipped
    }

    fn engage(&mut self, region: Region, localization: &Localization, frame: &FrameBuffer) -> Report {
        self.summary.detections += 1;
        match self
            .handler
            .on_target(&region, &localization.frame, frame.timestamp)
        {
            Ok(outcome) => {
                match outcome {
                    TargetOutcome::Actuated { .. } => {
                        self.summary.actuations += 1;
                        self.consecutive_failures = 0;
                    }
                    TargetOutcome::Debounced(decision) => {
                        debug!(frame_id = frame.frame_id, ?decision, "target debounced");
                        self.summary.debounced += 1;
                    }
                }
                Report::Target { region, outcome }
            }
            Err(e) => {
                self.summary.actuation_failures += 1;
                self.consecutive_failures += 1;
                warn!(
                    frame_id = frame.frame_id,
                    error = %e,
                    consecutive = self.consecutive_failures,
                    "actuation failed"
                );
                Report::ActuationFailed {
                    region,
                    axis: e.axis(),
                }
            }
        }
    }

    fn publish(&self, frame_id: u64, localization: &Localization, report: &Report) {
        let Some(sink) = &self.sink else {
            return;
        };
        sink.on_report(frame_id, report);
        sink.on_frame(&localization.frame);
        if let Some(delta) = &localization.delta {
            sink.on_mask(delta);
        }
        if let Some(threshold) = &localization.threshold {
            sink.on_threshold(threshold);
        }
    }
}
