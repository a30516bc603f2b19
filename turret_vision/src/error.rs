// THEORY:
// Every failure the turret can meet falls into one of four families, and each family
// has a different fate inside the control loop:
//
// 1.  **DeviceError**: the camera (or replay source) is gone. Fatal at startup, and
//     mid-run it ends the `Running` state.
// 2.  **FrameProcessingError**: one frame could not be turned into a working image.
//     The loop logs it and moves on to the next frame.
// 3.  **ActuationError**: a PWM write failed. Logged and counted; too many in a row
//     drain the loop.
// 4.  **ConfigurationError**: calibration or device parameters that can never work.
//     Raised before the loop ever starts.
//
// `TurretError` is the umbrella the public API returns.

use std::fmt;

use thiserror::Error;

/// One of the two actuated axes of the turret.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Axis {
    /// Horizontal rotation, driven by the region's x coordinate.
    Pan,
    /// Vertical rotation, driven by the region's y coordinate.
    Tilt,
}

impl fmt::Display for Axis {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Axis::Pan => write!(f, "pan"),
            Axis::Tilt => write!(f, "tilt"),
        }
    }
}

/// The frame source could not be opened, read, or closed.
#[derive(Debug, Error)]
pub enum DeviceError {
    #[error("could not open capture device {device}: {reason}")]
    Open { device: String, reason: String },
    #[error("could not read from capture device: {0}")]
    Read(String),
    #[error("could not close capture device: {0}")]
    Close(String),
    #[error("capture device I/O failed: {0}")]
    Io(#[from] std::io::Error),
}

/// A single frame could not be normalized into the working representation.
#[derive(Debug, Error)]
pub enum FrameProcessingError {
    #[error("frame has zero dimensions ({width}x{height})")]
    EmptyFrame { width: u32, height: u32 },
    #[error("frame buffer holds {actual} bytes, expected {expected} for {width}x{height} RGB")]
    Malformed {
        width: u32,
        height: u32,
        expected: usize,
        actual: usize,
    },
    #[error("background reference is {reference:?} but the working frame is {frame:?}")]
    SizeMismatch {
        reference: (u32, u32),
        frame: (u32, u32),
    },
    #[error("detection backend failed: {0}")]
    Backend(String),
}

/// A duty cycle could not be written to (or released from) an axis pin.
#[derive(Debug, Error)]
pub enum ActuationError {
    #[error("could not acquire {pin} for the {axis} axis: {reason}")]
    Acquire {
        axis: Axis,
        pin: String,
        reason: String,
    },
    #[error("writing duty cycle {duty_cycle}ns to the {axis} axis failed: {reason}")]
    Write {
        axis: Axis,
        duty_cycle: u32,
        reason: String,
    },
    #[error("releasing the {axis} axis pin failed: {reason}")]
    Release { axis: Axis, reason: String },
}

impl ActuationError {
    /// The axis the failure happened on.
    pub fn axis(&self) -> Axis {
        match self {
            ActuationError::Acquire { axis, .. }
            | ActuationError::Write { axis, .. }
            | ActuationError::Release { axis, .. } => *axis,
        }
    }
}

/// A configuration value that can never produce a working turret.
#[derive(Debug, Error)]
#[error("invalid configuration for `{field}`: {reason}")]
pub struct ConfigurationError {
    pub field: &'static str,
    pub reason: String,
}

impl ConfigurationError {
    pub fn new(field: &'static str, reason: impl Into<String>) -> Self {
        Self {
            field,
            reason: reason.into(),
        }
    }
}

/// Umbrella error for the turret's public API.
#[derive(Debug, Error)]
pub enum TurretError {
    #[error(transparent)]
    Device(#[from] DeviceError),
    #[error(transparent)]
    FrameProcessing(#[from] FrameProcessingError),
    #[error(transparent)]
    Actuation(#[from] ActuationError),
    #[error(transparent)]
    Configuration(#[from] ConfigurationError),
    #[error("control loop has already stopped")]
    Stopped,
}

pub type Result<T> = std::result::Result<T, TurretError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn actuation_error_reports_its_axis() {
        let err = ActuationError::Write {
            axis: Axis::Tilt,
            duty_cycle: 450_000,
            reason: "EIO".into(),
        };
        assert_eq!(err.axis(), Axis::Tilt);
        assert!(err.to_string().contains("tilt"));
    }

    #[test]
    fn turret_error_is_transparent_over_its_sources() {
        let err: TurretError = ConfigurationError::new("min_area", "must be positive").into();
        assert_eq!(
            err.to_string(),
            "invalid configuration for `min_area`: must be positive"
        );
    }
}
