// THEORY:
// A hobby servo reads its target angle from the width of a PWM pulse. The `Actuator`
// owns one PWM pin per axis and is the only code that ever writes to them. Its job is
// small but safety-critical: turn degrees into nanoseconds linearly across the
// calibrated pulse range, and make it impossible to emit a pulse outside that range.
//
// Pins are external collaborators behind `PwmPin`. A write is never retried here; the
// failure is returned to the caller, which decides how many failures it tolerates.

use std::sync::{Arc, Mutex};

use tracing::{debug, info};

use crate::config::DutyCycleRange;
use crate::core_modules::angle_mapper::Angle;
use crate::error::{ActuationError, Axis};

/// A PWM-capable output pin driving one servo.
pub trait PwmPin: Send {
    /// Sets the pulse width in nanoseconds. May block briefly.
    fn set_duty_cycle(&mut self, duty_cycle_ns: u32) -> Result<(), ActuationError>;

    /// Disables the output and gives the pin back to the platform.
    fn release(&mut self) -> Result<(), ActuationError>;
}

/// Converts `angle` degrees to a pulse width. Angles above 180 are treated as 180.
pub fn calc_duty_cycle(angle: u32, range: DutyCycleRange) -> u32 {
    let angle = angle.min(180);
    let span = (range.max - range.min) as f64;
    (angle as f64 / 180.0 * span).round() as u32 + range.min
}

/// Owns the pan and tilt pins and writes calibrated pulses to them.
pub struct Actuator {
    pan: Box<dyn PwmPin>,
    tilt: Box<dyn PwmPin>,
    range: DutyCycleRange,
    released: bool,
}

impl Actuator {
    pub fn new(pan: Box<dyn PwmPin>, tilt: Box<dyn PwmPin>, range: DutyCycleRange) -> Self {
        Self {
            pan,
            tilt,
            range,
            released: false,
        }
    }

    /// Drives `axis` to `angle` and returns the pulse width that was written.
    pub fn actuate(&mut self, axis: Axis, angle: Angle) -> Result<u32, ActuationError> {
        let duty_cycle = calc_duty_cycle(angle.into(), self.range);
        if self.released {
            return Err(ActuationError::Write {
                axis,
                duty_cycle,
                reason: "pin has been released".to_string(),
            });
        }
        let pin = match axis {
            Axis::Pan => &mut self.pan,
            Axis::Tilt => &mut self.tilt,
        };
        pin.set_duty_cycle(duty_cycle)?;
        debug!(%axis, angle = angle.degrees(), duty_cycle, "actuated");
        Ok(duty_cycle)
    }

    /// Moves both axes to 0 degrees.
    pub fn zero(&mut self) -> Result<(), ActuationError> {
        self.actuate(Axis::Pan, Angle::MIN)?;
        self.actuate(Axis::Tilt, Angle::MIN)?;
        info!("actuators zeroed");
        Ok(())
    }

    /// Releases both pins, attempting the second even if the first fails.
    pub fn release(&mut self) -> Result<(), ActuationError> {
        if self.released {
            return Ok(());
        }
        self.released = true;
        let pan = self.pan.release();
        let tilt = self.tilt.release();
        pan.and(tilt)
    }

    pub fn range(&self) -> DutyCycleRange {
        self.range
    }
}

/// What a [`RecordingPin`] has seen.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PinLog {
    pub duty_cycles: Vec<u32>,
    pub released: bool,
}

/// An in-memory pin that records every pulse width. Used for dry runs and tests.
///
/// Clones share the same log, so a test can keep one handle while the actuator owns
/// the other.
#[derive(Debug, Clone)]
pub struct RecordingPin {
    axis: Axis,
    log: Arc<Mutex<PinLog>>,
    fail_writes: Arc<Mutex<u32>>,
}

impl RecordingPin {
    pub fn new(axis: Axis) -> Self {
        Self {
            axis,
            log: Arc::new(Mutex::new(PinLog::default())),
            fail_writes: Arc::new(Mutex::new(0)),
        }
    }

    /// A snapshot of everything written so far.
    pub fn log(&self) -> PinLog {
        self.log.lock().map(|log| log.clone()).unwrap_or_default()
    }

    /// Makes the next `count` writes fail.
    pub fn fail_next_writes(&self, count: u32) {
        if let Ok(mut remaining) = self.fail_writes.lock() {
            *remaining = count;
        }
    }
}

impl PwmPin for RecordingPin {
    fn set_duty_cycle(&mut self, duty_cycle_ns: u32) -> Result<(), ActuationError> {
        let injected = match self.fail_writes.lock() {
            Ok(mut remaining) if *remaining > 0 => {
                *remaining -= 1;
                true
            }
            _ => false,
        };
        if injected {
            return Err(ActuationError::Write {
                axis: self.axis,
                duty_cycle: duty_cycle_ns,
                reason: "injected failure".to_string(),
            });
        }
        let mut log = self.log.lock().map_err(|_| ActuationError::Write {
            axis: self.axis,
            duty_cycle: duty_cycle_ns,
            reason: "pin log poisoned".to_string(),
        })?;
        log.duty_cycles.push(duty_cycle_ns);
        Ok(())
    }

    fn release(&mut self) -> Result<(), ActuationError> {
        let mut log = self.log.lock().map_err(|_| ActuationError::Release {
            axis: self.axis,
            reason: "pin log poisoned".to_string(),
        })?;
        log.released = true;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn actuator() -> (Actuator, RecordingPin, RecordingPin) {
        let pan = RecordingPin::new(Axis::Pan);
        let tilt = RecordingPin::new(Axis::Tilt);
        let actuator = Actuator::new(
            Box::new(pan.clone()),
            Box::new(tilt.clone()),
            DutyCycleRange::default(),
        );
        (actuator, pan, tilt)
    }

    #[test]
    fn duty_cycle_boundaries() {
        let range = DutyCycleRange::default();
        assert_eq!(calc_duty_cycle(0, range), range.min);
        assert_eq!(calc_duty_cycle(180, range), range.max);
        assert_eq!(calc_duty_cycle(200, range), calc_duty_cycle(180, range));
        assert_eq!(calc_duty_cycle(90, range), 1_400_000);
    }

    #[test]
    fn duty_cycle_stays_in_range_for_every_angle() {
        let range = DutyCycleRange::default();
        let mut previous = 0;
        for angle in 0..=255 {
            let dc = calc_duty_cycle(angle, range);
            assert!(dc >= range.min && dc <= range.max);
            assert!(dc >= previous);
            previous = dc;
        }
    }

    #[test]
    fn actuate_writes_to_the_right_pin() {
        let (mut actuator, pan, tilt) = actuator();
        let written = actuator.actuate(Axis::Tilt, Angle::MAX).unwrap();
        assert_eq!(written, 2_350_000);
        assert!(pan.log().duty_cycles.is_empty());
        assert_eq!(tilt.log().duty_cycles, vec![2_350_000]);
    }

    #[test]
    fn zero_moves_both_axes_to_min() {
        let (mut actuator, pan, tilt) = actuator();
        actuator.zero().unwrap();
        assert_eq!(pan.log().duty_cycles, vec![450_000]);
        assert_eq!(tilt.log().duty_cycles, vec![450_000]);
    }

    #[test]
    fn write_failure_is_reported_for_the_axis() {
        let (mut actuator, pan, _) = actuator();
        pan.fail_next_writes(1);
        let err = actuator.actuate(Axis::Pan, Angle::clamped(45)).unwrap_err();
        assert_eq!(err.axis(), Axis::Pan);
        assert!(actuator.actuate(Axis::Pan, Angle::clamped(45)).is_ok());
    }

    #[test]
    fn released_actuator_refuses_writes() {
        let (mut actuator, pan, tilt) = actuator();
        actuator.release().unwrap();
        assert!(pan.log().released && tilt.log().released);
        assert!(actuator.actuate(Axis::Pan, Angle::MIN).is_err());
        // Releasing twice is harmless.
        actuator.release().unwrap();
    }
}
