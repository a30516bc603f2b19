// THEORY:
// The `Turret` is the actuation half of the system. The control loop hands it every
// located target through the `TargetHandler` trait; the turret decides whether to move
// (debouncer), where to move (angle mapper) and then moves (actuator). Keeping this
// behind a trait lets the loop drive a real turret, a dry-run turret, or a test double
// without knowing which.

use std::time::Instant;

use image::RgbImage;
use tracing::info;

use crate::config::TurretConfig;
use crate::core_modules::actuator::Actuator;
use crate::core_modules::angle_mapper::{Angle, AngleMapper};
use crate::core_modules::debouncer::{DebounceDecision, TargetDebouncer};
use crate::core_modules::region::Region;
use crate::error::{ActuationError, Axis};

/// What happened to a target handed to a [`TargetHandler`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TargetOutcome {
    /// Both axes were driven to the given angles.
    Actuated { pan: Angle, tilt: Angle },
    /// The debouncer rejected the target.
    Debounced(DebounceDecision),
}

/// Receives every target the localizer finds.
pub trait TargetHandler: Send {
    /// Reacts to `region`, found in `frame` at `now`.
    fn on_target(
        &mut self,
        region: &Region,
        frame: &RgbImage,
        now: Instant,
    ) -> Result<TargetOutcome, ActuationError>;

    /// Called once when the loop starts; moves the hardware to a known pose.
    fn home(&mut self) -> Result<(), ActuationError>;

    /// Called once when the loop drains; releases the hardware.
    fn release(&mut self) -> Result<(), ActuationError>;
}

/// Debounce, map and actuate: the pan/tilt turret.
pub struct Turret {
    debouncer: TargetDebouncer,
    mapper: AngleMapper,
    actuator: Actuator,
}

impl Turret {
    pub fn new(debouncer: TargetDebouncer, mapper: AngleMapper, actuator: Actuator) -> Self {
        Self {
            debouncer,
            mapper,
            actuator,
        }
    }

    /// Builds a turret from configuration around an already-acquired actuator.
    pub fn from_config(config: &TurretConfig, actuator: Actuator) -> Self {
        Self::new(
            TargetDebouncer::new(config.cooldown),
            AngleMapper::new(config.mapping.clone(), config.motion.working_size),
            actuator,
        )
    }

    pub fn debouncer(&self) -> &TargetDebouncer {
        &self.debouncer
    }
}

impl TargetHandler for Turret {
    fn on_target(
        &mut self,
        region: &Region,
        _frame: &RgbImage,
        now: Instant,
    ) -> Result<TargetOutcome, ActuationError> {
        let decision = self.debouncer.evaluate(region, now);
        if decision != DebounceDecision::Accepted {
            return Ok(TargetOutcome::Debounced(decision));
        }

        let center = region.center();
        let (pan, tilt) = self.mapper.map_to_angles(region);
        info!(
            x = center.x,
            y = center.y,
            pan = pan.degrees(),
            tilt = tilt.degrees(),
            "aiming at target"
        );
        self.actuator.actuate(Axis::Tilt, tilt)?;
        self.actuator.actuate(Axis::Pan, pan)?;
        Ok(TargetOutcome::Actuated { pan, tilt })
    }

    fn home(&mut self) -> Result<(), ActuationError> {
        self.actuator.zero()
    }

    fn release(&mut self) -> Result<(), ActuationError> {
        self.actuator.release()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DutyCycleRange;
    use crate::core_modules::actuator::RecordingPin;
    use std::time::Duration;

    fn turret(cooldown_ms: u64) -> (Turret, RecordingPin, RecordingPin) {
        let pan = RecordingPin::new(Axis::Pan);
        let tilt = RecordingPin::new(Axis::Tilt);
        let mut config = TurretConfig::default();
        config.cooldown = Duration::from_millis(cooldown_ms);
        let actuator = Actuator::new(
            Box::new(pan.clone()),
            Box::new(tilt.clone()),
            DutyCycleRange::default(),
        );
        (Turret::from_config(&config, actuator), pan, tilt)
    }

    #[test]
    fn accepted_target_moves_both_axes() {
        let (mut turret, pan, tilt) = turret(10);
        let frame = RgbImage::new(500, 500);
        let outcome = turret
            .on_target(&Region::new(240, 240, 260, 260), &frame, Instant::now())
            .unwrap();
        assert_eq!(
            outcome,
            TargetOutcome::Actuated {
                pan: Angle::clamped(104),
                tilt: Angle::clamped(21),
            }
        );
        assert_eq!(pan.log().duty_cycles.len(), 1);
        assert_eq!(tilt.log().duty_cycles.len(), 1);
    }

    #[test]
    fn repeated_target_within_cooldown_does_not_actuate() {
        let (mut turret, pan, _) = turret(10);
        let frame = RgbImage::new(500, 500);
        let region = Region::new(100, 100, 200, 200);
        let t1 = Instant::now();
        turret.on_target(&region, &frame, t1).unwrap();
        let outcome = turret
            .on_target(&region, &frame, t1 + Duration::from_millis(5))
            .unwrap();
        assert_eq!(
            outcome,
            TargetOutcome::Debounced(DebounceDecision::CoolingDown)
        );
        assert_eq!(pan.log().duty_cycles.len(), 1);
    }

    #[test]
    fn home_zeroes_and_release_frees_pins() {
        let (mut turret, pan, tilt) = turret(10);
        turret.home().unwrap();
        turret.release().unwrap();
        assert_eq!(pan.log().duty_cycles, vec![450_000]);
        assert!(tilt.log().released);
    }
}
