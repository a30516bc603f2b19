// THEORY:
// All calibration constants live here as plain data with `Default` values that match
// the reference hardware: a 500x500 working frame, hobby servos on a 50Hz PWM carrier
// with 0.45ms..2.35ms pulses, and a camera mounted so that a 1.35 distance factor maps
// the frame edge to the servo travel. Nothing in here is derived at runtime; a
// different camera or bracket means different numbers, not different code.

use std::time::Duration;

use crate::error::ConfigurationError;

/// Tuning for the background-subtraction motion localizer.
#[derive(Debug, Clone)]
pub struct MotionConfig {
    /// Frames are resized to `working_size x working_size` before any analysis.
    pub working_size: u32,
    /// Side of the Gaussian kernel used to suppress sensor noise. Must be odd.
    pub blur_kernel: u32,
    /// Intensity difference (0-255) above which a pixel counts as changed.
    pub threshold: u8,
    /// Number of 3x3 dilation passes applied to the threshold mask.
    pub dilate_iterations: u32,
    /// Regions must be strictly larger than this many pixels to be reported.
    pub min_area: f64,
}

impl MotionConfig {
    /// The Gaussian sigma OpenCV would derive for `blur_kernel` with sigma = 0.
    pub fn blur_sigma(&self) -> f32 {
        0.3 * ((self.blur_kernel as f32 - 1.0) * 0.5 - 1.0) + 0.8
    }
}

impl Default for MotionConfig {
    fn default() -> Self {
        Self {
            working_size: 500,
            blur_kernel: 21,
            threshold: 25,
            dilate_iterations: 1,
            min_area: 7000.0,
        }
    }
}

/// Pixel-to-angle projection parameters.
#[derive(Debug, Clone)]
pub struct MappingConfig {
    /// Camera-to-subject geometry factor, unitless.
    pub distance: f64,
    /// Degrees added to the pan angle to compensate for the mount.
    pub pan_bias: i32,
    /// Degrees subtracted from the tilt angle to compensate for the mount.
    pub tilt_bias: i32,
}

impl Default for MappingConfig {
    fn default() -> Self {
        Self {
            distance: 1.35,
            pan_bias: 70,
            tilt_bias: 13,
        }
    }
}

/// Servo pulse-width calibration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DutyCycleRange {
    /// Pulse width in nanoseconds for 0 degrees.
    pub min: u32,
    /// Pulse width in nanoseconds for 180 degrees.
    pub max: u32,
}

impl Default for DutyCycleRange {
    fn default() -> Self {
        Self {
            min: 450_000,
            max: 2_350_000,
        }
    }
}

/// Pin-level PWM settings shared by both axes.
#[derive(Debug, Clone)]
pub struct PwmConfig {
    /// PWM period in nanoseconds (20ms for standard hobby servos).
    pub period_ns: u32,
    /// Platform identifier of the pan servo pin.
    pub pan_pin: String,
    /// Platform identifier of the tilt servo pin.
    pub tilt_pin: String,
}

impl Default for PwmConfig {
    fn default() -> Self {
        Self {
            period_ns: 20_000_000,
            pan_pin: "0:0".to_string(),
            tilt_pin: "0:1".to_string(),
        }
    }
}

/// Everything the control loop needs to be tuned for a given rig.
#[derive(Debug, Clone)]
pub struct TurretConfig {
    pub motion: MotionConfig,
    pub mapping: MappingConfig,
    pub duty_cycle: DutyCycleRange,
    pub pwm: PwmConfig,
    /// Minimum time between two actuations.
    pub cooldown: Duration,
    /// Consecutive failed actuations after which the loop drains.
    pub max_consecutive_actuation_failures: u32,
}

impl Default for TurretConfig {
    fn default() -> Self {
        Self {
            motion: MotionConfig::default(),
            mapping: MappingConfig::default(),
            duty_cycle: DutyCycleRange::default(),
            pwm: PwmConfig::default(),
            cooldown: Duration::from_millis(50),
            max_consecutive_actuation_failures: 5,
        }
    }
}

impl TurretConfig {
    /// Rejects values that can never drive a working turret.
    pub fn validate(&self) -> Result<(), ConfigurationError> {
        let motion = &self.motion;
        if motion.working_size == 0 {
            return Err(ConfigurationError::new("working_size", "must be greater than zero"));
        }
        if motion.blur_kernel == 0 || motion.blur_kernel % 2 == 0 {
            return Err(ConfigurationError::new(
                "blur_kernel",
                format!("must be a positive odd number, got {}", motion.blur_kernel),
            ));
        }
        if !motion.min_area.is_finite() || motion.min_area < 0.0 {
            return Err(ConfigurationError::new(
                "min_area",
                format!("must be a non-negative number, got {}", motion.min_area),
            ));
        }

        let mapping = &self.mapping;
        if !mapping.distance.is_finite() || mapping.distance <= 0.0 {
            return Err(ConfigurationError::new(
                "distance",
                format!("must be a positive number, got {}", mapping.distance),
            ));
        }
        for (field, bias) in [("pan_bias", mapping.pan_bias), ("tilt_bias", mapping.tilt_bias)] {
            if !(0..=180).contains(&bias) {
                return Err(ConfigurationError::new(
                    field,
                    format!("must be within 0..=180 degrees, got {bias}"),
                ));
            }
        }

        if self.duty_cycle.min >= self.duty_cycle.max {
            return Err(ConfigurationError::new(
                "duty_cycle",
                format!(
                    "min ({}) must be below max ({})",
                    self.duty_cycle.min, self.duty_cycle.max
                ),
            ));
        }
        if self.duty_cycle.max > self.pwm.period_ns {
            return Err(ConfigurationError::new(
                "period_ns",
                format!(
                    "period {}ns is shorter than the max pulse {}ns",
                    self.pwm.period_ns, self.duty_cycle.max
                ),
            ));
        }
        if self.pwm.pan_pin.is_empty() || self.pwm.tilt_pin.is_empty() {
            return Err(ConfigurationError::new("pin", "pin identifiers must not be empty"));
        }
        if self.max_consecutive_actuation_failures == 0 {
            return Err(ConfigurationError::new(
                "max_consecutive_actuation_failures",
                "must allow at least one failure",
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        TurretConfig::default().validate().unwrap();
    }

    #[test]
    fn blur_sigma_matches_opencv_derivation() {
        let sigma = MotionConfig::default().blur_sigma();
        assert!((sigma - 3.5).abs() < 1e-6);
    }

    #[test]
    fn even_kernel_is_rejected() {
        let mut config = TurretConfig::default();
        config.motion.blur_kernel = 20;
        let err = config.validate().unwrap_err();
        assert_eq!(err.field, "blur_kernel");
    }

    #[test]
    fn inverted_duty_cycle_range_is_rejected() {
        let mut config = TurretConfig::default();
        config.duty_cycle = DutyCycleRange {
            min: 2_000_000,
            max: 1_000_000,
        };
        assert_eq!(config.validate().unwrap_err().field, "duty_cycle");
    }

    #[test]
    fn pulse_longer_than_period_is_rejected() {
        let mut config = TurretConfig::default();
        config.pwm.period_ns = 2_000_000;
        assert_eq!(config.validate().unwrap_err().field, "period_ns");
    }

    #[test]
    fn non_positive_distance_is_rejected() {
        let mut config = TurretConfig::default();
        config.mapping.distance = 0.0;
        assert_eq!(config.validate().unwrap_err().field, "distance");
    }
}
