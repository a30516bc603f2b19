// THEORY:
// The `AngleMapper` projects the target centre onto the two servo axes. With the
// camera looking along the turret's axis, the angle to a pixel is the arctangent of
// its offset scaled by a calibration `distance` that folds lens field-of-view and
// mounting geometry into one number. Bias offsets then correct for how the servo horns
// were fitted. The tilt axis is inverted: image Y grows downward, servo tilt grows
// upward.
//
// Fractional degrees are meaningless to a hobby servo, so angles truncate toward zero
// and are clamped to the servo's [0, 180] travel on both ends.

use std::f64::consts::PI;

use crate::config::MappingConfig;
use crate::core_modules::region::Region;

/// A servo angle in whole degrees, always within `[0, 180]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Angle(u8);

impl Angle {
    pub const MIN: Angle = Angle(0);
    pub const MAX: Angle = Angle(180);

    /// Clamps any signed degree value into the servo's travel.
    pub fn clamped(degrees: i64) -> Self {
        Angle(degrees.clamp(0, 180) as u8)
    }

    pub fn degrees(self) -> u8 {
        self.0
    }
}

impl From<Angle> for u32 {
    fn from(angle: Angle) -> Self {
        angle.0 as u32
    }
}

/// Converts working-frame regions into pan/tilt angles.
#[derive(Debug, Clone)]
pub struct AngleMapper {
    config: MappingConfig,
    working_size: u32,
}

impl AngleMapper {
    pub fn new(config: MappingConfig, working_size: u32) -> Self {
        Self {
            config,
            working_size,
        }
    }

    /// Maps the centre of `region` to `(pan, tilt)`.
    pub fn map_to_angles(&self, region: &Region) -> (Angle, Angle) {
        let center = region.center();
        let size = self.working_size as i64;

        let pan = angle_from_pixel(center.x as i64, size, self.config.distance)
            + self.config.pan_bias as i64;
        let tilt = angle_from_pixel(size - center.y as i64, size, self.config.distance)
            - self.config.tilt_bias as i64;

        (Angle::clamped(pan), Angle::clamped(tilt))
    }

    pub fn working_size(&self) -> u32 {
        self.working_size
    }
}

/// `atan(pixel * distance / size)` in degrees, truncated toward zero.
fn angle_from_pixel(pixel: i64, size: i64, distance: f64) -> i64 {
    if size == 0 {
        return 0;
    }
    ((pixel as f64 * distance / size as f64).atan() * 180.0 / PI).trunc() as i64
}
