// THEORY:
// Servos have a finite slew rate and a finite life. Camera frames arrive far faster
// than a servo can settle, and a static, already-centred target would otherwise be
// re-commanded on every frame. The `TargetDebouncer` is the gate in front of the
// actuators: it remembers the last target it let through and refuses anything that is
// either too soon after it or aimed at exactly the same pixel.

use std::time::{Duration, Instant};

use crate::core_modules::region::{Point, Region};

/// The last target that was acted upon.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Target {
    pub center: Point,
    pub timestamp: Instant,
}

/// Why a target was (or was not) let through.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DebounceDecision {
    Accepted,
    /// Less than the cooldown has passed since the last accepted target.
    CoolingDown,
    /// The target centre is identical to the last accepted one.
    Unchanged,
}

/// Suppresses repeated actuation for unchanged or too-recent targets.
#[derive(Debug, Clone)]
pub struct TargetDebouncer {
    min_interval: Duration,
    last_target: Option<Target>,
}

impl TargetDebouncer {
    pub fn new(min_interval: Duration) -> Self {
        Self {
            min_interval,
            last_target: None,
        }
    }

    /// Returns `true` and records the target if the turret should act on `region`.
    pub fn should_act(&mut self, region: &Region, now: Instant) -> bool {
        self.evaluate(region, now) == DebounceDecision::Accepted
    }

    /// Same as [`TargetDebouncer::should_act`], but says why a target was rejected.
    pub fn evaluate(&mut self, region: &Region, now: Instant) -> DebounceDecision {
        let center = region.center();
        if let Some(last) = self.last_target {
            // A `now` earlier than the last target counts as zero elapsed time.
            if now.saturating_duration_since(last.timestamp) < self.min_interval {
                return DebounceDecision::CoolingDown;
            }
            if last.center == center {
                return DebounceDecision::Unchanged;
            }
        }
        self.last_target = Some(Target {
            center,
            timestamp: now,
        });
        DebounceDecision::Accepted
    }

    pub fn last_target(&self) -> Option<&Target> {
        self.last_target.as_ref()
    }

    pub fn min_interval(&self) -> Duration {
        self.min_interval
    }
}
