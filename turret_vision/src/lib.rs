// THEORY:
// This file is the main entry point for the `turret_vision` library crate. It exposes
// the control loop (`pipeline`), its dedicated worker (`worker`), the calibration
// (`config`) and the error taxonomy (`error`). The individual stages of the loop live
// in `core_modules` and are public so that binaries can pick backends and tests can
// exercise each stage on its own.

pub mod config;
pub mod core_modules;
pub mod error;
pub mod pipeline;
pub mod worker;

pub use config::TurretConfig;
pub use core_modules::actuator::{Actuator, PwmPin, RecordingPin, calc_duty_cycle};
pub use core_modules::angle_mapper::{Angle, AngleMapper};
pub use core_modules::debouncer::TargetDebouncer;
pub use core_modules::frame::{DirectorySource, FrameBuffer, FrameSource};
pub use core_modules::localizer::{Localization, Localizer};
pub use core_modules::motion_localizer::MotionLocalizer;
pub use core_modules::net_localizer::{Detection, NetLocalizer, ObjectDetector};
pub use core_modules::region::{Point, Region};
pub use core_modules::turret::{TargetHandler, TargetOutcome, Turret};
pub use error::{Axis, TurretError};
pub use pipeline::{ControlLoop, LoopState, LoopSummary, PresentationSink, Report};
pub use worker::{CancelHandle, CancelToken, cancellation, spawn_control_loop};
