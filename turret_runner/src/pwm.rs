// THEORY:
// Linux exposes hardware PWM channels as files: writing a channel number to
// `pwmchipN/export` creates `pwmchipN/pwmM/`, whose `period`, `duty_cycle` and `enable`
// files drive the output. `SysfsPwmPin` is a thin `PwmPin` over those files. The root
// directory is a parameter so tests can point it at a scratch tree.

use std::fs;
use std::path::{Path, PathBuf};
use std::thread;
use std::time::Duration;

use tracing::{debug, info, warn};

use turret_vision::error::{ActuationError, Axis};
use turret_vision::PwmPin;

pub const SYSFS_PWM_ROOT: &str = "/sys/class/pwm";

// udev needs a moment to create and chown a freshly exported channel.
const EXPORT_POLL_ATTEMPTS: u32 = 20;
const EXPORT_POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Parses a pin identifier, either `"N:M"` or `"pwmchipN/M"`, into `(chip, channel)`.
pub fn parse_pin_id(id: &str) -> Option<(u32, u32)> {
    let (chip, channel) = match id.strip_prefix("pwmchip") {
        Some(rest) => rest.split_once('/')?,
        None => id.split_once(':')?,
    };
    Some((chip.trim().parse().ok()?, channel.trim().parse().ok()?))
}

/// One exported sysfs PWM channel.
#[derive(Debug)]
pub struct SysfsPwmPin {
    axis: Axis,
    chip_dir: PathBuf,
    channel: u32,
    released: bool,
}

impl SysfsPwmPin {
    pub fn acquire(id: &str, axis: Axis, period_ns: u32) -> Result<Self, ActuationError> {
        Self::acquire_under(Path::new(SYSFS_PWM_ROOT), id, axis, period_ns)
    }

    /// Exports, configures and enables the channel `id` under `root`.
    pub fn acquire_under(
        root: &Path,
        id: &str,
        axis: Axis,
        period_ns: u32,
    ) -> Result<Self, ActuationError> {
        let acquire_err = |reason: String| ActuationError::Acquire {
            axis,
            pin: id.to_string(),
            reason,
        };
        let (chip, channel) = parse_pin_id(id)
            .ok_or_else(|| acquire_err("expected \"N:M\" or \"pwmchipN/M\"".to_string()))?;

        let chip_dir = root.join(format!("pwmchip{chip}"));
        if !chip_dir.is_dir() {
            return Err(acquire_err(format!("{} does not exist", chip_dir.display())));
        }

        let channel_dir = chip_dir.join(format!("pwm{channel}"));
        if !channel_dir.is_dir() {
            write_attr(&chip_dir.join("export"), channel).map_err(acquire_err)?;
            let mut attempts = 0;
            while !channel_dir.is_dir() {
                attempts += 1;
                if attempts >= EXPORT_POLL_ATTEMPTS {
                    return Err(acquire_err(format!(
                        "{} did not appear after export",
                        channel_dir.display()
                    )));
                }
                thread::sleep(EXPORT_POLL_INTERVAL);
            }
        }

        write_attr(&channel_dir.join("period"), period_ns).map_err(acquire_err)?;
        write_attr(&channel_dir.join("duty_cycle"), 0).map_err(acquire_err)?;
        write_attr(&channel_dir.join("enable"), 1).map_err(acquire_err)?;
        info!(%axis, pin = id, period_ns, "pwm channel enabled");

        Ok(Self {
            axis,
            chip_dir,
            channel,
            released: false,
        })
    }

    fn channel_dir(&self) -> PathBuf {
        self.chip_dir.join(format!("pwm{}", self.channel))
    }
}

impl PwmPin for SysfsPwmPin {
    fn set_duty_cycle(&mut self, duty_cycle_ns: u32) -> Result<(), ActuationError> {
        write_attr(&self.channel_dir().join("duty_cycle"), duty_cycle_ns).map_err(|reason| {
            ActuationError::Write {
                axis: self.axis,
                duty_cycle: duty_cycle_ns,
                reason,
            }
        })
    }

    fn release(&mut self) -> Result<(), ActuationError> {
        if self.released {
            return Ok(());
        }
        self.released = true;
        let release_err = |reason| ActuationError::Release {
            axis: self.axis,
            reason,
        };
        let disabled = write_attr(&self.channel_dir().join("enable"), 0).map_err(release_err);
        let unexported = write_attr(&self.chip_dir.join("unexport"), self.channel).map_err(release_err);
        debug!(axis = %self.axis, channel = self.channel, "pwm channel released");
        disabled.and(unexported)
    }
}

impl Drop for SysfsPwmPin {
    fn drop(&mut self) {
        if let Err(e) = self.release() {
            warn!(error = %e, "could not release pwm channel on drop");
        }
    }
}

fn write_attr(path: &Path, value: impl ToString) -> Result<(), String> {
    fs::write(path, value.to_string()).map_err(|e| format!("{}: {e}", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn read(path: PathBuf) -> String {
        fs::read_to_string(path).unwrap()
    }

    #[test]
    fn pin_ids() {
        assert_eq!(parse_pin_id("0:1"), Some((0, 1)));
        assert_eq!(parse_pin_id("pwmchip2/3"), Some((2, 3)));
        assert_eq!(parse_pin_id("pwmchip2"), None);
        assert_eq!(parse_pin_id("GPIO18"), None);
        assert_eq!(parse_pin_id("a:b"), None);
    }

    #[test]
    fn exported_channel_is_configured_driven_and_released() {
        let root = tempfile::tempdir().unwrap();
        let channel = root.path().join("pwmchip0/pwm1");
        fs::create_dir_all(&channel).unwrap();

        let mut pin = SysfsPwmPin::acquire_under(root.path(), "0:1", Axis::Tilt, 20_000_000).unwrap();
        assert_eq!(read(channel.join("period")), "20000000");
        assert_eq!(read(channel.join("enable")), "1");

        pin.set_duty_cycle(1_400_000).unwrap();
        assert_eq!(read(channel.join("duty_cycle")), "1400000");

        pin.release().unwrap();
        assert_eq!(read(channel.join("enable")), "0");
        assert_eq!(read(root.path().join("pwmchip0/unexport")), "1");
        pin.release().unwrap();
    }

    #[test]
    fn missing_chip_fails_to_acquire() {
        let root = tempfile::tempdir().unwrap();
        let err = SysfsPwmPin::acquire_under(root.path(), "pwmchip4/0", Axis::Pan, 20_000_000)
            .unwrap_err();
        assert!(matches!(err, ActuationError::Acquire { axis: Axis::Pan, .. }));
    }

    #[test]
    fn unexported_channel_is_requested_from_the_chip() {
        let root = tempfile::tempdir().unwrap();
        fs::create_dir_all(root.path().join("pwmchip0")).unwrap();

        // Nothing creates the channel directory here, so the export times out.
        let result = SysfsPwmPin::acquire_under(root.path(), "0:0", Axis::Pan, 20_000_000);
        assert!(result.is_err());
        assert_eq!(read(root.path().join("pwmchip0/export")), "0");
    }

    #[test]
    fn malformed_id_fails_to_acquire() {
        let root = tempfile::tempdir().unwrap();
        let err = SysfsPwmPin::acquire_under(root.path(), "left", Axis::Pan, 20_000_000)
            .unwrap_err();
        assert!(err.to_string().contains("left"));
    }
}
