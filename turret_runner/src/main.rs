// THEORY:
// The `turret` binary is the process boundary. It turns flags into a validated
// `TurretConfig`, acquires the hardware in a fixed order (camera first, then the two
// PWM channels), and hands everything to the core's `ControlLoop` on a dedicated
// blocking worker. The async side only waits: for SIGINT/SIGTERM, for the loop to end
// on its own, and (when streaming) for HTTP viewers.
//
// Anything that fails before the loop starts is fatal and exits non-zero. A shutdown
// signal drains the loop and exits cleanly. A source that runs out does not end the
// process: it keeps serving the last state until the signal arrives. A lost device or
// repeated actuation failures exit non-zero without waiting.

#[cfg(feature = "opencv")]
mod camera;
mod logging;
#[cfg_attr(not(feature = "opencv"), allow(dead_code))]
mod net;
mod pwm;

use std::path::PathBuf;
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, ValueEnum};
use tracing::{info, warn};

use turret_vision::config::TurretConfig;
use turret_vision::pipeline::EndReason;
use turret_vision::{
    Actuator, Axis, ControlLoop, DirectorySource, FrameSource, Localizer, MotionLocalizer,
    RecordingPin, Turret, cancellation, spawn_control_loop,
};
use turret_visualizer::FrameBus;

use crate::pwm::SysfsPwmPin;

// Packets a viewer may fall behind before it starts skipping frames.
const STREAM_CAPACITY: usize = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum DetectorKind {
    /// Background subtraction against the first frame.
    Motion,
    /// A pretrained SSD object detector.
    Net,
}

#[derive(Debug, Parser)]
#[command(name = "turret", author, version, about = "Motion-tracking pan/tilt turret")]
struct Cli {
    /// Camera device index.
    #[arg(long, env = "TURRET_DEVICE", default_value_t = 0)]
    device: i32,

    /// Minimum moving area, in working-frame pixels, that counts as a target [default: 7000].
    #[arg(long, env = "TURRET_AREA")]
    area: Option<f64>,

    /// Serve the frame, delta and threshold streams over HTTP.
    #[arg(long, env = "TURRET_STREAM", default_value_t = true, action = clap::ArgAction::Set)]
    stream: bool,

    /// Address the streams are served on.
    #[arg(long, env = "TURRET_LISTEN", default_value = "0.0.0.0:8080")]
    listen: String,

    /// Replay the images in this directory instead of opening a camera.
    #[arg(long, env = "TURRET_FRAMES_DIR")]
    frames_dir: Option<PathBuf>,

    /// Pan servo PWM channel, "N:M" or "pwmchipN/M".
    #[arg(long, env = "TURRET_PAN_PIN", default_value = "0:0")]
    pan_pin: String,

    /// Tilt servo PWM channel, "N:M" or "pwmchipN/M".
    #[arg(long, env = "TURRET_TILT_PIN", default_value = "0:1")]
    tilt_pin: String,

    /// Camera-to-scene calibration factor [default: 1.35].
    #[arg(long, env = "TURRET_DISTANCE")]
    distance: Option<f64>,

    /// Minimum time between two actuations, in milliseconds [default: 50].
    #[arg(long, env = "TURRET_COOLDOWN_MS")]
    cooldown_ms: Option<u64>,

    #[arg(long, env = "TURRET_DETECTOR", value_enum, default_value_t = DetectorKind::Motion)]
    detector: DetectorKind,

    /// Network weights for `--detector net`.
    #[arg(long, env = "TURRET_MODEL")]
    model: Option<PathBuf>,

    /// Network description for `--detector net`, when the weights need one.
    #[arg(long, env = "TURRET_MODEL_CONFIG")]
    model_config: Option<PathBuf>,

    /// Record duty cycles in memory instead of driving the PWM channels.
    #[arg(long, env = "TURRET_DRY_RUN")]
    dry_run: bool,
}

impl Cli {
    fn config(&self) -> TurretConfig {
        let mut config = TurretConfig::default();
        if let Some(area) = self.area {
            config.motion.min_area = area;
        }
        if let Some(distance) = self.distance {
            config.mapping.distance = distance;
        }
        if let Some(ms) = self.cooldown_ms {
            config.cooldown = Duration::from_millis(ms);
        }
        config.pwm.pan_pin = self.pan_pin.clone();
        config.pwm.tilt_pin = self.tilt_pin.clone();
        config
    }
}

#[tokio::main(flavor = "multi_thread")]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    logging::init_logging();

    // --- 1. Configuration ---
    let config = cli.config();
    config.validate().context("invalid configuration")?;
    let (cancel, token) = cancellation();

    // --- 2. Streaming ---
    let bus = cli.stream.then(|| FrameBus::new(STREAM_CAPACITY));
    #[cfg(feature = "web")]
    let server = match &bus {
        Some(bus) => {
            let cfg = turret_visualizer::ServerConfig {
                bind_addr: cli.listen.clone(),
            };
            let server = turret_visualizer::start_server(bus.clone(), cfg, token.clone()).await?;
            for stream in turret_visualizer::Stream::ALL {
                info!("streaming http://{}{}", server.local_addr, stream.path());
            }
            Some(server)
        }
        None => None,
    };
    #[cfg(not(feature = "web"))]
    if bus.is_some() {
        warn!(listen = %cli.listen, "built without the `web` feature, streams are not served");
    }

    // --- 3. Hardware, in acquisition order ---
    let mut source = open_source(&cli)?;
    let assembled = build_localizer(&cli, &config, &mut source)
        .and_then(|localizer| Ok((localizer, open_actuator(&cli, &config)?)));
    let (localizer, actuator) = match assembled {
        Ok(parts) => parts,
        Err(e) => {
            if let Err(close_err) = source.close() {
                warn!(error = %close_err, "could not close frame source");
            }
            return Err(e);
        }
    };
    let turret = Turret::from_config(&config, actuator);
    let mut control_loop = ControlLoop::new(
        source,
        localizer,
        turret,
        config.max_consecutive_actuation_failures,
    )
    .context("could not home the turret")?;
    if let Some(bus) = bus {
        control_loop = control_loop.with_sink(Box::new(bus));
    }

    // --- 4. Run until the loop ends or a signal arrives ---
    let mut worker = spawn_control_loop(control_loop, token);
    let mut signalled = false;
    let joined = tokio::select! {
        joined = &mut worker => joined,
        () = shutdown_signal() => {
            info!("shutdown requested, draining");
            signalled = true;
            cancel.cancel();
            worker.await
        }
    };

    // --- 5. Hold the streams open until a signal, then exit ---
    let outcome = match joined
        .context("control loop worker panicked")
        .and_then(|drained| drained.context("control loop failed to drain"))
    {
        Ok(summary) => {
            info!(
                frames = summary.frames_processed,
                skipped = summary.frames_skipped,
                detections = summary.detections,
                actuations = summary.actuations,
                debounced = summary.debounced,
                actuation_failures = summary.actuation_failures,
                end_reason = ?summary.end_reason,
                "turret stopped"
            );
            await_exit(summary.end_reason, signalled, shutdown_signal()).await
        }
        Err(e) => Err(e),
    };
    cancel.cancel();

    #[cfg(feature = "web")]
    if let Some(server) = server {
        if let Err(e) = server.task.await {
            warn!(error = %e, "visualizer task ended abnormally");
        }
    }

    outcome
}

/// Decides how the process ends once the loop has stopped.
///
/// A lost device or a run of failed actuations exits non-zero at once. A source that
/// simply ran out keeps the process, and its streams, alive until `signal` resolves.
async fn await_exit(
    end_reason: Option<EndReason>,
    signalled: bool,
    signal: impl Future<Output = ()>,
) -> anyhow::Result<()> {
    match end_reason {
        Some(EndReason::DeviceLost(reason)) => anyhow::bail!("frame source lost: {reason}"),
        Some(EndReason::ActuationFailures(count)) => {
            anyhow::bail!("{count} consecutive actuation failures")
        }
        Some(EndReason::Exhausted) if !signalled => {
            info!("frame source exhausted, waiting for a shutdown signal");
            signal.await;
            Ok(())
        }
        _ => Ok(()),
    }
}

fn open_source(cli: &Cli) -> anyhow::Result<Box<dyn FrameSource>> {
    if let Some(dir) = &cli.frames_dir {
        let source = DirectorySource::open(dir)
            .with_context(|| format!("could not open frame directory {}", dir.display()))?;
        info!(frames = source.len(), dir = %dir.display(), "replaying frames");
        return Ok(Box::new(source));
    }
    open_camera(cli.device)
}

#[cfg(feature = "opencv")]
fn open_camera(device: i32) -> anyhow::Result<Box<dyn FrameSource>> {
    let camera = camera::CameraSource::open(device).context("could not open the camera")?;
    Ok(Box::new(camera))
}

#[cfg(not(feature = "opencv"))]
fn open_camera(device: i32) -> anyhow::Result<Box<dyn FrameSource>> {
    anyhow::bail!(
        "camera {device} needs a build with the `opencv` feature; use --frames-dir to replay images"
    )
}

fn build_localizer(
    cli: &Cli,
    config: &TurretConfig,
    source: &mut Box<dyn FrameSource>,
) -> anyhow::Result<Box<dyn Localizer>> {
    match cli.detector {
        DetectorKind::Motion => {
            let localizer = MotionLocalizer::from_source(source, config.motion.clone())
                .context("could not capture the background reference")?;
            Ok(Box::new(localizer))
        }
        DetectorKind::Net => open_net_localizer(cli, config),
    }
}

#[cfg(feature = "opencv")]
fn open_net_localizer(cli: &Cli, config: &TurretConfig) -> anyhow::Result<Box<dyn Localizer>> {
    let model = cli
        .model
        .as_deref()
        .context("--detector net needs --model")?;
    let detector = net::OpenCvDetector::open(model, cli.model_config.as_deref())
        .with_context(|| format!("could not load {}", model.display()))?;
    Ok(Box::new(turret_vision::NetLocalizer::new(
        detector,
        config.motion.working_size,
    )))
}

#[cfg(not(feature = "opencv"))]
fn open_net_localizer(_cli: &Cli, _config: &TurretConfig) -> anyhow::Result<Box<dyn Localizer>> {
    anyhow::bail!("--detector net needs a build with the `opencv` feature")
}

fn open_actuator(cli: &Cli, config: &TurretConfig) -> anyhow::Result<Actuator> {
    if cli.dry_run {
        info!("dry run, duty cycles are recorded but not written");
        return Ok(Actuator::new(
            Box::new(RecordingPin::new(Axis::Pan)),
            Box::new(RecordingPin::new(Axis::Tilt)),
            config.duty_cycle,
        ));
    }

    let period = config.pwm.period_ns;
    let pan = SysfsPwmPin::acquire(&config.pwm.pan_pin, Axis::Pan, period)
        .context("could not acquire the pan servo")?;
    // Dropping `pan` on a failed tilt acquisition releases it.
    let tilt = SysfsPwmPin::acquire(&config.pwm.tilt_pin, Axis::Tilt, period)
        .context("could not acquire the tilt servo")?;
    Ok(Actuator::new(Box::new(pan), Box::new(tilt), config.duty_cycle))
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "could not listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{SignalKind, signal};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "could not listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {},
        () = terminate => {},
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn exhausted_source_waits_for_a_signal() {
        let (tx, rx) = tokio::sync::oneshot::channel::<()>();
        let exit = tokio::spawn(await_exit(Some(EndReason::Exhausted), false, async {
            let _ = rx.await;
        }));

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!exit.is_finished());

        tx.send(()).unwrap();
        exit.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn signalled_or_failed_runs_exit_without_waiting() {
        let never = std::future::pending::<()>;
        await_exit(Some(EndReason::Exhausted), true, never()).await.unwrap();
        await_exit(Some(EndReason::Cancelled), true, never()).await.unwrap();

        let lost = await_exit(Some(EndReason::DeviceLost("gone".into())), false, never()).await;
        assert!(lost.unwrap_err().to_string().contains("gone"));
        let failed = await_exit(Some(EndReason::ActuationFailures(5)), false, never()).await;
        assert!(failed.is_err());
    }

    #[test]
    fn flags_override_the_calibration() {
        let cli = Cli::try_parse_from([
            "turret",
            "--area",
            "9000",
            "--distance",
            "2.0",
            "--cooldown-ms",
            "10",
            "--pan-pin",
            "pwmchip1/0",
            "--stream",
            "false",
        ])
        .unwrap();
        assert!(!cli.stream);
        let config = cli.config();
        assert_eq!(config.motion.min_area, 9000.0);
        assert_eq!(config.mapping.distance, 2.0);
        assert_eq!(config.cooldown, Duration::from_millis(10));
        assert_eq!(config.pwm.pan_pin, "pwmchip1/0");
        config.validate().unwrap();
    }

    #[test]
    fn defaults_match_the_calibration() {
        let cli = Cli::try_parse_from(["turret"]).unwrap();
        assert!(cli.stream);
        assert_eq!(cli.listen, "0.0.0.0:8080");
        assert_eq!(cli.detector, DetectorKind::Motion);
        let config = cli.config();
        assert_eq!(config.motion.min_area, 7000.0);
        assert_eq!(config.cooldown, Duration::from_millis(50));
    }

    #[test]
    fn negative_area_is_rejected_by_validation() {
        let cli = Cli::try_parse_from(["turret", "--area=-1"]).unwrap();
        assert!(cli.config().validate().is_err());
    }

    #[test]
    fn dry_run_never_touches_sysfs() {
        let cli = Cli::try_parse_from(["turret", "--dry-run", "--pan-pin", "9:9"]).unwrap();
        let mut actuator = open_actuator(&cli, &cli.config()).unwrap();
        actuator.zero().unwrap();
        actuator.release().unwrap();
    }

    #[test]
    fn replayed_frames_feed_the_motion_localizer() {
        let dir = tempfile::tempdir().unwrap();
        for name in ["0.png", "1.png"] {
            image::RgbImage::new(50, 50).save(dir.path().join(name)).unwrap();
        }
        let cli = Cli::try_parse_from([
            "turret",
            "--frames-dir",
            dir.path().to_str().unwrap(),
        ])
        .unwrap();
        let mut source = open_source(&cli).unwrap();
        let localizer = build_localizer(&cli, &cli.config(), &mut source).unwrap();
        assert_eq!(localizer.working_size(), 500);
        assert!(source.read().unwrap().is_some());
        assert!(source.read().unwrap().is_none());
    }
}
