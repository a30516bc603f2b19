// THEORY:
// The visualizer is a `PresentationSink` that fans the control loop's images out to
// any number of HTTP viewers. The loop thread must never wait on a viewer, so every
// stream is a `broadcast` channel: a slow viewer lags and skips frames, the loop never
// notices. JPEG encoding is the only real cost on the loop thread and is skipped
// entirely for a stream nobody is watching.
//
// The colour frame is annotated here, not in the core: the loop hands over the frame
// untouched along with its report, and the bus draws the target rectangle onto its
// own copy before encoding.

use std::io::Cursor;
use std::sync::{Arc, Mutex};

use image::codecs::jpeg::JpegEncoder;
use image::{GrayImage, ImageBuffer, ImageResult, Pixel, PixelWithColorType, RgbImage};
use tokio::sync::{broadcast, watch};
use tracing::warn;

use turret_vision::core_modules::utils::image_helper::image_helper;
use turret_vision::pipeline::DebounceDecision;
use turret_vision::{PresentationSink, Region, Report, TargetOutcome};

#[cfg(feature = "web")]
mod server;
#[cfg(feature = "web")]
pub use server::{RunningServer, ServerConfig, start_server};

const DEFAULT_JPEG_QUALITY: u8 = 80;

/// The three image streams the loop produces.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stream {
    /// The working frame, with the current target outlined.
    Frame,
    /// The absolute difference against the background.
    Delta,
    /// The binary threshold mask.
    Thresh,
}

impl Stream {
    pub const ALL: [Stream; 3] = [Stream::Frame, Stream::Delta, Stream::Thresh];

    /// The URL path the stream is served under.
    pub fn path(self) -> &'static str {
        match self {
            Stream::Frame => "/frame",
            Stream::Delta => "/delta",
            Stream::Thresh => "/thresh",
        }
    }
}

/// One encoded JPEG image.
#[derive(Debug, Clone)]
pub struct FramePacket {
    pub frame_id: u64,
    pub width: u32,
    pub height: u32,
    pub data: Arc<[u8]>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[cfg_attr(feature = "web", derive(serde::Serialize, serde::Deserialize))]
pub struct MetaRegion {
    pub x0: u32,
    pub y0: u32,
    pub x1: u32,
    pub y1: u32,
}

impl From<Region> for MetaRegion {
    fn from(region: Region) -> Self {
        Self {
            x0: region.min_x,
            y0: region.min_y,
            x1: region.max_x,
            y1: region.max_y,
        }
    }
}

/// What the loop decided about the most recent frame, as served on `/meta`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
#[cfg_attr(feature = "web", derive(serde::Serialize, serde::Deserialize))]
pub struct TrackingMeta {
    pub frame_id: u64,
    pub status: String,
    pub region: Option<MetaRegion>,
    pub pan: Option<u8>,
    pub tilt: Option<u8>,
    pub debounce: Option<String>,
    pub failed_axis: Option<String>,
}

impl TrackingMeta {
    pub fn from_report(frame_id: u64, report: &Report) -> Self {
        let mut meta = TrackingMeta {
            frame_id,
            region: report.region().map(MetaRegion::from),
            ..Default::default()
        };
        meta.status = match report {
            Report::NoTarget => "no_target",
            Report::Target {
                outcome: TargetOutcome::Actuated { pan, tilt },
                ..
            } => {
                meta.pan = Some(pan.degrees());
                meta.tilt = Some(tilt.degrees());
                "actuated"
            }
            Report::Target {
                outcome: TargetOutcome::Debounced(decision),
                ..
            } => {
                meta.debounce = Some(
                    match decision {
                        DebounceDecision::Accepted => "accepted",
                        DebounceDecision::CoolingDown => "cooling_down",
                        DebounceDecision::Unchanged => "unchanged",
                    }
                    .to_string(),
                );
                "debounced"
            }
            Report::ActuationFailed { axis, .. } => {
                meta.failed_axis = Some(axis.to_string());
                "actuation_failed"
            }
            Report::Skipped => "skipped",
            Report::EndOfStream => "end_of_stream",
        }
        .to_string();
        meta
    }
}

/// Broadcast hub between the control loop and the viewers.
#[derive(Clone)]
pub struct FrameBus {
    pub frame_tx: broadcast::Sender<FramePacket>,
    pub delta_tx: broadcast::Sender<FramePacket>,
    pub thresh_tx: broadcast::Sender<FramePacket>,
    pub meta_tx: watch::Sender<TrackingMeta>,
    current: Arc<Mutex<(u64, Option<Region>)>>,
    jpeg_quality: u8,
}

impl FrameBus {
    /// `capacity` is how many packets a viewer may fall behind before it skips ahead.
    pub fn new(capacity: usize) -> Self {
        let (frame_tx, _) = broadcast::channel::<FramePacket>(capacity.max(1));
        let (delta_tx, _) = broadcast::channel::<FramePacket>(capacity.max(1));
        let (thresh_tx, _) = broadcast::channel::<FramePacket>(capacity.max(1));
        let (meta_tx, _) = watch::channel(TrackingMeta::default());
        Self {
            frame_tx,
            delta_tx,
            thresh_tx,
            meta_tx,
            current: Arc::new(Mutex::new((0, None))),
            jpeg_quality: DEFAULT_JPEG_QUALITY,
        }
    }

    pub fn with_jpeg_quality(mut self, quality: u8) -> Self {
        self.jpeg_quality = quality.clamp(1, 100);
        self
    }

    pub fn sender(&self, stream: Stream) -> &broadcast::Sender<FramePacket> {
        match stream {
            Stream::Frame => &self.frame_tx,
            Stream::Delta => &self.delta_tx,
            Stream::Thresh => &self.thresh_tx,
        }
    }

    pub fn subscribe(&self, stream: Stream) -> broadcast::Receiver<FramePacket> {
        self.sender(stream).subscribe()
    }

    pub fn viewers(&self, stream: Stream) -> usize {
        self.sender(stream).receiver_count()
    }

    /// The latest tracking verdict.
    pub fn meta(&self) -> TrackingMeta {
        self.meta_tx.borrow().clone()
    }

    fn current(&self) -> (u64, Option<Region>) {
        self.current.lock().map(|c| *c).unwrap_or((0, None))
    }

    fn publish<P>(&self, stream: Stream, frame_id: u64, image: &ImageBuffer<P, Vec<u8>>)
    where
        P: Pixel<Subpixel = u8> + PixelWithColorType,
    {
        match encode_jpeg(image, self.jpeg_quality) {
            Ok(data) => {
                let packet = FramePacket {
                    frame_id,
                    width: image.width(),
                    height: image.height(),
                    data: data.into(),
                };
                // No viewers left since the check; nothing to do.
                let _ = self.sender(stream).send(packet);
            }
            Err(e) => warn!(?stream, frame_id, error = %e, "could not encode frame"),
        }
    }
}

impl PresentationSink for FrameBus {
    fn on_frame(&self, frame: &RgbImage) {
        if self.viewers(Stream::Frame) == 0 {
            return;
        }
        let (frame_id, region) = self.current();
        match region {
            Some(region) => {
                let annotated = image_helper::annotate_target(frame, &region);
                self.publish(Stream::Frame, frame_id, &annotated);
            }
            None => self.publish(Stream::Frame, frame_id, frame),
        }
    }

    fn on_mask(&self, delta: &GrayImage) {
        if self.viewers(Stream::Delta) > 0 {
            self.publish(Stream::Delta, self.current().0, delta);
        }
    }

    fn on_threshold(&self, threshold: &GrayImage) {
        if self.viewers(Stream::Thresh) > 0 {
            self.publish(Stream::Thresh, self.current().0, threshold);
        }
    }

    fn on_report(&self, frame_id: u64, report: &Report) {
        if let Ok(mut current) = self.current.lock() {
            *current = (frame_id, report.region());
        }
        self.meta_tx
            .send_replace(TrackingMeta::from_report(frame_id, report));
    }
}

/// Encodes an 8-bit image as a baseline JPEG.
pub fn encode_jpeg<P>(image: &ImageBuffer<P, Vec<u8>>, quality: u8) -> ImageResult<Vec<u8>>
where
    P: Pixel<Subpixel = u8> + PixelWithColorType,
{
    let mut out = Cursor::new(Vec::new());
    image.write_with_encoder(JpegEncoder::new_with_quality(&mut out, quality))?;
    Ok(out.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Rgb;
    use turret_vision::{Angle, Axis};

    #[test]
    fn unwatched_streams_are_not_encoded() {
        let bus = FrameBus::new(2);
        let mut delta = bus.subscribe(Stream::Delta);
        bus.on_frame(&RgbImage::new(16, 16));
        bus.on_mask(&GrayImage::new(16, 16));
        assert!(delta.try_recv().is_ok());
        assert_eq!(bus.viewers(Stream::Frame), 0);
    }

    #[test]
    fn frame_stream_outlines_the_reported_target() {
        let bus = FrameBus::new(2).with_jpeg_quality(100);
        let mut rx = bus.subscribe(Stream::Frame);
        let region = Region::new(20, 20, 80, 80);
        bus.on_report(
            7,
            &Report::Target {
                region,
                outcome: TargetOutcome::Actuated {
                    pan: Angle::clamped(90),
                    tilt: Angle::clamped(45),
                },
            },
        );
        bus.on_frame(&RgbImage::from_pixel(100, 100, Rgb([0, 0, 0])));

        let packet = rx.try_recv().unwrap();
        assert_eq!(packet.frame_id, 7);
        assert_eq!((packet.width, packet.height), (100, 100));
        let decoded = image::load_from_memory(&packet.data).unwrap().to_rgb8();
        let edge = decoded.get_pixel(50, 20);
        assert!(edge[1] > 150 && edge[0] < 100, "edge pixel was {edge:?}");
        let inside = decoded.get_pixel(50, 50);
        assert!(inside[1] < 60, "inside pixel was {inside:?}");
    }

    #[test]
    fn meta_follows_the_latest_report() {
        let bus = FrameBus::new(2);
        assert_eq!(bus.meta(), TrackingMeta::default());

        bus.on_report(
            3,
            &Report::Target {
                region: Region::new(1, 2, 3, 4),
                outcome: TargetOutcome::Debounced(DebounceDecision::CoolingDown),
            },
        );
        let meta = bus.meta();
        assert_eq!(meta.frame_id, 3);
        assert_eq!(meta.status, "debounced");
        assert_eq!(meta.debounce.as_deref(), Some("cooling_down"));
        assert_eq!(
            meta.region,
            Some(MetaRegion {
                x0: 1,
                y0: 2,
                x1: 3,
                y1: 4
            })
        );

        bus.on_report(
            4,
            &Report::ActuationFailed {
                region: Region::new(1, 2, 3, 4),
                axis: Axis::Tilt,
            },
        );
        assert_eq!(bus.meta().failed_axis.as_deref(), Some("tilt"));

        bus.on_report(5, &Report::NoTarget);
        assert_eq!(bus.meta().status, "no_target");
        assert!(bus.meta().region.is_none());
    }

    #[test]
    fn grayscale_images_encode() {
        let jpeg = encode_jpeg(&GrayImage::from_pixel(8, 8, image::Luma([200])), 90).unwrap();
        let decoded = image::load_from_memory(&jpeg).unwrap().to_luma8();
        assert_eq!(decoded.dimensions(), (8, 8));
    }
}
