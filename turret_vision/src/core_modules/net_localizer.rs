// THEORY:
// The `NetLocalizer` swaps background subtraction for a pretrained object detector.
// The network itself is a black box behind `ObjectDetector`: it receives the working
// frame and returns scored boxes in normalized [0, 1] coordinates. Everything after
// that (confidence gating, scaling to pixels, picking one target) is ours, so the
// debounce/mapping/actuation half of the turret cannot tell which backend found the
// target.

use image::imageops::{self, FilterType};
use tracing::debug;

use crate::core_modules::frame::FrameBuffer;
use crate::core_modules::localizer::{Localization, Localizer};
use crate::core_modules::region::Region;
use crate::error::FrameProcessingError;

/// Detections at or below this confidence are discarded.
pub const CONFIDENCE_THRESHOLD: f32 = 0.5;

/// One raw network detection. Box edges are fractions of the frame size.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Detection {
    pub confidence: f32,
    pub left: f32,
    pub top: f32,
    pub right: f32,
    pub bottom: f32,
}

impl Detection {
    /// Scales the normalized box to a `size x size` frame, clipping to its edges.
    pub fn to_region(&self, size: u32) -> Region {
        let scale = |v: f32| (v.clamp(0.0, 1.0) * size as f32).round() as u32;
        Region::new(
            scale(self.left),
            scale(self.top),
            scale(self.right),
            scale(self.bottom),
        )
    }
}

/// A pretrained object-detection network.
pub trait ObjectDetector: Send {
    fn forward(&mut self, frame: &image::RgbImage) -> Result<Vec<Detection>, FrameProcessingError>;
}

/// Localizer backed by an [`ObjectDetector`].
pub struct NetLocalizer<D: ObjectDetector> {
    detector: D,
    working_size: u32,
    confidence_threshold: f32,
}

impl<D: ObjectDetector> NetLocalizer<D> {
    pub fn new(detector: D, working_size: u32) -> Self {
        Self {
            detector,
            working_size,
            confidence_threshold: CONFIDENCE_THRESHOLD,
        }
    }

    pub fn detector(&self) -> &D {
        &self.detector
    }
}

impl<D: ObjectDetector> Localizer for NetLocalizer<D> {
    fn locate(&mut self, frame: &FrameBuffer) -> Result<Localization, FrameProcessingError> {
        let rgb = frame.to_rgb_image()?;
        let size = self.working_size;
        let working = if rgb.dimensions() == (size, size) {
            rgb
        } else {
            imageops::resize(&rgb, size, size, FilterType::Triangle)
        };

        let detections = self.detector.forward(&working)?;
        let region = best_detection(&detections, self.confidence_threshold)
            .map(|d| d.to_region(size));
        debug!(
            frame_id = frame.frame_id,
            detections = detections.len(),
            found = region.is_some(),
            "network forward pass complete"
        );

        Ok(Localization {
            region,
            frame: working,
            delta: None,
            threshold: None,
        })
    }

    fn working_size(&self) -> u32 {
        self.working_size
    }
}

/// The most confident detection above `threshold`; a larger box breaks ties.
pub fn best_detection(detections: &[Detection], threshold: f32) -> Option<&Detection> {
    detections
        .iter()
        .filter(|d| d.confidence > threshold)
        .max_by(|a, b| {
            a.confidence
                .total_cmp(&b.confidence)
                .then_with(|| a.to_region(1000).area().cmp(&b.to_region(1000).area()))
        })
}
