// THEORY:
// The `MotionLocalizer` answers one question per frame: "where is the biggest thing
// that is not part of the background?" It is classic background subtraction.
//
// Algorithm, per frame:
// 1.  **Normalization**: resize to the square working resolution, drop colour, and
//     apply a wide Gaussian blur so single-pixel sensor noise cannot register as motion.
// 2.  **Differencing**: absolute per-pixel difference against the background reference.
// 3.  **Binarization**: pixels that changed by more than the threshold become 255,
//     everything else 0. A 3x3 dilation then stitches fragments of the same object.
// 4.  **Selection**: the external contour of every blob in the mask is traced and the
//     one enclosing the largest area wins, but only if that area is bigger than the
//     configured noise floor.
//
// The background is captured once and owned by the localizer. It only changes through
// an explicit `recalibrate`, never implicitly.

use image::imageops::{self, FilterType};
use image::{GrayImage, Luma, RgbImage};
use tracing::{debug, info};

use crate::config::MotionConfig;
use crate::core_modules::blob_detector::blob_detector;
use crate::core_modules::frame::{FrameBuffer, FrameSource};
use crate::core_modules::localizer::{Localization, Localizer};
use crate::error::{DeviceError, FrameProcessingError, TurretError};

/// Background-subtraction localizer with a fixed reference frame.
pub struct MotionLocalizer {
    config: MotionConfig,
    background: GrayImage,
}

impl MotionLocalizer {
    /// Builds a localizer whose background reference is `reference`.
    pub fn new(reference: &FrameBuffer, config: MotionConfig) -> Result<Self, FrameProcessingError> {
        let (_, background) = normalize(reference, &config)?;
        info!(
            frame_id = reference.frame_id,
            working_size = config.working_size,
            min_area = config.min_area,
            "captured background reference"
        );
        Ok(Self { config, background })
    }

    /// Captures the background reference from the next frame of `source`.
    pub fn from_source<S: FrameSource + ?Sized>(
        source: &mut S,
        config: MotionConfig,
    ) -> Result<Self, TurretError> {
        let reference = source.read()?.ok_or_else(|| {
            DeviceError::Read("source ended before a background frame was captured".to_string())
        })?;
        Ok(Self::new(&reference, config)?)
    }

    /// Replaces the background reference with `reference`.
    pub fn recalibrate(&mut self, reference: &FrameBuffer) -> Result<(), FrameProcessingError> {
        let (_, background) = normalize(reference, &self.config)?;
        self.background = background;
        info!(frame_id = reference.frame_id, "recalibrated background reference");
        Ok(())
    }

    pub fn background(&self) -> &GrayImage {
        &self.background
    }

    pub fn config(&self) -> &MotionConfig {
        &self.config
    }
}

impl Localizer for MotionLocalizer {
    fn locate(&mut self, frame: &FrameBuffer) -> Result<Localization, FrameProcessingError> {
        // --- 1. Normalization ---
        let (working, gray) = normalize(frame, &self.config)?;
        if gray.dimensions() != self.background.dimensions() {
            return Err(FrameProcessingError::SizeMismatch {
                reference: self.background.dimensions(),
                frame: gray.dimensions(),
            });
        }

        // --- 2. Differencing ---
        let delta = absolute_difference(&self.background, &gray);

        // --- 3. Binarization ---
        let mut mask = binary_threshold(&delta, self.config.threshold);
        for _ in 0..self.config.dilate_iterations {
            mask = dilate(&mask);
        }

        // --- 4. Selection ---
        let blobs = blob_detector::find_blobs(&mask);
        let best = blob_detector::largest_blob(&blobs, self.config.min_area);
        debug!(
            frame_id = frame.frame_id,
            blobs = blobs.len(),
            best_area = best.map(|b| b.area),
            "motion mask analysed"
        );

        Ok(Localization {
            region: best.map(|b| b.bounding_box),
            frame: working,
            delta: Some(delta),
            threshold: Some(mask),
        })
    }

    fn working_size(&self) -> u32 {
        self.config.working_size
    }
}

/// Resizes a raw frame to the working resolution and returns it in colour alongside
/// its blurred grayscale version.
pub fn normalize(
    frame: &FrameBuffer,
    config: &MotionConfig,
) -> Result<(RgbImage, GrayImage), FrameProcessingError> {
    let rgb = frame.to_rgb_image()?;
    let size = config.working_size;
    let working = if rgb.dimensions() == (size, size) {
        rgb
    } else {
        imageops::resize(&rgb, size, size, FilterType::Triangle)
    };
    let gray = imageops::grayscale(&working);
    let blurred = imageops::blur(&gray, config.blur_sigma());
    Ok((working, blurred))
}

/// `|a - b|` per pixel. Both images must have the same dimensions.
pub fn absolute_difference(a: &GrayImage, b: &GrayImage) -> GrayImage {
    let (width, height) = a.dimensions();
    let data = a
        .as_raw()
        .iter()
        .zip(b.as_raw())
        .map(|(&p, &q)| p.abs_diff(q))
        .collect();
    GrayImage::from_raw(width, height, data).unwrap_or_else(|| GrayImage::new(width, height))
}

/// Pixels strictly above `threshold` become 255, all others 0.
pub fn binary_threshold(image: &GrayImage, threshold: u8) -> GrayImage {
    GrayImage::from_fn(image.width(), image.height(), |x, y| {
        if image.get_pixel(x, y)[0] > threshold {
            Luma([255])
        } else {
            Luma([0])
        }
    })
}

/// One pass of 3x3 rectangular dilation (max filter), done as two separable passes.
pub fn dilate(mask: &GrayImage) -> GrayImage {
    let (width, height) = mask.dimensions();
    let horizontal = GrayImage::from_fn(width, height, |x, y| {
        let lo = x.saturating_sub(1);
        let hi = (x + 1).min(width - 1);
        let max = (lo..=hi).map(|nx| mask.get_pixel(nx, y)[0]).max().unwrap_or(0);
        Luma([max])
    });
    GrayImage::from_fn(width, height, |x, y| {
        let lo = y.saturating_sub(1);
        let hi = (y + 1).min(height - 1);
        let max = (lo..=hi)
            .map(|ny| horizontal.get_pixel(x, ny)[0])
            .max()
            .unwrap_or(0);
        Luma([max])
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core_modules::region::Region;
    use crate::core_modules::utils::image_helper::image_helper;
    use image::Rgb;

    fn gray_frame(size: u32, level: u8) -> RgbImage {
        RgbImage::from_pixel(size, size, Rgb([level, level, level]))
    }

    fn with_square(mut image: RgbImage, region: Region, level: u8) -> RgbImage {
        for y in region.min_y..region.max_y {
            for x in region.min_x..region.max_x {
                image.put_pixel(x, y, Rgb([level, level, level]));
            }
        }
        image
    }

    fn localizer_over(background: RgbImage) -> MotionLocalizer {
        let reference = FrameBuffer::from_rgb_image(background, 0);
        MotionLocalizer::new(&reference, MotionConfig::default()).unwrap()
    }

    #[test]
    fn threshold_is_strict() {
        let image = GrayImage::from_raw(3, 1, vec![24, 25, 26]).unwrap();
        let mask = binary_threshold(&image, 25);
        assert_eq!(mask.as_raw(), &vec![0, 0, 255]);
    }

    #[test]
    fn dilation_grows_a_pixel_into_a_square() {
        let mut mask = GrayImage::new(5, 5);
        mask.put_pixel(2, 2, Luma([255]));
        let grown = dilate(&mask);
        let lit = grown.pixels().filter(|p| p[0] == 255).count();
        assert_eq!(lit, 9);
        assert_eq!(grown.get_pixel(1, 1)[0], 255);
        assert_eq!(grown.get_pixel(0, 0)[0], 0);
    }

    #[test]
    fn dilation_handles_the_frame_corner() {
        let mut mask = GrayImage::new(3, 3);
        mask.put_pixel(0, 0, Luma([255]));
        let grown = dilate(&mask);
        assert_eq!(grown.pixels().filter(|p| p[0] == 255).count(), 4);
    }

    #[test]
    fn unchanged_frame_has_no_motion() {
        let background = with_square(gray_frame(500, 90), Region::new(10, 10, 60, 90), 200);
        let mut localizer = localizer_over(background.clone());
        let frame = FrameBuffer::from_rgb_image(background, 1);
        let result = localizer.locate(&frame).unwrap();
        assert!(result.region.is_none());
        assert!(result.threshold.unwrap().pixels().all(|p| p[0] == 0));
    }

    #[test]
    fn bright_square_is_located() {
        let mut localizer = localizer_over(gray_frame(500, 128));
        let frame = with_square(gray_frame(500, 128), Region::new(150, 150, 350, 350), 255);
        let result = localizer
            .locate(&FrameBuffer::from_rgb_image(frame, 1))
            .unwrap();

        let region = result.region.expect("square should be detected");
        for (found, expected) in [
            (region.min_x, 150),
            (region.min_y, 150),
            (region.max_x, 350),
            (region.max_y, 350),
        ] {
            assert!(
                (found as i64 - expected).abs() <= 8,
                "{region:?} is not close to the square"
            );
        }
        assert_eq!(region.center().x, 250);
        assert_eq!(region.center().y, 250);
    }

    #[test]
    fn thin_outline_is_weighed_by_what_it_encloses() {
        let mut localizer = localizer_over(gray_frame(500, 128));
        let mut frame = gray_frame(500, 128);
        image_helper::draw_region_outline(
            &mut frame,
            &Region::new(175, 175, 325, 325),
            Rgb([255, 255, 255]),
            3,
        );
        let result = localizer
            .locate(&FrameBuffer::from_rgb_image(frame, 1))
            .unwrap();

        let lit = result.threshold.unwrap().pixels().filter(|p| p[0] == 255).count();
        assert!(lit < 7000, "{lit} pixels lit, the outline should stay thin");
        let region = result.region.expect("outline should be detected");
        assert!((region.center().x as i64 - 250).abs() <= 1);
        assert!((region.center().y as i64 - 250).abs() <= 1);
        assert!(region.width() >= 150);
    }

    #[test]
    fn small_motion_stays_below_the_noise_floor() {
        let mut localizer = localizer_over(gray_frame(500, 128));
        // 50x50 = 2500 px, well under the 7000 px default.
        let frame = with_square(gray_frame(500, 128), Region::new(100, 100, 150, 150), 255);
        let result = localizer
            .locate(&FrameBuffer::from_rgb_image(frame, 1))
            .unwrap();
        assert!(result.region.is_none());
        assert!(result.threshold.unwrap().pixels().any(|p| p[0] == 255));
    }

    #[test]
    fn larger_of_two_objects_wins() {
        let mut localizer = localizer_over(gray_frame(500, 100));
        let frame = with_square(gray_frame(500, 100), Region::new(20, 20, 120, 120), 250);
        let frame = with_square(frame, Region::new(250, 250, 450, 450), 250);
        let region = localizer
            .locate(&FrameBuffer::from_rgb_image(frame, 1))
            .unwrap()
            .region
            .unwrap();
        assert!(region.min_x > 200 && region.min_y > 200);
    }

    #[test]
    fn frames_are_resized_to_the_working_resolution() {
        let mut localizer = localizer_over(gray_frame(250, 128));
        let frame = with_square(gray_frame(250, 128), Region::new(75, 75, 175, 175), 255);
        let result = localizer
            .locate(&FrameBuffer::from_rgb_image(frame, 1))
            .unwrap();
        assert_eq!(result.frame.dimensions(), (500, 500));
        let center = result.region.unwrap().center();
        assert!((center.x as i64 - 250).abs() <= 2);
        assert!((center.y as i64 - 250).abs() <= 2);
    }

    #[test]
    fn malformed_frame_is_reported() {
        let mut localizer = localizer_over(gray_frame(500, 128));
        let frame = FrameBuffer::new(vec![0; 12], 500, 500, 1);
        assert!(matches!(
            localizer.locate(&frame),
            Err(FrameProcessingError::Malformed { .. })
        ));
    }

    #[test]
    fn recalibration_absorbs_a_static_change() {
        let mut localizer = localizer_over(gray_frame(500, 128));
        let changed = with_square(gray_frame(500, 128), Region::new(150, 150, 350, 350), 255);
        let changed = FrameBuffer::from_rgb_image(changed, 1);
        assert!(localizer.locate(&changed).unwrap().region.is_some());

        localizer.recalibrate(&changed).unwrap();
        assert!(localizer.locate(&changed).unwrap().region.is_none());
    }
}
