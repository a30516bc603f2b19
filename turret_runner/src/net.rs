// THEORY:
// Pretrained SSD-style detectors (Caffe face models, TensorFlow MobileNet-SSD) all
// take a 300x300 blob and answer with a 1x1xNx7 tensor, one row per detection:
// `[image_id, class_id, confidence, left, top, right, bottom]`, box edges normalized to
// [0, 1]. Only the preprocessing differs by framework, and that is decided from the
// model file's extension. Gating and picking the target is `NetLocalizer`'s job.

use std::path::Path;

use turret_vision::Detection;

/// Side of the square input blob.
pub const INPUT_SIZE: i32 = 300;

const DETECTION_WIDTH: usize = 7;

/// How a frame is turned into the network's input blob.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BlobParams {
    pub scale: f64,
    /// Subtracted per channel, in the network's channel order.
    pub mean: [f64; 3],
    /// Whether the network expects RGB rather than BGR.
    pub expects_rgb: bool,
}

impl BlobParams {
    pub fn for_model(model: &Path) -> Self {
        let caffe = model
            .extension()
            .and_then(|ext| ext.to_str())
            .map(|ext| ext.eq_ignore_ascii_case("caffemodel"))
            .unwrap_or(false);
        if caffe {
            Self {
                scale: 1.0,
                mean: [104.0, 177.0, 123.0],
                expects_rgb: false,
            }
        } else {
            Self {
                scale: 1.0 / 127.5,
                mean: [127.5, 127.5, 127.5],
                expects_rgb: true,
            }
        }
    }
}

/// Splits a flattened 1x1xNx7 output tensor into detections. A trailing partial row
/// is ignored.
pub fn parse_detections(values: &[f32]) -> Vec<Detection> {
    values
        .chunks_exact(DETECTION_WIDTH)
        .map(|row| Detection {
            confidence: row[2],
            left: row[3],
            top: row[4],
            right: row[5],
            bottom: row[6],
        })
        .collect()
}

#[cfg(feature = "opencv")]
pub use backend::OpenCvDetector;

#[cfg(feature = "opencv")]
mod backend {
    use std::path::Path;

    use image::RgbImage;
    use opencv::core::{CV_8UC3, CV_32F, Mat, Scalar, Size};
    use opencv::dnn::{self, Net};
    use opencv::prelude::*;
    use tracing::info;

    use turret_vision::error::FrameProcessingError;
    use turret_vision::{Detection, ObjectDetector};

    use super::{BlobParams, INPUT_SIZE, parse_detections};

    /// An OpenCV DNN network behind [`ObjectDetector`].
    pub struct OpenCvDetector {
        net: Net,
        params: BlobParams,
    }

    impl OpenCvDetector {
        pub fn open(model: &Path, config: Option<&Path>) -> opencv::Result<Self> {
            let config = config.map(|p| p.to_string_lossy().into_owned()).unwrap_or_default();
            let net = dnn::read_net(&model.to_string_lossy(), &config, "")?;
            let params = BlobParams::for_model(model);
            info!(model = %model.display(), ?params, "detector network loaded");
            Ok(Self { net, params })
        }

        fn run(&mut self, frame: &RgbImage) -> opencv::Result<Vec<Detection>> {
            let (width, height) = frame.dimensions();
            let mut rgb = Mat::new_rows_cols_with_default(
                height as i32,
                width as i32,
                CV_8UC3,
                Scalar::all(0.0),
            )?;
            rgb.data_bytes_mut()?.copy_from_slice(frame.as_raw());

            let [m0, m1, m2] = self.params.mean;
            // The frame is RGB already, so a BGR network needs the swap.
            let blob = dnn::blob_from_image(
                &rgb,
                self.params.scale,
                Size::new(INPUT_SIZE, INPUT_SIZE),
                Scalar::new(m0, m1, m2, 0.0),
                !self.params.expects_rgb,
                false,
                CV_32F,
            )?;
            self.net.set_input(&blob, "", 1.0, Scalar::default())?;
            let output = self.net.forward_single("")?;
            Ok(parse_detections(output.data_typed::<f32>()?))
        }
    }

    impl ObjectDetector for OpenCvDetector {
        fn forward(&mut self, frame: &RgbImage) -> Result<Vec<Detection>, FrameProcessingError> {
            self.run(frame)
                .map_err(|e| FrameProcessingError::Backend(e.to_string()))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn caffe_models_use_bgr_mean_subtraction() {
        let params = BlobParams::for_model(Path::new("models/res10_300x300.caffemodel"));
        assert_eq!(params.scale, 1.0);
        assert_eq!(params.mean, [104.0, 177.0, 123.0]);
        assert!(!params.expects_rgb);
    }

    #[test]
    fn other_models_are_scaled_to_unit_range() {
        let params = BlobParams::for_model(Path::new("frozen_inference_graph.pb"));
        assert_eq!(params.scale, 1.0 / 127.5);
        assert_eq!(params.mean, [127.5; 3]);
        assert!(params.expects_rgb);
    }

    #[test]
    fn output_rows_become_detections() {
        let values = [
            0.0, 1.0, 0.9, 0.1, 0.2, 0.3, 0.4, //
            0.0, 1.0, 0.3, 0.5, 0.5, 0.6, 0.6, //
            0.0, 1.0,
        ];
        let detections = parse_detections(&values);
        assert_eq!(detections.len(), 2);
        assert_eq!(
            detections[0],
            Detection {
                confidence: 0.9,
                left: 0.1,
                top: 0.2,
                right: 0.3,
                bottom: 0.4,
            }
        );
        assert_eq!(detections[1].confidence, 0.3);
    }
}
