use opencv::core::Mat;
use opencv::imgproc;
use opencv::prelude::*;
use opencv::videoio::{self, VideoCapture};
use tracing::info;

use turret_vision::error::DeviceError;
use turret_vision::{FrameBuffer, FrameSource};

/// A V4L/OpenCV camera delivering RGB frames.
pub struct CameraSource {
    device: i32,
    capture: VideoCapture,
    next_frame_id: u64,
}

impl CameraSource {
    pub fn open(device: i32) -> Result<Self, DeviceError> {
        let open_err = |reason: String| DeviceError::Open {
            device: device.to_string(),
            reason,
        };
        let capture =
            VideoCapture::new(device, videoio::CAP_ANY).map_err(|e| open_err(e.to_string()))?;
        if !capture.is_opened().map_err(|e| open_err(e.to_string()))? {
            return Err(open_err("device did not open".to_string()));
        }
        info!(device, "camera opened");
        Ok(Self {
            device,
            capture,
            next_frame_id: 0,
        })
    }
}

impl FrameSource for CameraSource {
    fn read(&mut self) -> Result<Option<FrameBuffer>, DeviceError> {
        let read_err = |e: opencv::Error| DeviceError::Read(e.to_string());

        // --- 1. Grab ---
        let mut bgr = Mat::default();
        let grabbed = self.capture.read(&mut bgr).map_err(read_err)?;
        if !grabbed || bgr.empty() {
            info!(device = self.device, "camera stopped delivering frames");
            return Ok(None);
        }

        // --- 2. BGR -> packed RGB ---
        let mut rgb = Mat::default();
        imgproc::cvt_color(&bgr, &mut rgb, imgproc::COLOR_BGR2RGB, 0).map_err(read_err)?;
        let data = rgb.data_bytes().map_err(read_err)?.to_vec();

        let frame = FrameBuffer::new(
            data,
            rgb.cols().max(0) as u32,
            rgb.rows().max(0) as u32,
            self.next_frame_id,
        );
        self.next_frame_id += 1;
        Ok(Some(frame))
    }

    fn close(&mut self) -> Result<(), DeviceError> {
        self.capture
            .release()
            .map_err(|e| DeviceError::Close(e.to_string()))
    }
}
