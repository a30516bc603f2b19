// THEORY:
// The camera is an external collaborator. Everything the core needs from it is
// captured by the `FrameSource` trait: hand over the next raw RGB buffer, say when the
// stream is over, and let go of the device when asked. Decoding, device enumeration
// and driver quirks stay behind that trait.
//
// A `FrameBuffer` is deliberately raw (a flat `Vec<u8>` plus its claimed dimensions).
// Turning it into a typed image is the first step of localization, and that is where
// a lying buffer is caught and reported as a `FrameProcessingError`.

use std::path::{Path, PathBuf};
use std::time::Instant;

use image::RgbImage;
use tracing::{debug, warn};

use crate::error::{DeviceError, FrameProcessingError};

const SUPPORTED_EXTENSIONS: [&str; 4] = ["png", "jpg", "jpeg", "bmp"];

/// A raw, packed RGB8 frame as delivered by a frame source.
#[derive(Debug, Clone)]
pub struct FrameBuffer {
    pub data: Vec<u8>,
    pub width: u32,
    pub height: u32,
    pub frame_id: u64,
    pub timestamp: Instant,
}

impl FrameBuffer {
    pub fn new(data: Vec<u8>, width: u32, height: u32, frame_id: u64) -> Self {
        Self {
            data,
            width,
            height,
            frame_id,
            timestamp: Instant::now(),
        }
    }

    pub fn from_rgb_image(image: RgbImage, frame_id: u64) -> Self {
        let (width, height) = image.dimensions();
        Self::new(image.into_raw(), width, height, frame_id)
    }

    /// Views the buffer as a typed image, checking that the bytes match the dimensions.
    pub fn to_rgb_image(&self) -> Result<RgbImage, FrameProcessingError> {
        if self.width == 0 || self.height == 0 {
            return Err(FrameProcessingError::EmptyFrame {
                width: self.width,
                height: self.height,
            });
        }
        let expected = self.width as usize * self.height as usize * 3;
        if self.data.len() != expected {
            return Err(FrameProcessingError::Malformed {
                width: self.width,
                height: self.height,
                expected,
                actual: self.data.len(),
            });
        }
        RgbImage::from_raw(self.width, self.height, self.data.clone()).ok_or(
            FrameProcessingError::Malformed {
                width: self.width,
                height: self.height,
                expected,
                actual: self.data.len(),
            },
        )
    }
}

/// A producer of raw frames, typically a camera.
pub trait FrameSource: Send {
    /// Returns the next frame, or `None` once the stream is exhausted.
    fn read(&mut self) -> Result<Option<FrameBuffer>, DeviceError>;

    /// Releases the underlying device. Further reads are not expected.
    fn close(&mut self) -> Result<(), DeviceError>;
}

impl<T: FrameSource + ?Sized> FrameSource for Box<T> {
    fn read(&mut self) -> Result<Option<FrameBuffer>, DeviceError> {
        (**self).read()
    }

    fn close(&mut self) -> Result<(), DeviceError> {
        (**self).close()
    }
}

/// Replays the images of a directory, in file-name order, as a frame source.
pub struct DirectorySource {
    root: PathBuf,
    files: Vec<PathBuf>,
    cursor: usize,
    next_frame_id: u64,
    closed: bool,
}

impl DirectorySource {
    /// Lists the image files under `root`. An unreadable or image-less directory is a
    /// device that cannot be opened.
    pub fn open(root: impl AsRef<Path>) -> Result<Self, DeviceError> {
        let root = root.as_ref().to_path_buf();
        let entries = std::fs::read_dir(&root).map_err(|e| DeviceError::Open {
            device: root.display().to_string(),
            reason: e.to_string(),
        })?;

        let mut files = Vec::new();
        for entry in entries {
            let path = entry?.path();
            let supported = path
                .extension()
                .and_then(|ext| ext.to_str())
                .map(|ext| SUPPORTED_EXTENSIONS.contains(&ext.to_ascii_lowercase().as_str()))
                .unwrap_or(false);
            if supported && path.is_file() {
                files.push(path);
            }
        }
        files.sort();

        if files.is_empty() {
            return Err(DeviceError::Open {
                device: root.display().to_string(),
                reason: "directory contains no supported image files".to_string(),
            });
        }
        debug!(root = %root.display(), frames = files.len(), "opened frame directory");

        Ok(Self {
            root,
            files,
            cursor: 0,
            next_frame_id: 0,
            closed: false,
        })
    }

    pub fn len(&self) -> usize {
        self.files.len()
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }
}

impl FrameSource for DirectorySource {
    fn read(&mut self) -> Result<Option<FrameBuffer>, DeviceError> {
        if self.closed {
            return Err(DeviceError::Read(format!(
                "{} has been closed",
                self.root.display()
            )));
        }
        while let Some(path) = self.files.get(self.cursor) {
            self.cursor += 1;
            match image::open(path) {
                Ok(decoded) => {
                    let frame = FrameBuffer::from_rgb_image(decoded.to_rgb8(), self.next_frame_id);
                    self.next_frame_id += 1;
                    return Ok(Some(frame));
                }
                Err(e) => {
                    // An unreadable file is skipped, the directory itself is still fine.
                    warn!(path = %path.display(), error = %e, "skipping undecodable frame");
                }
            }
        }
        Ok(None)
    }

    fn close(&mut self) -> Result<(), DeviceError> {
        self.closed = true;
        Ok(())
    }
}
