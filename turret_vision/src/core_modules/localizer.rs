use image::{GrayImage, RgbImage};

use crate::core_modules::frame::FrameBuffer;
use crate::core_modules::region::Region;
use crate::error::FrameProcessingError;

/// Everything a localizer learned about one frame.
#[derive(Debug, Clone)]
pub struct Localization {
    /// The best candidate target, if any cleared the detector's bar.
    pub region: Option<Region>,
    /// The frame at working resolution, in colour. Region coordinates refer to it.
    pub frame: RgbImage,
    /// The absolute difference against the background, when the backend produces one.
    pub delta: Option<GrayImage>,
    /// The binary mask the region was extracted from, when the backend produces one.
    pub threshold: Option<GrayImage>,
}

/// Finds the single best target in a frame.
///
/// Implementations own whatever state they need (a background model, a network) and
/// report regions in working-frame coordinates of side [`Localizer::working_size`].
pub trait Localizer: Send {
    fn locate(&mut self, frame: &FrameBuffer) -> Result<Localization, FrameProcessingError>;

    /// Side length of the square working frame regions are expressed in.
    fn working_size(&self) -> u32;
}

impl<T: Localizer + ?Sized> Localizer for Box<T> {
    fn locate(&mut self, frame: &FrameBuffer) -> Result<Localization, FrameProcessingError> {
        (**self).locate(frame)
    }

    fn working_size(&self) -> u32 {
        (**self).working_size()
    }
}
