// THEORY:
// The `BlobDetector` turns a binary motion mask into discrete candidate objects. It is
// the contour step of the motion localizer: every external border traced around an
// island of "changed" pixels becomes one `MaskBlob` with a bounding box and an area.
//
// Key architectural principles & algorithm steps:
// 1.  **Border Following**: `imageproc`'s contour tracer walks the border of every
//     8-connected island of foreground pixels. The mask is padded by one background
//     pixel first, so islands touching the frame edge still get a closed border.
// 2.  **External Only**: Borders nested inside a hole of another island are ignored.
//     A ring and the dot in its middle are one object, not two.
// 3.  **Enclosed Area**: A blob's area is the area of the polygon its border traces
//     through the pixel centres, not its pixel count. A hollow outline of a moving
//     object therefore weighs as much as the filled object.
// 4.  **Stateless Utility**: Like the rest of the spatial layer it has no memory of
//     previous frames. Picking the "best" blob is the caller's decision.

use crate::core_modules::region::Region;

pub mod blob_detector {
    use super::*;
    use image::{GrayImage, Luma};
    use imageproc::contours::{self, BorderType, Contour};
    use imageproc::point::Point;

    /// One external border around an island of foreground pixels in a mask.
    #[derive(Debug, Clone, PartialEq)]
    pub struct MaskBlob {
        /// The bounding rectangle of the border (max coordinates exclusive).
        pub bounding_box: Region,
        /// The area enclosed by the border, in square pixels.
        pub area: f64,
    }

    /// Finds the external border of every 8-connected blob of non-zero pixels in `mask`.
    pub fn find_blobs(mask: &GrayImage) -> Vec<MaskBlob> {
        let (width, height) = mask.dimensions();
        let mut padded = GrayImage::new(width + 2, height + 2);
        for (x, y, pixel) in mask.enumerate_pixels() {
            if pixel[0] != 0 {
                padded.put_pixel(x + 1, y + 1, Luma([255]));
            }
        }

        contours::find_contours::<i32>(&padded)
            .into_iter()
            .filter(|contour| matches!(contour.border_type, BorderType::Outer) && contour.parent.is_none())
            .filter_map(|contour| to_blob(&contour))
            .collect()
    }

    /// Returns the blob with the largest area, but only if that area is strictly
    /// greater than `min_area`.
    pub fn largest_blob(blobs: &[MaskBlob], min_area: f64) -> Option<&MaskBlob> {
        let mut best: Option<&MaskBlob> = None;
        let mut best_area = min_area;
        for blob in blobs {
            if blob.area > best_area {
                best_area = blob.area;
                best = Some(blob);
            }
        }
        best
    }

    /// Area of the closed polygon through `points` (shoelace formula).
    pub fn enclosed_area(points: &[Point<i32>]) -> f64 {
        if points.len() < 3 {
            return 0.0;
        }
        let twice: i64 = points
            .iter()
            .zip(points.iter().cycle().skip(1))
            .map(|(a, b)| a.x as i64 * b.y as i64 - b.x as i64 * a.y as i64)
            .sum();
        twice.unsigned_abs() as f64 / 2.0
    }

    // Undoes the one-pixel padding.
    fn to_blob(contour: &Contour<i32>) -> Option<MaskBlob> {
        let first = contour.points.first()?;
        let (mut min_x, mut min_y, mut max_x, mut max_y) = (first.x, first.y, first.x, first.y);
        for point in &contour.points {
            min_x = min_x.min(point.x);
            min_y = min_y.min(point.y);
            max_x = max_x.max(point.x);
            max_y = max_y.max(point.y);
        }
        let unpad = |v: i32| (v - 1).max(0) as u32;
        Some(MaskBlob {
            bounding_box: Region::new(unpad(min_x), unpad(min_y), unpad(max_x) + 1, unpad(max_y) + 1),
            area: enclosed_area(&contour.points),
        })
    }
}
