pub mod image_helper {
    use image::{Rgb, RgbImage};
    use imageproc::drawing::{Canvas, draw_hollow_rect_mut};
    use imageproc::rect::Rect;

    use crate::core_modules::region::Region;

    /// The colour used to outline a detected target.
    pub const TARGET_COLOR: Rgb<u8> = Rgb([0, 255, 0]);

    /// Draws the outline of `region` onto `canvas`, `thickness` pixels wide and growing
    /// inwards. Parts of the region outside the canvas are ignored.
    pub fn draw_region_outline<C: Canvas>(
        canvas: &mut C,
        region: &Region,
        color: C::Pixel,
        thickness: u32,
    ) {
        let (width, height) = canvas.dimensions();
        let region = region.clamp_to(width, height);

        for inset in 0..thickness {
            let (w, h) = (
                region.width().saturating_sub(2 * inset),
                region.height().saturating_sub(2 * inset),
            );
            if w == 0 || h == 0 {
                break;
            }
            let rect = Rect::at((region.min_x + inset) as i32, (region.min_y + inset) as i32)
                .of_size(w, h);
            draw_hollow_rect_mut(canvas, rect, color);
        }
    }

    /// Returns a copy of `image` with the target outlined in [`TARGET_COLOR`].
    pub fn annotate_target(image: &RgbImage, region: &Region) -> RgbImage {
        let mut annotated = image.clone();
        draw_region_outline(&mut annotated, region, TARGET_COLOR, 2);
        annotated
    }
}

#[cfg(test)]
mod tests {
    use super::image_helper::*;
    use crate::core_modules::region::Region;
    use image::{Rgb, RgbImage};

    #[test]
    fn outline_leaves_interior_untouched() {
        let image = RgbImage::new(20, 20);
        let annotated = annotate_target(&image, &Region::new(5, 5, 15, 15));

        assert_eq!(*annotated.get_pixel(5, 5), TARGET_COLOR);
        assert_eq!(*annotated.get_pixel(6, 10), TARGET_COLOR);
        assert_eq!(*annotated.get_pixel(14, 14), TARGET_COLOR);
        assert_eq!(*annotated.get_pixel(10, 10), Rgb([0, 0, 0]));
        assert_eq!(*annotated.get_pixel(4, 4), Rgb([0, 0, 0]));
    }

    #[test]
    fn outline_is_clipped_to_the_image() {
        let mut image = RgbImage::new(10, 10);
        draw_region_outline(&mut image, &Region::new(5, 5, 40, 40), Rgb([1, 2, 3]), 1);
        assert_eq!(*image.get_pixel(9, 9), Rgb([1, 2, 3]));
        assert_eq!(*image.get_pixel(5, 7), Rgb([1, 2, 3]));
        assert_eq!(*image.get_pixel(7, 7), Rgb([0, 0, 0]));
    }

    #[test]
    fn empty_region_draws_nothing() {
        let mut image = RgbImage::new(10, 10);
        draw_region_outline(&mut image, &Region::new(4, 2, 4, 8), TARGET_COLOR, 2);
        draw_region_outline(&mut image, &Region::new(12, 12, 20, 20), TARGET_COLOR, 2);
        assert!(image.pixels().all(|p| *p == Rgb([0, 0, 0])));
    }
}
