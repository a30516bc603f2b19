// THEORY:
// A `Region` is the single thing the detection half of the turret hands to the
// actuation half: an axis-aligned box in working-frame pixels. It is a "dumb" data
// container like the blobs it is derived from. The box follows bounding-rectangle
// conventions, so `max_x`/`max_y` sit one past the last covered pixel and a box from
// (150,150) to (350,350) covers exactly 200x200 pixels.

/// A 2D pixel coordinate in the working frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Point {
    pub x: u32,
    pub y: u32,
}

/// An axis-aligned bounding box in working-frame pixel coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Region {
    pub min_x: u32,
    pub min_y: u32,
    pub max_x: u32,
    pub max_y: u32,
}

impl Region {
    /// Builds a region from two opposite corners, in any order.
    pub fn new(x0: u32, y0: u32, x1: u32, y1: u32) -> Self {
        Self {
            min_x: x0.min(x1),
            min_y: y0.min(y1),
            max_x: x0.max(x1),
            max_y: y0.max(y1),
        }
    }

    /// Zero for a box whose corners were written out of order.
    pub fn width(&self) -> u32 {
        self.max_x.saturating_sub(self.min_x)
    }

    pub fn height(&self) -> u32 {
        self.max_y.saturating_sub(self.min_y)
    }

    pub fn area(&self) -> u64 {
        self.width() as u64 * self.height() as u64
    }

    /// The integer midpoint of the box. This is what the turret aims at.
    pub fn center(&self) -> Point {
        Point {
            x: (self.min_x + self.max_x) / 2,
            y: (self.min_y + self.max_y) / 2,
        }
    }

    /// Clips the region to a `width x height` frame.
    pub fn clamp_to(&self, width: u32, height: u32) -> Self {
        Self::new(
            self.min_x.min(width),
            self.min_y.min(height),
            self.max_x.min(width),
            self.max_y.min(height),
        )
    }
}
