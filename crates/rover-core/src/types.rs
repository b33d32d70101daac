//! Shared value types: robot state/input aliases and pixel rectangles.

use nalgebra::{Vector2, Vector3};
use serde::{Deserialize, Serialize};

/// Number of robot state dimensions: [x, y, theta].
pub const STATE_DIM: usize = 3;

/// Number of robot input dimensions: [v, omega].
pub const INPUT_DIM: usize = 2;

/// Robot pose (x, y, theta) in pixels and radians.
pub type State = Vector3<f64>;

/// Velocity command (v, omega).
pub type Input = Vector2<f64>;

// ---------------------------------------------------------------------------
// PixelRect
// ---------------------------------------------------------------------------

/// Axis-aligned rectangle on the integer pixel grid (screen coordinates, y down).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PixelRect {
    pub left: i32,
    pub top: i32,
    pub width: i32,
    pub height: i32,
}

impl PixelRect {
    pub const fn new(left: i32, top: i32, width: i32, height: i32) -> Self {
        Self {
            left,
            top,
            width,
            height,
        }
    }

    pub const fn right(&self) -> i32 {
        self.left + self.width
    }

    pub const fn bottom(&self) -> i32 {
        self.top + self.height
    }

    /// Integer center, rounded toward the top-left like the pixel grid does.
    pub const fn center(&self) -> (i32, i32) {
        (self.left + self.width / 2, self.top + self.height / 2)
    }

    /// Center as a floating-point point.
    pub fn center_f64(&self) -> Vector2<f64> {
        let (cx, cy) = self.center();
        Vector2::new(f64::from(cx), f64::from(cy))
    }

    /// Shift the rectangle in place by an integer displacement.
    pub const fn translate(&mut self, dx: i32, dy: i32) {
        self.left += dx;
        self.top += dy;
    }
}
