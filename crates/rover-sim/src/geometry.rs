//! Segment clipping against axis-aligned rectangles.

use nalgebra::Vector2;
use rover_core::types::PixelRect;

/// Clip the segment `start -> end` against the pixels covered by `rect`.
///
/// The far edges are the last covered column and row, `right() - 1` and
/// `bottom() - 1`, matching how a half-open screen rectangle is drawn.
///
/// Returns the portion of the segment inside the rectangle as
/// `(entry, exit)`, or `None` when the segment misses it. A start point
/// inside the rectangle is its own entry point.
pub fn clip_segment(
    rect: &PixelRect,
    start: &Vector2<f64>,
    end: &Vector2<f64>,
) -> Option<(Vector2<f64>, Vector2<f64>)> {
    let d = end - start;
    let bounds = [
        (-d.x, start.x - f64::from(rect.left)),
        (d.x, f64::from(rect.right() - 1) - start.x),
        (-d.y, start.y - f64::from(rect.top)),
        (d.y, f64::from(rect.bottom() - 1) - start.y),
    ];

    // Liang-Barsky: shrink [t0, t1] against each boundary.
    let (mut t0, mut t1) = (0.0f64, 1.0f64);
    for (p, q) in bounds {
        if p == 0.0 {
            if q < 0.0 {
                return None;
            }
            continue;
        }
        let t = q / p;
        if p < 0.0 {
            if t > t1 {
                return None;
            }
            t0 = t0.max(t);
        } else {
            if t < t0 {
                return None;
            }
            t1 = t1.min(t);
        }
    }
    Some((start + d * t0, start + d * t1))
}

/// Entry point of the segment into the rectangle, if any.
pub fn first_clip_point(rect: &PixelRect, start: &Vector2<f64>, end: &Vector2<f64>) -> Option<Vector2<f64>> {
    clip_segment(rect, start, end).map(|(entry, _)| entry)
}
