//! Reactive collision gate and boundary bounce.
//!
//! The gate runs before the optimizer every tick. A line of sight is cast from
//! the robot to each obstacle center and clipped against the obstacle
//! rectangle; when the clip point lies inside the robot halo the tick is a
//! collision and the optimizer is skipped.

use nalgebra::Vector2;
use rover_core::config::SimConfig;
use tracing::{debug, warn};

use crate::environment::Obstacle;
use crate::geometry::first_clip_point;

/// Result of a collision check.
#[derive(Debug, Clone, PartialEq)]
pub enum GateOutcome {
    Clear,
    /// `distance` is from the robot to the line-of-sight clip point.
    Collision { obstacle: String, distance: f64 },
}

impl GateOutcome {
    pub const fn is_collision(&self) -> bool {
        matches!(self, Self::Collision { .. })
    }
}

/// Collision predicate and bounce rules for one screen.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CollisionGate {
    collision_distance: f64,
    bounce_margin: i32,
    bounce_inset: i32,
    width: i32,
    height: i32,
}

impl CollisionGate {
    pub fn from_config(config: &SimConfig) -> Self {
        Self {
            collision_distance: config.collision_distance(),
            bounce_margin: config.bounce_margin,
            bounce_inset: config.bounce_inset,
            width: config.screen_width,
            height: config.screen_height,
        }
    }

    pub const fn collision_distance(&self) -> f64 {
        self.collision_distance
    }

    /// Check every obstacle in order. The first hit has its velocity zeroed
    /// and ends the check.
    pub fn check(&self, position: &Vector2<f64>, obstacles: &mut [Obstacle]) -> GateOutcome {
        for obstacle in obstacles.iter_mut() {
            let center = obstacle.center_f64();
            let Some(clip) = first_clip_point(obstacle.rect(), position, &center) else {
                continue;
            };
            let distance = (clip - position).norm();
            if distance < self.collision_distance {
                obstacle.stop();
                warn!(obstacle = obstacle.name(), distance, "collision");
                return GateOutcome::Collision {
                    obstacle: obstacle.name().to_string(),
                    distance,
                };
            }
        }
        GateOutcome::Clear
    }

    /// Reflect the velocity of moving obstacles that crossed a screen margin.
    ///
    /// Axes are independent: an x-edge trigger flips only `dx`, a y-edge
    /// trigger only `dy`.
    pub fn bounce(&self, obstacles: &mut [Obstacle]) {
        for obstacle in obstacles.iter_mut().filter(|o| o.is_moving()) {
            let rect = *obstacle.rect();
            let (mut dx, mut dy) = obstacle.velocity();
            let flip_x =
                rect.left < self.bounce_margin || rect.left > self.width - rect.width - self.bounce_inset;
            let flip_y =
                rect.top < self.bounce_margin || rect.top > self.height - rect.height - self.bounce_inset;
            if flip_x {
                dx = -dx;
            }
            if flip_y {
                dy = -dy;
            }
            if flip_x || flip_y {
                debug!(obstacle = obstacle.name(), dx, dy, "bounce");
                obstacle.set_pixel_velocity(dx, dy);
            }
        }
    }
}
