//! Obstacles, border walls and the target region.

use nalgebra::Vector2;
use rover_core::config::{EnvironmentConfig, SimConfig};
use rover_core::error::{RoverError, SimError, ValidationError};
use rover_core::types::{PixelRect, State};

// ---------------------------------------------------------------------------
// Obstacle
// ---------------------------------------------------------------------------

/// A rectangular obstacle with an integer per-tick velocity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Obstacle {
    name: String,
    rect: PixelRect,
    dx: i32,
    dy: i32,
    moving: bool,
}

impl Obstacle {
    /// Moving obstacle. The moving flag is fixed here and survives a later stop.
    pub fn new(name: impl Into<String>, rect: PixelRect, dx: i32, dy: i32) -> Self {
        Self {
            name: name.into(),
            rect,
            dx,
            dy,
            moving: dx != 0 || dy != 0,
        }
    }

    /// Obstacle that never moves (border walls).
    pub fn fixed(name: impl Into<String>, rect: PixelRect) -> Self {
        Self::new(name, rect, 0, 0)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub const fn rect(&self) -> &PixelRect {
        &self.rect
    }

    pub const fn velocity(&self) -> (i32, i32) {
        (self.dx, self.dy)
    }

    pub const fn is_moving(&self) -> bool {
        self.moving
    }

    /// Integer rectangle center.
    pub const fn center(&self) -> (i32, i32) {
        self.rect.center()
    }

    pub fn center_f64(&self) -> Vector2<f64> {
        self.rect.center_f64()
    }

    /// Set the per-tick displacement. Rejects non-integer or non-finite values
    /// without touching the current velocity.
    pub fn set_velocity(&mut self, dx: f64, dy: f64) -> Result<(), ValidationError> {
        let (ix, iy) = pixel_displacement(dx)
            .zip(pixel_displacement(dy))
            .ok_or(ValidationError::NonIntegerVelocity { dx, dy })?;
        self.set_pixel_velocity(ix, iy);
        Ok(())
    }

    pub const fn set_pixel_velocity(&mut self, dx: i32, dy: i32) {
        self.dx = dx;
        self.dy = dy;
    }

    pub const fn stop(&mut self) {
        self.set_pixel_velocity(0, 0);
    }

    /// Move by one tick of velocity.
    pub const fn advance(&mut self) {
        self.rect.translate(self.dx, self.dy);
    }
}

/// Exact integer value of `v`, if it has one in `i32` range.
#[allow(clippy::cast_possible_truncation)]
fn pixel_displacement(v: f64) -> Option<i32> {
    let in_range = v >= f64::from(i32::MIN) && v <= f64::from(i32::MAX);
    (v.is_finite() && v.fract() == 0.0 && in_range).then_some(v as i32)
}

// ---------------------------------------------------------------------------
// Environment
// ---------------------------------------------------------------------------

/// The map: border walls, configured obstacles and the target.
#[derive(Debug, Clone)]
pub struct Environment {
    width: i32,
    height: i32,
    obstacles: Vec<Obstacle>,
    target: PixelRect,
    tracked: Option<usize>,
}

impl Environment {
    /// Build from configuration. Border walls come first and are named
    /// `obs_0..obs_3`; unnamed obstacles continue the numbering.
    pub fn from_config(sim: &SimConfig, env: &EnvironmentConfig) -> Result<Self, SimError> {
        let (w, h, t) = (sim.screen_width, sim.screen_height, env.border_thickness);
        let mut obstacles = Vec::with_capacity(env.obstacles.len() + 4);
        if t > 0 {
            for rect in [
                PixelRect::new(0, 0, w, t),
                PixelRect::new(0, h - t, w, t),
                PixelRect::new(w - t, 0, t, h),
                PixelRect::new(0, 0, t, h),
            ] {
                let name = format!("obs_{}", obstacles.len());
                obstacles.push(Obstacle::fixed(name, rect));
            }
        }
        for cfg in &env.obstacles {
            let name = cfg
                .name
                .clone()
                .unwrap_or_else(|| format!("obs_{}", obstacles.len()));
            obstacles.push(Obstacle::new(name, cfg.rect(), cfg.dx, cfg.dy));
        }

        let tracked = match &sim.tracked_obstacle {
            Some(name) => Some(
                obstacles
                    .iter()
                    .position(|o| o.name == *name)
                    .ok_or_else(|| SimError::ObstacleNotFound(name.clone()))?,
            ),
            None => obstacles.iter().position(Obstacle::is_moving),
        };

        Ok(Self {
            width: w,
            height: h,
            obstacles,
            target: env.target,
            tracked,
        })
    }

    pub const fn width(&self) -> i32 {
        self.width
    }

    pub const fn height(&self) -> i32 {
        self.height
    }

    pub fn obstacles(&self) -> &[Obstacle] {
        &self.obstacles
    }

    pub fn obstacles_mut(&mut self) -> &mut [Obstacle] {
        &mut self.obstacles
    }

    pub fn obstacle(&self, name: &str) -> Option<&Obstacle> {
        self.obstacles.iter().find(|o| o.name == name)
    }

    pub fn obstacle_mut(&mut self, name: &str) -> Option<&mut Obstacle> {
        self.obstacles.iter_mut().find(|o| o.name == name)
    }

    /// Set an obstacle's velocity by name.
    pub fn set_velocity(&mut self, name: &str, dx: f64, dy: f64) -> Result<(), RoverError> {
        let obstacle = self
            .obstacle_mut(name)
            .ok_or_else(|| SimError::ObstacleNotFound(name.to_string()))?;
        obstacle.set_velocity(dx, dy)?;
        Ok(())
    }

    /// Obstacle the optimizer avoids.
    pub fn tracked(&self) -> Option<&Obstacle> {
        self.tracked.and_then(|i| self.obstacles.get(i))
    }

    pub const fn target(&self) -> &PixelRect {
        &self.target
    }

    /// Reference pose: target center with zero heading.
    pub fn reference(&self) -> State {
        let c = self.target.center_f64();
        State::new(c.x, c.y, 0.0)
    }

    /// Move every moving obstacle by its velocity unless `paused`.
    pub fn advance(&mut self, paused: bool) {
        if paused {
            return;
        }
        for obstacle in self.obstacles.iter_mut().filter(|o| o.moving) {
            obstacle.advance();
        }
    }
}
