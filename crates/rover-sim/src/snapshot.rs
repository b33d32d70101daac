//! Read-only view of the world after a tick, for renderers and loggers.

use rover_core::types::PixelRect;
use serde::Serialize;

/// Robot halo state shown by the renderer.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertState {
    #[default]
    Nominal,
    Collision,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ObstacleSnapshot {
    pub name: String,
    pub rect: PixelRect,
    pub velocity: (i32, i32),
    pub moving: bool,
}

/// Post-tick world state.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WorldSnapshot {
    pub tick: u64,
    /// Robot pose `[x, y, theta]`.
    pub pose: [f64; 3],
    /// Command applied this tick `[v, omega]`.
    pub input: [f64; 2],
    pub radius: f64,
    pub alert: AlertState,
    pub obstacles: Vec<ObstacleSnapshot>,
    pub target: PixelRect,
    /// Planar positions of the last successful predicted trajectory.
    pub predicted_path: Vec<[f64; 2]>,
}

impl WorldSnapshot {
    pub fn obstacle(&self, name: &str) -> Option<&ObstacleSnapshot> {
        self.obstacles.iter().find(|o| o.name == name)
    }
}
