//! Small configuration fixtures.

use rover_core::config::{ControllerConfig, EnvironmentConfig, ObstacleConfig, RoverConfig, SimConfig};
use rover_core::types::PixelRect;

/// Short-horizon controller settings that keep solver-backed tests fast.
pub fn fast_controller_config() -> ControllerConfig {
    ControllerConfig {
        horizon: 5,
        ..ControllerConfig::default()
    }
}

/// Open arena without border walls: the robot starts at `pose`, one moving
/// obstacle sits at `obstacle` with velocity `(dx, dy)`.
pub fn arena_config(pose: [f64; 3], obstacle: PixelRect, dx: i32, dy: i32) -> RoverConfig {
    RoverConfig {
        sim: SimConfig {
            initial_pose: pose,
            ..SimConfig::default()
        },
        environment: EnvironmentConfig {
            border_thickness: 0,
            obstacles: vec![ObstacleConfig {
                name: Some("mover".into()),
                left: obstacle.left,
                top: obstacle.top,
                width: obstacle.width,
                height: obstacle.height,
                dx,
                dy,
            }],
            ..EnvironmentConfig::default()
        },
        controller: fast_controller_config(),
    }
}
