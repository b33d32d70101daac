// rover-core: Types, config, and errors for the rover MPC simulation.

pub mod config;
pub mod error;
pub mod types;

pub mod prelude {
    pub use crate::config::{
        ConstraintMode, ControllerConfig, EnvironmentConfig, FailurePolicy, ObstacleConfig,
        RoverConfig, SimConfig, SolverKind, StalePolicy,
    };
    pub use crate::error::{ConfigError, OptimizationError, RoverError, SimError, ValidationError};
    pub use crate::types::{INPUT_DIM, Input, PixelRect, STATE_DIM, State};
}
