use thiserror::Error;

/// Top-level error type for the rover workspace.
#[derive(Debug, Error)]
pub enum RoverError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Optimization error: {0}")]
    Optimization(#[from] OptimizationError),

    #[error("Simulation error: {0}")]
    Simulation(#[from] SimError),

    #[error("Validation error: {0}")]
    Validation(#[from] ValidationError),
}

/// Configuration errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("Invalid dt: {0} (must be > 0)")]
    InvalidDt(f64),

    #[error("Horizon too short: {0} (must be >= 2)")]
    HorizonTooShort(usize),

    #[error("Dimension mismatch for {field}: expected {expected}, got {got}")]
    DimensionMismatch {
        field: String,
        expected: usize,
        got: usize,
    },

    #[error("Weight matrix {0} is not positive semidefinite")]
    NotPositiveSemidefinite(String),

    #[error("Unknown solver: {0}")]
    UnknownSolver(String),

    #[error("Invalid value for {field}: {message}")]
    InvalidValue { field: String, message: String },
}

/// Failure of the nonlinear program behind an MPC solve.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum OptimizationError {
    #[error("Optimization failed after {iterations} iterations: {message}")]
    Failed { message: String, iterations: u32 },

    #[error("State dimension mismatch: expected {expected}, got {got}")]
    StateDimMismatch { expected: usize, got: usize },

    #[error("Initial guess length mismatch: expected {expected}, got {got}")]
    GuessLengthMismatch { expected: usize, got: usize },
}

impl OptimizationError {
    /// Human-readable solver message, if this is a solver failure.
    pub fn message(&self) -> Option<&str> {
        match self {
            Self::Failed { message, .. } => Some(message),
            _ => None,
        }
    }
}

/// Simulation runtime errors.
#[derive(Debug, Error)]
pub enum SimError {
    #[error("Solve worker disconnected")]
    WorkerDisconnected,

    #[error("Failed to spawn solve worker: {0}")]
    WorkerSpawn(#[from] std::io::Error),

    #[error("Obstacle not found: {0}")]
    ObstacleNotFound(String),

    #[error("Robot state diverged: NaN detected in pose")]
    StateDiverged,
}

/// Boundary validation errors.
///
/// Copy + static messages for cheap propagation in the tick loop.
#[derive(Debug, Clone, Copy, PartialEq, Error)]
pub enum ValidationError {
    #[error("Velocity must be an integer pixel displacement, got ({dx}, {dy})")]
    NonIntegerVelocity { dx: f64, dy: f64 },

    #[error("Input contains NaN or Inf")]
    NonFiniteInput,
}
